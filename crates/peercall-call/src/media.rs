//! Local media acquisition.
//!
//! Acquiring devices can take a while (permission prompts, device warm-up),
//! so the controller runs it off the dispatch loop and feeds the result back
//! in as a [`MediaReady`] completion tagged with the call attempt.

use std::future::Future;

use peercall_common::{CallError, CallResult};

use crate::engine::{LocalTrack, MediaKind};

/// Source of outbound media tracks.
pub trait MediaSource: Clone + Send + Sync + 'static {
    fn acquire(&self) -> impl Future<Output = CallResult<Vec<LocalTrack>>> + Send;
}

/// Result of a media acquisition started for a call attempt.
#[derive(Debug)]
pub struct MediaReady {
    pub attempt: u64,
    pub result: CallResult<Vec<LocalTrack>>,
}

/// Media declared by configuration rather than captured from devices.
///
/// The sections are negotiated send-receive; whatever feeds them lives
/// outside the call core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclaredMedia {
    pub audio: bool,
    pub video: bool,
}

impl DeclaredMedia {
    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }
}

impl MediaSource for DeclaredMedia {
    async fn acquire(&self) -> CallResult<Vec<LocalTrack>> {
        let mut tracks = Vec::new();
        if self.audio {
            tracks.push(LocalTrack { id: "audio0".into(), kind: MediaKind::Audio });
        }
        if self.video {
            tracks.push(LocalTrack { id: "video0".into(), kind: MediaKind::Video });
        }
        if tracks.is_empty() {
            return Err(CallError::media("neither audio nor video is enabled"));
        }
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn declared_media_lists_enabled_kinds() {
        let tracks = DeclaredMedia::new(true, true).acquire().await.unwrap();
        let kinds: Vec<_> = tracks.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
    }

    #[tokio::test]
    async fn no_media_is_an_access_error() {
        let err = DeclaredMedia::new(false, false).acquire().await.unwrap_err();
        assert_eq!(err.error_code(), "MEDIA_ACCESS");
    }
}
