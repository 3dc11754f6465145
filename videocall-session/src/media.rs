/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Local media as seen by the orchestrator.
//!
//! Capture itself lives outside this crate. A [`MediaStreamBroker`] hands
//! out streams and takes them back; the session only moves tracks onto
//! transceivers.

use crate::errors::MediaError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

impl MediaStreamTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaStreamTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaStreamTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn first_track(&self, kind: MediaKind) -> Option<&MediaStreamTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Source of local capture streams.
#[async_trait]
pub trait MediaStreamBroker: Send + Sync {
    async fn acquire_audio_input_stream(&self) -> Result<MediaStream, MediaError>;
    async fn acquire_video_input_stream(&self) -> Result<MediaStream, MediaError>;
    async fn release_media_stream(&self, stream: &MediaStream);
}

/// A broker with no devices. Sessions using it run receive-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMediaStreamBroker;

#[async_trait]
impl MediaStreamBroker for NoOpMediaStreamBroker {
    async fn acquire_audio_input_stream(&self) -> Result<MediaStream, MediaError> {
        Err(MediaError::Acquire {
            kind: "audio",
            reason: "no audio device".into(),
        })
    }

    async fn acquire_video_input_stream(&self) -> Result<MediaStream, MediaError> {
        Err(MediaError::Acquire {
            kind: "video",
            reason: "no video device".into(),
        })
    }

    async fn release_media_stream(&self, _stream: &MediaStream) {}
}
