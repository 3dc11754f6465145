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

//! Text codec for [`SignalFrame`].

use crate::frames::SignalFrame;

#[derive(Debug, thiserror::Error)]
pub enum FrameCodecError {
    #[error("failed to encode signal frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode signal frame: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode_frame(frame: &SignalFrame) -> Result<String, FrameCodecError> {
    serde_json::to_string(frame).map_err(FrameCodecError::Encode)
}

pub fn decode_frame(text: &str) -> Result<SignalFrame, FrameCodecError> {
    serde_json::from_str(text).map_err(FrameCodecError::Decode)
}
