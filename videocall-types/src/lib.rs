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

//! Signaling frame types for videocall.rs sessions.
//!
//! The session orchestrator treats the control plane as an opaque stream of
//! named frames. This crate owns their shape and a JSON text codec so the
//! transport and the orchestrator agree on it without depending on each
//! other.

pub mod codec;
pub mod frames;

pub use codec::{decode_frame, encode_frame, FrameCodecError};
pub use frames::*;

/// Version of the frame layout announced in JOIN.
pub const SIGNALING_PROTOCOL_VERSION: u32 = 2;
