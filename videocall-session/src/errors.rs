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

//! Error types for the session orchestrator.

use crate::status::MeetingSessionStatusCode;
use thiserror::Error;
use videocall_types::FrameCodecError;

fn status_suffix(status: &Option<MeetingSessionStatusCode>) -> String {
    match status {
        Some(code) => format!(" due to the meeting status code: {}", code.as_u32()),
        None => String::new(),
    }
}

/// Failure of a [`Task`](crate::task::Task).
///
/// `Clone` so a memoized result from a once-task can be handed to every
/// caller that awaits it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{task} failed: {message}{}", status_suffix(.status))]
    Failed {
        task: String,
        message: String,
        status: Option<MeetingSessionStatusCode>,
    },
    #[error("{task} timed out after {after_ms}ms")]
    Timeout { task: String, after_ms: u64 },
    #[error("{task} was canceled")]
    Canceled { task: String },
}

impl TaskError {
    pub fn failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            task: task.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        task: impl Into<String>,
        status: MeetingSessionStatusCode,
        message: impl Into<String>,
    ) -> Self {
        TaskError::Failed {
            task: task.into(),
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn canceled(task: impl Into<String>) -> Self {
        TaskError::Canceled { task: task.into() }
    }

    /// The status code carried by this error, if any.
    pub fn status_code(&self) -> Option<MeetingSessionStatusCode> {
        match self {
            TaskError::Failed { status, .. } => *status,
            _ => None,
        }
    }

    pub fn task_name(&self) -> &str {
        match self {
            TaskError::Failed { task, .. }
            | TaskError::Timeout { task, .. }
            | TaskError::Canceled { task } => task,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Codec(#[from] FrameCodecError),
    #[error("signaling connection is not open")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("could not acquire {kind} input: {reason}")]
    Acquire { kind: &'static str, reason: String },
    #[error("peer connection error: {0}")]
    PeerConnection(String),
    #[error("no peer connection")]
    NoPeerConnection,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no transition available from {state} for {action}")]
    NoTransitionAvailable { state: String, action: String },
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("no active meeting and peer connection")]
    NoActiveSession,
    #[error("session controller is gone")]
    ControllerDropped,
}
