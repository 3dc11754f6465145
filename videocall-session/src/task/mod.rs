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

//! The task algebra the connect, update and reconnect pipelines are built
//! from.
//!
//! A [`Task`] runs once and fails with a [`TaskError`]. Tasks compose with
//! [`SerialGroupTask`], [`ParallelGroupTask`], [`TimeoutTask`] and
//! [`OnceTask`]. Cancellation is advisory: a canceled task should stop
//! promptly and fail, but callers tolerate stragglers.

mod clean;
mod group;
mod media_input;
mod monitor;
mod peer;
mod presence;
mod signaling;
mod subscribe;
mod turn;
mod video_index;

pub use clean::{CleanRestartedSessionTask, CleanStoppedSessionTask};
pub use group::{OnceTask, ParallelGroupTask, SerialGroupTask, TimeoutTask};
pub use media_input::{AttachMediaInputTask, ReceiveAudioInputTask, ReceiveVideoInputTask};
pub use monitor::MonitorTask;
pub use peer::{
    CreatePeerConnectionTask, CreateSdpTask, FinishGatheringIceCandidatesTask,
    SetLocalDescriptionTask, SetRemoteDescriptionTask,
};
pub use presence::WaitForAttendeePresenceTask;
pub use signaling::{
    JoinAndReceiveIndexTask, LeaveAndReceiveLeaveAckTask, ListenForVolumeIndicatorsTask,
    OpenSignalingConnectionTask, ReceiveRemoteVideoPauseResumeTask,
    SendAndReceiveDataMessagesTask,
};
pub use subscribe::SubscribeAndReceiveSubscribeAckTask;
pub use turn::ReceiveTurnCredentialsTask;
pub use video_index::ReceiveVideoStreamIndexTask;

use crate::errors::TaskError;
use async_trait::async_trait;
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> String;

    async fn run(&self) -> Result<(), TaskError>;

    fn cancel(&self) {}
}

pub type TaskRef = Arc<dyn Task>;

/// Run `task` with start and outcome logging.
pub async fn run_task(task: &dyn Task) -> Result<(), TaskError> {
    let name = task.name();
    info!("running {name}");
    match task.run().await {
        Ok(()) => {
            info!("{name} succeeded");
            Ok(())
        }
        Err(e) => {
            warn!("{name} failed: {e}");
            Err(e)
        }
    }
}

/// Await `future` unless `token` is canceled first.
pub(crate) async fn cancellable<T>(
    token: &CancellationToken,
    task: &str,
    future: impl Future<Output = T>,
) -> Result<T, TaskError> {
    tokio::select! {
        _ = token.cancelled() => Err(TaskError::canceled(task)),
        value = future => Ok(value),
    }
}
