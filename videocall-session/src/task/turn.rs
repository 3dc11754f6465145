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

use super::{cancellable, Task};
use crate::errors::TaskError;
use crate::session_state::SessionContext;
use crate::status::MeetingSessionStatusCode;
use crate::turn_credentials::{TurnCredentialsError, TurnCredentialsRequest};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fetches TURN credentials when a TURN control URL is configured. They
/// replace any credentials JOIN_ACK carried.
pub struct ReceiveTurnCredentialsTask {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl ReceiveTurnCredentialsTask {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Task for ReceiveTurnCredentialsTask {
    fn name(&self) -> String {
        "ReceiveTurnCredentialsTask".into()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let configuration = &self.context.configuration;
        if configuration.turn_control_url.is_empty() {
            info!("skipping TURN credentials");
            return Ok(());
        }
        let request = TurnCredentialsRequest {
            url: configuration.turn_control_url.clone(),
            meeting_id: configuration.meeting_id.clone(),
            join_token: configuration.join_token.clone(),
        };
        let fetched = cancellable(
            &self.cancel,
            &self.name(),
            self.context.turn_credentials_provider.fetch(&request),
        )
        .await?;
        let credentials = match fetched {
            Ok(credentials) => credentials,
            Err(TurnCredentialsError::Forbidden(reason)) => {
                return Err(TaskError::with_status(
                    self.name(),
                    MeetingSessionStatusCode::TURNCredentialsForbidden,
                    format!("TURN credentials forbidden: {reason}"),
                ));
            }
            Err(e) => return Err(TaskError::failed(self.name(), e.to_string())),
        };
        self.context.state.lock().turn_credentials = Some(credentials);
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeetingSessionConfiguration;
    use crate::fakes::{harness_configured, FakeTurnCredentialsProvider, ScriptedTransport};
    use crate::task::run_task;

    fn with_turn_url() -> MeetingSessionConfiguration {
        MeetingSessionConfiguration {
            turn_control_url: "https://turn.test/credentials".into(),
            join_token: "token".into(),
            ..crate::fakes::test_configuration()
        }
    }

    #[tokio::test]
    async fn fetched_credentials_replace_join_ack_ones() {
        let provider = Arc::new(FakeTurnCredentialsProvider::default());
        let context = harness_configured(
            with_turn_url(),
            Arc::new(ScriptedTransport::default()),
            provider.clone(),
        );

        run_task(&ReceiveTurnCredentialsTask::new(context.clone()))
            .await
            .unwrap();

        let state = context.state.lock();
        let credentials = state.turn_credentials.as_ref().expect("credentials");
        assert_eq!(credentials.username, "turn-user");
        let requests = provider.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].meeting_id, "meeting");
        assert_eq!(requests[0].join_token, "token");
    }

    #[tokio::test]
    async fn forbidden_maps_to_its_status_code() {
        let provider = Arc::new(FakeTurnCredentialsProvider::forbidden());
        let context = harness_configured(
            with_turn_url(),
            Arc::new(ScriptedTransport::default()),
            provider,
        );

        let err = run_task(&ReceiveTurnCredentialsTask::new(context.clone()))
            .await
            .unwrap_err();

        assert_eq!(
            err.status_code(),
            Some(MeetingSessionStatusCode::TURNCredentialsForbidden)
        );
        assert!(context.state.lock().turn_credentials.is_none());
    }

    #[tokio::test]
    async fn no_url_skips_the_request() {
        let provider = Arc::new(FakeTurnCredentialsProvider::default());
        let context = harness_configured(
            crate::fakes::test_configuration(),
            Arc::new(ScriptedTransport::default()),
            provider.clone(),
        );

        run_task(&ReceiveTurnCredentialsTask::new(context))
            .await
            .unwrap();

        assert!(provider.requests.lock().is_empty());
    }
}
