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

//! TURN credentials from the meeting's TURN control endpoint.

use async_trait::async_trait;
use log::info;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use videocall_types::TurnCredentials;

#[derive(Debug, Error)]
pub enum TurnCredentialsError {
    /// The join token is not allowed to use TURN (HTTP 403).
    #[error("TURN credentials forbidden: {0}")]
    Forbidden(String),

    #[error("TURN control error ({status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("TURN control request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// Who is asking, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentialsRequest {
    pub url: String,
    pub meeting_id: String,
    pub join_token: String,
}

#[async_trait]
pub trait TurnCredentialsProvider: Send + Sync {
    async fn fetch(
        &self,
        request: &TurnCredentialsRequest,
    ) -> Result<TurnCredentials, TurnCredentialsError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TurnCredentialsBody<'a> {
    meeting_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TurnCredentialsResponse {
    username: String,
    password: String,
    ttl: u32,
    uris: Vec<String>,
}

impl From<TurnCredentialsResponse> for TurnCredentials {
    fn from(response: TurnCredentialsResponse) -> Self {
        TurnCredentials {
            username: response.username,
            password: response.password,
            ttl_seconds: response.ttl,
            uris: response.uris,
        }
    }
}

/// POSTs the meeting id with the join token as a bearer token.
#[derive(Debug, Clone, Default)]
pub struct HttpTurnCredentialsProvider {
    http: Client,
}

impl HttpTurnCredentialsProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TurnCredentialsProvider for HttpTurnCredentialsProvider {
    async fn fetch(
        &self,
        request: &TurnCredentialsRequest,
    ) -> Result<TurnCredentials, TurnCredentialsError> {
        info!("requesting TURN credentials from {}", request.url);
        let response = self
            .http
            .post(&request.url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", request.join_token),
            )
            .json(&TurnCredentialsBody {
                meeting_id: &request.meeting_id,
            })
            .send()
            .await?;
        let status = response.status().as_u16();
        match status {
            200..=299 => {
                let body: TurnCredentialsResponse = response.json().await?;
                info!("received TURN credentials");
                Ok(body.into())
            }
            403 => {
                let text = response.text().await.unwrap_or_default();
                Err(TurnCredentialsError::Forbidden(text))
            }
            _ => {
                let text = response.text().await.unwrap_or_default();
                Err(TurnCredentialsError::ServerError { status, body: text })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_maps_ttl_to_seconds() {
        let response: TurnCredentialsResponse = serde_json::from_str(
            r#"{"username":"u","password":"p","ttl":300,"uris":["turn:turn.test:3478"]}"#,
        )
        .unwrap();
        let credentials = TurnCredentials::from(response);
        assert_eq!(credentials.ttl_seconds, 300);
        assert_eq!(credentials.uris, vec!["turn:turn.test:3478".to_string()]);
    }

    #[test]
    fn body_uses_camel_case() {
        let body = serde_json::to_string(&TurnCredentialsBody { meeting_id: "m-1" }).unwrap();
        assert_eq!(body, r#"{"meetingId":"m-1"}"#);
    }
}
