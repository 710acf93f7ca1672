//! HTTP client for the attendance backend.
//!
//! Wire contract:
//! - `GET  /students/embeddings[?roomId=..]` -> `{ identity: [f32; D] }`
//! - `POST /attendance/checkin`  `{studentId, roomId, timestamp, confidenceScore}` -> `{sessionId}`
//! - `PUT  /attendance/heartbeat` `{sessionId, timestamp, confidenceScore}`
//! - `POST /attendance/checkout` `{sessionId, timestamp}`
//!
//! Only HTTP 200 counts as success.

use rollcall_core::{RawRoster, RosterError, RosterSource};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response body: {0}")]
    Malformed(String),
    #[error("check-in response has no sessionId")]
    MissingSessionId,
}

impl BackendError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(err) => err.is_timeout() || err.is_connect(),
            BackendError::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            BackendError::Malformed(_) | BackendError::MissingSessionId => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInRequest {
    pub student_id: String,
    /// Serialized as `null` when the terminal watches all rooms.
    pub room_id: Option<String>,
    pub timestamp: i64,
    pub confidence_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub session_id: String,
    pub timestamp: i64,
    pub confidence_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutRequest {
    pub session_id: String,
    pub timestamp: i64,
}

/// Attendance calls made by the sync worker.
pub trait AttendanceBackend {
    /// Open a session; returns the backend session id.
    fn check_in(
        &self,
        req: &CheckInRequest,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;

    fn heartbeat(
        &self,
        req: &HeartbeatRequest,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn check_out(
        &self,
        req: &CheckOutRequest,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Fetch `identity -> raw embedding` for one room, or all rooms.
    pub async fn embeddings(&self, room_filter: Option<&str>) -> Result<RawRoster, BackendError> {
        let mut request = self.http.get(self.url("/students/embeddings"));
        if let Some(room) = room_filter.filter(|r| !r.is_empty()) {
            request = request.query(&[("roomId", room)]);
        }
        let body = expect_ok(request.send().await?).await?;
        serde_json::from_str(&body).map_err(|e| BackendError::Malformed(e.to_string()))
    }
}

/// Read the body of a 200 response, or turn anything else into `Status`.
async fn expect_ok(response: reqwest::Response) -> Result<String, BackendError> {
    let status = response.status();
    let body = response.text().await?;
    if status != reqwest::StatusCode::OK {
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

/// Extract `sessionId` from a check-in answer. Strings and numbers are both
/// accepted; numbers are rendered in decimal.
fn parse_session_id(body: &str) -> Result<String, BackendError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| BackendError::Malformed(e.to_string()))?;
    match value.get("sessionId") {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(serde_json::Value::Number(id)) => Ok(id.to_string()),
        _ => Err(BackendError::MissingSessionId),
    }
}

impl AttendanceBackend for BackendClient {
    async fn check_in(&self, req: &CheckInRequest) -> Result<String, BackendError> {
        let response = self
            .http
            .post(self.url("/attendance/checkin"))
            .json(req)
            .send()
            .await?;
        let body = expect_ok(response).await?;
        parse_session_id(&body)
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<(), BackendError> {
        let response = self
            .http
            .put(self.url("/attendance/heartbeat"))
            .json(req)
            .send()
            .await?;
        expect_ok(response).await.map(drop)
    }

    async fn check_out(&self, req: &CheckOutRequest) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.url("/attendance/checkout"))
            .json(req)
            .send()
            .await?;
        expect_ok(response).await.map(drop)
    }
}

impl RosterSource for BackendClient {
    async fn fetch_roster(&self, room_filter: Option<&str>) -> Result<RawRoster, RosterError> {
        self.embeddings(room_filter)
            .await
            .map_err(|e| RosterError::Fetch(e.to_string()))
    }
}
