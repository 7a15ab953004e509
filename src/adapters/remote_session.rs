use std::time::Duration;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::adapters::http_transport::{
    Method, Transport, TransportError, TransportRequest, TransportResponse,
};
use crate::domain::models::{RemoteCallError, RemoteCallOutcome};

pub const API_RETRY_COUNT: u8 = 3;
pub const API_TIMEOUT_MS: u64 = 10_000;
pub const API_BACKOFF_BASE_MS: u64 = 1_000;

const START_PATH: &str = "/session/start";
const STOP_PATH: &str = "/session/stop";
const CURRENT_PATH: &str = "/session/current";

/// Blocking pause between attempts. Injected so tests can record the schedule.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Operations the device issues against the timekeeping service. Failures are always
/// returned inside the outcome.
pub trait SessionApi {
    fn is_configured(&self) -> bool;
    fn clock_in(&self, project_id: &str) -> RemoteCallOutcome;
    fn clock_out(&self, session_id: &str) -> RemoteCallOutcome;
    fn get_status(&self) -> RemoteCallOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u8,
    pub timeout: Duration,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: API_RETRY_COUNT,
            timeout: Duration::from_millis(API_TIMEOUT_MS),
            backoff_base: Duration::from_millis(API_BACKOFF_BASE_MS),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the n-th retry waits n times the base.
    pub fn delay_before(&self, attempt: u8) -> Duration {
        self.backoff_base
            .saturating_mul(u32::from(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    project_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    session_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    session_id: Option<String>,
    started_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    SessionId,
    Nothing,
}

pub struct RemoteSessionClient<T, S> {
    transport: T,
    sleeper: S,
    endpoint: String,
    token: Option<String>,
    policy: RetryPolicy,
}

impl<T, S> RemoteSessionClient<T, S>
where
    T: Transport,
    S: Sleeper,
{
    pub fn new(
        transport: T,
        sleeper: S,
        endpoint: &str,
        token: &str,
        policy: RetryPolicy,
    ) -> Self {
        let token = token.trim();
        Self {
            transport,
            sleeper,
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            token: (!token.is_empty()).then(|| token.to_string()),
            policy: RetryPolicy {
                attempts: policy.attempts.max(1),
                ..policy
            },
        }
    }

    fn send_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        expect: Expect,
    ) -> RemoteCallOutcome {
        if !self.is_configured() {
            tracing::error!(path, "remote client not configured");
            return RemoteCallOutcome::failed(RemoteCallError::NotConfigured, None, 0);
        }

        let request = TransportRequest {
            method,
            url: format!("{}{path}", self.endpoint),
            body: match method {
                Method::Post => Some(body.unwrap_or_else(|| Value::Object(Default::default()))),
                Method::Get => None,
            },
            bearer_token: self.token.clone(),
            idempotency_key: Uuid::new_v4().to_string(),
            timeout: self.policy.timeout,
        };

        tracing::info!(method = ?method, url = %request.url, "remote call");

        let mut last_status = None;
        let mut last_error = RemoteCallError::Transport("no attempt made".to_string());

        for attempt in 1..=self.policy.attempts {
            if attempt > 1 {
                let delay = self.policy.delay_before(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = self.policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying remote call"
                );
                self.sleeper.sleep(delay);
            }

            match self.transport.send(&request) {
                Ok(response) => {
                    last_status = Some(response.status);
                    match interpret(&response, expect) {
                        Ok(payload) => {
                            return RemoteCallOutcome {
                                success: true,
                                status_code: Some(response.status),
                                session_id: payload.session_id.filter(|id| !id.is_empty()),
                                started_at: payload
                                    .started_at
                                    .as_deref()
                                    .and_then(parse_started_at),
                                error: None,
                                attempts: attempt,
                            };
                        }
                        Err(error) => {
                            tracing::warn!(
                                attempt,
                                status = response.status,
                                error = %error,
                                "remote call rejected"
                            );
                            last_error = error;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(attempt, error = %error, "remote call did not complete");
                    last_error = transport_failure(error);
                }
            }
        }

        tracing::error!(
            attempts = self.policy.attempts,
            status = ?last_status,
            error = %last_error,
            "remote call exhausted retries"
        );
        RemoteCallOutcome::failed(last_error, last_status, self.policy.attempts)
    }
}

impl<T, S> SessionApi for RemoteSessionClient<T, S>
where
    T: Transport,
    S: Sleeper,
{
    fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
    }

    fn clock_in(&self, project_id: &str) -> RemoteCallOutcome {
        tracing::info!(project_id, "clocking in");
        let body = serde_json::to_value(StartRequest { project_id }).ok();
        self.send_with_retry(Method::Post, START_PATH, body, Expect::SessionId)
    }

    fn clock_out(&self, session_id: &str) -> RemoteCallOutcome {
        tracing::info!(session_id, "clocking out");
        let body = serde_json::to_value(StopRequest { session_id }).ok();
        self.send_with_retry(Method::Post, STOP_PATH, body, Expect::Nothing)
    }

    fn get_status(&self) -> RemoteCallOutcome {
        tracing::info!("fetching current session status");
        self.send_with_retry(Method::Get, CURRENT_PATH, None, Expect::Nothing)
    }
}

fn interpret(
    response: &TransportResponse,
    expect: Expect,
) -> Result<SessionPayload, RemoteCallError> {
    if !(200..300).contains(&response.status) {
        return Err(RemoteCallError::Protocol {
            status: response.status,
        });
    }

    let value: Value = serde_json::from_str(&response.body)
        .map_err(|error| RemoteCallError::Parse(error.to_string()))?;
    if !value.is_object() {
        return Err(RemoteCallError::Parse("expected a JSON object".to_string()));
    }

    let payload: SessionPayload = serde_json::from_value(value)
        .map_err(|error| RemoteCallError::Parse(error.to_string()))?;

    let has_session_id = payload
        .session_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty());
    if expect == Expect::SessionId && !has_session_id {
        return Err(RemoteCallError::Parse("missing sessionId".to_string()));
    }

    Ok(payload)
}

fn transport_failure(error: TransportError) -> RemoteCallError {
    RemoteCallError::Transport(error.to_string())
}

fn parse_started_at(raw: &str) -> Option<i64> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(timestamp) => Some(timestamp.timestamp()),
        Err(error) => {
            tracing::warn!(started_at = raw, error = %error, "ignoring unparseable startedAt");
            None
        }
    }
}
