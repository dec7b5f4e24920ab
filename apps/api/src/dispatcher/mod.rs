//! Rate-Limited Dispatcher: the only path from an envelope to the model endpoint.
//!
//! Each attempt is bounded by the request timeout and takes a slot from the
//! process-wide rate ceiling. Rate-limited and transient failures are retried with
//! exponential backoff up to the attempt ceiling; fatal failures never are.
//!
//! Cancellation is observed at the rate-ceiling wait and before every retry sleep.
//! An attempt already in flight is allowed to finish and its result is discarded.
//!
//! The dispatcher holds no conversation state.

pub mod backoff;
pub mod batching;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::RequestEnvelope;
use crate::conversation::Sequence;
use crate::interpreter::ResponseShape;
use crate::llm_client::{EndpointError, ModelEndpoint, ModelReply, ModelRequest};

use backoff::{AttemptResult, RetryPolicy, RetryState};
use batching::{BatchKey, Coalescer, Enqueued, Member};
use rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Success,
    RateLimited,
    TransientError,
    FatalError,
    /// The caller gave up before a result was delivered.
    Cancelled,
}

impl DispatchStatus {
    /// Maps an endpoint failure onto the retry taxonomy.
    pub fn classify(error: &EndpointError) -> Self {
        match error {
            EndpointError::RateLimited(_) => DispatchStatus::RateLimited,
            EndpointError::Server { .. }
            | EndpointError::Network(_)
            | EndpointError::Timeout
            | EndpointError::Decode(_) => DispatchStatus::TransientError,
            EndpointError::Auth { .. }
            | EndpointError::Malformed { .. }
            | EndpointError::ContentPolicy(_) => DispatchStatus::FatalError,
        }
    }

    fn attempt_result(&self) -> AttemptResult {
        match self {
            DispatchStatus::Success => AttemptResult::Success,
            DispatchStatus::RateLimited | DispatchStatus::TransientError => {
                AttemptResult::Retryable
            }
            DispatchStatus::FatalError | DispatchStatus::Cancelled => AttemptResult::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    pub raw_response: Option<ModelReply>,
    pub error_detail: Option<String>,
    pub attempt_count: u32,
    pub sequence: Option<Sequence>,
    /// Whether the reply came out of a coalesced call.
    pub batched: bool,
}

impl DispatchOutcome {
    fn success(reply: ModelReply, attempt_count: u32) -> Self {
        Self {
            status: DispatchStatus::Success,
            raw_response: Some(reply),
            error_detail: None,
            attempt_count,
            sequence: None,
            batched: false,
        }
    }

    fn failure(status: DispatchStatus, detail: String, attempt_count: u32) -> Self {
        Self {
            status,
            raw_response: None,
            error_detail: Some(detail),
            attempt_count,
            sequence: None,
            batched: false,
        }
    }

    fn cancelled(attempt_count: u32) -> Self {
        Self::failure(
            DispatchStatus::Cancelled,
            "request cancelled".to_string(),
            attempt_count,
        )
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        self.status == DispatchStatus::Success
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub retry: RetryPolicy,
    /// Wall-clock limit of a single attempt.
    pub request_timeout: Duration,
    pub rate_window: Duration,
    pub rate_max_requests: usize,
    /// Zero disables coalescing.
    pub coalesce_window: Duration,
    pub max_batch_size: usize,
    pub jitter: bool,
}

impl DispatcherSettings {
    pub fn batching_enabled(&self) -> bool {
        !self.coalesce_window.is_zero() && self.max_batch_size > 1
    }
}

impl From<&Config> for DispatcherSettings {
    fn from(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from(config),
            request_timeout: config.request_timeout,
            rate_window: config.rate_limit_window,
            rate_max_requests: config.rate_limit_max_requests,
            coalesce_window: config.coalesce_window,
            max_batch_size: config.max_batch_size,
            jitter: true,
        }
    }
}

/// Cheap to clone; all clones share the rate ceiling and the open batches.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    endpoint: Arc<dyn ModelEndpoint>,
    settings: DispatcherSettings,
    limiter: RateLimiter,
    coalescer: Coalescer,
}

impl Dispatcher {
    pub fn new(endpoint: Arc<dyn ModelEndpoint>, settings: DispatcherSettings) -> Self {
        let limiter = RateLimiter::new(settings.rate_window, settings.rate_max_requests);
        let coalescer = Coalescer::new(settings.max_batch_size);
        Self {
            inner: Arc::new(DispatcherInner {
                endpoint,
                settings,
                limiter,
                coalescer,
            }),
        }
    }

    /// Dispatches one envelope, coalescing it with compatible requests when batching
    /// is enabled.
    pub async fn dispatch(
        &self,
        envelope: &RequestEnvelope,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let request = envelope.to_model_request();
        let key = self
            .inner
            .settings
            .batching_enabled()
            .then(|| BatchKey::for_envelope(envelope))
            .flatten();

        let outcome = match key {
            Some(key) => self.dispatch_coalesced(key, request, cancel).await,
            None => self.inner.execute(&request, cancel).await,
        };
        DispatchOutcome {
            sequence: envelope.sequence,
            ..outcome
        }
    }

    /// Dispatches a request on its own, bypassing the coalescer.
    pub async fn dispatch_request(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        self.inner.execute(request, cancel).await
    }

    async fn dispatch_coalesced(
        &self,
        key: BatchKey,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        if cancel.is_cancelled() {
            return DispatchOutcome::cancelled(0);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let shape = key.shape;
        let member = Member {
            request,
            reply_tx,
            cancel: cancel.clone(),
        };

        match self.inner.coalescer.enqueue(key.clone(), member).await {
            Enqueued::Joined => {}
            Enqueued::Opened { batch_id } => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(inner.settings.coalesce_window).await;
                    if let Some(members) = inner.coalescer.take(&key, batch_id).await {
                        inner.run_batch(members, shape).await;
                    }
                });
            }
            Enqueued::Full(members) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.run_batch(members, shape).await });
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => DispatchOutcome::cancelled(0),
            received = reply_rx => received.unwrap_or_else(|_| {
                DispatchOutcome::failure(
                    DispatchStatus::TransientError,
                    "batch was dropped before it answered".to_string(),
                    0,
                )
            }),
        }
    }
}

impl DispatcherInner {
    /// Runs the retry state machine for one request.
    async fn execute(&self, request: &ModelRequest, cancel: &CancellationToken) -> DispatchOutcome {
        let policy = self.settings.retry;
        let mut state = RetryState::Idle.start();
        let mut reply: Option<ModelReply> = None;
        let mut last_error: Option<EndpointError> = None;

        loop {
            match state {
                RetryState::Idle => state = state.start(),
                RetryState::Attempting { attempt } => {
                    if cancel.is_cancelled() {
                        return DispatchOutcome::cancelled(attempt - 1);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return DispatchOutcome::cancelled(attempt - 1),
                        _ = self.limiter.acquire() => {}
                    }

                    debug!("Model request attempt {attempt}/{}", policy.max_attempts);
                    let result =
                        match tokio::time::timeout(self.settings.request_timeout, self.endpoint.send(request))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(EndpointError::Timeout),
                        };

                    if cancel.is_cancelled() {
                        info!("Discarding result of attempt {attempt}: request was cancelled");
                        return DispatchOutcome::cancelled(attempt);
                    }

                    let status = match result {
                        Ok(ok) => {
                            reply = Some(ok);
                            DispatchStatus::Success
                        }
                        Err(e) => {
                            let status = DispatchStatus::classify(&e);
                            warn!("Model request attempt {attempt} failed ({status:?}): {e}");
                            last_error = Some(e);
                            status
                        }
                    };
                    state = state.on_result(status.attempt_result(), &policy, self.jitter());
                }
                RetryState::Retrying { attempt, delay } => {
                    warn!(
                        "Retrying model request after {}ms (attempt {} of {})",
                        delay.as_millis(),
                        attempt + 1,
                        policy.max_attempts
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return DispatchOutcome::cancelled(attempt),
                        _ = tokio::time::sleep(delay) => state = state.on_delay_elapsed(),
                    }
                }
                RetryState::Succeeded { attempts } => {
                    return match reply.take() {
                        Some(reply) => DispatchOutcome::success(reply, attempts),
                        None => DispatchOutcome::failure(
                            DispatchStatus::TransientError,
                            "attempt succeeded without a reply".to_string(),
                            attempts,
                        ),
                    };
                }
                RetryState::Failed { attempts } => {
                    let (status, detail) = match last_error.take() {
                        Some(e) => (DispatchStatus::classify(&e), e.to_string()),
                        None => (
                            DispatchStatus::TransientError,
                            "request failed".to_string(),
                        ),
                    };
                    warn!("Model request gave up after {attempts} attempt(s): {detail}");
                    return DispatchOutcome::failure(status, detail, attempts);
                }
            }
        }
    }

    fn jitter(&self) -> Duration {
        if self.settings.jitter {
            self.settings.retry.sample_jitter()
        } else {
            Duration::ZERO
        }
    }

    /// Sends a flushed batch and answers every member.
    async fn run_batch(self: Arc<Self>, members: Vec<Member>, shape: ResponseShape) {
        if members.len() == 1 {
            for member in members {
                let outcome = self.execute(&member.request, &member.cancel).await;
                let _ = member.reply_tx.send(outcome);
            }
            return;
        }

        let requests: Vec<&ModelRequest> = members.iter().map(|m| &m.request).collect();
        let merged = batching::merge_requests(&requests, shape);
        info!("Flushing batch of {} requests", members.len());
        let (batch_cancel, watcher) = batching::batch_token(&members);
        let outcome = self.execute(&merged, &batch_cancel).await;
        watcher.abort();

        match (outcome.status, &outcome.raw_response) {
            (DispatchStatus::Success, Some(reply)) => {
                let replies = batching::split_reply(reply, members.len(), shape);
                for (member, reply) in members.into_iter().zip(replies) {
                    match reply {
                        Some(reply) => {
                            let _ = member.reply_tx.send(DispatchOutcome {
                                batched: true,
                                ..DispatchOutcome::success(reply, outcome.attempt_count)
                            });
                        }
                        None => {
                            warn!("Batch reply is missing a member; dispatching it alone");
                            Arc::clone(&self).spawn_solo(member);
                        }
                    }
                }
            }
            // The merged request itself may be what the endpoint rejected.
            (DispatchStatus::FatalError, _) => {
                warn!("Batch was rejected; dispatching its members alone");
                for member in members {
                    Arc::clone(&self).spawn_solo(member);
                }
            }
            _ => {
                for member in members {
                    let _ = member.reply_tx.send(DispatchOutcome {
                        batched: true,
                        ..outcome.clone()
                    });
                }
            }
        }
    }

    fn spawn_solo(self: Arc<Self>, member: Member) {
        tokio::spawn(async move {
            let outcome = self.execute(&member.request, &member.cancel).await;
            let _ = member.reply_tx.send(outcome);
        });
    }
}
