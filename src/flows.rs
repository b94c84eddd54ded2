//! One reconnecting Loki tail subscription per flow.
//!
//! The runner loops `connect -> stream -> backoff` until shutdown. After a
//! failure it waits [`RECONNECT_BACKOFF`] and resubscribes from "now minus
//! the time spent waiting" so lines that arrived during the gap are replayed.

use std::future::Future;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::actions::ActionRegistry;
use crate::loki::{self, StreamError, TailStream};
use crate::model::{FlowDef, LokiTarget};
use crate::triggers::{LineOutcome, Matcher, Trigger};

/// Wait between a failed subscription and the next attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on the websocket close handshake at shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How a streaming session ended.
enum SessionEnd {
    Shutdown,
    Failed(StreamError),
}

/// Drives one flow: owns its stream connection and its [`Matcher`].
#[derive(Debug)]
pub struct FlowRunner {
    name: String,
    query: String,
    target: LokiTarget,
    matcher: Matcher,
    backoff: Duration,
    shutdown: watch::Receiver<bool>,
}

impl FlowRunner {
    /// Create a runner with the default backoff.
    pub fn new(
        name: impl Into<String>,
        query: impl Into<String>,
        target: LokiTarget,
        matcher: Matcher,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            target,
            matcher,
            backoff: RECONNECT_BACKOFF,
            shutdown,
        }
    }

    /// Build a runner from a resolved flow definition.
    ///
    /// # Errors
    ///
    /// Fails if a trigger references an action missing from `registry`.
    pub fn from_def(
        def: &FlowDef,
        target: LokiTarget,
        registry: &ActionRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let triggers = def
            .triggers
            .iter()
            .map(|t| Trigger::from_def(t, registry))
            .collect::<anyhow::Result<Vec<_>>>()
            .with_context(|| format!("failed to create flow {}", def.name))?;

        let matcher = Matcher::new(def.name.clone(), triggers);
        Ok(Self::new(
            def.name.clone(),
            def.query.clone(),
            target,
            matcher,
            shutdown,
        ))
    }

    /// Override the reconnect backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Flow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self) {
        info!(flow = %self.name, query = %self.query, "starting flow");

        let mut delay = Duration::ZERO;

        loop {
            if self.is_shutdown() {
                break;
            }

            let waited_from = Instant::now();
            if until_shutdown(&mut self.shutdown, tokio::time::sleep(delay))
                .await
                .is_none()
            {
                break;
            }

            // Replay from where the previous session left off.
            let start = SystemTime::now()
                .checked_sub(waited_from.elapsed())
                .unwrap_or_else(SystemTime::now);
            delay = self.backoff;

            let url = match loki::tail_url(&self.target, &self.query, start) {
                Ok(url) => url,
                Err(e) => {
                    error!(flow = %self.name, error = %e, "failed to build tail url");
                    continue;
                }
            };

            info!(flow = %self.name, url = %url, "connecting to loki stream");
            let Some(stream) = until_shutdown(&mut self.shutdown, loki::connect(&url)).await else {
                break;
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!(flow = %self.name, error = %e, "failed to connect to loki stream");
                    continue;
                }
            };
            info!(flow = %self.name, "connected to loki stream");

            match self.stream(stream).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(e) => {
                    error!(
                        flow = %self.name,
                        error = %e,
                        retry_in_secs = self.backoff.as_secs_f64(),
                        "loki stream interrupted"
                    );
                }
            }
        }

        info!(flow = %self.name, "flow stopped");
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Read frames until the stream fails or shutdown is requested.
    async fn stream(&mut self, mut stream: TailStream) -> SessionEnd {
        loop {
            let next = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        match tokio::time::timeout(CLOSE_TIMEOUT, stream.close(None)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(flow = %self.name, error = %e, "failed to close loki stream");
                            }
                            Err(_) => {
                                debug!(flow = %self.name, "timed out closing loki stream");
                            }
                        }
                        return SessionEnd::Shutdown;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            match next {
                None => return SessionEnd::Failed(StreamError::Closed),
                Some(Err(e)) => return SessionEnd::Failed(StreamError::Read(Box::new(e))),
                Some(Ok(Message::Text(text))) => {
                    self.handle_frame(text.as_str()).await;
                }
                Some(Ok(Message::Binary(payload))) => {
                    warn!(
                        flow = %self.name,
                        bytes = payload.len(),
                        "unexpected binary frame, skipping"
                    );
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(flow = %self.name, frame = ?frame, "close frame received");
                    return SessionEnd::Failed(StreamError::Closed);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            }
        }
    }

    /// Decode one text frame and feed its lines to the matcher in order.
    ///
    /// Malformed frames and lines with unparsable timestamps are logged and
    /// skipped.
    #[doc(hidden)]
    pub async fn handle_frame(&mut self, payload: &str) {
        let frame = match loki::decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!(flow = %self.name, error = %e, "failed to decode loki frame");
                return;
            }
        };

        if !frame.dropped_entries.is_empty() {
            warn!(
                flow = %self.name,
                dropped = frame.dropped_entries.len(),
                "loki dropped entries for this subscription"
            );
        }

        for group in &frame.streams {
            for entry in &group.values {
                let timestamp = match entry.parse_timestamp() {
                    Ok(ts) => ts,
                    Err(e) => {
                        error!(
                            flow = %self.name,
                            timestamp = %entry.timestamp,
                            error = %e,
                            "failed to parse line timestamp"
                        );
                        continue;
                    }
                };

                let outcome = self
                    .matcher
                    .process_line(timestamp, &entry.line, &group.labels)
                    .await;
                if let LineOutcome::Fired(trigger) = outcome {
                    info!(flow = %self.name, trigger = %trigger, "trigger fired");
                }
            }
        }
    }
}

/// Drive `fut` to completion unless shutdown is requested first.
///
/// Returns `None` on shutdown or when the signal's sender is gone. A change
/// that leaves the value `false` keeps waiting on the same future.
async fn until_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
            output = &mut fut => return Some(output),
        }
    }
}
