//! Chat webhook notifications, optionally batched.
//!
//! Unbatched actions post each expanded message straight away. Batched
//! actions hand the message to a single background [`Batcher`] task over a
//! bounded queue; the batcher owns the buffer and posts it when it is full,
//! when it has been idle for a while, or on shutdown.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::{Action, ActionError};
use crate::model::{BatchDef, Labels, NotifyDef};
use crate::template;

/// Capacity of the queue between producers and the batcher.
pub const QUEUE_CAPACITY: usize = 10;

/// How long `execute` waits for queue space before dropping the message.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Default idle period after which a non-empty batch is flushed.
pub const IDLE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts `{"text": ...}` to one webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    url: String,
    client: reqwest::Client,
}

impl WebhookClient {
    /// Create a client whose requests are bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Client`] if the TLS backend cannot initialise.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ActionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ActionError::Client)?;
        Ok(Self {
            url: url.to_owned(),
            client,
        })
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Request`] on transport failure or timeout and
    /// [`ActionError::HttpStatus`] for any status other than 200.
    pub async fn post(&self, text: &str) -> Result<(), ActionError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { text })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ActionError::HttpStatus(status.as_u16()));
        }

        debug!("notification delivered");
        Ok(())
    }
}

/// Webhook notification action.
#[derive(Debug)]
pub struct NotifyAction {
    message_template: String,
    webhook: WebhookClient,
    queue: Option<mpsc::Sender<String>>,
}

impl NotifyAction {
    /// Create the action, spawning its batcher when batching is configured.
    ///
    /// The returned handle, if any, completes after the batcher's final flush.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Client`] if the HTTP client cannot be built.
    pub fn spawn(
        def: &NotifyDef,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, Option<JoinHandle<()>>), ActionError> {
        Self::spawn_with_idle_interval(def, shutdown, IDLE_FLUSH_INTERVAL)
    }

    /// Like [`NotifyAction::spawn`] with a custom idle flush interval.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Client`] if the HTTP client cannot be built.
    pub fn spawn_with_idle_interval(
        def: &NotifyDef,
        shutdown: watch::Receiver<bool>,
        idle: Duration,
    ) -> Result<(Self, Option<JoinHandle<()>>), ActionError> {
        let webhook = WebhookClient::new(&def.webhook_url, def.timeout)?;

        let Some(batch) = def.batch.clone() else {
            let action = Self {
                message_template: def.message_template.clone(),
                webhook,
                queue: None,
            };
            return Ok((action, None));
        };

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let batcher = Batcher {
            webhook: webhook.clone(),
            batch,
            idle,
            rx,
            shutdown,
        };
        let handle = tokio::spawn(batcher.run());

        let action = Self {
            message_template: def.message_template.clone(),
            webhook,
            queue: Some(tx),
        };
        Ok((action, Some(handle)))
    }

    /// Whether messages go through a batcher.
    pub fn is_batched(&self) -> bool {
        self.queue.is_some()
    }
}

#[async_trait]
impl Action for NotifyAction {
    async fn execute(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        labels: &Labels,
    ) -> Result<(), ActionError> {
        let text = template::expand(&self.message_template, timestamp, message, labels);

        let Some(queue) = &self.queue else {
            return self.webhook.post(&text).await;
        };

        match queue.send_timeout(text, ENQUEUE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(ActionError::QueueFull),
            Err(SendTimeoutError::Closed(_)) => Err(ActionError::BatcherStopped),
        }
    }
}

/// Accumulates one batch of messages.
struct BatchBuffer<'a> {
    prefix: &'a str,
    suffix: &'a str,
    body: String,
    count: usize,
}

impl<'a> BatchBuffer<'a> {
    fn new(batch: &'a BatchDef) -> Self {
        Self {
            prefix: &batch.prefix,
            suffix: &batch.suffix,
            body: String::new(),
            count: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn push(&mut self, message: &str) {
        self.body.push_str(message);
        self.body.push('\n');
        self.count = self.count.saturating_add(1);
    }

    /// Render the batch and start a fresh one.
    fn take(&mut self) -> String {
        let text = format!("{}{}{}", self.prefix, self.body, self.suffix);
        self.body.clear();
        self.count = 0;
        text
    }
}

/// Sole owner of a notify action's pending batch.
struct Batcher {
    webhook: WebhookClient,
    batch: BatchDef,
    idle: Duration,
    rx: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
}

impl Batcher {
    async fn run(self) {
        let Self {
            webhook,
            batch,
            idle,
            mut rx,
            mut shutdown,
        } = self;

        let mut buffer = BatchBuffer::new(&batch);
        let mut ticker = tokio::time::interval(idle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        debug!(max_count = batch.max_count, "notification batcher started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while let Ok(message) = rx.try_recv() {
                            buffer.push(&message);
                        }
                        break;
                    }
                }
                message = rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if buffer.is_empty() {
                        ticker.reset();
                    }
                    buffer.push(&message);
                    if buffer.count >= batch.max_count {
                        flush(&webhook, &mut buffer).await;
                        ticker.reset();
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        flush(&webhook, &mut buffer).await;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            flush(&webhook, &mut buffer).await;
        }
        info!("notification batcher stopped");
    }
}

async fn flush(webhook: &WebhookClient, buffer: &mut BatchBuffer<'_>) {
    let count = buffer.count;
    let text = buffer.take();
    match webhook.post(&text).await {
        Ok(()) => debug!(count, "notification batch sent"),
        Err(e) => error!(count, error = %e, "failed to send notification batch"),
    }
}
