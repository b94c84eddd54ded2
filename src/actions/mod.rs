//! Side-effecting actions fired by triggers.
//!
//! Actions are built once per named definition by [`build_action`] and shared
//! through [`ActionRegistry`] by every trigger that references them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::{ActionDef, Labels};

pub mod command;
pub mod notify;

pub use command::CommandAction;
pub use notify::NotifyAction;

/// Errors returned by [`Action::execute`].
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The expanded argument vector was empty.
    #[error("no command to run")]
    NoCommand,

    /// The process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The process ran but did not exit successfully.
    #[error("{program} exited unsuccessfully (code {code:?})")]
    ExitStatus {
        /// Program that failed.
        program: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },

    /// The webhook request failed in transport or timed out.
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The webhook answered with something other than 200.
    #[error("webhook returned unexpected status {0}")]
    HttpStatus(u16),

    /// The batch queue stayed full for the whole enqueue timeout.
    #[error("notification queue is full, message dropped")]
    QueueFull,

    /// The batching task is gone.
    #[error("notification batcher has stopped")]
    BatcherStopped,

    /// The HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Something a trigger can run for a log line.
#[async_trait]
pub trait Action: Send + Sync + fmt::Debug {
    /// Run the action for one line.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] describing why the effect did not happen.
    /// Callers log it and carry on; nothing is retried.
    async fn execute(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        labels: &Labels,
    ) -> Result<(), ActionError>;
}

/// Instantiate one action from its resolved definition.
///
/// Batched notify actions spawn their batching task here; its handle is
/// returned so the orchestrator can wait for the final flush on shutdown.
///
/// # Errors
///
/// Returns [`ActionError::Client`] if the HTTP client cannot be built.
pub fn build_action(
    def: &ActionDef,
    shutdown: &watch::Receiver<bool>,
) -> Result<(Arc<dyn Action>, Option<JoinHandle<()>>), ActionError> {
    match def {
        ActionDef::Command(cmd) => Ok((Arc::new(CommandAction::new(cmd)), None)),
        ActionDef::Notify(notify) => {
            let (action, worker) = NotifyAction::spawn(notify, shutdown.clone())?;
            Ok((Arc::new(action), worker))
        }
    }
}

/// Shared action instances keyed by name.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry")
            .field("actions", &names)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ActionRegistry {
    /// Build every action in `defs`.
    ///
    /// # Errors
    ///
    /// Fails on the first action that cannot be built.
    pub fn build(
        defs: &BTreeMap<String, ActionDef>,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        for (name, def) in defs {
            let (action, worker) = build_action(def, shutdown)
                .with_context(|| format!("failed to create action {name}"))?;
            debug!(action = %name, kind = def.kind(), "action created");
            registry.insert(name, action);
            registry.workers.extend(worker);
        }
        Ok(registry)
    }

    /// Register an already built action under `name`.
    pub fn insert(&mut self, name: &str, action: Arc<dyn Action>) {
        self.actions.insert(name.to_owned(), action);
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Take the handles of background batching tasks.
    pub fn take_workers(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.workers)
    }
}
