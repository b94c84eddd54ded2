//! Wires resolved configuration into running flow tasks.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::actions::ActionRegistry;
use crate::flows::FlowRunner;
use crate::model::ResolvedConfig;

/// All flow runners plus the batching tasks behind shared notify actions.
#[derive(Debug)]
pub struct Daemon {
    flows: Vec<FlowRunner>,
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Receiver<bool>,
    shutdown_timeout: Duration,
}

impl Daemon {
    /// Build every action and flow runner. Nothing starts streaming yet.
    ///
    /// Must be called inside a Tokio runtime: batched notify actions spawn
    /// their batchers here.
    ///
    /// # Errors
    ///
    /// Fails if an action cannot be created or a trigger references a
    /// missing action.
    pub fn build(config: &ResolvedConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let mut registry = ActionRegistry::build(&config.actions, &shutdown)?;

        let flows = config
            .flows
            .iter()
            .map(|def| FlowRunner::from_def(def, config.loki.clone(), &registry, shutdown.clone()))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            flows,
            workers: registry.take_workers(),
            shutdown,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Number of flows that will run.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Run every flow concurrently until shutdown, then wait for the
    /// batchers' final flush, bounded by the shutdown timeout.
    pub async fn run(self) {
        let Self {
            flows,
            workers,
            mut shutdown,
            shutdown_timeout,
        } = self;

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(flows.len());
        for flow in flows {
            info!(flow = %flow.name(), "flow started");
            tasks.push(tokio::spawn(flow.run()));
        }

        // Wait for the signal; a dropped sender counts as one.
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(
            flows = tasks.len(),
            batchers = workers.len(),
            timeout_secs = shutdown_timeout.as_secs(),
            "waiting for flows and batchers to stop"
        );

        tasks.extend(workers);
        let wait_all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "task ended abnormally");
                }
            }
        };

        if tokio::time::timeout(shutdown_timeout, wait_all).await.is_err() {
            warn!("shutdown timeout exceeded, abandoning remaining tasks");
        }

        info!("lokiactor stopped");
    }
}
