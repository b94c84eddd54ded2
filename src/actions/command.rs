//! Run an external process for a matched line.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, error, info};

use super::{Action, ActionError};
use crate::model::{CommandDef, Labels};
use crate::template;

/// Spawns a process built from argv templates and waits for it.
///
/// Output is captured and logged line by line once the process exits:
/// stdout at info, stderr at error. There is no timeout; the calling flow
/// is blocked until the process finishes.
#[derive(Debug, Clone)]
pub struct CommandAction {
    argv: Vec<String>,
}

impl CommandAction {
    /// Create the action from its definition.
    pub fn new(def: &CommandDef) -> Self {
        Self {
            argv: def.argv.clone(),
        }
    }

    /// Expand every argv template for one line.
    pub fn expand_argv(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        labels: &Labels,
    ) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| template::expand(arg, timestamp, message, labels))
            .collect()
    }
}

#[async_trait]
impl Action for CommandAction {
    async fn execute(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        labels: &Labels,
    ) -> Result<(), ActionError> {
        let argv = self.expand_argv(timestamp, message, labels);
        let Some((program, args)) = argv.split_first() else {
            return Err(ActionError::NoCommand);
        };

        info!(command = %argv.join(" "), "running command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ActionError::Spawn {
                program: program.clone(),
                source,
            })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(program = %program, stdout = %line, "command output");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            error!(program = %program, stderr = %line, "command output");
        }

        if !output.status.success() {
            return Err(ActionError::ExitStatus {
                program: program.clone(),
                code: output.status.code(),
            });
        }

        debug!(program = %program, "command completed");
        Ok(())
    }
}
