//! Resolved, immutable definitions the flow engine runs from.
//!
//! Everything here is built once by [`crate::config`] at startup and then
//! only read. Flows, triggers and actions refer to each other by name; the
//! orchestrator turns action names into shared runtime instances.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use regex::Regex;

/// Stream-level labels attached to every line of a Loki stream group.
pub type Labels = HashMap<String, String>;

/// Network location of the Loki backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LokiTarget {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Use `wss` instead of `ws`.
    pub tls: bool,
}

/// One configured query together with its ordered trigger list.
#[derive(Debug, Clone)]
pub struct FlowDef {
    /// Flow name, unique within the configuration.
    pub name: String,
    /// LogQL query streamed from the tail endpoint.
    pub query: String,
    /// Triggers in evaluation order.
    pub triggers: Vec<TriggerDef>,
}

/// A pattern rule inside a flow.
#[derive(Debug, Clone)]
pub struct TriggerDef {
    /// Trigger name, used in logs.
    pub name: String,
    /// A line must match this to select the trigger.
    pub pattern: Regex,
    /// A matching line is skipped if it also matches this.
    pub ignore: Option<Regex>,
    /// Optional multi-line follow-up.
    pub continuation: Option<ContinuationDef>,
    /// Names of the actions run, in order, when the trigger fires.
    pub actions: Vec<String>,
}

/// Diverts the lines following a trigger to a dedicated action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationDef {
    /// How long the continuation lasts.
    pub extent: Extent,
    /// Name of the action fed with the continued lines.
    pub action: String,
}

/// How long a continuation stays active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// A fixed number of lines, counting the triggering line.
    Lines(usize),
    /// A wall-clock window starting once the trigger's actions have run.
    Duration(Duration),
}

/// A fully resolved action definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionDef {
    /// Run an external process.
    Command(CommandDef),
    /// Post to a chat webhook.
    Notify(NotifyDef),
}

impl ActionDef {
    /// Short kind name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Notify(_) => "notify",
        }
    }
}

/// External process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDef {
    /// Argument vector templates; the first expands to the program.
    pub argv: Vec<String>,
}

/// Chat webhook notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyDef {
    /// Webhook endpoint receiving `{"text": ...}` posts.
    pub webhook_url: String,
    /// Per-request client timeout.
    pub timeout: Duration,
    /// Template expanded into the message text.
    pub message_template: String,
    /// When set, messages are batched by a background actor.
    pub batch: Option<BatchDef>,
}

/// Batching parameters for a notify action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDef {
    /// Flush once this many messages are buffered.
    pub max_count: usize,
    /// Text placed before the first message of every batch.
    pub prefix: String,
    /// Text placed after the last message of every batch.
    pub suffix: String,
}

/// Everything the daemon needs, already validated.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Loki backend location.
    pub loki: LokiTarget,
    /// Concrete actions by name.
    pub actions: BTreeMap<String, ActionDef>,
    /// Concrete flows, sorted by name.
    pub flows: Vec<FlowDef>,
    /// Upper bound on the graceful shutdown wait.
    pub shutdown_timeout: Duration,
}
