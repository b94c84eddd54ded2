//! Configuration loading for lokiactor.
//!
//! The file is TOML with four sections: `[loki]`, `[daemon]`, `[actions.*]`
//! and `[flows.*]`. Actions and flows may be `abstract` and may `extends`
//! another definition of the same kind. Loading parses the raw file,
//! resolves inheritance, drops abstract entries and validates the rest into
//! a [`ResolvedConfig`]. Every problem is reported before any flow starts.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use regex::Regex;
use serde::Deserialize;

use crate::model::{
    ActionDef, BatchDef, CommandDef, ContinuationDef, Extent, FlowDef, LokiTarget, NotifyDef,
    ResolvedConfig, TriggerDef,
};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "lokiactor.toml";

/// Top-level file layout, before inheritance is resolved.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Loki backend location.
    pub loki: LokiConfig,

    /// Process-level settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Action definitions by name.
    #[serde(default)]
    pub actions: BTreeMap<String, RawAction>,

    /// Flow definitions by name.
    #[serde(default)]
    pub flows: BTreeMap<String, RawFlow>,
}

/// `[loki]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LokiConfig {
    /// Hostname or IP address.
    pub host: String,

    /// TCP port.
    pub port: u16,

    /// Connect with `wss` instead of `ws`.
    #[serde(default)]
    pub tls: bool,
}

/// `[daemon]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Upper bound on the graceful shutdown wait.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// Action kind selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Run an external process.
    Command,
    /// Post to a chat webhook.
    Notify,
}

/// One `[actions.NAME]` entry. Every field is optional so that partial
/// definitions can be completed through `extends`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawAction {
    /// Action kind.
    #[serde(rename = "type")]
    pub kind: Option<ActionKind>,

    /// Template-only definition, removed after resolution.
    #[serde(rename = "abstract", default)]
    pub is_abstract: bool,

    /// Name of the action this one inherits from.
    pub extends: Option<String>,

    /// Webhook URL for notify actions.
    pub webhook_url: Option<String>,

    /// Environment variable holding the webhook URL.
    pub webhook_url_env: Option<String>,

    /// Per-request timeout for notify actions.
    pub timeout_secs: Option<u64>,

    /// Notification text template.
    pub message_template: Option<String>,

    /// Batching parameters for notify actions.
    pub batch: Option<RawBatch>,

    /// Argument vector templates for command actions.
    pub run: Option<Vec<String>>,
}

/// `batch = { ... }` table of a notify action.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBatch {
    /// Flush once this many messages are buffered.
    pub max_count: usize,

    /// Text placed before every batch.
    #[serde(default)]
    pub prefix: String,

    /// Text placed after every batch.
    #[serde(default)]
    pub suffix: String,
}

/// One `[flows.NAME]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFlow {
    /// Template-only definition, removed after resolution.
    #[serde(rename = "abstract", default)]
    pub is_abstract: bool,

    /// Name of the flow this one inherits from.
    pub extends: Option<String>,

    /// LogQL query.
    pub query: Option<String>,

    /// Triggers in evaluation order. Inherited as a whole list.
    pub triggers: Option<Vec<RawTrigger>>,
}

/// One `[[flows.NAME.triggers]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTrigger {
    /// Name used in logs. Defaults to `FLOW#INDEX`.
    pub name: Option<String>,

    /// Pattern a line must match.
    pub regex: Option<String>,

    /// Pattern that vetoes a match.
    pub ignore_regex: Option<String>,

    /// Actions run when the trigger fires.
    #[serde(default)]
    pub actions: Vec<String>,

    /// Continuation length in lines, counting the triggering line.
    pub lines: Option<usize>,

    /// Continuation window in milliseconds.
    pub duration_ms: Option<u64>,

    /// Action fed during the continuation. Defaults to the first action.
    pub continuation_action: Option<String>,
}

/// Definitions that can inherit from a base of the same kind.
trait Inherit: Clone {
    fn base(&self) -> Option<&str>;

    /// Fill unset fields from `base` and clear the `extends` edge.
    fn inherit_from(&mut self, base: &Self);
}

impl Inherit for RawAction {
    fn base(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    fn inherit_from(&mut self, base: &Self) {
        self.extends = None;
        self.kind = self.kind.or(base.kind);
        // The URL and its env indirection are one setting.
        if self.webhook_url.is_none() && self.webhook_url_env.is_none() {
            self.webhook_url.clone_from(&base.webhook_url);
            self.webhook_url_env.clone_from(&base.webhook_url_env);
        }
        self.timeout_secs = self.timeout_secs.or(base.timeout_secs);
        if self.message_template.is_none() {
            self.message_template.clone_from(&base.message_template);
        }
        if self.batch.is_none() {
            self.batch.clone_from(&base.batch);
        }
        if self.run.is_none() {
            self.run.clone_from(&base.run);
        }
    }
}

impl Inherit for RawFlow {
    fn base(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    fn inherit_from(&mut self, base: &Self) {
        self.extends = None;
        if self.query.is_none() {
            self.query.clone_from(&base.query);
        }
        if self.triggers.is_none() {
            self.triggers.clone_from(&base.triggers);
        }
    }
}

/// Merge every definition with its `extends` chain.
///
/// Each pass merges the definitions whose base has no pending `extends`
/// itself. A pass without progress means the remaining ones form or hang
/// off a cycle.
fn resolve_extends<T: Inherit>(kind: &str, defs: &mut BTreeMap<String, T>) -> anyhow::Result<()> {
    for (name, def) in defs.iter() {
        if let Some(base) = def.base() {
            ensure!(
                defs.contains_key(base),
                "{kind} {name} extends unknown {kind} {base}"
            );
        }
    }

    loop {
        let pending: Vec<String> = defs
            .iter()
            .filter(|(_, def)| def.base().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut progressed = false;
        for name in &pending {
            let Some(base_name) = defs.get(name).and_then(|def| def.base()).map(str::to_owned)
            else {
                continue;
            };
            let Some(base) = defs.get(&base_name).cloned() else {
                bail!("{kind} {name} extends unknown {kind} {base_name}");
            };
            if base.base().is_some() {
                continue;
            }
            if let Some(def) = defs.get_mut(name) {
                def.inherit_from(&base);
                progressed = true;
            }
        }

        if !progressed {
            bail!(
                "{kind} inheritance cycle involving: {}",
                pending.join(", ")
            );
        }
    }
}

fn build_action_def(
    name: &str,
    raw: &RawAction,
    env: &dyn Fn(&str) -> Option<String>,
) -> anyhow::Result<ActionDef> {
    let Some(kind) = raw.kind else {
        bail!("action {name} has no type");
    };

    match kind {
        ActionKind::Command => {
            let argv = raw
                .run
                .clone()
                .with_context(|| format!("command action {name} has no run"))?;
            ensure!(!argv.is_empty(), "command action {name} has an empty run");
            Ok(ActionDef::Command(CommandDef { argv }))
        }
        ActionKind::Notify => {
            let webhook_url = match (&raw.webhook_url, &raw.webhook_url_env) {
                (Some(url), None) => url.clone(),
                (None, Some(var)) => env(var.as_str()).with_context(|| {
                    format!("notify action {name}: environment variable {var} is not set")
                })?,
                (Some(_), Some(_)) => {
                    bail!("notify action {name} sets both webhook_url and webhook_url_env")
                }
                (None, None) => bail!("notify action {name} has no webhook_url"),
            };
            ensure!(
                !webhook_url.trim().is_empty(),
                "notify action {name} has an empty webhook_url"
            );

            let message_template = raw
                .message_template
                .clone()
                .with_context(|| format!("notify action {name} has no message_template"))?;

            let timeout_secs = raw.timeout_secs.unwrap_or_else(default_timeout_secs);
            ensure!(timeout_secs > 0, "notify action {name}: timeout_secs must be > 0");

            let batch = raw
                .batch
                .as_ref()
                .map(|b| -> anyhow::Result<BatchDef> {
                    ensure!(
                        b.max_count >= 1,
                        "notify action {name}: batch.max_count must be >= 1"
                    );
                    Ok(BatchDef {
                        max_count: b.max_count,
                        prefix: b.prefix.clone(),
                        suffix: b.suffix.clone(),
                    })
                })
                .transpose()?;

            Ok(ActionDef::Notify(NotifyDef {
                webhook_url,
                timeout: Duration::from_secs(timeout_secs),
                message_template,
                batch,
            }))
        }
    }
}

fn compile(flow: &str, trigger: &str, field: &str, pattern: &str) -> anyhow::Result<Regex> {
    Regex::new(pattern)
        .with_context(|| format!("flow {flow} trigger {trigger}: invalid {field} {pattern:?}"))
}

fn build_trigger_def(
    flow: &str,
    index: usize,
    raw: &RawTrigger,
    actions: &BTreeMap<String, ActionDef>,
) -> anyhow::Result<TriggerDef> {
    let name = raw
        .name
        .clone()
        .unwrap_or_else(|| format!("{flow}#{index}"));

    let Some(regex) = &raw.regex else {
        bail!("flow {flow} trigger {name} has no regex");
    };
    let pattern = compile(flow, &name, "regex", regex)?;
    let ignore = raw
        .ignore_regex
        .as_deref()
        .map(|p| compile(flow, &name, "ignore_regex", p))
        .transpose()?;

    ensure!(
        !raw.actions.is_empty(),
        "flow {flow} trigger {name} has no actions"
    );
    let known = |action: &str| -> anyhow::Result<()> {
        ensure!(
            actions.contains_key(action),
            "flow {flow} trigger {name} references unknown or abstract action {action}"
        );
        Ok(())
    };
    for action in &raw.actions {
        known(action)?;
    }

    let extent = match (raw.lines, raw.duration_ms) {
        (Some(_), Some(_)) => {
            bail!("flow {flow} trigger {name} sets both lines and duration_ms")
        }
        (Some(lines), None) => {
            ensure!(lines > 0, "flow {flow} trigger {name}: lines must be > 0");
            Some(Extent::Lines(lines))
        }
        (None, Some(ms)) => {
            ensure!(ms > 0, "flow {flow} trigger {name}: duration_ms must be > 0");
            Some(Extent::Duration(Duration::from_millis(ms)))
        }
        (None, None) => None,
    };

    let continuation = match extent {
        Some(extent) => {
            let action = match &raw.continuation_action {
                Some(action) => action.clone(),
                None => raw.actions.first().cloned().unwrap_or_default(),
            };
            known(&action)?;
            Some(ContinuationDef { extent, action })
        }
        None => {
            ensure!(
                raw.continuation_action.is_none(),
                "flow {flow} trigger {name} sets continuation_action without lines or duration_ms"
            );
            None
        }
    };

    Ok(TriggerDef {
        name,
        pattern,
        ignore,
        continuation,
        actions: raw.actions.clone(),
    })
}

fn build_flow_def(
    name: &str,
    raw: &RawFlow,
    actions: &BTreeMap<String, ActionDef>,
) -> anyhow::Result<FlowDef> {
    let query = raw
        .query
        .clone()
        .with_context(|| format!("flow {name} has no query"))?;
    ensure!(!query.trim().is_empty(), "flow {name} has an empty query");

    let raw_triggers = raw.triggers.as_deref().unwrap_or_default();
    ensure!(!raw_triggers.is_empty(), "flow {name} has no triggers");

    let triggers = raw_triggers
        .iter()
        .enumerate()
        .map(|(index, trigger)| build_trigger_def(name, index, trigger, actions))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(FlowDef {
        name: name.to_owned(),
        query,
        triggers,
    })
}

impl RawConfig {
    /// Resolve inheritance and validate everything into a [`ResolvedConfig`].
    ///
    /// `env` looks up environment variables for `webhook_url_env`.
    ///
    /// # Errors
    ///
    /// Returns the first resolution or validation problem found.
    pub fn resolve(self, env: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<ResolvedConfig> {
        let Self {
            loki,
            daemon,
            mut actions,
            mut flows,
        } = self;

        ensure!(!loki.host.trim().is_empty(), "loki.host must not be empty");
        ensure!(loki.port > 0, "loki.port must be > 0");

        resolve_extends("action", &mut actions)?;
        resolve_extends("flow", &mut flows)?;

        let actions = actions
            .iter()
            .filter(|(_, raw)| !raw.is_abstract)
            .map(|(name, raw)| Ok((name.clone(), build_action_def(name, raw, env)?)))
            .collect::<anyhow::Result<BTreeMap<_, _>>>()?;

        // BTreeMap iteration keeps flows sorted by name.
        let flows = flows
            .iter()
            .filter(|(_, raw)| !raw.is_abstract)
            .map(|(name, raw)| build_flow_def(name, raw, &actions))
            .collect::<anyhow::Result<Vec<_>>>()?;
        ensure!(!flows.is_empty(), "no concrete flows configured");

        Ok(ResolvedConfig {
            loki: LokiTarget {
                host: loki.host,
                port: loki.port,
                tls: loki.tls,
            },
            actions,
            flows,
            shutdown_timeout: Duration::from_secs(daemon.shutdown_timeout_secs),
        })
    }
}

/// Parse and resolve configuration text, reading `webhook_url_env`
/// variables from the process environment.
///
/// # Errors
///
/// Returns an error if the text is not valid TOML for this layout or fails
/// resolution.
pub fn parse_config(contents: &str) -> anyhow::Result<ResolvedConfig> {
    let raw: RawConfig = toml::from_str(contents).context("failed to parse config")?;
    raw.resolve(&|var: &str| std::env::var(var).ok())
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<ResolvedConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config at {}", path.display()))
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    10
}
