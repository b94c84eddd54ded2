//! Ordered trigger evaluation and multi-line continuations for one flow.
//!
//! A [`Matcher`] is owned by exactly one flow runner and sees that flow's
//! lines one at a time, in order. While a continuation is active every line
//! goes to the continuation action instead of the trigger table; once the
//! extent is used up the next line is matched normally again.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::actions::{Action, ActionRegistry};
use crate::model::{Extent, Labels, TriggerDef};

/// Follow-up applied to the lines after a trigger fires.
#[derive(Debug, Clone)]
pub struct Continuation {
    /// Lines or time window covered, including the triggering line.
    pub extent: Extent,
    /// Action fed with every covered line.
    pub action: Arc<dyn Action>,
}

/// A runtime trigger with its actions resolved.
#[derive(Debug, Clone)]
pub struct Trigger {
    name: String,
    pattern: Regex,
    ignore: Option<Regex>,
    actions: Vec<Arc<dyn Action>>,
    continuation: Option<Continuation>,
}

impl Trigger {
    /// Create a trigger running `actions` for lines matching `pattern`.
    pub fn new(name: impl Into<String>, pattern: Regex, actions: Vec<Arc<dyn Action>>) -> Self {
        Self {
            name: name.into(),
            pattern,
            ignore: None,
            actions,
            continuation: None,
        }
    }

    /// Skip lines that also match `ignore`.
    #[must_use]
    pub fn with_ignore(mut self, ignore: Regex) -> Self {
        self.ignore = Some(ignore);
        self
    }

    /// Start a continuation whenever this trigger fires.
    #[must_use]
    pub fn with_continuation(mut self, extent: Extent, action: Arc<dyn Action>) -> Self {
        self.continuation = Some(Continuation { extent, action });
        self
    }

    /// Resolve a trigger definition against the shared action instances.
    ///
    /// # Errors
    ///
    /// Fails if an action name has no instance in `registry`.
    pub fn from_def(def: &TriggerDef, registry: &ActionRegistry) -> anyhow::Result<Self> {
        let lookup = |name: &str| {
            registry
                .get(name)
                .with_context(|| format!("trigger {} references unknown action {name}", def.name))
        };

        let actions = def
            .actions
            .iter()
            .map(|name| lookup(name))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let continuation = def
            .continuation
            .as_ref()
            .map(|c| {
                lookup(&c.action).map(|action| Continuation {
                    extent: c.extent,
                    action,
                })
            })
            .transpose()?;

        Ok(Self {
            name: def.name.clone(),
            pattern: def.pattern.clone(),
            ignore: def.ignore.clone(),
            actions,
            continuation,
        })
    }

    /// Trigger name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What the matcher did with a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// No trigger selected the line.
    NoMatch,
    /// The named trigger fired.
    Fired(String),
    /// The line went to an active continuation.
    Continued,
}

enum Remaining {
    Lines(usize),
    Until(Instant),
    /// The window does not fit on the clock.
    Unbounded,
}

enum State {
    Idle,
    Continuing {
        remaining: Remaining,
        action: Arc<dyn Action>,
    },
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Continuing {
                remaining: Remaining::Lines(n),
                ..
            } => write!(f, "Continuing({n} lines)"),
            Self::Continuing {
                remaining: Remaining::Until(deadline),
                ..
            } => write!(f, "Continuing(until {deadline:?})"),
            Self::Continuing {
                remaining: Remaining::Unbounded,
                ..
            } => f.write_str("Continuing(unbounded)"),
        }
    }
}

/// Per-flow trigger state machine.
#[derive(Debug)]
pub struct Matcher {
    flow: String,
    triggers: Vec<Trigger>,
    state: State,
}

impl Matcher {
    /// Create an idle matcher over `triggers`, evaluated in order.
    pub fn new(flow: impl Into<String>, triggers: Vec<Trigger>) -> Self {
        Self {
            flow: flow.into(),
            triggers,
            state: State::Idle,
        }
    }

    /// Whether a continuation is currently active.
    pub fn is_continuing(&self) -> bool {
        matches!(self.state, State::Continuing { .. })
    }

    /// Feed one line through the state machine.
    ///
    /// Action failures are logged; they never stop the remaining actions or
    /// change the state transition.
    pub async fn process_line(
        &mut self,
        timestamp: DateTime<Utc>,
        message: &str,
        labels: &Labels,
    ) -> LineOutcome {
        if let State::Continuing { remaining, action } = &mut self.state {
            let exhausted = match remaining {
                Remaining::Lines(left) => *left == 0,
                Remaining::Until(deadline) => Instant::now() >= *deadline,
                Remaining::Unbounded => false,
            };

            if exhausted {
                debug!(flow = %self.flow, "continuation finished");
                self.state = State::Idle;
            } else {
                if let Remaining::Lines(left) = remaining {
                    *left = left.saturating_sub(1);
                }
                let action = Arc::clone(action);
                if let Err(e) = action.execute(timestamp, message, labels).await {
                    error!(flow = %self.flow, error = %e, "continuation action failed");
                }
                return LineOutcome::Continued;
            }
        }

        let mut selected = None;
        for trigger in &self.triggers {
            if !trigger.pattern.is_match(message) {
                continue;
            }
            if trigger
                .ignore
                .as_ref()
                .is_some_and(|ignore| ignore.is_match(message))
            {
                debug!(flow = %self.flow, trigger = %trigger.name, "trigger ignored");
                continue;
            }
            selected = Some(trigger);
            break;
        }

        let Some(trigger) = selected else {
            return LineOutcome::NoMatch;
        };

        debug!(flow = %self.flow, trigger = %trigger.name, message, "trigger matched");

        for action in &trigger.actions {
            if let Err(e) = action.execute(timestamp, message, labels).await {
                error!(
                    flow = %self.flow,
                    trigger = %trigger.name,
                    error = %e,
                    "action failed"
                );
            }
        }

        if let Some(continuation) = &trigger.continuation {
            if let Err(e) = continuation
                .action
                .execute(timestamp, message, labels)
                .await
            {
                error!(
                    flow = %self.flow,
                    trigger = %trigger.name,
                    error = %e,
                    "continuation action failed"
                );
            }

            // The window starts once the actions above have finished.
            let remaining = match continuation.extent {
                Extent::Lines(lines) => Remaining::Lines(lines.saturating_sub(1)),
                Extent::Duration(window) => Instant::now()
                    .checked_add(window)
                    .map_or(Remaining::Unbounded, Remaining::Until),
            };
            debug!(
                flow = %self.flow,
                trigger = %trigger.name,
                extent = ?continuation.extent,
                "continuation started"
            );
            self.state = State::Continuing {
                remaining,
                action: Arc::clone(&continuation.action),
            };
        }

        LineOutcome::Fired(trigger.name.clone())
    }
}
