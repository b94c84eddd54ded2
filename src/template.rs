//! `${...}` placeholder expansion for action parameters.
//!
//! Supported tokens:
//! - `${values.ts}`: line timestamp, millisecond precision UTC
//! - `${values.message}`: raw line text
//! - `${values.message_escaped}`: line text in double quotes, inner quotes escaped
//! - `${labels.<name>}`: stream label value, left as-is when the label is absent
//!
//! Anything else is copied verbatim. Expansion is a single pass, so text
//! substituted from a log line is never expanded again.

use std::borrow::Cow;

use chrono::{DateTime, Utc};

use crate::model::Labels;

/// `strftime` layout for `${values.ts}`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

const OPEN: &str = "${";
const LABEL_PREFIX: &str = "labels.";

/// Expand every recognised token in `template`.
pub fn expand(
    template: &str,
    timestamp: DateTime<Utc>,
    message: &str,
    labels: &Labels,
) -> String {
    let mut out = String::with_capacity(template.len().saturating_add(message.len()));
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        let (before, from_open) = rest.split_at(start);
        out.push_str(before);
        let body = &from_open[OPEN.len()..];

        let close = body.find('}');
        let reopen = body.find(OPEN);

        match (close, reopen) {
            // "${a ${values.message}": the outer opener is plain text.
            (Some(c), Some(o)) if o < c => {
                out.push_str(OPEN);
                out.push_str(&body[..o]);
                rest = &body[o..];
            }
            (Some(c), _) => {
                let token = &body[..c];
                match resolve(token, timestamp, message, labels) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str(OPEN);
                        out.push_str(token);
                        out.push('}');
                    }
                }
                let after = &body[c..];
                rest = after.strip_prefix('}').unwrap_or(after);
            }
            (None, _) => {
                out.push_str(from_open);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Format a timestamp the way `${values.ts}` renders it.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Quote a message, backslash-escaping embedded double quotes.
pub fn escape_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len().saturating_add(2));
    out.push('"');
    out.push_str(&message.replace('"', "\\\""));
    out.push('"');
    out
}

fn resolve<'a>(
    token: &str,
    timestamp: DateTime<Utc>,
    message: &'a str,
    labels: &'a Labels,
) -> Option<Cow<'a, str>> {
    match token {
        "values.ts" => Some(Cow::Owned(format_timestamp(timestamp))),
        "values.message" => Some(Cow::Borrowed(message)),
        "values.message_escaped" => Some(Cow::Owned(escape_message(message))),
        _ => token
            .strip_prefix(LABEL_PREFIX)
            .and_then(|name| labels.get(name))
            .map(|value| Cow::Borrowed(value.as_str())),
    }
}
