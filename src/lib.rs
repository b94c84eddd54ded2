//! lokiactor: tails Loki log streams and reacts to matching lines.
//!
//! Each configured flow subscribes to one LogQL query over the Loki tail
//! websocket and runs its lines through an ordered list of regex triggers.
//! A firing trigger runs actions: external commands or chat webhook
//! notifications, optionally batched. Triggers can divert the lines that
//! follow them to a continuation action for a number of lines or a time
//! window.
//!
//! See `DESIGN.md` for the module layout.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod actions;
pub mod config;
pub mod daemon;
pub mod flows;
pub mod logging;
pub mod loki;
pub mod model;
pub mod template;
pub mod triggers;
