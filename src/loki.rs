//! Loki tail endpoint: URL construction, websocket connect, frame decoding.
//!
//! The tail API pushes JSON text frames shaped like
//! `{"streams":[{"stream":{..labels..},"values":[["<ns>","<line>"],..]}]}`.

use std::fmt;
use std::num::ParseIntError;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::model::{Labels, LokiTarget};

/// Path of the streaming query endpoint.
pub const TAIL_PATH: &str = "/loki/api/v1/tail";

/// An open tail subscription.
pub type TailStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Failures talking to the tail endpoint. All of them lead to a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The tail URL could not be built.
    #[error("invalid tail url: {0}")]
    Url(#[from] url::ParseError),

    /// The websocket handshake failed.
    #[error("failed to connect to loki stream: {0}")]
    Connect(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    /// Reading the next frame failed.
    #[error("failed to read from loki stream: {0}")]
    Read(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    /// The server closed the stream.
    #[error("loki stream closed by server")]
    Closed,
}

/// Build the tail URL for `query`, replaying from `start`.
///
/// # Errors
///
/// Returns [`StreamError::Url`] if the host does not form a valid URL.
pub fn tail_url(target: &LokiTarget, query: &str, start: SystemTime) -> Result<Url, StreamError> {
    let scheme = if target.tls { "wss" } else { "ws" };
    let mut url = Url::parse(&format!(
        "{scheme}://{}:{}{TAIL_PATH}",
        target.host, target.port
    ))?;

    // A start before the epoch can only come from a broken clock; clamp it.
    let start_ns = start
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    url.query_pairs_mut()
        .append_pair("query", query)
        .append_pair("start", &start_ns.to_string());

    Ok(url)
}

/// Open a websocket subscription to `url`.
///
/// # Errors
///
/// Returns [`StreamError::Connect`] when the TCP connect or the upgrade fails,
/// including a non-101 response.
pub async fn connect(url: &Url) -> Result<TailStream, StreamError> {
    let (stream, _response) =
        tokio_tungstenite::connect_async_with_config(url.as_str(), Some(tail_config()), false)
            .await
            .map_err(|e| StreamError::Connect(Box::new(e)))?;
    Ok(stream)
}

/// Websocket settings for a tail subscription.
///
/// Loki batches every line of a push into one frame, so no size cap is
/// applied to frames or messages.
fn tail_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(None)
        .max_frame_size(None)
}

/// One decoded tail frame.
#[derive(Debug, Default, Deserialize)]
pub struct TailFrame {
    /// Stream groups in arrival order.
    #[serde(default)]
    pub streams: Vec<StreamGroup>,

    /// Entries the server dropped because the client fell behind.
    #[serde(default)]
    pub dropped_entries: Vec<DroppedEntry>,
}

/// Lines sharing one label set.
#[derive(Debug, Deserialize)]
pub struct StreamGroup {
    /// Stream labels.
    #[serde(rename = "stream", default)]
    pub labels: Labels,

    /// Entries in arrival order.
    #[serde(default)]
    pub values: Vec<RawEntry>,
}

/// A `[timestamp, line, ..]` entry as sent on the wire.
///
/// Newer Loki versions append structured metadata as a third element; it is
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// Nanoseconds since the epoch, as a decimal string.
    pub timestamp: String,
    /// Log line text.
    pub line: String,
}

impl RawEntry {
    /// Parse the nanosecond timestamp.
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for non-numeric timestamps.
    pub fn parse_timestamp(&self) -> Result<DateTime<Utc>, ParseIntError> {
        let nanos: i64 = self.timestamp.parse()?;
        Ok(DateTime::from_timestamp_nanos(nanos))
    }
}

impl<'de> Deserialize<'de> for RawEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = RawEntry;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [timestamp, line] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RawEntry, A::Error> {
                let timestamp: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let line: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(RawEntry { timestamp, line })
            }
        }

        deserializer.deserialize_seq(EntryVisitor)
    }
}

/// A line the server reported as dropped.
#[derive(Debug, Deserialize)]
pub struct DroppedEntry {
    /// Labels of the stream the line belonged to.
    #[serde(default)]
    pub labels: Labels,
    /// Nanosecond timestamp of the dropped line.
    #[serde(default)]
    pub timestamp: String,
}

/// Decode a text frame.
///
/// # Errors
///
/// Returns the JSON error for malformed frames.
pub fn decode_frame(payload: &str) -> Result<TailFrame, serde_json::Error> {
    serde_json::from_str(payload)
}
