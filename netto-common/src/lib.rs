//! Wire protocol shared by the netto control process and the traffic filter.
//!
//! Both ends exchange newline-delimited JSON [`Frame`]s over a local stream
//! socket. The filter asks for decisions, the control process answers them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a flow relative to the local host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        };
        f.write_str(s)
    }
}

/// A flow the filter has intercepted and wants a verdict for.
///
/// Exists only for the duration of one arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub app_id: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
}

impl ConnectionRequest {
    pub fn new(
        app_id: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
        direction: Direction,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            remote_host: remote_host.into(),
            remote_port,
            direction,
            created_at: Utc::now(),
        }
    }
}

/// One message on the decision channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Control process -> filter: attach as the decision maker
    Register,
    /// Filter -> control process: registration outcome
    Registered { accepted: bool },
    /// Filter -> control process: verdict needed for a flow
    DecisionRequest { id: u64, request: ConnectionRequest },
    /// Control process -> filter: verdict for request `id`
    DecisionReply { id: u64, allowed: bool },
    /// Filter -> control process: diagnostic text for the control log
    ExtensionLog { message: String },
}

impl Frame {
    /// Encode as a single JSON line; the transport adds the delimiter
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode one line (with or without its trailing newline)
    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end_matches(['\r', '\n']))
    }
}
