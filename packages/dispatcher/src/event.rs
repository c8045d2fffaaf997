use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// An event as it arrives from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Dotted event name, e.g. `Order.created`.
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Parse one line of newline-delimited JSON input. Blank lines yield `None`.
pub fn parse_event_line(line: &str) -> Result<Option<InboundEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Processes one event. An `Err` counts as a failed attempt.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()>;
}
