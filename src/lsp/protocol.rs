//! Custom protocol extensions and the client-notification seam.
//!
//! Beyond the standard LSP surface the server emits two custom
//! notifications, `groovy/statusUpdate` and `groovy/memoryUsage`, and
//! answers two custom requests, `groovy/getDecompiledContent` and
//! `groovy/getProtocolVersion`. The orchestrator components talk to the
//! editor through [`ClientSink`] so the core stays independent of the
//! transport and tests can record what would have been sent.

use serde::{Deserialize, Serialize};
use tower_lsp::Client;
use tower_lsp::lsp_types::notification::Notification;
use tower_lsp::lsp_types::{Diagnostic, MessageType, Url};

/// Server lifecycle states surfaced to the editor's status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusState {
    Importing,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateParams {
    pub state: StatusState,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsageParams {
    #[serde(rename = "usedMB")]
    pub used_mb: u64,
    #[serde(rename = "maxMB")]
    pub max_mb: u64,
    pub active_scopes: usize,
    pub evicted_scopes: usize,
    pub total_scopes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDecompiledContentParams {
    pub class_name: String,
}

pub enum StatusUpdate {}

impl Notification for StatusUpdate {
    type Params = StatusUpdateParams;
    const METHOD: &'static str = "groovy/statusUpdate";
}

pub enum MemoryUsage {}

impl Notification for MemoryUsage {
    type Params = MemoryUsageParams;
    const METHOD: &'static str = "groovy/memoryUsage";
}

/// Outbound editor traffic, abstracted for testability. Implementations must
/// be cheap to call from any task; sends may complete asynchronously.
pub trait ClientSink: Send + Sync + 'static {
    fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, version: Option<i32>);

    fn status_update(&self, state: StatusState, message: String);

    fn memory_usage(&self, params: MemoryUsageParams);

    /// A prominent, user-facing message (window/showMessage).
    fn show_message(&self, typ: MessageType, message: String);

    /// A log line for the editor's output channel (window/logMessage).
    fn log_message(&self, typ: MessageType, message: String);
}

/// Production sink forwarding to the `tower-lsp` client. Sends are spawned so
/// callers never await transport backpressure while holding scope locks.
pub struct TowerLspSink {
    client: Client,
}

impl TowerLspSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ClientSink for TowerLspSink {
    fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            client.publish_diagnostics(uri, diagnostics, version).await;
        });
    }

    fn status_update(&self, state: StatusState, message: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            client
                .send_notification::<StatusUpdate>(StatusUpdateParams { state, message })
                .await;
        });
    }

    fn memory_usage(&self, params: MemoryUsageParams) {
        let client = self.client.clone();
        tokio::spawn(async move {
            client.send_notification::<MemoryUsage>(params).await;
        });
    }

    fn show_message(&self, typ: MessageType, message: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            client.show_message(typ, message).await;
        });
    }

    fn log_message(&self, typ: MessageType, message: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            client.log_message(typ, message).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_methods_are_namespaced() {
        assert_eq!(StatusUpdate::METHOD, "groovy/statusUpdate");
        assert_eq!(MemoryUsage::METHOD, "groovy/memoryUsage");
    }

    #[test]
    fn status_params_serialize_camel_case() {
        let json = serde_json::to_value(StatusUpdateParams {
            state: StatusState::Importing,
            message: "resolving /p".to_string(),
        })
        .unwrap();
        assert_eq!(json["state"], "importing");
    }

    #[test]
    fn memory_params_round_trip() {
        let params = MemoryUsageParams {
            used_mb: 512,
            max_mb: 4096,
            active_scopes: 3,
            evicted_scopes: 1,
            total_scopes: 4,
        };
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json["usedMB"], 512);
        let back: MemoryUsageParams = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }
}
