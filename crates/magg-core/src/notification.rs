//! Notification envelopes flowing from backends to client sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of asynchronous notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ToolsChanged,
    ResourcesChanged,
    PromptsChanged,
    ResourceUpdated,
    Progress,
    Log,
    Cancelled,
}

impl NotificationKind {
    /// The MCP method name this kind travels under.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::ToolsChanged => "notifications/tools/list_changed",
            Self::ResourcesChanged => "notifications/resources/list_changed",
            Self::PromptsChanged => "notifications/prompts/list_changed",
            Self::ResourceUpdated => "notifications/resources/updated",
            Self::Progress => "notifications/progress",
            Self::Log => "notifications/message",
            Self::Cancelled => "notifications/cancelled",
        }
    }

    /// Map an MCP method name to a kind.
    #[must_use]
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "notifications/tools/list_changed" => Some(Self::ToolsChanged),
            "notifications/resources/list_changed" => Some(Self::ResourcesChanged),
            "notifications/prompts/list_changed" => Some(Self::PromptsChanged),
            "notifications/resources/updated" => Some(Self::ResourceUpdated),
            "notifications/progress" => Some(Self::Progress),
            "notifications/message" => Some(Self::Log),
            "notifications/cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// List-change kinds are idempotent and eligible for coalescing; a
    /// later one supersedes an earlier one.
    #[must_use]
    pub const fn is_list_change(self) -> bool {
        matches!(
            self,
            Self::ToolsChanged | Self::ResourcesChanged | Self::PromptsChanged
        )
    }

    /// Targeted kinds are delivered 1:1 and never dropped.
    #[must_use]
    pub const fn is_targeted(self) -> bool {
        matches!(self, Self::ResourceUpdated | Self::Progress | Self::Cancelled)
    }
}

/// A notification received from (or synthesized on behalf of) a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Name of the backend that emitted this, or the self-prefix for
    /// synthetic notifications the aggregator emits itself.
    pub source_server: String,

    pub kind: NotificationKind,

    /// The notification's `params` payload, passed through verbatim.
    pub payload: serde_json::Value,

    pub received_at: DateTime<Utc>,
}

impl NotificationEnvelope {
    pub fn new(
        source_server: impl Into<String>,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source_server: source_server.into(),
            kind,
            payload,
            received_at: Utc::now(),
        }
    }

    /// Digest over `(kind, payload)` used to drop identical duplicates
    /// within a coalesce window.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.method().as_bytes());
        hasher.update(self.payload.to_string().as_bytes());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_mapping_roundtrips() {
        for kind in [
            NotificationKind::ToolsChanged,
            NotificationKind::ResourcesChanged,
            NotificationKind::PromptsChanged,
            NotificationKind::ResourceUpdated,
            NotificationKind::Progress,
            NotificationKind::Log,
            NotificationKind::Cancelled,
        ] {
            assert_eq!(NotificationKind::from_method(kind.method()), Some(kind));
        }
        assert_eq!(NotificationKind::from_method("notifications/unknown"), None);
    }

    #[test]
    fn classification() {
        assert!(NotificationKind::ToolsChanged.is_list_change());
        assert!(!NotificationKind::ToolsChanged.is_targeted());
        assert!(NotificationKind::Progress.is_targeted());
        assert!(NotificationKind::ResourceUpdated.is_targeted());
        assert!(NotificationKind::Cancelled.is_targeted());
        assert!(!NotificationKind::Cancelled.is_list_change());
        assert!(!NotificationKind::Log.is_list_change());
        assert!(!NotificationKind::Log.is_targeted());
    }

    #[test]
    fn identical_payloads_share_a_digest() {
        let a = NotificationEnvelope::new("s", NotificationKind::Log, json!({"level": "info"}));
        let b = NotificationEnvelope::new("s", NotificationKind::Log, json!({"level": "info"}));
        assert_eq!(a.digest(), b.digest());

        let c = NotificationEnvelope::new("s", NotificationKind::Log, json!({"level": "warn"}));
        assert_ne!(a.digest(), c.digest());
    }
}
