//! Shared types for the VIP link service and its RPC clients.

use serde::{Deserialize, Serialize};

// =====================================================
// Domain Types
// =====================================================

/// A chat-platform user account, the anchor identity for all linking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub id: i64,
    pub name: String,
    pub created_at: String,
    pub modified_at: String,
}

/// A billing-platform account, owned by at most one chat identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingIdentity {
    pub id: i64,
    pub external_id: String,
    pub chat_id: Option<i64>,
    pub created_at: String,
    pub modified_at: String,
}

/// A game-server player account. Exists independently of any chat identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerIdentity {
    pub id: i64,
    pub external_id: String,
    pub created_at: String,
    pub modified_at: String,
}

// =====================================================
// Linking Operation Results
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Created,
    Replaced,
    Unchanged,
}

/// Outcome of a link operation. `previous_owner` names the chat identity
/// that held the link before a replace, for display by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkReport {
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_owner: Option<String>,
}

impl LinkReport {
    pub fn created() -> Self {
        Self {
            status: LinkStatus::Created,
            previous_owner: None,
        }
    }

    pub fn replaced(previous_owner: String) -> Self {
        Self {
            status: LinkStatus::Replaced,
            previous_owner: Some(previous_owner),
        }
    }

    pub fn unchanged() -> Self {
        Self {
            status: LinkStatus::Unchanged,
            previous_owner: None,
        }
    }
}

/// Outcome of an unlink operation; `removed` carries the external id that
/// was unlinked, or None when there was nothing to remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlinkReport {
    pub removed: Option<String>,
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkPrimaryRequest {
    pub chat_name: String,
    pub player_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlinkPrimaryRequest {
    pub chat_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkSponsoredRequest {
    pub chat_name: String,
    pub player_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlinkSponsoredRequest {
    pub chat_name: String,
    pub player_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkBillingRequest {
    pub chat_name: String,
    pub billing_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlinkBillingRequest {
    pub chat_name: String,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Reconciliation Reports
// =====================================================

/// Per-player outcome of a pledge reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantReport {
    pub player_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =====================================================
// Service Status
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkStats {
    pub chat_identities: i64,
    pub billing_identities: i64,
    pub player_identities: i64,
    pub primary_links: i64,
    pub sponsored_links: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub chat_identities: i64,
    pub player_identities: i64,
}
