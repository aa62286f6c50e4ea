//! Deferred mutations and their remote routes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::cache::EntityId;
use crate::store::Table;

/// Canvassing outcome recorded against a voter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupportLevel {
  Favorable,
  Neutral,
  Opposed,
  Unmapped,
}

impl SupportLevel {
  pub fn as_str(self) -> &'static str {
    match self {
      SupportLevel::Favorable => "FAVORABLE",
      SupportLevel::Neutral => "NEUTRAL",
      SupportLevel::Opposed => "OPPOSED",
      SupportLevel::Unmapped => "UNMAPPED",
    }
  }
}

impl std::str::FromStr for SupportLevel {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_uppercase().as_str() {
      "FAVORABLE" => Ok(SupportLevel::Favorable),
      "NEUTRAL" => Ok(SupportLevel::Neutral),
      "OPPOSED" => Ok(SupportLevel::Opposed),
      "UNMAPPED" => Ok(SupportLevel::Unmapped),
      other => Err(format!(
        "unknown support level '{}' (expected favorable, neutral, opposed or unmapped)",
        other
      )),
    }
  }
}

/// A user mutation waiting to be replayed against the remote.
///
/// Each variant maps to exactly one remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingAction {
  UpdateVoterStatus {
    #[serde(rename = "id")]
    voter_id: i64,
    status: SupportLevel,
  },
  MarkVoted {
    #[serde(rename = "id")]
    voter_id: i64,
    #[serde(rename = "hasVoted")]
    has_voted: bool,
  },
  SetTenantStatus {
    #[serde(rename = "id")]
    tenant_id: i64,
    active: bool,
  },
}

/// HTTP verb for a replayed action. Every current route is a PATCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMethod {
  Patch,
}

/// What to send for one replay.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
  pub method: RemoteMethod,
  pub path: String,
  pub body: Value,
}

impl PendingAction {
  /// Stable name stored beside the payload.
  pub fn kind(&self) -> &'static str {
    match self {
      PendingAction::UpdateVoterStatus { .. } => "UPDATE_VOTER_STATUS",
      PendingAction::MarkVoted { .. } => "MARK_VOTED",
      PendingAction::SetTenantStatus { .. } => "SET_TENANT_STATUS",
    }
  }

  /// The cached entity this action changes.
  pub fn target(&self) -> (Table, EntityId) {
    match self {
      PendingAction::UpdateVoterStatus { voter_id, .. }
      | PendingAction::MarkVoted { voter_id, .. } => (Table::Voters, EntityId::Num(*voter_id)),
      PendingAction::SetTenantStatus { tenant_id, .. } => {
        (Table::Tenants, EntityId::Num(*tenant_id))
      }
    }
  }

  pub fn request(&self) -> RemoteRequest {
    match self {
      PendingAction::UpdateVoterStatus { voter_id, status } => RemoteRequest {
        method: RemoteMethod::Patch,
        path: format!("/worker/voters/{}/status", voter_id),
        body: json!({ "status": status.as_str() }),
      },
      PendingAction::MarkVoted {
        voter_id,
        has_voted,
      } => RemoteRequest {
        method: RemoteMethod::Patch,
        path: format!("/worker/voters/{}/voted", voter_id),
        body: json!({ "hasVoted": has_voted }),
      },
      PendingAction::SetTenantStatus { tenant_id, active } => RemoteRequest {
        method: RemoteMethod::Patch,
        path: format!("/admin/tenants/{}/status", tenant_id),
        body: json!({ "status": active }),
      },
    }
  }
}

/// A pending action as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedAction {
  /// Monotonic, never reused
  pub seq: i64,
  pub action: PendingAction,
  pub created_at: DateTime<Utc>,
}

impl QueuedAction {
  /// Key sent with every replay attempt of this item, so the remote can
  /// discard duplicates when an earlier attempt's outcome was lost.
  pub fn idempotency_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.seq.to_be_bytes());
    hasher.update(self.created_at.timestamp_millis().to_be_bytes());
    hasher.update(self.action.kind().as_bytes());
    let request = self.action.request();
    hasher.update(request.path.as_bytes());
    hasher.update(request.body.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}
