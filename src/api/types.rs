//! Entity snapshots as served by the campaign API.
//!
//! Only `id` is required. Everything else defaults when missing, and fields
//! this build does not know about are kept in `extra` so a cached record can
//! be re-served exactly as the remote sent it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::EntityId;

/// Candidate/party account that owns a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
  pub id: i64,
  #[serde(default)]
  pub candidate_name: String,
  #[serde(default)]
  pub party_name: Option<String>,
  #[serde(default)]
  pub constituency_name: String,
  #[serde(default)]
  pub constituency_number: Option<String>,
  #[serde(default)]
  pub status: TenantStatus,
  #[serde(default)]
  pub party_logo_url: Option<String>,
  #[serde(default)]
  pub candidate_photo_url: Option<String>,
  #[serde(rename = "_count", default, skip_serializing_if = "Option::is_none")]
  pub counts: Option<TenantCounts>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// The API reports tenant status either as a flag or as a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TenantStatus {
  Active(bool),
  Label(String),
}

impl Default for TenantStatus {
  fn default() -> Self {
    TenantStatus::Active(true)
  }
}

impl TenantStatus {
  pub fn as_index(&self) -> String {
    match self {
      TenantStatus::Active(true) => "active".to_string(),
      TenantStatus::Active(false) => "inactive".to_string(),
      TenantStatus::Label(label) => label.to_lowercase(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantCounts {
  #[serde(default)]
  pub users: u64,
  #[serde(default)]
  pub voters: u64,
  #[serde(default)]
  pub booths: u64,
}

/// Voter roll entry with denormalized booth/ward display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voter {
  pub id: i64,
  #[serde(default)]
  pub epic_number: String,
  #[serde(default)]
  pub full_name: String,
  #[serde(default)]
  pub gender: Option<String>,
  #[serde(default)]
  pub age: Option<u32>,
  #[serde(default)]
  pub mobile_number: Option<String>,
  #[serde(default)]
  pub ward: Option<String>,
  #[serde(default)]
  pub polling_station: Option<String>,
  #[serde(default)]
  pub is_visited: bool,
  #[serde(default)]
  pub has_voted: bool,
  #[serde(default = "default_support_level")]
  pub support_level: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

fn default_support_level() -> String {
  "UNMAPPED".to_string()
}

/// Field worker or sub-admin account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
  pub id: EntityId,
  #[serde(default)]
  pub tenant_id: Option<i64>,
  #[serde(default)]
  pub role_id: Option<i64>,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub mobile_number: String,
  #[serde(default)]
  pub status: bool,
  #[serde(rename = "_count", default, skip_serializing_if = "Option::is_none")]
  pub counts: Option<WorkerCounts>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCounts {
  #[serde(default)]
  pub booth_assignments: u64,
}

#[cfg(test)]
impl Voter {
  pub fn sample(id: i64, full_name: &str) -> Self {
    serde_json::from_value(serde_json::json!({ "id": id, "fullName": full_name })).unwrap()
  }
}

#[cfg(test)]
impl Tenant {
  pub fn sample(id: i64, candidate_name: &str) -> Self {
    serde_json::from_value(serde_json::json!({ "id": id, "candidateName": candidate_name }))
      .unwrap()
  }
}

#[cfg(test)]
impl Worker {
  pub fn sample(id: &str, name: &str) -> Self {
    serde_json::from_value(serde_json::json!({ "id": id, "name": name })).unwrap()
  }
}
