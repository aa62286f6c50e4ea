//! Offline-first sync engine for field campaign workers.
//!
//! Collections (tenants, voters, workers) are served cache-first from a
//! local SQLite store and refreshed from the campaign API when the network
//! allows. Mutations made offline are queued and replayed in order once
//! connectivity returns.

pub mod api;
pub mod cache;
pub mod campaign;
pub mod config;
pub mod logging;
pub mod network;
pub mod queue;
pub mod store;

pub use campaign::CampaignSync;
