pub mod cache;
pub mod client;
#[cfg(test)]
pub mod fake;
pub mod types;

pub use client::{HttpApi, RemoteApi, RemoteError};
pub use types::{Tenant, TenantStatus, Voter, Worker};
