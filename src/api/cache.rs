//! Caching implementations for campaign types.

use crate::cache::{Entity, EntityId, IndexValues};
use crate::store::Table;

use super::types::{Tenant, Voter, Worker};

impl Entity for Tenant {
  const TABLE: Table = Table::Tenants;

  fn id(&self) -> EntityId {
    EntityId::Num(self.id)
  }

  fn index_values(&self) -> IndexValues<'_> {
    IndexValues {
      name: Some(&self.candidate_name),
      // Tenants have no mobile number of their own
      mobile_number: None,
      status: Some(self.status.as_index()),
    }
  }
}

impl Entity for Voter {
  const TABLE: Table = Table::Voters;

  fn id(&self) -> EntityId {
    EntityId::Num(self.id)
  }

  fn index_values(&self) -> IndexValues<'_> {
    IndexValues {
      name: Some(&self.full_name),
      mobile_number: self.mobile_number.as_deref(),
      status: Some(self.support_level.clone()),
    }
  }
}

impl Entity for Worker {
  const TABLE: Table = Table::Workers;

  fn id(&self) -> EntityId {
    self.id.clone()
  }

  fn index_values(&self) -> IndexValues<'_> {
    IndexValues {
      name: Some(&self.name),
      mobile_number: Some(&self.mobile_number),
      status: Some(if self.status { "active" } else { "inactive" }.to_string()),
    }
  }
}
