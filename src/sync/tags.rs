//! Sync-tag catalogue.
//!
//! This is the one place the entity list lives. The coordinator, the queue and
//! UI code (via `GET /__ocusync/sync/tags`) all read it from here; adding an
//! entity means adding a variant and bumping [`CATALOGUE_VERSION`].

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version of the entity catalogue contract.
pub const CATALOGUE_VERSION: u32 = 1;

/// Tag for the catch-all channel.
pub const GENERIC_TAG: &str = "background-sync";

const ENTITY_TAG_PREFIX: &str = "sync-";

/// Business entities that can be resynchronized on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Entity {
  Patients,
  Appointments,
  Prescriptions,
  Exams,
  Users,
  Visits,
  LabOrders,
  LabResults,
  Invoices,
  Queue,
  PharmacyInventory,
  OrthopticExams,
  GlassesOrders,
  FrameInventory,
  ContactLensInventory,
  Clinics,
  Approvals,
  StockReconciliations,
}

impl Entity {
  pub const ALL: [Entity; 18] = [
    Entity::Patients,
    Entity::Appointments,
    Entity::Prescriptions,
    Entity::Exams,
    Entity::Users,
    Entity::Visits,
    Entity::LabOrders,
    Entity::LabResults,
    Entity::Invoices,
    Entity::Queue,
    Entity::PharmacyInventory,
    Entity::OrthopticExams,
    Entity::GlassesOrders,
    Entity::FrameInventory,
    Entity::ContactLensInventory,
    Entity::Clinics,
    Entity::Approvals,
    Entity::StockReconciliations,
  ];

  /// Wire name, as UI code spells it.
  pub fn name(&self) -> &'static str {
    match self {
      Self::Patients => "patients",
      Self::Appointments => "appointments",
      Self::Prescriptions => "prescriptions",
      Self::Exams => "exams",
      Self::Users => "users",
      Self::Visits => "visits",
      Self::LabOrders => "labOrders",
      Self::LabResults => "labResults",
      Self::Invoices => "invoices",
      Self::Queue => "queue",
      Self::PharmacyInventory => "pharmacyInventory",
      Self::OrthopticExams => "orthopticExams",
      Self::GlassesOrders => "glassesOrders",
      Self::FrameInventory => "frameInventory",
      Self::ContactLensInventory => "contactLensInventory",
      Self::Clinics => "clinics",
      Self::Approvals => "approvals",
      Self::StockReconciliations => "stockReconciliations",
    }
  }
}

impl fmt::Display for Entity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Entity {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    Entity::ALL
      .into_iter()
      .find(|e| e.name() == s)
      .ok_or_else(|| eyre!("Unknown entity '{}'", s))
  }
}

/// A sync channel: the whole queue, or one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SyncTag {
  Generic,
  Entity(Entity),
}

impl SyncTag {
  /// Every tag in the catalogue, generic first.
  pub fn all() -> Vec<SyncTag> {
    std::iter::once(SyncTag::Generic)
      .chain(Entity::ALL.into_iter().map(SyncTag::Entity))
      .collect()
  }

  pub fn is_generic(&self) -> bool {
    matches!(self, SyncTag::Generic)
  }

  pub fn entity(&self) -> Option<Entity> {
    match self {
      SyncTag::Generic => None,
      SyncTag::Entity(e) => Some(*e),
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SyncTag::Generic => GENERIC_TAG,
      SyncTag::Entity(e) => entity_tag(*e),
    }
  }
}

fn entity_tag(entity: Entity) -> &'static str {
  match entity {
    Entity::Patients => "sync-patients",
    Entity::Appointments => "sync-appointments",
    Entity::Prescriptions => "sync-prescriptions",
    Entity::Exams => "sync-exams",
    Entity::Users => "sync-users",
    Entity::Visits => "sync-visits",
    Entity::LabOrders => "sync-labOrders",
    Entity::LabResults => "sync-labResults",
    Entity::Invoices => "sync-invoices",
    Entity::Queue => "sync-queue",
    Entity::PharmacyInventory => "sync-pharmacyInventory",
    Entity::OrthopticExams => "sync-orthopticExams",
    Entity::GlassesOrders => "sync-glassesOrders",
    Entity::FrameInventory => "sync-frameInventory",
    Entity::ContactLensInventory => "sync-contactLensInventory",
    Entity::Clinics => "sync-clinics",
    Entity::Approvals => "sync-approvals",
    Entity::StockReconciliations => "sync-stockReconciliations",
  }
}

impl fmt::Display for SyncTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncTag {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    if s == GENERIC_TAG {
      return Ok(SyncTag::Generic);
    }
    s.strip_prefix(ENTITY_TAG_PREFIX)
      .ok_or_else(|| eyre!("Unknown sync tag '{}'", s))?
      .parse()
      .map(SyncTag::Entity)
  }
}

impl TryFrom<String> for SyncTag {
  type Error = color_eyre::Report;

  fn try_from(s: String) -> Result<Self> {
    s.parse()
  }
}

impl From<SyncTag> for String {
  fn from(tag: SyncTag) -> Self {
    tag.as_str().to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_every_tag_round_trips() {
    for tag in SyncTag::all() {
      assert_eq!(tag.as_str().parse::<SyncTag>().unwrap(), tag);
    }
    assert_eq!(SyncTag::all().len(), 19);
  }

  #[test]
  fn test_entity_tags_use_wire_names() {
    for entity in Entity::ALL {
      assert_eq!(
        SyncTag::Entity(entity).as_str(),
        format!("sync-{}", entity.name())
      );
      assert_eq!(
        serde_json::to_string(&entity).unwrap(),
        format!("\"{}\"", entity.name())
      );
    }
  }

  #[test]
  fn test_unknown_tags_are_rejected() {
    assert!("sync-spaceships".parse::<SyncTag>().is_err());
    assert!("patients".parse::<SyncTag>().is_err());
  }

  #[test]
  fn test_tag_serializes_as_string() {
    let json = serde_json::to_string(&SyncTag::Entity(Entity::LabResults)).unwrap();
    assert_eq!(json, "\"sync-labResults\"");
    let back: SyncTag = serde_json::from_str("\"background-sync\"").unwrap();
    assert_eq!(back, SyncTag::Generic);
  }
}
