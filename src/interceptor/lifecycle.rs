use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Install/activate lifecycle, persisted in the store's `meta` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
  /// App shell being fetched
  Installing,
  /// Shell cached, waiting for activation
  Installed,
  /// Serving from and writing to the current partitions
  Active,
}

impl Lifecycle {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Active => "active",
    }
  }
}

impl fmt::Display for Lifecycle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Lifecycle {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "installed" => Ok(Self::Installed),
      "active" => Ok(Self::Active),
      other => Err(eyre!("Unknown lifecycle state '{}'", other)),
    }
  }
}
