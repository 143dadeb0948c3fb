//! Pre-cache taxonomy: categories of named cache options.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
  Essential,
  Clinical,
  Optical,
  Pharmacy,
  Laboratory,
  Surgery,
}

impl Category {
  pub const ALL: [Category; 6] = [
    Category::Essential,
    Category::Clinical,
    Category::Optical,
    Category::Pharmacy,
    Category::Laboratory,
    Category::Surgery,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Essential => "essential",
      Self::Clinical => "clinical",
      Self::Optical => "optical",
      Self::Pharmacy => "pharmacy",
      Self::Laboratory => "laboratory",
      Self::Surgery => "surgery",
    }
  }

  pub fn label(&self) -> &'static str {
    match self {
      Self::Essential => "Essential",
      Self::Clinical => "Clinical",
      Self::Optical => "Optical shop",
      Self::Pharmacy => "Pharmacy",
      Self::Laboratory => "Laboratory",
      Self::Surgery => "Surgery",
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Category {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    Category::ALL
      .into_iter()
      .find(|c| c.as_str() == s.trim().to_ascii_lowercase())
      .ok_or_else(|| eyre!("Unknown pre-cache category '{}'", s))
  }
}

/// One fetch-and-store operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOption {
  pub id: String,
  pub label: String,
  /// API path (with query) fetched for the clinic
  pub path: String,
}

impl CacheOption {
  fn new(id: &str, label: &str, path: &str) -> Self {
    Self {
      id: id.to_string(),
      label: label.to_string(),
      path: path.to_string(),
    }
  }
}

/// A category as published to UI code.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryEntry {
  pub category: Category,
  pub label: &'static str,
  pub options: Vec<CacheOption>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
  categories: BTreeMap<Category, Vec<CacheOption>>,
}

impl Catalog {
  pub fn builtin() -> Self {
    let categories = Category::ALL
      .into_iter()
      .map(|c| (c, builtin_options(c)))
      .collect();
    Self { categories }
  }

  /// Built-in catalog with some categories' option lists replaced.
  pub fn with_overrides(overrides: &HashMap<Category, Vec<CacheOption>>) -> Self {
    let mut catalog = Self::builtin();
    for (category, options) in overrides {
      catalog.categories.insert(*category, options.clone());
    }
    catalog
  }

  pub fn options(&self, category: Category) -> &[CacheOption] {
    self
      .categories
      .get(&category)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  pub fn entries(&self) -> Vec<CategoryEntry> {
    self
      .categories
      .iter()
      .map(|(category, options)| CategoryEntry {
        category: *category,
        label: category.label(),
        options: options.clone(),
      })
      .collect()
  }

  /// Flatten the selected categories into the ordered list of operations.
  ///
  /// Categories run in catalog order whatever order they were selected in, and
  /// selecting one twice does not fetch it twice.
  pub fn plan(&self, selected: &[Category]) -> Vec<(Category, CacheOption)> {
    self
      .categories
      .iter()
      .filter(|(category, _)| selected.contains(*category))
      .flat_map(|(category, options)| options.iter().map(|o| (*category, o.clone())))
      .collect()
  }
}

impl Default for Catalog {
  fn default() -> Self {
    Self::builtin()
  }
}

fn builtin_options(category: Category) -> Vec<CacheOption> {
  match category {
    Category::Essential => vec![
      CacheOption::new("recent-patients", "Recent patients", "/api/patients?limit=100"),
      CacheOption::new("todays-appointments", "Today's appointments", "/api/appointments/today"),
      CacheOption::new("queue", "Waiting queue", "/api/queue"),
      CacheOption::new("users", "Staff", "/api/users"),
    ],
    Category::Clinical => vec![
      CacheOption::new("todays-visits", "Today's visits", "/api/visits/today"),
      CacheOption::new("recent-exams", "Recent exams", "/api/ophthalmology/exams?limit=50"),
      CacheOption::new("prescriptions", "Prescriptions", "/api/prescriptions?limit=100"),
      CacheOption::new("orthoptic-exams", "Orthoptic exams", "/api/orthoptic?limit=50"),
    ],
    Category::Optical => vec![
      CacheOption::new("frame-inventory", "Frame inventory", "/api/frame-inventory"),
      CacheOption::new(
        "contact-lens-inventory",
        "Contact lens inventory",
        "/api/contact-lens-inventory",
      ),
      CacheOption::new("glasses-orders", "Glasses orders", "/api/glasses-orders?status=pending"),
    ],
    Category::Pharmacy => vec![
      CacheOption::new("pharmacy-inventory", "Pharmacy inventory", "/api/pharmacy/inventory"),
      CacheOption::new(
        "stock-reconciliations",
        "Stock reconciliations",
        "/api/stock-reconciliations?limit=50",
      ),
    ],
    Category::Laboratory => vec![
      CacheOption::new("lab-orders", "Lab orders", "/api/laboratory/orders?status=pending"),
      CacheOption::new("lab-results", "Lab results", "/api/laboratory/results?limit=50"),
    ],
    Category::Surgery => vec![
      CacheOption::new("surgery-cases", "Surgery cases", "/api/surgery?limit=50"),
      CacheOption::new("surgery-approvals", "Pending approvals", "/api/approvals?type=surgery"),
    ],
  }
}
