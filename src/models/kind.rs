use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CacheError;

/// Every entity family the dashboard caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
  Factory,
  Line,
  Team,
  #[serde(rename = "handbag")]
  HandBag,
  BagColor,
  BagColorProcess,
  DigitalForm,
  DigitalFormEntry,
}

impl EntityKind {
  pub const ALL: [EntityKind; 8] = [
    EntityKind::Factory,
    EntityKind::Line,
    EntityKind::Team,
    EntityKind::HandBag,
    EntityKind::BagColor,
    EntityKind::BagColorProcess,
    EntityKind::DigitalForm,
    EntityKind::DigitalFormEntry,
  ];

  /// Name used as the first segment of detail tags.
  pub fn as_str(&self) -> &'static str {
    match self {
      EntityKind::Factory => "factory",
      EntityKind::Line => "line",
      EntityKind::Team => "team",
      EntityKind::HandBag => "handbag",
      EntityKind::BagColor => "bag-color",
      EntityKind::BagColorProcess => "bag-color-process",
      EntityKind::DigitalForm => "digital-form",
      EntityKind::DigitalFormEntry => "digital-form-entry",
    }
  }

  /// First segment of list tags, e.g. `team-list`.
  pub fn list_name(&self) -> String {
    format!("{}-list", self.as_str())
  }

  /// Subresource name under a parent, e.g. `[line, L1, teams]`.
  pub fn collection_name(&self) -> &'static str {
    match self {
      EntityKind::Factory => "factories",
      EntityKind::Line => "lines",
      EntityKind::Team => "teams",
      EntityKind::HandBag => "handbags",
      EntityKind::BagColor => "bag-colors",
      EntityKind::BagColorProcess => "processes",
      EntityKind::DigitalForm => "forms",
      EntityKind::DigitalFormEntry => "entries",
    }
  }

  /// Resolve a tag head (`team` or `team-list`) back to its kind.
  pub fn from_tag_head(head: &str) -> Option<(Self, bool)> {
    match head.strip_suffix("-list") {
      Some(base) => base.parse().ok().map(|kind| (kind, true)),
      None => head.parse().ok().map(|kind| (kind, false)),
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = CacheError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    EntityKind::ALL
      .iter()
      .copied()
      .find(|kind| kind.as_str() == s)
      .ok_or_else(|| CacheError::UnknownEntity(s.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tag_head_roundtrip() {
    for kind in EntityKind::ALL {
      assert_eq!(EntityKind::from_tag_head(kind.as_str()), Some((kind, false)));
      assert_eq!(EntityKind::from_tag_head(&kind.list_name()), Some((kind, true)));
    }
  }

  #[test]
  fn test_unknown_head() {
    assert_eq!(EntityKind::from_tag_head("warehouse"), None);
    assert!("warehouse-list".parse::<EntityKind>().is_err());
  }

  #[test]
  fn test_serde_names_match_tag_names() {
    for kind in EntityKind::ALL {
      let json = serde_json::to_value(kind).unwrap();
      assert_eq!(json, serde_json::Value::String(kind.as_str().to_string()));
    }
  }
}
