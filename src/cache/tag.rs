//! Cache keys.
//!
//! Wire format of a tag, as rendered by `segments()`:
//! - list: `[<type>-list, <params hash>]`
//! - detail: `[<type>, <id>]`
//! - subresource: `[<type>, <id>, <name>, <params hash>?]`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::models::EntityKind;

/// Keys that belong to pagination rather than filtering.
pub const PAGINATION_KEYS: [&str; 4] = ["page", "limit", "sortBy", "sortOrder"];

/// Normalized list parameters.
///
/// Null values are dropped on insert and keys stay lexicographically sorted,
/// so two param sets that differ only in key order or absent fields hash the same.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListParams(BTreeMap<String, Value>);

impl ListParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.insert(key, value);
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    let key = key.into();
    match value.into() {
      Value::Null => {
        self.0.remove(&key);
      }
      value => {
        self.0.insert(key, value);
      }
    }
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.0.get(key).and_then(Value::as_str)
  }

  pub fn get_u64(&self, key: &str) -> Option<u64> {
    self.0.get(key).and_then(Value::as_u64)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  /// Fields that filter rows, i.e. everything except pagination and sorting.
  pub fn filters(&self) -> impl Iterator<Item = (&String, &Value)> {
    self
      .0
      .iter()
      .filter(|(k, _)| !PAGINATION_KEYS.contains(&k.as_str()))
  }

  /// Canonical JSON: sorted keys, no nulls.
  pub fn canonical(&self) -> String {
    serde_json::to_string(&self.0).unwrap_or_default()
  }

  /// SHA256 of the canonical form for stable, fixed-length keys.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<Map<String, Value>> for ListParams {
  fn from(map: Map<String, Value>) -> Self {
    let mut params = ListParams::new();
    for (k, v) in map {
      params.insert(k, v);
    }
    params
  }
}

impl FromIterator<(String, Value)> for ListParams {
  fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
    let mut params = ListParams::new();
    for (k, v) in iter {
      params.insert(k, v);
    }
    params
  }
}

/// Addressable cache key. Equality over all present segments is the sole
/// identity used by the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
  entity_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  subresource: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  params_hash: Option<String>,
}

impl Tag {
  pub fn list(kind: EntityKind, params: &ListParams) -> Self {
    Self {
      entity_type: kind.list_name(),
      id: None,
      subresource: None,
      params_hash: Some(params.hash()),
    }
  }

  pub fn detail(kind: EntityKind, id: impl Into<String>) -> Self {
    Self {
      entity_type: kind.as_str().to_string(),
      id: Some(id.into()),
      subresource: None,
      params_hash: None,
    }
  }

  pub fn subresource(
    kind: EntityKind,
    id: impl Into<String>,
    name: impl Into<String>,
    params: Option<&ListParams>,
  ) -> Self {
    Self {
      entity_type: kind.as_str().to_string(),
      id: Some(id.into()),
      subresource: Some(name.into()),
      params_hash: params.filter(|p| !p.is_empty()).map(ListParams::hash),
    }
  }

  /// Child collection of a parent, e.g. `[line, L1, teams]`.
  pub fn children(parent: EntityKind, parent_id: impl Into<String>, child: EntityKind) -> Self {
    Self::subresource(parent, parent_id, child.collection_name(), None)
  }

  pub fn entity_type(&self) -> &str {
    &self.entity_type
  }

  pub fn id(&self) -> Option<&str> {
    self.id.as_deref()
  }

  pub fn subresource_name(&self) -> Option<&str> {
    self.subresource.as_deref()
  }

  pub fn params_hash(&self) -> Option<&str> {
    self.params_hash.as_deref()
  }

  /// Kind named by the first segment, if it is a known one.
  pub fn kind(&self) -> Option<EntityKind> {
    EntityKind::from_tag_head(&self.entity_type).map(|(kind, _)| kind)
  }

  pub fn is_list(&self) -> bool {
    self.id.is_none()
  }

  pub fn is_detail(&self) -> bool {
    self.id.is_some() && self.subresource.is_none()
  }

  /// Whether this entry holds rows of `kind`: its list tags, or a parent's
  /// child-collection subresource.
  pub fn holds_rows_of(&self, kind: EntityKind) -> bool {
    if self.is_list() {
      return self.entity_type == kind.list_name();
    }
    self.subresource.as_deref() == Some(kind.collection_name())
  }

  /// Present segments in order.
  pub fn segments(&self) -> Vec<&str> {
    let mut out = vec![self.entity_type.as_str()];
    out.extend(self.id.as_deref());
    out.extend(self.subresource.as_deref());
    out.extend(self.params_hash.as_deref());
    out
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, segment) in self.segments().into_iter().enumerate() {
      if i > 0 {
        write!(f, ",")?;
      }
      // Hashes are long; the first 12 hex chars identify them in logs.
      if Some(segment) == self.params_hash.as_deref() {
        write!(f, "{}", &segment[..segment.len().min(12)])?;
      } else {
        write!(f, "{}", segment)?;
      }
    }
    write!(f, "]")
  }
}

/// One position in a `TagPattern`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
  Exact(String),
  Any,
}

/// Prefix pattern over tag segments.
///
/// `[team, t-1]` matches the detail tag and every subresource below it;
/// `[line, *, teams]` matches every line's team collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagPattern(Vec<Segment>);

impl TagPattern {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn exact(mut self, segment: impl Into<String>) -> Self {
    self.0.push(Segment::Exact(segment.into()));
    self
  }

  pub fn any(mut self) -> Self {
    self.0.push(Segment::Any);
    self
  }

  /// Every list tag of a kind, regardless of params.
  pub fn lists(kind: EntityKind) -> Self {
    Self::new().exact(kind.list_name())
  }

  /// A detail tag and all its subresources.
  pub fn entity(kind: EntityKind, id: impl Into<String>) -> Self {
    Self::new().exact(kind.as_str()).exact(id)
  }

  /// Every entry of a kind: all detail tags and their subresources.
  pub fn kind(kind: EntityKind) -> Self {
    Self::new().exact(kind.as_str())
  }

  /// A parent's child collection, with or without params.
  pub fn children(parent: EntityKind, parent_id: impl Into<String>, child: EntityKind) -> Self {
    Self::entity(parent, parent_id).exact(child.collection_name())
  }

  pub fn matches(&self, tag: &Tag) -> bool {
    let segments = tag.segments();
    if segments.len() < self.0.len() {
      return false;
    }
    self.0.iter().zip(segments).all(|(pattern, segment)| match pattern {
      Segment::Exact(s) => s == segment,
      Segment::Any => true,
    })
  }
}

impl Default for TagPattern {
  fn default() -> Self {
    Self::new()
  }
}

impl From<&Tag> for TagPattern {
  fn from(tag: &Tag) -> Self {
    Self(
      tag
        .segments()
        .into_iter()
        .map(|s| Segment::Exact(s.to_string()))
        .collect(),
    )
  }
}

impl fmt::Display for TagPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<&str> = self
      .0
      .iter()
      .map(|s| match s {
        Segment::Exact(s) => s.as_str(),
        Segment::Any => "*",
      })
      .collect();
    write!(f, "[{}]", parts.join(","))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_params_ignore_order_and_nulls() {
    let a = ListParams::new()
      .with("search", "abc")
      .with("page", 1)
      .with("lineId", Value::Null);
    let b = ListParams::new().with("page", 1).with("search", "abc");
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
    assert_eq!(a.canonical(), r#"{"page":1,"search":"abc"}"#);
  }

  #[test]
  fn test_params_from_json_object() {
    let Value::Object(map) = json!({ "b": 2, "a": 1, "c": null }) else {
      unreachable!()
    };
    let params = ListParams::from(map);
    assert_eq!(params.canonical(), r#"{"a":1,"b":2}"#);
  }

  #[test]
  fn test_hash_is_hex_sha256() {
    let hash = ListParams::new().hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_tag_segments() {
    let params = ListParams::new().with("page", 1);
    assert_eq!(
      Tag::list(EntityKind::Team, &params).segments(),
      vec!["team-list", params.hash().as_str()]
    );
    assert_eq!(
      Tag::detail(EntityKind::Team, "t-1").segments(),
      vec!["team", "t-1"]
    );
    assert_eq!(
      Tag::children(EntityKind::Line, "L1", EntityKind::Team).segments(),
      vec!["line", "L1", "teams"]
    );
  }

  #[test]
  fn test_equal_segments_equal_tags() {
    let a = Tag::list(EntityKind::Team, &ListParams::new().with("x", 1).with("y", 2));
    let b = Tag::list(EntityKind::Team, &ListParams::new().with("y", 2).with("x", 1));
    assert_eq!(a, b);
    assert_ne!(a, Tag::list(EntityKind::Line, &ListParams::new().with("x", 1).with("y", 2)));
  }

  #[test]
  fn test_empty_subresource_params_are_omitted() {
    let a = Tag::subresource(EntityKind::Line, "L1", "teams", Some(&ListParams::new()));
    assert_eq!(a, Tag::children(EntityKind::Line, "L1", EntityKind::Team));
  }

  #[test]
  fn test_pattern_prefix_matching() {
    let detail = Tag::detail(EntityKind::Team, "t-1");
    let sub = Tag::subresource(EntityKind::Team, "t-1", "members", None);
    let other = Tag::detail(EntityKind::Team, "t-2");

    let pattern = TagPattern::entity(EntityKind::Team, "t-1");
    assert!(pattern.matches(&detail));
    assert!(pattern.matches(&sub));
    assert!(!pattern.matches(&other));

    let all_team_collections = TagPattern::new().exact("line").any().exact("teams");
    assert!(all_team_collections.matches(&Tag::children(EntityKind::Line, "L1", EntityKind::Team)));
    assert!(!all_team_collections.matches(&Tag::detail(EntityKind::Line, "L1")));
  }

  #[test]
  fn test_holds_rows_of() {
    let list = Tag::list(EntityKind::Team, &ListParams::new());
    let children = Tag::children(EntityKind::Line, "L1", EntityKind::Team);
    assert!(list.holds_rows_of(EntityKind::Team));
    assert!(children.holds_rows_of(EntityKind::Team));
    assert!(!Tag::detail(EntityKind::Team, "t-1").holds_rows_of(EntityKind::Team));
    assert!(!list.holds_rows_of(EntityKind::Line));
  }
}
