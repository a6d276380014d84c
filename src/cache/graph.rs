//! Parent/child relationships between entity families.

use crate::models::EntityKind;

/// `child` rows carry `parent_key_field` pointing at a `parent` id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
  pub child: EntityKind,
  pub parent: EntityKind,
  pub parent_key_field: &'static str,
}

/// Declarative relationship table consumed by the cascade resolver.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipGraph {
  relationships: &'static [Relationship],
}

/// The dashboard's hierarchy:
/// factory → line → team, handbag → bag color → process, form → entry.
pub static RELATIONSHIPS: &[Relationship] = &[
  Relationship {
    child: EntityKind::Line,
    parent: EntityKind::Factory,
    parent_key_field: "factoryId",
  },
  Relationship {
    child: EntityKind::Team,
    parent: EntityKind::Line,
    parent_key_field: "lineId",
  },
  Relationship {
    child: EntityKind::BagColor,
    parent: EntityKind::HandBag,
    parent_key_field: "handBagId",
  },
  Relationship {
    child: EntityKind::BagColorProcess,
    parent: EntityKind::BagColor,
    parent_key_field: "bagColorId",
  },
  Relationship {
    child: EntityKind::DigitalFormEntry,
    parent: EntityKind::DigitalForm,
    parent_key_field: "formId",
  },
];

impl RelationshipGraph {
  pub const fn new(relationships: &'static [Relationship]) -> Self {
    Self { relationships }
  }

  pub fn parent_of(&self, child: EntityKind) -> Option<&'static Relationship> {
    self.relationships.iter().find(|r| r.child == child)
  }

  pub fn children_of(&self, parent: EntityKind) -> impl Iterator<Item = &'static Relationship> + '_ {
    self.relationships.iter().filter(move |r| r.parent == parent)
  }

  pub fn relationship(&self, parent: EntityKind, child: EntityKind) -> Option<&'static Relationship> {
    self
      .relationships
      .iter()
      .find(|r| r.parent == parent && r.child == child)
  }
}

impl Default for RelationshipGraph {
  fn default() -> Self {
    Self::new(RELATIONSHIPS)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parent_lookup() {
    let graph = RelationshipGraph::default();
    let rel = graph.parent_of(EntityKind::Team).unwrap();
    assert_eq!(rel.parent, EntityKind::Line);
    assert_eq!(rel.parent_key_field, "lineId");
    assert!(graph.parent_of(EntityKind::Factory).is_none());
    assert!(graph.parent_of(EntityKind::HandBag).is_none());
  }

  #[test]
  fn test_children_lookup() {
    let graph = RelationshipGraph::default();
    let children: Vec<_> = graph.children_of(EntityKind::HandBag).map(|r| r.child).collect();
    assert_eq!(children, vec![EntityKind::BagColor]);
    assert_eq!(graph.children_of(EntityKind::Team).count(), 0);
  }

  #[test]
  fn test_each_kind_has_at_most_one_parent() {
    let graph = RelationshipGraph::default();
    for kind in EntityKind::ALL {
      let parents = RELATIONSHIPS.iter().filter(|r| r.child == kind).count();
      assert!(parents <= 1, "{kind} has {parents} parents");
      if parents == 1 {
        assert!(graph.parent_of(kind).is_some());
      }
    }
  }
}
