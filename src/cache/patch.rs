//! Optimistic edits on cached JSON.
//!
//! List-shaped entries are either a page object (`{"data": [...], "total": n, ...}`)
//! or a bare array of rows. Anything else is treated as a single record.

use serde_json::{Map, Value};

/// A speculative change applied to cached data before the remote confirms it.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
  /// Prepend a provisional row to list entries
  InsertRow(Value),
  /// Merge fields into the record with this id, in lists and detail entries
  MergeFields { id: String, fields: Map<String, Value> },
  /// Drop the row with this id from list entries
  RemoveRow { id: String },
}

pub fn row_id(row: &Value) -> Option<&str> {
  row.get("id").and_then(Value::as_str)
}

pub fn rows(data: &Value) -> Option<&Vec<Value>> {
  match data {
    Value::Array(rows) => Some(rows),
    Value::Object(map) => map.get("data").and_then(Value::as_array),
    _ => None,
  }
}

fn rows_mut(data: &mut Value) -> Option<&mut Vec<Value>> {
  match data {
    Value::Array(rows) => Some(rows),
    Value::Object(map) => map.get_mut("data").and_then(Value::as_array_mut),
    _ => None,
  }
}

pub fn is_list(data: &Value) -> bool {
  rows(data).is_some()
}

fn adjust_total(data: &mut Value, delta: i64) {
  if let Some(total) = data.get_mut("total") {
    if let Some(n) = total.as_i64() {
      *total = Value::from((n + delta).max(0));
    }
  }
}

pub fn find_row<'a>(data: &'a Value, id: &str) -> Option<&'a Value> {
  match rows(data) {
    Some(rows) => rows.iter().find(|row| row_id(row) == Some(id)),
    None => (row_id(data) == Some(id)).then_some(data),
  }
}

pub fn contains_row(data: &Value, id: &str) -> bool {
  rows(data).is_some_and(|rows| rows.iter().any(|row| row_id(row) == Some(id)))
}

/// Ids of rows whose `field` equals `value`.
pub fn row_ids_where(data: &Value, field: &str, value: &str) -> Vec<String> {
  rows(data)
    .map(|rows| {
      rows
        .iter()
        .filter(|row| row.get(field).and_then(Value::as_str) == Some(value))
        .filter_map(|row| row_id(row).map(String::from))
        .collect()
    })
    .unwrap_or_default()
}

/// Remove rows whose `field` equals `value`, returning their ids.
pub fn remove_rows_where(data: &mut Value, field: &str, value: &str) -> Vec<String> {
  let removed = row_ids_where(data, field, value);
  if removed.is_empty() {
    return removed;
  }
  if let Some(rows) = rows_mut(data) {
    rows.retain(|row| row.get(field).and_then(Value::as_str) != Some(value));
  }
  adjust_total(data, -(removed.len() as i64));
  removed
}

fn merge(target: &mut Value, fields: &Map<String, Value>) {
  if let Value::Object(obj) = target {
    for (k, v) in fields {
      obj.insert(k.clone(), v.clone());
    }
  }
}

/// Apply a patch in place. Returns whether anything changed.
pub fn apply(data: &mut Value, patch: &Patch) -> bool {
  match patch {
    Patch::InsertRow(row) => match rows_mut(data) {
      Some(rows) => {
        rows.insert(0, row.clone());
        adjust_total(data, 1);
        true
      }
      None => false,
    },
    Patch::MergeFields { id, fields } => {
      if !is_list(data) {
        if row_id(data) != Some(id.as_str()) {
          return false;
        }
        merge(data, fields);
        return true;
      }
      let row = rows_mut(data).and_then(|rows| rows.iter_mut().find(|row| row_id(row) == Some(id.as_str())));
      match row {
        Some(row) => {
          merge(row, fields);
          true
        }
        None => false,
      }
    }
    Patch::RemoveRow { id } => {
      let Some(rows) = rows_mut(data) else {
        return false;
      };
      let before = rows.len();
      rows.retain(|row| row_id(row) != Some(id.as_str()));
      let removed = before - rows.len();
      if removed > 0 {
        adjust_total(data, -(removed as i64));
      }
      removed > 0
    }
  }
}

/// Swap a provisional id for the one assigned by the remote.
pub fn replace_id(data: &mut Value, from: &str, to: &str) -> bool {
  let target = if is_list(data) {
    rows_mut(data).and_then(|rows| rows.iter_mut().find(|row| row_id(row) == Some(from)))
  } else if row_id(data) == Some(from) {
    Some(data)
  } else {
    None
  };
  match target.and_then(Value::as_object_mut) {
    Some(obj) => {
      obj.insert("id".to_string(), Value::String(to.to_string()));
      true
    }
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn page() -> Value {
    json!({
      "data": [
        { "id": "t-1", "lineId": "L1", "name": "T-01" },
        { "id": "t-2", "lineId": "L2", "name": "T-02" }
      ],
      "total": 2,
      "page": 1,
      "limit": 20
    })
  }

  fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_insert_prepends_and_counts() {
    let mut data = page();
    assert!(apply(&mut data, &Patch::InsertRow(json!({ "id": "tmp", "name": "T-09" }))));
    assert_eq!(rows(&data).unwrap()[0]["id"], "tmp");
    assert_eq!(data["total"], 3);
  }

  #[test]
  fn test_insert_into_detail_is_noop() {
    let mut data = json!({ "id": "t-1" });
    assert!(!apply(&mut data, &Patch::InsertRow(json!({ "id": "tmp" }))));
    assert_eq!(data, json!({ "id": "t-1" }));
  }

  #[test]
  fn test_merge_into_list_and_detail() {
    let mut list = page();
    let patch = Patch::MergeFields {
      id: "t-2".to_string(),
      fields: fields(json!({ "name": "Renamed" })),
    };
    assert!(apply(&mut list, &patch));
    assert_eq!(find_row(&list, "t-2").unwrap()["name"], "Renamed");
    assert_eq!(find_row(&list, "t-1").unwrap()["name"], "T-01");

    let mut detail = json!({ "id": "t-2", "name": "T-02", "code": "X" });
    assert!(apply(&mut detail, &patch));
    assert_eq!(detail, json!({ "id": "t-2", "name": "Renamed", "code": "X" }));
  }

  #[test]
  fn test_merge_missing_row_reports_no_change() {
    let mut list = page();
    let patch = Patch::MergeFields {
      id: "t-9".to_string(),
      fields: fields(json!({ "name": "x" })),
    };
    assert!(!apply(&mut list, &patch));
    assert_eq!(list, page());
  }

  #[test]
  fn test_remove_row() {
    let mut list = page();
    assert!(apply(&mut list, &Patch::RemoveRow { id: "t-1".to_string() }));
    assert_eq!(rows(&list).unwrap().len(), 1);
    assert_eq!(list["total"], 1);
    assert!(!apply(&mut list, &Patch::RemoveRow { id: "t-1".to_string() }));
  }

  #[test]
  fn test_bare_array_rows() {
    let mut list = json!([{ "id": "a" }, { "id": "b" }]);
    assert!(contains_row(&list, "b"));
    assert!(apply(&mut list, &Patch::RemoveRow { id: "a".to_string() }));
    assert_eq!(list, json!([{ "id": "b" }]));
  }

  #[test]
  fn test_remove_rows_where() {
    let mut list = page();
    let removed = remove_rows_where(&mut list, "lineId", "L1");
    assert_eq!(removed, vec!["t-1".to_string()]);
    assert_eq!(list["total"], 1);
    assert!(remove_rows_where(&mut list, "lineId", "L1").is_empty());
  }

  #[test]
  fn test_replace_id() {
    let mut list = page();
    apply(&mut list, &Patch::InsertRow(json!({ "id": "tmp-1" })));
    assert!(replace_id(&mut list, "tmp-1", "t-123"));
    assert!(contains_row(&list, "t-123"));
    assert!(!contains_row(&list, "tmp-1"));
    assert_eq!(rows(&list).unwrap().len(), 3);
  }
}
