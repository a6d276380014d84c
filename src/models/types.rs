use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entity::{Entity, Validate};
use crate::error::ValidationError;

use super::kind::EntityKind;

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
  if value.trim().is_empty() {
    return Err(ValidationError::missing(field));
  }
  Ok(())
}

fn require_if_present(field: &str, value: Option<&String>) -> Result<(), ValidationError> {
  match value {
    Some(v) => require(field, v),
    None => Ok(()),
  }
}

// ============================================================================
// Factory / Line / Team
// ============================================================================

/// Manufacturing site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Factory {
  pub id: String,
  pub name: String,
  pub code: String,
  #[serde(default)]
  pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryCreate {
  pub name: String,
  pub code: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
}

/// Production line inside a factory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Line {
  pub id: String,
  pub factory_id: String,
  pub name: String,
  pub code: String,
  #[serde(default)]
  pub capacity: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineCreate {
  pub factory_id: String,
  pub name: String,
  pub code: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub capacity: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub factory_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub capacity: Option<u32>,
}

/// Team working a line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
  pub id: String,
  pub line_id: String,
  pub name: String,
  pub code: String,
  #[serde(default)]
  pub leader_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamCreate {
  pub line_id: String,
  pub name: String,
  pub code: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub leader_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub leader_id: Option<String>,
}

// ============================================================================
// HandBag / BagColor / BagColorProcess
// ============================================================================

/// Handbag model in the product catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandBag {
  pub id: String,
  pub code: String,
  pub name: String,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default = "default_true")]
  pub active: bool,
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandBagCreate {
  pub code: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandBagUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub active: Option<bool>,
}

/// Color variant of a handbag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BagColor {
  pub id: String,
  pub hand_bag_id: String,
  pub color_code: String,
  pub color_name: String,
  #[serde(default = "default_true")]
  pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BagColorCreate {
  pub hand_bag_id: String,
  pub color_code: String,
  pub color_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BagColorUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub color_code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub color_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub active: Option<bool>,
}

/// Production process step for a bag color
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BagColorProcess {
  pub id: String,
  pub bag_color_id: String,
  pub process_name: String,
  #[serde(default)]
  pub output_standard: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BagColorProcessCreate {
  pub bag_color_id: String,
  pub process_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output_standard: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BagColorProcessUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub process_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output_standard: Option<u32>,
}

// ============================================================================
// Digital forms
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShiftType {
  #[default]
  Regular,
  Extended,
  Overtime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormStatus {
  #[default]
  Draft,
  Pending,
  Confirmed,
  Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
  #[default]
  Present,
  Absent,
  Late,
  EarlyLeave,
  LeaveApproved,
}

/// Shift-based production form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalForm {
  pub id: String,
  pub form_code: String,
  pub form_name: String,
  pub date: NaiveDate,
  #[serde(default)]
  pub shift_type: ShiftType,
  pub factory_id: String,
  pub line_id: String,
  #[serde(default)]
  pub team_id: Option<String>,
  #[serde(default)]
  pub status: FormStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalFormCreate {
  pub form_name: String,
  pub date: NaiveDate,
  #[serde(default)]
  pub shift_type: ShiftType,
  pub factory_id: String,
  pub line_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub team_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalFormUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub form_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub shift_type: Option<ShiftType>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<FormStatus>,
}

/// One worker's hourly output and attendance on a form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalFormEntry {
  pub id: String,
  pub form_id: String,
  pub user_id: String,
  pub hand_bag_id: String,
  pub bag_color_id: String,
  pub process_id: String,
  #[serde(default)]
  pub attendance_status: AttendanceStatus,
  /// Output per hour slot, keyed like `"07:30-08:30"`
  #[serde(default)]
  pub hourly_data: BTreeMap<String, u32>,
  #[serde(default)]
  pub total_output: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalFormEntryCreate {
  pub form_id: String,
  pub user_id: String,
  pub hand_bag_id: String,
  pub bag_color_id: String,
  pub process_id: String,
  #[serde(default)]
  pub attendance_status: AttendanceStatus,
  #[serde(default)]
  pub hourly_data: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalFormEntryUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub attendance_status: Option<AttendanceStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hourly_data: Option<BTreeMap<String, u32>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub total_output: Option<u32>,
}

// ============================================================================
// Entity implementations
// ============================================================================

impl Entity for Factory {
  type Create = FactoryCreate;
  type Update = FactoryUpdate;

  fn kind() -> EntityKind {
    EntityKind::Factory
  }

  fn cache_key(&self) -> &str {
    &self.id
  }
}

impl Entity for Line {
  type Create = LineCreate;
  type Update = LineUpdate;

  fn kind() -> EntityKind {
    EntityKind::Line
  }

  fn cache_key(&self) -> &str {
    &self.id
  }
}

impl Entity for Team {
  type Create = TeamCreate;
  type Update = TeamUpdate;

  fn kind() -> EntityKind {
    EntityKind::Team
  }

  fn cache_key(&self) -> &str {
    &self.id
  }
}

impl Entity for HandBag {
  type Create = HandBagCreate;
  type Update = HandBagUpdate;

  fn kind() -> EntityKind {
    EntityKind::HandBag
  }

  fn cache_key(&self) -> &str {
    &self.id
  }
}

impl Entity for BagColor {
  type Create = BagColorCreate;
  type Update = BagColorUpdate;

  fn kind() -> EntityKind {
    EntityKind::BagColor
  }

  fn cache_key(&self) -> &str {
    &self.id
  }
}

impl Entity for BagColorProcess {
  type Create = BagColorProcessCreate;
  type Update = BagColorProcessUpdate;

  fn kind() -> EntityKind {
    EntityKind::BagColorProcess
  }

  fn cache_key(&self) -> &str {
    &self.id
  }
}

impl Entity for DigitalForm {
  type Create = DigitalFormCreate;
  type Update = DigitalFormUpdate;

  fn kind() -> EntityKind {
    EntityKind::DigitalForm
  }

  fn cache_key(&self) -> &str {
    &self.id
  }
}

impl Entity for DigitalFormEntry {
  type Create = DigitalFormEntryCreate;
  type Update = DigitalFormEntryUpdate;

  fn kind() -> EntityKind {
    EntityKind::DigitalFormEntry
  }

  fn cache_key(&self) -> &str {
    &self.id
  }
}

// ============================================================================
// Structural validation
// ============================================================================

impl Validate for FactoryCreate {
  fn validate(&self) -> Result<(), ValidationError> {
    require("name", &self.name)?;
    require("code", &self.code)
  }
}

impl Validate for FactoryUpdate {
  fn validate(&self) -> Result<(), ValidationError> {
    require_if_present("name", self.name.as_ref())?;
    require_if_present("code", self.code.as_ref())
  }
}

impl Validate for LineCreate {
  fn validate(&self) -> Result<(), ValidationError> {
    require("factoryId", &self.factory_id)?;
    require("name", &self.name)?;
    require("code", &self.code)
  }
}

impl Validate for LineUpdate {
  fn validate(&self) -> Result<(), ValidationError> {
    require_if_present("factoryId", self.factory_id.as_ref())?;
    require_if_present("name", self.name.as_ref())?;
    require_if_present("code", self.code.as_ref())
  }
}

impl Validate for TeamCreate {
  fn validate(&self) -> Result<(), ValidationError> {
    require("lineId", &self.line_id)?;
    require("name", &self.name)?;
    require("code", &self.code)
  }
}

impl Validate for TeamUpdate {
  fn validate(&self) -> Result<(), ValidationError> {
    require_if_present("lineId", self.line_id.as_ref())?;
    require_if_present("name", self.name.as_ref())?;
    require_if_present("code", self.code.as_ref())
  }
}

impl Validate for HandBagCreate {
  fn validate(&self) -> Result<(), ValidationError> {
    require("code", &self.code)?;
    require("name", &self.name)
  }
}

impl Validate for HandBagUpdate {
  fn validate(&self) -> Result<(), ValidationError> {
    require_if_present("code", self.code.as_ref())?;
    require_if_present("name", self.name.as_ref())
  }
}

impl Validate for BagColorCreate {
  fn validate(&self) -> Result<(), ValidationError> {
    require("handBagId", &self.hand_bag_id)?;
    require("colorCode", &self.color_code)?;
    require("colorName", &self.color_name)
  }
}

impl Validate for BagColorUpdate {
  fn validate(&self) -> Result<(), ValidationError> {
    require_if_present("colorCode", self.color_code.as_ref())?;
    require_if_present("colorName", self.color_name.as_ref())
  }
}

impl Validate for BagColorProcessCreate {
  fn validate(&self) -> Result<(), ValidationError> {
    require("bagColorId", &self.bag_color_id)?;
    require("processName", &self.process_name)
  }
}

impl Validate for BagColorProcessUpdate {
  fn validate(&self) -> Result<(), ValidationError> {
    require_if_present("processName", self.process_name.as_ref())
  }
}

impl Validate for DigitalFormCreate {
  fn validate(&self) -> Result<(), ValidationError> {
    require("formName", &self.form_name)?;
    require("factoryId", &self.factory_id)?;
    require("lineId", &self.line_id)
  }
}

impl Validate for DigitalFormUpdate {
  fn validate(&self) -> Result<(), ValidationError> {
    require_if_present("formName", self.form_name.as_ref())
  }
}

impl Validate for DigitalFormEntryCreate {
  fn validate(&self) -> Result<(), ValidationError> {
    require("formId", &self.form_id)?;
    require("userId", &self.user_id)?;
    require("handBagId", &self.hand_bag_id)?;
    require("bagColorId", &self.bag_color_id)?;
    require("processId", &self.process_id)
  }
}

impl Validate for DigitalFormEntryUpdate {
  fn validate(&self) -> Result<(), ValidationError> {
    Ok(())
  }
}
