use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;
use time::Date;
use uuid::Uuid;

mod tree;

pub use tree::{
    ChildDraft, DraftKind, EntityMut, EntityRef, Entry, EntryKind, EntryType, Itinerary, Node,
    Todo, Trip,
};

pub const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Description,
    Date,
    Address,
    Body,
    Completed,
    /// Ordering of the entity's child list.
    Children,
}

impl Field {
    pub fn is_free_text(self) -> bool {
        matches!(
            self,
            Field::Title | Field::Description | Field::Address | Field::Body
        )
    }

    pub fn is_structural(self) -> bool {
        matches!(self, Field::Children)
    }

    fn accepts(self, value: &FieldValue) -> bool {
        match value {
            FieldValue::Text(_) => self.is_free_text(),
            FieldValue::Date(_) => self == Field::Date,
            FieldValue::Flag(_) => self == Field::Completed,
            FieldValue::Order(_) => self == Field::Children,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Date(Option<Date>),
    Flag(bool),
    Order(Vec<EntityId>),
}

impl FieldValue {
    pub fn text<S: Into<String>>(value: S) -> Self {
        FieldValue::Text(value.into())
    }

    /// Parses user input for `field`, as typed on the command line.
    pub fn parse_for(field: Field, raw: &str) -> Result<Self, ValidationError> {
        match field {
            Field::Title | Field::Description | Field::Address | Field::Body => {
                Ok(FieldValue::Text(raw.to_string()))
            }
            Field::Completed => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "done" | "1" => Ok(FieldValue::Flag(true)),
                "false" | "no" | "open" | "0" => Ok(FieldValue::Flag(false)),
                _ => Err(ValidationError::Unparseable {
                    field,
                    input: raw.to_string(),
                }),
            },
            Field::Date => {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed == "none" {
                    return Ok(FieldValue::Date(None));
                }
                let format = time::macros::format_description!("[year]-[month]-[day]");
                Date::parse(trimmed, &format)
                    .map(|date| FieldValue::Date(Some(date)))
                    .map_err(|_| ValidationError::Unparseable {
                        field,
                        input: raw.to_string(),
                    })
            }
            Field::Children => Err(ValidationError::Structural(field)),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(text) => write!(f, "{text:?}"),
            FieldValue::Date(Some(date)) => write!(f, "{date}"),
            FieldValue::Date(None) => f.write_str("(no date)"),
            FieldValue::Flag(flag) => write!(f, "{flag}"),
            FieldValue::Order(ids) => write!(f, "[{} items]", ids.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Trip,
    Itinerary,
    Entry,
    Todo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub entity: EntityId,
    pub field: Field,
}

impl FieldKey {
    pub fn new(entity: EntityId, field: Field) -> Self {
        Self { entity, field }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.field)
    }
}

/// Changes to one or more fields of a single entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub entity: EntityId,
    pub changes: Vec<(Field, FieldValue)>,
}

impl Patch {
    pub fn single(entity: EntityId, field: Field, value: FieldValue) -> Self {
        Self {
            entity,
            changes: vec![(field, value)],
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = FieldKey> + '_ {
        self.changes
            .iter()
            .map(|(field, _)| FieldKey::new(self.entity.clone(), *field))
    }
}

/// Server-confirmed scalar fields of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub fields: Vec<(Field, FieldValue)>,
}

impl EntityRecord {
    pub fn value(&self, field: Field) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(candidate, _)| *candidate == field)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("title cannot be empty")]
    EmptyTitle,
    #[error("title is {len} characters, the limit is {MAX_TITLE_LEN}")]
    TitleTooLong { len: usize },
    #[error("{kind} has no {field} field")]
    FieldNotApplicable { kind: EntityKind, field: Field },
    #[error("value {value} does not fit field {field}")]
    WrongValueType { field: Field, value: String },
    #[error("{0} can only be changed by moving items")]
    Structural(Field),
    #[error("cannot parse {input:?} as {field}")]
    Unparseable { field: Field, input: String },
    #[error("{child} cannot be added under {parent}")]
    ChildNotAllowed { parent: EntityKind, child: EntityKind },
}

pub fn validate_title(kind: EntityKind, title: &str) -> Result<(), ValidationError> {
    let trimmed = title.trim();
    let len = trimmed.chars().count();
    if len > MAX_TITLE_LEN {
        return Err(ValidationError::TitleTooLong { len });
    }
    if trimmed.is_empty() && kind != EntityKind::Itinerary {
        return Err(ValidationError::EmptyTitle);
    }
    Ok(())
}

/// Checks a user edit against the entity it targets. Structural fields are
/// rejected here; ordering goes through sibling moves.
pub fn validate_edit(
    entity: &EntityRef<'_>,
    field: Field,
    value: &FieldValue,
) -> Result<(), ValidationError> {
    if field.is_structural() {
        return Err(ValidationError::Structural(field));
    }
    if entity.field(field).is_none() {
        return Err(ValidationError::FieldNotApplicable {
            kind: entity.kind(),
            field,
        });
    }
    if !field.accepts(value) {
        return Err(ValidationError::WrongValueType {
            field,
            value: value.to_string(),
        });
    }
    if field == Field::Title {
        if let FieldValue::Text(title) = value {
            validate_title(entity.kind(), title)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn field_names_round_trip_through_strum() {
        assert_eq!(Field::Completed.to_string(), "completed");
        assert_eq!("children".parse::<Field>().ok(), Some(Field::Children));
        assert!("colour".parse::<Field>().is_err());
    }

    #[test]
    fn parse_for_accepts_dates_and_flags() {
        let parsed = FieldValue::parse_for(Field::Date, "2024-05-01").unwrap();
        assert_eq!(
            parsed,
            FieldValue::Date(Some(time::macros::date!(2024 - 05 - 01)))
        );
        assert_eq!(
            FieldValue::parse_for(Field::Completed, "done").unwrap(),
            FieldValue::Flag(true)
        );
        assert_matches!(
            FieldValue::parse_for(Field::Date, "tomorrow"),
            Err(ValidationError::Unparseable { .. })
        );
    }

    #[test]
    fn ordering_cannot_be_typed_in() {
        let err = FieldValue::parse_for(Field::Children, "a,b").unwrap_err();
        assert_eq!(err, ValidationError::Structural(Field::Children));
        assert_eq!(
            err.to_string(),
            "children can only be changed by moving items"
        );
    }

    #[test]
    fn day_titles_may_be_empty_but_todo_titles_may_not() {
        assert!(validate_title(EntityKind::Itinerary, "  ").is_ok());
        assert_eq!(
            validate_title(EntityKind::Todo, "  "),
            Err(ValidationError::EmptyTitle)
        );
        let long = "x".repeat(MAX_TITLE_LEN + 1);
        assert_matches!(
            validate_title(EntityKind::Trip, &long),
            Err(ValidationError::TitleTooLong { .. })
        );
    }
}
