use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeValue, FromAttribute, ListElement};
use crate::error::{AttributeError, AttributeResult};
use crate::id::CommandId;

/// A named, schema-less unit of intent.
///
/// `id` and `timestamp` are fixed at construction. Attributes are only
/// assembled through [`CommandBuilder`](crate::CommandBuilder); once built, a
/// command exposes read access only, so what a consumer decodes is exactly what
/// the producer sent.
///
/// The name is not checked against any known set here; routing (and rejecting
/// unknown names) is the dispatcher's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: CommandId,
    timestamp: DateTime<Utc>,
    name: String,
    attributes: BTreeMap<String, AttributeValue>,
}

impl Command {
    /// Create a command with a fresh id and the current time.
    pub fn new(name: impl Into<String>, attributes: BTreeMap<String, AttributeValue>) -> Self {
        Self {
            id: CommandId::new(),
            timestamp: Utc::now(),
            name: name.into(),
            attributes,
        }
    }

    /// Reassemble a command from transported parts.
    pub fn from_parts(
        id: CommandId,
        timestamp: DateTime<Utc>,
        name: impl Into<String>,
        attributes: BTreeMap<String, AttributeValue>,
    ) -> Self {
        Self {
            id,
            timestamp,
            name: name.into(),
            attributes,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read an attribute as `T`.
    ///
    /// Fails with [`AttributeError::NotFound`] when the key is absent,
    /// [`AttributeError::TypeMismatch`] when the stored kind differs, and
    /// [`AttributeError::ListTypeMismatch`] when both are lists of different
    /// element kinds.
    pub fn get<T: FromAttribute>(&self, attribute: &str) -> AttributeResult<T> {
        let value = self
            .attributes
            .get(attribute)
            .ok_or_else(|| AttributeError::not_found(attribute))?;
        T::from_attribute(attribute, value)
    }

    /// Read a list attribute; shorthand for `get::<Vec<T>>`.
    pub fn get_list<T: ListElement>(&self, attribute: &str) -> AttributeResult<Vec<T>> {
        self.get::<Vec<T>>(attribute)
    }

    /// Read an attribute that may be absent.
    ///
    /// Absence is `Ok(None)`; a present value of the wrong kind is still an error.
    pub fn get_optional<T: FromAttribute>(&self, attribute: &str) -> AttributeResult<Option<T>> {
        match self.attributes.get(attribute) {
            Some(value) => T::from_attribute(attribute, value).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute)
    }

    pub fn raw(&self, attribute: &str) -> Option<&AttributeValue> {
        self.attributes.get(attribute)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    pub fn into_attributes(self) -> BTreeMap<String, AttributeValue> {
        self.attributes
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}[{}]", self.name, self.id)
    }
}
