//! Ergonomic command construction.

use std::collections::BTreeMap;

use crate::attribute::{AttributeList, AttributeValue};
use crate::command::Command;

/// Accumulates attributes for a command and stamps identity on `build()`.
///
/// ```
/// use petstore_core::CommandBuilder;
///
/// let cmd = CommandBuilder::new("pet_create")
///     .value("name", "fluffy")
///     .values("vaccines", vec!["rabies"])
///     .build();
/// assert_eq!(cmd.name(), "pet_create");
/// ```
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    name: String,
    attributes: BTreeMap<String, AttributeValue>,
}

impl CommandBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set a scalar (or pre-built) attribute, replacing any previous value.
    pub fn value(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a list attribute, replacing any previous value.
    pub fn values(mut self, key: impl Into<String>, values: impl Into<AttributeList>) -> Self {
        self.set_list(key, values);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> &mut Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn set_list(&mut self, key: impl Into<String>, values: impl Into<AttributeList>) -> &mut Self {
        self.attributes
            .insert(key.into(), AttributeValue::List(values.into()));
        self
    }

    pub fn build(self) -> Command {
        Command::new(self.name, self.attributes)
    }
}

/// Closure-style construction.
///
/// ```
/// use petstore_core::command;
///
/// let cmd = command("pet_create", |c| {
///     c.set("name", "fluffy");
///     c.set_list("tags", vec!["small"]);
/// });
/// assert!(cmd.contains("tags"));
/// ```
pub fn command(name: impl Into<String>, init: impl FnOnce(&mut CommandBuilder)) -> Command {
    let mut builder = CommandBuilder::new(name);
    init(&mut builder);
    builder.build()
}
