//! Vocabulary of the pet commands.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::builder::CommandBuilder;
use crate::command::Command;

/// Name of the command that creates a pet.
pub const PET_CREATE: &str = "pet_create";

/// Attribute keys used by [`PET_CREATE`].
pub mod attr {
    pub const NAME: &str = "name";
    /// Date of birth, an RFC 3339 instant.
    pub const DOB: &str = "dob";
    pub const CATEGORY: &str = "category";
    pub const BREED: &str = "breed";
    pub const VACCINES: &str = "vaccines";
    /// Optional.
    pub const TAGS: &str = "tags";
}

/// Typed form of a `pet_create` command, as a request handler would fill it.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatePet {
    pub name: String,
    pub dob: DateTime<Utc>,
    pub category: String,
    pub breed: String,
    pub vaccines: Vec<String>,
    pub tags: Option<Vec<String>>,
}

impl CreatePet {
    pub fn into_command(self) -> Command {
        let mut builder = CommandBuilder::new(PET_CREATE)
            .value(attr::NAME, self.name)
            .value(attr::DOB, self.dob.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            .value(attr::CATEGORY, self.category)
            .value(attr::BREED, self.breed)
            .values(attr::VACCINES, self.vaccines);

        if let Some(tags) = self.tags {
            builder = builder.values(attr::TAGS, tags);
        }

        builder.build()
    }
}
