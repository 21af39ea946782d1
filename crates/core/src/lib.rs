//! `petstore-core` — the command model.
//!
//! This crate contains the transport-agnostic command envelope and its
//! attribute model (no broker or storage concerns).

pub mod attribute;
pub mod builder;
pub mod command;
pub mod error;
pub mod id;
pub mod pet;

pub use attribute::{AttributeKind, AttributeList, AttributeValue, FromAttribute, ListElement};
pub use builder::{command, CommandBuilder};
pub use command::Command;
pub use error::{AttributeError, AttributeResult, InvalidId};
pub use id::CommandId;
pub use pet::{CreatePet, PET_CREATE};
