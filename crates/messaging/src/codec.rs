//! Wire encoding of commands.
//!
//! Commands travel as JSON:
//!
//! ```text
//! {
//!   "id": "0190...",
//!   "timestamp": "2024-05-01T10:00:00.123456789Z",
//!   "name": "pet_create",
//!   "attributes": {
//!     "name":     { "type": "string", "value": "fluffy" },
//!     "vaccines": { "type": "list",   "value": { "of": "string", "items": ["rabies"] } }
//!   }
//! }
//! ```
//!
//! Attribute values are tagged so integer/float and empty lists keep their
//! kind; the timestamp keeps nanosecond precision. NaN and infinities have
//! no JSON form and are refused at encode time.

use petstore_core::{AttributeList, AttributeValue, Command};

use crate::error::CodecError;

pub fn encode(command: &Command) -> Result<Vec<u8>, CodecError> {
    if let Some((attribute, _)) = command.attributes().find(|(_, v)| !is_finite(v)) {
        return Err(CodecError::NonFiniteFloat {
            attribute: attribute.to_owned(),
        });
    }
    serde_json::to_vec(command).map_err(CodecError::Encode)
}

fn is_finite(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::Float(f) => f.is_finite(),
        AttributeValue::List(AttributeList::Float(fs)) => fs.iter().all(|f| f.is_finite()),
        _ => true,
    }
}

pub fn decode(bytes: &[u8]) -> Result<Command, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
