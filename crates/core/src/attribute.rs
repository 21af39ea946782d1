//! Loosely-typed command attributes.
//!
//! A command carries a bag of named values. Each value is one of a small closed
//! set of primitive kinds, or a homogeneous list of one of them. Typed access
//! goes through [`FromAttribute`], which matches on the variant and reports a
//! mismatch instead of coercing.

use serde::{Deserialize, Serialize};

use crate::error::{AttributeError, AttributeResult};

/// Kind of a stored attribute value (or of a list's elements).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    String,
    Integer,
    Boolean,
    Float,
    List,
}

impl core::fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Float => "float",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// A single attribute value.
///
/// Serialized adjacently tagged so that integers and floats, and empty lists of
/// different element kinds, survive a JSON round trip with their type intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Float(f64),
    List(AttributeList),
}

/// Homogeneous list of primitive values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "of", content = "items", rename_all = "snake_case")]
pub enum AttributeList {
    String(Vec<String>),
    Integer(Vec<i64>),
    Boolean(Vec<bool>),
    Float(Vec<f64>),
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::String(_) => AttributeKind::String,
            Self::Integer(_) => AttributeKind::Integer,
            Self::Boolean(_) => AttributeKind::Boolean,
            Self::Float(_) => AttributeKind::Float,
            Self::List(_) => AttributeKind::List,
        }
    }
}

impl AttributeList {
    pub fn element_kind(&self) -> AttributeKind {
        match self {
            Self::String(_) => AttributeKind::String,
            Self::Integer(_) => AttributeKind::Integer,
            Self::Boolean(_) => AttributeKind::Boolean,
            Self::Float(_) => AttributeKind::Float,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::String(v) => v.len(),
            Self::Integer(v) => v.len(),
            Self::Boolean(v) => v.len(),
            Self::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

macro_rules! impl_value_from {
    ($variant:ident, $($t:ty => $conv:expr),+ $(,)?) => {
        $(
            impl From<$t> for AttributeValue {
                fn from(value: $t) -> Self {
                    AttributeValue::$variant(($conv)(value))
                }
            }
        )+
    };
}

impl_value_from!(String, String => |v| v, &str => |v: &str| v.to_owned(), &String => |v: &String| v.clone());
impl_value_from!(Integer, i64 => |v| v, i32 => i64::from, u32 => i64::from);
impl_value_from!(Boolean, bool => |v| v);
impl_value_from!(Float, f64 => |v| v, f32 => f64::from);

macro_rules! impl_list_from {
    ($variant:ident, $($t:ty => $conv:expr),+ $(,)?) => {
        $(
            impl From<Vec<$t>> for AttributeList {
                fn from(values: Vec<$t>) -> Self {
                    AttributeList::$variant(values.into_iter().map($conv).collect())
                }
            }

            impl From<Vec<$t>> for AttributeValue {
                fn from(values: Vec<$t>) -> Self {
                    AttributeValue::List(values.into())
                }
            }
        )+
    };
}

impl_list_from!(String, String => |v| v, &str => |v: &str| v.to_owned());
impl_list_from!(Integer, i64 => |v| v, i32 => i64::from);
impl_list_from!(Boolean, bool => |v| v);
impl_list_from!(Float, f64 => |v| v);

impl From<AttributeList> for AttributeValue {
    fn from(list: AttributeList) -> Self {
        AttributeValue::List(list)
    }
}

/// Types that can be read out of an [`AttributeValue`].
pub trait FromAttribute: Sized {
    /// Kind this type expects to find.
    const KIND: AttributeKind;

    fn from_attribute(attribute: &str, value: &AttributeValue) -> AttributeResult<Self>;
}

/// Element types allowed inside an [`AttributeList`].
pub trait ListElement: Sized {
    const KIND: AttributeKind;

    fn from_list(list: &AttributeList) -> Option<Vec<Self>>;
}

fn mismatch(attribute: &str, expected: AttributeKind, found: &AttributeValue) -> AttributeError {
    AttributeError::TypeMismatch {
        attribute: attribute.to_owned(),
        expected,
        found: found.kind(),
    }
}

macro_rules! impl_scalar {
    ($t:ty, $variant:ident) => {
        impl FromAttribute for $t {
            const KIND: AttributeKind = AttributeKind::$variant;

            fn from_attribute(attribute: &str, value: &AttributeValue) -> AttributeResult<Self> {
                match value {
                    AttributeValue::$variant(v) => Ok(v.clone()),
                    other => Err(mismatch(attribute, <$t as FromAttribute>::KIND, other)),
                }
            }
        }

        impl ListElement for $t {
            const KIND: AttributeKind = AttributeKind::$variant;

            fn from_list(list: &AttributeList) -> Option<Vec<Self>> {
                match list {
                    AttributeList::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_scalar!(String, String);
impl_scalar!(i64, Integer);
impl_scalar!(bool, Boolean);
impl_scalar!(f64, Float);

impl<T: ListElement> FromAttribute for Vec<T> {
    const KIND: AttributeKind = AttributeKind::List;

    fn from_attribute(attribute: &str, value: &AttributeValue) -> AttributeResult<Self> {
        let AttributeValue::List(list) = value else {
            return Err(mismatch(attribute, <Self as FromAttribute>::KIND, value));
        };

        T::from_list(list).ok_or_else(|| AttributeError::ListTypeMismatch {
            attribute: attribute.to_owned(),
            expected: <T as ListElement>::KIND,
            found: list.element_kind(),
        })
    }
}
