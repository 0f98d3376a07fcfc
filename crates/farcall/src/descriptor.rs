//! Wire description of an exposed entity.
//!
//! A descriptor is computed once, when the entity first crosses the boundary.
//! It is not refreshed if the entity gains or loses members afterwards; the
//! host can still reach such members through the generic stand-in operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{PropertyKey, SlotId};
use crate::entity::Exposed;

/// Keys every bare callable already carries. They never appear in a descriptor.
const CALLABLE_BASELINE: &[&str] = &["length", "name", "prototype", "arguments", "caller"];

/// What an exposed entity is, as reported by the entity itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    /// Callable, and constructible with function semantics.
    PlainFunction,
    /// Callable, never constructible.
    ArrowFunction,
    /// Constructible, never callable.
    Class,
    Object,
}

impl EntityKind {
    pub fn is_callable(&self) -> bool {
        matches!(self, Self::PlainFunction | Self::ArrowFunction)
    }

    pub fn is_constructible(&self) -> bool {
        matches!(self, Self::PlainFunction | Self::Class)
    }
}

/// Runtime kind of a member's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberKind {
    PlainFunction,
    ArrowFunction,
    Class,
    Object,
    Null,
    Boolean,
    Number,
    String,
    Array,
    /// A plain JSON object carried as data.
    Map,
}

impl MemberKind {
    pub fn of_value(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Map,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Self::PlainFunction | Self::ArrowFunction)
    }

    /// Whether a value of this kind is exposed by reference rather than sent as data.
    pub fn is_exposable(&self) -> bool {
        matches!(
            self,
            Self::PlainFunction | Self::ArrowFunction | Self::Class | Self::Object
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainFunction => "plainFunction",
            Self::ArrowFunction => "arrowFunction",
            Self::Class => "class",
            Self::Object => "object",
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Map => "map",
        }
    }
}

impl From<EntityKind> for MemberKind {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::PlainFunction => Self::PlainFunction,
            EntityKind::ArrowFunction => Self::ArrowFunction,
            EntityKind::Class => Self::Class,
            EntityKind::Object => Self::Object,
        }
    }
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    pub name: PropertyKey,
    pub kind: MemberKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub slot: SlotId,
    pub name: String,
    pub kind: EntityKind,
    pub members: Vec<MemberDescriptor>,
}

impl Descriptor {
    pub fn member(&self, name: &PropertyKey) -> Option<&MemberDescriptor> {
        self.members.iter().find(|m| &m.name == name)
    }

    pub fn callable_members(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members.iter().filter(|m| m.kind.is_callable())
    }

    pub fn data_members(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members.iter().filter(|m| !m.kind.is_callable())
    }
}

/// Build the descriptor for `entity` living in `slot`.
///
/// Members are the entity's own keys in their reported order, minus the
/// callable baseline, each tagged with the kind of its current value.
pub fn describe(slot: SlotId, entity: &dyn Exposed) -> Descriptor {
    let kind = entity.kind();
    let members = entity
        .own_keys()
        .into_iter()
        .filter(|key| !is_baseline(kind, key))
        .filter_map(|key| {
            let value = entity.get(&key)?;
            Some(MemberDescriptor {
                kind: value.kind(),
                name: key,
            })
        })
        .collect();

    Descriptor {
        slot,
        name: entity.name().to_string(),
        kind,
        members,
    }
}

fn is_baseline(kind: EntityKind, key: &PropertyKey) -> bool {
    if kind == EntityKind::Object {
        return false;
    }
    key.as_name()
        .is_some_and(|name| CALLABLE_BASELINE.contains(&name))
}
