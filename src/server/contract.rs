//! Type contract - the message and state shapes a server definition accepts.

use std::fmt;

use serde_json::Value;

/// Declares the cast, call and state shapes of a server definition.
///
/// The associated types close the set of messages a producer can even construct. The
/// `is_valid_*` checks narrow that set further at runtime; they run at the public entry
/// points before anything is enqueued, and on every state write inside the worker.
pub trait TypeContract {
    /// Messages accepted by `cast`.
    type Cast: Send + fmt::Debug + 'static;
    /// Messages accepted by `call`.
    type Call: Send + fmt::Debug + 'static;
    /// The state owned by the worker.
    type State: Send + Sync + fmt::Debug + 'static;

    fn is_valid_cast(_msg: &Self::Cast) -> bool {
        true
    }

    fn is_valid_call(_msg: &Self::Call) -> bool {
        true
    }

    fn is_valid_state(_state: &Self::State) -> bool {
        true
    }
}

/// Which part of the contract a value was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractRole {
    Cast,
    Call,
    State,
}

impl fmt::Display for ContractRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractRole::Cast => write!(f, "cast message"),
            ContractRole::Call => write!(f, "call message"),
            ContractRole::State => write!(f, "state"),
        }
    }
}

/// Shape descriptor for servers exchanging untyped JSON messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsonShape {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Any,
}

impl JsonShape {
    /// The concrete shape of a value. Never returns `Any`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonShape::Null,
            Value::Bool(_) => JsonShape::Bool,
            Value::Number(_) => JsonShape::Number,
            Value::String(_) => JsonShape::String,
            Value::Array(_) => JsonShape::Array,
            Value::Object(_) => JsonShape::Object,
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        self == JsonShape::Any || self == JsonShape::of(value)
    }

    /// Checks a value against a declared shape set. An empty set accepts nothing.
    pub fn any_matches(shapes: &[JsonShape], value: &Value) -> bool {
        shapes.iter().any(|shape| shape.matches(value))
    }
}

impl fmt::Display for JsonShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonShape::Null => "null",
            JsonShape::Bool => "bool",
            JsonShape::Number => "number",
            JsonShape::String => "string",
            JsonShape::Array => "array",
            JsonShape::Object => "object",
            JsonShape::Any => "any",
        };
        f.write_str(name)
    }
}
