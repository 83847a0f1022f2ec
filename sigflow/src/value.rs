//! The opaque value container used for labels, messages, and calls.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::{Error, Result};

/// A runtime-typed container.
///
/// All label data, async messages, and configuration arguments flow through
/// `Value`. Well-known primitives are first-class variants; anything else
/// rides in [`Value::Opaque`], a shared `Any` with a recorded type name.
///
/// Structural equality covers the primitive variants. Opaque values compare
/// by pointer identity under `PartialEq`; semantic equality is available
/// through comparators registered with the runtime (see
/// [`Comparators::eq_values`]).
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// The absent value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// An unsigned integer.
    UInt(u64),
    /// A double-precision float.
    Float(f64),
    /// A string.
    Str(String),
    /// Raw octets.
    Bytes(Vec<u8>),
    /// An ordered list of values (also the shape of a call-argument tuple).
    List(Vec<Value>),
    /// Any other type, shared and type-erased.
    Opaque(OpaqueValue),
}

/// The escape hatch carried by [`Value::Opaque`].
#[derive(Clone)]
pub struct OpaqueValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl OpaqueValue {
    /// The `TypeId` of the contained value.
    pub fn type_id(&self) -> TypeId {
        (*self.value).type_id()
    }

    /// The compiler-reported name of the contained type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrows the contained value when the type matches.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        &*self.value
    }
}

impl std::fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opaque<{}>", self.type_name)
    }
}

impl Value {
    /// Wraps an arbitrary value in the opaque escape hatch.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Value {
        Value::Opaque(OpaqueValue {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        })
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// A short name identifying the contained type.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int64",
            Value::UInt(_) => "uint64",
            Value::Float(_) => "float64",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Opaque(opaque) => opaque.type_name(),
        }
    }

    /// Extracts a `bool`, or reports the actual type.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(value) => Ok(*value),
            other => Err(extraction_error("bool", other)),
        }
    }

    /// Extracts a signed integer, converting from `UInt` when it fits.
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(value) => Ok(*value),
            Value::UInt(value) if *value <= i64::MAX as u64 => Ok(*value as i64),
            other => Err(extraction_error("int64", other)),
        }
    }

    /// Extracts an unsigned integer, converting from non-negative `Int`.
    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Value::UInt(value) => Ok(*value),
            Value::Int(value) if *value >= 0 => Ok(*value as u64),
            other => Err(extraction_error("uint64", other)),
        }
    }

    /// Extracts a float, converting from either integer variant.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Float(value) => Ok(*value),
            Value::Int(value) => Ok(*value as f64),
            Value::UInt(value) => Ok(*value as f64),
            other => Err(extraction_error("float64", other)),
        }
    }

    /// Extracts a string slice.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(value) => Ok(value),
            other => Err(extraction_error("string", other)),
        }
    }

    /// Extracts raw octets.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(value) => Ok(value),
            other => Err(extraction_error("bytes", other)),
        }
    }

    /// Extracts a list slice.
    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(value) => Ok(value),
            other => Err(extraction_error("list", other)),
        }
    }

    /// Borrows an opaque payload of the requested type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Opaque(opaque) => opaque.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// A JSON rendering for stats and debug dumps. Opaque payloads render
    /// as their type name.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(value) => serde_json::Value::from(*value),
            Value::Int(value) => serde_json::Value::from(*value),
            Value::UInt(value) => serde_json::Value::from(*value),
            Value::Float(value) => serde_json::Value::from(*value),
            Value::Str(value) => serde_json::Value::from(value.clone()),
            Value::Bytes(value) => serde_json::Value::from(value.clone()),
            Value::List(values) => serde_json::Value::Array(values.iter().map(Value::to_json).collect()),
            Value::Opaque(opaque) => serde_json::Value::from(format!("<{}>", opaque.type_name())),
        }
    }
}

fn extraction_error(wanted: &str, got: &Value) -> Error {
    Error::InvalidArgument(format!("cannot extract {} from a {} value", wanted, got.type_name()))
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(&a.value, &b.value),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Bool(value)
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Value {
        Value::Int(value)
    }
}
impl From<u64> for Value {
    fn from(value: u64) -> Value {
        Value::UInt(value)
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Value {
        Value::Float(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::Str(value.to_owned())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::Str(value)
    }
}
impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Value {
        Value::Bytes(value)
    }
}
impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Value {
        Value::List(value)
    }
}

type Comparator = Box<dyn Fn(&dyn Any, &dyn Any) -> bool + Send + Sync>;

/// Per-type equality comparators for opaque values.
///
/// `PartialEq` on [`Value`] can only compare opaques by identity; semantic
/// comparisons for user types are registered here, on the runtime handle
/// that owns this table. [`eq_values`](Comparators::eq_values) applies them
/// at any nesting depth inside lists.
#[derive(Default)]
pub struct Comparators {
    map: Mutex<HashMap<TypeId, Comparator>>,
}

impl Comparators {
    /// Registers structural equality for `T`.
    pub fn register<T: Any + PartialEq>(&self) {
        self.map.lock().unwrap().insert(
            TypeId::of::<T>(),
            Box::new(|a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }),
        );
    }

    /// Compares two values, consulting registered comparators for opaques
    /// of the same type and falling back to identity. Lists compare
    /// element-wise, so nested opaques reach their comparators too.
    pub fn eq_values(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Opaque(a), Value::Opaque(b)) => {
                if Arc::ptr_eq(&a.value, &b.value) {
                    return true;
                }
                if a.type_id() != b.type_id() {
                    return false;
                }
                match self.map.lock().unwrap().get(&a.type_id()) {
                    Some(compare) => compare(a.as_any(), b.as_any()),
                    None => false,
                }
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| self.eq_values(a, b))
            }
            (a, b) => a == b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_extraction() {
        assert_eq!(Value::from(3i64).as_i64().unwrap(), 3);
        assert_eq!(Value::from(3i64).as_u64().unwrap(), 3);
        assert_eq!(Value::from(2.5f64).as_f64().unwrap(), 2.5);
        assert_eq!(Value::from("hi").as_str().unwrap(), "hi");
        assert!(Value::from("hi").as_i64().is_err());
        assert!(Value::Null.is_null());
    }

    #[test]
    fn equality_within_a_type() {
        assert_eq!(Value::from(1i64), Value::from(1i64));
        assert_ne!(Value::from(1i64), Value::from(1u64)); // different variants
        assert_eq!(Value::from(vec![1u8, 2]), Value::from(vec![1u8, 2]));
    }

    #[test]
    fn opaque_identity_and_comparators() {
        #[derive(PartialEq)]
        struct Gain(f64);

        let a = Value::opaque(Gain(0.5));
        let b = Value::opaque(Gain(0.5));
        assert_eq!(a, a.clone()); // identity
        assert_ne!(a, b); // distinct allocations

        let comparators = Comparators::default();
        assert!(!comparators.eq_values(&a, &b)); // no comparator yet
        comparators.register::<Gain>();
        assert!(comparators.eq_values(&a, &b));
        assert!(comparators.eq_values(&a, &a.clone()));
    }

    #[test]
    fn list_comparison_reaches_nested_comparators() {
        #[derive(PartialEq)]
        struct Tag(u32);

        let a = Value::List(vec![Value::from(1i64), Value::opaque(Tag(9))]);
        let b = Value::List(vec![Value::from(1i64), Value::opaque(Tag(9))]);
        assert_ne!(a, b); // identity comparison sees distinct allocations

        let comparators = Comparators::default();
        assert!(!comparators.eq_values(&a, &b));
        comparators.register::<Tag>();
        assert!(comparators.eq_values(&a, &b));

        // Deeper nesting and mismatched shapes.
        let nested_a = Value::List(vec![a]);
        let nested_b = Value::List(vec![b]);
        assert!(comparators.eq_values(&nested_a, &nested_b));
        let shorter = Value::List(vec![Value::from(1i64)]);
        assert!(!comparators.eq_values(&nested_a, &shorter));
    }

    #[test]
    fn downcast_opaque() {
        let value = Value::opaque(vec![1u32, 2, 3]);
        assert_eq!(value.downcast_ref::<Vec<u32>>().unwrap().len(), 3);
        assert!(value.downcast_ref::<String>().is_none());
        assert!(value.type_name().contains("Vec"));
    }
}
