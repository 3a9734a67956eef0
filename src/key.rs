//! Input keys identifying cacheable calls.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;
use serde::{Deserialize, Serialize};

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for argument values that can take part in an [`InputKey`].
///
/// Implemented automatically for every `Hash + Eq + Debug + Send + Sync + 'static` type.
/// The trait is object-safe, so keys of different method types share one registry.
pub trait CacheKey: DynHash + DynEq + Debug + Send + Sync {
    /// Get the key as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> CacheKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(CacheKey);

/// Static name of a cacheable method, also used to route remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub &'static str);

impl MethodId {
    /// The method name.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Identity of the service instance a method is invoked on.
///
/// Free functions and singleton services use [`ReceiverId::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReceiverId(pub u64);

impl ReceiverId {
    /// The receiver of free functions.
    pub const NONE: ReceiverId = ReceiverId(0);
}

/// Identity of one cacheable call: method, receiver and argument values.
///
/// Cheap to clone; the arguments are shared behind an `Arc`.
#[derive(Clone)]
pub struct InputKey {
    method: MethodId,
    receiver: ReceiverId,
    method_type: TypeId,
    args: Arc<dyn CacheKey>,
}

impl InputKey {
    /// Build a key from a method value. The value itself carries the arguments.
    pub fn new<M: CacheKey + 'static>(method: MethodId, receiver: ReceiverId, args: M) -> Self {
        Self {
            method,
            receiver,
            method_type: TypeId::of::<M>(),
            args: Arc::new(args),
        }
    }

    /// The method this key belongs to.
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// The receiver this key belongs to.
    pub fn receiver(&self) -> ReceiverId {
        self.receiver
    }

    /// Downcast the arguments to their original type.
    pub fn downcast<M: 'static>(&self) -> Option<&M> {
        self.args.as_any().downcast_ref()
    }

    /// Debug representation used in logs, traces and cycle reports.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }
}

impl Debug for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.receiver == ReceiverId::NONE {
            write!(f, "{}{:?}", self.method, self.args)
        } else {
            write!(f, "{}@{}{:?}", self.method, self.receiver.0, self.args)
        }
    }
}

impl Hash for InputKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.method.hash(state);
        self.receiver.hash(state);
        self.method_type.hash(state);
        self.args.hash(state);
    }
}

impl PartialEq for InputKey {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.receiver == other.receiver
            && self.method_type == other.method_type
            && self.args.dyn_eq(other.args.as_any())
    }
}

impl Eq for InputKey {}

/// Serialized form of an [`InputKey`], stable across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireKey {
    /// Method name.
    pub method: String,
    /// Receiver identity.
    pub receiver: ReceiverId,
    /// bincode-encoded argument value.
    pub args: Vec<u8>,
}

impl WireKey {
    /// Encode the arguments of a call.
    pub fn encode<A: Serialize>(
        method: MethodId,
        receiver: ReceiverId,
        args: &A,
    ) -> Result<Self, bincode::Error> {
        Ok(Self {
            method: method.name().to_string(),
            receiver,
            args: bincode::serialize(args)?,
        })
    }

    /// String form used as a persisted cache key.
    pub fn cache_key(&self) -> String {
        let mut out = String::with_capacity(self.method.len() + 24 + self.args.len() * 2);
        out.push_str(&self.method);
        out.push('#');
        out.push_str(&self.receiver.0.to_string());
        out.push(':');
        for byte in &self.args {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Square(i64);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Cube(i64);

    #[test]
    fn test_structural_equality() {
        let a = InputKey::new(MethodId("square"), ReceiverId::NONE, Square(7));
        let b = InputKey::new(MethodId("square"), ReceiverId::NONE, Square(7));
        let c = InputKey::new(MethodId("square"), ReceiverId::NONE, Square(8));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.downcast::<Square>(), Some(&Square(7)));
    }

    #[test]
    fn test_receiver_and_type_are_part_of_identity() {
        let a = InputKey::new(MethodId("pow"), ReceiverId::NONE, Square(2));
        let b = InputKey::new(MethodId("pow"), ReceiverId(1), Square(2));
        let c = InputKey::new(MethodId("pow"), ReceiverId::NONE, Cube(2));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(b.debug_repr(), "pow@1Square(2)");
    }

    #[test]
    fn test_wire_key_is_stable() {
        let a = WireKey::encode(MethodId("get_user"), ReceiverId(3), &(42u64, "x")).unwrap();
        let b = WireKey::encode(MethodId("get_user"), ReceiverId(3), &(42u64, "x")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("get_user#3:2a00"));
    }
}
