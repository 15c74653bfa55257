//! Type-erased values passed into and out of the pump.
//!
//! Test bodies hand the runtime values whose concrete type is only known at
//! run time. [`AnyValue`] carries such a value together with its
//! [`TypeKey`], which is what the shape cache is keyed by. Completed
//! computations produce a [`Value`], a shared pointer, so that asking for the
//! same result twice returns the very same allocation.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// The result of a completed computation.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Wraps `val` as a [`Value`].
pub fn value<T: Any + Send + Sync>(val: T) -> Value {
    Arc::new(val)
}

/// Identifies a concrete runtime type.
#[derive(Clone, Copy, Debug)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: Any + ?Sized>() -> Self {
        TypeKey {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// Names are informational; identity is the `TypeId` alone.
impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl std::hash::Hash for TypeKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// An owned value of some concrete type that the caller may not know
/// statically.
pub struct AnyValue {
    val: Box<dyn Any + Send>,
    key: TypeKey,
}

impl AnyValue {
    pub fn new<T: Any + Send>(val: T) -> Self {
        AnyValue {
            val: Box::new(val),
            key: TypeKey::of::<T>(),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.val.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.val.downcast_ref()
    }

    /// Recovers the concrete value, or gives `self` back if `T` is not its
    /// type.
    pub fn downcast<T: Any>(self) -> Result<T, AnyValue> {
        let AnyValue { val, key } = self;
        match val.downcast::<T>() {
            Ok(v) => Ok(*v),
            Err(val) => Err(AnyValue { val, key }),
        }
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyValue")
            .field("type_name", &self.key.name)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn downcast_gives_value_back_on_mismatch() {
        let v = AnyValue::new(17u32);
        assert_eq!(v.type_key(), TypeKey::of::<u32>());
        let v = v.downcast::<String>().unwrap_err();
        assert_eq!(v.type_name(), "u32");
        assert_eq!(v.downcast::<u32>().unwrap(), 17);
    }

    #[test]
    fn type_key_ignores_name_for_equality() {
        let a = TypeKey::of::<Vec<u8>>();
        let b = TypeKey {
            id: TypeId::of::<Vec<u8>>(),
            name: "alias",
        };
        assert_eq!(a, b);
        assert_ne!(a, TypeKey::of::<Vec<u16>>());
    }
}
