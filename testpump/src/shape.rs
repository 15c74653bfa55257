//! Recognition of awaitable values.
//!
//! The runtime accepts two kinds of awaitable value: the built-in [`Task`]
//! and any type implementing [`Awaitable`] that has been registered with the
//! cache. Whether a runtime type is awaitable, and how to get at its
//! awaiter, is decided once per type by a chain of [`ShapeProbe`]s and
//! remembered in a [`ShapeCache`]. Negative answers are cached too, so a
//! type that is not awaitable is probed only once.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use log::trace;

use crate::awaiter::Task;
use crate::failure::Failure;
use crate::value::{self, AnyValue, TypeKey, Value};

/// Invoked once when an awaited computation completes.
pub type Continuation = Box<dyn FnOnce() + Send>;

/// The completion protocol of a structural awaitable.
pub trait Awaiter: Send + 'static {
    type Output: Any + Send + Sync;

    fn is_completed(&self) -> bool;

    /// Registers `continuation` to run when the computation completes. It
    /// may be invoked from any thread.
    fn on_completed(&mut self, continuation: Continuation);

    /// Only called once `is_completed` has returned `true`.
    fn get_result(&mut self) -> Result<Self::Output, Failure>;
}

/// A value that can hand out an [`Awaiter`].
///
/// Implementing the trait is not enough for the runtime to recognise a
/// type; it must also be registered with [`ShapeCache::register`].
pub trait Awaitable: Any + Send {
    type Awaiter: Awaiter;

    fn get_awaiter(self) -> Self::Awaiter;
}

/// An [`Awaiter`] with its output erased to a [`Value`].
pub(crate) trait ErasedAwaiter: Send {
    fn is_completed(&self) -> bool;
    fn on_completed(&mut self, continuation: Continuation);
    fn get_result(&mut self) -> Result<Value, Failure>;
}

impl<A: Awaiter> ErasedAwaiter for A {
    fn is_completed(&self) -> bool {
        Awaiter::is_completed(self)
    }

    fn on_completed(&mut self, continuation: Continuation) {
        Awaiter::on_completed(self, continuation)
    }

    fn get_result(&mut self) -> Result<Value, Failure> {
        Awaiter::get_result(self).map(value::value)
    }
}

type Accessor = fn(AnyValue) -> Result<Box<dyn ErasedAwaiter>, AnyValue>;
type ShapeFn = fn() -> AwaitableShape;

fn access<T: Awaitable>(val: AnyValue) -> Result<Box<dyn ErasedAwaiter>, AnyValue> {
    let awaitable = val.downcast::<T>()?;
    Ok(Box::new(awaitable.get_awaiter()))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShapeKind {
    /// The runtime's own [`Task`].
    BuiltIn,
    /// A registered [`Awaitable`] implementation.
    Structural,
}

/// What the runtime knows about one awaitable type. Never mutated once
/// built.
pub struct AwaitableShape {
    kind: ShapeKind,
    awaitable: TypeKey,
    result: TypeKey,
    accessor: Option<Accessor>,
}

impl AwaitableShape {
    pub fn built_in() -> Self {
        AwaitableShape {
            kind: ShapeKind::BuiltIn,
            awaitable: TypeKey::of::<Task>(),
            result: TypeKey::of::<Value>(),
            accessor: None,
        }
    }

    pub fn structural<T: Awaitable>() -> Self {
        AwaitableShape {
            kind: ShapeKind::Structural,
            awaitable: TypeKey::of::<T>(),
            result: TypeKey::of::<<T::Awaiter as Awaiter>::Output>(),
            accessor: Some(access::<T> as Accessor),
        }
    }

    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn awaitable_type(&self) -> TypeKey {
        self.awaitable
    }

    pub fn result_type(&self) -> TypeKey {
        self.result
    }

    /// Obtains the awaiter of a structural value. The value is handed back
    /// if it is not of this shape's type.
    pub(crate) fn awaiter_of(&self, val: AnyValue) -> Result<Box<dyn ErasedAwaiter>, AnyValue> {
        match self.accessor {
            Some(accessor) if val.type_key() == self.awaitable => accessor(val),
            _ => Err(val),
        }
    }
}

impl fmt::Debug for AwaitableShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitableShape")
            .field("kind", &self.kind)
            .field("awaitable", &self.awaitable.name())
            .field("result", &self.result.name())
            .finish()
    }
}

/// Decides whether a type is awaitable.
pub trait ShapeProbe: Send + Sync {
    fn probe(&self, key: TypeKey) -> Option<AwaitableShape>;
}

/// Recognises [`Task`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltInProbe;

impl ShapeProbe for BuiltInProbe {
    fn probe(&self, key: TypeKey) -> Option<AwaitableShape> {
        (key == TypeKey::of::<Task>()).then(AwaitableShape::built_in)
    }
}

/// Recognises types taught to the cache with [`ShapeCache::register`].
#[derive(Default)]
struct Registry {
    shapes: DashMap<TypeId, ShapeFn>,
}

impl ShapeProbe for Registry {
    fn probe(&self, key: TypeKey) -> Option<AwaitableShape> {
        self.shapes.get(&key.id()).map(|make| (*make)())
    }
}

/// Per-type memo of probe answers.
///
/// Entries are never evicted: the cache grows with the number of distinct
/// types the process has asked about.
pub struct ShapeCache {
    entries: DashMap<TypeId, Option<Arc<AwaitableShape>>>,
    probes: Vec<Box<dyn ShapeProbe>>,
    registry: Registry,
}

impl Default for ShapeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeCache {
    pub fn new() -> Self {
        Self::with_probes(vec![Box::new(BuiltInProbe)])
    }

    /// A cache consulting `probes` in order. Registered structural types
    /// are always recognised after the chain has been tried.
    pub fn with_probes(probes: Vec<Box<dyn ShapeProbe>>) -> Self {
        ShapeCache {
            entries: DashMap::new(),
            probes,
            registry: Registry::default(),
        }
    }

    /// The process-wide cache used by the adapters.
    pub fn global() -> &'static ShapeCache {
        static GLOBAL: OnceLock<ShapeCache> = OnceLock::new();
        GLOBAL.get_or_init(ShapeCache::new)
    }

    /// Teaches the cache a structural awaitable type.
    pub fn register<T: Awaitable>(&self) {
        let key = TypeKey::of::<T>();
        self.registry
            .shapes
            .insert(key.id(), AwaitableShape::structural::<T> as ShapeFn);
        // A type probed before it was registered has a stale negative entry.
        self.entries.remove_if(&key.id(), |_, shape| shape.is_none());
        trace!("registered awaitable {}", key);
    }

    /// The shape of `key`, or `None` if it is not awaitable. Probes run
    /// only on a miss; when threads race on a miss the first answer stored
    /// is the one every caller gets.
    pub fn probe(&self, key: TypeKey) -> Option<Arc<AwaitableShape>> {
        if let Some(entry) = self.entries.get(&key.id()) {
            return entry.value().clone();
        }

        let found = self
            .probes
            .iter()
            .find_map(|p| p.probe(key))
            .or_else(|| self.registry.probe(key))
            .map(Arc::new);
        trace!("probed {}: awaitable = {}", key, found.is_some());

        self.entries.entry(key.id()).or_insert(found).value().clone()
    }

    pub fn is_awaitable(&self, key: TypeKey) -> bool {
        self.probe(key).is_some()
    }

    /// The type an awaitable of type `key` produces, if it is awaitable.
    pub fn result_type(&self, key: TypeKey) -> Option<TypeKey> {
        self.probe(key).map(|shape| shape.result_type())
    }

    /// Number of types with a cached answer.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ShapeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeCache")
            .field("entries", &self.entries.len())
            .field("probes", &self.probes.len())
            .field("registered", &self.registry.shapes.len())
            .finish()
    }
}

/// Whether values of type `key` are awaitable, according to the global
/// cache.
pub fn is_awaitable(key: TypeKey) -> bool {
    ShapeCache::global().is_awaitable(key)
}

pub fn result_type(key: TypeKey) -> Option<TypeKey> {
    ShapeCache::global().result_type(key)
}
