//! Context slots and the per-request context they fill.
//!
//! A [`ContextSlot`] is a named, typed extension point. It is declared once,
//! usually as a `const`, and registered in a [`ContextMap`] at startup:
//!
//! ```rust
//! use conduit::{ConfigShape, ContextMap, ContextSlot, FailureKind, Presence};
//!
//! #[derive(Debug)]
//! struct Tenant(String);
//!
//! const TENANT: ContextSlot<Tenant> =
//!     ContextSlot::new("tenant", FailureKind::Invalid, ConfigShape::Flag);
//!
//! let map = ContextMap::new().slot(&TENANT).unwrap();
//! assert!(map.get("tenant").is_some());
//! ```
//!
//! During a request, each dynamic middleware contributes at most one value
//! for its slot. The values accumulate in a [`Context`], which is
//! append-only: a value becomes visible in one step, after its middleware
//! succeeded, and is never replaced.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;

use crate::error::CompositionError;

/// How a slot's middleware failure is surfaced to the caller.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailureKind {
    /// No usable identity (401).
    Unauthenticated,
    /// Identity present but not allowed (403).
    Unauthorized,
    /// Request is malformed for this slot (400).
    Invalid,
}

/// Shape of the per-route configuration value a slot accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigShape {
    Flag,
    StringList,
    /// Any JSON value; the middleware validates it.
    Any,
}

impl ConfigShape {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Flag => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ConfigShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flag => "a boolean",
            Self::StringList => "an array of strings",
            Self::Any => "a JSON value",
        })
    }
}

/// Whether a slot's middleware runs on routes that do not mention the slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Presence {
    /// Skip the middleware unless the route configures the slot.
    #[default]
    Optional,
    /// Always run; the middleware sees `null` when the route is silent.
    /// Used by slots whose absence carries meaning.
    Always,
}

/// A named, typed extension point.
///
/// `T` is the capability type the slot contributes to the [`Context`].
/// Slots with no capability (pure checks) use `()`.
pub struct ContextSlot<T> {
    name: &'static str,
    failure: FailureKind,
    shape: ConfigShape,
    presence: Presence,
    _capability: PhantomData<fn() -> T>,
}

impl<T> ContextSlot<T> {
    pub const fn new(name: &'static str, failure: FailureKind, shape: ConfigShape) -> Self {
        Self { name, failure, shape, presence: Presence::Optional, _capability: PhantomData }
    }

    pub const fn always(self) -> Self {
        Self { presence: Presence::Always, ..self }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn failure(&self) -> FailureKind {
        self.failure
    }
}

impl<T: Send + Sync + 'static> ContextSlot<T> {
    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            name: self.name,
            failure: self.failure,
            shape: self.shape,
            presence: self.presence,
            capability: TypeId::of::<T>(),
            capability_name: type_name::<T>(),
        }
    }
}

impl<T> fmt::Debug for ContextSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("name", &self.name)
            .field("failure", &self.failure)
            .field("shape", &self.shape)
            .field("presence", &self.presence)
            .finish()
    }
}

/// Type-erased description of a registered slot.
#[derive(Clone, Debug)]
pub struct SlotInfo {
    pub name: &'static str,
    pub failure: FailureKind,
    pub shape: ConfigShape,
    pub presence: Presence,
    pub capability: TypeId,
    pub capability_name: &'static str,
}

/// Registry of the slots an application's middleware may fill.
///
/// Built once at startup and never mutated afterwards.
#[derive(Clone, Debug, Default)]
pub struct ContextMap {
    slots: Vec<SlotInfo>,
}

impl ContextMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot. Slot names are unique within a map.
    pub fn slot<T: Send + Sync + 'static>(mut self, slot: &ContextSlot<T>) -> Result<Self, CompositionError> {
        if self.get(slot.name).is_some() {
            return Err(CompositionError::DuplicateSlot(slot.name));
        }
        self.slots.push(slot.info());
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&SlotInfo> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlotInfo> {
        self.slots.iter()
    }
}

/// Capability values merged so far for one request.
#[derive(Clone, Default)]
pub struct Context {
    values: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value contributed for `slot`, if its middleware ran and provided one.
    pub fn get<T: 'static>(&self, slot: &ContextSlot<T>) -> Option<&T> {
        self.values.get(slot.name)?.downcast_ref::<T>()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merges one slot's value. The composer guarantees one provider per
    /// slot, so an existing value is never overwritten.
    pub(crate) fn merge(&mut self, name: &'static str, value: Arc<dyn Any + Send + Sync>) {
        self.values.entry(name).or_insert(value);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort();
        f.debug_struct("Context").field("slots", &names).finish()
    }
}
