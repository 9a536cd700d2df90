//! Compile-time object registry. Each replicated component type claims an
//! [`ObjectKind`] and supplies a build function; registration happens
//! explicitly at startup, never by scanning for attributed types at
//! runtime.

use std::{any::Any, collections::HashMap};

use crate::{
    object::record::{RecordBuilder, RegistrationError},
    types::ObjectKind,
};

/// A type whose instances replicate across the session.
///
/// `build` declares the record shape — the fixed, ordered property and
/// event slots — and returns the typed handles the application keeps.
/// The same declaration order must be produced on every peer, which is
/// automatic as long as `build` is deterministic.
pub trait Replicated: Sized + Send + Sync + 'static {
    fn kind() -> ObjectKind;
    fn build(builder: &mut RecordBuilder) -> Self;
}

type BlueprintFn = Box<dyn Fn(&mut RecordBuilder) -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Kind → blueprint mapping used to instantiate records for remote spawns.
pub struct ObjectRegistry {
    blueprints: HashMap<ObjectKind, BlueprintFn>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            blueprints: HashMap::new(),
        }
    }

    /// Register a replicated type. Call once per type at startup; the set
    /// of registered kinds must agree across all peers.
    pub fn register<R: Replicated>(&mut self) -> Result<(), RegistrationError> {
        let kind = R::kind();
        if self.blueprints.contains_key(&kind) {
            return Err(RegistrationError::DuplicateKind { kind });
        }
        self.blueprints
            .insert(kind, Box::new(|builder| Box::new(R::build(builder))));
        Ok(())
    }

    pub fn contains(&self, kind: ObjectKind) -> bool {
        self.blueprints.contains_key(&kind)
    }

    pub(crate) fn instantiate(
        &self,
        kind: ObjectKind,
        builder: &mut RecordBuilder,
    ) -> Result<Box<dyn Any + Send + Sync>, RegistrationError> {
        let blueprint = self
            .blueprints
            .get(&kind)
            .ok_or(RegistrationError::UnknownKind { kind })?;
        Ok(blueprint(builder))
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}
