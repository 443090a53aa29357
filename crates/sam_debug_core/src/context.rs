//! Typed, write-once attribute bag shared by the steps of one pipeline run.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::{DebugError, Result};

/// Names an attribute and fixes the type of the value stored under it.
pub struct AttributeKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

#[derive(Default)]
pub struct AttributeContext {
    values: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl AttributeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`. Each key can be written once per run.
    pub fn put_attribute<T>(&mut self, key: &AttributeKey<T>, value: T) -> Result<()>
    where
        T: Send + Sync + 'static,
    {
        if self.values.contains_key(key.name) {
            return Err(DebugError::DuplicateAttribute(key.name));
        }
        tracing::debug!(attribute = key.name, "publishing attribute");
        self.values.insert(key.name, Box::new(value));
        Ok(())
    }

    pub fn get_attribute<T: 'static>(&self, key: &AttributeKey<T>) -> Option<&T> {
        self.values
            .get(key.name)
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Reads an attribute an earlier step must have published.
    ///
    /// A miss means the steps ran out of order or one was left out of the
    /// pipeline, so it is reported as [`DebugError::MissingAttribute`].
    pub fn get_required_attribute<T: 'static>(&self, key: &AttributeKey<T>) -> Result<&T> {
        self.get_attribute(key)
            .ok_or(DebugError::MissingAttribute(key.name))
    }

    pub fn contains<T>(&self, key: &AttributeKey<T>) -> bool {
        self.values.contains_key(key.name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for AttributeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("AttributeContext").field("keys", &keys).finish()
    }
}
