//! Reuse pool for context storage.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use super::{Context, PathParams, Storage};
use crate::http::Request;
use crate::logger::Logger;
use crate::validate::Validator;

/// Default number of idle storage slots kept by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Recycles the heap storage of [`Context`]s across requests.
///
/// [`acquire`](Self::acquire) hands out a [`PooledContext`] guard; dropping
/// the guard clears the storage and returns it, whatever the handler did.
pub struct ContextPool {
    idle: Mutex<Vec<Storage>>,
    capacity: usize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Builds a context for `request` on top of recycled storage.
    pub fn acquire(
        &self,
        request: Request,
        params: PathParams,
        validator: Arc<dyn Validator>,
        logger: Logger,
    ) -> PooledContext<'_> {
        let storage = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();

        PooledContext {
            context: Context::assemble(request, params, validator, logger, storage),
            pool: self,
        }
    }

    /// Number of storage slots waiting to be reused.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, mut storage: Storage) {
        storage.clear();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.capacity {
            idle.push(storage);
        }
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

/// A [`Context`] on loan from a [`ContextPool`].
pub struct PooledContext<'a> {
    context: Context,
    pool: &'a ContextPool,
}

impl Deref for PooledContext<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        &mut self.context
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut self.context.storage);
        self.pool.release(storage);
    }
}
