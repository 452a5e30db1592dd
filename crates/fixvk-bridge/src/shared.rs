use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use fixvk_protocol::Driver;

use crate::bridge::Bridge;

/// A bridge that several threads can call into, one call at a time.
pub struct SharedBridge<D: Driver> {
    inner: Arc<Mutex<Bridge<D>>>,
}

impl<D: Driver> SharedBridge<D> {
    pub fn new(bridge: Bridge<D>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bridge)),
        }
    }

    /// Hold the bridge across several calls, e.g. a whole scene.
    pub fn lock(&self) -> MutexGuard<'_, Bridge<D>> {
        self.inner.lock()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Bridge<D>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<D: Driver> Clone for SharedBridge<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
