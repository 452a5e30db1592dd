use fixvk_protocol::{Driver, GpuHandle};

use crate::error::Result;

/// Handles created by a multi-step build that has not finished yet.
#[derive(Debug, Default)]
pub(crate) struct Partial {
    created: Vec<GpuHandle>,
}

impl Partial {
    /// Remember `handle` so a later failure destroys it, and hand it back.
    pub(crate) fn track(&mut self, handle: GpuHandle) -> GpuHandle {
        self.created.push(handle);
        handle
    }

    fn rollback<D: Driver>(self, driver: &mut D) {
        for handle in self.created.into_iter().rev() {
            driver.destroy(handle);
        }
    }
}

/// Run `build`; if it fails, destroy everything it tracked in reverse order.
pub(crate) fn with_rollback<D, T>(
    driver: &mut D,
    build: impl FnOnce(&mut D, &mut Partial) -> Result<T>,
) -> Result<T>
where
    D: Driver,
{
    let mut partial = Partial::default();
    match build(driver, &mut partial) {
        Ok(value) => Ok(value),
        Err(err) => {
            partial.rollback(driver);
            Err(err)
        }
    }
}
