// GPU context - explicit handle to the device and the liveness registry
//
// Passed into every constructor that creates GPU objects. Cloning is cheap.

use std::fmt;
use std::sync::Arc;

use super::device::GpuDevice;
use crate::ownership::{LiveRegistry, Ref, RefCounted};

#[derive(Clone)]
pub struct GpuContext {
    device: Arc<dyn GpuDevice>,
    registry: Arc<LiveRegistry>,
}

impl GpuContext {
    /// Context with its own, empty liveness registry.
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self::with_registry(device, LiveRegistry::new())
    }

    pub fn with_registry(device: Arc<dyn GpuDevice>, registry: Arc<LiveRegistry>) -> Self {
        Self { device, registry }
    }

    pub fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }

    pub fn registry(&self) -> &Arc<LiveRegistry> {
        &self.registry
    }

    /// Hand `value` to a new strong handle registered in this context.
    pub fn adopt<T: RefCounted>(&self, value: T) -> Ref<T> {
        Ref::new(value, &self.registry)
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
