use std::sync::Arc;

use error_stack::Report;

use super::DeviceBindings;
use super::DeviceInfo;
use super::Health;
use crate::error::BackendError;

/// Hardware-specific discovery for one resource kind.
///
/// Implementations may block on I/O; callers never hold a snapshot lock
/// while invoking them.
pub trait DeviceBackend: Send + Sync + 'static {
    /// Lists the devices currently present.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, Report<BackendError>>;

    /// Reads the health of one device. An `Err` is a transient read failure.
    fn check_health(&self, device: &DeviceInfo) -> Result<Health, Report<BackendError>>;

    /// Looks up what a container needs to use the device.
    fn bindings(&self, device: &DeviceInfo) -> Result<DeviceBindings, Report<BackendError>>;
}

impl<T> DeviceBackend for Arc<T>
where
    T: DeviceBackend,
{
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, Report<BackendError>> {
        (**self).enumerate()
    }

    fn check_health(&self, device: &DeviceInfo) -> Result<Health, Report<BackendError>> {
        (**self).check_health(device)
    }

    fn bindings(&self, device: &DeviceInfo) -> Result<DeviceBindings, Report<BackendError>> {
        (**self).bindings(device)
    }
}
