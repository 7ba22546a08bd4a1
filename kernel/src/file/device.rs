//! The device switch: read/write handlers indexed by major number.

use crate::{error::KernelError, param::NDEV, proc::ProcPrivateData, sync::SpinLock};

/// Console major number; mknod("console", 1, 0) in init relies on it.
pub const CONSOLE_MAJOR: i16 = 1;

/// A character device's entry points. `addr` is a user address.
#[derive(Clone, Copy)]
pub struct Device {
    pub read: fn(&mut ProcPrivateData, usize, usize) -> Result<usize, KernelError>,
    pub write: fn(&mut ProcPrivateData, usize, usize) -> Result<usize, KernelError>,
}

static DEVICES: SpinLock<[Option<Device>; NDEV]> = SpinLock::new([None; NDEV]);

pub fn register_device(major: i16, device: Device) {
    DEVICES.lock()[usize::try_from(major).unwrap()] = Some(device);
}

pub(super) fn get(major: i16) -> Result<Device, KernelError> {
    let major = usize::try_from(major).map_err(|_| KernelError::InvalidArgument)?;
    DEVICES
        .lock()
        .get(major)
        .copied()
        .flatten()
        .ok_or(KernelError::InvalidArgument)
}
