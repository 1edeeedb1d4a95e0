//! Transport layer module.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod descriptors;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use descriptors::{
    AltSettingDesc, ConfigDesc, DeviceDesc, EndpointDesc, InterfaceDesc, TransferKind,
};
pub use mock::{MockBackend, MockDevice, MockHandle, MockState, ReadOutcome, WriteOutcome};
pub use self::nusb::{NusbBackend, NusbDevice, NusbHandle};
pub use traits::{
    ControlRequest, ControlType, Recipient, TransportError, UsbBackend, UsbDevice, UsbHandle,
};

/// Lock a mutex, recovering the data if another thread panicked with it held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
