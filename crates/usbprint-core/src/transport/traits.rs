//! USB transport layer abstraction.
//!
//! Defines the `UsbBackend` / `UsbDevice` / `UsbHandle` traits the printer
//! engine is written against, allowing different implementations (nusb,
//! mock, etc.).

use std::time::Duration;

use thiserror::Error;

use super::descriptors::{ConfigDesc, DeviceDesc};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Entity not found")]
    NotFound,

    #[error("Resource busy")]
    Busy,

    #[error("Timeout after {timeout_ms}ms ({transferred} bytes transferred)")]
    Timeout { timeout_ms: u64, transferred: usize },

    #[error("Endpoint stalled")]
    Stall,

    #[error("Transfer aborted")]
    Aborted,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_busy(&self) -> bool {
        matches!(self, TransportError::Busy)
    }
}

/// bmRequestType type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Standard,
    Class,
    Vendor,
}

/// bmRequestType recipient bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup packet fields, direction excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub control_type: ControlType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Host USB stack: lists attached devices.
pub trait UsbBackend: Send + Sync {
    type Device: UsbDevice;

    fn devices(&self) -> Result<Vec<Self::Device>, TransportError>;
}

/// An attached (not necessarily opened) device.
pub trait UsbDevice: Clone + Send + Sync {
    type Handle: UsbHandle + 'static;

    fn descriptor(&self) -> DeviceDesc;

    /// Configuration descriptors, in configuration-index order.
    fn configurations(&self) -> Result<Vec<ConfigDesc>, TransportError>;

    /// Open a claim-capable handle.
    fn open(&self) -> Result<Self::Handle, TransportError>;

    /// USB serial-number string, if the device has one.
    fn serial_number(&self) -> Option<String>;
}

/// An open device handle.
///
/// Every method takes `&self`: the handle is shared between the write path,
/// the back-channel reader and the side-channel thread, and the backend is
/// responsible for keeping per-endpoint traffic independent.
pub trait UsbHandle: Send + Sync {
    /// Whether a kernel driver is bound to `interface`.
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError>;

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransportError>;

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), TransportError>;

    fn set_configuration(&self, value: u8) -> Result<(), TransportError>;

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn release_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Full USB port reset.
    fn reset(&self) -> Result<(), TransportError>;

    fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Write to a bulk-OUT endpoint.
    ///
    /// A timeout reports the bytes accepted so far in
    /// [`TransportError::Timeout`].
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from a bulk-IN endpoint.
    fn read_bulk(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}
