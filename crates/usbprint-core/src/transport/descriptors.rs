//! Owned snapshots of USB descriptors.
//!
//! Backends translate their own descriptor types into these so enumeration
//! can be written once and driven from a mock.

use crate::protocol::constants::ENDPOINT_DIR_IN;

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDesc {
    pub address: u8,
    pub kind: TransferKind,
}

impl EndpointDesc {
    pub fn bulk_in(number: u8) -> Self {
        Self {
            address: number | ENDPOINT_DIR_IN,
            kind: TransferKind::Bulk,
        }
    }

    pub fn bulk_out(number: u8) -> Self {
        Self {
            address: number & !ENDPOINT_DIR_IN,
            kind: TransferKind::Bulk,
        }
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIR_IN != 0
    }

    pub fn is_bulk(&self) -> bool {
        self.kind == TransferKind::Bulk
    }
}

/// One alternate setting of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSettingDesc {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDesc {
    pub number: u8,
    pub alt_settings: Vec<AltSettingDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDesc {
    /// bConfigurationValue.
    pub value: u8,
    pub interfaces: Vec<InterfaceDesc>,
}

/// Device-level identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDesc {
    pub vendor_id: u16,
    pub product_id: u16,
}
