//! The matched printer interface and its connection state.

use std::sync::Arc;

use crate::protocol::constants::PROTOCOL_BIDIRECTIONAL;
use crate::quirks::QuirkFlags;
use crate::transport::{AltSettingDesc, UsbDevice};

/// Bulk endpoints of the chosen alternate setting.
///
/// Enumeration compares candidates by endpoint *index*; the addresses are
/// looked up once a matcher has accepted the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSelection {
    Indices { write: usize, read: Option<usize> },
    Addresses { write: u8, read: Option<u8> },
}

/// One USB printer interface, possibly open.
pub struct PrinterHandle<D: UsbDevice> {
    pub(crate) device: D,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Index into the device's configuration list.
    pub config_index: usize,
    /// bConfigurationValue of that configuration.
    pub config_value: u8,
    pub interface: u8,
    pub alt_setting: u8,
    /// Number of alternate settings the interface offers.
    pub alt_count: usize,
    pub(crate) alt: AltSettingDesc,
    pub endpoints: EndpointSelection,
    pub protocol: u8,
    pub quirks: QuirkFlags,
    /// A kernel driver was detached at open.
    pub usblp_attached: bool,
    /// Reset the device when closing.
    pub reset_after_job: bool,
    /// Configuration active before open, 0 when unknown.
    pub original_config: u8,
    pub(crate) handle: Option<Arc<D::Handle>>,
}

impl<D: UsbDevice> PrinterHandle<D> {
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Shared OS handle, while open.
    pub fn handle(&self) -> Option<Arc<D::Handle>> {
        self.handle.clone()
    }

    pub fn is_bidirectional(&self) -> bool {
        self.protocol >= PROTOCOL_BIDIRECTIONAL
    }

    /// Turn endpoint indices into addresses. Idempotent.
    pub fn resolve_endpoints(&mut self) {
        if let EndpointSelection::Indices { write, read } = self.endpoints {
            let address = |index: usize| self.alt.endpoints.get(index).map(|ep| ep.address);
            self.endpoints = EndpointSelection::Addresses {
                write: address(write).unwrap_or_default(),
                read: read.and_then(address),
            };
        }
    }

    /// Drop the back channel.
    pub fn force_unidirectional(&mut self) {
        self.endpoints = match self.endpoints {
            EndpointSelection::Indices { write, .. } => {
                EndpointSelection::Indices { write, read: None }
            }
            EndpointSelection::Addresses { write, .. } => {
                EndpointSelection::Addresses { write, read: None }
            }
        };
    }

    /// Bulk-OUT address, once resolved.
    pub fn write_endpoint(&self) -> Option<u8> {
        match self.endpoints {
            EndpointSelection::Addresses { write, .. } => Some(write),
            EndpointSelection::Indices { .. } => None,
        }
    }

    /// Bulk-IN address, once resolved and if there is a back channel.
    pub fn read_endpoint(&self) -> Option<u8> {
        match self.endpoints {
            EndpointSelection::Addresses { read, .. } => read,
            EndpointSelection::Indices { .. } => None,
        }
    }
}

impl<D: UsbDevice> std::fmt::Debug for PrinterHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterHandle")
            .field("vendor_id", &format_args!("{:04X}", self.vendor_id))
            .field("product_id", &format_args!("{:04X}", self.product_id))
            .field("config_index", &self.config_index)
            .field("interface", &self.interface)
            .field("alt_setting", &self.alt_setting)
            .field("endpoints", &self.endpoints)
            .field("protocol", &self.protocol)
            .field("quirks", &self.quirks)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EndpointDesc, MockDevice, TransferKind};

    fn handle(endpoints: EndpointSelection) -> PrinterHandle<MockDevice> {
        PrinterHandle {
            device: MockDevice::printer(0x0001, 0x0002),
            vendor_id: 0x0001,
            product_id: 0x0002,
            config_index: 0,
            config_value: 1,
            interface: 0,
            alt_setting: 0,
            alt_count: 1,
            alt: AltSettingDesc {
                interface_number: 0,
                alternate_setting: 0,
                class: 7,
                subclass: 1,
                protocol: 2,
                endpoints: vec![
                    EndpointDesc {
                        address: 0x83,
                        kind: TransferKind::Interrupt,
                    },
                    EndpointDesc::bulk_out(2),
                    EndpointDesc::bulk_in(1),
                ],
            },
            endpoints,
            protocol: 2,
            quirks: QuirkFlags::empty(),
            usblp_attached: false,
            reset_after_job: false,
            original_config: 0,
            handle: None,
        }
    }

    #[test]
    fn test_resolve_endpoints() {
        let mut printer = handle(EndpointSelection::Indices {
            write: 1,
            read: Some(2),
        });
        assert_eq!(printer.write_endpoint(), None);

        printer.resolve_endpoints();
        assert_eq!(printer.write_endpoint(), Some(0x02));
        assert_eq!(printer.read_endpoint(), Some(0x81));

        printer.resolve_endpoints();
        assert_eq!(printer.write_endpoint(), Some(0x02));
    }

    #[test]
    fn test_force_unidirectional() {
        let mut printer = handle(EndpointSelection::Indices {
            write: 1,
            read: Some(2),
        });
        printer.force_unidirectional();
        printer.resolve_endpoints();
        assert_eq!(printer.write_endpoint(), Some(0x02));
        assert_eq!(printer.read_endpoint(), None);
        assert!(!printer.is_open());
    }
}
