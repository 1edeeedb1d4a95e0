//! nusb-based USB backend.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nusb::descriptors::TransferType;
use nusb::transfer::{Buffer, Bulk, Completion, ControlIn, ControlOut, In, Out, TransferError};
use nusb::{Device, DeviceInfo, Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, instrument, trace};

use super::descriptors::{
    AltSettingDesc, ConfigDesc, DeviceDesc, EndpointDesc, InterfaceDesc, TransferKind,
};
use super::lock;
use super::traits::{
    ControlRequest, ControlType, Recipient, TransportError, UsbBackend, UsbDevice, UsbHandle,
};

/// Time allowed for a cancelled transfer to come back.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Longest a pending transfer goes without checking for a release.
const RELEASE_POLL: Duration = Duration::from_millis(100);

fn map_nusb_error(err: nusb::Error) -> TransportError {
    match err.kind() {
        nusb::ErrorKind::Disconnected => TransportError::Disconnected,
        nusb::ErrorKind::Busy => TransportError::Busy,
        nusb::ErrorKind::PermissionDenied => TransportError::PermissionDenied,
        nusb::ErrorKind::NotFound => TransportError::NotFound,
        nusb::ErrorKind::Unsupported => TransportError::NotSupported,
        _ => TransportError::Other(err.to_string()),
    }
}

fn map_transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Cancelled => TransportError::Aborted,
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::Other(other.to_string()),
    }
}

fn control_type(t: ControlType) -> nusb::transfer::ControlType {
    match t {
        ControlType::Standard => nusb::transfer::ControlType::Standard,
        ControlType::Class => nusb::transfer::ControlType::Class,
        ControlType::Vendor => nusb::transfer::ControlType::Vendor,
    }
}

fn recipient(r: Recipient) -> nusb::transfer::Recipient {
    match r {
        Recipient::Device => nusb::transfer::Recipient::Device,
        Recipient::Interface => nusb::transfer::Recipient::Interface,
        Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
        Recipient::Other => nusb::transfer::Recipient::Other,
    }
}

/// Host USB stack through nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl UsbBackend for NusbBackend {
    type Device = NusbDevice;

    #[instrument(level = "debug", skip(self))]
    fn devices(&self) -> Result<Vec<NusbDevice>, TransportError> {
        let devices = list_devices().wait().map_err(map_nusb_error)?;
        Ok(devices.map(NusbDevice::new).collect())
    }
}

/// A device found by [`NusbBackend`].
///
/// Descriptors can only be read through an opened `nusb::Device`, so the
/// device is opened on first use and the same `Device` backs every handle.
#[derive(Clone)]
pub struct NusbDevice {
    info: DeviceInfo,
    device: Arc<Mutex<Option<Device>>>,
}

impl NusbDevice {
    fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            device: Arc::new(Mutex::new(None)),
        }
    }

    fn device(&self) -> Result<Device, TransportError> {
        let mut slot = lock(&self.device);
        if let Some(device) = slot.as_ref() {
            return Ok(device.clone());
        }
        let device = self.info.open().wait().map_err(map_nusb_error)?;
        *slot = Some(device.clone());
        Ok(device)
    }

    #[cfg(target_os = "linux")]
    fn sysfs_path(&self) -> Option<PathBuf> {
        Some(self.info.sysfs_path().to_path_buf())
    }

    #[cfg(not(target_os = "linux"))]
    fn sysfs_path(&self) -> Option<PathBuf> {
        None
    }
}

impl UsbDevice for NusbDevice {
    type Handle = NusbHandle;

    fn descriptor(&self) -> DeviceDesc {
        DeviceDesc {
            vendor_id: self.info.vendor_id(),
            product_id: self.info.product_id(),
        }
    }

    fn configurations(&self) -> Result<Vec<ConfigDesc>, TransportError> {
        let device = self.device()?;
        let configs = device
            .configurations()
            .map(|config| ConfigDesc {
                value: config.configuration_value(),
                interfaces: config
                    .interfaces()
                    .map(|iface| InterfaceDesc {
                        number: iface.interface_number(),
                        alt_settings: iface
                            .alt_settings()
                            .map(|alt| AltSettingDesc {
                                interface_number: alt.interface_number(),
                                alternate_setting: alt.alternate_setting(),
                                class: alt.class(),
                                subclass: alt.subclass(),
                                protocol: alt.protocol(),
                                endpoints: alt
                                    .endpoints()
                                    .map(|ep| EndpointDesc {
                                        address: ep.address(),
                                        kind: match ep.transfer_type() {
                                            TransferType::Control => TransferKind::Control,
                                            TransferType::Isochronous => {
                                                TransferKind::Isochronous
                                            }
                                            TransferType::Bulk => TransferKind::Bulk,
                                            TransferType::Interrupt => TransferKind::Interrupt,
                                        },
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Ok(configs)
    }

    fn open(&self) -> Result<NusbHandle, TransportError> {
        Ok(NusbHandle {
            device: self.device()?,
            sysfs_path: self.sysfs_path(),
            interface: Mutex::new(None),
            bulk_out: Mutex::new(None),
            bulk_in: Mutex::new(None),
            releasing: AtomicBool::new(false),
        })
    }

    fn serial_number(&self) -> Option<String> {
        self.info.serial_number().map(str::to_string)
    }
}

/// Open printer handle.
///
/// The two bulk endpoints sit behind separate mutexes so the write path and
/// the back-channel reader never wait on each other. An endpoint keeps the
/// interface claimed, so a pending transfer is cancelled as soon as
/// `releasing` is raised.
pub struct NusbHandle {
    device: Device,
    sysfs_path: Option<PathBuf>,
    interface: Mutex<Option<Interface>>,
    bulk_out: Mutex<Option<(u8, Endpoint<Bulk, Out>)>>,
    bulk_in: Mutex<Option<(u8, Endpoint<Bulk, In>)>>,
    releasing: AtomicBool,
}

impl NusbHandle {
    fn claimed(&self) -> Result<Interface, TransportError> {
        lock(&self.interface)
            .clone()
            .ok_or_else(|| TransportError::Other("interface not claimed".into()))
    }

    /// Wait for one submitted transfer; cancel it on timeout or release.
    ///
    /// The wait is sliced so a release never waits on a long read timeout.
    fn complete<Dir>(
        endpoint: &mut Endpoint<Bulk, Dir>,
        timeout: Duration,
        releasing: &AtomicBool,
    ) -> Result<Completion, TransportError>
    where
        Dir: nusb::transfer::EndpointDirection,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if let Some(completion) = endpoint.wait_next_complete(left.min(RELEASE_POLL)) {
                return Ok(completion);
            }
            if releasing.load(Ordering::Acquire) {
                endpoint.cancel_all();
                let _ = endpoint.wait_next_complete(CANCEL_GRACE);
                debug!("Pending bulk transfer cancelled for release");
                return Err(TransportError::Aborted);
            }
            if left.is_zero() {
                break;
            }
        }

        endpoint.cancel_all();
        let transferred = endpoint
            .wait_next_complete(CANCEL_GRACE)
            .map(|c| c.actual_len)
            .unwrap_or(0);
        Err(TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
            transferred,
        })
    }
}

impl UsbHandle for NusbHandle {
    #[cfg(target_os = "linux")]
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError> {
        let sysfs = self.sysfs_path.as_ref().ok_or(TransportError::NotSupported)?;
        let name = sysfs
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(TransportError::NotSupported)?;
        let config = self
            .device
            .active_configuration()
            .map_err(|e| TransportError::Other(e.to_string()))?
            .configuration_value();
        let driver = sysfs
            .join(format!("{name}:{config}.{interface}"))
            .join("driver");
        Ok(driver.exists())
    }

    #[cfg(not(target_os = "linux"))]
    fn kernel_driver_active(&self, _interface: u8) -> Result<bool, TransportError> {
        Err(TransportError::NotSupported)
    }

    #[cfg(target_os = "linux")]
    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransportError> {
        self.device
            .detach_kernel_driver(interface)
            .map_err(map_nusb_error)
    }

    #[cfg(not(target_os = "linux"))]
    fn detach_kernel_driver(&self, _interface: u8) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    #[cfg(target_os = "linux")]
    fn attach_kernel_driver(&self, interface: u8) -> Result<(), TransportError> {
        self.device
            .attach_kernel_driver(interface)
            .map_err(map_nusb_error)
    }

    #[cfg(not(target_os = "linux"))]
    fn attach_kernel_driver(&self, _interface: u8) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    fn set_configuration(&self, value: u8) -> Result<(), TransportError> {
        self.device
            .set_configuration(value)
            .wait()
            .map_err(map_nusb_error)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(map_nusb_error)?;
        *lock(&self.interface) = Some(claimed);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        // Pending transfers see the flag within RELEASE_POLL and give their
        // endpoint back; dropping both endpoints lets the claim go.
        self.releasing.store(true, Ordering::Release);
        lock(&self.bulk_out).take();
        lock(&self.bulk_in).take();
        lock(&self.interface).take();
        self.releasing.store(false, Ordering::Release);
        debug!(interface, "Interface released");
        Ok(())
    }

    fn set_alt_setting(&self, _interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        self.claimed()?
            .set_alt_setting(alt_setting)
            .wait()
            .map_err(map_nusb_error)
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.device.reset().wait().map_err(map_nusb_error)
    }

    fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.device
            .control_in(
                ControlIn {
                    control_type: control_type(request.control_type),
                    recipient: recipient(request.recipient),
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.device
            .control_out(
                ControlOut {
                    control_type: control_type(request.control_type),
                    recipient: recipient(request.recipient),
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn write_bulk(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut slot = lock(&self.bulk_out);
        if slot.as_ref().map(|(addr, _)| *addr) != Some(endpoint) {
            let ep = self
                .claimed()?
                .endpoint::<Bulk, Out>(endpoint)
                .map_err(|e| TransportError::Other(e.to_string()))?;
            *slot = Some((endpoint, ep));
        }
        let Some((_, ep)) = slot.as_mut() else {
            return Err(TransportError::NotFound);
        };

        ep.submit(Buffer::from(data.to_vec()));
        let completion = Self::complete(ep, timeout, &self.releasing)?;
        completion.status.map_err(map_transfer_error)?;
        trace!(bytes_written = completion.actual_len, "Bulk write complete");
        Ok(completion.actual_len)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut slot = lock(&self.bulk_in);
        if slot.as_ref().map(|(addr, _)| *addr) != Some(endpoint) {
            let ep = self
                .claimed()?
                .endpoint::<Bulk, In>(endpoint)
                .map_err(|e| TransportError::Other(e.to_string()))?;
            *slot = Some((endpoint, ep));
        }
        let Some((_, ep)) = slot.as_mut() else {
            return Err(TransportError::NotFound);
        };

        // IN requests must be a whole number of packets.
        let packet = ep.max_packet_size().max(1);
        let requested = max_len.div_ceil(packet) * packet;
        let mut buffer = Buffer::new(requested);
        buffer.set_requested_len(requested);
        ep.submit(buffer);

        let completion = Self::complete(ep, timeout, &self.releasing)?;
        completion.status.map_err(map_transfer_error)?;
        let mut data = completion.buffer.into_vec();
        data.truncate(completion.actual_len.min(max_len));
        trace!(bytes_read = data.len(), "Bulk read complete");
        Ok(data)
    }
}
