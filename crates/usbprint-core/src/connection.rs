//! Connection management: claiming a printer interface and giving it back.

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, instrument, warn};

use crate::events::{BackendEvent, BackendObserver, StateReason};
use crate::printer::PrinterHandle;
use crate::protocol::constants::{
    BUSY_RETRY_DELAY, CONTROL_TIMEOUT, DELAY_CLOSE, DEVICE_ID_BUFFER_SIZE,
    REQUEST_GET_CONFIGURATION, REQUEST_GET_DEVICE_ID, REQUEST_SOFT_RESET,
};
use crate::protocol::device_id::decode_device_id;
use crate::quirks::QuirkFlags;
use crate::transport::{
    ControlRequest, ControlType, Recipient, TransportError, UsbDevice, UsbHandle,
};

/// Undoes a partial open unless disarmed.
struct OpenGuard<'a, H: UsbHandle> {
    handle: &'a H,
    interface: u8,
    detached: bool,
    claimed: bool,
    armed: bool,
}

impl<H: UsbHandle> Drop for OpenGuard<'_, H> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.claimed {
            if let Err(e) = self.handle.release_interface(self.interface) {
                debug!(interface = self.interface, error = %e, "Release after failed open");
            }
        }
        if self.detached {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                warn!(interface = self.interface, error = %e, "Failed to reattach kernel driver");
            }
        }
    }
}

/// Retry `op` while it reports busy, up to `retries` extra attempts.
fn retry_busy<F>(retries: u32, mut op: F) -> Result<(), TransportError>
where
    F: FnMut() -> Result<(), TransportError>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_busy() && attempt < retries => {
                attempt += 1;
                thread::sleep(BUSY_RETRY_DELAY);
            }
            result => return result,
        }
    }
}

/// Open the printer and claim its interface.
///
/// Idempotent. On failure nothing stays claimed or detached and the handle
/// is closed.
#[instrument(level = "debug", skip_all, fields(interface = printer.interface))]
pub fn open_device<D: UsbDevice>(
    printer: &mut PrinterHandle<D>,
    verbose: bool,
    claim_busy_retries: u32,
    observer: &dyn BackendObserver,
) -> Result<(), TransportError> {
    if printer.is_open() {
        return Ok(());
    }

    if verbose {
        observer.on_event(&BackendEvent::State {
            reason: StateReason::ConnectingToDevice,
            active: true,
        });
    }

    let result = match printer.device.open() {
        Ok(handle) => claim(printer, &handle, claim_busy_retries).map(|claimed| (claimed, handle)),
        Err(e) => Err(e),
    };

    if verbose {
        observer.on_event(&BackendEvent::State {
            reason: StateReason::ConnectingToDevice,
            active: false,
        });
    }

    match result {
        Ok(((detached, original_config), handle)) => {
            let descriptor = printer.device.descriptor();
            printer.usblp_attached = detached;
            printer.original_config = original_config;
            printer.handle = Some(Arc::new(handle));
            debug!(
                vendor_id = %format!("{:04X}", descriptor.vendor_id),
                product_id = %format!("{:04X}", descriptor.product_id),
                interface = printer.interface,
                alt_setting = printer.alt_setting,
                "Printer opened"
            );
            Ok(())
        }
        Err(e) => {
            debug!(error = %e, "Open failed");
            Err(e)
        }
    }
}

/// Steps of [`open_device`] that need undoing on failure.
/// Returns (kernel driver detached, original configuration).
fn claim<D: UsbDevice>(
    printer: &PrinterHandle<D>,
    handle: &D::Handle,
    claim_busy_retries: u32,
) -> Result<(bool, u8), TransportError> {
    let interface = printer.interface;
    let mut guard = OpenGuard {
        handle,
        interface,
        detached: false,
        claimed: false,
        armed: true,
    };

    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            handle.detach_kernel_driver(interface).inspect_err(|e| {
                warn!(interface, error = %e, "Failed to detach kernel driver");
            })?;
            guard.detached = true;
        }
        Ok(false) | Err(TransportError::NotSupported) => {}
        Err(e) => {
            warn!(interface, error = %e, "Unable to check for an attached kernel driver");
            return Err(e);
        }
    }

    let current = handle
        .control_in(
            ControlRequest {
                control_type: ControlType::Standard,
                recipient: Recipient::Device,
                request: REQUEST_GET_CONFIGURATION,
                value: 0,
                index: 0,
            },
            1,
            CONTROL_TIMEOUT,
        )
        .ok()
        .and_then(|data| data.first().copied())
        .unwrap_or(0);

    if printer.config_value != current {
        match handle.set_configuration(printer.config_value) {
            Ok(()) => {}
            Err(TransportError::Busy) => {
                debug!(config = printer.config_value, "Set configuration busy, continuing")
            }
            Err(e) => warn!(
                config = printer.config_value,
                error = %e,
                "Failed to set configuration"
            ),
        }
    }

    retry_busy(claim_busy_retries, || handle.claim_interface(interface)).inspect_err(|e| {
        warn!(interface, error = %e, "Failed to claim interface");
    })?;
    guard.claimed = true;

    if printer.alt_count > 1 {
        retry_busy(claim_busy_retries, || {
            handle.set_alt_setting(interface, printer.alt_setting)
        })
        .inspect_err(|e| {
            warn!(
                interface,
                alt_setting = printer.alt_setting,
                error = %e,
                "Failed to set alternate setting"
            );
        })?;
    }

    guard.armed = false;
    Ok((guard.detached, current))
}

/// Give the interface back and restore what [`open_device`] changed.
///
/// Never fails; every problem is logged.
#[instrument(level = "debug", skip_all, fields(interface = printer.interface))]
pub fn close_device<D: UsbDevice>(printer: &mut PrinterHandle<D>) {
    let Some(handle) = printer.handle.take() else {
        return;
    };
    let interface = printer.interface;

    if let Err(e) = handle.release_interface(interface) {
        warn!(interface, error = %e, "Failed to release interface");
    }

    let original = printer.original_config;
    if original > 0 && original != printer.config_value {
        match handle.set_configuration(original) {
            Ok(()) | Err(TransportError::Busy) => {}
            Err(e) => warn!(config = original, error = %e, "Failed to restore configuration"),
        }
    }

    if printer.usblp_attached && !printer.quirks.contains(QuirkFlags::NO_REATTACH) {
        match handle.attach_kernel_driver(interface) {
            Ok(()) => debug!(interface, "Kernel driver reattached"),
            Err(e) => warn!(interface, error = %e, "Failed to reattach kernel driver"),
        }
    }
    printer.usblp_attached = false;

    if printer.reset_after_job {
        match handle.reset() {
            Ok(()) => info!("Printer reset"),
            Err(e) => warn!(error = %e, "Printer reset failed"),
        }
    }

    if printer.quirks.contains(QuirkFlags::DELAY_CLOSE) {
        thread::sleep(DELAY_CLOSE);
    }

    drop(handle);
    debug!("Printer closed");
}

/// Where a device ID request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdQuery {
    pub config_index: usize,
    pub interface: u8,
    pub alt_setting: u8,
}

impl DeviceIdQuery {
    pub fn for_printer<D: UsbDevice>(printer: &PrinterHandle<D>) -> Self {
        Self {
            config_index: printer.config_index,
            interface: printer.interface,
            alt_setting: printer.alt_setting,
        }
    }

    /// Issue GET_DEVICE_ID. `Ok(None)` when the answer carries no usable ID.
    pub fn fetch<H: UsbHandle + ?Sized>(
        &self,
        handle: &H,
    ) -> Result<Option<String>, TransportError> {
        let raw = handle.control_in(
            ControlRequest {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: REQUEST_GET_DEVICE_ID,
                value: self.config_index as u16,
                index: ((self.interface as u16) << 8) | self.alt_setting as u16,
            },
            DEVICE_ID_BUFFER_SIZE as u16,
            CONTROL_TIMEOUT,
        )?;

        match decode_device_id(&raw) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                debug!(error = %e, "No usable device ID");
                Ok(None)
            }
        }
    }
}

/// Read the IEEE-1284 device ID of an open printer.
pub fn get_device_id<D: UsbDevice>(
    printer: &PrinterHandle<D>,
) -> Result<Option<String>, TransportError> {
    let handle = printer.handle().ok_or(TransportError::NotFound)?;
    DeviceIdQuery::for_printer(printer).fetch(handle.as_ref())
}

/// Printer-class SOFT_RESET, addressed to the interface and, if the device
/// rejects that, to "other".
pub fn soft_reset<H: UsbHandle + ?Sized>(handle: &H, interface: u8) -> Result<(), TransportError> {
    let request = |recipient| ControlRequest {
        control_type: ControlType::Class,
        recipient,
        request: REQUEST_SOFT_RESET,
        value: 0,
        index: interface as u16,
    };

    handle
        .control_out(request(Recipient::Interface), &[], CONTROL_TIMEOUT)
        .or_else(|e| {
            debug!(error = %e, "Interface soft reset rejected, retrying");
            handle.control_out(request(Recipient::Other), &[], CONTROL_TIMEOUT)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerate::candidate_for_tests;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::transport::MockDevice;

    #[test]
    fn test_open_and_close() {
        let device = MockDevice::printer(0x0001, 0x0002);
        let state = device.state();
        state.set_kernel_driver(true);
        state.set_active_configuration(0);
        let mut printer = candidate_for_tests(device);

        open_device(&mut printer, false, 0, &NullObserver).unwrap();
        assert!(printer.is_open());
        assert!(printer.usblp_attached);
        assert_eq!(printer.original_config, 0);
        assert_eq!(state.claimed(), Some(0));
        assert_eq!(state.active_configuration(), 1);
        assert!(!state.kernel_driver_bound());

        // Already open: nothing happens.
        open_device(&mut printer, false, 0, &NullObserver).unwrap();
        assert_eq!(state.open_count(), 1);

        close_device(&mut printer);
        assert!(!printer.is_open());
        assert_eq!(state.claimed(), None);
        assert!(state.kernel_driver_bound());
        assert_eq!(state.reset_count(), 0);

        // Closing twice is harmless.
        close_device(&mut printer);
        assert_eq!(state.attach_count(), 1);
    }

    #[test]
    fn test_open_verbose_emits_state() {
        let device = MockDevice::printer(0x0001, 0x0002);
        let mut printer = candidate_for_tests(device);
        let observer = RecordingObserver::default();

        open_device(&mut printer, true, 0, &observer).unwrap();
        assert_eq!(
            observer.events(),
            vec![
                BackendEvent::State {
                    reason: StateReason::ConnectingToDevice,
                    active: true
                },
                BackendEvent::State {
                    reason: StateReason::ConnectingToDevice,
                    active: false
                },
            ]
        );
    }

    #[test]
    fn test_failed_open_still_clears_connecting_state() {
        let device = MockDevice::printer(0x0001, 0x0002);
        device.state().set_fail_open(true);
        let mut printer = candidate_for_tests(device);
        let observer = RecordingObserver::default();

        let err = open_device(&mut printer, true, 0, &observer).unwrap_err();
        assert!(matches!(err, TransportError::PermissionDenied));
        assert!(!printer.is_open());
        assert_eq!(
            observer.events(),
            vec![
                BackendEvent::State {
                    reason: StateReason::ConnectingToDevice,
                    active: true
                },
                BackendEvent::State {
                    reason: StateReason::ConnectingToDevice,
                    active: false
                },
            ]
        );
    }

    #[test]
    fn test_claim_busy_then_give_up() {
        let device = MockDevice::printer(0x0001, 0x0002);
        let state = device.state();
        state.set_kernel_driver(true);
        state.set_busy_claims(5);
        let mut printer = candidate_for_tests(device);

        let err = open_device(&mut printer, false, 2, &NullObserver).unwrap_err();
        assert!(err.is_busy());
        assert!(!printer.is_open());
        // Detached driver was given back.
        assert!(state.kernel_driver_bound());

        open_device(&mut printer, false, 5, &NullObserver).unwrap();
        assert!(printer.is_open());
    }

    #[test]
    fn test_set_configuration_failures_are_not_fatal() {
        let device = MockDevice::printer(0x0001, 0x0002);
        let state = device.state();
        state.set_active_configuration(2);
        state.set_fail_set_configuration(Some(false));
        let mut printer = candidate_for_tests(device);

        open_device(&mut printer, false, 0, &NullObserver).unwrap();
        assert!(printer.is_open());
        assert_eq!(printer.original_config, 2);
    }

    #[test]
    fn test_get_configuration_failure_means_unknown() {
        let device = MockDevice::printer(0x0001, 0x0002);
        let state = device.state();
        state.set_fail_get_configuration(true);
        state.set_kernel_driver_supported(false);
        let mut printer = candidate_for_tests(device);

        open_device(&mut printer, false, 0, &NullObserver).unwrap();
        assert_eq!(printer.original_config, 0);
        assert!(!printer.usblp_attached);
    }

    #[test]
    fn test_close_restores_configuration_and_resets() {
        let device = MockDevice::printer(0x0001, 0x0002);
        let state = device.state();
        state.set_active_configuration(2);
        let mut printer = candidate_for_tests(device);
        printer.reset_after_job = true;

        open_device(&mut printer, false, 0, &NullObserver).unwrap();
        assert_eq!(state.active_configuration(), 1);
        close_device(&mut printer);
        assert_eq!(state.active_configuration(), 2);
        assert_eq!(state.reset_count(), 1);
    }

    #[test]
    fn test_no_reattach_quirk() {
        let device = MockDevice::printer(0x0001, 0x0002);
        let state = device.state();
        state.set_kernel_driver(true);
        let mut printer = candidate_for_tests(device);
        printer.quirks = QuirkFlags::NO_REATTACH;

        open_device(&mut printer, false, 0, &NullObserver).unwrap();
        close_device(&mut printer);
        assert!(!state.kernel_driver_bound());
        assert_eq!(state.attach_count(), 0);
    }

    #[test]
    fn test_device_id_request_layout() {
        let device = MockDevice::printer(0x0001, 0x0002).with_device_id("MFG:ACME;MDL:Jet 1;");
        let state = device.state();
        let mut printer = candidate_for_tests(device);
        open_device(&mut printer, false, 0, &NullObserver).unwrap();

        assert_eq!(
            get_device_id(&printer).unwrap().as_deref(),
            Some("MFG:ACME;MDL:Jet 1;")
        );
        let request = *state.control_log().last().unwrap();
        assert_eq!(request.request, REQUEST_GET_DEVICE_ID);
        assert_eq!(request.index, 0);
        assert_eq!(request.value, 0);
    }

    #[test]
    fn test_soft_reset_falls_back_to_other() {
        let device = MockDevice::printer(0x0001, 0x0002);
        let state = device.state();
        let handle = device.open().unwrap();

        soft_reset(&handle, 0).unwrap();
        assert_eq!(state.soft_resets().len(), 1);
        assert_eq!(state.soft_resets()[0].recipient, Recipient::Interface);

        state.set_fail_interface_soft_reset(true);
        soft_reset(&handle, 0).unwrap();
        let resets = state.soft_resets();
        assert_eq!(resets.len(), 3);
        assert_eq!(resets[2].recipient, Recipient::Other);
    }
}
