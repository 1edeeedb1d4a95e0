//! Mock USB backend for testing.
//!
//! A [`MockDevice`] is a scripted printer: bulk writes are captured, bulk
//! reads and write failures are queued in advance, and control transfers are
//! logged. All handles opened from one device share its [`MockState`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::descriptors::{AltSettingDesc, ConfigDesc, DeviceDesc, EndpointDesc, InterfaceDesc};
use super::lock;
use super::traits::{
    ControlRequest, ControlType, Recipient, TransportError, UsbBackend, UsbDevice, UsbHandle,
};
use crate::protocol::constants::{
    REQUEST_GET_CONFIGURATION, REQUEST_GET_DEVICE_ID, REQUEST_SOFT_RESET,
};

/// Scripted result of one bulk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Accept the whole buffer.
    Complete,
    /// Accept `n` bytes, then time out.
    Timeout(usize),
    Stall,
    Aborted,
    Disconnected,
}

/// Scripted result of one bulk read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Timeout,
    Stall,
    Aborted,
    /// Block for this long, ignoring the requested timeout, then time out.
    /// Releasing the interface cancels the read early.
    Hang(Duration),
}

/// How often a blocked read looks for a release.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// How long a release waits for pending reads to be cancelled.
const RELEASE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct MockInner {
    written: Vec<u8>,
    write_calls: usize,
    write_script: VecDeque<WriteOutcome>,
    read_script: VecDeque<ReadOutcome>,
    read_delay: Duration,
    critical_delay: Duration,
    control_log: Vec<ControlRequest>,
    device_id_response: Option<Vec<u8>>,
    fail_get_configuration: bool,
    fail_interface_soft_reset: bool,
    fail_set_configuration: Option<bool>,
    active_configuration: u8,
    kernel_driver_bound: bool,
    kernel_driver_supported: bool,
    detach_count: usize,
    attach_count: usize,
    busy_claims: usize,
    claimed: Option<u8>,
    alt_setting: Option<u8>,
    reset_count: usize,
    open_count: usize,
    fail_open: bool,
}

/// State shared by every handle of one mock device.
#[derive(Debug, Default)]
pub struct MockState {
    inner: Mutex<MockInner>,
    in_use: AtomicUsize,
    max_in_use: AtomicUsize,
    /// Bulk reads in flight; each keeps the interface claimed.
    reads_pending: AtomicUsize,
    releasing: AtomicBool,
}

impl MockState {
    fn new() -> Self {
        let state = Self::default();
        {
            let mut inner = lock(&state.inner);
            inner.read_delay = Duration::from_millis(10);
            inner.active_configuration = 1;
            inner.kernel_driver_supported = true;
        }
        state
    }

    /// Every byte accepted by bulk writes, in order.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.inner).written.clone()
    }

    pub fn write_calls(&self) -> usize {
        lock(&self.inner).write_calls
    }

    pub fn queue_write(&self, outcome: WriteOutcome) {
        lock(&self.inner).write_script.push_back(outcome);
    }

    pub fn queue_read(&self, outcome: ReadOutcome) {
        lock(&self.inner).read_script.push_back(outcome);
    }

    /// Delay before an unscripted read times out.
    pub fn set_read_delay(&self, delay: Duration) {
        lock(&self.inner).read_delay = delay;
    }

    /// Time spent inside bulk writes and soft resets.
    pub fn set_critical_delay(&self, delay: Duration) {
        lock(&self.inner).critical_delay = delay;
    }

    pub fn set_busy_claims(&self, count: usize) {
        lock(&self.inner).busy_claims = count;
    }

    pub fn set_fail_get_configuration(&self, fail: bool) {
        lock(&self.inner).fail_get_configuration = fail;
    }

    pub fn set_fail_interface_soft_reset(&self, fail: bool) {
        lock(&self.inner).fail_interface_soft_reset = fail;
    }

    /// `Some(true)` fails SET_CONFIGURATION with busy, `Some(false)` with an error.
    pub fn set_fail_set_configuration(&self, fail: Option<bool>) {
        lock(&self.inner).fail_set_configuration = fail;
    }

    pub fn set_active_configuration(&self, value: u8) {
        lock(&self.inner).active_configuration = value;
    }

    pub fn set_kernel_driver(&self, bound: bool) {
        lock(&self.inner).kernel_driver_bound = bound;
    }

    pub fn set_kernel_driver_supported(&self, supported: bool) {
        lock(&self.inner).kernel_driver_supported = supported;
    }

    pub fn set_fail_open(&self, fail: bool) {
        lock(&self.inner).fail_open = fail;
    }

    pub fn control_log(&self) -> Vec<ControlRequest> {
        lock(&self.inner).control_log.clone()
    }

    pub fn soft_resets(&self) -> Vec<ControlRequest> {
        self.control_log()
            .into_iter()
            .filter(|r| r.control_type == ControlType::Class && r.request == REQUEST_SOFT_RESET)
            .collect()
    }

    /// Highest number of writes and soft resets seen in flight at once.
    pub fn max_in_use(&self) -> usize {
        self.max_in_use.load(Ordering::SeqCst)
    }

    pub fn claimed(&self) -> Option<u8> {
        lock(&self.inner).claimed
    }

    pub fn reads_pending(&self) -> usize {
        self.reads_pending.load(Ordering::SeqCst)
    }

    pub fn alt_setting(&self) -> Option<u8> {
        lock(&self.inner).alt_setting
    }

    pub fn active_configuration(&self) -> u8 {
        lock(&self.inner).active_configuration
    }

    pub fn kernel_driver_bound(&self) -> bool {
        lock(&self.inner).kernel_driver_bound
    }

    pub fn detach_count(&self) -> usize {
        lock(&self.inner).detach_count
    }

    pub fn attach_count(&self) -> usize {
        lock(&self.inner).attach_count
    }

    pub fn reset_count(&self) -> usize {
        lock(&self.inner).reset_count
    }

    pub fn open_count(&self) -> usize {
        lock(&self.inner).open_count
    }

    fn enter_critical(&self) -> Duration {
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_use.fetch_max(now, Ordering::SeqCst);
        lock(&self.inner).critical_delay
    }

    fn leave_critical(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sleep for `duration` unless a release comes first. `false` if cancelled.
    fn wait_uncancelled(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.releasing.load(Ordering::SeqCst) {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            thread::sleep(left.min(CANCEL_POLL));
        }
    }
}

/// Counts one bulk read as in flight.
struct PendingRead<'a>(&'a AtomicUsize);

impl<'a> PendingRead<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A scripted printer.
#[derive(Debug, Clone)]
pub struct MockDevice {
    descriptor: DeviceDesc,
    configs: Vec<ConfigDesc>,
    serial: Option<String>,
    state: Arc<MockState>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16, configs: Vec<ConfigDesc>) -> Self {
        Self {
            descriptor: DeviceDesc {
                vendor_id,
                product_id,
            },
            configs,
            serial: None,
            state: Arc::new(MockState::new()),
        }
    }

    /// A bidirectional printer: configuration 1, interface 0, bulk OUT 0x01,
    /// bulk IN 0x81.
    pub fn printer(vendor_id: u16, product_id: u16) -> Self {
        Self::new(
            vendor_id,
            product_id,
            vec![ConfigDesc {
                value: 1,
                interfaces: vec![printer_interface(0, &[2])],
            }],
        )
    }

    pub fn with_device_id(self, device_id: &str) -> Self {
        let len = (device_id.len() + 2) as u16;
        let mut raw = len.to_be_bytes().to_vec();
        raw.extend_from_slice(device_id.as_bytes());
        self.with_raw_device_id(raw)
    }

    pub fn with_raw_device_id(self, raw: Vec<u8>) -> Self {
        lock(&self.state.inner).device_id_response = Some(raw);
        self
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }
}

/// A printer-class interface with one alt setting per protocol in `protocols`.
pub fn printer_interface(number: u8, protocols: &[u8]) -> InterfaceDesc {
    InterfaceDesc {
        number,
        alt_settings: protocols
            .iter()
            .enumerate()
            .map(|(alt, &protocol)| {
                let mut endpoints = vec![EndpointDesc::bulk_out(number * 2 + 1)];
                if protocol >= 2 {
                    endpoints.push(EndpointDesc::bulk_in(number * 2 + 1));
                }
                AltSettingDesc {
                    interface_number: number,
                    alternate_setting: alt as u8,
                    class: 7,
                    subclass: 1,
                    protocol,
                    endpoints,
                }
            })
            .collect(),
    }
}

impl UsbDevice for MockDevice {
    type Handle = MockHandle;

    fn descriptor(&self) -> DeviceDesc {
        self.descriptor
    }

    fn configurations(&self) -> Result<Vec<ConfigDesc>, TransportError> {
        Ok(self.configs.clone())
    }

    fn open(&self) -> Result<MockHandle, TransportError> {
        let mut inner = lock(&self.state.inner);
        if inner.fail_open {
            return Err(TransportError::PermissionDenied);
        }
        inner.open_count += 1;
        Ok(MockHandle {
            state: Arc::clone(&self.state),
        })
    }

    fn serial_number(&self) -> Option<String> {
        self.serial.clone()
    }
}

/// Mock host USB stack.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    devices: Vec<MockDevice>,
}

impl MockBackend {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self { devices }
    }
}

impl UsbBackend for MockBackend {
    type Device = MockDevice;

    fn devices(&self) -> Result<Vec<MockDevice>, TransportError> {
        Ok(self.devices.clone())
    }
}

/// Open handle to a [`MockDevice`].
#[derive(Debug)]
pub struct MockHandle {
    state: Arc<MockState>,
}

impl MockHandle {
    pub fn state(&self) -> &MockState {
        &self.state
    }
}

impl UsbHandle for MockHandle {
    fn kernel_driver_active(&self, _interface: u8) -> Result<bool, TransportError> {
        let inner = lock(&self.state.inner);
        if !inner.kernel_driver_supported {
            return Err(TransportError::NotSupported);
        }
        Ok(inner.kernel_driver_bound)
    }

    fn detach_kernel_driver(&self, _interface: u8) -> Result<(), TransportError> {
        let mut inner = lock(&self.state.inner);
        inner.kernel_driver_bound = false;
        inner.detach_count += 1;
        Ok(())
    }

    fn attach_kernel_driver(&self, _interface: u8) -> Result<(), TransportError> {
        let mut inner = lock(&self.state.inner);
        if inner.claimed.is_some() {
            return Err(TransportError::Busy);
        }
        inner.kernel_driver_bound = true;
        inner.attach_count += 1;
        Ok(())
    }

    fn set_configuration(&self, value: u8) -> Result<(), TransportError> {
        let mut inner = lock(&self.state.inner);
        match inner.fail_set_configuration {
            Some(true) => Err(TransportError::Busy),
            Some(false) => Err(TransportError::Other("set configuration rejected".into())),
            None => {
                inner.active_configuration = value;
                Ok(())
            }
        }
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut inner = lock(&self.state.inner);
        if inner.busy_claims > 0 {
            inner.busy_claims -= 1;
            return Err(TransportError::Busy);
        }
        inner.claimed = Some(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        let state = &self.state;
        state.releasing.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + RELEASE_WAIT;
        while state.reads_pending() > 0 && Instant::now() < deadline {
            thread::sleep(CANCEL_POLL);
        }
        state.releasing.store(false, Ordering::SeqCst);

        if state.reads_pending() > 0 {
            // A read still owns the endpoint, so the claim stays.
            return Err(TransportError::Busy);
        }
        let mut inner = lock(&state.inner);
        inner.claimed = None;
        inner.alt_setting = None;
        debug!(interface, "Mock interface released");
        Ok(())
    }

    fn set_alt_setting(&self, _interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        lock(&self.state.inner).alt_setting = Some(alt_setting);
        Ok(())
    }

    fn reset(&self) -> Result<(), TransportError> {
        lock(&self.state.inner).reset_count += 1;
        Ok(())
    }

    fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut inner = lock(&self.state.inner);
        inner.control_log.push(request);
        match (request.control_type, request.request) {
            (ControlType::Standard, REQUEST_GET_CONFIGURATION) => {
                if inner.fail_get_configuration {
                    Err(TransportError::Stall)
                } else {
                    Ok(vec![inner.active_configuration])
                }
            }
            (ControlType::Class, REQUEST_GET_DEVICE_ID) => match &inner.device_id_response {
                Some(raw) => Ok(raw.iter().copied().take(length as usize).collect()),
                None => Err(TransportError::Stall),
            },
            _ => Err(TransportError::Stall),
        }
    }

    fn control_out(
        &self,
        request: ControlRequest,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let is_soft_reset =
            request.control_type == ControlType::Class && request.request == REQUEST_SOFT_RESET;
        let fail = {
            let mut inner = lock(&self.state.inner);
            inner.control_log.push(request);
            is_soft_reset
                && request.recipient == Recipient::Interface
                && inner.fail_interface_soft_reset
        };
        if fail {
            return Err(TransportError::Stall);
        }
        if is_soft_reset {
            let delay = self.state.enter_critical();
            thread::sleep(delay);
            self.state.leave_critical();
        }
        Ok(())
    }

    fn write_bulk(
        &self,
        _endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let delay = self.state.enter_critical();
        thread::sleep(delay);

        let result = {
            let mut inner = lock(&self.state.inner);
            inner.write_calls += 1;
            match inner.write_script.pop_front().unwrap_or(WriteOutcome::Complete) {
                WriteOutcome::Complete => {
                    inner.written.extend_from_slice(data);
                    Ok(data.len())
                }
                WriteOutcome::Timeout(n) => {
                    let n = n.min(data.len());
                    inner.written.extend_from_slice(&data[..n]);
                    Err(TransportError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                        transferred: n,
                    })
                }
                WriteOutcome::Stall => Err(TransportError::Stall),
                WriteOutcome::Aborted => Err(TransportError::Aborted),
                WriteOutcome::Disconnected => Err(TransportError::Disconnected),
            }
        };

        self.state.leave_critical();
        result
    }

    fn read_bulk(
        &self,
        _endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let (next, delay) = {
            let mut inner = lock(&self.state.inner);
            (inner.read_script.pop_front(), inner.read_delay)
        };
        let timed_out = TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
            transferred: 0,
        };
        let _pending = PendingRead::new(&self.state.reads_pending);
        match next {
            Some(ReadOutcome::Data(mut data)) => {
                data.truncate(max_len);
                Ok(data)
            }
            Some(ReadOutcome::Timeout) => Err(timed_out),
            Some(ReadOutcome::Stall) => Err(TransportError::Stall),
            Some(ReadOutcome::Aborted) => Err(TransportError::Aborted),
            Some(ReadOutcome::Hang(duration)) => {
                if self.state.wait_uncancelled(duration) {
                    Err(timed_out)
                } else {
                    Err(TransportError::Aborted)
                }
            }
            None => {
                if self.state.wait_uncancelled(delay.min(timeout)) {
                    Err(timed_out)
                } else {
                    Err(TransportError::Aborted)
                }
            }
        }
    }
}
