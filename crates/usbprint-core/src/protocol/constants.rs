//! Protocol constants for the USB printer class and the spooler channels.
//!
//! Derived from the USB Printer Class 1.1 specification and the spooler's
//! backend conventions.

use std::time::Duration;

// ============================================================================
// USB Printer Class
// ============================================================================

/// bInterfaceClass for printers.
pub const USB_CLASS_PRINTER: u8 = 7;

/// bInterfaceSubClass for printers.
pub const USB_SUBCLASS_PRINTER: u8 = 1;

/// Unidirectional interface protocol (bulk OUT only).
pub const PROTOCOL_UNIDIRECTIONAL: u8 = 1;

/// Bidirectional interface protocol (bulk OUT + bulk IN).
pub const PROTOCOL_BIDIRECTIONAL: u8 = 2;

/// Class request: GET_DEVICE_ID.
pub const REQUEST_GET_DEVICE_ID: u8 = 0;

/// Class request: SOFT_RESET.
pub const REQUEST_SOFT_RESET: u8 = 2;

/// Standard request: GET_CONFIGURATION.
pub const REQUEST_GET_CONFIGURATION: u8 = 8;

/// Endpoint address direction bit (set = IN).
pub const ENDPOINT_DIR_IN: u8 = 0x80;

// ============================================================================
// IEEE-1284 Device ID
// ============================================================================

/// Shortest plausible device ID, length prefix included.
pub const DEVICE_ID_MIN_LEN: usize = 14;

/// Buffer size used when fetching the device ID.
pub const DEVICE_ID_BUFFER_SIZE: usize = 1024;

// ============================================================================
// Transfer sizing and timeouts
// ============================================================================

/// Bytes read from the print descriptor per iteration.
pub const PRINT_CHUNK_SIZE: usize = 8192;

/// Bytes requested per back-channel bulk read.
pub const BACKCHANNEL_READ_SIZE: usize = 512;

/// Timeout for descriptor-level control transfers.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait applied while print bytes are buffered but not yet written.
pub const PENDING_WRITE_WAIT: Duration = Duration::from_millis(100);

/// Timeout when forwarding back-channel data to the spooler.
pub const BACKCHANNEL_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout when answering a side-channel request.
pub const SIDECHANNEL_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Slice used by the soft reset while it waits for the turnstile.
pub const TURNSTILE_SIGNAL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause inserted before closing a `delay-close` device.
pub const DELAY_CLOSE: Duration = Duration::from_secs(1);

/// Pause between busy retries of claim/alt-setting.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Spooler descriptors
// ============================================================================

/// Back-channel descriptor handed to backends.
pub const BACKCHANNEL_FD: i32 = 3;

/// Side-channel descriptor handed to backends.
pub const SIDECHANNEL_FD: i32 = 4;

/// Default spooler data directory.
pub const DEFAULT_DATA_ROOT: &str = "/usr/share/cups";

/// Subdirectory of the data root that holds quirk files.
pub const QUIRKS_SUBDIR: &str = "usb";

/// URI scheme served by this backend.
pub const URI_SCHEME: &str = "usb";
