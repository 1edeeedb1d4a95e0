//! usbprint-core: USB printer transport engine for a print-spooler backend.
//!
//! The crate finds a USB printer, claims its printer-class interface and runs
//! one print job against it.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: USB printer-class constants, IEEE-1284 device IDs,
//!   side-channel framing
//! - **Transport**: USB abstraction (nusb, mock)
//! - **Quirks / URI**: per-device workarounds and `usb://` device URIs
//! - **Enumerate / Connection**: printer discovery, claim and release
//! - **Transfer**: writer, back-channel reader, side-channel thread, shutdown
//! - **Events**: Observer pattern for spooler status lines
//! - **Job**: wait-for-printer loop and exit codes
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbprint_core::{BackendConfig, JobOptions, NusbBackend, PrintJob, SpoolerObserver, run_job};
//!
//! let job = PrintJob {
//!     device_uri: "usb://HP/LaserJet%201020?serial=ABC".to_string(),
//!     copies: 1,
//!     options: JobOptions::default(),
//!     print_file: None,
//!     verbose: false,
//! };
//! let status = run_job(
//!     &NusbBackend,
//!     &BackendConfig::default().with_env(),
//!     &job,
//!     Arc::new(SpoolerObserver::stderr()),
//! )
//! .expect("job setup failed");
//! std::process::exit(status.exit_code());
//! ```

pub mod channels;
pub mod config;
pub mod connection;
pub mod enumerate;
pub mod events;
pub mod job;
pub mod printer;
pub mod protocol;
pub mod quirks;
pub mod transfer;
pub mod transport;
pub mod uri;

// Re-exports for convenience
pub use channels::{
    BackChannel, FdBackChannel, FdSource, MemoryBackChannel, MemorySource, PrintSource,
    SideChannel, SocketSideChannel,
};
pub use config::{BackendConfig, ConfigError};
pub use connection::{close_device, get_device_id, open_device, soft_reset};
pub use enumerate::{
    Candidate, DiscoveryLine, FindOptions, ListMatcher, Matcher, TargetMatcher, find_device,
};
pub use events::{
    BackendEvent, BackendObserver, JobFailure, MultiObserver, NullObserver,
    RecordingObserver, SpoolerObserver, TracingObserver,
};
pub use job::{JobOptions, JobStatus, PrintJob, list_devices, print_device, run_job};
pub use printer::PrinterHandle;
pub use quirks::{QuirkDb, QuirkFlags};
pub use transfer::{TransferChannels, TransferOptions, run_transfer};
pub use transport::{
    MockBackend, MockDevice, NusbBackend, TransportError, UsbBackend, UsbDevice, UsbHandle,
};
pub use uri::DeviceUri;
