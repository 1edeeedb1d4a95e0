//! The print job engine.
//!
//! Three threads cooperate for one job:
//!
//! - the calling thread streams print data to the bulk-OUT endpoint
//!   ([`writer`]),
//! - a reader forwards bulk-IN data to the back channel ([`backchannel`]),
//! - a side-channel thread answers spooler requests ([`sidechannel`]).
//!
//! [`run_transfer`] starts the helpers, runs the writer and then hands over to
//! the [`shutdown`] sequence, which always closes the printer.

pub mod backchannel;
pub mod shutdown;
pub mod sidechannel;
pub mod state;
pub mod turnstile;
pub mod writer;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::channels::{BackChannel, PrintSource, SideChannel};
use crate::config::BackendConfig;
use crate::connection::{DeviceIdQuery, close_device};
use crate::events::{BackendEvent, BackendObserver, JobFailure};
use crate::job::JobStatus;
use crate::printer::PrinterHandle;
use crate::transport::{UsbDevice, UsbHandle};

pub use state::{PendingData, ThreadSignal, TransferSession};
pub use turnstile::Turnstile;

/// Per-job knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub copies: u32,
    /// Let the reader outlive a stop request until it is abandoned.
    pub wait_eof: bool,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub read_period: Duration,
    pub side_channel_poll: Duration,
    pub side_thread_wait: Duration,
    pub read_thread_wait: Duration,
    pub read_abort_wait: Duration,
}

impl TransferOptions {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            copies: 1,
            wait_eof: true,
            write_timeout: config.write_timeout(),
            read_timeout: config.read_timeout(),
            read_period: config.read_period(),
            side_channel_poll: config.side_channel_poll(),
            side_thread_wait: config.side_thread_wait(),
            read_thread_wait: config.read_thread_wait(),
            read_abort_wait: config.read_abort_wait(),
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&BackendConfig::default())
    }
}

/// The spooler-side descriptors for one job.
pub struct TransferChannels {
    pub source: Arc<dyn PrintSource>,
    pub back: Option<Arc<dyn BackChannel>>,
    pub side: Option<Arc<dyn SideChannel>>,
}

/// Fixed facts about the claimed printer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Link {
    pub write_endpoint: u8,
    pub read_endpoint: Option<u8>,
    pub interface: u8,
    pub bidirectional: bool,
    pub device_id: DeviceIdQuery,
}

/// What the job threads share.
pub(crate) struct Shared<H: UsbHandle> {
    pub handle: Arc<H>,
    pub session: TransferSession,
    pub link: Link,
    pub source: Arc<dyn PrintSource>,
    pub back: Option<Arc<dyn BackChannel>>,
    pub side: Option<Arc<dyn SideChannel>>,
    pub observer: Arc<dyn BackendObserver>,
    pub options: TransferOptions,
}

/// Worker threads that were started.
#[derive(Default)]
pub(crate) struct Workers {
    pub side: Option<JoinHandle<()>>,
    pub reader: Option<JoinHandle<()>>,
}

/// Run a print job on an open printer.
///
/// The printer is closed before this returns, whatever the outcome.
pub fn run_transfer<D: UsbDevice>(
    printer: &mut PrinterHandle<D>,
    channels: TransferChannels,
    options: &TransferOptions,
    observer: Arc<dyn BackendObserver>,
) -> JobStatus {
    let (Some(handle), Some(write_endpoint)) = (printer.handle(), printer.write_endpoint()) else {
        error!("Printer is not open");
        close_device(printer);
        return JobStatus::Failed;
    };

    let link = Link {
        write_endpoint,
        read_endpoint: printer.read_endpoint(),
        interface: printer.interface,
        bidirectional: printer.is_bidirectional(),
        device_id: DeviceIdQuery::for_printer(printer),
    };
    let wait_eof = options.wait_eof && link.read_endpoint.is_some();

    let shared = Arc::new(Shared {
        handle,
        session: TransferSession::new(wait_eof),
        link,
        source: channels.source,
        back: channels.back,
        side: channels.side,
        observer,
        options: options.clone(),
    });

    let mut workers = Workers::default();
    match start_workers(&shared, &mut workers) {
        Ok(()) => {}
        Err(e) => {
            error!(error = %e, "Unable to start worker thread");
            shared
                .observer
                .on_event(&BackendEvent::Failure(JobFailure::UnrecoverableUsb));
            shutdown::shutdown(&shared, workers, printer);
            return JobStatus::Stop;
        }
    }

    info!(
        copies = options.copies,
        bidirectional = link.read_endpoint.is_some(),
        side_channel = shared.side.is_some(),
        "Starting print job"
    );
    let status = writer::write_job(&shared, options.copies);
    debug!(?status, "Writer finished");

    shutdown::shutdown(&shared, workers, printer);
    status
}

fn start_workers<H: UsbHandle + 'static>(
    shared: &Arc<Shared<H>>,
    workers: &mut Workers,
) -> std::io::Result<()> {
    if shared.side.is_some() {
        let shared = Arc::clone(shared);
        workers.side = Some(
            thread::Builder::new()
                .name("sidechannel".into())
                .spawn(move || sidechannel::run(&shared))?,
        );
    }

    if let Some(endpoint) = shared.link.read_endpoint {
        let shared = Arc::clone(shared);
        workers.reader = Some(
            thread::Builder::new()
                .name("backchannel".into())
                .spawn(move || backchannel::run(&shared, endpoint))?,
        );
    }

    Ok(())
}
