//! Job entry points: print one job, or list attached printers.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use nix::sys::signal::{SigHandler, Signal, signal};
use tracing::{debug, info, warn};

use crate::channels::{
    BackChannel, FdBackChannel, FdSource, PrintSource, SideChannel, SocketSideChannel,
};
use crate::config::BackendConfig;
use crate::enumerate::{
    Candidate, FindOptions, ListMatcher, TargetMatcher, apply_extra_quirks, find_device,
    option_quirks,
};
use crate::events::{BackendEvent, BackendObserver};
use crate::quirks::QuirkDb;
use crate::transfer::{TransferChannels, TransferOptions, run_transfer};
use crate::transport::UsbBackend;
use crate::uri::{DeviceUri, parse_bool};

/// How a job ended, as the spooler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Job done (or cancelled before anything was sent).
    Ok,
    /// Job failed; the queue keeps going.
    Failed,
    /// Stop the queue.
    Stop,
}

impl JobStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            JobStatus::Ok => 0,
            JobStatus::Failed => 1,
            JobStatus::Stop => 4,
        }
    }
}

/// Job options the backend understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// `usb-unidir-default`
    pub unidirectional: bool,
    /// `usb-no-reattach-default`
    pub no_reattach: bool,
}

impl JobOptions {
    /// Parse the spooler's `name=value name2=value2` option string.
    ///
    /// A bare `name` means true and `noname` false. Unknown names are ignored.
    pub fn parse(options: &str) -> Self {
        let mut parsed = Self::default();
        for option in options.split_whitespace() {
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name, parse_bool(value.trim_matches(['"', '\'']))),
                None => match option.strip_prefix("no") {
                    Some(name) if is_known(name) => (name, Some(false)),
                    _ => (option, Some(true)),
                },
            };
            let Some(value) = value else {
                debug!(option, "Ignoring option with a non-boolean value");
                continue;
            };
            match name.to_ascii_lowercase().as_str() {
                "usb-unidir-default" => parsed.unidirectional = value,
                "usb-no-reattach-default" => parsed.no_reattach = value,
                _ => {}
            }
        }
        parsed
    }
}

fn is_known(name: &str) -> bool {
    name.eq_ignore_ascii_case("usb-unidir-default")
        || name.eq_ignore_ascii_case("usb-no-reattach-default")
}

/// One print job.
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub device_uri: String,
    pub copies: u32,
    pub options: JobOptions,
    /// Stored print file; stdin when absent.
    pub print_file: Option<PathBuf>,
    pub verbose: bool,
}

/// Find the job's printer, waiting for it to show up, and print to it.
pub fn print_device<B: UsbBackend>(
    backend: &B,
    quirks: &QuirkDb,
    config: &BackendConfig,
    job: &PrintJob,
    channels: TransferChannels,
    observer: Arc<dyn BackendObserver>,
) -> JobStatus {
    let find = FindOptions {
        verbose: job.verbose,
        claim_busy_retries: config.claim_busy_retries,
    };
    let started = Instant::now();
    let mut matcher = TargetMatcher::new(job.device_uri.clone());

    let mut printer = loop {
        if let Some(printer) = find_device(backend, quirks, &mut matcher, find, observer.as_ref()) {
            break printer;
        }
        observer.on_event(&BackendEvent::WaitingForPrinter);
        if config
            .device_wait()
            .is_some_and(|limit| started.elapsed() + config.device_retry() > limit)
        {
            warn!(uri = %job.device_uri, "Printer did not show up, giving up");
            return JobStatus::Stop;
        }
        thread::sleep(config.device_retry());
    };

    apply_extra_quirks(
        &mut printer,
        option_quirks(job.options.unidirectional, job.options.no_reattach),
    );

    observer.on_event(&BackendEvent::DeviceConnected {
        vid: printer.vendor_id,
        pid: printer.product_id,
        uri: job.device_uri.clone(),
    });

    let mut options = TransferOptions::from_config(config);
    options.copies = if channels.source.is_seekable() {
        job.copies.max(1)
    } else {
        1
    };
    options.wait_eof = DeviceUri::parse(&job.device_uri)
        .ok()
        .and_then(|uri| uri.wait_eof)
        .unwrap_or(true);

    run_transfer(&mut printer, channels, &options, observer)
}

/// Every attached printer, as discovery would report it.
pub fn list_devices<B: UsbBackend>(
    backend: &B,
    quirks: &QuirkDb,
    config: &BackendConfig,
    observer: &dyn BackendObserver,
) -> Vec<Candidate> {
    let mut matcher = ListMatcher::default();
    let options = FindOptions {
        verbose: false,
        claim_busy_retries: config.claim_busy_retries,
    };
    find_device(backend, quirks, &mut matcher, options, observer);
    matcher.into_found()
}

/// The descriptors the spooler handed this process.
pub fn inherited_channels(print_file: Option<&std::path::Path>) -> Result<TransferChannels> {
    let source: Arc<dyn PrintSource> = match print_file {
        Some(path) => Arc::new(
            FdSource::open(path)
                .with_context(|| format!("Unable to open print file {}", path.display()))?,
        ),
        None => Arc::new(FdSource::stdin().context("Unable to use standard input")?),
    };
    Ok(TransferChannels {
        source,
        back: FdBackChannel::inherited().map(|c| Arc::new(c) as Arc<dyn BackChannel>),
        side: SocketSideChannel::inherited().map(|c| Arc::new(c) as Arc<dyn SideChannel>),
    })
}

/// Ignore SIGTERM so an upstream filter can finish sending trailing data.
pub fn ignore_sigterm() {
    // SAFETY: SigIgn installs no handler code that could run asynchronously.
    if let Err(e) = unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) } {
        warn!(error = %e, "Unable to ignore SIGTERM");
    }
}

/// Print a job against the host's USB stack with the spooler's descriptors.
pub fn run_job<B: UsbBackend>(
    backend: &B,
    config: &BackendConfig,
    job: &PrintJob,
    observer: Arc<dyn BackendObserver>,
) -> Result<JobStatus> {
    let quirks = QuirkDb::load(&config.quirks_dir());
    debug!(entries = quirks.len(), dir = %config.quirks_dir().display(), "Loaded quirks");

    let channels = inherited_channels(job.print_file.as_deref())?;
    if job.print_file.is_none() {
        ignore_sigterm();
    }

    let status = print_device(backend, &quirks, config, job, channels, observer);
    info!(?status, "Job finished");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(JobStatus::Ok.exit_code(), 0);
        assert_eq!(JobStatus::Failed.exit_code(), 1);
        assert_eq!(JobStatus::Stop.exit_code(), 4);
    }

    #[test]
    fn test_parse_job_options() {
        assert_eq!(JobOptions::parse(""), JobOptions::default());

        let options =
            JobOptions::parse("media=a4 usb-unidir-default=true usb-no-reattach-default=off");
        assert!(options.unidirectional);
        assert!(!options.no_reattach);

        let options = JobOptions::parse("usb-no-reattach-default=yes usb-unidir-default=maybe");
        assert!(options.no_reattach);
        assert!(!options.unidirectional);

        let options = JobOptions::parse("usb-unidir-default nousb-no-reattach-default");
        assert!(options.unidirectional);
        assert!(!options.no_reattach);

        let options = JobOptions::parse("usb-unidir-default='1'");
        assert!(options.unidirectional);
    }
}
