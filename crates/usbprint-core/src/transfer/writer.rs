//! Main write loop.

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::Shared;
use crate::events::{BackendEvent, JobFailure};
use crate::job::JobStatus;
use crate::protocol::constants::{PENDING_WRITE_WAIT, PRINT_CHUNK_SIZE, SIDECHANNEL_WRITE_TIMEOUT};
use crate::protocol::sidechannel::{SideCommand, SideReply};
use crate::transport::{TransportError, UsbHandle, lock};

/// What one wait on the print source produced.
enum Wait {
    Ready,
    Idle,
    /// Interrupted before a single byte reached the printer.
    Abort,
    Failed(io::Error),
}

/// Send `copies` copies of the print data.
pub(crate) fn write_job<H: UsbHandle>(shared: &Shared<H>, copies: u32) -> JobStatus {
    let seekable = shared.source.is_seekable();
    let copies = if seekable { copies.max(1) } else { 1 };
    let mut total: u64 = 0;
    let mut chunk = vec![0u8; PRINT_CHUNK_SIZE];

    for copy in 1..=copies {
        shared.observer.on_event(&BackendEvent::SendingData { copy });

        if seekable {
            shared.observer.on_event(&BackendEvent::Page { page: 1, copies: 1 });
            if let Err(e) = shared.source.rewind() {
                error!(error = %e, "Unable to rewind print file");
                shared
                    .observer
                    .on_event(&BackendEvent::Failure(JobFailure::UnableToRead));
                return JobStatus::Failed;
            }
        }

        match write_copy(shared, &mut chunk, &mut total) {
            CopyEnd::Eof => debug!(copy, total, "Copy sent"),
            CopyEnd::Abort => {
                debug!("Interrupted before any data was sent, aborting");
                return JobStatus::Ok;
            }
            CopyEnd::Failed => return JobStatus::Failed,
        }
    }

    JobStatus::Ok
}

enum CopyEnd {
    Eof,
    Abort,
    Failed,
}

fn write_copy<H: UsbHandle>(shared: &Shared<H>, chunk: &mut [u8], total: &mut u64) -> CopyEnd {
    let session = &shared.session;

    loop {
        let has_pending = !lock(&session.pending).is_empty();
        let draining = session.drain_requested.load(Ordering::SeqCst);

        let wait = session.turnstile.released(|| {
            if has_pending {
                std::thread::sleep(PENDING_WRITE_WAIT);
                return Wait::Idle;
            }
            // An unbounded wait is cut into slices when a drain request can
            // arrive while it is blocked.
            let sliced = !draining && shared.side.is_some();
            let timeout = if draining {
                Some(Duration::ZERO)
            } else if sliced {
                Some(shared.options.side_channel_poll)
            } else {
                None
            };
            let result = loop {
                match shared.source.wait_readable(timeout) {
                    Ok(false)
                        if sliced && !session.drain_requested.load(Ordering::SeqCst) =>
                    {
                        continue;
                    }
                    other => break other,
                }
            };
            match result {
                Ok(true) => Wait::Ready,
                Ok(false) => Wait::Idle,
                Err(e) if e.kind() == io::ErrorKind::Interrupted && *total == 0 => Wait::Abort,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    Wait::Idle
                }
                Err(e) => Wait::Failed(e),
            }
        });

        let ready = match wait {
            Wait::Ready => true,
            Wait::Idle => false,
            Wait::Abort => return CopyEnd::Abort,
            Wait::Failed(e) => {
                error!(error = %e, "Waiting for print data failed");
                shared
                    .observer
                    .on_event(&BackendEvent::Failure(JobFailure::UnableToRead));
                return CopyEnd::Failed;
            }
        };

        let mut pending = lock(&session.pending);

        if !ready && pending.is_empty() && session.drain_requested.load(Ordering::SeqCst) {
            acknowledge_drain(shared);
        }

        // A soft reset may have drained the source since the wait returned.
        let ready = ready
            && pending.is_empty()
            && shared
                .source
                .wait_readable(Some(Duration::ZERO))
                .unwrap_or(false);

        if ready {
            match shared.source.read(chunk) {
                Ok(0) => return CopyEnd::Eof,
                Ok(n) => pending.fill(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) => {}
                Err(e) => {
                    error!(error = %e, "Unable to read print data");
                    shared
                        .observer
                        .on_event(&BackendEvent::Failure(JobFailure::UnableToRead));
                    return CopyEnd::Failed;
                }
            }
        }

        if pending.is_empty() {
            continue;
        }

        match write_chunk(shared, pending.remaining()) {
            Ok(n) => {
                pending.consume(n);
                *total += n as u64;
                trace!(written = n, total = *total, "Wrote print data");
                shared
                    .observer
                    .on_event(&BackendEvent::Progress { total_bytes: *total });
            }
            Err(e) => {
                error!(error = %e, total = *total, "Unable to send data to printer");
                shared
                    .observer
                    .on_event(&BackendEvent::Failure(JobFailure::UnableToSend));
                return CopyEnd::Failed;
            }
        }
    }
}

/// One bulk write with the retry policy applied. Returns bytes accepted.
fn write_chunk<H: UsbHandle>(shared: &Shared<H>, data: &[u8]) -> Result<usize, TransportError> {
    let endpoint = shared.link.write_endpoint;
    let timeout = shared.options.write_timeout;
    let write = || shared.handle.write_bulk(endpoint, data, timeout);

    let mut result = write();
    if let Err(TransportError::Stall) = result {
        warn!("Got USB pipe stalled during write, retrying");
        result = write();
    }
    if let Err(TransportError::Aborted) = result {
        warn!("USB write was interrupted, retrying");
        result = write();
    }

    match result {
        Ok(n) => Ok(n),
        Err(TransportError::Timeout { transferred, .. }) => {
            debug!(transferred, "USB write timed out");
            Ok(transferred)
        }
        Err(e) => Err(e),
    }
}

fn acknowledge_drain<H: UsbHandle>(shared: &Shared<H>) {
    if let Some(side) = &shared.side {
        if let Err(e) = side.write_reply(
            &SideReply::ok(SideCommand::DrainOutput),
            SIDECHANNEL_WRITE_TIMEOUT,
        ) {
            debug!(error = %e, "Unable to acknowledge drain");
        }
    }
    shared.session.drain_requested.store(false, Ordering::SeqCst);
    debug!("Output drained");
}
