//! End-of-job teardown.

use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use super::{Shared, Workers};
use crate::connection::close_device;
use crate::printer::PrinterHandle;
use crate::transfer::ThreadSignal;
use crate::transport::UsbDevice;

/// Stop the helper threads within their bounds, then close the printer.
///
/// A thread that does not report done in time is left running and detached.
pub(crate) fn shutdown<D: UsbDevice>(
    shared: &Shared<D::Handle>,
    workers: Workers,
    printer: &mut PrinterHandle<D>,
) {
    let session = &shared.session;
    let options = &shared.options;

    if workers.side.is_some() {
        if let Some(side) = &shared.side {
            side.close();
        }
        session.turnstile.release();
        session.side.request_stop();
        if !session.side.wait_done(options.side_thread_wait) {
            warn!("Side-channel thread did not stop in time");
        }
    } else {
        session.turnstile.release();
    }

    if workers.reader.is_some() {
        session.reader.request_stop();
        if !session.reader.wait_done(options.read_thread_wait) {
            debug!("Back-channel reader still active, abandoning the pending read");
            session.wait_eof.store(false, Ordering::SeqCst);
            if !session.reader.wait_done(options.read_abort_wait) {
                warn!("Back-channel reader did not stop in time");
            }
        }
    }

    session.connected.store(false, Ordering::SeqCst);
    close_device(printer);

    reap("sidechannel", workers.side, &session.side);
    reap("backchannel", workers.reader, &session.reader);
}

fn reap(name: &str, worker: Option<JoinHandle<()>>, signal: &ThreadSignal) {
    let Some(worker) = worker else {
        return;
    };
    if !signal.is_done() {
        debug!(thread = name, "Detaching thread");
        return;
    }
    if worker.join().is_err() {
        warn!(thread = name, "Thread panicked");
    }
}
