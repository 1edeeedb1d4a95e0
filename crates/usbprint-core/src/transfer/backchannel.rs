//! Back-channel reader thread.

use std::thread;
use std::time::Instant;

use tracing::{debug, trace};

use super::Shared;
use crate::events::BackendEvent;
use crate::protocol::constants::{BACKCHANNEL_READ_SIZE, BACKCHANNEL_WRITE_TIMEOUT};
use crate::transport::{TransportError, UsbHandle};

/// Poll the bulk-IN endpoint and forward whatever the printer says.
///
/// One iteration per read period, measured from the start of the iteration.
/// A stop request alone does not end the loop while `wait_eof` is set.
pub(crate) fn run<H: UsbHandle>(shared: &Shared<H>, endpoint: u8) {
    let session = &shared.session;
    let _done = session.reader.done_guard();
    let period = shared.options.read_period;

    debug!(endpoint = %format!("0x{endpoint:02X}"), "Back-channel reader started");

    loop {
        let started = Instant::now();
        let mut received = false;

        match shared
            .handle
            .read_bulk(endpoint, BACKCHANNEL_READ_SIZE, shared.options.read_timeout)
        {
            Ok(data) if !data.is_empty() => {
                received = true;
                trace!(len = data.len(), "Back-channel data");
                forward(shared, &data);
            }
            Ok(_) => {}
            Err(TransportError::Timeout { .. }) => {
                debug!("Got USB transaction timeout during read")
            }
            Err(TransportError::Stall) => debug!("Got USB pipe stalled during read"),
            Err(TransportError::Aborted) => debug!("USB read was interrupted"),
            Err(e) => debug!(error = %e, "USB read failed"),
        }

        if !session.reader_should_continue() {
            break;
        }

        if !received {
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }

        if !session.reader_should_continue() {
            break;
        }
    }

    debug!("Back-channel reader finished");
}

fn forward<H: UsbHandle>(shared: &Shared<H>, data: &[u8]) {
    let Some(back) = &shared.back else {
        return;
    };
    match back.write(data, BACKCHANNEL_WRITE_TIMEOUT) {
        Ok(n) => shared
            .observer
            .on_event(&BackendEvent::BackChannelData { length: n }),
        Err(e) => debug!(error = %e, "Unable to forward back-channel data"),
    }
}
