//! Side-channel thread.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::Shared;
use crate::connection::soft_reset;
use crate::protocol::constants::SIDECHANNEL_WRITE_TIMEOUT;
use crate::protocol::sidechannel::{
    MAX_FRAME_DATA, STATE_ONLINE, SideChannelError, SideCommand, SideReply, SideRequest,
    SideStatus,
};
use crate::transport::{UsbHandle, lock};

/// Serve spooler requests until stopped or the channel goes away.
pub(crate) fn run<H: UsbHandle>(shared: &Shared<H>) {
    let session = &shared.session;
    let _done = session.side.done_guard();
    let Some(side) = &shared.side else {
        return;
    };

    debug!("Side-channel thread started");

    while !session.side.stop_requested() {
        let request = match side.read_request(shared.options.side_channel_poll) {
            Ok(request) => request,
            Err(SideChannelError::Timeout) => continue,
            Err(e) => {
                debug!(error = %e, "Side channel read failed");
                break;
            }
        };

        debug!(command = %request.command, "Side-channel request");
        if let Some(reply) = handle_request(shared, &request) {
            if let Err(e) = side.write_reply(&reply, SIDECHANNEL_WRITE_TIMEOUT) {
                warn!(command = %reply.command, error = %e, "Unable to send side-channel reply");
            }
        }
    }

    debug!("Side-channel thread finished");
}

/// Act on one request. `None` when the reply is sent later.
pub(crate) fn handle_request<H: UsbHandle>(
    shared: &Shared<H>,
    request: &SideRequest,
) -> Option<SideReply> {
    let command = request.command;
    let reply = match command {
        SideCommand::SoftReset => {
            reset(shared);
            SideReply::ok(command)
        }
        SideCommand::DrainOutput => {
            shared.session.drain_requested.store(true, Ordering::SeqCst);
            return None;
        }
        SideCommand::GetBidi => SideReply::ok_byte(command, shared.link.bidirectional as u8),
        SideCommand::GetDeviceId => match shared.link.device_id.fetch(shared.handle.as_ref()) {
            Ok(Some(id)) => {
                let mut data = id.into_bytes();
                data.truncate(MAX_FRAME_DATA);
                SideReply::new(command, SideStatus::Ok, data)
            }
            Ok(None) => SideReply::new(command, SideStatus::IoError, Vec::new()),
            Err(e) => {
                debug!(error = %e, "GET_DEVICE_ID failed");
                SideReply::new(command, SideStatus::IoError, Vec::new())
            }
        },
        SideCommand::GetState => SideReply::ok_byte(command, STATE_ONLINE),
        SideCommand::GetConnected => SideReply::ok_byte(
            command,
            shared.session.connected.load(Ordering::SeqCst) as u8,
        ),
        SideCommand::SnmpGet | SideCommand::SnmpGetNext => {
            SideReply::new(command, SideStatus::NotImplemented, Vec::new())
        }
    };
    Some(reply)
}

/// Throw away unsent print data and soft-reset the printer while the writer
/// is kept off the device.
fn reset<H: UsbHandle>(shared: &Shared<H>) {
    shared.session.turnstile.hold(|| {
        lock(&shared.session.pending).clear();
        match shared.source.discard_pending() {
            Ok(n) => debug!(discarded = n, "Discarded pending print data"),
            Err(e) => debug!(error = %e, "Unable to discard pending print data"),
        }
        match soft_reset(shared.handle.as_ref(), shared.link.interface) {
            Ok(()) => info!("Printer soft reset"),
            Err(e) => warn!(error = %e, "Soft reset failed"),
        }
    });
}
