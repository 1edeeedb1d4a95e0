#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use usbprint_core::protocol::sidechannel::{
    FRAME_HEADER_SIZE, SideCommand, SideReply, SideStatus, decode_reply, encode_frame,
};
use usbprint_core::transport::{MockBackend, MockDevice};
use usbprint_core::{
    FindOptions, NullObserver, PrinterHandle, QuirkDb, TargetMatcher, TransferOptions, find_device,
};

pub const DEVICE_ID: &str = "MFG:Test;MDL:Printer;SN:42;";
pub const URI: &str = "usb://Test/Printer?serial=42";

/// Bidirectional test printer, vendor 0x0001 product 0x0002.
pub fn printer() -> MockDevice {
    MockDevice::printer(0x0001, 0x0002).with_device_id(DEVICE_ID)
}

/// Find and open `device` the way a job does.
pub fn open(device: MockDevice) -> PrinterHandle<MockDevice> {
    let backend = MockBackend::new(vec![device]);
    find_device(
        &backend,
        &QuirkDb::default(),
        &mut TargetMatcher::new(URI),
        FindOptions::default(),
        &NullObserver,
    )
    .expect("test printer not found")
}

/// Short timings so shutdown paths finish quickly.
pub fn fast_options() -> TransferOptions {
    TransferOptions {
        copies: 1,
        wait_eof: true,
        write_timeout: Duration::from_millis(200),
        read_timeout: Duration::from_millis(50),
        read_period: Duration::from_millis(20),
        side_channel_poll: Duration::from_millis(50),
        side_thread_wait: Duration::from_millis(500),
        read_thread_wait: Duration::from_millis(300),
        read_abort_wait: Duration::from_millis(300),
    }
}

pub fn pipe() -> (OwnedFd, File) {
    let (read, write) = nix::unistd::pipe().unwrap();
    (read, File::from(write))
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Spooler end of the side channel: send a request, wait for its reply.
pub fn request(spooler: &mut UnixStream, command: SideCommand) -> SideReply {
    let frame = encode_frame(command, SideStatus::None, &[]).unwrap();
    spooler.write_all(&frame).unwrap();
    read_reply(spooler)
}

pub fn read_reply(spooler: &mut UnixStream) -> SideReply {
    spooler
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut frame = vec![0u8; FRAME_HEADER_SIZE];
    spooler.read_exact(&mut frame).unwrap();
    let len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    frame.resize(FRAME_HEADER_SIZE + len, 0);
    spooler.read_exact(&mut frame[FRAME_HEADER_SIZE..]).unwrap();
    decode_reply(&frame).unwrap()
}
