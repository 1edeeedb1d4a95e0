//! Whole jobs: finding the printer, job options and discovery.

mod common;

use std::sync::Arc;

use usbprint_core::channels::{MemoryBackChannel, MemorySource};
use usbprint_core::transport::{MockBackend, ReadOutcome};
use usbprint_core::{
    BackendConfig, BackendEvent, DiscoveryLine, JobOptions, JobStatus, NullObserver, PrintJob,
    QuirkDb, RecordingObserver, TransferChannels, list_devices, print_device,
};

use common::{URI, pattern, printer};

fn config() -> BackendConfig {
    BackendConfig {
        device_retry_secs: 1,
        device_wait_secs: Some(0),
        write_timeout_ms: 200,
        read_timeout_ms: 50,
        read_period_ms: 20,
        side_channel_poll_ms: 50,
        side_thread_wait_secs: 1,
        read_thread_wait_secs: 1,
        read_abort_wait_secs: 1,
        ..BackendConfig::default()
    }
}

fn job(options: &str, copies: u32) -> PrintJob {
    PrintJob {
        device_uri: URI.to_string(),
        copies,
        options: JobOptions::parse(options),
        print_file: None,
        verbose: true,
    }
}

#[test]
fn test_missing_printer_stops_the_queue() {
    let backend = MockBackend::new(Vec::new());
    let observer = Arc::new(RecordingObserver::default());

    let status = print_device(
        &backend,
        &QuirkDb::default(),
        &config(),
        &job("", 1),
        TransferChannels {
            source: Arc::new(MemorySource::new(pattern(10))),
            back: None,
            side: None,
        },
        observer.clone(),
    );

    assert_eq!(status, JobStatus::Stop);
    assert_eq!(status.exit_code(), 4);
    assert!(observer.events().contains(&BackendEvent::WaitingForPrinter));
}

#[test]
fn test_prints_copies_of_a_stored_file() {
    let device = printer();
    let state = device.state();
    let backend = MockBackend::new(vec![device]);
    let observer = Arc::new(RecordingObserver::default());
    let data = pattern(1500);

    let status = print_device(
        &backend,
        &QuirkDb::default(),
        &config(),
        &job("", 2),
        TransferChannels {
            source: Arc::new(MemorySource::new(data.clone())),
            back: None,
            side: None,
        },
        observer.clone(),
    );

    assert_eq!(status, JobStatus::Ok);
    assert_eq!(state.written(), data.repeat(2));
    assert_eq!(state.claimed(), None);
    assert!(observer.events().contains(&BackendEvent::DeviceConnected {
        vid: 0x0001,
        pid: 0x0002,
        uri: URI.to_string(),
    }));
}

#[test]
fn test_unidir_option_skips_back_channel() {
    let device = printer();
    let state = device.state();
    state.queue_read(ReadOutcome::Data(b"status".to_vec()));
    let backend = MockBackend::new(vec![device]);
    let back = Arc::new(MemoryBackChannel::default());

    let status = print_device(
        &backend,
        &QuirkDb::default(),
        &config(),
        &job("usb-unidir-default=true", 1),
        TransferChannels {
            source: Arc::new(MemorySource::new(pattern(100))),
            back: Some(back.clone()),
            side: None,
        },
        Arc::new(NullObserver),
    );

    assert_eq!(status, JobStatus::Ok);
    assert!(back.data().is_empty());
}

#[test]
fn test_bidirectional_job_forwards_status() {
    let device = printer();
    let state = device.state();
    state.queue_read(ReadOutcome::Data(b"status".to_vec()));
    let backend = MockBackend::new(vec![device]);
    let back = Arc::new(MemoryBackChannel::default());

    let status = print_device(
        &backend,
        &QuirkDb::default(),
        &config(),
        &job("", 1),
        TransferChannels {
            source: Arc::new(MemorySource::new(pattern(100))),
            back: Some(back.clone()),
            side: None,
        },
        Arc::new(NullObserver),
    );

    assert_eq!(status, JobStatus::Ok);
    assert_eq!(back.data(), b"status");
}

#[test]
fn test_list_devices() {
    let backend = MockBackend::new(vec![printer()]);
    let found = list_devices(&backend, &QuirkDb::default(), &config(), &NullObserver);

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].uri, URI);
    assert_eq!(
        DiscoveryLine(&found[0]).to_string(),
        format!(
            "direct {URI} \"Test Printer\" \"Test Printer USB\" \"{}\" \"\"",
            common::DEVICE_ID
        )
    );
}
