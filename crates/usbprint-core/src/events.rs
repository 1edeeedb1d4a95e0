//! Event system for spooler-facing status.
//!
//! The engine reports what the spooler should see (printer state, progress,
//! user-facing errors) as [`BackendEvent`]s. The binary renders them as the
//! spooler's `STATE:`/`INFO:`/`ERROR:` line protocol; tests record them.

use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

use crate::transport::lock;

/// printer-state-reasons keywords the backend toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateReason {
    ConnectingToDevice,
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateReason::ConnectingToDevice => write!(f, "connecting-to-device"),
        }
    }
}

/// User-facing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailure {
    /// A bulk write failed for good.
    UnableToSend,
    /// The print data descriptor failed.
    UnableToRead,
    /// A worker thread could not be started.
    UnrecoverableUsb,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::UnableToSend => write!(f, "Unable to send data to printer."),
            JobFailure::UnableToRead => write!(f, "Unable to read print data."),
            JobFailure::UnrecoverableUsb => write!(f, "There was an unrecoverable USB error."),
        }
    }
}

/// Events emitted by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A state reason was set (`true`) or cleared.
    State { reason: StateReason, active: bool },
    /// No matching printer yet; retrying.
    WaitingForPrinter,
    /// Printer opened for the job.
    DeviceConnected { vid: u16, pid: u16, uri: String },
    /// A copy is about to be sent.
    SendingData { copy: u32 },
    /// A page (copy of a stored file) started.
    Page { page: u32, copies: u32 },
    /// Bytes handed to the printer so far.
    Progress { total_bytes: u64 },
    /// Bytes forwarded from the printer to the spooler.
    BackChannelData { length: usize },
    /// Job-ending failure.
    Failure(JobFailure),
}

/// Observer trait for receiving backend events.
pub trait BackendObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &BackendEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BackendObserver for NullObserver {
    fn on_event(&self, _event: &BackendEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BackendObserver for TracingObserver {
    fn on_event(&self, event: &BackendEvent) {
        match event {
            BackendEvent::State { reason, active } => {
                tracing::debug!(reason = %reason, active, "Printer state");
            }
            BackendEvent::WaitingForPrinter => {
                tracing::info!("Waiting for printer to become available");
            }
            BackendEvent::DeviceConnected { vid, pid, uri } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    uri = %uri,
                    "Printer connected"
                );
            }
            BackendEvent::SendingData { copy } => {
                tracing::info!(copy, "Sending data to printer");
            }
            BackendEvent::Page { page, copies } => {
                tracing::debug!(page, copies, "Page");
            }
            BackendEvent::Progress { total_bytes } => {
                tracing::trace!(total_bytes, "Progress");
            }
            BackendEvent::BackChannelData { length } => {
                tracing::debug!(length, "Back-channel data");
            }
            BackendEvent::Failure(failure) => {
                tracing::error!("{}", failure);
            }
        }
    }
}

/// Observer that speaks the spooler's stderr line protocol.
pub struct SpoolerObserver {
    out: Mutex<Box<dyn Write + Send>>,
}

impl SpoolerObserver {
    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// The spooler line for `event`, if it has one.
    pub fn render(event: &BackendEvent) -> Option<String> {
        Some(match event {
            BackendEvent::State { reason, active } => {
                format!("STATE: {}{}", if *active { '+' } else { '-' }, reason)
            }
            BackendEvent::WaitingForPrinter => {
                "INFO: Waiting for printer to become available.".to_string()
            }
            BackendEvent::SendingData { .. } => "INFO: Sending data to printer.".to_string(),
            BackendEvent::Page { page, copies } => format!("PAGE: {page} {copies}"),
            BackendEvent::Failure(failure) => format!("ERROR: {failure}"),
            _ => return None,
        })
    }
}

impl BackendObserver for SpoolerObserver {
    fn on_event(&self, event: &BackendEvent) {
        if let Some(line) = Self::render(event) {
            let mut out = lock(&self.out);
            // Nothing useful to do if stderr is gone.
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}

/// Fan an event out to several observers.
pub struct MultiObserver(pub Vec<Box<dyn BackendObserver>>);

impl BackendObserver for MultiObserver {
    fn on_event(&self, event: &BackendEvent) {
        for observer in &self.0 {
            observer.on_event(event);
        }
    }
}

/// Observer that keeps every event. Used by tests.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<BackendEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<BackendEvent> {
        lock(&self.events).clone()
    }
}

impl BackendObserver for RecordingObserver {
    fn on_event(&self, event: &BackendEvent) {
        lock(&self.events).push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_spooler_lines() {
        let connecting = BackendEvent::State {
            reason: StateReason::ConnectingToDevice,
            active: true,
        };
        assert_eq!(
            SpoolerObserver::render(&connecting).as_deref(),
            Some("STATE: +connecting-to-device")
        );
        assert_eq!(
            SpoolerObserver::render(&BackendEvent::Page { page: 1, copies: 1 }).as_deref(),
            Some("PAGE: 1 1")
        );
        assert_eq!(
            SpoolerObserver::render(&BackendEvent::Failure(JobFailure::UnableToSend)).as_deref(),
            Some("ERROR: Unable to send data to printer.")
        );
        assert_eq!(
            SpoolerObserver::render(&BackendEvent::Progress { total_bytes: 10 }),
            None
        );
    }

    #[test]
    fn test_spooler_observer_writes_lines() {
        #[derive(Clone, Default)]
        struct Shared(std::sync::Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                lock(&self.0).extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = Shared::default();
        let observer = SpoolerObserver::new(Box::new(sink.clone()));
        observer.on_event(&BackendEvent::WaitingForPrinter);
        observer.on_event(&BackendEvent::SendingData { copy: 1 });

        let text = String::from_utf8(lock(&sink.0).clone()).unwrap();
        assert_eq!(
            text,
            "INFO: Waiting for printer to become available.\nINFO: Sending data to printer.\n"
        );
    }

    #[test]
    fn test_diagnostic_events_stay_off_the_spooler_stream() {
        let quiet = [
            BackendEvent::DeviceConnected {
                vid: 0x04a9,
                pid: 0x1746,
                uri: "usb://Canon/MP280".to_string(),
            },
            BackendEvent::BackChannelData { length: 12 },
            BackendEvent::Progress { total_bytes: 4096 },
        ];
        for event in &quiet {
            assert_eq!(SpoolerObserver::render(event), None, "{event:?}");
            TracingObserver.on_event(event);
        }
    }

    #[test]
    fn test_recording_observer() {
        let observer = RecordingObserver::default();
        observer.on_event(&BackendEvent::WaitingForPrinter);
        assert_eq!(observer.events(), vec![BackendEvent::WaitingForPrinter]);
    }
}
