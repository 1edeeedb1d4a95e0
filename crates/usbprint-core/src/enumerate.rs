//! Printer discovery.
//!
//! [`find_device`] walks every attached device, picks the best printer-class
//! alternate setting of each interface, opens it and asks a [`Matcher`]
//! whether it is the one wanted. Accepted printers are returned still open.

use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::connection::{DeviceIdQuery, close_device, open_device};
use crate::events::BackendObserver;
use crate::printer::{EndpointSelection, PrinterHandle};
use crate::protocol::constants::{
    PROTOCOL_BIDIRECTIONAL, PROTOCOL_UNIDIRECTIONAL, USB_CLASS_PRINTER, USB_SUBCLASS_PRINTER,
};
use crate::protocol::device_id::{DeviceId, make_device_uri};
use crate::quirks::{QuirkDb, QuirkFlags};
use crate::transport::{AltSettingDesc, ConfigDesc, InterfaceDesc, UsbBackend, UsbDevice};
use crate::uri::uri_matches;

/// What a matcher gets to see about an opened printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub vendor_id: u16,
    pub product_id: u16,
    pub uri: String,
    /// Empty when the printer did not report one.
    pub device_id: String,
    pub make_model: String,
}

/// Decides which printer [`find_device`] returns.
pub trait Matcher {
    /// `true` keeps the printer open and ends the search.
    fn matches(&mut self, candidate: &Candidate) -> bool;
}

/// Collects every printer and accepts none.
#[derive(Debug, Default)]
pub struct ListMatcher {
    found: Vec<Candidate>,
}

impl ListMatcher {
    pub fn found(&self) -> &[Candidate] {
        &self.found
    }

    pub fn into_found(self) -> Vec<Candidate> {
        self.found
    }
}

impl Matcher for ListMatcher {
    fn matches(&mut self, candidate: &Candidate) -> bool {
        self.found.push(candidate.clone());
        false
    }
}

/// Discovery report line for the spooler.
pub struct DiscoveryLine<'a>(pub &'a Candidate);

impl fmt::Display for DiscoveryLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.0;
        write!(
            f,
            "direct {} \"{}\" \"{} USB\" \"{}\" \"\"",
            c.uri,
            quote_safe(&c.make_model),
            quote_safe(&c.make_model),
            quote_safe(&c.device_id)
        )
    }
}

fn quote_safe(s: &str) -> String {
    s.replace(['"', '\\'], "")
}

/// Accepts the printer whose URI matches the job's device URI.
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    uri: String,
}

impl TargetMatcher {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl Matcher for TargetMatcher {
    fn matches(&mut self, candidate: &Candidate) -> bool {
        let hit = uri_matches(&self.uri, &candidate.uri);
        debug!(requested = %self.uri, detected = %candidate.uri, hit, "Comparing device URI");
        hit
    }
}

/// Knobs for a search.
#[derive(Debug, Clone, Copy)]
pub struct FindOptions {
    pub verbose: bool,
    pub claim_busy_retries: u32,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            claim_busy_retries: 50,
        }
    }
}

/// Best alternate setting of one interface.
struct Selection<'a> {
    alt_index: usize,
    alt: &'a AltSettingDesc,
    write: usize,
    read: Option<usize>,
}

fn is_printer_class(alt: &AltSettingDesc, quirks: QuirkFlags) -> bool {
    quirks.contains(QuirkFlags::VENDOR_CLASS)
        || (alt.class == USB_CLASS_PRINTER && alt.subclass == USB_SUBCLASS_PRINTER)
}

/// Highest-protocol alt setting with a bulk-OUT endpoint. Ties go to the later one.
fn select_alt_setting(iface: &InterfaceDesc, quirks: QuirkFlags) -> Option<Selection<'_>> {
    let mut best: Option<Selection<'_>> = None;

    for (alt_index, alt) in iface.alt_settings.iter().enumerate() {
        if !is_printer_class(alt, quirks) {
            continue;
        }
        if !(PROTOCOL_UNIDIRECTIONAL..=PROTOCOL_BIDIRECTIONAL).contains(&alt.protocol) {
            continue;
        }
        if best.as_ref().is_some_and(|b| alt.protocol < b.alt.protocol) {
            continue;
        }

        let mut write = None;
        let mut read = None;
        for (index, endpoint) in alt.endpoints.iter().enumerate() {
            if !endpoint.is_bulk() {
                continue;
            }
            if endpoint.is_in() {
                read = Some(index);
            } else {
                write = Some(index);
            }
        }

        if let Some(write) = write {
            best = Some(Selection {
                alt_index,
                alt,
                write,
                read: read.filter(|_| alt.protocol > PROTOCOL_UNIDIRECTIONAL),
            });
        }
    }

    best
}

fn printer_interface_count(config: &ConfigDesc, quirks: QuirkFlags) -> usize {
    config
        .interfaces
        .iter()
        .filter(|iface| iface.alt_settings.iter().any(|alt| is_printer_class(alt, quirks)))
        .count()
}

/// Search attached devices for a printer `matcher` accepts.
///
/// The accepted printer is returned open. Rejected ones are closed again.
#[instrument(level = "debug", skip_all)]
pub fn find_device<B: UsbBackend>(
    backend: &B,
    quirks: &QuirkDb,
    matcher: &mut dyn Matcher,
    options: FindOptions,
    observer: &dyn BackendObserver,
) -> Option<PrinterHandle<B::Device>> {
    let devices = match backend.devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, "Unable to enumerate USB devices");
            return None;
        }
    };

    for device in devices {
        let desc = device.descriptor();
        if desc.vendor_id == 0 || desc.product_id == 0 {
            continue;
        }

        let device_quirks = quirks.lookup(desc.vendor_id, desc.product_id);
        if device_quirks.contains(QuirkFlags::BLACKLIST) {
            debug!(
                vendor_id = %format!("{:04X}", desc.vendor_id),
                product_id = %format!("{:04X}", desc.product_id),
                "Skipping blacklisted device"
            );
            continue;
        }

        let configs = match device.configurations() {
            Ok(configs) if !configs.is_empty() => configs,
            Ok(_) => continue,
            Err(e) => {
                debug!(
                    vendor_id = %format!("{:04X}", desc.vendor_id),
                    product_id = %format!("{:04X}", desc.product_id),
                    error = %e,
                    "Skipping device with unreadable descriptors"
                );
                continue;
            }
        };

        for (config_index, config) in configs.iter().enumerate() {
            let multiple = printer_interface_count(config, device_quirks) > 1;

            for iface in &config.interfaces {
                let Some(selection) = select_alt_setting(iface, device_quirks) else {
                    continue;
                };

                let mut printer = PrinterHandle {
                    device: device.clone(),
                    vendor_id: desc.vendor_id,
                    product_id: desc.product_id,
                    config_index,
                    config_value: config.value,
                    interface: iface.number,
                    alt_setting: selection.alt.alternate_setting,
                    alt_count: iface.alt_settings.len(),
                    alt: selection.alt.clone(),
                    endpoints: EndpointSelection::Indices {
                        write: selection.write,
                        read: selection.read,
                    },
                    protocol: selection.alt.protocol,
                    quirks: device_quirks,
                    usblp_attached: false,
                    reset_after_job: false,
                    original_config: 0,
                    handle: None,
                };

                debug!(
                    vendor_id = %format!("{:04X}", desc.vendor_id),
                    product_id = %format!("{:04X}", desc.product_id),
                    config_index,
                    interface = iface.number,
                    alt_index = selection.alt_index,
                    protocol = printer.protocol,
                    "Printer interface found"
                );

                if let Err(e) =
                    open_device(&mut printer, options.verbose, options.claim_busy_retries, observer)
                {
                    debug!(interface = iface.number, error = %e, "Unable to open candidate");
                    continue;
                }

                let candidate = describe(&printer, multiple);
                if matcher.matches(&candidate) {
                    accept(&mut printer);
                    info!(
                        vendor_id = %format!("{:04X}", desc.vendor_id),
                        product_id = %format!("{:04X}", desc.product_id),
                        uri = %candidate.uri,
                        "Printer selected"
                    );
                    return Some(printer);
                }

                close_device(&mut printer);
            }
        }
    }

    None
}

/// Identity of an open candidate.
fn describe<D: UsbDevice>(printer: &PrinterHandle<D>, multiple_interfaces: bool) -> Candidate {
    let device_id = printer
        .handle()
        .and_then(|handle| {
            DeviceIdQuery::for_printer(printer)
                .fetch(handle.as_ref())
                .inspect_err(|e| debug!(error = %e, "GET_DEVICE_ID failed"))
                .ok()
                .flatten()
        })
        .unwrap_or_default();

    let serial = printer.device.serial_number();
    let interface = multiple_interfaces.then_some(printer.interface);

    Candidate {
        vendor_id: printer.vendor_id,
        product_id: printer.product_id,
        uri: make_device_uri(&device_id, serial.as_deref(), interface),
        make_model: DeviceId::parse(&device_id).make_model(),
        device_id,
    }
}

/// Apply per-device overrides to the printer a matcher picked.
fn accept<D: UsbDevice>(printer: &mut PrinterHandle<D>) {
    if printer.quirks.contains(QuirkFlags::UNIDIR) {
        printer.force_unidirectional();
    }
    printer.resolve_endpoints();

    if printer.quirks.contains(QuirkFlags::NO_REATTACH) {
        printer.usblp_attached = false;
    }
    printer.reset_after_job = printer.quirks.contains(QuirkFlags::SOFT_RESET);

    if printer.quirks.contains(QuirkFlags::USB_INIT) {
        debug!("Printer wants a vendor init string; none is sent");
    }
}

/// Convert job options that override quirks into flags.
pub fn option_quirks(unidirectional: bool, no_reattach: bool) -> QuirkFlags {
    let mut flags = QuirkFlags::empty();
    flags.set(QuirkFlags::UNIDIR, unidirectional);
    flags.set(QuirkFlags::NO_REATTACH, no_reattach);
    flags
}

/// Apply extra quirk flags to an already accepted printer.
pub fn apply_extra_quirks<D: UsbDevice>(printer: &mut PrinterHandle<D>, extra: QuirkFlags) {
    printer.quirks |= extra;
    if extra.contains(QuirkFlags::UNIDIR) {
        printer.force_unidirectional();
    }
    if extra.contains(QuirkFlags::NO_REATTACH) {
        printer.usblp_attached = false;
    }
}

#[cfg(test)]
pub(crate) fn candidate_for_tests(
    device: crate::transport::MockDevice,
) -> PrinterHandle<crate::transport::MockDevice> {
    let config = device
        .configurations()
        .ok()
        .and_then(|configs| configs.into_iter().next())
        .unwrap();
    let iface = config.interfaces.first().unwrap();
    let selection = select_alt_setting(iface, QuirkFlags::empty()).unwrap();
    let desc = device.descriptor();
    let mut printer = PrinterHandle {
        vendor_id: desc.vendor_id,
        product_id: desc.product_id,
        config_index: 0,
        config_value: config.value,
        interface: iface.number,
        alt_setting: selection.alt.alternate_setting,
        alt_count: iface.alt_settings.len(),
        alt: selection.alt.clone(),
        endpoints: EndpointSelection::Indices {
            write: selection.write,
            read: selection.read,
        },
        protocol: selection.alt.protocol,
        quirks: QuirkFlags::empty(),
        usblp_attached: false,
        reset_after_job: false,
        original_config: 0,
        handle: None,
        device,
    };
    printer.resolve_endpoints();
    printer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::quirks::QuirkEntry;
    use crate::transport::mock::printer_interface;
    use crate::transport::{EndpointDesc, MockBackend, MockDevice, TransferKind};

    const ID: &str = "MFG:ACME;MDL:LaserJet 9;SN:X1;";

    fn find(
        backend: &MockBackend,
        quirks: &QuirkDb,
        matcher: &mut dyn Matcher,
    ) -> Option<PrinterHandle<MockDevice>> {
        find_device(
            backend,
            quirks,
            matcher,
            FindOptions::default(),
            &NullObserver,
        )
    }

    #[test]
    fn test_list_reports_all_and_closes() {
        let a = MockDevice::printer(0x0001, 0x0002).with_device_id(ID);
        let b = MockDevice::printer(0x0003, 0x0004)
            .with_device_id("MFG:Hewlett-Packard;MDL:hp DeskJet;")
            .with_serial("S42");
        let (sa, sb) = (a.state(), b.state());
        let backend = MockBackend::new(vec![a, b]);

        let mut matcher = ListMatcher::default();
        assert!(find(&backend, &QuirkDb::default(), &mut matcher).is_none());

        let found = matcher.found();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].uri, "usb://ACME/LaserJet%209?serial=X1");
        assert_eq!(found[0].make_model, "ACME LaserJet 9");
        assert_eq!(found[1].uri, "usb://HP/hp%20DeskJet?serial=S42");
        assert_eq!(found[1].make_model, "HP DeskJet");
        assert_eq!(
            DiscoveryLine(&found[0]).to_string(),
            format!("direct usb://ACME/LaserJet%209?serial=X1 \"ACME LaserJet 9\" \"ACME LaserJet 9 USB\" \"{ID}\" \"\"")
        );

        assert_eq!(sa.claimed(), None);
        assert_eq!(sb.claimed(), None);
    }

    #[test]
    fn test_target_match_leaves_device_open() {
        let a = MockDevice::printer(0x0001, 0x0002).with_device_id("MFG:Other;MDL:Thing;");
        let b = MockDevice::printer(0x0003, 0x0004).with_device_id(ID);
        let (sa, sb) = (a.state(), b.state());
        let backend = MockBackend::new(vec![a, b]);

        let mut matcher = TargetMatcher::new("usb://ACME/LaserJet%209?serial=X1");
        let printer = find(&backend, &QuirkDb::default(), &mut matcher).unwrap();

        assert!(printer.is_open());
        assert_eq!(printer.vendor_id, 0x0003);
        assert_eq!(printer.write_endpoint(), Some(0x01));
        assert_eq!(printer.read_endpoint(), Some(0x81));
        assert_eq!(sa.claimed(), None);
        assert_eq!(sb.claimed(), Some(0));
    }

    #[test]
    fn test_missing_serial_still_matches() {
        let backend = MockBackend::new(vec![MockDevice::printer(1, 2).with_device_id(ID)]);
        let mut matcher = TargetMatcher::new("usb://ACME/LaserJet%209");
        assert!(find(&backend, &QuirkDb::default(), &mut matcher).is_some());
    }

    #[test]
    fn test_blacklist_and_zero_ids_skipped() {
        let blocked = MockDevice::printer(0x0001, 0x0002).with_device_id(ID);
        let zero = MockDevice::printer(0x0000, 0x0002).with_device_id(ID);
        let (sb, sz) = (blocked.state(), zero.state());
        let backend = MockBackend::new(vec![blocked, zero]);
        let quirks = QuirkDb::new([QuirkEntry {
            vendor_id: 0x0001,
            product_id: 0,
            flags: QuirkFlags::BLACKLIST,
        }]);

        let mut matcher = ListMatcher::default();
        find(&backend, &quirks, &mut matcher);
        assert!(matcher.found().is_empty());
        assert_eq!(sb.open_count(), 0);
        assert_eq!(sz.open_count(), 0);
    }

    #[test]
    fn test_prefers_bidirectional_alt_setting() {
        let device = MockDevice::new(
            1,
            2,
            vec![ConfigDesc {
                value: 1,
                interfaces: vec![printer_interface(0, &[2, 1])],
            }],
        )
        .with_device_id(ID);
        let state = device.state();
        let backend = MockBackend::new(vec![device]);

        let mut matcher = TargetMatcher::new("usb://ACME/LaserJet%209?serial=X1");
        let printer = find(&backend, &QuirkDb::default(), &mut matcher).unwrap();
        assert_eq!(printer.alt_setting, 0);
        assert_eq!(printer.protocol, 2);
        assert!(printer.read_endpoint().is_some());
        // Two alt settings means the chosen one is selected explicitly.
        assert_eq!(state.alt_setting(), Some(0));
    }

    #[test]
    fn test_unidirectional_drops_read_endpoint() {
        let mut iface = printer_interface(0, &[1]);
        iface.alt_settings[0].endpoints.push(EndpointDesc::bulk_in(1));
        let device = MockDevice::new(
            1,
            2,
            vec![ConfigDesc {
                value: 1,
                interfaces: vec![iface],
            }],
        )
        .with_device_id(ID);
        let backend = MockBackend::new(vec![device]);

        let mut matcher = TargetMatcher::new("usb://ACME/LaserJet%209?serial=X1");
        let printer = find(&backend, &QuirkDb::default(), &mut matcher).unwrap();
        assert_eq!(printer.read_endpoint(), None);
        assert!(!printer.is_bidirectional());
    }

    #[test]
    fn test_unidir_and_soft_reset_quirks() {
        let backend = MockBackend::new(vec![MockDevice::printer(1, 2).with_device_id(ID)]);
        let quirks = QuirkDb::new([QuirkEntry {
            vendor_id: 1,
            product_id: 2,
            flags: QuirkFlags::UNIDIR | QuirkFlags::SOFT_RESET,
        }]);

        let mut matcher = TargetMatcher::new("usb://ACME/LaserJet%209?serial=X1");
        let printer = find(&backend, &quirks, &mut matcher).unwrap();
        assert_eq!(printer.read_endpoint(), None);
        assert_eq!(printer.write_endpoint(), Some(0x01));
        assert!(printer.reset_after_job);
    }

    #[test]
    fn test_vendor_class_quirk() {
        let mut iface = printer_interface(0, &[2]);
        iface.alt_settings[0].class = 0xFF;
        iface.alt_settings[0].subclass = 0;
        let device = MockDevice::new(
            1,
            2,
            vec![ConfigDesc {
                value: 1,
                interfaces: vec![iface],
            }],
        )
        .with_device_id(ID);
        let backend = MockBackend::new(vec![device]);
        let target = "usb://ACME/LaserJet%209?serial=X1";

        assert!(find(&backend, &QuirkDb::default(), &mut TargetMatcher::new(target)).is_none());

        let quirks = QuirkDb::new([QuirkEntry {
            vendor_id: 1,
            product_id: 0,
            flags: QuirkFlags::VENDOR_CLASS,
        }]);
        assert!(find(&backend, &quirks, &mut TargetMatcher::new(target)).is_some());
    }

    #[test]
    fn test_multiple_interfaces_get_interface_option() {
        let device = MockDevice::new(
            1,
            2,
            vec![ConfigDesc {
                value: 1,
                interfaces: vec![printer_interface(0, &[2]), printer_interface(1, &[1])],
            }],
        )
        .with_device_id(ID);
        let backend = MockBackend::new(vec![device]);

        let mut matcher = ListMatcher::default();
        find(&backend, &QuirkDb::default(), &mut matcher);
        let uris: Vec<_> = matcher.into_found().into_iter().map(|c| c.uri).collect();
        assert_eq!(
            uris,
            vec![
                "usb://ACME/LaserJet%209?serial=X1&interface=0",
                "usb://ACME/LaserJet%209?serial=X1&interface=1",
            ]
        );
    }

    #[test]
    fn test_no_bulk_out_is_skipped() {
        let iface = InterfaceDesc {
            number: 0,
            alt_settings: vec![AltSettingDesc {
                interface_number: 0,
                alternate_setting: 0,
                class: 7,
                subclass: 1,
                protocol: 2,
                endpoints: vec![
                    EndpointDesc::bulk_in(1),
                    EndpointDesc {
                        address: 0x02,
                        kind: TransferKind::Interrupt,
                    },
                ],
            }],
        };
        let device = MockDevice::new(
            1,
            2,
            vec![ConfigDesc {
                value: 1,
                interfaces: vec![iface],
            }],
        );
        let state = device.state();
        let backend = MockBackend::new(vec![device]);

        let mut matcher = ListMatcher::default();
        find(&backend, &QuirkDb::default(), &mut matcher);
        assert!(matcher.found().is_empty());
        assert_eq!(state.open_count(), 0);
    }

    #[test]
    fn test_missing_device_id_still_listed() {
        let backend = MockBackend::new(vec![MockDevice::printer(1, 2)]);
        let mut matcher = ListMatcher::default();
        find(&backend, &QuirkDb::default(), &mut matcher);
        assert_eq!(matcher.found().len(), 1);
        assert_eq!(matcher.found()[0].device_id, "");
        assert_eq!(matcher.found()[0].make_model, "Unknown");
    }

    #[test]
    fn test_option_quirks() {
        assert_eq!(option_quirks(false, false), QuirkFlags::empty());
        assert_eq!(
            option_quirks(true, true),
            QuirkFlags::UNIDIR | QuirkFlags::NO_REATTACH
        );
    }
}
