//! Per-device quirk database.
//!
//! Quirk files live in `<data_root>/usb/`. Each non-blank, non-comment line
//! names a vendor and product (hexadecimal, product `0` matching every
//! product of the vendor) followed by flag keywords:
//!
//! ```text
//! # Canon, Inc. MP280 series
//! 0x04a9 0x1746 unidir
//! 0x0a5f 0 no-reattach soft-reset
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

bitflags! {
    /// Deviations from generic printer-class behaviour.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct QuirkFlags: u32 {
        /// Never use this device.
        const BLACKLIST = 0x01;
        /// Do not reattach the kernel printer driver after the job.
        const NO_REATTACH = 0x02;
        /// Reset the device after the job.
        const SOFT_RESET = 0x04;
        /// Ignore the bulk-IN endpoint.
        const UNIDIR = 0x08;
        /// Needs a vendor init string before printing.
        const USB_INIT = 0x10;
        /// Accept a vendor-class interface as a printer.
        const VENDOR_CLASS = 0x20;
        /// Wait a moment before closing the device.
        const DELAY_CLOSE = 0x40;
    }
}

impl QuirkFlags {
    /// Map one keyword from a quirk file.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword.to_ascii_lowercase().as_str() {
            "blacklist" => Self::BLACKLIST,
            "no-reattach" => Self::NO_REATTACH,
            "soft-reset" => Self::SOFT_RESET,
            "unidir" => Self::UNIDIR,
            "usb-init" => Self::USB_INIT,
            "vendor-class" => Self::VENDOR_CLASS,
            "delay-close" => Self::DELAY_CLOSE,
            _ => return None,
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QuirkError {
    #[error("Missing vendor/product fields")]
    MissingIds,
    #[error("Bad hexadecimal id {0:?}")]
    BadId(String),
}

/// One loaded quirk entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuirkEntry {
    pub vendor_id: u16,
    /// `0` matches every product of `vendor_id`.
    pub product_id: u16,
    pub flags: QuirkFlags,
}

fn parse_hex(field: &str) -> Result<u16, QuirkError> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u16::from_str_radix(digits, 16).map_err(|_| QuirkError::BadId(field.to_string()))
}

/// Parse one quirk line. Blank and `#` lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<QuirkEntry>, QuirkError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let vendor_id = parse_hex(fields.next().ok_or(QuirkError::MissingIds)?)?;
    let product_id = parse_hex(fields.next().ok_or(QuirkError::MissingIds)?)?;

    let mut flags = QuirkFlags::empty();
    for keyword in fields {
        match QuirkFlags::from_keyword(keyword) {
            Some(flag) => flags |= flag,
            None => warn!(keyword, "Ignoring unknown quirk keyword"),
        }
    }

    Ok(Some(QuirkEntry {
        vendor_id,
        product_id,
        flags,
    }))
}

/// Immutable vendor/product → flags table.
#[derive(Debug, Clone, Default)]
pub struct QuirkDb {
    /// Sorted by descending vendor, then descending product.
    entries: Vec<QuirkEntry>,
}

impl QuirkDb {
    pub fn new(entries: impl IntoIterator<Item = QuirkEntry>) -> Self {
        // Later entries for the same key replace earlier ones.
        let table: BTreeMap<(u16, u16), QuirkFlags> = entries
            .into_iter()
            .map(|e| ((e.vendor_id, e.product_id), e.flags))
            .collect();

        let entries = table
            .into_iter()
            .rev()
            .map(|((vendor_id, product_id), flags)| QuirkEntry {
                vendor_id,
                product_id,
                flags,
            })
            .collect();

        Self { entries }
    }

    /// Load every regular file in `dir`, in file-name order.
    ///
    /// An unreadable directory gives an empty database.
    pub fn load(dir: &Path) -> Self {
        let read_dir = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Unable to open quirks directory");
                return Self::default();
            }
        };

        let mut paths: Vec<_> = read_dir
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unable to read quirks file");
                    continue;
                }
            };
            for (lineno, line) in content.lines().enumerate() {
                match parse_line(line) {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => {}
                    Err(e) => warn!(
                        file = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping bad quirks line"
                    ),
                }
            }
        }

        let db = Self::new(entries);
        debug!(entries = db.len(), dir = %dir.display(), "Loaded USB quirks");
        db
    }

    /// Flags for a device: exact match, then the vendor wildcard, then none.
    pub fn lookup(&self, vendor_id: u16, product_id: u16) -> QuirkFlags {
        let find = |product: u16| {
            self.entries
                .iter()
                .find(|e| e.vendor_id == vendor_id && e.product_id == product)
                .map(|e| e.flags)
        };
        find(product_id)
            .or_else(|| find(0))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[QuirkEntry] {
        &self.entries
    }
}
