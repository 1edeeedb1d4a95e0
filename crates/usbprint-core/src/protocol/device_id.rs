//! IEEE-1284 device ID decoding and the identity strings derived from it.
//!
//! The GET_DEVICE_ID class request answers with a two-byte length followed by
//! a `KEY:value;` string. The standard says the length is big-endian and
//! includes the prefix itself, but enough printers get the byte order wrong
//! that both readings have to be tried.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::DEVICE_ID_MIN_LEN;
use crate::uri::DeviceUri;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdError {
    #[error("Device ID response too short: {0} bytes")]
    TooShort(usize),
    #[error(
        "Implausible device ID length: {big_endian} (BE) / {little_endian} (LE) with {available} bytes available"
    )]
    ImplausibleLength {
        big_endian: usize,
        little_endian: usize,
        available: usize,
    },
}

/// Extract the device ID text from a raw GET_DEVICE_ID response.
///
/// A declared length is plausible when it is at least [`DEVICE_ID_MIN_LEN`]
/// and fits in `buf`. The big-endian reading is tried first, then the
/// little-endian one; if neither is plausible there is no device ID.
pub fn decode_device_id(buf: &[u8]) -> Result<String, DeviceIdError> {
    if buf.len() < 2 {
        return Err(DeviceIdError::TooShort(buf.len()));
    }

    let plausible = |len: usize| (DEVICE_ID_MIN_LEN..=buf.len()).contains(&len);
    let big_endian = BigEndian::read_u16(&buf[..2]) as usize;
    let little_endian = LittleEndian::read_u16(&buf[..2]) as usize;

    let length = if plausible(big_endian) {
        big_endian
    } else if plausible(little_endian) {
        little_endian
    } else {
        return Err(DeviceIdError::ImplausibleLength {
            big_endian,
            little_endian,
            available: buf.len(),
        });
    };

    let text = &buf[2..length];
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    Ok(String::from_utf8_lossy(&text[..end]).into_owned())
}

/// Parsed `KEY:value;` pairs of a device ID. Keys compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceId {
    values: Vec<(String, String)>,
}

impl DeviceId {
    pub fn parse(raw: &str) -> Self {
        let values = raw
            .split(';')
            .filter_map(|field| {
                let (key, value) = field.split_once(':')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// First non-empty value among `keys`, in order.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.first_of(&["MANUFACTURER", "MFG"])
    }

    pub fn model(&self) -> Option<&str> {
        self.first_of(&["MODEL", "MDL"])
    }

    pub fn description(&self) -> Option<&str> {
        self.first_of(&["DESCRIPTION", "DES"])
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.first_of(&["SERIALNUMBER", "SERN", "SN"])
    }

    /// Human-readable make and model, as reported in discovery output.
    pub fn make_model(&self) -> String {
        let combined = match (self.manufacturer(), self.model()) {
            (Some(mfg), Some(mdl)) => {
                if starts_with_ignore_case(mdl, mfg) {
                    mdl.to_string()
                } else {
                    format!("{mfg} {mdl}")
                }
            }
            (None, Some(mdl)) => mdl.to_string(),
            _ => match self.description() {
                Some(des) => des.to_string(),
                None => return "Unknown".to_string(),
            },
        };
        normalize_make_model(&combined)
    }
}

/// Collapse the long Hewlett-Packard spellings printers like to report.
fn normalize_make_model(make_model: &str) -> String {
    for prefix in ["Hewlett-Packard hp ", "Hewlett-Packard "] {
        if starts_with_ignore_case(make_model, prefix) {
            return format!("HP {}", &make_model[prefix.len()..]);
        }
    }
    make_model.to_string()
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Manufacturer component of the device URI.
fn uri_manufacturer(id: &DeviceId) -> String {
    if let Some(mfg) = id.manufacturer() {
        if mfg.eq_ignore_ascii_case("Hewlett-Packard") {
            return "HP".to_string();
        }
        if mfg.eq_ignore_ascii_case("Lexmark International") {
            return "Lexmark".to_string();
        }
        return mfg.to_string();
    }

    // No manufacturer: borrow the first word of the model or description.
    id.model()
        .or_else(|| id.description())
        .map(|s| normalize_make_model(s))
        .and_then(|s| s.split_whitespace().next().map(str::to_string))
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Build the canonical `usb://` URI for a printer.
///
/// `serial=` is present when a serial number is known (device ID first, then
/// the USB serial string); `interface=` only when the device exposes more than
/// one printer interface and the caller passes its number.
pub fn make_device_uri(device_id: &str, usb_serial: Option<&str>, interface: Option<u8>) -> String {
    let id = DeviceId::parse(device_id);
    let mfg = uri_manufacturer(&id);
    let mdl = id
        .model()
        .or_else(|| id.description())
        .unwrap_or("Unknown");
    let serial = id
        .serial_number()
        .or(usb_serial.map(str::trim).filter(|s| !s.is_empty()));

    DeviceUri {
        make: mfg,
        model: mdl.to_string(),
        serial: serial.map(str::to_string),
        interface,
        wait_eof: None,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_prefix(text: &str, big_endian: bool) -> Vec<u8> {
        let len = (text.len() + 2) as u16;
        let mut buf = if big_endian {
            len.to_be_bytes().to_vec()
        } else {
            len.to_le_bytes().to_vec()
        };
        buf.extend_from_slice(text.as_bytes());
        buf
    }

    const EPSON_ID: &str = "MFG:EPSON;CMD:ESCPL2;MDL:Stylus Photo R300;CLS:PRINTER;";

    #[test]
    fn test_decode_big_endian() {
        let buf = with_prefix(EPSON_ID, true);
        assert_eq!(decode_device_id(&buf).unwrap(), EPSON_ID);
    }

    #[test]
    fn test_decode_falls_back_to_little_endian() {
        // Read big-endian, the prefix is far beyond the buffer.
        let buf = with_prefix(EPSON_ID, false);
        assert!(BigEndian::read_u16(&buf) as usize > buf.len());
        assert_eq!(decode_device_id(&buf).unwrap(), EPSON_ID);
    }

    #[test]
    fn test_decode_small_big_endian_uses_little_endian() {
        let text = "MFG:HP;MDL:X;";
        let mut buf = vec![0x0F, 0x00];
        buf.extend_from_slice(text.as_bytes());
        // BE = 0x0F00 (too big), LE = 0x000F = 15 -> 13 bytes of text.
        assert_eq!(decode_device_id(&buf).unwrap(), text);

        let mut buf = vec![0x00, 0x05];
        buf.extend_from_slice(&[b'x'; 20]);
        // BE = 5 (too small), LE = 0x0500 (too big).
        assert!(matches!(
            decode_device_id(&buf),
            Err(DeviceIdError::ImplausibleLength { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_short_and_garbage() {
        assert_eq!(decode_device_id(&[]), Err(DeviceIdError::TooShort(0)));
        assert_eq!(decode_device_id(&[0x01]), Err(DeviceIdError::TooShort(1)));
        assert!(decode_device_id(&[0xFF, 0xFF, b'a', b'b']).is_err());
        assert!(decode_device_id(&[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_decode_stops_at_nul() {
        let mut buf = with_prefix("MFG:HP;MDL:LaserJet 4;", true);
        buf[10] = 0;
        assert_eq!(decode_device_id(&buf).unwrap(), "MFG:HP;M");
    }

    #[test]
    fn test_parse_keys_case_insensitive() {
        let id = DeviceId::parse("mfg:EPSON; MDL : Stylus ;SN:1234;EMPTY:;");
        assert_eq!(id.manufacturer(), Some("EPSON"));
        assert_eq!(id.model(), Some("Stylus"));
        assert_eq!(id.serial_number(), Some("1234"));
        assert_eq!(id.get("EMPTY"), None);
        assert_eq!(id.get("missing"), None);
    }

    #[test]
    fn test_make_model() {
        assert_eq!(DeviceId::parse(EPSON_ID).make_model(), "EPSON Stylus Photo R300");
        assert_eq!(
            DeviceId::parse("MFG:HP;MDL:HP LaserJet 1020;").make_model(),
            "HP LaserJet 1020"
        );
        assert_eq!(
            DeviceId::parse("MFG:Hewlett-Packard;MDL:hp deskjet 990c;").make_model(),
            "HP deskjet 990c"
        );
        assert_eq!(DeviceId::parse("DES:Label Printer;").make_model(), "Label Printer");
        assert_eq!(DeviceId::parse("").make_model(), "Unknown");
    }

    #[test]
    fn test_make_device_uri() {
        assert_eq!(
            make_device_uri(EPSON_ID, None, None),
            "usb://EPSON/Stylus%20Photo%20R300"
        );
        assert_eq!(
            make_device_uri("MFG:Hewlett-Packard;MDL:LaserJet;SERN:ABC;", Some("XYZ"), Some(1)),
            "usb://HP/LaserJet?serial=ABC&interface=1"
        );
        assert_eq!(
            make_device_uri("MFG:Lexmark International;MDL:E120;", Some("77"), None),
            "usb://Lexmark/E120?serial=77"
        );
        assert_eq!(
            make_device_uri("MDL:Zebra ZD420;", None, Some(0)),
            "usb://Zebra/Zebra%20ZD420?interface=0"
        );
        assert_eq!(make_device_uri("", None, None), "usb://Unknown/Unknown");
    }
}
