//! `usb://` device URIs.
//!
//! A URI names a printer by make and model, optionally pinned to a serial
//! number and interface: `usb://HP/LaserJet%201020?serial=ABC&interface=1`.

use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use thiserror::Error;
use url::Url;

use crate::protocol::constants::URI_SCHEME;

/// Everything outside the URI unreserved set gets escaped.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("Device URI {0:?} has no scheme")]
    MissingScheme(String),
    #[error("Device URI {0:?} is malformed: {1}")]
    Malformed(String, url::ParseError),
    #[error("Device URI scheme {0:?} is not handled by this backend")]
    WrongScheme(String),
    #[error("Bad interface number {0:?}")]
    BadInterface(String),
}

/// A parsed device URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUri {
    /// Decoded manufacturer (URI host part).
    pub make: String,
    /// Decoded model (URI path, without the leading slash).
    pub model: String,
    /// `serial=`; the literal `?` means "no serial".
    pub serial: Option<String>,
    /// `interface=`.
    pub interface: Option<u8>,
    /// `waiteof=`; not part of the printer's identity.
    pub wait_eof: Option<bool>,
}

impl DeviceUri {
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let url = Url::parse(uri).map_err(|e| match e {
            url::ParseError::RelativeUrlWithoutBase => UriError::MissingScheme(uri.to_string()),
            e => UriError::Malformed(uri.to_string(), e),
        })?;
        if url.scheme() != URI_SCHEME {
            return Err(UriError::WrongScheme(url.scheme().to_string()));
        }

        let path = url.path();
        let mut parsed = Self {
            make: decode(url.host_str().unwrap_or_default()),
            model: decode(path.strip_prefix('/').unwrap_or(path)),
            serial: None,
            interface: None,
            wait_eof: None,
        };

        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "serial" => {
                    parsed.serial = (!value.is_empty() && value != "?").then(|| value.into_owned());
                }
                "interface" => {
                    let number = value
                        .parse()
                        .map_err(|_| UriError::BadInterface(value.to_string()))?;
                    parsed.interface = Some(number);
                }
                "waiteof" => parsed.wait_eof = parse_bool(&value),
                _ => {}
            }
        }

        Ok(parsed)
    }

    /// Whether `self` (the URI being printed to) names the same printer as
    /// `detected`. A serial or interface present on only one side is ignored.
    pub fn matches(&self, detected: &DeviceUri) -> bool {
        fn agree<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        self.make == detected.make
            && self.model == detected.model
            && agree(&self.serial, &detected.serial)
            && agree(&self.interface, &detected.interface)
    }
}

impl fmt::Display for DeviceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{URI_SCHEME}://{}/{}",
            encode(&self.make),
            encode(&self.model)
        )?;
        let mut separator = '?';
        if let Some(serial) = &self.serial {
            write!(f, "{separator}serial={}", encode(serial))?;
            separator = '&';
        }
        if let Some(interface) = self.interface {
            write!(f, "{separator}interface={interface}")?;
            separator = '&';
        }
        if let Some(wait_eof) = self.wait_eof {
            write!(f, "{separator}waiteof={wait_eof}")?;
        }
        Ok(())
    }
}

/// Escape a make, model or serial for use in a device URI.
pub(crate) fn encode(component: &str) -> impl fmt::Display + '_ {
    utf8_percent_encode(component, COMPONENT)
}

fn decode(component: &str) -> String {
    percent_decode_str(component)
        .decode_utf8_lossy()
        .into_owned()
}

/// Compare a requested URI string against a detected one.
///
/// Unparseable URIs only match when the strings are identical.
pub fn uri_matches(requested: &str, detected: &str) -> bool {
    match (DeviceUri::parse(requested), DeviceUri::parse(detected)) {
        (Ok(requested), Ok(detected)) => requested.matches(&detected),
        _ => requested == detected,
    }
}

/// Spooler-style boolean option value.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let uri = DeviceUri::parse("usb://HP/LaserJet%201020?serial=ABC&interface=1").unwrap();
        assert_eq!(uri.make, "HP");
        assert_eq!(uri.model, "LaserJet 1020");
        assert_eq!(uri.serial.as_deref(), Some("ABC"));
        assert_eq!(uri.interface, Some(1));
        assert_eq!(uri.wait_eof, None);
        assert_eq!(
            uri.to_string(),
            "usb://HP/LaserJet%201020?serial=ABC&interface=1"
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            DeviceUri::parse("HP/LaserJet"),
            Err(UriError::MissingScheme(_))
        ));
        assert!(matches!(
            DeviceUri::parse("socket://10.0.0.1"),
            Err(UriError::WrongScheme(_))
        ));
        assert!(matches!(
            DeviceUri::parse("usb://HP/LaserJet?interface=x"),
            Err(UriError::BadInterface(_))
        ));
    }

    #[test]
    fn test_serial_question_mark_means_none() {
        let uri = DeviceUri::parse("usb://HP/LaserJet?serial=?").unwrap();
        assert_eq!(uri.serial, None);
        assert!(uri_matches("usb://HP/LaserJet?serial=?", "usb://HP/LaserJet"));
    }

    #[test]
    fn test_interface_on_one_side_ignored() {
        assert!(uri_matches(
            "usb://HP/LaserJet?serial=ABC",
            "usb://HP/LaserJet?serial=ABC&interface=0"
        ));
        assert!(uri_matches(
            "usb://Epson/Stylus?serial=12345",
            "usb://Epson/Stylus?serial=12345&interface=1"
        ));
        assert!(!uri_matches(
            "usb://Epson/Stylus?interface=0",
            "usb://Epson/Stylus?interface=1"
        ));
    }

    #[test]
    fn test_serial_matching() {
        assert!(uri_matches("usb://Epson/Stylus", "usb://Epson/Stylus?serial=99"));
        assert!(!uri_matches(
            "usb://Epson/Stylus?serial=11",
            "usb://Epson/Stylus?serial=22"
        ));
        assert!(!uri_matches("usb://Epson/Stylus", "usb://Epson/Other"));
        assert!(!uri_matches("usb://Canon/Stylus", "usb://Epson/Stylus"));
    }

    #[test]
    fn test_waiteof_ignored_by_matching() {
        let uri = DeviceUri::parse("usb://Epson/Stylus?waiteof=false").unwrap();
        assert_eq!(uri.wait_eof, Some(false));
        assert!(uri_matches(
            "usb://Epson/Stylus?serial=1&waiteof=false",
            "usb://Epson/Stylus?serial=1"
        ));
    }

    #[test]
    fn test_encoding() {
        assert_eq!(encode("Stylus Photo R300").to_string(), "Stylus%20Photo%20R300");
        assert_eq!(encode("a/b?c&d").to_string(), "a%2Fb%3Fc%26d");
        assert_eq!(decode("Stylus%20Photo"), "Stylus Photo");
        assert_eq!(decode("100%"), "100%");
        assert_eq!(decode("%zz%4"), "%zz%4");
        assert!(uri_matches("usb://Epson/Stylus%20Photo", "usb://Epson/Stylus%20Photo"));
    }

    #[test]
    fn test_escaped_components_round_trip() {
        let uri = DeviceUri {
            make: "Hewlett Packard".to_string(),
            model: "Deskjet 5550/5551".to_string(),
            serial: Some("A&B=C".to_string()),
            interface: Some(2),
            wait_eof: Some(false),
        };
        let text = uri.to_string();
        assert_eq!(
            text,
            "usb://Hewlett%20Packard/Deskjet%205550%2F5551?serial=A%26B%3DC&interface=2&waiteof=false"
        );
        assert_eq!(DeviceUri::parse(&text).unwrap(), uri);
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let uri = DeviceUri::parse("USB://Epson/Stylus").unwrap();
        assert_eq!(uri.make, "Epson");
        assert_eq!(uri.model, "Stylus");
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("On"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
