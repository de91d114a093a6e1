#![allow(async_fn_in_trait)]
#![warn(clippy::large_futures)]

use core::cell::RefCell;
use core::fmt::Display;
use core::str;

use std::collections::BTreeMap;

pub mod io;
pub mod stack;
pub mod transport;

/// Upper bound for everything buffered on behalf of a single request:
/// the header block, a `Content-Length` body, a single chunk plus any
/// read-ahead surplus, or a read-until-close body.
pub const MAX_RECV_BUF: usize = 20 * 1024 * 1024;

/// Transport flavor of a client connection.
///
/// Selects the default service name used when resolving the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Protocol {
    /// Plain TCP
    Plain,
    /// TLS over TCP
    Tls,
}

impl Protocol {
    pub const fn service(&self) -> &'static str {
        match self {
            Self::Plain => "http",
            Self::Tls => "https",
        }
    }

    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Plain => 80,
            Self::Tls => 443,
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.service())
    }
}

/// A malformed field encountered while scanning a header block.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HeaderParseError {
    /// The field name is not followed by a colon
    MissingColon,
    /// The field value runs off the end of the block
    TruncatedValue,
    /// The field value is not terminated by a CR
    MissingCr,
    /// The field value cannot be parsed as required (e.g. a non-numeric
    /// `Content-Length`)
    InvalidValue,
}

impl Display for HeaderParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MissingColon => write!(f, "Header field has no colon"),
            Self::TruncatedValue => write!(f, "Header field value is truncated"),
            Self::MissingCr => write!(f, "Header field value is not CR-terminated"),
            Self::InvalidValue => write!(f, "Header field value is invalid"),
        }
    }
}

impl std::error::Error for HeaderParseError {}

/// A parsed HTTP response header block.
///
/// Owns the raw bytes between the end of the status line and the
/// terminating blank line. Field lookup is case-insensitive and lazy:
/// the first lookup of a key scans the raw block and memoizes the value's
/// byte range (or its absence); later lookups hit the map. The raw buffer
/// is never resized, so memoized ranges stay valid for the lifetime of
/// the header.
#[derive(Debug)]
pub struct Header {
    raw: Vec<u8>,
    cache: RefCell<BTreeMap<String, Option<(usize, usize)>>>,
}

impl Header {
    /// Create a header from the raw field block (status line and the
    /// final blank line already stripped; each field line keeps its CRLF).
    pub fn new(raw: Vec<u8>) -> Self {
        Self {
            raw,
            cache: RefCell::new(BTreeMap::new()),
        }
    }

    /// The raw field block.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Look up a field value by its all-lowercase key.
    ///
    /// Returns the value bytes (leading spaces skipped, CR excluded), or
    /// `None` if the block has no such field. A match whose surroundings
    /// are malformed fails with [`HeaderParseError`].
    pub fn get(&self, key: &str) -> Result<Option<&[u8]>, HeaderParseError> {
        debug_assert!(
            !key.bytes().any(|b| b.is_ascii_uppercase()),
            "header keys are looked up in lowercase"
        );

        if key.is_empty() {
            return Ok(None);
        }

        if let Some(range) = self.cache.borrow().get(key) {
            return Ok(range.map(|(start, end)| &self.raw[start..end]));
        }

        let range = self.scan(key.as_bytes())?;
        self.cache.borrow_mut().insert(key.to_owned(), range);

        Ok(range.map(|(start, end)| &self.raw[start..end]))
    }

    /// The `Content-Length` field, parsed.
    pub fn content_length(&self) -> Result<Option<u64>, HeaderParseError> {
        let Some(value) = self.get("content-length")? else {
            return Ok(None);
        };

        let value = str::from_utf8(value)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or(HeaderParseError::InvalidValue)?;

        Ok(Some(value))
    }

    /// The `Transfer-Encoding` field, raw.
    pub fn transfer_encoding(&self) -> Result<Option<&[u8]>, HeaderParseError> {
        self.get("transfer-encoding")
    }

    fn scan(&self, key: &[u8]) -> Result<Option<(usize, usize)>, HeaderParseError> {
        let Some(pos) = self
            .raw
            .windows(key.len())
            .position(|window| window.eq_ignore_ascii_case(key))
        else {
            return Ok(None);
        };

        let after_key = pos + key.len();

        let colon = self.raw[after_key..]
            .iter()
            .position(|&b| b == b':')
            .ok_or(HeaderParseError::MissingColon)?;

        let mut start = after_key + colon + 1;

        if start == self.raw.len() {
            return Err(HeaderParseError::TruncatedValue);
        }

        while self.raw[start] == b' ' {
            start += 1;

            if start == self.raw.len() {
                return Err(HeaderParseError::TruncatedValue);
            }
        }

        // The LF after the CR is deliberately not validated, matching the
        // lenient lookup this decoder has always had.
        let end = self.raw[start..]
            .iter()
            .position(|&b| b == b'\r')
            .map(|cr| start + cr)
            .ok_or(HeaderParseError::MissingCr)?;

        Ok(Some((start, end)))
    }
}
