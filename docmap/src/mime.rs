//! MIME type ordinals.
//!
//! Documents carry their media type as a small integer ordinal assigned by the MIME
//! classifier. The store only needs to persist and compare ordinals, so [Mime] is an opaque
//! wrapper with constants for the types the store itself cares about.

use std::fmt;

/// Ordinal of a MIME type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mime(u32);

impl Mime {
    pub const TEXT_HTML: Self = Self(0);
    pub const TEXT_PLAIN: Self = Self(1);
    pub const APPLICATION_X_TREC: Self = Self(3);
    pub const TEXT_XML: Self = Self(6);
    pub const APPLICATION_PDF: Self = Self(17);
    pub const APPLICATION_OCTET_STREAM: Self = Self(32);
    pub const APPLICATION_X_GZIP: Self = Self(424);
    pub const APPLICATION_X_BZIP2: Self = Self(429);

    /// Wraps a raw ordinal.
    pub const fn new(ordinal: u32) -> Self {
        Self(ordinal)
    }

    /// Returns the raw ordinal.
    pub const fn ordinal(self) -> u32 {
        self.0
    }
}

impl Default for Mime {
    /// Most documents in a TREC-style collection are of this type, so it is stored implicitly.
    fn default() -> Self {
        Self::APPLICATION_X_TREC
    }
}

impl From<u32> for Mime {
    fn from(ordinal: u32) -> Self {
        Self(ordinal)
    }
}

impl fmt::Display for Mime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TEXT_HTML => f.write_str("text/html"),
            Self::TEXT_PLAIN => f.write_str("text/plain"),
            Self::APPLICATION_X_TREC => f.write_str("application/x-trec"),
            Self::TEXT_XML => f.write_str("text/xml"),
            Self::APPLICATION_PDF => f.write_str("application/pdf"),
            Self::APPLICATION_OCTET_STREAM => f.write_str("application/octet-stream"),
            Self::APPLICATION_X_GZIP => f.write_str("application/x-gzip"),
            Self::APPLICATION_X_BZIP2 => f.write_str("application/x-bzip2"),
            Self(ordinal) => write!(f, "mime#{ordinal}"),
        }
    }
}
