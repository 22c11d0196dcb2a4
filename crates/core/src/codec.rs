//! Wire codecs for everything that crosses a process boundary.
//!
//! Three interchangeable formats are supported; which one is used by a
//! given remote consumer is negotiated at handshake time. The text and xml
//! forms wrap the payload in the historical top-level tag
//! [`PAYLOAD_ROOT_TAG`]; the binary form is a postcard payload prefixed
//! with a single version byte.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Top-level name tag carried by the text and xml forms.
pub const PAYLOAD_ROOT_TAG: &str = "classhierarchyFromT";

/// Version byte leading every binary-encoded payload.
pub const BINARY_FORMAT_VERSION: u8 = 1;

/// Serialization format used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Text,
    Xml,
    Binary,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Text => "text",
            WireFormat::Xml => "xml",
            WireFormat::Binary => "binary",
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(WireFormat::Text),
            "xml" => Ok(WireFormat::Xml),
            "binary" => Ok(WireFormat::Binary),
            other => Err(format!("unknown wire format: {other:?}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("text codec: {0}")]
    Text(#[from] serde_json::Error),
    #[error("xml codec: {0}")]
    Xml(String),
    #[error("binary codec: {0}")]
    Binary(#[from] postcard::Error),
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("empty binary payload")]
    Empty,
    #[error("unsupported binary format version {0}")]
    Version(u8),
}

#[derive(Serialize)]
struct TaggedRef<'a, T> {
    #[serde(rename = "classhierarchyFromT")]
    inner: &'a T,
}

#[derive(Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct Tagged<T> {
    #[serde(rename = "classhierarchyFromT")]
    inner: T,
}

/// Encode `value` in the given format.
pub fn encode<T: Serialize>(format: WireFormat, value: &T) -> Result<Vec<u8>, CodecError> {
    match format {
        WireFormat::Text => Ok(serde_json::to_vec(&TaggedRef { inner: value })?),
        WireFormat::Xml => {
            let xml = quick_xml::se::to_string_with_root(PAYLOAD_ROOT_TAG, value)
                .map_err(|err| CodecError::Xml(err.to_string()))?;
            Ok(xml.into_bytes())
        }
        WireFormat::Binary => {
            let mut bytes = vec![BINARY_FORMAT_VERSION];
            bytes.extend(postcard::to_allocvec(value)?);
            Ok(bytes)
        }
    }
}

/// Decode a payload previously produced by [`encode`] with the same format.
pub fn decode<T: DeserializeOwned>(format: WireFormat, bytes: &[u8]) -> Result<T, CodecError> {
    match format {
        WireFormat::Text => {
            let tagged: Tagged<T> = serde_json::from_slice(bytes)?;
            Ok(tagged.inner)
        }
        WireFormat::Xml => {
            let text = std::str::from_utf8(bytes).map_err(|_| CodecError::Utf8)?;
            quick_xml::de::from_str(text).map_err(|err| CodecError::Xml(err.to_string()))
        }
        WireFormat::Binary => {
            let (version, rest) = bytes.split_first().ok_or(CodecError::Empty)?;
            if *version != BINARY_FORMAT_VERSION {
                return Err(CodecError::Version(*version));
            }
            Ok(postcard::from_bytes(rest)?)
        }
    }
}

impl<E: crate::item::Evaluate> crate::item::WorkItem<E> {
    /// Serialize for the wire in the given format.
    pub fn to_wire(&self, format: WireFormat) -> Result<Vec<u8>, CodecError> {
        encode(format, self)
    }

    /// Rebuild an item from its wire form. All observable fields equal
    /// those at serialization time.
    pub fn from_wire(format: WireFormat, bytes: &[u8]) -> Result<Self, CodecError> {
        decode(format, bytes)
    }
}
