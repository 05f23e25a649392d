//! Text-or-bytes payloads and the codec that converts between them.

use crate::error::{Error, Result};
use encoding_rs::Encoding;
use std::borrow::Cow;
use std::fmt;

/// A chunk of process input or output.
///
/// Descriptors in text mode hand out [`Data::Text`], binary descriptors hand
/// out [`Data::Bytes`]. Either kind can be fed to any descriptor; the
/// receiving side converts it with its own [`Codec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Data {
    Text(String),
    Bytes(Vec<u8>),
}

impl Data {
    pub fn is_text(&self) -> bool {
        matches!(self, Data::Text(_))
    }

    /// Raw view. Text is viewed as its UTF-8 bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Data::Text(s) => s.as_bytes(),
            Data::Bytes(b) => b,
        }
    }

    /// The text, if this chunk is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::Text(s) => Some(s),
            Data::Bytes(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// The raw bytes; text is taken as UTF-8.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Data::Text(s) => s.into_bytes(),
            Data::Bytes(b) => b,
        }
    }

    /// Text for display purposes; invalid UTF-8 is replaced.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        match self {
            Data::Text(s) => Cow::Borrowed(s),
            Data::Bytes(b) => String::from_utf8_lossy(b),
        }
    }

    /// True if the chunk contains a line boundary.
    pub fn has_newline(&self) -> bool {
        self.as_bytes().contains(&b'\n')
    }

    /// Copy with trailing whitespace removed.
    pub fn trim_end(&self) -> Data {
        match self {
            Data::Text(s) => Data::Text(s.trim_end().to_string()),
            Data::Bytes(b) => {
                let end = b
                    .iter()
                    .rposition(|c| !c.is_ascii_whitespace())
                    .map_or(0, |i| i + 1);
                Data::Bytes(b[..end].to_vec())
            }
        }
    }

    /// Split into lines, each keeping its terminator.
    pub fn split_lines(&self) -> Vec<Data> {
        match self {
            Data::Text(s) => s
                .split_inclusive('\n')
                .map(|l| Data::Text(l.to_string()))
                .collect(),
            Data::Bytes(b) => b
                .split_inclusive(|c| *c == b'\n')
                .map(|l| Data::Bytes(l.to_vec()))
                .collect(),
        }
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Text(s.to_string())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Text(s)
    }
}

impl From<&String> for Data {
    fn from(s: &String) -> Self {
        Data::Text(s.clone())
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Data::Bytes(b)
    }
}

impl From<&[u8]> for Data {
    fn from(b: &[u8]) -> Self {
        Data::Bytes(b.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Data {
    fn from(b: &[u8; N]) -> Self {
        Data::Bytes(b.to_vec())
    }
}

impl PartialEq<str> for Data {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for Data {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<[u8]> for Data {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

/// Converts between text and the bytes a process reads or writes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    encoding: &'static Encoding,
}

impl Codec {
    pub const UTF8: Codec = Codec {
        encoding: encoding_rs::UTF_8,
    };

    /// Look up a codec by WHATWG label, e.g. `"utf-8"` or `"iso-8859-7"`.
    pub fn for_label(label: &str) -> Result<Self> {
        Encoding::for_label(label.trim().as_bytes())
            .map(|encoding| Codec { encoding })
            .ok_or_else(|| Error::UnknownEncoding(label.to_string()))
    }

    /// Canonical name of the encoding.
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Encode text, substituting characters the encoding cannot represent.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (bytes, _, _) = self.encoding.encode(text);
        bytes.into_owned()
    }

    /// Strict decode; malformed input is an error.
    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(Cow::into_owned)
            .ok_or_else(|| Error::Decode {
                encoding: self.name().to_string(),
            })
    }

    /// Decode replacing malformed sequences.
    pub fn decode_lossy(&self, bytes: &[u8]) -> String {
        let (text, _) = self.encoding.decode_without_bom_handling(bytes);
        text.into_owned()
    }

    /// Bytes to hand to a process speaking this codec.
    pub fn to_wire(&self, data: &Data) -> Vec<u8> {
        match data {
            Data::Text(s) => self.encode(s),
            Data::Bytes(b) => b.clone(),
        }
    }

    /// View raw process bytes as text or bytes.
    pub fn view(&self, bytes: &[u8], text: bool) -> Result<Data> {
        if text {
            self.decode(bytes).map(Data::Text)
        } else {
            Ok(Data::Bytes(bytes.to_vec()))
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::UTF8
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Codec({})", self.name())
    }
}
