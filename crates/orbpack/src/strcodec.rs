//! Named string codecs carried on the wire.

use crate::types::Error;
use crate::types::Result;

const UTF16_BOM_LE: [u8; 2] = [0xFF, 0xFE];
const UTF16_BOM_BE: [u8; 2] = [0xFE, 0xFF];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrCodec {
    #[default]
    Utf8,
    Utf16,
}

impl StrCodec {
    /// Resolves a wire codec name, ignoring case and `-`/`_` separators.
    pub fn from_name(name: &str) -> Result<Self> {
        let folded: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match folded.as_str() {
            "utf8" => Ok(Self::Utf8),
            "utf16" => Ok(Self::Utf16),
            _ => Err(Error::UnknownCodec(name.to_string())),
        }
    }

    pub fn from_name_bytes(name: &[u8]) -> Result<Self> {
        let name = std::str::from_utf8(name)
            .map_err(|_| Error::UnknownCodec(String::from_utf8_lossy(name).into_owned()))?;
        Self::from_name(name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Utf16 => "utf16",
        }
    }

    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Utf16 => {
                let mut out = UTF16_BOM_LE.to_vec();
                for unit in text.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                out
            }
        }
    }

    pub fn decode(self, data: &[u8]) -> Result<String> {
        match self {
            Self::Utf8 => String::from_utf8(data.to_vec())
                .map_err(|e| Error::InvalidText(e.to_string())),
            Self::Utf16 => decode_utf16(data),
        }
    }
}

fn decode_utf16(data: &[u8]) -> Result<String> {
    let (body, big_endian) = match data {
        [0xFF, 0xFE, rest @ ..] => (rest, false),
        [0xFE, 0xFF, rest @ ..] => (rest, true),
        _ => (data, false),
    };
    if body.len() % 2 != 0 {
        return Err(Error::InvalidText("odd number of utf16 bytes".into()));
    }
    let units = body.chunks_exact(2).map(|pair| {
        let pair = [pair[0], pair[1]];
        if big_endian { u16::from_be_bytes(pair) } else { u16::from_le_bytes(pair) }
    });
    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|e| Error::InvalidText(e.to_string()))
}
