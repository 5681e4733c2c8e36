//! The protocol hello: the first value each side sends, outside any envelope.

use orbpack::Value;
use orbpack::tuple;

use crate::error::LinkError;
use crate::error::Result;

pub const PROTOCOL: &[u8] = b"VOL_DRAFT";

pub const VERSION: (u64, u64) = (0, 8);

const URL_SCHEMES: [&str; 3] = ["http://", "https://", "vop://"];

/// License terms a side announces in its hello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyleftInfo {
    pub is_copyleft: bool,
    pub license: Option<String>,
    pub url: Option<String>,
}

impl CopyleftInfo {
    pub fn copyleft(license: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            is_copyleft: true,
            license: Some(license.into()),
            url: Some(url.into()),
        }
    }

    /// Copyleft terms need a license name and a url with a known scheme;
    /// anything else must carry neither.
    pub fn validate(&self) -> Result<()> {
        if !self.is_copyleft {
            if self.license.is_some() || self.url.is_some() {
                return Err(handshake("license data without copyleft"));
            }
            return Ok(());
        }
        if self.license.is_none() {
            return Err(handshake("copyleft without a license name"));
        }
        let Some(url) = &self.url else {
            return Err(handshake("copyleft without a license url"));
        };
        let lower = url.to_ascii_lowercase();
        if !URL_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return Err(handshake("malformed license url"));
        }
        Ok(())
    }

    fn to_value(&self) -> Value {
        tuple![self.is_copyleft, self.license.clone(), self.url.clone()]
    }
}

pub(crate) fn hello(info: &CopyleftInfo) -> Value {
    tuple![PROTOCOL, info.to_value(), tuple![VERSION.0, VERSION.1]]
}

/// Validates a peer hello and returns its license terms.
pub(crate) fn parse_hello(value: Value) -> Result<CopyleftInfo> {
    let Some(items) = value.into_tuple() else {
        return Err(handshake("hello is not a tuple"));
    };
    let [protocol, copyleft, version]: [Value; 3] = items
        .try_into()
        .map_err(|_| handshake("hello needs three elements"))?;

    if protocol.as_bytes() != Some(PROTOCOL) {
        return Err(handshake("unknown protocol name"));
    }
    let version = version
        .as_tuple()
        .ok_or_else(|| handshake("version is not a tuple"))?;
    let numbers: Option<Vec<u64>> = version.iter().map(Value::as_u64).collect();
    if numbers.as_deref() != Some(&[VERSION.0, VERSION.1][..]) {
        return Err(handshake("unsupported protocol version"));
    }

    let Some(copyleft) = copyleft.into_tuple() else {
        return Err(handshake("copyleft data is not a tuple"));
    };
    let [is_copyleft, license, url]: [Value; 3] = copyleft
        .try_into()
        .map_err(|_| handshake("copyleft tuple needs three elements"))?;
    let is_copyleft = is_copyleft
        .as_bool()
        .ok_or_else(|| handshake("copyleft flag is not a boolean"))?;
    let info = CopyleftInfo {
        is_copyleft,
        license: optional_text(license)?,
        url: optional_text(url)?,
    };
    info.validate()?;
    Ok(info)
}

fn optional_text(value: Value) -> Result<Option<String>> {
    match value {
        Value::None => Ok(None),
        Value::Utf(text) => Ok(Some(text)),
        _ => Err(handshake("license field is neither a string nor none")),
    }
}

fn handshake(msg: &str) -> LinkError {
    LinkError::Handshake(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_hello_parses() {
        let info = CopyleftInfo::copyleft("LGPLv3", "HTTPS://example.org/license");
        assert_eq!(parse_hello(hello(&info)), Ok(info));
        assert_eq!(parse_hello(hello(&CopyleftInfo::default())), Ok(CopyleftInfo::default()));
    }

    #[test]
    fn test_rejects_bad_url_scheme() {
        let info = CopyleftInfo::copyleft("GPL", "ftp://example.org");
        assert!(matches!(parse_hello(hello(&info)), Err(LinkError::Handshake(_))));
    }

    #[test]
    fn test_rejects_license_without_copyleft() {
        let info = CopyleftInfo {
            is_copyleft: false,
            license: Some("MIT".into()),
            url: None,
        };
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_rejects_wrong_protocol_and_version() {
        let copyleft = CopyleftInfo::default().to_value();
        let wrong_name = tuple![&b"VOL_OTHER"[..], copyleft.clone(), tuple![0u64, 8u64]];
        assert!(parse_hello(wrong_name).is_err());
        let wrong_version = tuple![PROTOCOL, copyleft.clone(), tuple![0u64, 9u64]];
        assert!(parse_hello(wrong_version).is_err());
        assert!(parse_hello(tuple![PROTOCOL, copyleft]).is_err());
        assert!(parse_hello(Value::None).is_err());
    }
}
