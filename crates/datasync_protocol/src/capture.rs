//! Capture-file header format.
//!
//! A capture file starts with a fixed prefix followed by the CBOR-encoded
//! [`CaptureMetadata`] and then the raw data section:
//!
//! ```text
//! | magic "DSCAP\0" (6) | version (1) | metadata len u32 BE (4) | metadata | data ... |
//! ```
//!
//! Files that do not start with the magic are arbitrary files. This module
//! is pure; reading the header from an open file lives in the engine.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{from_cbor, to_cbor, CaptureMetadata};

/// Magic bytes that identify a capture file.
pub const MAGIC: &[u8; 6] = b"DSCAP\0";

/// Current capture format version.
pub const FORMAT_VERSION: u8 = 1;

/// Length of the fixed prefix (magic, version, metadata length).
pub const PREFIX_LEN: usize = MAGIC.len() + 1 + 4;

/// Upper bound on the encoded metadata size.
pub const MAX_METADATA_LEN: u32 = 1024 * 1024;

/// Returns true if `bytes` starts with the capture magic.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

/// Parses the fixed prefix.
///
/// Returns `Ok(None)` if the prefix does not carry the magic (the file is
/// arbitrary), or the length of the metadata block that follows.
pub fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> ProtocolResult<Option<u32>> {
    if !has_magic(prefix) {
        return Ok(None);
    }

    let version = prefix[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&prefix[MAGIC.len() + 1..]);
    let len = u32::from_be_bytes(len_bytes);
    if len == 0 || len > MAX_METADATA_LEN {
        return Err(ProtocolError::invalid_header(format!(
            "metadata length {} out of range",
            len
        )));
    }

    Ok(Some(len))
}

/// Decodes the metadata block that follows the prefix.
pub fn decode_metadata(bytes: &[u8]) -> ProtocolResult<CaptureMetadata> {
    from_cbor(bytes).map_err(|e| ProtocolError::invalid_header(e.to_string()))
}

/// Encodes a complete header (prefix and metadata block).
pub fn encode_header(metadata: &CaptureMetadata) -> ProtocolResult<Vec<u8>> {
    let body = to_cbor(metadata)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_METADATA_LEN)
        .ok_or_else(|| ProtocolError::encoding_failed("capture metadata too large"))?;

    let mut header = Vec::with_capacity(PREFIX_LEN + body.len());
    header.extend_from_slice(MAGIC);
    header.push(FORMAT_VERSION);
    header.extend_from_slice(&len.to_be_bytes());
    header.extend_from_slice(&body);
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DataType;

    fn prefix_of(header: &[u8]) -> [u8; PREFIX_LEN] {
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&header[..PREFIX_LEN]);
        prefix
    }

    #[test]
    fn header_parses_back() {
        let meta = CaptureMetadata::new("arm", "arm1", "EndPosition", DataType::TabularSensor);
        let header = encode_header(&meta).unwrap();

        let len = parse_prefix(&prefix_of(&header)).unwrap().unwrap() as usize;
        assert_eq!(header.len(), PREFIX_LEN + len);
        assert_eq!(decode_metadata(&header[PREFIX_LEN..]).unwrap(), meta);
    }

    #[test]
    fn no_magic_is_arbitrary() {
        let prefix = *b"hello world";
        assert_eq!(parse_prefix(&prefix).unwrap(), None);
        assert!(!has_magic(b"DSC"));
    }

    #[test]
    fn unknown_version_rejected() {
        let meta = CaptureMetadata::new("arm", "arm1", "EndPosition", DataType::TabularSensor);
        let mut header = encode_header(&meta).unwrap();
        header[MAGIC.len()] = 9;
        assert_eq!(
            parse_prefix(&prefix_of(&header)),
            Err(ProtocolError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn zero_length_metadata_rejected() {
        let mut prefix = [0u8; PREFIX_LEN];
        prefix[..MAGIC.len()].copy_from_slice(MAGIC);
        prefix[MAGIC.len()] = FORMAT_VERSION;
        assert!(matches!(
            parse_prefix(&prefix),
            Err(ProtocolError::InvalidCaptureHeader { .. })
        ));
    }

    #[test]
    fn corrupt_metadata_rejected() {
        assert!(matches!(
            decode_metadata(&[0x01, 0x02]),
            Err(ProtocolError::InvalidCaptureHeader { .. })
        ));
    }
}
