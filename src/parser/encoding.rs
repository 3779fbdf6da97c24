//! Index-file encoding detection
//!
//! Directory-tree exports come from a mix of clients: UTF-8, UTF-8 with BOM,
//! UTF-16 and GB18030 are all seen in the wild. Decoding sniffs the BOM
//! first, prefers strict UTF-8, then falls back through the legacy codecs.

use encoding_rs::{Encoding, GB18030, UTF_16BE, UTF_16LE, UTF_8};

/// Decode error carrying a byte-range descriptor for diagnostics
#[derive(Debug, thiserror::Error)]
#[error("undecodable content near byte offset {offset}")]
pub struct DecodeError {
    pub offset: usize,
}

fn bom_encoding(data: &[u8]) -> Option<&'static Encoding> {
    if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        Some(UTF_8)
    } else if data.starts_with(&[0xFF, 0xFE]) {
        Some(UTF_16LE)
    } else if data.starts_with(&[0xFE, 0xFF]) {
        Some(UTF_16BE)
    } else {
        None
    }
}

/// Offset of the first byte UTF-8 cannot decode, for error reporting
fn first_invalid_utf8_offset(data: &[u8]) -> usize {
    match std::str::from_utf8(data) {
        Ok(_) => 0,
        Err(e) => e.valid_up_to(),
    }
}

/// Decode an uploaded index blob into text.
///
/// UTF-8 is authoritative when it decodes cleanly. Otherwise GB18030 is
/// tried (it covers GBK and GB2312 exports); a decode that still replaces
/// characters is rejected rather than silently corrupting paths.
pub fn decode_index_blob(data: &[u8]) -> Result<String, DecodeError> {
    if let Some(encoding) = bom_encoding(data) {
        let (text, _, had_errors) = encoding.decode(data);
        if had_errors {
            return Err(DecodeError {
                offset: first_invalid_utf8_offset(data),
            });
        }
        return Ok(text.into_owned());
    }

    if let Ok(text) = std::str::from_utf8(data) {
        return Ok(text.to_string());
    }

    let (text, _, had_errors) = GB18030.decode(data);
    if had_errors {
        return Err(DecodeError {
            offset: first_invalid_utf8_offset(data),
        });
    }
    Ok(text.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_utf8() {
        let text = decode_index_blob("|-电影\n||-a.mkv".as_bytes()).unwrap();
        assert!(text.contains("电影"));
    }

    #[test]
    fn test_utf8_with_bom() {
        let mut data = vec![0xEF, 0xBB, 0xBF];
        data.extend_from_slice("|-root".as_bytes());
        let text = decode_index_blob(&data).unwrap();
        assert!(text.contains("|-root"));
    }

    #[test]
    fn test_gbk_fallback() {
        // "电影" in GBK
        let data = [0x7C, 0x2D, 0xB5, 0xE7, 0xD3, 0xB0];
        let text = decode_index_blob(&data).unwrap();
        assert_eq!(text, "|-电影");
    }

    #[test]
    fn test_utf16le_bom() {
        let mut data = vec![0xFF, 0xFE];
        for unit in "|-a".encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_index_blob(&data).unwrap(), "|-a");
    }
}
