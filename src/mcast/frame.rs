//! Discovery frame codec. All integers big-endian.
//!
//! ```text
//! u32              message code
//! u16              hostname length in UTF-16 code units
//! u16[len]         hostname
//! u8               ssl enabled (0 or 1)
//! u32              tcp port
//! ```
//! A request is the bare 4-byte code.

use thiserror::Error;

use crate::mcast::ResponderAdvert;

pub const REQUEST_LEN: usize = 4;
/// Generous receive-buffer size for a response frame.
pub const MAX_FRAME_LEN: usize = 2048;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unexpected message code: expected {expected}, got {got}")]
    CodeMismatch { expected: u32, got: u32 },
    #[error("hostname too long: {units} utf-16 units")]
    NameTooLong { units: usize },
    #[error("hostname is not valid utf-16")]
    BadUtf16,
    #[error("port {port} out of range")]
    BadPort { port: u32 },
}

pub fn encode_request(code: u32) -> [u8; REQUEST_LEN] {
    code.to_be_bytes()
}

/// Leading message code of a datagram, if it has one.
pub fn peek_code(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

pub fn encode_response(code: u32, advert: &ResponderAdvert) -> Result<Vec<u8>, FrameError> {
    let units: Vec<u16> = advert.hostname.encode_utf16().collect();
    if units.len() > u16::MAX as usize {
        return Err(FrameError::NameTooLong { units: units.len() });
    }

    let mut buf = Vec::with_capacity(4 + 2 + units.len() * 2 + 1 + 4);
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(units.len() as u16).to_be_bytes());
    for unit in units {
        buf.extend_from_slice(&unit.to_be_bytes());
    }
    buf.push(u8::from(advert.ssl));
    buf.extend_from_slice(&u32::from(advert.port).to_be_bytes());
    Ok(buf)
}

pub fn decode_response(buf: &[u8], expected_code: u32) -> Result<ResponderAdvert, FrameError> {
    let got = peek_code(buf).ok_or(FrameError::Truncated {
        need: 4,
        got: buf.len(),
    })?;
    if got != expected_code {
        return Err(FrameError::CodeMismatch {
            expected: expected_code,
            got,
        });
    }

    let len_bytes: [u8; 2] = buf
        .get(4..6)
        .and_then(|s| s.try_into().ok())
        .ok_or(FrameError::Truncated {
            need: 6,
            got: buf.len(),
        })?;
    let units = u16::from_be_bytes(len_bytes) as usize;
    let need = 6 + units * 2 + 1 + 4;
    if buf.len() < need {
        return Err(FrameError::Truncated {
            need,
            got: buf.len(),
        });
    }

    let mut name = Vec::with_capacity(units);
    for i in 0..units {
        let offset = 6 + i * 2;
        name.push(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
    }
    let hostname = String::from_utf16(&name).map_err(|_| FrameError::BadUtf16)?;

    let ssl = buf[6 + units * 2] != 0;
    let port_offset = 6 + units * 2 + 1;
    let port = u32::from_be_bytes([
        buf[port_offset],
        buf[port_offset + 1],
        buf[port_offset + 2],
        buf[port_offset + 3],
    ]);
    let port = u16::try_from(port).map_err(|_| FrameError::BadPort { port })?;

    Ok(ResponderAdvert {
        hostname,
        port,
        ssl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(hostname: &str) -> ResponderAdvert {
        ResponderAdvert {
            hostname: hostname.to_string(),
            port: 7075,
            ssl: false,
        }
    }

    #[test]
    fn response_roundtrip() {
        let advert = ResponderAdvert {
            hostname: "replica-1.example".to_string(),
            port: 7080,
            ssl: true,
        };
        let buf = encode_response(235, &advert).unwrap();
        assert_eq!(peek_code(&buf), Some(235));
        assert_eq!(decode_response(&buf, 235).unwrap(), advert);
    }

    #[test]
    fn response_roundtrip_non_ascii_hostname() {
        let advert = advert("journal-höst-\u{1F5C4}");
        let buf = encode_response(1, &advert).unwrap();
        assert_eq!(decode_response(&buf, 1).unwrap(), advert);
    }

    #[test]
    fn wrong_code_is_rejected() {
        let buf = encode_response(235, &advert("a")).unwrap();
        assert_eq!(
            decode_response(&buf, 120),
            Err(FrameError::CodeMismatch {
                expected: 120,
                got: 235
            })
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let buf = encode_response(235, &advert("somehost")).unwrap();
        assert!(matches!(
            decode_response(&buf[..buf.len() - 2], 235),
            Err(FrameError::Truncated { .. })
        ));
        assert!(matches!(
            decode_response(&[1, 2], 235),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let mut buf = encode_response(235, &advert("h")).unwrap();
        let len = buf.len();
        buf[len - 4..].copy_from_slice(&100_000u32.to_be_bytes());
        assert_eq!(
            decode_response(&buf, 235),
            Err(FrameError::BadPort { port: 100_000 })
        );
    }

    #[test]
    fn request_is_bare_code() {
        assert_eq!(encode_request(230), [0, 0, 0, 230]);
        assert_eq!(peek_code(&encode_request(230)), Some(230));
    }
}
