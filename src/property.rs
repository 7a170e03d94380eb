//! Property request/response bodies carried inside control messages.
//!
//! Requests come in two shapes: a fixed get marker, and a numeric set whose
//! value is wrapped in a tagged, length-prefixed field. Responses share a
//! single outer wrapper `[0x22, varint(len), inner…]`; the inner shape
//! depends on the command that was issued.

use crate::varint::{self, Cursor};
use crate::{Error, Result};

const TAG_GET_REQUEST: u8 = 0x18;
const TAG_SET_REQUEST: u8 = 0x1a;
const TAG_STATUS: u8 = 0x08;
const TAG_NUMERIC: u8 = 0x10;
const TAG_STRING: u8 = 0x12;
const TAG_RESPONSE: u8 = 0x22;

/// Body of a get-property request.
pub fn get_request() -> [u8; 2] {
    [TAG_GET_REQUEST, 0x00]
}

/// Body of a set-property request carrying one non-negative number.
pub fn set_numeric_request(value: i32) -> Result<Vec<u8>> {
    if value < 0 {
        return Err(Error::InvalidArgument(format!(
            "property value must be non-negative, got {value}"
        )));
    }
    let encoded = varint::encode(value as u64);
    let mut out = Vec::with_capacity(3 + encoded.len());
    out.push(TAG_SET_REQUEST);
    out.extend_from_slice(&varint::encode(1 + encoded.len() as u64));
    out.push(TAG_STATUS);
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// Strip the outer `[0x22, varint(len), …]` wrapper and return the inner body.
fn open_response<'a>(body: &'a [u8]) -> Result<&'a [u8]> {
    let mut cur = Cursor::new(body);
    let tag = cur.read_u8()?;
    if tag != TAG_RESPONSE {
        return Err(Error::protocol(format!(
            "unexpected response tag 0x{tag:02x}"
        )));
    }
    let len = cur.decode32()?;
    let inner = cur.read_bytes(len as usize)?;
    if !cur.at_end() {
        return Err(Error::protocol(format!(
            "{} trailing bytes after response body",
            cur.remaining()
        )));
    }
    Ok(inner)
}

/// Parse the acknowledgement of a set command.
///
/// An empty inner body is success. A `[0x08, varint(status)]` body reports
/// the device's status word: non-zero surfaces as [`Error::CommandRejected`],
/// an explicit zero is accepted as success.
pub fn parse_empty_response(body: &[u8]) -> Result<()> {
    let inner = open_response(body)?;
    if inner.is_empty() {
        return Ok(());
    }
    let mut cur = Cursor::new(inner);
    let tag = cur.read_u8()?;
    if tag != TAG_STATUS {
        return Err(Error::protocol(format!(
            "unexpected tag 0x{tag:02x} in acknowledgement"
        )));
    }
    let status = cur.decode32()?;
    if !cur.at_end() {
        return Err(Error::protocol("trailing bytes after status"));
    }
    if status != 0 {
        return Err(Error::CommandRejected { status });
    }
    Ok(())
}

/// Parse a numeric get-property response.
pub fn parse_numeric_response(body: &[u8]) -> Result<i32> {
    let inner = open_response(body)?;
    let mut cur = Cursor::new(inner);
    let tag = cur.read_u8()?;
    if tag != TAG_NUMERIC {
        return Err(Error::protocol(format!(
            "expected numeric tag 0x10, got 0x{tag:02x}"
        )));
    }
    let value = cur.decode32()?;
    if !cur.at_end() {
        return Err(Error::protocol("trailing bytes after numeric value"));
    }
    Ok(value)
}

/// Parse a string get-property response.
pub fn parse_string_response(body: &[u8]) -> Result<String> {
    let inner = open_response(body)?;
    let mut cur = Cursor::new(inner);
    let tag = cur.read_u8()?;
    if tag != TAG_STRING {
        return Err(Error::protocol(format!(
            "expected string tag 0x12, got 0x{tag:02x}"
        )));
    }
    let len = cur.decode32()?;
    let bytes = cur.read_bytes(len as usize)?;
    if !cur.at_end() {
        return Err(Error::protocol("trailing bytes after string value"));
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::protocol("string property is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_request_bytes() {
        assert_eq!(get_request(), [0x18, 0x00]);
    }

    #[test]
    fn set_numeric_request_bytes() {
        assert_eq!(set_numeric_request(0).unwrap(), vec![0x1a, 0x02, 0x08, 0x00]);
        assert_eq!(set_numeric_request(9).unwrap(), vec![0x1a, 0x02, 0x08, 0x09]);
        assert_eq!(
            set_numeric_request(128).unwrap(),
            vec![0x1a, 0x03, 0x08, 0x80, 0x01]
        );
    }

    #[test]
    fn set_numeric_rejects_negative() {
        assert!(matches!(
            set_numeric_request(-1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn numeric_response() {
        assert_eq!(parse_numeric_response(&[0x22, 0x02, 0x10, 0x05]).unwrap(), 5);
    }

    #[test]
    fn numeric_round_trip() {
        for v in [0i32, 1, 127, 128, 300, i32::MAX] {
            let inner = {
                let mut b = vec![0x10];
                b.extend_from_slice(&varint::encode(v as u64));
                b
            };
            let mut body = vec![0x22];
            body.extend_from_slice(&varint::encode(inner.len() as u64));
            body.extend_from_slice(&inner);
            assert_eq!(parse_numeric_response(&body).unwrap(), v);
        }
    }

    #[test]
    fn string_response() {
        let body = [
            0x22, 0x09, 0x12, 0x07, b'o', b'n', b'e', b'p', b'r', b'o', b'x',
        ];
        assert_eq!(parse_string_response(&body).unwrap(), "oneprox");
    }

    #[test]
    fn string_round_trips_utf8() {
        let s = "XREAL Oné ✓";
        let mut inner = vec![0x12];
        inner.extend_from_slice(&varint::encode(s.len() as u64));
        inner.extend_from_slice(s.as_bytes());
        let mut body = vec![0x22];
        body.extend_from_slice(&varint::encode(inner.len() as u64));
        body.extend_from_slice(&inner);
        assert_eq!(parse_string_response(&body).unwrap(), s);
    }

    #[test]
    fn empty_response_success() {
        assert!(parse_empty_response(&[0x22, 0x00]).is_ok());
    }

    #[test]
    fn empty_response_zero_status_is_success() {
        assert!(parse_empty_response(&[0x22, 0x02, 0x08, 0x00]).is_ok());
    }

    #[test]
    fn command_reject_status() {
        let err = parse_empty_response(&[0x22, 0x03, 0x08, 0x91, 0x4e]).unwrap_err();
        match err {
            Error::CommandRejected { status } => assert_eq!(status, 0x2711),
            other => panic!("expected CommandRejected, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unexpected_ack_shape() {
        assert!(matches!(
            parse_empty_response(&[0x22, 0x02, 0x10, 0x01]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(matches!(
            parse_numeric_response(&[0x22, 0x02, 0x10, 0x05, 0xff]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            parse_numeric_response(&[0x22, 0x03, 0x10, 0x05, 0xff]),
            Err(Error::Protocol(_))
        ));
    }
}
