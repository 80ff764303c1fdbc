use std::ops::Range;

use crate::error::{Error, Result};

/// Locates the exact byte range of `key`'s value inside the top-level
/// dictionary encoded in `buf`, without going through serde.
///
/// This exists for one reason: computing a `.torrent`'s info-hash requires
/// hashing the *original* bytes of the `info` dictionary, unknown fields
/// included. Deserializing into a typed `Info` struct and re-encoding it
/// would silently drop anything the struct doesn't model and produce a
/// different hash than every other client computes.
pub fn dict_entry_span(buf: &[u8], key: &[u8]) -> Result<Range<usize>> {
    if buf.first() != Some(&b'd') {
        return Err(Error::InvalidToken {
            expected: "a top-level dictionary".to_string(),
            found: "something else".to_string(),
        });
    }

    let mut pos = 1;
    loop {
        if buf.get(pos) == Some(&b'e') {
            return Err(Error::KeyNotFound(key.to_vec()));
        }
        let (this_key, after_key) = read_byte_string(buf, pos)?;
        let value_start = after_key;
        let value_end = skip_value(buf, value_start)?;

        if this_key == key {
            return Ok(value_start..value_end);
        }
        pos = value_end;
    }
}

/// Reads a length-prefixed byte string starting at `pos`, returning the
/// string and the position just after it.
fn read_byte_string(buf: &[u8], pos: usize) -> Result<(&[u8], usize)> {
    let colon = buf[pos..]
        .iter()
        .position(|&b| b == b':')
        .ok_or(Error::EOF)?
        + pos;
    let len: usize = std::str::from_utf8(&buf[pos..colon])
        .map_err(|e| Error::Custom(format!("length prefix is not utf-8: {e}")))?
        .parse()
        .map_err(|_| Error::Custom("invalid byte string length prefix".to_string()))?;
    let start = colon + 1;
    let end = start.checked_add(len).ok_or(Error::EOF)?;
    if end > buf.len() {
        return Err(Error::EOF);
    }
    Ok((&buf[start..end], end))
}

/// Advances past one complete bencoded value starting at `pos`, returning
/// the position immediately after it.
fn skip_value(buf: &[u8], pos: usize) -> Result<usize> {
    match *buf.get(pos).ok_or(Error::EOF)? {
        b'i' => {
            let e = buf[pos..].iter().position(|&b| b == b'e').ok_or(Error::EOF)? + pos;
            Ok(e + 1)
        }
        b'0'..=b'9' => {
            let (_, end) = read_byte_string(buf, pos)?;
            Ok(end)
        }
        b'l' => {
            let mut cur = pos + 1;
            while buf.get(cur) != Some(&b'e') {
                cur = skip_value(buf, cur)?;
            }
            Ok(cur + 1)
        }
        b'd' => {
            let mut cur = pos + 1;
            while buf.get(cur) != Some(&b'e') {
                let (_, after_key) = read_byte_string(buf, cur)?;
                cur = skip_value(buf, after_key)?;
            }
            Ok(cur + 1)
        }
        other => Err(Error::InvalidToken {
            expected: "a bencode value".to_string(),
            found: (other as char).to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_top_level_key_span() {
        let buf = b"d4:infod6:lengthi10e4:name3:fooe8:announce3:urle";
        let span = dict_entry_span(buf, b"info").unwrap();
        assert_eq!(&buf[span], &b"d6:lengthi10e4:name3:fooe"[..]);
    }

    #[test]
    fn missing_key_errors() {
        let buf = b"d8:announce3:urle";
        assert!(matches!(dict_entry_span(buf, b"info"), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn preserves_unknown_fields_byte_for_byte() {
        let buf = b"d4:infod6:lengthi10e4:name3:foo11:x-unknown-keyi1eee";
        let span = dict_entry_span(buf, b"info").unwrap();
        assert_eq!(&buf[span], &b"d6:lengthi10e4:name3:foo11:x-unknown-keyi1ee"[..]);
    }
}
