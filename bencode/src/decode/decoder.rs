use serde::{de, de::Deserializer, forward_to_deserialize_any};

use crate::error::{Error, Result};
use super::access::Access;
use super::{DecodedType, DecoderConfig};

/// A bencode pull parser over an in-memory buffer.
///
/// `.torrent` files, tracker responses and resume files are all small
/// enough to load wholesale, so the decoder works over a borrowed slice
/// rather than a generic `Read` — this lets it hand out the byte range of
/// any value it parses (see [`crate::dict_entry_span`]), which is what
/// makes info-hash computation possible without re-encoding.
pub struct Decoder<'de> {
    buf: &'de [u8],
    pos: usize,
    depth: usize,
    config: DecoderConfig,
    pub(super) next_token: Option<DecodedType>,
}

impl<'de> Decoder<'de> {
    pub fn new(buf: &'de [u8], config: DecoderConfig) -> Self {
        Self { buf, pos: 0, depth: 0, config, next_token: None }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub(super) fn enter_container(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > self.config.max_depth {
            return Err(Error::NestingTooDeep(self.config.max_depth));
        }
        Ok(())
    }

    pub(super) fn leave_container(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub(super) fn tolerant(&self) -> bool {
        self.config.tolerant
    }

    fn next_byte(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or(Error::EOF)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_next(&mut self) -> Result<DecodedType> {
        if let Some(next) = self.next_token.take() {
            return Ok(next);
        }

        match self.next_byte()? {
            b'i' => Ok(DecodedType::Integer(self.read_i64()?)),
            n @ b'0'..=b'9' => Ok(DecodedType::ByteString(self.read_bytes(n)?)),
            b'l' => Ok(DecodedType::List),
            b'd' => Ok(DecodedType::Dictionary),
            b'e' => Ok(DecodedType::EOF),
            e => Err(Error::InvalidToken {
                expected: "one of 'i', '0'..'9', 'l', 'd', 'e'".to_string(),
                found: (e as char).to_string(),
            }),
        }
    }

    fn read_i64(&mut self) -> Result<i64> {
        let start = self.pos;
        loop {
            match self.next_byte()? {
                b'e' => break,
                b'0'..=b'9' | b'-' => continue,
                other => {
                    return Err(Error::InvalidToken {
                        expected: "an ASCII digit or 'e'".to_string(),
                        found: (other as char).to_string(),
                    })
                }
            }
        }
        let digits = &self.buf[start..self.pos - 1];
        let s = std::str::from_utf8(digits)
            .map_err(|e| Error::Custom(format!("integer is not utf-8: {e}")))?;
        s.parse()
            .map_err(|_| Error::Custom(format!("cannot parse {s:?} as i64")))
    }

    fn read_usize(&mut self, first: u8) -> Result<usize> {
        let start = self.pos - 1;
        loop {
            match self.next_byte()? {
                b':' => break,
                b'0'..=b'9' => continue,
                other => {
                    return Err(Error::InvalidToken {
                        expected: "an ASCII digit or ':'".to_string(),
                        found: (other as char).to_string(),
                    })
                }
            }
        }
        let _ = first;
        let digits = &self.buf[start..self.pos - 1];
        let s = std::str::from_utf8(digits)
            .map_err(|e| Error::Custom(format!("length prefix is not utf-8: {e}")))?;
        s.parse()
            .map_err(|_| Error::Custom(format!("cannot parse {s:?} as a length")))
    }

    fn read_bytes(&mut self, first: u8) -> Result<Vec<u8>> {
        let length = self.read_usize(first)?;
        let end = self.pos.checked_add(length).ok_or(Error::EOF)?;
        let bytes = self.buf.get(self.pos..end).ok_or(Error::EOF)?.to_vec();
        self.pos = end;
        Ok(bytes)
    }
}

impl<'de, 'a> Deserializer<'de> for &'a mut Decoder<'de> {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: serde::de::Visitor<'de>,
    {
        match self.read_next()? {
            DecodedType::Integer(i) => visitor.visit_i64(i),
            DecodedType::ByteString(s) => visitor.visit_byte_buf(s),
            DecodedType::List => {
                self.enter_container()?;
                let v = visitor.visit_seq(Access::new(self, None))?;
                Ok(v)
            }
            DecodedType::Dictionary => {
                self.enter_container()?;
                let v = visitor.visit_map(Access::new(self, None))?;
                Ok(v)
            }
            DecodedType::EOF => Err(Error::EOF),
        }
    }

    forward_to_deserialize_any! {
        bool char
        i8 i16 i32 i64
        u8 u16 u32 u64
        f32 f64
        unit bytes byte_buf
        seq map unit_struct tuple_struct
        ignored_any struct
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(Access::new(self, None))
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        let b = self.read_next().and_then(|x| match x {
            DecodedType::ByteString(a) => Ok(a),
            other => Err(Error::InvalidToken {
                expected: "a byte string".to_string(),
                found: format!("{other:?}"),
            }),
        })?;

        let s = std::str::from_utf8(&b)
            .map_err(|e| Error::Custom(format!("expected utf-8 string: {e}")))?;
        visitor.visit_str(s)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_tuple<V>(self, len: usize, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        self.read_next().and_then(|x| match x {
            DecodedType::List => Ok(()),
            other => Err(Error::InvalidToken {
                expected: "a list".to_string(),
                found: format!("{other:?}"),
            }),
        })?;
        self.enter_container()?;
        visitor.visit_seq(Access::new(self, Some(len)))
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }
}
