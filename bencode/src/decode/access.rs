use serde::{de, Deserializer};

use crate::error::{Error, Result};
use super::decoder::Decoder;
use super::DecodedType;

pub struct Access<'a, 'de> {
    d: &'a mut Decoder<'de>,
    length: Option<usize>,
    last_key: Option<Vec<u8>>,
}

impl<'a, 'de> Access<'a, 'de> {
    pub fn new(d: &'a mut Decoder<'de>, length: Option<usize>) -> Self {
        Self { d, length, last_key: None }
    }
}

impl<'de, 'a> de::SeqAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: de::DeserializeSeed<'de>,
    {
        let out: Result<Option<T::Value>> = match self.d.read_next()? {
            DecodedType::EOF => {
                self.d.leave_container();
                Ok(None)
            }
            x => {
                self.d.next_token = Some(x);
                Ok(Some(seed.deserialize(&mut *self.d)?))
            }
        };

        if let Some(l) = self.length {
            let l = l - 1;
            self.length = Some(l);
            if l == 0 {
                if self.d.read_next()? != DecodedType::EOF {
                    return Err(Error::InvalidType("expected end of tuple".to_string()));
                }
                self.d.leave_container();
            }
        }
        out
    }
}

impl<'de, 'a> de::MapAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: de::DeserializeSeed<'de>,
    {
        match self.d.read_next()? {
            DecodedType::EOF => {
                self.d.leave_container();
                Ok(None)
            }
            DecodedType::ByteString(key) => {
                if let Some(prev) = &self.last_key {
                    if key == *prev {
                        return Err(Error::DuplicateKey(key));
                    }
                    if key < *prev && !self.d.tolerant() {
                        return Err(Error::UnsortedKeys(key, prev.clone()));
                    }
                }
                self.last_key = Some(key.clone());
                self.d.next_token = Some(DecodedType::ByteString(key));
                Ok(Some(seed.deserialize(&mut *self.d)?))
            }
            other => Err(Error::InvalidToken {
                expected: "a byte string dictionary key".to_string(),
                found: format!("{other:?}"),
            }),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: de::DeserializeSeed<'de>,
    {
        seed.deserialize(&mut *self.d)
    }
}

impl<'de, 'a> de::VariantAccess<'de> for Access<'a, 'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
    where
        T: de::DeserializeSeed<'de>,
    {
        let out = seed.deserialize(&mut *self.d)?;
        match self.d.read_next()? {
            DecodedType::EOF => {
                self.d.leave_container();
                Ok(out)
            }
            e => Err(Error::InvalidToken { expected: "end of dictionary".to_string(), found: format!("{e:?}") }),
        }
    }

    fn tuple_variant<V>(self, len: usize, visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        let out = match self.d.read_next()? {
            DecodedType::List => {
                self.d.enter_container()?;
                visitor.visit_seq(Access::new(self.d, Some(len)))?
            }
            e => return Err(Error::InvalidToken { expected: "a list".to_string(), found: format!("{e:?}") }),
        };
        match self.d.read_next()? {
            DecodedType::EOF => {
                self.d.leave_container();
                Ok(out)
            }
            e => Err(Error::InvalidToken { expected: "end of dictionary".to_string(), found: format!("{e:?}") }),
        }
    }

    fn struct_variant<V>(self, _fields: &'static [&'static str], visitor: V) -> Result<V::Value>
    where
        V: de::Visitor<'de>,
    {
        let out = Deserializer::deserialize_any(&mut *self.d, visitor)?;
        match self.d.read_next()? {
            DecodedType::EOF => {
                self.d.leave_container();
                Ok(out)
            }
            e => Err(Error::InvalidToken { expected: "end of dictionary".to_string(), found: format!("{e:?}") }),
        }
    }
}

impl<'de, 'a> de::EnumAccess<'de> for Access<'a, 'de> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant)>
    where
        V: de::DeserializeSeed<'de>,
    {
        match self.d.read_next()? {
            b @ DecodedType::ByteString(_) => {
                self.d.next_token = Some(b);
                Ok((seed.deserialize(&mut *self.d)?, self))
            }
            DecodedType::Dictionary => {
                self.d.enter_container()?;
                Ok((seed.deserialize(&mut *self.d)?, self))
            }
            e => Err(Error::InvalidToken { expected: "a byte string or dictionary".to_string(), found: format!("{e:?}") }),
        }
    }
}
