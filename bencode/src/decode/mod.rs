use serde::de;

use crate::error::Result;

mod access;
mod decoder;
#[cfg(test)]
mod test;

pub use decoder::Decoder;

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum DecodedType {
    Integer(i64),
    ByteString(Vec<u8>),
    List,
    Dictionary,
    EOF,
}

/// Decoder construction knobs. `max_depth` bounds list/dict nesting (a
/// cheap defense against adversarial input); `tolerant` downgrades
/// out-of-order dictionary keys from a hard error to acceptance, for
/// reading manifests produced by implementations that don't sort keys.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub max_depth: usize,
    pub tolerant: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { max_depth: crate::DEFAULT_MAX_DEPTH, tolerant: false }
    }
}

pub fn decode_bytes<'de, T>(b: &'de [u8]) -> Result<T>
where
    T: de::Deserialize<'de>,
{
    decode_bytes_with_config(b, DecoderConfig::default())
}

pub fn decode_bytes_with_config<'de, T>(b: &'de [u8], config: DecoderConfig) -> Result<T>
where
    T: de::Deserialize<'de>,
{
    de::Deserialize::deserialize(&mut Decoder::new(b, config))
}

pub fn decode_str<'de, T>(s: &'de str) -> Result<T>
where
    T: de::Deserialize<'de>,
{
    decode_bytes(s.as_bytes())
}
