use serde::{ser, Serialize};

use crate::error::{Error, Result};

/// Serializes a map/struct key to its raw bytes. Bencode dictionary keys
/// must be byte strings, so this rejects anything that isn't a string,
/// bytes, or a thin wrapper around one of those.
pub struct StringSerializer;

impl StringSerializer {
    pub fn key<T: Serialize + ?Sized>(key: &T) -> Result<Vec<u8>> {
        key.serialize(&mut StringSerializer)
    }
}

macro_rules! not_a_key {
    ($method:ident, $ty:ty) => {
        fn $method(self, _v: $ty) -> Result<Vec<u8>> {
            Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
        }
    };
}

impl ser::Serializer for &mut StringSerializer {
    type Ok = Vec<u8>;
    type Error = Error;

    type SerializeSeq = ser::Impossible<Vec<u8>, Error>;
    type SerializeTuple = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant = ser::Impossible<Vec<u8>, Error>;
    type SerializeMap = ser::Impossible<Vec<u8>, Error>;
    type SerializeStruct = ser::Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = ser::Impossible<Vec<u8>, Error>;

    fn serialize_str(self, v: &str) -> Result<Vec<u8>> {
        Ok(v.as_bytes().to_vec())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>> {
        Ok(v.to_vec())
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        value.serialize(self)
    }

    not_a_key!(serialize_bool, bool);
    not_a_key!(serialize_i8, i8);
    not_a_key!(serialize_i16, i16);
    not_a_key!(serialize_i32, i32);
    not_a_key!(serialize_i64, i64);
    not_a_key!(serialize_u8, u8);
    not_a_key!(serialize_u16, u16);
    not_a_key!(serialize_u32, u32);
    not_a_key!(serialize_u64, u64);
    not_a_key!(serialize_f32, f32);
    not_a_key!(serialize_f64, f64);
    not_a_key!(serialize_char, char);

    fn serialize_none(self) -> Result<Vec<u8>> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_some<T: ?Sized>(self, _value: &T) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_unit(self) -> Result<Vec<u8>> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Vec<u8>> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Vec<u8>> {
        Ok(variant.as_bytes().to_vec())
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }
}
