use serde::ser;

use crate::error::{Error, Result};
use super::encoder::Encoder;
use super::string::StringSerializer;

/// A dictionary is encoded as `d<contents>e`. Keys must be byte strings in
/// lexicographical order, so entries are buffered and sorted before any
/// bytes are written, making every encoded dictionary canonical regardless
/// of the field order a struct was declared in.
pub struct SerializeMap<'a> {
    serializer: &'a mut Encoder,
    items: Vec<(Vec<u8>, Vec<u8>)>,
    current_key: Option<Vec<u8>>,
}

impl<'a> SerializeMap<'a> {
    pub fn new(serializer: &'a mut Encoder, size: usize) -> Self {
        Self { serializer, items: Vec::with_capacity(size), current_key: None }
    }

    fn finish(&mut self) -> Result<()> {
        if self.current_key.is_some() {
            return Err(Error::MapSerializationOrder(
                "attempted to end map serialization while holding a key".to_string(),
            ));
        }
        let mut items = std::mem::take(&mut self.items);
        items.sort_by(|(a, _), (b, _)| a.cmp(b));

        self.serializer.push("d");
        for (k, v) in items {
            ser::Serializer::serialize_bytes(&mut *self.serializer, &k)?;
            self.serializer.push(v);
        }
        self.serializer.push("e");
        Ok(())
    }
}

impl<'a> ser::SerializeMap for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, key: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        match self.current_key {
            Some(_) => Err(Error::MapSerializationOrder(
                "consecutive calls to serialize_key without serialize_value".to_string(),
            )),
            None => {
                self.current_key = Some(StringSerializer::key(key)?);
                Ok(())
            }
        }
    }

    fn serialize_value<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        let key = self.current_key.take().ok_or_else(|| {
            Error::MapSerializationOrder(
                "consecutive calls to serialize_value without serialize_key".to_string(),
            )
        })?;

        let mut ser = Encoder::new();
        value.serialize(&mut ser)?;
        let value = ser.into_buf();

        if !value.is_empty() {
            self.items.push((key, value));
        }
        Ok(())
    }

    fn serialize_entry<K: ?Sized, V: ?Sized>(&mut self, key: &K, value: &V) -> Result<()>
    where
        K: serde::Serialize,
        V: serde::Serialize,
    {
        if self.current_key.is_some() {
            return Err(Error::MapSerializationOrder(
                "attempted to serialize an entry while holding a key".to_string(),
            ));
        }

        let key = StringSerializer::key(key)?;

        let mut val_ser = Encoder::new();
        value.serialize(&mut val_ser)?;
        let value = val_ser.into_buf();

        if !value.is_empty() {
            self.items.push((key, value));
        }
        Ok(())
    }

    fn end(mut self) -> Result<Self::Ok> {
        self.finish()
    }
}

impl<'a> ser::SerializeStruct for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        ser::SerializeMap::serialize_entry(self, key, value)
    }

    fn end(mut self) -> Result<Self::Ok> {
        self.finish()
    }
}

impl<'a> ser::SerializeStructVariant for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()>
    where
        T: serde::Serialize,
    {
        ser::SerializeMap::serialize_entry(self, key, value)
    }

    fn end(mut self) -> Result<Self::Ok> {
        // `serialize_struct_variant` already opened the outer `d<variant>`;
        // `finish` closes the inner field dict, leaving the outer `e` here.
        self.finish()?;
        self.serializer.push("e");
        Ok(())
    }
}
