//! The serde half of the canonical encoding: a single-pass serializer that
//! drives any `Serialize` type into a [`Writer`].

use serde::{
    ser::{
        self, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant,
        SerializeTuple, SerializeTupleStruct, SerializeTupleVariant,
    },
    Serialize,
};

/// Byte sink for the serializer. Implemented by `Vec<u8>` and by the
/// hashing writers in the parent module.
pub trait Writer {
    fn write(&mut self, bytes: &[u8]);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The value contains a type the canonical format has no rendering for
    /// (floats, maps, enums, options). Wire messages tag themselves at the
    /// message layer instead of relying on serde enum representations.
    #[error("type has no canonical encoding: {0}")]
    NotRepresentable(&'static str),
    /// A sequence longer than the 32-bit count prefix can express.
    #[error("sequence length exceeds u32")]
    LengthOverflow,
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for EncodeError {
    fn custom<T>(msg: T) -> Self
    where
        T: core::fmt::Display,
    {
        EncodeError::Custom(msg.to_string())
    }
}

type Result<T> = core::result::Result<T, EncodeError>;

pub struct Serializer<'a, W: Writer> {
    writer: &'a mut W,
}

pub fn to_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize,
    W: Writer,
{
    value.serialize(&mut Serializer { writer })
}

impl<'a, 'b, W: Writer> ser::Serializer for &'a mut Serializer<'b, W> {
    type Ok = ();
    type Error = EncodeError;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.writer.write(&[v as u8]);
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.writer.write(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.writer.write(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.writer.write(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.writer.write(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u128(self, v: u128) -> Result<()> {
        self.writer.write(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> Result<()> {
        Err(EncodeError::NotRepresentable("i8"))
    }

    fn serialize_i16(self, _: i16) -> Result<()> {
        Err(EncodeError::NotRepresentable("i16"))
    }

    fn serialize_i32(self, _: i32) -> Result<()> {
        Err(EncodeError::NotRepresentable("i32"))
    }

    fn serialize_i64(self, _: i64) -> Result<()> {
        Err(EncodeError::NotRepresentable("i64"))
    }

    fn serialize_i128(self, _: i128) -> Result<()> {
        Err(EncodeError::NotRepresentable("i128"))
    }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(EncodeError::NotRepresentable("f32"))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(EncodeError::NotRepresentable("f64"))
    }

    fn serialize_char(self, _: char) -> Result<()> {
        Err(EncodeError::NotRepresentable("char"))
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        let len = u32::try_from(v.len()).map_err(|_| EncodeError::LengthOverflow)?;
        self.writer.write(&len.to_be_bytes());
        self.writer.write(v.as_bytes());
        Ok(())
    }

    /// Raw bytes, no prefix. Only the fixed-size byte newtypes
    /// (`Address`, `Hash`, `Signature`, `U256`) use this.
    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.writer.write(v);
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        Err(EncodeError::NotRepresentable("none"))
    }

    fn serialize_some<T: ?Sized>(self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(EncodeError::NotRepresentable("some"))
    }

    fn serialize_unit(self) -> Result<()> {
        Err(EncodeError::NotRepresentable("unit"))
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<()> {
        Err(EncodeError::NotRepresentable("unit struct"))
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<()> {
        Err(EncodeError::NotRepresentable("unit variant"))
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<()>
    where
        T: Serialize,
    {
        Err(EncodeError::NotRepresentable("newtype variant"))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        let len = len.ok_or(EncodeError::NotRepresentable("unsized sequence"))?;
        let len = u32::try_from(len).map_err(|_| EncodeError::LengthOverflow)?;
        self.writer.write(&len.to_be_bytes());
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeTupleStruct> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(EncodeError::NotRepresentable("tuple variant"))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Err(EncodeError::NotRepresentable("map"))
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(EncodeError::NotRepresentable("struct variant"))
    }
}

impl<'a, 'b, W: Writer> SerializeSeq for &'a mut Serializer<'b, W> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W: Writer> SerializeTuple for &'a mut Serializer<'b, W> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W: Writer> SerializeTupleStruct for &'a mut Serializer<'b, W> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W: Writer> SerializeTupleVariant for &'a mut Serializer<'b, W> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: ?Sized>(&mut self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(EncodeError::NotRepresentable("tuple variant"))
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W: Writer> SerializeMap for &'a mut Serializer<'b, W> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_key<T: ?Sized>(&mut self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(EncodeError::NotRepresentable("map"))
    }

    fn serialize_value<T: ?Sized>(&mut self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(EncodeError::NotRepresentable("map"))
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W: Writer> SerializeStruct for &'a mut Serializer<'b, W> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: ?Sized>(&mut self, _: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W: Writer> SerializeStructVariant for &'a mut Serializer<'b, W> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: ?Sized>(&mut self, _: &'static str, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(EncodeError::NotRepresentable("struct variant"))
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}
