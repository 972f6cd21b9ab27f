use byteorder::{BigEndian, WriteBytesExt};
use std::convert::TryFrom;
use std::io::{Error, ErrorKind, Result};

/// Utility trait for serializing data inside class files
///
/// Java class files have some peculiarities that make it useful to define an extra trait (instead
/// of just using `serde`):
///
///   - tags are always `u8`
///   - when serializing a sequence, the length of the sequence is usually `u16`
///
pub trait Serialize: Sized {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;

    /// Serialize into a fresh buffer
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        self.serialize(&mut buffer)?;
        Ok(buffer)
    }
}

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(*self)
    }
}

impl Serialize for u16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(*self)
    }
}

impl Serialize for u32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(*self)
    }
}

impl Serialize for u64 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(*self)
    }
}

impl Serialize for i8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i8(*self)
    }
}

impl Serialize for i16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i16::<BigEndian>(*self)
    }
}

impl Serialize for i32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(*self)
    }
}

impl Serialize for i64 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i64::<BigEndian>(*self)
    }
}

/// Length prefix of a sequence, which must fit in a `u16`
pub(crate) fn u16_length(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| {
        let msg = format!("Length {} does not fit in a u16 prefix", len);
        Error::new(ErrorKind::InvalidData, msg)
    })
}

/// Size in `u16` is the first thing serialized
impl<A: Serialize> Serialize for Vec<A> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        u16_length(self.len())?.serialize(writer)?;
        for elem in self {
            elem.serialize(writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn big_endian_with_length_prefix() {
        let values: Vec<u16> = vec![0x0102, 0xA0B0];
        assert_eq!(values.to_bytes().unwrap(), vec![0, 2, 0x01, 0x02, 0xA0, 0xB0]);
        assert_eq!((-2i32).to_bytes().unwrap(), vec![0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn oversized_sequences_are_rejected() {
        let values: Vec<u8> = vec![0; u16::MAX as usize + 1];
        let err = values.to_bytes().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let values: Vec<u8> = vec![0; u16::MAX as usize];
        assert_eq!(values.to_bytes().unwrap().len(), 2 + u16::MAX as usize);
    }
}
