use byteorder::WriteBytesExt;
use std::io::Result;

/// Utility trait for serializing pieces of a code object
///
/// Everything in the instruction stream and the position table is written a byte at a time (there
/// is no multi-byte integer anywhere: wide operands are split across prefix instructions), so
/// this is much simpler than a general purpose serialization framework.
pub trait Serialize {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;

    /// Serialize into a fresh buffer
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)
            .expect("writing into a `Vec<u8>` cannot fail");
        bytes
    }
}

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(*self)
    }
}

impl Serialize for i8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i8(*self)
    }
}

/// Sequences are written back to back, without any length prefix
impl<A: Serialize> Serialize for [A] {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        for elem in self {
            elem.serialize(writer)?;
        }
        Ok(())
    }
}

impl<A: Serialize> Serialize for Vec<A> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.as_slice().serialize(writer)
    }
}
