//! Record encoding used by run and input files.

use std::fmt;
use std::io::{self, prelude::*};
use std::marker::PhantomData;

/// Record codec interface. Provides methods for writing a record to a byte stream and reading it back.
pub trait RecordCodec<T>: Default + Clone + Send + Sync {
    /// Encoded record size in bytes if every record has the same size.
    const RECORD_SIZE: Option<usize>;

    /// Encodes a single record.
    fn encode<W: Write>(&self, writer: &mut W, item: &T) -> io::Result<()>;

    /// Decodes a single record.
    fn decode<R: Read>(&self, reader: &mut R) -> io::Result<T>;
}

/// Fixed-width record that is stored as raw little-endian bytes.
pub trait FixedWidth: Sized {
    const WIDTH: usize;

    fn write_le<W: Write>(&self, writer: &mut W) -> io::Result<()>;

    fn read_le<R: Read>(reader: &mut R) -> io::Result<Self>;
}

macro_rules! impl_fixed_width {
    ($($ty:ty),*) => {
        $(
            impl FixedWidth for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn write_le<W: Write>(&self, writer: &mut W) -> io::Result<()> {
                    writer.write_all(&self.to_le_bytes())
                }

                fn read_le<R: Read>(reader: &mut R) -> io::Result<Self> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    reader.read_exact(&mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }
            }
        )*
    };
}

impl_fixed_width!(i32, u32, i64, u64);

/// Fixed-width binary codec. Every record occupies exactly [`FixedWidth::WIDTH`] bytes on disk.
pub struct FixedCodec<T> {
    item_type: PhantomData<fn() -> T>,
}

impl<T> Default for FixedCodec<T> {
    fn default() -> Self {
        FixedCodec { item_type: PhantomData }
    }
}

impl<T> Clone for FixedCodec<T> {
    fn clone(&self) -> Self {
        FixedCodec::default()
    }
}

impl<T> fmt::Debug for FixedCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FixedCodec")
    }
}

impl<T: FixedWidth> RecordCodec<T> for FixedCodec<T> {
    const RECORD_SIZE: Option<usize> = Some(T::WIDTH);

    fn encode<W: Write>(&self, writer: &mut W, item: &T) -> io::Result<()> {
        item.write_le(writer)
    }

    fn decode<R: Read>(&self, reader: &mut R) -> io::Result<T> {
        T::read_le(reader)
    }
}

/// RMP (Rust MessagePack) codec.
/// It uses MessagePack as a data serialization format so any `serde` type can be sorted.
/// Encoded sizes vary, so the record size used for memory budgeting has to be set explicitly.
/// For more information see https://msgpack.org/.
pub struct RmpCodec<T> {
    item_type: PhantomData<fn() -> T>,
}

impl<T> Default for RmpCodec<T> {
    fn default() -> Self {
        RmpCodec { item_type: PhantomData }
    }
}

impl<T> Clone for RmpCodec<T> {
    fn clone(&self) -> Self {
        RmpCodec::default()
    }
}

impl<T> fmt::Debug for RmpCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RmpCodec")
    }
}

impl<T> RecordCodec<T> for RmpCodec<T>
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
{
    const RECORD_SIZE: Option<usize> = None;

    fn encode<W: Write>(&self, writer: &mut W, item: &T) -> io::Result<()> {
        rmp_serde::encode::write(writer, item).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    fn decode<R: Read>(&self, reader: &mut R) -> io::Result<T> {
        rmp_serde::decode::from_read(reader).map_err(|err| match err {
            rmp_serde::decode::Error::InvalidMarkerRead(err) | rmp_serde::decode::Error::InvalidDataRead(err) => err,
            err => io::Error::new(io::ErrorKind::InvalidData, err),
        })
    }
}
