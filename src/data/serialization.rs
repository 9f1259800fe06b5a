/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Item serialization over byte cursors.
//!
//! The data plane moves *items* of arbitrary serializable types through
//! sequences of blocks. The [`Item`] trait is the contract: items write
//! themselves to an [`ItemWriter`] and read themselves back from an
//! [`ItemReader`]; the `FIXED_SIZE` associated constant lets readers skip
//! over runs of fixed-size items without deserializing them.
//!
//! Integers are little-endian; `usize`/`isize` are serialized as 64-bit so
//! that the encoding is architecture-independent. Length prefixes use a
//! varint encoding (seven bits per byte, least-significant group first, MSB
//! as continuation bit).

use anyhow::{ensure, Result};

/// A byte-oriented output cursor items serialize themselves into.
pub trait ItemWriter {
    fn put_slice(&mut self, data: &[u8]) -> Result<()>;

    #[inline(always)]
    fn put_byte(&mut self, b: u8) -> Result<()> {
        self.put_slice(&[b])
    }

    #[inline]
    fn put_varint(&mut self, mut v: u64) -> Result<()> {
        while v >= 0x80 {
            self.put_byte((v as u8) | 0x80)?;
            v >>= 7;
        }
        self.put_byte(v as u8)
    }
}

/// A byte-oriented input cursor items deserialize themselves from.
pub trait ItemReader {
    fn read_slice(&mut self, data: &mut [u8]) -> Result<()>;

    #[inline(always)]
    fn get_byte(&mut self) -> Result<u8> {
        let mut b = [0u8];
        self.read_slice(&mut b)?;
        Ok(b[0])
    }

    #[inline]
    fn get_varint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.get_byte()?;
            ensure!(shift < 64, "varint too long");
            v |= ((b & 0x7F) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }
}

/// A serializable item.
///
/// `FIXED_SIZE` is `Some(n)` when every value of the type serializes to
/// exactly `n` bytes; readers use it for O(1) skips and batch extraction.
pub trait Item: Sized {
    const FIXED_SIZE: Option<usize>;

    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()>;

    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self>;
}

/// Sums two fixed sizes, propagating variability.
pub const fn add_fixed(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        _ => None,
    }
}

macro_rules! impl_le_item {
    ($($ty:ty),*) => {$(
        impl Item for $ty {
            const FIXED_SIZE: Option<usize> = Some(core::mem::size_of::<$ty>());

            #[inline(always)]
            fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
                writer.put_slice(&self.to_le_bytes())
            }

            #[inline(always)]
            fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
                let mut bytes = [0u8; core::mem::size_of::<$ty>()];
                reader.read_slice(&mut bytes)?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }
    )*};
}

impl_le_item!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl Item for usize {
    const FIXED_SIZE: Option<usize> = Some(8);

    #[inline(always)]
    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        (*self as u64).write_to(writer)
    }

    #[inline(always)]
    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(u64::read_from(reader)? as usize)
    }
}

impl Item for isize {
    const FIXED_SIZE: Option<usize> = Some(8);

    #[inline(always)]
    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        (*self as i64).write_to(writer)
    }

    #[inline(always)]
    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(i64::read_from(reader)? as isize)
    }
}

impl Item for bool {
    const FIXED_SIZE: Option<usize> = Some(1);

    #[inline(always)]
    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.put_byte(*self as u8)
    }

    #[inline(always)]
    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(reader.get_byte()? != 0)
    }
}

impl Item for () {
    const FIXED_SIZE: Option<usize> = Some(0);

    #[inline(always)]
    fn write_to<W: ItemWriter + ?Sized>(&self, _writer: &mut W) -> Result<()> {
        Ok(())
    }

    #[inline(always)]
    fn read_from<R: ItemReader + ?Sized>(_reader: &mut R) -> Result<Self> {
        Ok(())
    }
}

impl<A: Item, B: Item> Item for (A, B) {
    const FIXED_SIZE: Option<usize> = add_fixed(A::FIXED_SIZE, B::FIXED_SIZE);

    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        self.0.write_to(writer)?;
        self.1.write_to(writer)
    }

    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok((A::read_from(reader)?, B::read_from(reader)?))
    }
}

impl<A: Item, B: Item, C: Item> Item for (A, B, C) {
    const FIXED_SIZE: Option<usize> =
        add_fixed(A::FIXED_SIZE, add_fixed(B::FIXED_SIZE, C::FIXED_SIZE));

    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        self.0.write_to(writer)?;
        self.1.write_to(writer)?;
        self.2.write_to(writer)
    }

    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok((
            A::read_from(reader)?,
            B::read_from(reader)?,
            C::read_from(reader)?,
        ))
    }
}

impl Item for String {
    const FIXED_SIZE: Option<usize> = None;

    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.put_varint(self.len() as u64)?;
        writer.put_slice(self.as_bytes())
    }

    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = reader.get_varint()? as usize;
        let mut bytes = vec![0u8; len];
        reader.read_slice(&mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl<T: Item> Item for Vec<T> {
    const FIXED_SIZE: Option<usize> = None;

    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.put_varint(self.len() as u64)?;
        for item in self {
            item.write_to(writer)?;
        }
        Ok(())
    }

    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = reader.get_varint()? as usize;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::read_from(reader)?);
        }
        Ok(items)
    }
}

impl<T: Item> Item for Option<T> {
    const FIXED_SIZE: Option<usize> = None;

    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        match self {
            None => writer.put_byte(0),
            Some(value) => {
                writer.put_byte(1)?;
                value.write_to(writer)
            }
        }
    }

    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(match reader.get_byte()? {
            0 => None,
            _ => Some(T::read_from(reader)?),
        })
    }
}

impl ItemWriter for Vec<u8> {
    #[inline(always)]
    fn put_slice(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// An [`ItemReader`] over a byte slice.
pub struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceReader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl ItemReader for SliceReader<'_> {
    #[inline]
    fn read_slice(&mut self, out: &mut [u8]) -> Result<()> {
        ensure!(
            self.pos + out.len() <= self.data.len(),
            "data underflow in SliceReader"
        );
        out.copy_from_slice(&self.data[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }
}

/// Serializes one item into a fresh byte vector.
pub fn serialize_to_vec<T: Item>(item: &T) -> Vec<u8> {
    let mut out = Vec::with_capacity(T::FIXED_SIZE.unwrap_or(16));
    // Vec<u8> cannot fail as a writer
    item.write_to(&mut out).unwrap();
    out
}

/// Deserializes one item from the beginning of a byte slice.
pub fn deserialize_from_slice<T: Item>(data: &[u8]) -> Result<T> {
    T::read_from(&mut SliceReader::new(data))
}

/// The fixed-seed hash state used wherever hashes must agree across workers
/// and processes (key routing, type fingerprints).
pub fn fixed_state() -> ahash::RandomState {
    ahash::RandomState::with_seeds(
        0x6d69_6c6c_7261_6365,
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
    )
}

/// A stable fingerprint of a type, used by the `self_verify` feature to tag
/// every serialized item.
pub fn type_fingerprint<T>() -> u64 {
    use std::hash::{BuildHasher, Hash, Hasher};
    let mut hasher = fixed_state().build_hasher();
    std::any::type_name::<T>().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_varint() {
        let mut buf = Vec::new();
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            buf.clear();
            buf.put_varint(v).unwrap();
            let mut reader = SliceReader::new(&buf);
            assert_eq!(reader.get_varint().unwrap(), v);
            assert_eq!(reader.position(), buf.len());
        }
    }

    #[test]
    fn test_round_trip() {
        let item = (42u32, "forty-two".to_string(), vec![1u64, 2, 3]);
        let buf = serialize_to_vec(&item);
        let back: (u32, String, Vec<u64>) = deserialize_from_slice(&buf).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_fixed_size() {
        assert_eq!(<(u32, u64)>::FIXED_SIZE, Some(12));
        assert_eq!(<(u32, String)>::FIXED_SIZE, None);
        assert_eq!(usize::FIXED_SIZE, Some(8));
        assert_eq!(<()>::FIXED_SIZE, Some(0));
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(type_fingerprint::<u32>(), type_fingerprint::<u32>());
        assert_ne!(type_fingerprint::<u32>(), type_fingerprint::<u64>());
    }
}
