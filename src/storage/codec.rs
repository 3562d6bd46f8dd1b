//! Binary encoding hooks.
//!
//! Everything that lands in a cell's byte form implements [`Codec`]. Each
//! encoding is self-delimiting so a stream of encoded items can be split
//! without an outer index. All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{FieldName, Locator};

/// Self-delimiting binary encoding.
///
/// This is the specialization hook for the generic cell and tuple
/// containers: decode a key, decode a value.
pub trait Codec: Sized {
    /// append the encoded form to `out`
    fn encode(&self, out: &mut BytesMut);

    /// decode one item from the front of `input`, advancing it
    fn decode(input: &mut &[u8]) -> StorageResult<Self>;

    /// exact number of bytes `encode` will write
    fn encoded_len(&self) -> usize;

    /// Reject items the format cannot represent. Cells call this before
    /// appending, so everything in a log encodes faithfully.
    fn validate(&self) -> StorageResult<()> {
        Ok(())
    }

    /// encode into a fresh buffer
    fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out.freeze()
    }

    /// decode a buffer that must contain exactly one item
    fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        let mut input = bytes;
        let item = Self::decode(&mut input)?;
        if input.has_remaining() {
            return Err(StorageError::corrupt(format!(
                "{} trailing bytes after item",
                input.remaining()
            )));
        }
        Ok(item)
    }
}

/// fail with `CorruptData` unless `input` holds at least `needed` bytes
pub(crate) fn ensure(input: &[u8], needed: usize, what: &str) -> StorageResult<()> {
    if input.remaining() < needed {
        return Err(StorageError::corrupt(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            needed,
            input.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(input: &mut &[u8], what: &str) -> StorageResult<u8> {
    ensure(*input, 1, what)?;
    Ok(input.get_u8())
}

pub(crate) fn get_u32(input: &mut &[u8], what: &str) -> StorageResult<u32> {
    ensure(*input, 4, what)?;
    Ok(input.get_u32())
}

pub(crate) fn get_u64(input: &mut &[u8], what: &str) -> StorageResult<u64> {
    ensure(*input, 8, what)?;
    Ok(input.get_u64())
}

/// split `len` bytes off the front of `input`
pub(crate) fn take<'a>(input: &mut &'a [u8], len: usize, what: &str) -> StorageResult<&'a [u8]> {
    let whole: &'a [u8] = *input;
    ensure(whole, len, what)?;
    let (head, tail) = whole.split_at(len);
    *input = tail;
    Ok(head)
}

impl Codec for Locator {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u64(self.as_u64());
    }

    fn decode(input: &mut &[u8]) -> StorageResult<Self> {
        get_u64(input, "locator").map(Locator::new)
    }

    fn encoded_len(&self) -> usize {
        Locator::WIDTH
    }
}

/// `[u32 length][utf-8 bytes]`
impl Codec for FieldName {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.as_str().len() as u32);
        out.put_slice(self.as_str().as_bytes());
    }

    fn decode(input: &mut &[u8]) -> StorageResult<Self> {
        let len = get_u32(input, "field name length")? as usize;
        let raw = take(input, len, "field name")?;
        let name = std::str::from_utf8(raw)
            .map_err(|e| StorageError::corrupt(format!("field name is not utf-8: {}", e)))?;
        FieldName::new(name)
            .map_err(|e| StorageError::corrupt(format!("invalid field name: {}", e)))
    }

    fn encoded_len(&self) -> usize {
        4 + self.as_str().len()
    }
}
