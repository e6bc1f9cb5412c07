//! Minimal protocol framing required to ship chunks to clients.
//!
//! Only the `LevelChunk` packet and the packet batch framing are supported.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::chunk::DimensionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of buffer")]
    UnexpectedEof,
    #[error("varint exceeds 5 bytes")]
    VarIntTooLong,
    #[error("unexpected packet id {0:#x}")]
    UnexpectedPacket(u32),
    #[error("unknown dimension id {0}")]
    UnknownDimension(i32),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

pub fn put_var_u32(buf: &mut impl BufMut, mut n: u32) {
    while n >= 0x80 {
        buf.put_u8(n as u8 | 0x80);
        n >>= 7;
    }
    buf.put_u8(n as u8);
}

/// Zigzag-encoded signed varint.
#[inline]
pub fn put_var_i32(buf: &mut impl BufMut, n: i32) {
    put_var_u32(buf, ((n << 1) ^ (n >> 31)) as u32);
}

pub fn get_var_u32(buf: &mut impl Buf) -> Result<u32, DecodeError> {
    let mut n = 0u32;
    for i in 0..5 {
        if !buf.has_remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let b = buf.get_u8();
        n |= (b as u32 & 0b111_1111) << (7 * i);
        if b >> 7 == 0 {
            return Ok(n);
        }
    }
    Err(DecodeError::VarIntTooLong)
}

#[inline]
pub fn get_var_i32(buf: &mut impl Buf) -> Result<i32, DecodeError> {
    let n = get_var_u32(buf)?;
    Ok((n >> 1) as i32 ^ -((n & 1) as i32))
}

/// Write `bytes` prefixed with its varint length.
pub fn put_string(buf: &mut impl BufMut, bytes: &[u8]) {
    put_var_u32(buf, bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn get_string(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = get_var_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(buf.split_to(len))
}

fn get_bool(buf: &mut impl Buf) -> Result<bool, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(buf.get_u8() != 0)
}

/// Full chunk column sent to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelChunkPacket {
    pub chunk_x: i32,
    pub chunk_z: i32,
    pub dimension: DimensionId,
    pub sub_chunk_count: u32,
    pub cache_enabled: bool,
    pub payload: Bytes,
}

impl LevelChunkPacket {
    pub const ID: u32 = 0x3a;

    pub fn encode(&self, buf: &mut impl BufMut) {
        put_var_u32(buf, Self::ID);
        put_var_i32(buf, self.chunk_x);
        put_var_i32(buf, self.chunk_z);
        put_var_i32(buf, self.dimension as i32);
        put_var_u32(buf, self.sub_chunk_count);
        buf.put_u8(self.cache_enabled as u8);
        // blob hashes would follow here when the client cache is enabled
        put_string(buf, &self.payload);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        match get_var_u32(&mut buf)? {
            Self::ID => {}
            id => return Err(DecodeError::UnexpectedPacket(id)),
        }

        let chunk_x = get_var_i32(&mut buf)?;
        let chunk_z = get_var_i32(&mut buf)?;
        let dimension = get_var_i32(&mut buf)?;
        let dimension = DimensionId::try_from(dimension).map_err(|_| DecodeError::UnknownDimension(dimension))?;
        let sub_chunk_count = get_var_u32(&mut buf)?;
        let cache_enabled = get_bool(&mut buf)?;
        let payload = get_string(&mut buf)?;

        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            chunk_x,
            chunk_z,
            dimension,
            sub_chunk_count,
            cache_enabled,
            payload,
        })
    }
}

/// A batch of length-framed packets, as found in a decompressed game packet.
pub struct PacketBatch;

impl PacketBatch {
    pub fn encode<'a>(packets: impl IntoIterator<Item = &'a LevelChunkPacket>) -> BytesMut {
        let mut batch = BytesMut::new();
        let mut packet = BytesMut::new();

        for p in packets {
            p.encode(&mut packet);
            put_string(&mut batch, &packet);
            packet.clear();
        }

        batch
    }

    /// Split a batch into its raw packets.
    pub fn decode(mut batch: Bytes) -> Result<Vec<Bytes>, DecodeError> {
        let mut packets = vec![];

        while batch.has_remaining() {
            packets.push(get_string(&mut batch)?);
        }

        Ok(packets)
    }
}
