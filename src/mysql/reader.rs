//! Bounds-checked cursor over a MySQL payload.
//!
//! Every read checks the remaining length first and returns
//! [`ClientError::Protocol`] on a short buffer, so malformed input from the
//! wire can never panic the decoder.

use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.remaining() < n {
            return Err(ClientError::protocol(format!(
                "truncated {}: need {} bytes, {} left",
                what,
                n,
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n, "field")?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf[self.pos])
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Little-endian unsigned integer of `n` bytes (n ≤ 8).
    pub fn uint_le(&mut self, n: usize) -> Result<u64> {
        let bytes = self.bytes(n)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    /// Big-endian unsigned integer of `n` bytes (n ≤ 8).
    pub fn uint_be(&mut self, n: usize) -> Result<u64> {
        let bytes = self.bytes(n)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        Ok(self.uint_le(2)? as u16)
    }

    pub fn u24_le(&mut self) -> Result<u32> {
        Ok(self.uint_le(3)? as u32)
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        Ok(self.uint_le(4)? as u32)
    }

    pub fn u48_le(&mut self) -> Result<u64> {
        self.uint_le(6)
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        self.uint_le(8)
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    pub fn i16_le(&mut self) -> Result<i16> {
        Ok(self.u16_le()? as i16)
    }

    pub fn i24_le(&mut self) -> Result<i32> {
        let v = self.u24_le()?;
        Ok(if v & 0x80_0000 != 0 {
            (v | 0xFF00_0000) as i32
        } else {
            v as i32
        })
    }

    pub fn i32_le(&mut self) -> Result<i32> {
        Ok(self.u32_le()? as i32)
    }

    pub fn i64_le(&mut self) -> Result<i64> {
        Ok(self.u64_le()? as i64)
    }

    pub fn f32_le(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32_le()?))
    }

    pub fn f64_le(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64_le()?))
    }

    /// Bytes up to (not including) the next NUL, which is consumed.
    pub fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let Some(end) = rest.iter().position(|b| *b == 0) else {
            return Err(ClientError::protocol("unterminated string"));
        };
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// Length-encoded integer. `None` for the NULL marker (0xFB).
    pub fn lenenc_int(&mut self) -> Result<Option<u64>> {
        match self.u8()? {
            0xFB => Ok(None),
            0xFC => Ok(Some(self.uint_le(2)?)),
            0xFD => Ok(Some(self.uint_le(3)?)),
            0xFE => Ok(Some(self.uint_le(8)?)),
            0xFF => Err(ClientError::protocol("invalid length-encoded integer prefix 0xFF")),
            v => Ok(Some(v as u64)),
        }
    }

    /// Binlog "packed integer": same encoding, NULL marker not allowed.
    pub fn packed_int(&mut self) -> Result<u64> {
        self.lenenc_int()?
            .ok_or_else(|| ClientError::protocol("unexpected NULL marker in packed integer"))
    }

    /// Length-encoded string. `None` for NULL.
    pub fn lenenc_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        match self.lenenc_int()? {
            None => Ok(None),
            Some(len) => {
                let len = usize::try_from(len)
                    .map_err(|_| ClientError::protocol("length-encoded string too long"))?;
                self.bytes(len).map(Some)
            }
        }
    }

    pub fn lenenc_string(&mut self) -> Result<String> {
        Ok(self
            .lenenc_bytes()?
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default())
    }
}
