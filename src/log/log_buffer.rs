//! Bounds-checked cursor over raw replication bytes.
//!
//! Every length and offset derived from input is validated against the
//! remaining window before indexing; a failed read returns a protocol
//! error instead of touching out-of-range memory, so a corrupt event can
//! never take later columns with it.

use bigdecimal::BigDecimal;
use bit_set::BitSet;
use std::str::FromStr;

use crate::error::{StreamError, StreamResult};

/// Length-coded integer marker for NULL.
pub const NULL_LENGTH: i64 = -1;

const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

#[derive(Debug)]
pub struct LogBuffer {
    buffer: Vec<u8>,
    position: usize,
    limit: usize,
}

impl LogBuffer {
    pub fn from(buffer: Vec<u8>) -> LogBuffer {
        let limit = buffer.len();
        LogBuffer {
            buffer,
            position: 0,
            limit,
        }
    }

    fn overrun(&self, wanted: usize) -> StreamError {
        StreamError::Protocol(format!(
            "limit exceed: need {} byte(s) at {} of {}",
            wanted, self.position, self.limit
        ))
    }

    fn take(&mut self, len: usize) -> StreamResult<&[u8]> {
        if self.position + len > self.limit {
            return Err(self.overrun(len));
        }
        let start = self.position;
        self.position += len;
        Ok(&self.buffer[start..start + len])
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn up_position(&mut self, new_position: usize) -> StreamResult<()> {
        if new_position > self.limit {
            return Err(StreamError::Protocol(format!(
                "limit exceed: {}",
                new_position
            )));
        }
        self.position = new_position;
        Ok(())
    }

    pub fn forward(&mut self, len: usize) -> StreamResult<()> {
        if self.position + len > self.limit {
            return Err(self.overrun(len));
        }
        self.position += len;
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Shrink the readable window (used to cut a checksum trailer off).
    pub fn new_limit(&mut self, new_limit: usize) -> StreamResult<()> {
        if new_limit > self.buffer.len() {
            return Err(StreamError::Protocol(format!(
                "capacity exceed: {}",
                new_limit
            )));
        }
        self.limit = new_limit;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    // ── little-endian integers ─────────────────────────────────────────

    pub fn get_uint8(&mut self) -> StreamResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_int8(&mut self) -> StreamResult<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn get_uint16(&mut self) -> StreamResult<u16> {
        let b = self.take(2)?;
        Ok(b[0] as u16 | (b[1] as u16) << 8)
    }

    pub fn get_int16(&mut self) -> StreamResult<i16> {
        Ok(self.get_uint16()? as i16)
    }

    pub fn get_uint24(&mut self) -> StreamResult<u32> {
        let b = self.take(3)?;
        Ok(b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16)
    }

    /// 24-bit little-endian, sign-extended.
    pub fn get_int24(&mut self) -> StreamResult<i32> {
        let v = self.get_uint24()?;
        if v & 0x80_0000 != 0 {
            Ok((v | 0xff00_0000) as i32)
        } else {
            Ok(v as i32)
        }
    }

    pub fn get_uint32(&mut self) -> StreamResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_int32(&mut self) -> StreamResult<i32> {
        Ok(self.get_uint32()? as i32)
    }

    pub fn get_uint48(&mut self) -> StreamResult<u64> {
        let b = self.take(6)?;
        let mut v = 0u64;
        for (i, byte) in b.iter().enumerate() {
            v |= (*byte as u64) << (8 * i);
        }
        Ok(v)
    }

    pub fn get_uint64(&mut self) -> StreamResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_int64(&mut self) -> StreamResult<i64> {
        Ok(self.get_uint64()? as i64)
    }

    pub fn get_float32(&mut self) -> StreamResult<f32> {
        Ok(f32::from_bits(self.get_uint32()?))
    }

    pub fn get_double64(&mut self) -> StreamResult<f64> {
        Ok(f64::from_bits(self.get_uint64()?))
    }

    // ── big-endian integers ────────────────────────────────────────────

    pub fn get_uint16_big_endian(&mut self) -> StreamResult<u16> {
        let b = self.take(2)?;
        Ok((b[0] as u16) << 8 | b[1] as u16)
    }

    pub fn get_uint24_big_endian(&mut self) -> StreamResult<u32> {
        let b = self.take(3)?;
        Ok((b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32)
    }

    pub fn get_uint32_big_endian(&mut self) -> StreamResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_int32_big_endian(&mut self) -> StreamResult<i32> {
        Ok(self.get_uint32_big_endian()? as i32)
    }

    /// 40-bit big-endian, as packed DATETIME2 uses.
    pub fn get_uint40_big_endian(&mut self) -> StreamResult<u64> {
        let b = self.take(5)?;
        let mut v = 0u64;
        for byte in b {
            v = (v << 8) | *byte as u64;
        }
        Ok(v)
    }

    pub fn get_uint64_big_endian(&mut self) -> StreamResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Big-endian unsigned of 1..=4 bytes (fractional-second storage).
    pub fn get_uint_big_endian(&mut self, len: usize) -> StreamResult<u32> {
        if len == 0 || len > 4 {
            return Err(StreamError::Protocol(format!("bad field width: {}", len)));
        }
        let b = self.take(len)?;
        let mut v = 0u32;
        for byte in b {
            v = (v << 8) | *byte as u32;
        }
        Ok(v)
    }

    // ── MySQL length-coded fields ──────────────────────────────────────

    /// Length-coded integer; returns [`NULL_LENGTH`] for the NULL marker.
    pub fn get_packed_long(&mut self) -> StreamResult<i64> {
        let lead = self.get_uint8()?;
        match lead {
            0xfb => Ok(NULL_LENGTH),
            0xfc => Ok(self.get_uint16()? as i64),
            0xfd => Ok(self.get_uint24()? as i64),
            0xfe => Ok(self.get_uint64()? as i64),
            v => Ok(v as i64),
        }
    }

    /// Length-coded byte string; `None` for the NULL marker.
    pub fn get_packed_bytes(&mut self) -> StreamResult<Option<Vec<u8>>> {
        let len = self.get_packed_long()?;
        if len == NULL_LENGTH {
            return Ok(None);
        }
        Ok(Some(self.get_data(len as usize)?))
    }

    // ── strings and raw bytes ──────────────────────────────────────────

    pub fn get_data(&mut self, len: usize) -> StreamResult<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Fixed-length field decoded as UTF-8 (lossy).
    pub fn get_fix_string(&mut self, len: usize) -> StreamResult<String> {
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// NUL-terminated string; consumes the terminator.
    pub fn get_string_nul(&mut self) -> StreamResult<String> {
        let start = self.position;
        while self.position < self.limit && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.limit {
            return Err(StreamError::Protocol(
                "unterminated string field".to_string(),
            ));
        }
        let s = String::from_utf8_lossy(&self.buffer[start..self.position]).into_owned();
        self.position += 1;
        Ok(s)
    }

    /// Read `bits` flags LSB-first into the bitmap, consuming whole bytes.
    pub fn fill_bitmap(&mut self, bitmap: &mut BitSet, bits: usize) -> StreamResult<()> {
        let bytes = self.take((bits + 7) / 8)?;
        for i in 0..bits {
            if bytes[i / 8] & (1 << (i % 8)) != 0 {
                bitmap.insert(i);
            }
        }
        Ok(())
    }

    // ── packed decimal ─────────────────────────────────────────────────

    /// MySQL NEWDECIMAL: sign-flipped big-endian digit groups of nine.
    pub fn get_decimal(&mut self, precision: usize, scale: usize) -> StreamResult<BigDecimal> {
        if scale > precision {
            return Err(StreamError::Decode(format!(
                "bad decimal meta: precision {} scale {}",
                precision, scale
            )));
        }
        let intg = precision - scale;
        let intg0 = intg / 9;
        let frac0 = scale / 9;
        let intg0x = intg - intg0 * 9;
        let frac0x = scale - frac0 * 9;
        let binsize = intg0 * 4 + DIG2BYTES[intg0x] + frac0 * 4 + DIG2BYTES[frac0x];
        if binsize == 0 {
            return Ok(BigDecimal::from(0));
        }
        let mut raw = self.get_data(binsize)?;
        let negative = raw[0] & 0x80 == 0;
        raw[0] ^= 0x80;
        if negative {
            for b in raw.iter_mut() {
                *b = !*b;
            }
        }

        let mut pos = 0usize;
        let mut group = |bytes: usize| -> u64 {
            let mut v = 0u64;
            for _ in 0..bytes {
                v = (v << 8) | raw[pos] as u64;
                pos += 1;
            }
            v
        };

        let mut int_digits = String::new();
        if intg0x > 0 {
            int_digits.push_str(&group(DIG2BYTES[intg0x]).to_string());
        }
        for _ in 0..intg0 {
            let v = group(4);
            if int_digits.is_empty() {
                int_digits.push_str(&v.to_string());
            } else {
                int_digits.push_str(&format!("{:09}", v));
            }
        }
        let int_digits = int_digits.trim_start_matches('0');
        let int_digits = if int_digits.is_empty() {
            "0"
        } else {
            int_digits
        };

        let mut text = String::new();
        if negative {
            text.push('-');
        }
        text.push_str(int_digits);
        if scale > 0 {
            text.push('.');
            for _ in 0..frac0 {
                text.push_str(&format!("{:09}", group(4)));
            }
            if frac0x > 0 {
                let v = group(DIG2BYTES[frac0x]);
                text.push_str(&format!("{:0width$}", v, width = frac0x));
            }
        }

        BigDecimal::from_str(&text)
            .map_err(|e| StreamError::Decode(format!("bad decimal {}: {}", text, e)))
    }
}
