//! Bit-level stream.
//!
//! A fixed-size byte buffer with a bit cursor. Every network message is
//! written through one of these, so fields can take exactly as many bits as
//! they need instead of whole bytes.
//!
//! Layout rules:
//! - Bits are packed LSB-first inside each byte.
//! - The buffer never grows. Reading or writing past its end returns
//!   [`BitStreamError::OutOfBounds`].
//! - Values that do not fit their declared range are programmer errors and
//!   panic; clamping would silently desynchronize the two ends.

use std::fmt;

use tracing::warn;

use crate::math::Vec2;

/// Largest world coordinate representable by [`BitStream::write_position`].
pub const MAX_POSITION: f32 = 4096.0;

/// Bits per axis used for positions.
pub const POSITION_BITS: u32 = 16;

/// Bits used for rotations.
pub const ROTATION_BITS: u32 = 16;

/// Bit stream errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitStreamError {
    /// Not enough bits left in the buffer.
    OutOfBounds { needed: usize, available: usize },
    /// A UTF-8 string field did not contain valid UTF-8.
    InvalidUtf8,
    /// An ASCII string field contained a byte above 0x7F.
    InvalidAscii,
    /// A byte-level operation was attempted off a byte boundary.
    Misaligned { bit_index: usize },
}

impl fmt::Display for BitStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitStreamError::OutOfBounds { needed, available } => write!(
                f,
                "bit stream out of bounds: needed {needed} bits, {available} available"
            ),
            BitStreamError::InvalidUtf8 => write!(f, "invalid utf-8 string"),
            BitStreamError::InvalidAscii => write!(f, "invalid ascii string"),
            BitStreamError::Misaligned { bit_index } => {
                write!(f, "stream not byte aligned at bit {bit_index}")
            }
        }
    }
}

impl std::error::Error for BitStreamError {}

pub type BitResult<T> = Result<T, BitStreamError>;

/// Byte buffer with a bit cursor.
#[derive(Debug, Clone)]
pub struct BitStream {
    buffer: Vec<u8>,
    index: usize,
}

impl BitStream {
    /// Creates a zeroed stream of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size],
            index: 0,
        }
    }

    /// Wraps received bytes for reading.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: bytes.into(),
            index: 0,
        }
    }

    /// Rewinds the cursor. The buffer keeps its size and contents.
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Moves the cursor to `bit`. Used to roll back a failed write.
    ///
    /// # Panics
    /// If `bit` lies past the end of the buffer.
    pub fn set_position(&mut self, bit: usize) {
        assert!(bit <= self.len_bits(), "cursor {bit} past end of stream");
        self.index = bit;
    }

    /// Current cursor, in bits.
    pub fn position(&self) -> usize {
        self.index
    }

    pub fn len_bits(&self) -> usize {
        self.buffer.len() * 8
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn remaining_bits(&self) -> usize {
        self.len_bits() - self.index
    }

    pub fn is_aligned(&self) -> bool {
        self.index % 8 == 0
    }

    /// Bytes touched so far (the partially written last byte included).
    pub fn written_bytes(&self) -> &[u8] {
        &self.buffer[..self.index.div_ceil(8)]
    }

    /// The whole underlying buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn ensure(&self, bits: usize) -> BitResult<()> {
        let available = self.remaining_bits();
        if bits > available {
            return Err(BitStreamError::OutOfBounds {
                needed: bits,
                available,
            });
        }
        Ok(())
    }

    fn ensure_aligned(&self) -> BitResult<()> {
        if self.is_aligned() {
            Ok(())
        } else {
            Err(BitStreamError::Misaligned {
                bit_index: self.index,
            })
        }
    }

    // ─── Raw bit spans ───

    /// Writes the low `bits` bits of `value`.
    ///
    /// # Panics
    /// If `bits > 32` or `value` does not fit in `bits` bits.
    pub fn write_bits(&mut self, value: u32, bits: u32) -> BitResult<()> {
        assert!(bits <= 32, "bit span of {bits} exceeds 32");
        assert!(
            bits == 32 || u64::from(value) < (1u64 << bits),
            "value {value} does not fit in {bits} bits"
        );
        self.ensure(bits as usize)?;

        let mut remaining = bits;
        let mut value = u64::from(value);
        while remaining > 0 {
            let byte = self.index / 8;
            let offset = (self.index % 8) as u32;
            let take = remaining.min(8 - offset);
            let mask = ((1u32 << take) - 1) as u8;
            let chunk = (value as u8) & mask;
            self.buffer[byte] = (self.buffer[byte] & !(mask << offset)) | (chunk << offset);
            value >>= take;
            remaining -= take;
            self.index += take as usize;
        }
        Ok(())
    }

    /// Reads `bits` bits as an unsigned value.
    pub fn read_bits(&mut self, bits: u32) -> BitResult<u32> {
        assert!(bits <= 32, "bit span of {bits} exceeds 32");
        self.ensure(bits as usize)?;

        let mut result: u64 = 0;
        let mut filled = 0u32;
        while filled < bits {
            let byte = self.index / 8;
            let offset = (self.index % 8) as u32;
            let take = (bits - filled).min(8 - offset);
            let mask = ((1u32 << take) - 1) as u8;
            let chunk = (self.buffer[byte] >> offset) & mask;
            result |= u64::from(chunk) << filled;
            filled += take;
            self.index += take as usize;
        }
        Ok(result as u32)
    }

    /// Writes `value` as a two's complement field of `bits` bits.
    ///
    /// # Panics
    /// If `value` is outside the representable range.
    pub fn write_signed_bits(&mut self, value: i32, bits: u32) -> BitResult<()> {
        assert!((1..=32).contains(&bits), "invalid signed bit span {bits}");
        if bits < 32 {
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            assert!(
                (min..=max).contains(&i64::from(value)),
                "value {value} does not fit in {bits} signed bits"
            );
            let mask = (1u32 << bits) - 1;
            self.write_bits(value as u32 & mask, bits)
        } else {
            self.write_bits(value as u32, 32)
        }
    }

    /// Reads a two's complement field, sign-extending when its top bit is set.
    pub fn read_signed_bits(&mut self, bits: u32) -> BitResult<i32> {
        assert!((1..=32).contains(&bits), "invalid signed bit span {bits}");
        let raw = self.read_bits(bits)?;
        if bits < 32 && raw & (1 << (bits - 1)) != 0 {
            Ok((raw | !((1u32 << bits) - 1)) as i32)
        } else {
            Ok(raw as i32)
        }
    }

    // ─── Primitives ───

    pub fn write_bool(&mut self, value: bool) -> BitResult<()> {
        self.write_bits(u32::from(value), 1)
    }

    pub fn read_bool(&mut self) -> BitResult<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn write_u8(&mut self, value: u8) -> BitResult<()> {
        self.write_bits(u32::from(value), 8)
    }

    pub fn read_u8(&mut self) -> BitResult<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> BitResult<()> {
        self.write_bits(u32::from(value), 16)
    }

    pub fn read_u16(&mut self) -> BitResult<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn write_u32(&mut self, value: u32) -> BitResult<()> {
        self.write_bits(value, 32)
    }

    pub fn read_u32(&mut self) -> BitResult<u32> {
        self.read_bits(32)
    }

    pub fn write_i8(&mut self, value: i8) -> BitResult<()> {
        self.write_signed_bits(i32::from(value), 8)
    }

    pub fn read_i8(&mut self) -> BitResult<i8> {
        Ok(self.read_signed_bits(8)? as i8)
    }

    pub fn write_i16(&mut self, value: i16) -> BitResult<()> {
        self.write_signed_bits(i32::from(value), 16)
    }

    pub fn read_i16(&mut self) -> BitResult<i16> {
        Ok(self.read_signed_bits(16)? as i16)
    }

    pub fn write_i32(&mut self, value: i32) -> BitResult<()> {
        self.write_signed_bits(value, 32)
    }

    pub fn read_i32(&mut self) -> BitResult<i32> {
        self.read_signed_bits(32)
    }

    pub fn write_f32(&mut self, value: f32) -> BitResult<()> {
        self.write_bits(value.to_bits(), 32)
    }

    pub fn read_f32(&mut self) -> BitResult<f32> {
        Ok(f32::from_bits(self.read_bits(32)?))
    }

    pub fn write_f64(&mut self, value: f64) -> BitResult<()> {
        let bits = value.to_bits();
        self.ensure(64)?;
        self.write_bits(bits as u32, 32)?;
        self.write_bits((bits >> 32) as u32, 32)
    }

    pub fn read_f64(&mut self) -> BitResult<f64> {
        self.ensure(64)?;
        let low = u64::from(self.read_bits(32)?);
        let high = u64::from(self.read_bits(32)?);
        Ok(f64::from_bits(low | (high << 32)))
    }

    // ─── Quantized values ───

    /// Quantizes `value` in `[min, max]` into `bits` unsigned bits.
    ///
    /// The encoding is lossy: a round trip is exact to within
    /// `(max - min) / ((1 << bits) - 1)`.
    ///
    /// # Panics
    /// If `value` is not finite or lies outside `[min, max]`.
    pub fn write_float(&mut self, value: f32, min: f32, max: f32, bits: u32) -> BitResult<()> {
        assert!((1..=32).contains(&bits), "invalid float bit span {bits}");
        assert!(min < max, "invalid float range [{min}, {max}]");
        assert!(
            value.is_finite() && value >= min && value <= max,
            "value {value} outside [{min}, {max}]"
        );
        let steps = ((1u64 << bits) - 1) as f64;
        let t = (f64::from(value) - f64::from(min)) / (f64::from(max) - f64::from(min));
        self.write_bits((t * steps).round() as u32, bits)
    }

    pub fn read_float(&mut self, min: f32, max: f32, bits: u32) -> BitResult<f32> {
        assert!((1..=32).contains(&bits), "invalid float bit span {bits}");
        let steps = ((1u64 << bits) - 1) as f64;
        let raw = f64::from(self.read_bits(bits)?);
        Ok((f64::from(min) + raw / steps * (f64::from(max) - f64::from(min))) as f32)
    }

    pub fn write_vec2(&mut self, value: Vec2, min: Vec2, max: Vec2, bits: u32) -> BitResult<()> {
        self.ensure(bits as usize * 2)?;
        self.write_float(value.x, min.x, max.x, bits)?;
        self.write_float(value.y, min.y, max.y, bits)
    }

    pub fn read_vec2(&mut self, min: Vec2, max: Vec2, bits: u32) -> BitResult<Vec2> {
        let x = self.read_float(min.x, max.x, bits)?;
        let y = self.read_float(min.y, max.y, bits)?;
        Ok(Vec2::new(x, y))
    }

    /// Writes a world position in `[0, MAX_POSITION]` on both axes.
    pub fn write_position(&mut self, position: Vec2) -> BitResult<()> {
        self.write_vec2(
            position,
            Vec2::ZERO,
            Vec2::new(MAX_POSITION, MAX_POSITION),
            POSITION_BITS,
        )
    }

    pub fn read_position(&mut self) -> BitResult<Vec2> {
        self.read_vec2(
            Vec2::ZERO,
            Vec2::new(MAX_POSITION, MAX_POSITION),
            POSITION_BITS,
        )
    }

    /// Writes an angle in `[-π, π]`.
    pub fn write_rotation(&mut self, angle: f32) -> BitResult<()> {
        use std::f32::consts::PI;
        self.write_float(angle, -PI, PI, ROTATION_BITS)
    }

    pub fn read_rotation(&mut self) -> BitResult<f32> {
        use std::f32::consts::PI;
        self.read_float(-PI, PI, ROTATION_BITS)
    }

    // ─── Arrays ───

    /// Writes a `count_bits` wide length prefix followed by each element.
    ///
    /// If `items` holds more elements than the prefix can count, the extra
    /// elements are dropped with a warning.
    pub fn write_array<T, F>(&mut self, items: &[T], count_bits: u32, mut write: F) -> BitResult<()>
    where
        F: FnMut(&mut Self, &T) -> BitResult<()>,
    {
        assert!((1..=32).contains(&count_bits), "invalid count width {count_bits}");
        let max = ((1u64 << count_bits) - 1) as usize;
        let count = if items.len() > max {
            warn!(
                len = items.len(),
                max,
                count_bits,
                "array too long for its count field, truncating"
            );
            max
        } else {
            items.len()
        };
        self.write_bits(count as u32, count_bits)?;
        for item in &items[..count] {
            write(self, item)?;
        }
        Ok(())
    }

    pub fn read_array<T, F>(&mut self, count_bits: u32, mut read: F) -> BitResult<Vec<T>>
    where
        F: FnMut(&mut Self) -> BitResult<T>,
    {
        assert!((1..=32).contains(&count_bits), "invalid count width {count_bits}");
        let count = self.read_bits(count_bits)? as usize;
        // Cap the pre-allocation by what the buffer could possibly hold.
        let mut items = Vec::with_capacity(count.min(self.remaining_bits()));
        for _ in 0..count {
            items.push(read(self)?);
        }
        Ok(items)
    }

    // ─── Strings ───

    fn write_string_bytes(&mut self, bytes: &[u8], fixed: Option<usize>) -> BitResult<()> {
        match fixed {
            Some(size) => {
                self.ensure(size * 8)?;
                for i in 0..size {
                    self.write_u8(bytes.get(i).copied().unwrap_or(0))?;
                }
            }
            None => {
                let content: Vec<u8> = bytes.iter().copied().take_while(|&b| b != 0).collect();
                self.ensure((content.len() + 1) * 8)?;
                for b in content {
                    self.write_u8(b)?;
                }
                self.write_u8(0)?;
            }
        }
        Ok(())
    }

    fn read_string_bytes(&mut self, fixed: Option<usize>) -> BitResult<Vec<u8>> {
        let mut bytes = Vec::new();
        match fixed {
            Some(size) => {
                self.ensure(size * 8)?;
                let mut ended = false;
                for _ in 0..size {
                    let b = self.read_u8()?;
                    if b == 0 {
                        ended = true;
                    }
                    if !ended {
                        bytes.push(b);
                    }
                }
            }
            None => loop {
                let b = self.read_u8()?;
                if b == 0 {
                    break;
                }
                bytes.push(b);
            },
        }
        Ok(bytes)
    }

    /// Writes an ASCII string, zero padded to `fixed` bytes or zero terminated.
    ///
    /// # Panics
    /// If `value` contains non-ASCII characters.
    pub fn write_ascii_string(&mut self, value: &str, fixed: Option<usize>) -> BitResult<()> {
        assert!(value.is_ascii(), "non-ascii string {value:?}");
        self.write_string_bytes(value.as_bytes(), fixed)
    }

    pub fn read_ascii_string(&mut self, fixed: Option<usize>) -> BitResult<String> {
        let bytes = self.read_string_bytes(fixed)?;
        if !bytes.is_ascii() {
            return Err(BitStreamError::InvalidAscii);
        }
        String::from_utf8(bytes).map_err(|_| BitStreamError::InvalidAscii)
    }

    /// Writes a UTF-8 string. With `fixed`, the string is cut on a character
    /// boundary so it fits, then zero padded.
    pub fn write_utf8_string(&mut self, value: &str, fixed: Option<usize>) -> BitResult<()> {
        match fixed {
            Some(size) => {
                let mut end = value.len().min(size);
                while !value.is_char_boundary(end) {
                    end -= 1;
                }
                self.write_string_bytes(&value.as_bytes()[..end], Some(size))
            }
            None => self.write_string_bytes(value.as_bytes(), None),
        }
    }

    pub fn read_utf8_string(&mut self, fixed: Option<usize>) -> BitResult<String> {
        let bytes = self.read_string_bytes(fixed)?;
        String::from_utf8(bytes).map_err(|_| BitStreamError::InvalidUtf8)
    }

    // ─── Alignment and bulk bytes ───

    /// Zero-pads up to the next byte boundary.
    pub fn align_to_byte(&mut self) -> BitResult<()> {
        let pad = (8 - self.index % 8) % 8;
        if pad > 0 {
            self.write_bits(0, pad as u32)?;
        }
        Ok(())
    }

    /// Skips to the next byte boundary without touching the buffer.
    pub fn skip_to_byte(&mut self) -> BitResult<()> {
        let pad = (8 - self.index % 8) % 8;
        self.ensure(pad)?;
        self.index += pad;
        Ok(())
    }

    /// Copies raw bytes into a byte-aligned stream.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> BitResult<()> {
        self.ensure_aligned()?;
        self.ensure(bytes.len() * 8)?;
        let start = self.index / 8;
        self.buffer[start..start + bytes.len()].copy_from_slice(bytes);
        self.index += bytes.len() * 8;
        Ok(())
    }

    /// Reads raw bytes from a byte-aligned stream.
    pub fn read_bytes(&mut self, len: usize) -> BitResult<&[u8]> {
        self.ensure_aligned()?;
        self.ensure(len * 8)?;
        let start = self.index / 8;
        self.index += len * 8;
        Ok(&self.buffer[start..start + len])
    }
}
