//! Typed write methods for [`Message`].
//!
//! Every `add_*` either appends the value and advances the write cursor by
//! exactly the value's bit width, or fails with [`InsufficientCapacity`] and
//! leaves the message untouched. Multi-part writes (length prefix plus
//! elements) check the whole size up front so a partial write never lands.

use super::{InsufficientCapacity, Message};

/// Bytes needed to varuint-encode `value`.
pub(super) const fn varuint_len(value: u64) -> u32 {
    if value == 0 {
        1
    } else {
        (64 - value.leading_zeros()).div_ceil(7)
    }
}

macro_rules! add_int {
    ($(#[$attr:meta])* $add:ident, $add_many:ident, $ty:ty as $un:ty) => {
        $(#[$attr])*
        pub fn $add(&mut self, value: $ty) -> Result<&mut Self, InsufficientCapacity> {
            self.put(value as $un as u64, <$ty>::BITS, stringify!($ty))?;
            Ok(self)
        }

        /// Appends a varuint element count followed by each element.
        pub fn $add_many(&mut self, values: &[$ty]) -> Result<&mut Self, InsufficientCapacity> {
            let len = values.len() as u64;
            let required = varuint_len(len) * 8 + values.len() as u32 * <$ty>::BITS;
            self.check_capacity(concat!("[", stringify!($ty), "]"), required)?;
            self.put_varuint_raw(len);
            for &value in values {
                self.put_raw(value as $un as u64, <$ty>::BITS);
            }
            Ok(self)
        }
    };
}

impl Message {
    fn put(
        &mut self,
        value: u64,
        n: u32,
        type_name: &'static str,
    ) -> Result<(), InsufficientCapacity> {
        self.check_capacity(type_name, n)?;
        self.put_raw(value, n);
        Ok(())
    }

    /// Appends without a capacity check; callers must have checked already.
    fn put_raw(&mut self, value: u64, n: u32) {
        debug_assert!(n <= self.unwritten_bits());
        Self::store(&mut self.data, self.write_bit, value, n);
        self.write_bit += n;
    }

    fn put_varuint_raw(&mut self, mut value: u64) {
        loop {
            let group = value & 0x7F;
            value >>= 7;
            let cont = if value == 0 { 0 } else { 0x80 };
            self.put_raw(group | cont, 8);
            if value == 0 {
                return;
            }
        }
    }

    add_int!(
        /// Appends an unsigned 8-bit integer.
        add_u8, add_u8s, u8 as u8
    );
    add_int!(
        /// Appends an unsigned 16-bit integer.
        add_u16, add_u16s, u16 as u16
    );
    add_int!(
        /// Appends an unsigned 32-bit integer.
        add_u32, add_u32s, u32 as u32
    );
    add_int!(
        /// Appends an unsigned 64-bit integer.
        add_u64, add_u64s, u64 as u64
    );
    add_int!(
        /// Appends a signed 8-bit integer (two's complement bits).
        add_i8, add_i8s, i8 as u8
    );
    add_int!(
        /// Appends a signed 16-bit integer (two's complement bits).
        add_i16, add_i16s, i16 as u16
    );
    add_int!(
        /// Appends a signed 32-bit integer (two's complement bits).
        add_i32, add_i32s, i32 as u32
    );
    add_int!(
        /// Appends a signed 64-bit integer (two's complement bits).
        add_i64, add_i64s, i64 as u64
    );

    /// Appends a bool as a single bit.
    pub fn add_bool(&mut self, value: bool) -> Result<&mut Self, InsufficientCapacity> {
        self.put(u64::from(value), 1, "bool")?;
        Ok(self)
    }

    /// Appends a varuint count followed by one bit per bool.
    pub fn add_bools(&mut self, values: &[bool]) -> Result<&mut Self, InsufficientCapacity> {
        let len = values.len() as u64;
        let required = varuint_len(len) * 8 + values.len() as u32;
        self.check_capacity("[bool]", required)?;
        self.put_varuint_raw(len);
        for &value in values {
            self.put_raw(u64::from(value), 1);
        }
        Ok(self)
    }

    /// Appends an IEEE-754 32-bit float.
    pub fn add_f32(&mut self, value: f32) -> Result<&mut Self, InsufficientCapacity> {
        self.put(u64::from(value.to_bits()), 32, "f32")?;
        Ok(self)
    }

    /// Appends a varuint count followed by each 32-bit float.
    pub fn add_f32s(&mut self, values: &[f32]) -> Result<&mut Self, InsufficientCapacity> {
        let len = values.len() as u64;
        let required = varuint_len(len) * 8 + values.len() as u32 * 32;
        self.check_capacity("[f32]", required)?;
        self.put_varuint_raw(len);
        for &value in values {
            self.put_raw(u64::from(value.to_bits()), 32);
        }
        Ok(self)
    }

    /// Appends an IEEE-754 64-bit float.
    pub fn add_f64(&mut self, value: f64) -> Result<&mut Self, InsufficientCapacity> {
        self.put(value.to_bits(), 64, "f64")?;
        Ok(self)
    }

    /// Appends a varuint count followed by each 64-bit float.
    pub fn add_f64s(&mut self, values: &[f64]) -> Result<&mut Self, InsufficientCapacity> {
        let len = values.len() as u64;
        let required = varuint_len(len) * 8 + values.len() as u32 * 64;
        self.check_capacity("[f64]", required)?;
        self.put_varuint_raw(len);
        for &value in values {
            self.put_raw(value.to_bits(), 64);
        }
        Ok(self)
    }

    /// Appends an unsigned integer in LEB128-style varuint encoding:
    /// little-endian, 7 value bits per byte, high bit as continuation flag.
    pub fn add_varuint(&mut self, value: u64) -> Result<&mut Self, InsufficientCapacity> {
        self.check_capacity("varuint", varuint_len(value) * 8)?;
        self.put_varuint_raw(value);
        Ok(self)
    }

    /// Appends a signed integer as a varuint via the zig-zag mapping
    /// `(x << 1) ^ (x >> 63)`, so small magnitudes of either sign stay short.
    pub fn add_varint(&mut self, value: i64) -> Result<&mut Self, InsufficientCapacity> {
        #[allow(clippy::cast_sign_loss)]
        let zigzag = ((value << 1) ^ (value >> 63)) as u64;
        self.check_capacity("varint", varuint_len(zigzag) * 8)?;
        self.put_varuint_raw(zigzag);
        Ok(self)
    }

    /// Appends a varuint byte length followed by the raw bytes.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, InsufficientCapacity> {
        let len = bytes.len() as u64;
        let required = varuint_len(len) * 8 + bytes.len() as u32 * 8;
        self.check_capacity("bytes", required)?;
        self.put_varuint_raw(len);
        self.put_bytes_raw(bytes);
        Ok(self)
    }

    /// Appends raw bytes with no length prefix; the reader must know the
    /// amount out of band.
    pub fn add_bytes_without_len(&mut self, bytes: &[u8]) -> Result<&mut Self, InsufficientCapacity> {
        self.check_capacity("bytes", bytes.len() as u32 * 8)?;
        self.put_bytes_raw(bytes);
        Ok(self)
    }

    /// Appends a UTF-8 string: varuint byte length, then the bytes.
    pub fn add_str(&mut self, value: &str) -> Result<&mut Self, InsufficientCapacity> {
        self.add_bytes(value.as_bytes())?;
        Ok(self)
    }

    /// Appends a varuint count followed by each string.
    pub fn add_strs<S: AsRef<str>>(
        &mut self,
        values: &[S],
    ) -> Result<&mut Self, InsufficientCapacity> {
        let len = values.len() as u64;
        let required: u32 = varuint_len(len) * 8
            + values
                .iter()
                .map(|s| {
                    let bytes = s.as_ref().len() as u32;
                    varuint_len(u64::from(bytes)) * 8 + bytes * 8
                })
                .sum::<u32>();
        self.check_capacity("[str]", required)?;
        self.put_varuint_raw(len);
        for value in values {
            let bytes = value.as_ref().as_bytes();
            self.put_varuint_raw(bytes.len() as u64);
            self.put_bytes_raw(bytes);
        }
        Ok(self)
    }

    /// Byte-aligned writes block-copy word-sized chunks; unaligned writes
    /// fall back to a per-byte shifted path.
    fn put_bytes_raw(&mut self, bytes: &[u8]) {
        if self.write_bit % 8 == 0 {
            for chunk in bytes.chunks(8) {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                self.put_raw(u64::from_le_bytes(word), chunk.len() as u32 * 8);
            }
        } else {
            for &byte in bytes {
                self.put_raw(u64::from(byte), 8);
            }
        }
    }
}
