//! Variable-length integer encoding for frame record lengths.
//!
//! Each record inside a batch frame is prefixed by its length using 7 bits
//! per byte, with the high bit set on every byte except the last:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes
//! - up to u32::MAX: 5 bytes

use crate::error::FrameError;

/// Maximum number of bytes a length prefix can occupy.
pub const MAX_LEN: usize = 5;

/// Decode a length prefix from the start of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on success, `Ok(None)` if the
/// buffer ends before the prefix does, or `Err` if the prefix is longer than
/// [`MAX_LEN`] bytes.
///
/// # Example
/// ```
/// use castlite_core::varint::decode;
/// let (value, consumed) = decode(&[0x80, 0x01]).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut value = 0u64;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_LEN {
            return Err(FrameError::InvalidLength);
        }
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if (byte & 0x80) == 0 {
            if value > u32::MAX as u64 {
                return Err(FrameError::InvalidLength);
            }
            return Ok(Some((value as usize, i + 1)));
        }
    }

    Ok(None)
}

/// Encode `value` into `buf`, which must hold at least [`MAX_LEN`] bytes.
/// Returns the number of bytes written.
pub fn encode_to_slice(mut value: u32, buf: &mut [u8]) -> usize {
    let mut i = 0;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf[i] = byte;
        i += 1;
        if value == 0 {
            return i;
        }
    }
}

/// Number of bytes needed to encode `value`.
#[inline]
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_boundaries() {
        assert_eq!(decode(&[0x00]).unwrap(), Some((0, 1)));
        assert_eq!(decode(&[0x7F]).unwrap(), Some((127, 1)));
        assert_eq!(decode(&[0xFF, 0x7F]).unwrap(), Some((16383, 2)));
        assert_eq!(decode(&[0x80, 0x80, 0x01]).unwrap(), Some((16384, 3)));
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]).unwrap(),
            Some((u32::MAX as usize, 5))
        );
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_decode_too_long() {
        assert_eq!(
            decode(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(FrameError::InvalidLength)
        );
        // Five bytes, but the value overflows u32.
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]),
            Err(FrameError::InvalidLength)
        );
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        for value in [0, 127, 128, 16383, 16384, 2_097_151, 2_097_152, u32::MAX] {
            let mut buf = [0u8; MAX_LEN];
            let written = encode_to_slice(value, &mut buf);
            assert_eq!(written, encoded_len(value), "value {}", value);
            assert_eq!(decode(&buf[..written]).unwrap(), Some((value as usize, written)));
        }
    }
}
