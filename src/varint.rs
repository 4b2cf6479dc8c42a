//! Mumble's prefix-length variable integer encoding.
//!
//! The leading bits of the first byte select the width:
//!
//! | prefix      | payload                         |
//! |-------------|---------------------------------|
//! | `0xxxxxxx`  | 7 bit value                     |
//! | `10xxxxxx`  | 14 bit value (1 extra byte)     |
//! | `110xxxxx`  | 21 bit value (2 extra bytes)    |
//! | `1110xxxx`  | 28 bit value (3 extra bytes)    |
//! | `111100__`  | 32 bit value (4 extra bytes)    |
//! | `111101__`  | 64 bit value (8 extra bytes)    |
//! | `111110__`  | negated varint follows          |
//! | `111111xx`  | inverted 2 bit value (-1..=-4)  |

use thiserror::Error;

/// Largest encoded width in bytes.
pub const MAX_VARINT_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VarintError {
    /// Input ended before the announced width.
    #[error("truncated varint: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    /// A negative value was found where only unsigned values are valid.
    #[error("negative varint {0} where an unsigned value was expected")]
    Negative(i64),
    /// A negated varint whose payload is itself negative.
    #[error("nested varint negation")]
    NestedNegation,
}

/// Append the encoding of an unsigned value.
pub fn encode_u64(buf: &mut Vec<u8>, value: u64) {
    if value < 0x80 {
        buf.push(value as u8);
    } else if value < 0x4000 {
        buf.push(((value >> 8) as u8) | 0x80);
        buf.push(value as u8);
    } else if value < 0x20_0000 {
        buf.push(((value >> 16) as u8) | 0xC0);
        buf.push((value >> 8) as u8);
        buf.push(value as u8);
    } else if value < 0x1000_0000 {
        buf.push(((value >> 24) as u8) | 0xE0);
        buf.push((value >> 16) as u8);
        buf.push((value >> 8) as u8);
        buf.push(value as u8);
    } else if value < 0x1_0000_0000 {
        buf.push(0xF0);
        buf.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        buf.push(0xF4);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

/// Append the encoding of a signed value.
pub fn encode_i64(buf: &mut Vec<u8>, value: i64) {
    if value >= 0 {
        encode_u64(buf, value as u64);
    } else if !value < 0x4 {
        buf.push(0xFC | (!value) as u8);
    } else {
        buf.push(0xF8);
        encode_u64(buf, !value as u64);
    }
}

/// Decode a signed value, returning it with the number of bytes consumed.
pub fn decode_i64(input: &[u8]) -> Result<(i64, usize), VarintError> {
    let first = *input.first().ok_or(VarintError::Truncated {
        needed: 1,
        available: 0,
    })?;

    if first & 0x80 == 0 {
        return Ok((i64::from(first & 0x7F), 1));
    }
    if first & 0xC0 == 0x80 {
        let rest = take(input, 1)?;
        return Ok(((i64::from(first & 0x3F) << 8) | i64::from(rest[0]), 2));
    }
    if first & 0xF0 == 0xF0 {
        return match first & 0xFC {
            0xF0 => {
                let rest = take(input, 4)?;
                let value = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                Ok((i64::from(value), 5))
            }
            0xF4 => {
                let rest = take(input, 8)?;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(rest);
                Ok((i64::from_be_bytes(bytes), 9))
            }
            0xF8 => {
                // Only one level of negation is allowed.
                if input.get(1).is_some_and(|&next| next & 0xF8 == 0xF8) {
                    return Err(VarintError::NestedNegation);
                }
                let (inner, used) = decode_i64(&input[1..])?;
                Ok((!inner, used + 1))
            }
            _ => Ok((!i64::from(first & 0x03), 1)),
        };
    }
    if first & 0xE0 == 0xC0 {
        let rest = take(input, 2)?;
        let value =
            (i64::from(first & 0x1F) << 16) | (i64::from(rest[0]) << 8) | i64::from(rest[1]);
        return Ok((value, 3));
    }

    let rest = take(input, 3)?;
    let value = (i64::from(first & 0x0F) << 24)
        | (i64::from(rest[0]) << 16)
        | (i64::from(rest[1]) << 8)
        | i64::from(rest[2]);
    Ok((value, 4))
}

/// Decode an unsigned value; negative encodings are rejected.
pub fn decode_u64(input: &[u8]) -> Result<(u64, usize), VarintError> {
    let first = input.first().copied().unwrap_or(0);
    // The 64 bit form carries the full unsigned range.
    if first & 0xFC == 0xF4 {
        let rest = take(input, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(rest);
        return Ok((u64::from_be_bytes(bytes), 9));
    }
    let (value, used) = decode_i64(input)?;
    if value < 0 {
        return Err(VarintError::Negative(value));
    }
    Ok((value as u64, used))
}

fn take(input: &[u8], extra: usize) -> Result<&[u8], VarintError> {
    if input.len() < extra + 1 {
        return Err(VarintError::Truncated {
            needed: extra + 1,
            available: input.len(),
        });
    }
    Ok(&input[1..=extra])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_u64(&mut buf, value);
        buf
    }

    #[test]
    fn widths_follow_prefix_table() {
        assert_eq!(encoded(0x7F), vec![0x7F]);
        assert_eq!(encoded(0x80), vec![0x80, 0x80]);
        assert_eq!(encoded(0x3FFF), vec![0xBF, 0xFF]);
        assert_eq!(encoded(0x4000), vec![0xC0, 0x40, 0x00]);
        assert_eq!(encoded(0x20_0000), vec![0xE0, 0x20, 0x00, 0x00]);
        assert_eq!(encoded(0x1000_0000), vec![0xF0, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(encoded(1 << 40).len(), 9);
        assert_eq!(encoded(1 << 40)[0], 0xF4);
    }

    #[test]
    fn boundary_values_decode_to_themselves() {
        for value in [
            0,
            1,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            0x1F_FFFF,
            0x20_0000,
            0x0FFF_FFFF,
            0x1000_0000,
            u32::MAX as u64,
            u64::MAX,
        ] {
            let buf = encoded(value);
            assert_eq!(decode_u64(&buf), Ok((value, buf.len())), "value {value:#x}");
        }
    }

    #[test]
    fn small_negatives_use_single_byte() {
        let mut buf = Vec::new();
        encode_i64(&mut buf, -1);
        assert_eq!(buf, vec![0xFC]);
        assert_eq!(decode_i64(&buf), Ok((-1, 1)));

        buf.clear();
        encode_i64(&mut buf, -4);
        assert_eq!(buf, vec![0xFF]);

        buf.clear();
        encode_i64(&mut buf, -300);
        assert_eq!(buf[0], 0xF8);
        assert_eq!(decode_i64(&buf), Ok((-300, buf.len())));
        assert_eq!(decode_u64(&buf), Err(VarintError::Negative(-300)));
    }

    #[test]
    fn nested_negation_is_rejected() {
        assert_eq!(decode_i64(&[0xF8, 0xF8, 0x01]), Err(VarintError::NestedNegation));
        assert_eq!(decode_i64(&[0xF8, 0xFC]), Err(VarintError::NestedNegation));

        let deep = vec![0xF8; 1 << 20];
        assert_eq!(decode_i64(&deep), Err(VarintError::NestedNegation));
        assert_eq!(decode_u64(&deep), Err(VarintError::NestedNegation));
    }

    #[test]
    fn truncated_input_is_reported() {
        assert_eq!(
            decode_u64(&[0xC0, 0x01]),
            Err(VarintError::Truncated {
                needed: 3,
                available: 2
            })
        );
        assert!(decode_u64(&[]).is_err());
    }
}
