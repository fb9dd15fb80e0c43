//! Binary block formats for transferring arrays of numbers.
//!
//! Instruments send and receive arrays either as comma separated text or as an arbitrary block:
//!
//! - `ieee`: IEEE 488.2 definite length `#<n><length><data>`, where `n` is the number of digits of
//!   `length`. `#0<data>` is the indefinite length form that ends with a line feed.
//! - `hp`: `#A` followed by the length as an unsigned 16-bit integer and the data.
//! - `ascii`: values separated by commas.
//! - `raw`: the data without any header.
//!
//! # Example
//!
//! ```
//! use equipmentrs::block::{ByteOrder, Format, from_bytes, to_bytes};
//!
//! let data = to_bytes(&[1.0f32, 2.5], Format::Ieee, ByteOrder::Little).unwrap();
//! assert_eq!(&data[..3], b"#18");
//! let values: Vec<f32> = from_bytes(&data, Format::Ieee, ByteOrder::Little).unwrap();
//! assert_eq!(values, vec![1.0, 2.5]);
//! ```

use std::{fmt::Display, str::FromStr};

use crate::EquipmentError;

/// The header of an IEEE 488.2 arbitrary block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockHeader {
    /// `#<n><length>`, the payload has exactly `data_len` bytes.
    Definite {
        /// Number of bytes of the header, `#`, `n` and the length digits.
        header_len: usize,
        /// Number of payload bytes.
        data_len: usize,
    },
    /// `#0`, the payload ends with the message.
    Indefinite,
}

impl BlockHeader {
    /// Parse the header at the start of `data`, which must begin with `#`.
    ///
    /// Returns `Ok(None)` if `data` is too short to contain the complete header.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, EquipmentError> {
        if data.first() != Some(&b'#') {
            return Err(EquipmentError::InvalidBlockHeader(
                "a block must start with #".to_string(),
            ));
        }
        let Some(&n) = data.get(1) else {
            return Ok(None);
        };
        if !n.is_ascii_digit() {
            return Err(EquipmentError::InvalidBlockHeader(format!(
                "the character after # is not a digit: {:?}",
                char::from(n)
            )));
        }

        let ndigits = usize::from(n - b'0');
        if ndigits == 0 {
            return Ok(Some(BlockHeader::Indefinite));
        }
        let Some(digits) = data.get(2..2 + ndigits) else {
            return Ok(None);
        };
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(EquipmentError::InvalidBlockHeader(format!(
                "the {ndigits} character(s) after #{ndigits} are not digits: {:?}",
                String::from_utf8_lossy(digits)
            )));
        }
        // at most 9 digits, always fits
        let data_len = digits
            .iter()
            .fold(0usize, |len, d| len * 10 + usize::from(d - b'0'));

        Ok(Some(BlockHeader::Definite {
            header_len: 2 + ndigits,
            data_len,
        }))
    }
}

/// Format of an array of numbers on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// IEEE 488.2 arbitrary block.
    Ieee,
    /// HP block, `#A` plus a 16-bit length.
    Hp,
    /// Comma separated text.
    Ascii,
    /// Bytes without a header.
    Raw,
}

/// Byte order of binary values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first.
    Big,
    /// Least significant byte first.
    #[default]
    Little,
}

/// A number that can be transferred in a block.
pub trait BlockValue: Copy + Display + FromStr {
    /// Size of the binary representation in bytes.
    const SIZE: usize;

    /// Append the binary representation to `out`.
    fn put(self, order: ByteOrder, out: &mut Vec<u8>);

    /// Read the value from exactly [`BlockValue::SIZE`] bytes.
    fn get(bytes: &[u8], order: ByteOrder) -> Self;
}

macro_rules! impl_block_value {
    ($($t:ty),*) => {
        $(
            impl BlockValue for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn put(self, order: ByteOrder, out: &mut Vec<u8>) {
                    match order {
                        ByteOrder::Big => out.extend_from_slice(&self.to_be_bytes()),
                        ByteOrder::Little => out.extend_from_slice(&self.to_le_bytes()),
                    }
                }

                fn get(bytes: &[u8], order: ByteOrder) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    match order {
                        ByteOrder::Big => <$t>::from_be_bytes(raw),
                        ByteOrder::Little => <$t>::from_le_bytes(raw),
                    }
                }
            }
        )*
    };
}

impl_block_value!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Convert `values` to bytes in the given format.
///
/// An IEEE block whose length has more than 9 digits cannot be represented and is an error, as is
/// an HP block larger than 65535 bytes.
pub fn to_bytes<T: BlockValue>(
    values: &[T],
    format: Format,
    order: ByteOrder,
) -> Result<Vec<u8>, EquipmentError> {
    if format == Format::Ascii {
        let text: Vec<String> = values.iter().map(ToString::to_string).collect();
        return Ok(text.join(",").into_bytes());
    }

    let mut payload = Vec::with_capacity(values.len() * T::SIZE);
    for value in values {
        value.put(order, &mut payload);
    }

    match format {
        Format::Ieee => {
            let nbytes = payload.len().to_string();
            if nbytes.len() > 9 {
                return Err(EquipmentError::InvalidArgument(
                    "length too big for the IEEE 488.2 block format".to_string(),
                ));
            }
            let mut out = format!("#{}{nbytes}", nbytes.len()).into_bytes();
            out.append(&mut payload);
            Ok(out)
        }
        Format::Hp => {
            let nbytes = u16::try_from(payload.len()).map_err(|_| {
                EquipmentError::InvalidArgument("length too big for the HP block format".to_string())
            })?;
            let mut out = b"#A".to_vec();
            nbytes.put(order, &mut out);
            out.append(&mut payload);
            Ok(out)
        }
        _ => Ok(payload),
    }
}

/// Convert bytes in the given format to values.
///
/// For the `ieee` and `hp` formats, anything before the `#` (e.g., a response header) is skipped.
/// A trailing line feed of an indefinite length block is not part of the data.
pub fn from_bytes<T: BlockValue>(
    data: &[u8],
    format: Format,
    order: ByteOrder,
) -> Result<Vec<T>, EquipmentError> {
    let payload = match format {
        Format::Ascii => {
            let text = std::str::from_utf8(data).map_err(|_| {
                EquipmentError::Protocol("ASCII block contains non-ASCII bytes".to_string())
            })?;
            return text
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| {
                    item.parse().map_err(|_| {
                        EquipmentError::Protocol(format!("cannot parse {item:?} as a number"))
                    })
                })
                .collect();
        }
        Format::Ieee => {
            let offset = data.iter().position(|&b| b == b'#').ok_or_else(|| {
                EquipmentError::InvalidBlockHeader("cannot find the # character".to_string())
            })?;
            let block = &data[offset..];
            match BlockHeader::parse(block)? {
                Some(BlockHeader::Definite {
                    header_len,
                    data_len,
                }) => block.get(header_len..header_len + data_len).ok_or_else(|| {
                    EquipmentError::Protocol(format!(
                        "block declares {data_len} byte(s), but only {} are available",
                        block.len() - header_len
                    ))
                })?,
                Some(BlockHeader::Indefinite) => {
                    let payload = &block[2..];
                    payload.strip_suffix(b"\n").unwrap_or(payload)
                }
                None => {
                    return Err(EquipmentError::InvalidBlockHeader(
                        "the block header is incomplete".to_string(),
                    ));
                }
            }
        }
        Format::Hp => {
            let offset = data
                .windows(2)
                .position(|w| w == b"#A")
                .ok_or_else(|| {
                    EquipmentError::InvalidBlockHeader("cannot find the #A characters".to_string())
                })?;
            let length = data.get(offset + 2..offset + 4).ok_or_else(|| {
                EquipmentError::InvalidBlockHeader(
                    "the characters after #A are not a 16-bit length".to_string(),
                )
            })?;
            let data_len = usize::from(u16::get(length, order));
            let start = offset + 4;
            data.get(start..start + data_len).ok_or_else(|| {
                EquipmentError::Protocol(format!(
                    "block declares {data_len} byte(s), but only {} are available",
                    data.len() - start
                ))
            })?
        }
        Format::Raw => data,
    };

    if payload.len() % T::SIZE != 0 {
        return Err(EquipmentError::Protocol(format!(
            "{} byte(s) are not a multiple of the {}-byte value size",
            payload.len(),
            T::SIZE
        )));
    }
    Ok(payload
        .chunks_exact(T::SIZE)
        .map(|bytes| T::get(bytes, order))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_needs_more_bytes() {
        assert_eq!(BlockHeader::parse(b"#").unwrap(), None);
        assert_eq!(BlockHeader::parse(b"#21").unwrap(), None);
    }

    #[test]
    fn test_header_largest_length() {
        assert_eq!(
            BlockHeader::parse(b"#9123456789").unwrap(),
            Some(BlockHeader::Definite {
                header_len: 11,
                data_len: 123_456_789
            })
        );
    }
}
