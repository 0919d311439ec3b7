//! Typed register decoding.
//!
//! Word order is big-endian: the first register holds the most
//! significant 16 bits. `float32`/`float64` are IEEE-754 packed across
//! consecutive registers, signed types are two's complement, and UTF-8
//! strings decode N registers into bytes with nulls stripped. NaN and
//! infinity decode to "no value" — a sensor emitting them is not
//! reporting.

use crate::config::{RegisterConfig, RegisterDataType, ScaleOrder};

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Number(f64),
    Text(String),
}

impl DecodedValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

/// Decode raw registers into a typed value. Returns `None` when the word
/// count is short for the datatype or the value is NaN/Inf.
pub fn decode(words: &[u16], datatype: RegisterDataType) -> Option<DecodedValue> {
    use RegisterDataType::*;

    match datatype {
        Uint16 => words.first().map(|&w| DecodedValue::Number(f64::from(w))),
        Int16 => words
            .first()
            .map(|&w| DecodedValue::Number(f64::from(w as i16))),
        Uint32 => {
            let (hi, lo) = (*words.first()?, *words.get(1)?);
            Some(DecodedValue::Number(f64::from(
                (u32::from(hi) << 16) | u32::from(lo),
            )))
        }
        Int32 => {
            let (hi, lo) = (*words.first()?, *words.get(1)?);
            let raw = (u32::from(hi) << 16) | u32::from(lo);
            Some(DecodedValue::Number(f64::from(raw as i32)))
        }
        Float32 => {
            let (hi, lo) = (*words.first()?, *words.get(1)?);
            let bits = (u32::from(hi) << 16) | u32::from(lo);
            let value = f32::from_bits(bits);
            if value.is_nan() || value.is_infinite() {
                return None;
            }
            Some(DecodedValue::Number(f64::from(value)))
        }
        Float64 => {
            if words.len() < 4 {
                return None;
            }
            let bits = (u64::from(words[0]) << 48)
                | (u64::from(words[1]) << 32)
                | (u64::from(words[2]) << 16)
                | u64::from(words[3]);
            let value = f64::from_bits(bits);
            if value.is_nan() || value.is_infinite() {
                return None;
            }
            Some(DecodedValue::Number(value))
        }
        Utf8 => {
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
            let text = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\0')
                .trim()
                .to_string();
            Some(DecodedValue::Text(text))
        }
    }
}

/// Encode a typed value back into registers (write paths and round-trip
/// tests). Text values are not encodable.
pub fn encode(value: f64, datatype: RegisterDataType) -> Option<Vec<u16>> {
    use RegisterDataType::*;

    match datatype {
        Uint16 => Some(vec![value as u16]),
        Int16 => Some(vec![(value as i16) as u16]),
        Uint32 => {
            let raw = value as u32;
            Some(vec![(raw >> 16) as u16, (raw & 0xFFFF) as u16])
        }
        Int32 => {
            let raw = (value as i32) as u32;
            Some(vec![(raw >> 16) as u16, (raw & 0xFFFF) as u16])
        }
        Float32 => {
            let bits = (value as f32).to_bits();
            Some(vec![(bits >> 16) as u16, (bits & 0xFFFF) as u16])
        }
        Float64 => {
            let bits = value.to_bits();
            Some(vec![
                (bits >> 48) as u16,
                ((bits >> 32) & 0xFFFF) as u16,
                ((bits >> 16) & 0xFFFF) as u16,
                (bits & 0xFFFF) as u16,
            ])
        }
        Utf8 => None,
    }
}

/// Apply a register's scale and offset in its configured order.
pub fn apply_scaling(value: f64, register: &RegisterConfig) -> f64 {
    match register.scale_order {
        ScaleOrder::MultiplyThenAdd => value * register.scale + register.offset,
        ScaleOrder::AddThenMultiply => (value + register.offset) * register.scale,
    }
}

/// Decode raw words for a register and apply its scaling. Text registers
/// pass through unscaled.
pub fn decode_register(words: &[u16], register: &RegisterConfig) -> Option<DecodedValue> {
    match decode(words, register.datatype)? {
        DecodedValue::Number(n) => Some(DecodedValue::Number(apply_scaling(n, register))),
        text @ DecodedValue::Text(_) => Some(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegisterAccess, RegisterKind};

    fn register(datatype: RegisterDataType, scale: f64, offset: f64, order: ScaleOrder) -> RegisterConfig {
        RegisterConfig {
            address: 0,
            name: "r".into(),
            kind: RegisterKind::Holding,
            datatype,
            access: RegisterAccess::Read,
            scale,
            offset,
            scale_order: order,
            unit: String::new(),
            size: 0,
            poll_interval_ms: 1000,
            logging_frequency_s: 60,
            role: None,
            valid_min: None,
            valid_max: None,
            log_to_cloud: true,
        }
    }

    #[test]
    fn signed_types_use_twos_complement() {
        assert_eq!(
            decode(&[0xFFFF], RegisterDataType::Int16),
            Some(DecodedValue::Number(-1.0))
        );
        assert_eq!(
            decode(&[0xFFFF, 0xFFFE], RegisterDataType::Int32),
            Some(DecodedValue::Number(-2.0))
        );
        assert_eq!(
            decode(&[0xFFFF], RegisterDataType::Uint16),
            Some(DecodedValue::Number(65535.0))
        );
    }

    #[test]
    fn float32_is_big_endian_packed() {
        // 118.625 = 0x42ED4000
        assert_eq!(
            decode(&[0x42ED, 0x4000], RegisterDataType::Float32),
            Some(DecodedValue::Number(118.625))
        );
    }

    #[test]
    fn nan_and_inf_decode_to_no_value() {
        assert_eq!(decode(&[0x7FC0, 0x0000], RegisterDataType::Float32), None);
        assert_eq!(decode(&[0x7F80, 0x0000], RegisterDataType::Float32), None);
        assert_eq!(
            decode(&[0x7FF0, 0, 0, 0], RegisterDataType::Float64),
            None
        );
    }

    #[test]
    fn short_word_slices_decode_to_none() {
        assert_eq!(decode(&[0x1234], RegisterDataType::Uint32), None);
        assert_eq!(decode(&[0, 0], RegisterDataType::Float64), None);
        assert_eq!(decode(&[], RegisterDataType::Uint16), None);
    }

    #[test]
    fn utf8_strips_nulls_and_whitespace() {
        // "SG110" padded with nulls.
        let words = [0x5347, 0x3131, 0x3020, 0x0000];
        assert_eq!(
            decode(&words, RegisterDataType::Utf8),
            Some(DecodedValue::Text("SG110".into()))
        );
    }

    #[test]
    fn encode_decode_round_trips() {
        let cases: &[(f64, RegisterDataType)] = &[
            (0.0, RegisterDataType::Uint16),
            (65535.0, RegisterDataType::Uint16),
            (-123.0, RegisterDataType::Int16),
            (70000.0, RegisterDataType::Uint32),
            (-70000.0, RegisterDataType::Int32),
            (118.625, RegisterDataType::Float32),
            (-0.15625, RegisterDataType::Float32),
            (12345.6789, RegisterDataType::Float64),
        ];
        for &(value, datatype) in cases {
            let words = encode(value, datatype).unwrap();
            let decoded = decode(&words, datatype).unwrap().as_number().unwrap();
            assert!(
                (decoded - value).abs() < 1e-6,
                "{datatype:?}: {value} -> {decoded}"
            );
            // And back to the same raw words.
            assert_eq!(encode(decoded, datatype).unwrap(), words);
        }
    }

    #[test]
    fn scale_order_is_respected() {
        let mul_add = register(RegisterDataType::Uint16, 0.1, 5.0, ScaleOrder::MultiplyThenAdd);
        let add_mul = register(RegisterDataType::Uint16, 0.1, 5.0, ScaleOrder::AddThenMultiply);

        let raw = [100u16];
        assert_eq!(
            decode_register(&raw, &mul_add).unwrap().as_number().unwrap(),
            15.0
        );
        assert_eq!(
            decode_register(&raw, &add_mul).unwrap().as_number().unwrap(),
            10.5
        );
    }
}
