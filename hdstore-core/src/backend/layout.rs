//! Binary layout of fragment files
//!
//! Header (128 bytes, little-endian):
//! - 4 bytes: magic `HDSF`
//! - 2 bytes: format version
//! - 1 byte: data type tag
//! - 1 byte: calculation method tag
//! - 4 bytes: compression level
//! - 4 bytes: capacity
//! - 8 bytes: fragment start time
//! - 8 bytes: slot span
//! - 2 bytes: configuration id length
//! - 88 bytes: configuration id, zero padded
//! - 2 bytes: reserved
//! - 4 bytes: CRC32 of everything before it
//!
//! Record (24 bytes):
//! - 1 byte: flags (bit 0 = slot written)
//! - 3 bytes: reserved
//! - 4 bytes: base value count
//! - 8 bytes: value bits (i64 or f64)
//! - 4 bytes: error indicator (f32)
//! - 4 bytes: manual indicator (f32)

use super::StorageChannelMetaData;
use crate::{CalculationMethod, DataType, HdError, Result, SampleValue, Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes at the start of every fragment
pub const MAGIC: &[u8; 4] = b"HDSF";

/// Fragment file format version
pub const FORMAT_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 128;

/// Slot record size in bytes
pub const RECORD_SIZE: usize = 24;

/// Longest configuration id that fits in the header
pub const MAX_CONFIGURATION_ID_LEN: usize = 88;

const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;
const FLAG_PRESENT: u8 = 0x01;

/// Byte offset of a slot record
pub(crate) fn slot_offset(index: u32) -> u64 {
    HEADER_SIZE as u64 + index as u64 * RECORD_SIZE as u64
}

/// Total file size for a fragment of `capacity` slots
pub(crate) fn file_size(capacity: u32) -> u64 {
    slot_offset(capacity)
}

pub(crate) fn encode_header(meta: &StorageChannelMetaData) -> Result<Bytes> {
    let id = meta.configuration_id.as_bytes();
    if id.is_empty() || id.len() > MAX_CONFIGURATION_ID_LEN {
        return Err(HdError::InvalidFormat(format!(
            "Configuration id must be 1..={} bytes: {:?}",
            MAX_CONFIGURATION_ID_LEN, meta.configuration_id
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    buf.put_slice(MAGIC);
    buf.put_u16_le(FORMAT_VERSION);
    buf.put_u8(meta.data_type.tag());
    buf.put_u8(meta.calculation_method.tag());
    buf.put_u32_le(meta.level);
    buf.put_u32_le(meta.capacity);
    buf.put_i64_le(meta.start_time);
    buf.put_i64_le(meta.slot_span);
    buf.put_u16_le(id.len() as u16);
    buf.put_slice(id);
    buf.put_bytes(0, CHECKSUM_OFFSET - buf.len());

    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);

    debug_assert_eq!(buf.len(), HEADER_SIZE);
    Ok(buf.freeze())
}

pub(crate) fn decode_header(data: &[u8]) -> Result<StorageChannelMetaData> {
    if data.len() < HEADER_SIZE {
        return Err(HdError::Corruption("Fragment header too short".into()));
    }
    if &data[0..4] != MAGIC {
        return Err(HdError::Corruption("Invalid fragment magic".into()));
    }

    let expected = (&data[CHECKSUM_OFFSET..HEADER_SIZE]).get_u32_le();
    let actual = crc32fast::hash(&data[..CHECKSUM_OFFSET]);
    if expected != actual {
        return Err(HdError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = &data[4..CHECKSUM_OFFSET];
    let version = cursor.get_u16_le();
    if version != FORMAT_VERSION {
        return Err(HdError::InvalidFormat(format!(
            "Unsupported fragment version: {}",
            version
        )));
    }

    let data_type = DataType::from_tag(cursor.get_u8())?;
    let calculation_method = CalculationMethod::from_tag(cursor.get_u8())?;
    let level = cursor.get_u32_le();
    let capacity = cursor.get_u32_le();
    let start_time = cursor.get_i64_le();
    let slot_span = cursor.get_i64_le();

    let id_len = cursor.get_u16_le() as usize;
    if id_len == 0 || id_len > MAX_CONFIGURATION_ID_LEN {
        return Err(HdError::Corruption(format!(
            "Invalid configuration id length: {}",
            id_len
        )));
    }
    let configuration_id = String::from_utf8(cursor[..id_len].to_vec())
        .map_err(|e| HdError::Corruption(e.to_string()))?;

    if capacity == 0 || slot_span <= 0 {
        return Err(HdError::Corruption(format!(
            "Invalid fragment geometry: capacity {}, slot span {}",
            capacity, slot_span
        )));
    }

    Ok(StorageChannelMetaData {
        configuration_id,
        calculation_method,
        data_type,
        level,
        slot_span,
        start_time,
        capacity,
    })
}

pub(crate) fn encode_record<T: SampleValue>(value: &Value<T>, buf: &mut BytesMut) {
    buf.put_u8(FLAG_PRESENT);
    buf.put_bytes(0, 3);
    buf.put_u32_le(value.base_value_count);
    buf.put_u64_le(value.value.to_bits());
    buf.put_f32_le(value.error_indicator);
    buf.put_f32_le(value.manual_indicator);
}

/// Decode one record; `None` for a slot that was never written
pub(crate) fn decode_record<T: SampleValue>(index: i64, mut data: &[u8]) -> Option<Value<T>> {
    if data.len() < RECORD_SIZE || data[0] & FLAG_PRESENT == 0 {
        return None;
    }

    data.advance(4);
    let base_value_count = data.get_u32_le();
    let value = T::from_bits(data.get_u64_le());
    let error_indicator = data.get_f32_le();
    let manual_indicator = data.get_f32_le();

    Some(Value::with_quality(
        index,
        value,
        error_indicator,
        manual_indicator,
        base_value_count,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> StorageChannelMetaData {
        StorageChannelMetaData {
            configuration_id: "boiler-7_temp".into(),
            calculation_method: CalculationMethod::Maximum,
            data_type: DataType::Double,
            level: 2,
            slot_span: 3_600_000,
            start_time: -86_400_000,
            capacity: 24,
        }
    }

    #[test]
    fn test_header_encoding() {
        let bytes = encode_header(&meta()).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], MAGIC);
        assert_eq!(decode_header(&bytes).unwrap(), meta());
    }

    #[test]
    fn test_header_checksum_validation() {
        let mut bytes = encode_header(&meta()).unwrap().to_vec();
        bytes[20] ^= 0xFF;

        let result = decode_header(&bytes);
        assert!(matches!(result, Err(HdError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_header_rejects_bad_magic_and_long_ids() {
        let mut bytes = encode_header(&meta()).unwrap().to_vec();
        bytes[0] = b'X';
        assert!(decode_header(&bytes).unwrap_err().is_corruption());

        let mut long = meta();
        long.configuration_id = "x".repeat(MAX_CONFIGURATION_ID_LEN + 1);
        assert!(matches!(encode_header(&long), Err(HdError::InvalidFormat(_))));
    }

    #[test]
    fn test_record_layout() {
        let value = Value::with_quality(3, -42i64, 0.5, 0.25, 12);
        let mut buf = BytesMut::new();
        encode_record(&value, &mut buf);
        assert_eq!(buf.len(), RECORD_SIZE);

        assert_eq!(decode_record::<i64>(3, &buf), Some(value));
        assert_eq!(decode_record::<i64>(3, &[0u8; RECORD_SIZE]), None);
    }

    #[test]
    fn test_slot_offsets() {
        assert_eq!(slot_offset(0), HEADER_SIZE as u64);
        assert_eq!(slot_offset(2), (HEADER_SIZE + 2 * RECORD_SIZE) as u64);
        assert_eq!(file_size(100), (HEADER_SIZE + 100 * RECORD_SIZE) as u64);
    }
}
