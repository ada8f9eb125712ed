//! Network-message wire form.
//!
//! Little-endian layout per datagram:
//!
//! ```text
//! u8  version/flags   version 1, publisher-id | group-header |
//!                     payload-header | extended-flags1 bits set
//! u8  extended flags  publisher-id type (u16)
//! u16 publisher id
//! u8  group flags     writer-group-id present
//! u16 writer-group id
//! u8  message count   payload header
//! u16 dataset-writer id   (per message)
//! --- per dataset message ---
//! u8  dataset flags   message valid
//! u16 field count
//! u8  builtin type    per field (6 = Int32)
//! i32 value
//! ```

use core_status::{UaError, UaResult};

const VERSION: u8 = 1;
const FLAG_PUBLISHER_ID: u8 = 0x10;
const FLAG_GROUP_HEADER: u8 = 0x20;
const FLAG_PAYLOAD_HEADER: u8 = 0x40;
const FLAG_EXTENDED1: u8 = 0x80;
const EXT1_PUBLISHER_ID_UINT16: u8 = 0x01;
const GROUP_FLAG_WRITER_GROUP_ID: u8 = 0x01;
const DATASET_FLAG_VALID: u8 = 0x01;
const TYPE_INT32: u8 = 6;

/// One typed dataset field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataValue {
    Int32(i32),
}

/// One dataset message of a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetMessage {
    pub dataset_writer_id: u16,
    pub fields: Vec<DataValue>,
}

/// A complete network message as carried by one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub publisher_id: u16,
    pub writer_group_id: u16,
    pub messages: Vec<DataSetMessage>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> UaResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(UaError::InvalidArgument)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> UaResult<u16> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn i32(&mut self) -> UaResult<i32> {
        let mut bytes = [0u8; 4];
        for byte in &mut bytes {
            *byte = self.u8()?;
        }
        Ok(i32::from_le_bytes(bytes))
    }
}

impl NetworkMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.messages.len() * 16);
        out.push(VERSION | FLAG_PUBLISHER_ID | FLAG_GROUP_HEADER | FLAG_PAYLOAD_HEADER | FLAG_EXTENDED1);
        out.push(EXT1_PUBLISHER_ID_UINT16);
        out.extend_from_slice(&self.publisher_id.to_le_bytes());
        out.push(GROUP_FLAG_WRITER_GROUP_ID);
        out.extend_from_slice(&self.writer_group_id.to_le_bytes());
        out.push(self.messages.len() as u8);
        for message in &self.messages {
            out.extend_from_slice(&message.dataset_writer_id.to_le_bytes());
        }
        for message in &self.messages {
            out.push(DATASET_FLAG_VALID);
            out.extend_from_slice(&(message.fields.len() as u16).to_le_bytes());
            for field in &message.fields {
                match field {
                    DataValue::Int32(value) => {
                        out.push(TYPE_INT32);
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                }
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> UaResult<NetworkMessage> {
        let mut reader = Reader { data, pos: 0 };

        let flags = reader.u8()?;
        if flags & 0x0F != VERSION {
            return Err(UaError::InvalidArgument);
        }
        let required = FLAG_PUBLISHER_ID | FLAG_GROUP_HEADER | FLAG_PAYLOAD_HEADER | FLAG_EXTENDED1;
        if flags & required != required {
            return Err(UaError::InvalidArgument);
        }
        if reader.u8()? != EXT1_PUBLISHER_ID_UINT16 {
            return Err(UaError::InvalidArgument);
        }
        let publisher_id = reader.u16()?;
        if reader.u8()? & GROUP_FLAG_WRITER_GROUP_ID == 0 {
            return Err(UaError::InvalidArgument);
        }
        let writer_group_id = reader.u16()?;

        let count = reader.u8()? as usize;
        let mut writer_ids = Vec::with_capacity(count);
        for _ in 0..count {
            writer_ids.push(reader.u16()?);
        }

        let mut messages = Vec::with_capacity(count);
        for dataset_writer_id in writer_ids {
            if reader.u8()? & DATASET_FLAG_VALID == 0 {
                return Err(UaError::InvalidArgument);
            }
            let field_count = reader.u16()? as usize;
            let mut fields = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                match reader.u8()? {
                    TYPE_INT32 => fields.push(DataValue::Int32(reader.i32()?)),
                    _ => return Err(UaError::InvalidArgument),
                }
            }
            messages.push(DataSetMessage {
                dataset_writer_id,
                fields,
            });
        }

        Ok(NetworkMessage {
            publisher_id,
            writer_group_id,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NetworkMessage {
        NetworkMessage {
            publisher_id: 2234,
            writer_group_id: 100,
            messages: vec![DataSetMessage {
                dataset_writer_id: 62541,
                fields: vec![DataValue::Int32(42), DataValue::Int32(-7)],
            }],
        }
    }

    #[test]
    fn header_fields_are_recovered() {
        let decoded = NetworkMessage::decode(&sample().encode()).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn truncated_message_is_rejected() {
        let encoded = sample().encode();
        for cut in [0, 1, 5, encoded.len() - 1] {
            assert!(NetworkMessage::decode(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut encoded = sample().encode();
        encoded[0] = (encoded[0] & 0xF0) | 0x02;
        assert!(NetworkMessage::decode(&encoded).is_err());
    }
}
