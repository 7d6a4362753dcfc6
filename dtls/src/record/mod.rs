//! Record codec: header parse/serialize, datagram splitting, per-record payload handling.
//!
//! Binding a record to a session (plaintext vs. the established vs. an ongoing
//! handshake's session) is deliberately left to the caller — see `spec.md` 4.1. This
//! module only knows how to walk a datagram into `(header, payload)` pairs and back.

pub mod alert;
pub mod application_data;

use bytes::{Buf, BufMut, BytesMut};
use shared::error::{Error, Result};

pub const RECORD_LAYER_HEADER_SIZE: usize = 13;
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 48) - 1;

pub const PROTOCOL_VERSION_1_2: ProtocolVersion = ProtocolVersion {
    major: 254,
    minor: 253,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            _ => Err(Error::Other(format!("unknown content type {v}"))),
        }
    }
}

/// The 13-byte record header described in `spec.md` 3 / 4.1: type, version, epoch,
/// a 48-bit sequence number, and the payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayerHeader {
    pub content_type: ContentType,
    pub protocol_version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64, // low 48 bits significant
    pub content_len: u16,
}

impl RecordLayerHeader {
    pub fn marshal(&self, out: &mut BytesMut) {
        out.put_u8(self.content_type as u8);
        out.put_u8(self.protocol_version.major);
        out.put_u8(self.protocol_version.minor);
        out.put_u16(self.epoch);
        // 48-bit sequence number, big-endian
        let seq = self.sequence_number & MAX_SEQUENCE_NUMBER;
        out.put_u8((seq >> 40) as u8);
        out.put_u8((seq >> 32) as u8);
        out.put_u32((seq & 0xffff_ffff) as u32);
        out.put_u16(self.content_len);
    }

    pub fn unmarshal(buf: &mut &[u8]) -> Result<Self> {
        if buf.len() < RECORD_LAYER_HEADER_SIZE {
            return Err(Error::Other("truncated record header".to_owned()));
        }
        let content_type = ContentType::from_u8(buf[0])?;
        let protocol_version = ProtocolVersion {
            major: buf[1],
            minor: buf[2],
        };
        let epoch = u16::from_be_bytes([buf[3], buf[4]]);
        let sequence_number = ((buf[5] as u64) << 40)
            | ((buf[6] as u64) << 32)
            | ((buf[7] as u64) << 24)
            | ((buf[8] as u64) << 16)
            | ((buf[9] as u64) << 8)
            | (buf[10] as u64);
        let content_len = u16::from_be_bytes([buf[11], buf[12]]);
        buf.advance(RECORD_LAYER_HEADER_SIZE);
        Ok(RecordLayerHeader {
            content_type,
            protocol_version,
            epoch,
            sequence_number,
            content_len,
        })
    }
}

/// A decoded record: header plus opaque payload bytes (ciphertext when `epoch > 0`,
/// otherwise plaintext, per the Record invariant in `spec.md` 3).
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordLayerHeader,
    pub payload: BytesMut,
}

impl Record {
    pub fn marshal(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(RECORD_LAYER_HEADER_SIZE + self.payload.len());
        let mut header = self.header;
        header.content_len = self.payload.len() as u16;
        header.marshal(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Splits a datagram into records, stopping (and discarding the remainder) at the
/// first malformed header or truncated payload. Already-parsed records remain valid,
/// per `spec.md` 4.1.
pub fn unpack_datagram(datagram: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut rest = datagram;

    loop {
        if rest.is_empty() {
            break;
        }
        let header = match RecordLayerHeader::unmarshal(&mut rest) {
            Ok(h) => h,
            Err(_) => break,
        };
        let len = header.content_len as usize;
        if rest.len() < len {
            break;
        }
        let payload = BytesMut::from(&rest[..len]);
        rest = &rest[len..];
        records.push(Record { header, payload });
    }

    records
}

/// Packs records into one or more datagrams, never exceeding `max_datagram_size`.
/// A record larger than `max_datagram_size` on its own is dropped (the caller should
/// log this — it should not occur because fragmentation happens before this point).
pub fn pack_datagrams(records: &[BytesMut], max_datagram_size: usize) -> Vec<BytesMut> {
    let mut datagrams = Vec::new();
    let mut current = BytesMut::new();

    for record in records {
        if record.len() > max_datagram_size {
            log::warn!(
                "dropping record of {} bytes, exceeds max datagram size {}",
                record.len(),
                max_datagram_size
            );
            continue;
        }
        if !current.is_empty() && current.len() + record.len() > max_datagram_size {
            datagrams.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(record);
    }

    if !current.is_empty() {
        datagrams.push(current);
    }

    datagrams
}

#[cfg(test)]
mod record_test {
    use super::*;

    fn sample_header(seq: u64) -> RecordLayerHeader {
        RecordLayerHeader {
            content_type: ContentType::Handshake,
            protocol_version: PROTOCOL_VERSION_1_2,
            epoch: 0,
            sequence_number: seq,
            content_len: 0,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header(0x0001_0203_0405);
        let mut out = BytesMut::new();
        header.marshal(&mut out);
        assert_eq!(out.len(), RECORD_LAYER_HEADER_SIZE);
        let mut slice = &out[..];
        let parsed = RecordLayerHeader::unmarshal(&mut slice).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn unpack_stops_at_truncated_tail() {
        let mut good = sample_header(1);
        good.content_len = 4;
        let mut datagram = BytesMut::new();
        good.marshal(&mut datagram);
        datagram.extend_from_slice(b"abcd");

        // second record's header claims more payload than is actually present
        let mut bad = sample_header(2);
        bad.content_len = 100;
        bad.marshal(&mut datagram);
        datagram.extend_from_slice(b"short");

        let records = unpack_datagram(&datagram);
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].payload[..], b"abcd");
    }

    #[test]
    fn pack_splits_on_size() {
        let records = vec![BytesMut::from(&[0u8; 10][..]); 5];
        let datagrams = pack_datagrams(&records, 25);
        assert_eq!(datagrams.len(), 2);
        assert!(datagrams.iter().all(|d| d.len() <= 25));
    }
}
