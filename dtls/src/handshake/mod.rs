//! Handshake message framing: the `HandshakeHeader` that every handshake message
//! carries (type, total length, message_seq, fragment offset/length) and the raw
//! `HandshakeMessage` body. The connector only inspects the body for `ClientHello`
//! (cookie, session_id, message_seq) and `HelloRequest`, per `spec.md` 4.4; everything
//! else is opaque bytes handed to the handshaker.

pub mod handshake_cache;

use bytes::{Buf, BufMut, BytesMut};
use shared::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    HelloVerifyRequest = 3,
    Certificate = 11,
    ServerKeyExchange = 12,
    CertificateRequest = 13,
    ServerHelloDone = 14,
    CertificateVerify = 15,
    ClientKeyExchange = 16,
    Finished = 20,
}

impl HandshakeType {
    pub fn from_u8(v: u8) -> Result<Self> {
        use HandshakeType::*;
        Ok(match v {
            0 => HelloRequest,
            1 => ClientHello,
            2 => ServerHello,
            3 => HelloVerifyRequest,
            11 => Certificate,
            12 => ServerKeyExchange,
            13 => CertificateRequest,
            14 => ServerHelloDone,
            15 => CertificateVerify,
            16 => ClientKeyExchange,
            20 => Finished,
            other => return Err(Error::Other(format!("unknown handshake type {other}"))),
        })
    }
}

pub const HANDSHAKE_HEADER_LENGTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub handshake_type: HandshakeType,
    pub length: u32, // 24-bit on the wire
    pub message_seq: u16,
    pub fragment_offset: u32, // 24-bit on the wire
    pub fragment_length: u32, // 24-bit on the wire
}

impl HandshakeHeader {
    pub fn marshal(&self, out: &mut BytesMut) {
        out.put_u8(self.handshake_type as u8);
        out.put_uint(self.length as u64, 3);
        out.put_u16(self.message_seq);
        out.put_uint(self.fragment_offset as u64, 3);
        out.put_uint(self.fragment_length as u64, 3);
    }

    pub fn unmarshal(buf: &mut &[u8]) -> Result<Self> {
        if buf.len() < HANDSHAKE_HEADER_LENGTH {
            return Err(Error::Other("truncated handshake header".to_owned()));
        }
        let handshake_type = HandshakeType::from_u8(buf[0])?;
        let length = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        let message_seq = u16::from_be_bytes([buf[4], buf[5]]);
        let fragment_offset = u32::from_be_bytes([0, buf[6], buf[7], buf[8]]);
        let fragment_length = u32::from_be_bytes([0, buf[9], buf[10], buf[11]]);
        buf.advance(HANDSHAKE_HEADER_LENGTH);
        Ok(HandshakeHeader {
            handshake_type,
            length,
            message_seq,
            fragment_offset,
            fragment_length,
        })
    }
}

/// A handshake message as it travels in a single (possibly fragmented-on-the-wire)
/// record: the fragment's own header plus the fragment bytes. Reassembly happens in
/// `fragment_buffer`; this type represents either a single fragment or, once
/// reassembled, the whole message with `fragment_offset = 0` and
/// `fragment_length == length`.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub header: HandshakeHeader,
    pub raw_body: BytesMut,
}

impl Handshake {
    pub fn marshal(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(HANDSHAKE_HEADER_LENGTH + self.raw_body.len());
        self.header.marshal(&mut out);
        out.extend_from_slice(&self.raw_body);
        out
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut rest = buf;
        let header = HandshakeHeader::unmarshal(&mut rest)?;
        if rest.len() < header.fragment_length as usize {
            return Err(Error::Other("truncated handshake body".to_owned()));
        }
        let raw_body = BytesMut::from(&rest[..header.fragment_length as usize]);
        Ok(Handshake { header, raw_body })
    }
}

/// Minimal fields the connector itself needs out of a `ClientHello`, without
/// understanding the rest of the TLS message body. Extracted by the handshaker (or, at
/// the cookie-verification boundary, by a small best-effort parser here) per the
/// contract in `spec.md` 4.4.
#[derive(Debug, Clone)]
pub struct ClientHelloSummary {
    pub client_version: (u8, u8),
    pub client_random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cookie: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
}

impl ClientHelloSummary {
    /// Parses the subset of a `ClientHello` body the connector needs for cookie
    /// verification and resumption lookup: `client_version(2) || random(32) ||
    /// session_id<0..32> || cookie<0..2^8-1> || cipher_suites<2..2^16-1> ||
    /// compression_methods<1..2^8-1>`. Extensions (including `max_fragment_length`)
    /// are intentionally not parsed here — that belongs to the handshaker.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut buf = body;
        if buf.len() < 34 {
            return Err(Error::Other("truncated client_hello".to_owned()));
        }
        let client_version = (buf[0], buf[1]);
        let mut client_random = [0u8; 32];
        client_random.copy_from_slice(&buf[2..34]);
        buf = &buf[34..];

        let session_id = read_vec8(&mut buf)?;
        let cookie = read_vec8(&mut buf)?;

        if buf.is_empty() {
            return Err(Error::Other("truncated client_hello cipher_suites".to_owned()));
        }
        let cs_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        buf.advance(2);
        if buf.len() < cs_len {
            return Err(Error::Other("truncated client_hello cipher_suites".to_owned()));
        }
        let cipher_suites = buf[..cs_len]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        buf.advance(cs_len);

        let compression_methods = read_vec8(&mut buf)?;

        Ok(ClientHelloSummary {
            client_version,
            client_random,
            session_id,
            cookie,
            cipher_suites,
            compression_methods,
        })
    }
}

fn read_vec8(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.is_empty() {
        return Err(Error::Other("truncated length-prefixed field".to_owned()));
    }
    let len = buf[0] as usize;
    buf.advance(1);
    if buf.len() < len {
        return Err(Error::Other("truncated length-prefixed field".to_owned()));
    }
    let v = buf[..len].to_vec();
    buf.advance(len);
    Ok(v)
}

#[cfg(test)]
mod handshake_test {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = HandshakeHeader {
            handshake_type: HandshakeType::ClientHello,
            length: 250,
            message_seq: 3,
            fragment_offset: 80,
            fragment_length: 120,
        };
        let mut out = BytesMut::new();
        header.marshal(&mut out);
        let mut slice = &out[..];
        let parsed = HandshakeHeader::unmarshal(&mut slice).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn client_hello_summary_parses_minimal_message() {
        let mut body = BytesMut::new();
        body.put_u8(254);
        body.put_u8(253);
        body.extend_from_slice(&[7u8; 32]);
        body.put_u8(0); // session_id len
        body.put_u8(4); // cookie len
        body.extend_from_slice(&[1, 2, 3, 4]);
        body.put_u16(2); // cipher suites len
        body.extend_from_slice(&[0xC0, 0x2B]);
        body.put_u8(1); // compression methods len
        body.put_u8(0);

        let summary = ClientHelloSummary::parse(&body).unwrap();
        assert_eq!(summary.cookie, vec![1, 2, 3, 4]);
        assert_eq!(summary.cipher_suites, vec![0xC02B]);
    }
}
