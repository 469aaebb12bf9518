//! TLS-layer plumbing: record framing helpers, the fragmenting stream
//! adapter and the connector built on top of it.
//!
//! A TLS record is a 5-byte header (content type, legacy version, payload
//! length) followed by the payload. Consecutive handshake records are
//! reassembled by the peer (RFC 5246 §6.2.1, carried into TLS 1.3), which
//! is what makes re-framing the ClientHello as two records safe: any
//! conformant server reads the same handshake message, while a stateless
//! inspector that only parses the head of the connection sees a truncated
//! ClientHello with no usable SNI.

mod connector;
mod fragment;

pub(crate) use connector::connect_first_available;
pub use connector::{
    default_client_config, h2_client_config, insecure_client_config, FragmentedTlsStream,
    FragmentingConnector,
};
pub use fragment::FragmentStream;

/// Record header: content type (1), legacy version (2), payload length (2).
pub const TLS_RECORD_HEADER_LEN: usize = 5;

/// Content type of handshake records.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Payload bytes of the first handshake record to emit in the first write.
/// Empirically anything under the common DPI inspection window (~16 bytes
/// into the ClientHello payload) works; 4 leaves the inspector with not
/// even the handshake header length.
pub const DEFAULT_FIRST_FRAGMENT_LEN: u8 = 4;

/// A complete TLS record sitting at the front of `buf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub content_type: u8,
    pub version: [u8; 2],
    pub payload_len: usize,
}

impl RecordHeader {
    /// Parse the record header at the front of `buf`. Returns `None` when
    /// fewer than 5 bytes are available.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < TLS_RECORD_HEADER_LEN {
            return None;
        }
        Some(Self {
            content_type: buf[0],
            version: [buf[1], buf[2]],
            payload_len: u16::from_be_bytes([buf[3], buf[4]]) as usize,
        })
    }

    /// Whether `buf` holds this record's payload in full.
    pub fn is_complete_in(&self, buf: &[u8]) -> bool {
        buf.len() >= TLS_RECORD_HEADER_LEN + self.payload_len
    }

    /// Encode a header with the same content type and version but a new
    /// payload length.
    pub fn encode_with_len(&self, payload_len: usize) -> [u8; TLS_RECORD_HEADER_LEN] {
        let len = (payload_len as u16).to_be_bytes();
        [self.content_type, self.version[0], self.version[1], len[0], len[1]]
    }
}
