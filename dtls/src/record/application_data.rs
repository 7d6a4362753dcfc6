use bytes::BytesMut;

/// Maximum application-layer payload the connector will enqueue, per `spec.md` 4.3
/// ("Message size limit").
pub const MAX_APPLICATION_DATA_LEN: usize = 16384;

#[derive(Debug, Clone)]
pub struct ApplicationData {
    pub data: BytesMut,
}
