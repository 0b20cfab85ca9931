use hmq_codec::error::{DecodeError, EncodeError, HandshakeError, ProtocolError, SendFrameError};

#[derive(Debug, thiserror::Error)]
pub enum HmqError {
    /// Handshake error
    #[error("Hmq handshake error: {}", _0)]
    Handshake(#[from] HandshakeError),
    #[error("Hmq protocol error: {}", _0)]
    Protocol(#[from] ProtocolError),
    /// Frame decoding error
    #[error("Decoding error: {0:?}")]
    Decode(#[from] DecodeError),
    /// Frame encoding error
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    /// Send frame error
    #[error("Hmq send frame error: {}", _0)]
    SendFrame(#[from] SendFrameError),
    /// Read timeout
    #[error("Read timeout")]
    ReadTimeout,
    /// Write timeout
    #[error("Write timeout")]
    WriteTimeout,
    /// Flush timeout
    #[error("Flush timeout")]
    FlushTimeout,
    /// Close timeout
    #[error("Close timeout")]
    CloseTimeout,
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("service unavailable")]
    ServiceUnavailable,
}
