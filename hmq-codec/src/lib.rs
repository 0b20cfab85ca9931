#![deny(unsafe_code)]

#[macro_use]
mod utils;
pub mod codec;
pub mod error;
pub mod types;

pub use codec::{FrameCodec, HandshakeCodec};
pub use types::{Frame, FrameFlags, MessageType};

/// Combined codec used on a connection: the handshake codec accepts the
/// 8-byte `HMQP/2.1` magic, after which the stream switches to frames.
#[derive(Debug)]
pub enum HmqCodec {
    Handshake(HandshakeCodec),
    Frame(FrameCodec),
}

#[derive(Debug)]
pub enum HmqPacket {
    /// The protocol magic was received/should be sent.
    Handshake,
    Frame(Frame),
}

impl tokio_util::codec::Encoder<HmqPacket> for HmqCodec {
    type Error = error::EncodeError;

    #[inline]
    fn encode(&mut self, item: HmqPacket, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        match self {
            HmqCodec::Handshake(codec) => match item {
                HmqPacket::Handshake => codec.encode((), dst),
                HmqPacket::Frame(_) => Err(error::EncodeError::MalformedFrame),
            },
            HmqCodec::Frame(codec) => match item {
                HmqPacket::Frame(frame) => codec.encode(frame, dst),
                HmqPacket::Handshake => Err(error::EncodeError::MalformedFrame),
            },
        }
    }
}

impl tokio_util::codec::Decoder for HmqCodec {
    type Item = HmqPacket;
    type Error = error::DecodeError;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            HmqCodec::Handshake(codec) => Ok(codec.decode(src)?.map(|_| HmqPacket::Handshake)),
            HmqCodec::Frame(codec) => Ok(codec.decode(src)?.map(HmqPacket::Frame)),
        }
    }
}
