use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::types::{Frame, FrameFlags, MessageType, HMQ_MAGIC, PING, PONG};
use crate::utils::{Decode, Encode};

/// Upper bound for the header count field, a plausibility guard against
/// garbage input masquerading as a huge frame.
const MAX_HEADERS: u16 = 1024;

/// Codec for the 8-byte `HMQP/2.1` magic exchanged before any frame.
///
/// Like a version-probe codec it only lives for the first read/write of a
/// connection; afterwards the stream switches to [`FrameCodec`].
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = ();
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HMQ_MAGIC.len() {
            return Ok(None);
        }
        let magic = src.split_to(HMQ_MAGIC.len());
        ensure!(magic.as_ref() == HMQ_MAGIC, DecodeError::InvalidProtocol);
        Ok(Some(()))
    }
}

impl Encoder<()> for HandshakeCodec {
    type Error = EncodeError;

    fn encode(&mut self, _: (), dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(HMQ_MAGIC);
        Ok(())
    }
}

/// Frame codec.
///
/// Layout: `type u8, flags u8, ttl i8, content-type u16, message-id str16,
/// source str16, target str16, header-count u16 (name str16, value str16)*,
/// content-len u32, content`. PING and PONG are fixed 8-byte frames.
#[derive(Debug)]
pub struct FrameCodec {
    pub max_frame_size: u32,
}

impl FrameCodec {
    #[inline]
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    fn decode_frame(src: &mut Bytes) -> Result<Frame, DecodeError> {
        ensure!(src.remaining() >= 3, DecodeError::InvalidLength);
        let typ = MessageType::try_from(src.get_u8())?;
        let flags = FrameFlags::from_bits_truncate(src.get_u8());
        let ttl = src.get_u8() as i8;
        let content_type = u16::decode(src)?;
        let message_id = ByteString::decode(src)?;
        let source = ByteString::decode(src)?;
        let target = ByteString::decode(src)?;

        let header_count = u16::decode(src)?;
        ensure!(header_count <= MAX_HEADERS, DecodeError::MalformedFrame);
        let mut headers = Vec::with_capacity(header_count as usize);
        for _ in 0..header_count {
            let name = ByteString::decode(src)?;
            let value = ByteString::decode(src)?;
            headers.push((name, value));
        }

        let content_len = u32::decode(src)? as usize;
        ensure!(src.remaining() >= content_len, DecodeError::InvalidLength);
        let content = src.split_to(content_len);

        Ok(Frame { typ, flags, ttl, content_type, message_id, source, target, headers, content })
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let first = src[0];
        if first == MessageType::Ping as u8 || first == MessageType::Pong as u8 {
            if src.len() < PING.len() {
                return Ok(None);
            }
            let fixed = src.split_to(PING.len());
            ensure!(fixed[1] == 0xFF, DecodeError::MalformedFrame);
            return Ok(Some(if first == MessageType::Ping as u8 { Frame::ping() } else { Frame::pong() }));
        }

        // The layout has no total-length prefix, so a decode attempt runs on
        // a copy of the buffer; an underflow means wait for more bytes.
        let mut view = Bytes::copy_from_slice(src.as_ref());
        match Self::decode_frame(&mut view) {
            Ok(frame) => {
                let consumed = src.len() - view.remaining();
                src.advance(consumed);
                Ok(Some(frame))
            }
            Err(DecodeError::InvalidLength) => {
                ensure!(src.len() as u32 <= self.max_frame_size, DecodeError::MaxSizeExceeded);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = EncodeError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame.typ {
            MessageType::Ping => {
                dst.put_slice(&PING);
                return Ok(());
            }
            MessageType::Pong => {
                dst.put_slice(&PONG);
                return Ok(());
            }
            _ => {}
        }

        let mut size = 1 + 1 + 1 + 2;
        size += frame.message_id.encoded_size();
        size += frame.source.encoded_size();
        size += frame.target.encoded_size();
        size += 2;
        for (name, value) in &frame.headers {
            size += name.encoded_size() + value.encoded_size();
        }
        size += 4 + frame.content.len();
        ensure!(size as u64 <= self.max_frame_size as u64, EncodeError::OverMaxFrameSize);
        ensure!(frame.headers.len() <= MAX_HEADERS as usize, EncodeError::MalformedFrame);

        dst.reserve(size);
        dst.put_u8(frame.typ as u8);
        dst.put_u8(frame.flags.bits());
        dst.put_u8(frame.ttl as u8);
        dst.put_u16(frame.content_type);
        frame.message_id.encode(dst)?;
        frame.source.encode(dst)?;
        frame.target.encode(dst)?;
        dst.put_u16(frame.headers.len() as u16);
        for (name, value) in &frame.headers {
            name.encode(dst)?;
            value.encode(dst)?;
        }
        ensure!(frame.content.len() <= u32::MAX as usize, EncodeError::InvalidLength);
        dst.put_u32(frame.content.len() as u32);
        dst.put_slice(&frame.content);
        Ok(())
    }
}

/// Encodes a frame into a standalone byte buffer, used by the persistence
/// layer for log records.
pub fn frame_to_bytes(frame: &Frame) -> Result<Bytes, EncodeError> {
    let mut dst = BytesMut::new();
    FrameCodec::new(u32::MAX).encode(frame.clone(), &mut dst)?;
    Ok(dst.freeze())
}

/// Decodes a frame from a standalone byte buffer.
pub fn frame_from_bytes(src: &[u8]) -> Result<Frame, DecodeError> {
    let mut buf = BytesMut::from(src);
    match FrameCodec::new(u32::MAX).decode(&mut buf)? {
        Some(frame) if buf.is_empty() => Ok(frame),
        _ => Err(DecodeError::MalformedFrame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::headers;

    fn sample_frame() -> Frame {
        let mut f = Frame::new(MessageType::QueueMessage);
        f.flags = FrameFlags::HIGH_PRIORITY | FrameFlags::PENDING_ACKNOWLEDGE;
        f.ttl = 4;
        f.content_type = 1002;
        f.set_message_id("m-17").set_source("producer-1").set_target("push-a");
        f.push_header(headers::QUEUE_NAME, "push-a");
        f.set_content_string("Hello, World!");
        f
    }

    #[test]
    fn magic_roundtrip() {
        let mut dst = BytesMut::new();
        HandshakeCodec.encode((), &mut dst).unwrap();
        assert_eq!(dst.as_ref(), b"HMQP/2.1");

        let mut src = BytesMut::from(&b"HMQP/2.1"[..]);
        assert_eq!(HandshakeCodec.decode(&mut src).unwrap(), Some(()));

        let mut bad = BytesMut::from(&b"HMQP/1.0"[..]);
        assert!(matches!(HandshakeCodec.decode(&mut bad), Err(DecodeError::InvalidProtocol)));
    }

    #[test]
    fn ping_pong_fixed_bytes() {
        let mut dst = BytesMut::new();
        FrameCodec::new(1024).encode(Frame::ping(), &mut dst).unwrap();
        assert_eq!(dst.as_ref(), &[0x89, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

        dst.clear();
        FrameCodec::new(1024).encode(Frame::pong(), &mut dst).unwrap();
        assert_eq!(dst.as_ref(), &[0x8A, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

        let mut src = BytesMut::from(&[0x89u8, 0xFF, 0, 0, 0, 0, 0, 0][..]);
        let f = FrameCodec::new(1024).decode(&mut src).unwrap().unwrap();
        assert_eq!(f.typ, MessageType::Ping);
        assert!(src.is_empty());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = sample_frame();
        let mut codec = FrameCodec::new(64 * 1024);
        let mut dst = BytesMut::new();
        codec.encode(frame.clone(), &mut dst).unwrap();

        let decoded = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(dst.is_empty());
    }

    #[test]
    fn partial_input_waits_for_more() {
        let frame = sample_frame();
        let mut codec = FrameCodec::new(64 * 1024);
        let mut full = BytesMut::new();
        codec.encode(frame.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 5..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), frame);
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = FrameCodec::new(64 * 1024);
        let mut dst = BytesMut::new();
        codec.encode(sample_frame(), &mut dst).unwrap();
        codec.encode(Frame::ping(), &mut dst).unwrap();

        assert_eq!(codec.decode(&mut dst).unwrap().unwrap(), sample_frame());
        assert_eq!(codec.decode(&mut dst).unwrap().unwrap().typ, MessageType::Ping);
        assert!(codec.decode(&mut dst).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut frame = sample_frame();
        frame.set_content_bytes(vec![0u8; 4096]);
        let mut codec = FrameCodec::new(512);
        let mut dst = BytesMut::new();
        assert!(matches!(codec.encode(frame, &mut dst), Err(EncodeError::OverMaxFrameSize)));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let mut src = BytesMut::from(&[0x01u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameCodec::new(1024).decode(&mut src),
            Err(DecodeError::UnsupportedFrameType)
        ));
    }

    #[test]
    fn standalone_bytes_roundtrip() {
        let frame = sample_frame();
        let bytes = frame_to_bytes(&frame).unwrap();
        assert_eq!(frame_from_bytes(&bytes).unwrap(), frame);
    }
}
