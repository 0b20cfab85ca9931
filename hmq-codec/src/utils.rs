use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};

macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

macro_rules! prim_enum {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident {
            $(
                $( #[$enum_item_attr:meta] )*
                $var:ident=$val:expr
            ),+
        }) => {
        $( #[$enum_attr] )*
        #[repr(u8)]
        #[derive(Debug, Eq, PartialEq, Copy, Clone, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(
                $( #[$enum_item_attr] )*
                $var = $val
            ),+
        }
        impl std::convert::TryFrom<u8> for $name {
            type Error = $crate::error::DecodeError;
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $($val => Ok($name::$var)),+
                    ,_ => Err($crate::error::DecodeError::UnsupportedFrameType)
                }
            }
        }
    };
}

pub(crate) trait Decode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;
}

impl Decode for u16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
        Ok(src.get_u16())
    }
}

impl Decode for u32 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
        Ok(src.get_u32())
    }
}

/// u16 length-prefixed byte run.
impl Decode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u16::decode(src)? as usize;
        ensure!(src.remaining() >= len, DecodeError::InvalidLength);
        Ok(src.split_to(len))
    }
}

impl Decode for ByteString {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ByteString::try_from(Bytes::decode(src)?).map_err(|_| DecodeError::Utf8Error)
    }
}

pub(crate) trait Encode {
    fn encoded_size(&self) -> usize;
    fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError>;
}

impl Encode for ByteString {
    fn encoded_size(&self) -> usize {
        2 + self.len()
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        ensure!(self.len() <= u16::MAX as usize, EncodeError::InvalidLength);
        dst.put_u16(self.len() as u16);
        dst.put_slice(self.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_length_prefixed() {
        let mut src = Bytes::from_static(b"\x00\x05hello");
        assert_eq!(ByteString::decode(&mut src).unwrap(), "hello");
        assert!(src.is_empty());

        let mut short = Bytes::from_static(b"\x00\x05hel");
        assert!(matches!(ByteString::decode(&mut short), Err(DecodeError::InvalidLength)));
    }

    #[test]
    fn encode_length_prefixed() {
        let mut dst = BytesMut::new();
        ByteString::from("abc").encode(&mut dst).unwrap();
        assert_eq!(dst.as_ref(), b"\x00\x03abc");
    }
}
