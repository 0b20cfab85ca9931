use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::anyhow;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use hmq_codec::error::{DecodeError, SendFrameError};
use hmq_codec::{Frame, FrameCodec, HandshakeCodec, HmqCodec, HmqPacket};

use crate::error::HmqError;
use crate::{Builder, Error, Result};

pub struct Dispatcher<Io> {
    pub(crate) io: Framed<Io, HmqCodec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> Dispatcher<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        Dispatcher { io: Framed::new(io, HmqCodec::Handshake(HandshakeCodec)), remote_addr, cfg }
    }

    /// Waits for the client's `HMQP/2.1` magic, answers with the same eight
    /// bytes and switches the stream to frame mode. A mismatched magic closes
    /// the connection without a reply.
    #[inline]
    pub async fn hmq(mut self) -> Result<HmqStream<Io>> {
        let received = tokio::time::timeout(self.cfg.handshake_timeout, self.io.next())
            .await
            .map_err(|_| HmqError::ReadTimeout)?;
        match received {
            Some(Ok(HmqPacket::Handshake)) => {}
            Some(Err(e)) => return Err(anyhow!(e)),
            _ => return Err(anyhow!(DecodeError::InvalidProtocol)),
        }

        self.io.send(HmqPacket::Handshake).await?;
        *self.io.codec_mut() = HmqCodec::Frame(FrameCodec::new(self.cfg.max_frame_size));
        Ok(HmqStream { io: self.io, remote_addr: self.remote_addr, cfg: self.cfg })
    }
}

pub struct HmqStream<Io> {
    pub io: Framed<Io, HmqCodec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> HmqStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.cfg.send_timeout.is_zero() {
            self.io.send(HmqPacket::Frame(frame)).await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.cfg.send_timeout, self.io.send(HmqPacket::Frame(frame))).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(HmqError::SendFrame(SendFrameError::Encode(e))),
                Err(_) => Err(HmqError::WriteTimeout),
            }?;
            Ok(())
        }
    }

    #[inline]
    pub async fn flush(&mut self) -> Result<()> {
        if self.cfg.send_timeout.is_zero() {
            self.io.flush().await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.cfg.send_timeout, self.io.flush()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(HmqError::SendFrame(SendFrameError::Encode(e))),
                Err(_) => Err(HmqError::FlushTimeout),
            }?;
            Ok(())
        }
    }

    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        if self.cfg.send_timeout.is_zero() {
            self.io.close().await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.cfg.send_timeout, self.io.close()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(HmqError::Encode(e)),
                Err(_) => Err(HmqError::CloseTimeout),
            }?;
            Ok(())
        }
    }

    #[inline]
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<Frame>> {
        match tokio::time::timeout(tm, self.next()).await {
            Ok(Some(Ok(frame))) => Ok(Some(frame)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(HmqError::ReadTimeout.into()),
        }
    }
}

impl<Io> futures::Stream for HmqStream<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.io).poll_next(cx);
        Poll::Ready(match futures::ready!(next) {
            Some(Ok(HmqPacket::Frame(frame))) => Some(Ok(frame)),
            Some(Ok(HmqPacket::Handshake)) => {
                Some(Err(HmqError::Decode(DecodeError::MalformedFrame).into()))
            }
            Some(Err(e)) => Some(Err(Error::from(e))),
            None => None,
        })
    }
}
