//! Stream demultiplexing for attached exec sessions
//!
//! The runtime multiplexes stdout and stderr over one connection using the
//! "stdcopy" framing: an 8 byte header `[stream, 0, 0, 0, len_be32]`
//! followed by `len` payload bytes. [`StdFrameCodec`] decodes that framing
//! into tagged [`Frame`]s, and [`Demultiplexer::split`] routes a tagged frame
//! stream into two independent channels.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::debug;

use super::error::{ExecError, Result};

const HEADER_LEN: usize = 8;

/// Logical channel a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// stdout (and stdin echo / console output)
    Primary,
    /// stderr
    Diagnostic,
}

/// One tagged payload from a multiplexed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub payload: Bytes,
}

impl Frame {
    pub fn primary(payload: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Primary,
            payload: payload.into(),
        }
    }

    pub fn diagnostic(payload: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Diagnostic,
            payload: payload.into(),
        }
    }
}

/// A multiplexed stream of tagged frames, ending when the remote command exits
pub type FrameStream = BoxStream<'static, Result<Frame>>;

/// Decoder for the runtime's stdcopy framing
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFrameCodec;

impl Decoder for StdFrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let channel = match src[0] {
                0 | 1 => Channel::Primary,
                2 => Channel::Diagnostic,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown stream type {} in frame header", other),
                    ))
                }
            };
            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let payload = src.split_to(len).freeze();

            // Empty frames carry nothing worth routing
            if payload.is_empty() {
                continue;
            }

            return Ok(Some(Frame { channel, payload }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        // The connection closed mid-frame; the remainder is unusable
        if !src.is_empty() {
            debug!(discarded_bytes = src.len(), "Discarding partial frame at end of stream");
            src.clear();
        }

        Ok(None)
    }
}

/// Decode a raw multiplexed byte stream into tagged frames
pub fn decode_frames<R>(reader: R) -> FrameStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    FramedRead::new(reader, StdFrameCodec)
        .map_err(|e| ExecError::Stream(e.to_string()))
        .boxed()
}

/// Receiving half of one demultiplexed channel
pub type ChannelReceiver = mpsc::UnboundedReceiver<Result<Bytes>>;

/// The two channels produced by [`Demultiplexer::split`]
#[derive(Debug)]
pub struct Demuxed {
    pub primary: ChannelReceiver,
    pub diagnostic: ChannelReceiver,
}

/// Routes a tagged frame stream into independent primary/diagnostic channels
pub struct Demultiplexer;

impl Demultiplexer {
    /// Split `frames` into two channels.
    ///
    /// Routing runs on its own task and both channels are unbounded, so a
    /// slow consumer on one side never holds back the other. When the frame
    /// stream fails, both channels receive the error and then close; when it
    /// ends, both close.
    pub fn split(mut frames: FrameStream) -> Demuxed {
        let (primary_tx, primary_rx) = mpsc::unbounded_channel();
        let (diagnostic_tx, diagnostic_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(item) = frames.next().await {
                match item {
                    Ok(frame) => {
                        let tx = match frame.channel {
                            Channel::Primary => &primary_tx,
                            Channel::Diagnostic => &diagnostic_tx,
                        };
                        // A dropped receiver only means nobody wants that side
                        let _ = tx.send(Ok(frame.payload));
                    }
                    Err(e) => {
                        let reason = match e {
                            ExecError::Stream(reason) => reason,
                            other => other.to_string(),
                        };
                        let _ = primary_tx.send(Err(ExecError::Stream(reason.clone())));
                        let _ = diagnostic_tx.send(Err(ExecError::Stream(reason)));
                        return;
                    }
                }
            }
        });

        Demuxed {
            primary: primary_rx,
            diagnostic: diagnostic_rx,
        }
    }
}

#[cfg(test)]
pub(crate) fn raw_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
