//! Length-prefixed frame transport.
//!
//! Every control-plane message travels as a length-prefixed protobuf
//! [`Envelope`] over TCP, via `LengthDelimitedCodec`.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::proto::{Envelope, Frame};
use super::ControlError;

/// Upper bound on a single frame; a batch of samples stays well below.
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// A framed control-plane connection.
pub struct FramedConn {
    inner: Framed<TcpStream, LengthDelimitedCodec>,
}

impl FramedConn {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        Self {
            inner: Framed::new(stream, codec),
        }
    }

    /// Sends one frame.
    pub async fn send(&mut self, frame: Frame) -> Result<(), ControlError> {
        let bytes = Envelope::of(frame).encode_to_vec();
        self.inner
            .send(bytes.into())
            .await
            .map_err(ControlError::Io)
    }

    /// Receives the next frame; `None` on orderly stream close.
    pub async fn recv(&mut self) -> Result<Option<Frame>, ControlError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(ControlError::Io(e)),
            Some(Ok(bytes)) => {
                let envelope = Envelope::decode(bytes.freeze()).map_err(ControlError::Decode)?;
                envelope
                    .frame
                    .map(Some)
                    .ok_or(ControlError::UnexpectedFrame("empty envelope"))
            }
        }
    }

    /// Splits the connection into independently owned halves so the send
    /// and receive directions can run as separate tasks.
    #[must_use]
    pub fn split(self) -> (FrameSink, FrameStream) {
        let (sink, stream) = self.inner.split();
        (FrameSink { inner: sink }, FrameStream { inner: stream })
    }
}

/// Send half of a split connection.
pub struct FrameSink {
    inner: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, bytes::Bytes>,
}

impl FrameSink {
    pub async fn send(&mut self, frame: Frame) -> Result<(), ControlError> {
        let bytes = Envelope::of(frame).encode_to_vec();
        self.inner
            .send(bytes.into())
            .await
            .map_err(ControlError::Io)
    }
}

/// Receive half of a split connection.
pub struct FrameStream {
    inner: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl FrameStream {
    pub async fn recv(&mut self) -> Result<Option<Frame>, ControlError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(ControlError::Io(e)),
            Some(Ok(bytes)) => {
                let envelope = Envelope::decode(bytes.freeze()).map_err(ControlError::Decode)?;
                envelope
                    .frame
                    .map(Some)
                    .ok_or(ControlError::UnexpectedFrame("empty envelope"))
            }
        }
    }
}
