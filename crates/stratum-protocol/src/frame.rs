// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for stream framing.
//!
//! Every message travelling over a byte stream is wrapped in a frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: encoded [`WireMessage`]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{DecodeError, EncodeError, WireMessage};
use crate::replication::ErrorResponse;

/// Maximum frame size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// One-way subscription message, no response expected
    Subscription = 1,
    /// Request message
    Request = 2,
    /// Response message
    Response = 3,
    /// Error response
    Error = 4,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Subscription),
            2 => Ok(MessageType::Request),
            3 => Ok(MessageType::Response),
            4 => Ok(MessageType::Error),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("unexpected message type: {0:?}")]
    UnexpectedMessageType(MessageType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("message encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("remote error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new subscription frame
    pub fn subscription(payload: Bytes) -> Result<Self, FrameError> {
        Self::from_payload(MessageType::Subscription, payload)
    }

    /// Create a new request frame
    pub fn request<M: WireMessage>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    /// Create a new response frame
    pub fn response<M: WireMessage>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    /// Create a new error frame
    pub fn error(msg: &ErrorResponse) -> Result<Self, FrameError> {
        Self::new(MessageType::Error, msg)
    }

    /// Create a new frame with the given type and message
    pub fn new<M: WireMessage>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        Self::from_payload(message_type, msg.to_bytes()?)
    }

    /// Create a frame around an already encoded payload
    pub fn from_payload(message_type: MessageType, payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Decode the payload as a wire message
    pub fn decode<M: WireMessage>(&self) -> Result<M, FrameError> {
        Ok(M::decode(&mut self.payload.clone())?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: Bytes::from(payload),
    })
}

/// Framed codec for encoding/decoding frames on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Send a one-way subscription message
    pub async fn send_subscription(&mut self, payload: Bytes) -> Result<(), FrameError> {
        let frame = Frame::subscription(payload)?;
        self.write_frame(&frame).await
    }

    /// Send a response
    pub async fn respond<Resp: WireMessage>(&mut self, response: &Resp) -> Result<(), FrameError> {
        let frame = Frame::response(response)?;
        self.write_frame(&frame).await
    }

    /// Send an error response
    pub async fn respond_error(&mut self, error: &ErrorResponse) -> Result<(), FrameError> {
        let frame = Frame::error(error)?;
        self.write_frame(&frame).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Send a request and wait for a response
    pub async fn request<Req: WireMessage, Resp: WireMessage>(
        &mut self,
        request: &Req,
    ) -> Result<Resp, FrameError> {
        let frame = Frame::request(request)?;
        self.write_frame(&frame).await?;

        let response_frame = self.read_frame().await?;
        match response_frame.message_type {
            MessageType::Response => response_frame.decode(),
            MessageType::Error => {
                let error: ErrorResponse = response_frame.decode()?;
                Err(FrameError::Remote {
                    code: error.code,
                    message: error.message,
                })
            }
            other => Err(FrameError::UnexpectedMessageType(other)),
        }
    }
}
