use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_core::StrataError;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Maximum message size in bytes (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Tag byte plus the length field.
pub const HEADER_LEN: usize = 5;

/// One length-delimited unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u8,
    pub body: Bytes,
}

impl Message {
    pub fn new(tag: u8, body: impl Into<Bytes>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    /// Value of the length field: the body plus the field itself.
    pub fn wire_len(&self) -> usize {
        self.body.len() + 4
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Message(Message),
    /// Not enough bytes buffered yet; nothing was consumed.
    NeedMoreData,
}

#[derive(Debug, Clone, Copy)]
pub struct Framer {
    max_message_size: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn read_next(&self, src: &mut BytesMut) -> Result<FrameStatus, StrataError> {
        if src.len() < HEADER_LEN {
            return Ok(FrameStatus::NeedMoreData);
        }
        // Peek at the length (bytes 1-4, don't consume yet)
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len < 4 {
            return Err(StrataError::framing(format!(
                "declared length {len} is smaller than the length field"
            )));
        }
        if len > self.max_message_size {
            return Err(StrataError::framing(format!(
                "declared length {len} exceeds maximum of {}",
                self.max_message_size
            )));
        }
        if src.len() < 1 + len {
            return Ok(FrameStatus::NeedMoreData);
        }
        let tag = src.get_u8();
        src.advance(4);
        let body = src.split_to(len - 4).freeze();
        trace!(tag = %char::from(tag), len, "frame received");
        Ok(FrameStatus::Message(Message { tag, body }))
    }

    pub fn write(&self, dst: &mut BytesMut, tag: u8, body: &[u8]) -> Result<(), StrataError> {
        let len = body.len() + 4;
        if len > self.max_message_size {
            return Err(StrataError::framing(format!(
                "outgoing message of {len} bytes exceeds maximum of {}",
                self.max_message_size
            )));
        }
        dst.reserve(1 + len);
        dst.put_u8(tag);
        dst.put_u32(len as u32);
        dst.extend_from_slice(body);
        trace!(tag = %char::from(tag), len, "frame queued");
        Ok(())
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Framer`] adapted to `tokio_util` so a transport can be wrapped in
/// `Framed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec {
    framer: Framer,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            framer: Framer::with_max_message_size(max_message_size),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.framer.max_message_size()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = StrataError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framer.read_next(src)? {
            FrameStatus::Message(msg) => Ok(Some(msg)),
            FrameStatus::NeedMoreData => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(StrataError::framing(format!(
                "stream ended inside a message ({} bytes buffered)",
                src.len()
            ))),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = StrataError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.framer.write(dst, item.tag, &item.body)
    }
}
