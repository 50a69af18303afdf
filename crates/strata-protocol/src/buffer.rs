use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_core::{StrataError, TypeId};

/// What a [`ReadBuffer`] is reading, which decides the error raised when it
/// runs short or finds malformed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferContext {
    Message,
    Descriptor,
    Value,
}

impl BufferContext {
    pub fn error(self, msg: impl Into<String>) -> StrataError {
        match self {
            BufferContext::Message => StrataError::Framing(msg.into()),
            BufferContext::Descriptor => StrataError::Descriptor(msg.into()),
            BufferContext::Value => StrataError::Codec(msg.into()),
        }
    }
}

/// Bounds-checked cursor over received bytes.
#[derive(Debug, Clone)]
pub struct ReadBuffer {
    buf: Bytes,
    context: BufferContext,
}

macro_rules! get_fixed {
    ($name:ident, $ty:ty, $getter:ident) => {
        pub fn $name(&mut self) -> Result<$ty, StrataError> {
            self.ensure(std::mem::size_of::<$ty>())?;
            Ok(self.buf.$getter())
        }
    };
}

impl ReadBuffer {
    pub fn new(buf: Bytes, context: BufferContext) -> Self {
        Self { buf, context }
    }

    pub fn for_message(buf: Bytes) -> Self {
        Self::new(buf, BufferContext::Message)
    }

    pub fn for_descriptor(buf: Bytes) -> Self {
        Self::new(buf, BufferContext::Descriptor)
    }

    pub fn for_value(buf: Bytes) -> Self {
        Self::new(buf, BufferContext::Value)
    }

    pub fn context(&self) -> BufferContext {
        self.context
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn error(&self, msg: impl Into<String>) -> StrataError {
        self.context.error(msg)
    }

    fn ensure(&self, needed: usize) -> Result<(), StrataError> {
        if self.buf.len() < needed {
            return Err(self.error(format!(
                "truncated input: needed {needed} bytes, {} remaining",
                self.buf.len()
            )));
        }
        Ok(())
    }

    get_fixed!(get_u8, u8, get_u8);
    get_fixed!(get_u16, u16, get_u16);
    get_fixed!(get_i16, i16, get_i16);
    get_fixed!(get_u32, u32, get_u32);
    get_fixed!(get_i32, i32, get_i32);
    get_fixed!(get_u64, u64, get_u64);
    get_fixed!(get_i64, i64, get_i64);
    get_fixed!(get_f32, f32, get_f32);
    get_fixed!(get_f64, f64, get_f64);

    pub fn get_uuid(&mut self) -> Result<TypeId, StrataError> {
        self.ensure(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(TypeId::from_bytes(raw))
    }

    pub fn take(&mut self, len: usize) -> Result<Bytes, StrataError> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Everything left in the buffer.
    pub fn take_rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// `u32` length followed by raw bytes.
    pub fn get_bytes(&mut self) -> Result<Bytes, StrataError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// `u32` length followed by UTF-8.
    pub fn get_string(&mut self) -> Result<String, StrataError> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| self.error("invalid UTF-8 in string"))
    }

    /// `i32` length (-1 for NULL) followed by the element payload.
    pub fn get_element(&mut self) -> Result<Option<Bytes>, StrataError> {
        let len = self.get_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(self.error(format!("invalid element length {len}")));
        }
        self.take(len as usize).map(Some)
    }

    pub fn get_annotations(&mut self) -> Result<Vec<(String, String)>, StrataError> {
        let count = self.get_u16()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = self.get_string()?;
            let value = self.get_string()?;
            out.push((name, value));
        }
        Ok(out)
    }

    /// Fails if anything is left over.
    pub fn finish(&self) -> Result<(), StrataError> {
        if !self.buf.is_empty() {
            return Err(self.error(format!("{} unexpected trailing bytes", self.buf.len())));
        }
        Ok(())
    }
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.extend_from_slice(value);
}

pub fn put_uuid(buf: &mut BytesMut, id: &TypeId) {
    buf.extend_from_slice(id.as_bytes());
}

pub fn put_annotations(buf: &mut BytesMut, annotations: &[(String, String)]) {
    buf.put_u16(annotations.len() as u16);
    for (name, value) in annotations {
        put_string(buf, name);
        put_string(buf, value);
    }
}

/// Reserves an `i32` length slot and returns its offset; pair with
/// [`finish_element`].
pub fn begin_element(buf: &mut BytesMut) -> usize {
    let at = buf.len();
    buf.put_i32(0);
    at
}

/// Back-patches the slot opened by [`begin_element`] with the payload length.
pub fn finish_element(buf: &mut BytesMut, at: usize) -> Result<(), StrataError> {
    let len = buf.len() - at - 4;
    let len = i32::try_from(len)
        .map_err(|_| StrataError::codec(format!("element of {len} bytes is too large")))?;
    buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

pub fn put_null_element(buf: &mut BytesMut) {
    buf.put_i32(-1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello");
        assert_eq!(&buf[..], b"\0\0\0\x05hello");
        let mut read = ReadBuffer::for_message(buf.freeze());
        assert_eq!(read.get_string().expect("string"), "hello");
        read.finish().expect("finish");
    }

    #[test]
    fn underflow_error_matches_context() {
        let mut read = ReadBuffer::for_descriptor(Bytes::from_static(&[0, 1]));
        assert!(matches!(read.get_u32(), Err(StrataError::Descriptor(_))));
        let mut read = ReadBuffer::for_value(Bytes::from_static(&[0, 1]));
        assert!(matches!(read.get_u32(), Err(StrataError::Codec(_))));
        let mut read = ReadBuffer::for_message(Bytes::from_static(&[0, 0, 0, 9, 1]));
        assert!(matches!(read.get_bytes(), Err(StrataError::Framing(_))));
    }

    #[test]
    fn elements_are_back_patched() {
        let mut buf = BytesMut::new();
        let at = begin_element(&mut buf);
        buf.extend_from_slice(b"abc");
        finish_element(&mut buf, at).expect("finish");
        put_null_element(&mut buf);
        let mut read = ReadBuffer::for_value(buf.freeze());
        assert_eq!(read.get_element().expect("element").as_deref(), Some(&b"abc"[..]));
        assert_eq!(read.get_element().expect("null"), None);
        assert!(read.is_empty());
    }

    #[test]
    fn negative_element_length_other_than_null_is_rejected() {
        let mut read = ReadBuffer::for_value(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFE]));
        assert!(matches!(read.get_element(), Err(StrataError::Codec(_))));
    }
}
