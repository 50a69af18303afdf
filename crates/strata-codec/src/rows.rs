use crate::registry::{CodecRef, CodecRegistry, DecodeOptions};
use bytes::Bytes;
use strata_core::{StrataError, Value};

/// Decodes Data payloads with a command's output codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowDecoder {
    codec: CodecRef,
    options: DecodeOptions,
}

impl RowDecoder {
    pub fn new(codec: CodecRef, options: DecodeOptions) -> Self {
        Self { codec, options }
    }

    pub fn codec(&self) -> CodecRef {
        self.codec
    }

    pub fn options(&self) -> DecodeOptions {
        self.options
    }

    pub fn decode(&self, registry: &CodecRegistry, payload: Bytes) -> Result<Value, StrataError> {
        registry.decode(self.codec, payload, self.options)
    }

    pub fn rows<'a, I>(&self, registry: &'a CodecRegistry, payloads: I) -> DecodedRows<'a, I::IntoIter>
    where
        I: IntoIterator<Item = Bytes>,
    {
        DecodedRows {
            registry,
            decoder: *self,
            payloads: payloads.into_iter(),
            failed: false,
        }
    }
}

/// Lazy, forward-only rows over buffered payloads. Yields nothing more after
/// the first error.
#[derive(Debug)]
pub struct DecodedRows<'a, I> {
    registry: &'a CodecRegistry,
    decoder: RowDecoder,
    payloads: I,
    failed: bool,
}

impl<I> Iterator for DecodedRows<'_, I>
where
    I: Iterator<Item = Bytes>,
{
    type Item = Result<Value, StrataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let payload = self.payloads.next()?;
        let row = self.decoder.decode(self.registry, payload);
        if row.is_err() {
            self.failed = true;
        }
        Some(row)
    }
}
