pub mod composite;
pub mod registry;
pub mod rows;
pub mod scalar;

pub use registry::{CodecKind, CodecNode, CodecRef, CodecRegistry, DecodeOptions, FieldCodec};
pub use rows::{DecodedRows, RowDecoder};
pub use scalar::{ids, ScalarCodec};
