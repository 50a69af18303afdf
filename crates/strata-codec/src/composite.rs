//! Wire layouts for tuples, records, arrays, sets, ranges and enumerations.
//! Children are reached through the registry so nesting depth is bounded
//! only by the descriptor.

use crate::registry::{CodecRef, CodecRegistry, DecodeOptions, FieldCodec};
use bytes::{BufMut, Bytes, BytesMut};
use strata_core::{Range, Record, StrataError, Value};
use strata_protocol::buffer::ReadBuffer;

pub const RANGE_EMPTY: u8 = 0x01;
pub const RANGE_LB_INC: u8 = 0x02;
pub const RANGE_UB_INC: u8 = 0x04;
pub const RANGE_LB_INF: u8 = 0x08;
pub const RANGE_UB_INF: u8 = 0x10;

fn mismatch(expected: &str, value: &Value) -> StrataError {
    StrataError::codec(format!("expected {expected}, got {}", value.kind()))
}

fn get_count(buf: &mut ReadBuffer, expected: usize, what: &str) -> Result<(), StrataError> {
    let count = buf.get_i32()?;
    if count < 0 || count as usize != expected {
        return Err(StrataError::codec(format!(
            "{what} has {count} elements on the wire, descriptor says {expected}"
        )));
    }
    Ok(())
}

fn put_count(buf: &mut BytesMut, count: usize) -> Result<(), StrataError> {
    let count = i32::try_from(count)
        .map_err(|_| StrataError::codec(format!("{count} elements is too many")))?;
    buf.put_i32(count);
    Ok(())
}

pub(crate) fn decode_tuple(
    registry: &CodecRegistry,
    elements: &[CodecRef],
    buf: &mut ReadBuffer,
    options: DecodeOptions,
) -> Result<Value, StrataError> {
    get_count(buf, elements.len(), "tuple")?;
    let mut values = Vec::with_capacity(elements.len());
    for codec in elements {
        let _reserved = buf.get_i32()?;
        let element = buf.get_element()?;
        values.push(registry.decode_element(*codec, element, options)?);
    }
    Ok(Value::Tuple(values))
}

pub(crate) fn encode_tuple(
    registry: &CodecRegistry,
    elements: &[CodecRef],
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), StrataError> {
    let values: &[Value] = match value {
        Value::Tuple(values) => values,
        Value::Nothing if elements.is_empty() => &[],
        other => return Err(mismatch("tuple", other)),
    };
    if values.len() != elements.len() {
        return Err(StrataError::codec(format!(
            "tuple expects {} elements, got {}",
            elements.len(),
            values.len()
        )));
    }
    put_count(buf, values.len())?;
    for (codec, value) in elements.iter().zip(values) {
        buf.put_i32(0);
        registry.encode_element(*codec, value, buf)?;
    }
    Ok(())
}

pub(crate) fn decode_record(
    registry: &CodecRegistry,
    fields: &[FieldCodec],
    buf: &mut ReadBuffer,
    options: DecodeOptions,
) -> Result<Value, StrataError> {
    get_count(buf, fields.len(), "record")?;
    let mut record = Record::new();
    for field in fields {
        let _reserved = buf.get_i32()?;
        let element = buf.get_element()?;
        let value = registry.decode_element(field.codec, element, options)?;
        if field.implicit && !options.include_implicit {
            continue;
        }
        record.fields.push((field.name.clone(), value));
    }
    Ok(Value::Record(record))
}

/// Fields are taken by name; the descriptor decides wire order.
pub(crate) fn encode_record(
    registry: &CodecRegistry,
    fields: &[FieldCodec],
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), StrataError> {
    let empty = Record::new();
    let record = match value {
        Value::Record(record) => record,
        Value::Nothing if fields.is_empty() => &empty,
        other => return Err(mismatch("record", other)),
    };
    if let Some(unknown) = record
        .names()
        .find(|name| !fields.iter().any(|f| f.name == *name))
    {
        return Err(StrataError::codec(format!("unknown field {unknown:?}")));
    }
    put_count(buf, fields.len())?;
    for field in fields {
        let value = record.get(&field.name).unwrap_or(&Value::Nothing);
        if field.required && value.is_nothing() {
            return Err(StrataError::codec(format!(
                "required field {:?} is missing",
                field.name
            )));
        }
        buf.put_i32(0);
        registry.encode_element(field.codec, value, buf)?;
    }
    Ok(())
}

/// Arrays and sets share a layout. Extra dimensions are flattened.
pub(crate) fn decode_array(
    registry: &CodecRegistry,
    element: CodecRef,
    buf: &mut ReadBuffer,
    options: DecodeOptions,
) -> Result<Vec<Value>, StrataError> {
    let ndims = buf.get_i32()?;
    let _flags = buf.get_i32()?;
    let _reserved = buf.get_i32()?;
    if ndims < 0 {
        return Err(StrataError::codec(format!("negative dimension count {ndims}")));
    }
    if ndims == 0 {
        return Ok(Vec::new());
    }
    let mut total: usize = 1;
    for _ in 0..ndims {
        let len = buf.get_i32()?;
        let _lower = buf.get_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| StrataError::codec(format!("negative dimension length {len}")))?;
        total = total
            .checked_mul(len)
            .ok_or_else(|| StrataError::codec("array dimensions overflow"))?;
    }
    // Each element needs at least its length prefix.
    if total > buf.remaining() / 4 {
        return Err(StrataError::codec(format!(
            "array claims {total} elements but only {} bytes follow",
            buf.remaining()
        )));
    }
    let mut values = Vec::with_capacity(total);
    for _ in 0..total {
        let payload = buf.get_element()?;
        values.push(registry.decode_element(element, payload, options)?);
    }
    Ok(values)
}

pub(crate) fn encode_array(
    registry: &CodecRegistry,
    element: CodecRef,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), StrataError> {
    let values = match value {
        Value::Array(values) | Value::Set(values) => values,
        other => return Err(mismatch("array or set", other)),
    };
    if values.is_empty() {
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_i32(0);
        return Ok(());
    }
    buf.put_i32(1);
    buf.put_i32(0);
    buf.put_i32(0);
    put_count(buf, values.len())?;
    buf.put_i32(1);
    for value in values {
        registry.encode_element(element, value, buf)?;
    }
    Ok(())
}

pub(crate) fn decode_range(
    registry: &CodecRegistry,
    element: CodecRef,
    buf: &mut ReadBuffer,
    options: DecodeOptions,
) -> Result<Value, StrataError> {
    let flags = buf.get_u8()?;
    if flags & RANGE_EMPTY != 0 {
        return Ok(Value::Range(Range::empty()));
    }
    let mut bound = |infinite: u8| -> Result<Option<Box<Value>>, StrataError> {
        if flags & infinite != 0 {
            return Ok(None);
        }
        let payload = buf
            .get_element()?
            .ok_or_else(|| StrataError::codec("range bound is NULL"))?;
        Ok(Some(Box::new(registry.decode(element, payload, options)?)))
    };
    let lower = bound(RANGE_LB_INF)?;
    let upper = bound(RANGE_UB_INF)?;
    Ok(Value::Range(Range {
        lower,
        upper,
        inc_lower: flags & RANGE_LB_INC != 0,
        inc_upper: flags & RANGE_UB_INC != 0,
        empty: false,
    }))
}

pub(crate) fn encode_range(
    registry: &CodecRegistry,
    element: CodecRef,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), StrataError> {
    let range = match value {
        Value::Range(range) => range,
        other => return Err(mismatch("range", other)),
    };
    if range.empty {
        buf.put_u8(RANGE_EMPTY);
        return Ok(());
    }
    let mut flags = 0;
    if range.inc_lower {
        flags |= RANGE_LB_INC;
    }
    if range.inc_upper {
        flags |= RANGE_UB_INC;
    }
    if range.lower.is_none() {
        flags |= RANGE_LB_INF;
    }
    if range.upper.is_none() {
        flags |= RANGE_UB_INF;
    }
    buf.put_u8(flags);
    for bound in [&range.lower, &range.upper].into_iter().flatten() {
        if bound.is_nothing() {
            return Err(StrataError::codec("range bound is NULL"));
        }
        registry.encode_element(element, bound, buf)?;
    }
    Ok(())
}

pub(crate) fn decode_enum(labels: &[String], payload: Bytes) -> Result<Value, StrataError> {
    let label = std::str::from_utf8(&payload)
        .map_err(|_| StrataError::codec("invalid UTF-8 in enum label"))?;
    if !labels.iter().any(|l| l == label) {
        return Err(StrataError::codec(format!("unknown enum label {label:?}")));
    }
    Ok(Value::Enum(label.to_string()))
}

pub(crate) fn encode_enum(
    labels: &[String],
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), StrataError> {
    let label = match value {
        Value::Enum(label) | Value::Str(label) => label,
        other => return Err(mismatch("enum label", other)),
    };
    if !labels.iter().any(|l| l == label) {
        return Err(StrataError::codec(format!(
            "{label:?} is not one of {labels:?}"
        )));
    }
    buf.extend_from_slice(label.as_bytes());
    Ok(())
}
