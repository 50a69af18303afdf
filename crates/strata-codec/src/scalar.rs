use bytes::{BufMut, Bytes, BytesMut};
use strata_core::{
    DateDuration, Datetime, Decimal, Duration, LocalDate, LocalDatetime, LocalTime,
    RelativeDuration, StrataError, TypeId, Value,
};
use strata_protocol::buffer::ReadBuffer;
use uuid::Uuid;

/// Well-known base scalar ids. These resolve without a descriptor entry.
pub mod ids {
    use strata_core::TypeId;

    pub const UUID: TypeId = TypeId::from_u128(0x100);
    pub const STR: TypeId = TypeId::from_u128(0x101);
    pub const BYTES: TypeId = TypeId::from_u128(0x102);
    pub const INT16: TypeId = TypeId::from_u128(0x103);
    pub const INT32: TypeId = TypeId::from_u128(0x104);
    pub const INT64: TypeId = TypeId::from_u128(0x105);
    pub const FLOAT32: TypeId = TypeId::from_u128(0x106);
    pub const FLOAT64: TypeId = TypeId::from_u128(0x107);
    pub const DECIMAL: TypeId = TypeId::from_u128(0x108);
    pub const BOOL: TypeId = TypeId::from_u128(0x109);
    pub const DATETIME: TypeId = TypeId::from_u128(0x10A);
    pub const LOCAL_DATETIME: TypeId = TypeId::from_u128(0x10B);
    pub const LOCAL_DATE: TypeId = TypeId::from_u128(0x10C);
    pub const LOCAL_TIME: TypeId = TypeId::from_u128(0x10D);
    pub const DURATION: TypeId = TypeId::from_u128(0x10E);
    pub const JSON: TypeId = TypeId::from_u128(0x10F);
    pub const BIGINT: TypeId = TypeId::from_u128(0x110);
    pub const RELATIVE_DURATION: TypeId = TypeId::from_u128(0x111);
    pub const DATE_DURATION: TypeId = TypeId::from_u128(0x112);
}

const DECIMAL_POSITIVE: u16 = 0x0000;
const DECIMAL_NEGATIVE: u16 = 0x4000;
const JSON_FORMAT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarCodec {
    Uuid,
    Str,
    Bytes,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Bool,
    Datetime,
    LocalDatetime,
    LocalDate,
    LocalTime,
    Duration,
    Json,
    BigInt,
    RelativeDuration,
    DateDuration,
}

impl ScalarCodec {
    pub const ALL: [ScalarCodec; 19] = [
        ScalarCodec::Uuid,
        ScalarCodec::Str,
        ScalarCodec::Bytes,
        ScalarCodec::Int16,
        ScalarCodec::Int32,
        ScalarCodec::Int64,
        ScalarCodec::Float32,
        ScalarCodec::Float64,
        ScalarCodec::Decimal,
        ScalarCodec::Bool,
        ScalarCodec::Datetime,
        ScalarCodec::LocalDatetime,
        ScalarCodec::LocalDate,
        ScalarCodec::LocalTime,
        ScalarCodec::Duration,
        ScalarCodec::Json,
        ScalarCodec::BigInt,
        ScalarCodec::RelativeDuration,
        ScalarCodec::DateDuration,
    ];

    pub fn from_type_id(id: &TypeId) -> Option<Self> {
        Self::ALL.into_iter().find(|codec| codec.type_id() == *id)
    }

    pub fn type_id(self) -> TypeId {
        match self {
            ScalarCodec::Uuid => ids::UUID,
            ScalarCodec::Str => ids::STR,
            ScalarCodec::Bytes => ids::BYTES,
            ScalarCodec::Int16 => ids::INT16,
            ScalarCodec::Int32 => ids::INT32,
            ScalarCodec::Int64 => ids::INT64,
            ScalarCodec::Float32 => ids::FLOAT32,
            ScalarCodec::Float64 => ids::FLOAT64,
            ScalarCodec::Decimal => ids::DECIMAL,
            ScalarCodec::Bool => ids::BOOL,
            ScalarCodec::Datetime => ids::DATETIME,
            ScalarCodec::LocalDatetime => ids::LOCAL_DATETIME,
            ScalarCodec::LocalDate => ids::LOCAL_DATE,
            ScalarCodec::LocalTime => ids::LOCAL_TIME,
            ScalarCodec::Duration => ids::DURATION,
            ScalarCodec::Json => ids::JSON,
            ScalarCodec::BigInt => ids::BIGINT,
            ScalarCodec::RelativeDuration => ids::RELATIVE_DURATION,
            ScalarCodec::DateDuration => ids::DATE_DURATION,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarCodec::Uuid => "uuid",
            ScalarCodec::Str => "str",
            ScalarCodec::Bytes => "bytes",
            ScalarCodec::Int16 => "int16",
            ScalarCodec::Int32 => "int32",
            ScalarCodec::Int64 => "int64",
            ScalarCodec::Float32 => "float32",
            ScalarCodec::Float64 => "float64",
            ScalarCodec::Decimal => "decimal",
            ScalarCodec::Bool => "bool",
            ScalarCodec::Datetime => "datetime",
            ScalarCodec::LocalDatetime => "local_datetime",
            ScalarCodec::LocalDate => "local_date",
            ScalarCodec::LocalTime => "local_time",
            ScalarCodec::Duration => "duration",
            ScalarCodec::Json => "json",
            ScalarCodec::BigInt => "bigint",
            ScalarCodec::RelativeDuration => "relative_duration",
            ScalarCodec::DateDuration => "date_duration",
        }
    }

    /// Decodes one element payload. The payload must be consumed exactly.
    pub fn decode(self, payload: Bytes) -> Result<Value, StrataError> {
        let mut buf = ReadBuffer::for_value(payload);
        let value = match self {
            ScalarCodec::Uuid => {
                let raw = buf.take(16)?;
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&raw);
                Value::Uuid(Uuid::from_bytes(bytes))
            }
            ScalarCodec::Str => Value::Str(utf8(buf.take_rest())?),
            ScalarCodec::Bytes => Value::Bytes(buf.take_rest().to_vec()),
            ScalarCodec::Int16 => Value::Int16(buf.get_i16()?),
            ScalarCodec::Int32 => Value::Int32(buf.get_i32()?),
            ScalarCodec::Int64 => Value::Int64(buf.get_i64()?),
            ScalarCodec::Float32 => Value::Float32(buf.get_f32()?),
            ScalarCodec::Float64 => Value::Float64(buf.get_f64()?),
            ScalarCodec::Decimal => Value::Decimal(decode_decimal(&mut buf)?),
            ScalarCodec::BigInt => {
                let value = decode_decimal(&mut buf)?;
                if value.scale() != 0 {
                    return Err(StrataError::codec(format!(
                        "bigint with fractional scale {}",
                        value.scale()
                    )));
                }
                Value::BigInt(value)
            }
            ScalarCodec::Bool => match buf.get_u8()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(StrataError::codec(format!("invalid bool byte 0x{other:02x}")))
                }
            },
            ScalarCodec::Datetime => Value::Datetime(Datetime::from_micros(buf.get_i64()?)),
            ScalarCodec::LocalDatetime => {
                Value::LocalDatetime(LocalDatetime::from_micros(buf.get_i64()?))
            }
            ScalarCodec::LocalDate => Value::LocalDate(LocalDate::from_days(buf.get_i32()?)),
            ScalarCodec::LocalTime => {
                let micros = buf.get_i64()?;
                let time = LocalTime::from_micros(micros).ok_or_else(|| {
                    StrataError::codec(format!("local time {micros}us is outside one day"))
                })?;
                Value::LocalTime(time)
            }
            ScalarCodec::Duration => {
                let micros = buf.get_i64()?;
                let days = buf.get_i32()?;
                let months = buf.get_i32()?;
                if days != 0 || months != 0 {
                    return Err(StrataError::codec(
                        "duration carries calendar days or months",
                    ));
                }
                Value::Duration(Duration::from_micros(micros))
            }
            ScalarCodec::RelativeDuration => Value::RelativeDuration(RelativeDuration {
                micros: buf.get_i64()?,
                days: buf.get_i32()?,
                months: buf.get_i32()?,
            }),
            ScalarCodec::DateDuration => {
                let micros = buf.get_i64()?;
                if micros != 0 {
                    return Err(StrataError::codec("date duration carries a time part"));
                }
                Value::DateDuration(DateDuration {
                    days: buf.get_i32()?,
                    months: buf.get_i32()?,
                })
            }
            ScalarCodec::Json => {
                let format = buf.get_u8()?;
                if format != JSON_FORMAT {
                    return Err(StrataError::codec(format!(
                        "unsupported json format {format}"
                    )));
                }
                Value::Json(utf8(buf.take_rest())?)
            }
        };
        buf.finish()?;
        Ok(value)
    }

    /// Appends the payload of `value`, without the element length prefix.
    pub fn encode(self, buf: &mut BytesMut, value: &Value) -> Result<(), StrataError> {
        match (self, value) {
            (ScalarCodec::Uuid, Value::Uuid(id)) => buf.extend_from_slice(id.as_bytes()),
            (ScalarCodec::Str, Value::Str(s)) => buf.extend_from_slice(s.as_bytes()),
            (ScalarCodec::Bytes, Value::Bytes(b)) => buf.extend_from_slice(b),
            (ScalarCodec::Int16, _) => {
                let v = self.integer(value)?;
                let v = i16::try_from(v).map_err(|_| self.out_of_range(v))?;
                buf.put_i16(v);
            }
            (ScalarCodec::Int32, _) => {
                let v = self.integer(value)?;
                let v = i32::try_from(v).map_err(|_| self.out_of_range(v))?;
                buf.put_i32(v);
            }
            (ScalarCodec::Int64, _) => buf.put_i64(self.integer(value)?),
            (ScalarCodec::Float32, Value::Float32(v)) => buf.put_f32(*v),
            (ScalarCodec::Float64, Value::Float64(v)) => buf.put_f64(*v),
            (ScalarCodec::Float64, Value::Float32(v)) => buf.put_f64(f64::from(*v)),
            (ScalarCodec::Decimal, Value::Decimal(d) | Value::BigInt(d)) => encode_decimal(buf, d),
            (ScalarCodec::Decimal, Value::Int16(_) | Value::Int32(_) | Value::Int64(_)) => {
                encode_decimal(buf, &Decimal::from(self.integer(value)?))
            }
            (ScalarCodec::BigInt, Value::BigInt(d) | Value::Decimal(d)) => {
                if !d.is_integer() {
                    return Err(StrataError::codec(format!("{d} is not an integer")));
                }
                encode_decimal(buf, d)
            }
            (ScalarCodec::BigInt, Value::Int16(_) | Value::Int32(_) | Value::Int64(_)) => {
                encode_decimal(buf, &Decimal::from(self.integer(value)?))
            }
            (ScalarCodec::Bool, Value::Bool(v)) => buf.put_u8(u8::from(*v)),
            (ScalarCodec::Datetime, Value::Datetime(v)) => buf.put_i64(v.micros()),
            (ScalarCodec::LocalDatetime, Value::LocalDatetime(v)) => buf.put_i64(v.micros()),
            (ScalarCodec::LocalDate, Value::LocalDate(v)) => buf.put_i32(v.days()),
            (ScalarCodec::LocalTime, Value::LocalTime(v)) => buf.put_i64(v.micros()),
            (ScalarCodec::Duration, Value::Duration(v)) => {
                buf.put_i64(v.micros());
                buf.put_i32(0);
                buf.put_i32(0);
            }
            (ScalarCodec::RelativeDuration, Value::RelativeDuration(v)) => {
                buf.put_i64(v.micros);
                buf.put_i32(v.days);
                buf.put_i32(v.months);
            }
            (ScalarCodec::DateDuration, Value::DateDuration(v)) => {
                buf.put_i64(0);
                buf.put_i32(v.days);
                buf.put_i32(v.months);
            }
            (ScalarCodec::Json, Value::Json(text)) => {
                buf.put_u8(JSON_FORMAT);
                buf.extend_from_slice(text.as_bytes());
            }
            (_, other) => return Err(self.mismatch(other)),
        }
        Ok(())
    }

    fn integer(self, value: &Value) -> Result<i64, StrataError> {
        match value {
            Value::Int16(v) => Ok(i64::from(*v)),
            Value::Int32(v) => Ok(i64::from(*v)),
            Value::Int64(v) => Ok(*v),
            other => Err(self.mismatch(other)),
        }
    }

    fn out_of_range(self, v: i64) -> StrataError {
        StrataError::codec(format!("{v} does not fit in {}", self.name()))
    }

    fn mismatch(self, value: &Value) -> StrataError {
        StrataError::codec(format!(
            "cannot encode {} value as {}",
            value.kind(),
            self.name()
        ))
    }
}

fn utf8(raw: Bytes) -> Result<String, StrataError> {
    String::from_utf8(raw.to_vec()).map_err(|_| StrataError::codec("invalid UTF-8 in str value"))
}

fn decode_decimal(buf: &mut ReadBuffer) -> Result<Decimal, StrataError> {
    let ndigits = buf.get_u16()?;
    let weight = buf.get_i16()?;
    let negative = match buf.get_u16()? {
        DECIMAL_POSITIVE => false,
        DECIMAL_NEGATIVE => true,
        other => {
            return Err(StrataError::codec(format!(
                "unsupported decimal sign 0x{other:04x}"
            )))
        }
    };
    let scale = buf.get_u16()?;
    let mut digits = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        digits.push(buf.get_u16()?);
    }
    Decimal::from_parts(negative, weight, scale, digits)
}

fn encode_decimal(buf: &mut BytesMut, value: &Decimal) {
    let digits = value.digits();
    buf.put_u16(digits.len() as u16);
    buf.put_i16(value.weight());
    buf.put_u16(if value.is_negative() {
        DECIMAL_NEGATIVE
    } else {
        DECIMAL_POSITIVE
    });
    buf.put_u16(value.scale());
    for digit in digits {
        buf.put_u16(*digit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: ScalarCodec, value: Value) -> Value {
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &value).expect("encode");
        codec.decode(buf.freeze()).expect("decode")
    }

    #[test]
    fn integer_boundaries_survive() {
        for v in [i16::MIN, -1, 0, i16::MAX] {
            assert_eq!(round_trip(ScalarCodec::Int16, Value::Int16(v)), Value::Int16(v));
        }
        for v in [i32::MIN, i32::MAX] {
            assert_eq!(round_trip(ScalarCodec::Int32, Value::Int32(v)), Value::Int32(v));
        }
        for v in [i64::MIN, i64::MAX] {
            assert_eq!(round_trip(ScalarCodec::Int64, Value::Int64(v)), Value::Int64(v));
        }
    }

    #[test]
    fn narrower_integers_widen_but_never_truncate() {
        assert_eq!(round_trip(ScalarCodec::Int64, Value::Int16(-7)), Value::Int64(-7));
        let mut buf = BytesMut::new();
        let err = ScalarCodec::Int16
            .encode(&mut buf, &Value::Int64(40_000))
            .expect_err("overflow");
        assert!(matches!(err, StrataError::Codec(_)));
    }

    #[test]
    fn int64_wire_layout_is_big_endian() {
        let mut buf = BytesMut::new();
        ScalarCodec::Int64.encode(&mut buf, &Value::Int64(7)).expect("encode");
        assert_eq!(&buf[..], &[0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn float_specials_round_trip() {
        let nan = round_trip(ScalarCodec::Float64, Value::Float64(f64::NAN));
        assert!(matches!(nan, Value::Float64(v) if v.is_nan()));
        assert_eq!(
            round_trip(ScalarCodec::Float32, Value::Float32(f32::NEG_INFINITY)),
            Value::Float32(f32::NEG_INFINITY)
        );
    }

    #[test]
    fn bool_rejects_other_bytes() {
        assert!(ScalarCodec::Bool.decode(Bytes::from_static(&[2])).is_err());
        assert_eq!(
            ScalarCodec::Bool.decode(Bytes::from_static(&[1])).expect("bool"),
            Value::Bool(true)
        );
    }

    #[test]
    fn str_edges() {
        assert_eq!(round_trip(ScalarCodec::Str, Value::from("")), Value::from(""));
        assert_eq!(round_trip(ScalarCodec::Str, Value::from("héllo ✓")), Value::from("héllo ✓"));
        assert!(ScalarCodec::Str.decode(Bytes::from_static(&[0xFF, 0xFE])).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let err = ScalarCodec::Int32
            .decode(Bytes::from_static(&[0, 0, 0, 1, 9]))
            .expect_err("trailing");
        assert!(matches!(err, StrataError::Codec(_)));
        assert!(ScalarCodec::Uuid.decode(Bytes::from_static(&[0; 15])).is_err());
    }

    #[test]
    fn decimal_wire_layout() {
        let value: Decimal = "-12345.678".parse().expect("parse");
        let mut buf = BytesMut::new();
        ScalarCodec::Decimal
            .encode(&mut buf, &Value::Decimal(value.clone()))
            .expect("encode");
        // 1 2345 . 6780
        assert_eq!(
            &buf[..],
            &[0, 3, 0, 1, 0x40, 0, 0, 3, 0, 1, 0x09, 0x29, 0x1A, 0x7C]
        );
        assert_eq!(
            ScalarCodec::Decimal.decode(buf.freeze()).expect("decode"),
            Value::Decimal(value)
        );
    }

    #[test]
    fn decimal_weight_underflow_is_an_error() {
        // two groups, weight i16::MIN, leading zero group
        let wire: &'static [u8] = &[0, 2, 0x80, 0x00, 0, 0, 0, 0, 0, 0, 0, 5];
        let err = ScalarCodec::Decimal
            .decode(Bytes::from_static(wire))
            .expect_err("weight must not wrap");
        assert!(matches!(err, StrataError::Codec(_)));
    }

    #[test]
    fn bigint_refuses_fractions() {
        let value: Decimal = "1.5".parse().expect("parse");
        let mut buf = BytesMut::new();
        assert!(ScalarCodec::BigInt
            .encode(&mut buf, &Value::Decimal(value))
            .is_err());
        let big: Decimal = "-100000000000000000000".parse().expect("parse");
        assert_eq!(
            round_trip(ScalarCodec::BigInt, Value::BigInt(big.clone())),
            Value::BigInt(big)
        );
    }

    #[test]
    fn temporal_values_round_trip() {
        let cases = [
            (ScalarCodec::Datetime, Value::Datetime(Datetime::from_micros(-1))),
            (
                ScalarCodec::LocalDatetime,
                Value::LocalDatetime(LocalDatetime::from_micros(i64::MAX)),
            ),
            (ScalarCodec::LocalDate, Value::LocalDate(LocalDate::from_days(-730_000))),
            (
                ScalarCodec::Duration,
                Value::Duration(Duration::from_micros(-3_600_000_000)),
            ),
            (
                ScalarCodec::RelativeDuration,
                Value::RelativeDuration(RelativeDuration {
                    micros: 1,
                    days: -2,
                    months: 14,
                }),
            ),
            (
                ScalarCodec::DateDuration,
                Value::DateDuration(DateDuration { days: 3, months: 1 }),
            ),
        ];
        for (codec, value) in cases {
            assert_eq!(round_trip(codec, value.clone()), value, "{}", codec.name());
        }
    }

    #[test]
    fn local_time_bounds_are_checked() {
        let last = LocalTime::from_micros(86_399_999_999).expect("last micro");
        assert_eq!(
            round_trip(ScalarCodec::LocalTime, Value::LocalTime(last)),
            Value::LocalTime(last)
        );
        let wire = 86_400_000_000i64.to_be_bytes();
        assert!(ScalarCodec::LocalTime
            .decode(Bytes::copy_from_slice(&wire))
            .is_err());
    }

    #[test]
    fn duration_with_months_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_i64(5);
        raw.put_i32(0);
        raw.put_i32(1);
        assert!(ScalarCodec::Duration.decode(raw.freeze()).is_err());
    }

    #[test]
    fn json_requires_format_one() {
        let mut buf = BytesMut::new();
        ScalarCodec::Json
            .encode(&mut buf, &Value::Json("{\"a\":1}".into()))
            .expect("encode");
        assert_eq!(buf[0], 1);
        assert_eq!(
            ScalarCodec::Json.decode(buf.freeze()).expect("decode"),
            Value::Json("{\"a\":1}".into())
        );
        assert!(ScalarCodec::Json
            .decode(Bytes::from_static(b"\x02{}"))
            .is_err());
    }

    #[test]
    fn mismatched_value_is_a_codec_error() {
        let mut buf = BytesMut::new();
        let err = ScalarCodec::Uuid
            .encode(&mut buf, &Value::from("not a uuid"))
            .expect_err("mismatch");
        assert!(matches!(err, StrataError::Codec(_)));
        assert!(ScalarCodec::Str.encode(&mut buf, &Value::Nothing).is_err());
    }

    #[test]
    fn well_known_ids_resolve() {
        assert_eq!(ScalarCodec::from_type_id(&ids::INT64), Some(ScalarCodec::Int64));
        assert_eq!(
            ScalarCodec::from_type_id(&ids::DATE_DURATION),
            Some(ScalarCodec::DateDuration)
        );
        assert_eq!(ScalarCodec::from_type_id(&TypeId::NULL), None);
        for codec in ScalarCodec::ALL {
            assert_eq!(ScalarCodec::from_type_id(&codec.type_id()), Some(codec));
        }
    }
}
