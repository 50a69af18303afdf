pub mod decimal;
pub mod error;
pub mod temporal;
pub mod types;

pub use decimal::Decimal;
pub use error::{Result, ServerError, Severity, StrataError};
pub use temporal::{
    DateDuration, Datetime, Duration, LocalDate, LocalDatetime, LocalTime, RelativeDuration,
};
pub use types::{Range, Record, TypeId, Value};
