use std::fmt;
use thiserror::Error;

pub type Result<T, E = StrataError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("framing error: {0}")]
    Framing(String),
    #[error("descriptor error: {0}")]
    Descriptor(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("protocol state error: {0}")]
    ProtocolState(String),
    #[error("server error: {0}")]
    Server(ServerError),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("config error: {0}")]
    Config(String),
}

impl StrataError {
    /// Whether this error leaves the connection unusable.
    ///
    /// Codec errors are reported as recoverable here; the connection decides
    /// whether a decode failure happened mid-stream and escalates it itself.
    pub fn is_fatal(&self) -> bool {
        match self {
            StrataError::Framing(_)
            | StrataError::Descriptor(_)
            | StrataError::Transport(_)
            | StrataError::Authentication(_)
            | StrataError::ConnectionClosed
            | StrataError::Cancelled => true,
            StrataError::Server(err) => err.is_fatal(),
            StrataError::Codec(_) | StrataError::ProtocolState(_) | StrataError::Config(_) => {
                false
            }
        }
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        StrataError::Framing(msg.into())
    }

    pub fn descriptor(msg: impl Into<String>) -> Self {
        StrataError::Descriptor(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        StrataError::Codec(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        StrataError::ProtocolState(msg.into())
    }
}

/// Severity levels carried by error and log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Severity(pub u8);

impl Severity {
    pub const DEBUG: Severity = Severity(20);
    pub const INFO: Severity = Severity(40);
    pub const NOTICE: Severity = Severity(60);
    pub const WARNING: Severity = Severity(80);
    pub const ERROR: Severity = Severity(120);
    pub const FATAL: Severity = Severity(200);
    pub const PANIC: Severity = Severity(255);

    pub fn is_fatal(self) -> bool {
        self >= Severity::FATAL
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            s if s >= Severity::PANIC => "PANIC",
            s if s >= Severity::FATAL => "FATAL",
            s if s >= Severity::ERROR => "ERROR",
            s if s >= Severity::WARNING => "WARNING",
            s if s >= Severity::NOTICE => "NOTICE",
            s if s >= Severity::INFO => "INFO",
            _ => "DEBUG",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: Severity,
    pub code: u32,
    pub message: String,
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl ServerError {
    /// Server signal that descriptors it handed out earlier no longer apply.
    pub const STALE_TYPE_DESCRIPTORS: u32 = 0x0503_0001;

    pub fn is_fatal(&self) -> bool {
        self.severity.is_fatal()
    }

    pub fn invalidates_type_cache(&self) -> bool {
        self.code == Self::STALE_TYPE_DESCRIPTORS
    }

    pub fn attribute(&self, key: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 0x{:08x}: {}", self.severity, self.code, self.message)
    }
}
