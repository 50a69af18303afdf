use strata_core::StrataError;

pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub fn is_supported(self) -> bool {
        self.major == PROTOCOL_VERSION.major
    }
}

/// Transaction state reported by ReadyForCommand.
/// - Idle: not in transaction block
/// - InTransaction: in transaction block (after START TRANSACTION)
/// - InFailedTransaction: must ROLLBACK before new commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    InFailedTransaction,
}

impl TransactionStatus {
    pub fn wire_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::InFailedTransaction => b'E',
        }
    }

    pub fn from_wire(byte: u8) -> Result<Self, StrataError> {
        match byte {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::InFailedTransaction),
            other => Err(StrataError::framing(format!(
                "unknown transaction state 0x{other:02x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputFormat {
    #[default]
    Binary,
    Json,
    JsonElements,
    None,
}

impl OutputFormat {
    pub fn wire_byte(self) -> u8 {
        match self {
            OutputFormat::Binary => b'b',
            OutputFormat::Json => b'j',
            OutputFormat::JsonElements => b'J',
            OutputFormat::None => b'n',
        }
    }

    pub fn from_wire(byte: u8) -> Result<Self, StrataError> {
        match byte {
            b'b' => Ok(OutputFormat::Binary),
            b'j' => Ok(OutputFormat::Json),
            b'J' => Ok(OutputFormat::JsonElements),
            b'n' => Ok(OutputFormat::None),
            other => Err(StrataError::framing(format!(
                "unknown output format 0x{other:02x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cardinality {
    NoResult,
    AtMostOne,
    One,
    #[default]
    Many,
    AtLeastOne,
}

impl Cardinality {
    pub fn wire_byte(self) -> u8 {
        match self {
            Cardinality::NoResult => b'n',
            Cardinality::AtMostOne => b'o',
            Cardinality::One => b'A',
            Cardinality::Many => b'm',
            Cardinality::AtLeastOne => b'M',
        }
    }

    pub fn from_wire(byte: u8) -> Result<Self, StrataError> {
        match byte {
            b'n' => Ok(Cardinality::NoResult),
            b'o' => Ok(Cardinality::AtMostOne),
            b'A' => Ok(Cardinality::One),
            b'm' => Ok(Cardinality::Many),
            b'M' => Ok(Cardinality::AtLeastOne),
            other => Err(StrataError::framing(format!(
                "unknown cardinality 0x{other:02x}"
            ))),
        }
    }

    /// At least one value must be present.
    pub fn is_required(self) -> bool {
        matches!(self, Cardinality::One | Cardinality::AtLeastOne)
    }
}

/// Bit set of side effects a command may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(pub u64);

impl Capabilities {
    pub const MODIFICATIONS: Capabilities = Capabilities(1 << 0);
    pub const SESSION_CONFIG: Capabilities = Capabilities(1 << 1);
    pub const TRANSACTION: Capabilities = Capabilities(1 << 2);
    pub const DDL: Capabilities = Capabilities(1 << 3);
    pub const PERSISTENT_CONFIG: Capabilities = Capabilities(1 << 4);
    pub const ALL: Capabilities = Capabilities(u64::MAX);
    pub const NONE: Capabilities = Capabilities(0);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self::Output {
        Capabilities(self.0 | rhs.0)
    }
}

/// Fields shared by Parse and Execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParams {
    pub annotations: Vec<(String, String)>,
    pub allowed_capabilities: Capabilities,
    pub compilation_flags: u64,
    pub implicit_limit: u64,
    pub output_format: OutputFormat,
    pub expected_cardinality: Cardinality,
    pub command_text: String,
}

impl CommandParams {
    pub fn new(command_text: impl Into<String>) -> Self {
        Self {
            annotations: Vec::new(),
            allowed_capabilities: Capabilities::ALL,
            compilation_flags: 0,
            implicit_limit: 0,
            output_format: OutputFormat::Binary,
            expected_cardinality: Cardinality::Many,
            command_text: command_text.into(),
        }
    }
}
