pub mod backend;
pub mod buffer;
pub mod descriptor;
pub mod frame;
pub mod frontend;
pub mod messages;

pub use backend::{Authentication, CommandDataDescription, LogMessage, ServerMessage};
pub use descriptor::{DescriptorKind, DescriptorTable, DescriptorWriter, TypeDescriptorNode};
pub use frame::{FrameStatus, Framer, Message, MessageCodec};
pub use frontend::ClientMessage;
pub use messages::{
    Capabilities, Cardinality, CommandParams, OutputFormat, ProtocolVersion, TransactionStatus,
    PROTOCOL_VERSION,
};
