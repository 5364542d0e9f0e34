// Console protocol: envelope layout, typed events and wide-text helpers.

pub mod envelope;
pub mod event;
pub mod text;

pub use envelope::{
    RawEnvelope, ENVELOPE_SIZE, INPUT_CAPACITY, PATH_CAPACITY, PRINT_CAPACITY, PROTOCOL_VERSION,
    TITLE_CAPACITY,
};
pub use event::{
    ChoicePrompt, ConsoleEvent, EventKind, EventReply, ProgressEvent, ProgressOperation,
    ProgressSide, StdTransport, TransferProgress,
};
