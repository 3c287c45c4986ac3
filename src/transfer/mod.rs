//! The chunked transfer engine: operations, item flattening, and the
//! byte-stream endpoints ([`FileSink`] / [`FileSource`]).

pub mod item;
pub mod operation;
pub mod receive;
pub mod send;
pub mod sink;
pub mod source;

pub use item::{flatten, Item};
pub use operation::{Direction, OperationSnapshot, TransferStatus};
pub use receive::ReceivingOperation;
pub use send::SendingOperation;
pub use sink::FileSink;
pub use source::FileSource;

/// Payload bytes carried per wire chunk.
pub const CHUNK_SIZE: usize = 512 * 1024;
