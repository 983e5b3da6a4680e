pub mod apps;
pub mod batcher;
pub mod config;
pub mod error;
pub mod logger;
pub mod schema;

pub use batcher::{BatchInfo, DispatchHandler, FlushReason, MessageBatcher};
pub use envelope::{Attachment, Envelope, MessageKind};
pub use error::BatcherError;
