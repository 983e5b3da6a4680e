pub mod message;

pub use message::{Attachment, Envelope, MessageKind};
