pub mod message;
pub mod sequence;

pub use message::{Message, MessageKind};
pub use sequence::MessageSequence;
