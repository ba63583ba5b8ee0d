pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod request;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use message::{Message, MessageError, MessageId};
pub use request::Request;
