mod buffer;
pub mod channel;
mod channel_table;
pub mod codec;
pub mod error;
pub mod message;
pub mod session;
mod window;

pub use channel::{Channel, Direction};
pub use codec::Codec;
pub use error::{QmuxError, Result};
pub use message::{Message, CHANNEL_MAX_PACKET, CHANNEL_WINDOW_SIZE};
pub use session::Session;
