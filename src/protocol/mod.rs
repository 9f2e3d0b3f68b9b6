pub mod codec;
pub mod command;
pub mod packet;

pub use command::{Command, Magic};
pub use packet::Packet;
