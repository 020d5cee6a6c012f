//! AVR ISP programming over USB ISP 3.0 and MCU Pro programmers.

pub mod constants;
pub mod error;
pub mod flashing;
pub mod format;
pub mod opcode;
pub mod part;
pub mod programmer;
pub mod transport;

pub use self::error::{ChannelError, ConfigError, EngineError};
pub use self::flashing::Flashing;
pub use self::opcode::Opcode;
pub use self::part::{Part, PartDb};
pub use self::programmer::{Programmer, Session};
pub use self::transport::Channel;
