//! The programmer operation set.
//!
//! Orchestration code (update/verify, the CLI) drives a programmer only
//! through this trait, never through backend types. Opening a device is the
//! one backend-specific step, done by the [`Session`] constructors.

pub use self::isp::Session;

mod isp;

use crate::error::EngineError;
use crate::part::{Memory, Part};

pub trait Programmer {
    /// Describes the connected programmer, one line per fact, each prefixed
    /// with `prefix`.
    fn display(&self, prefix: &str);

    /// Prepares the target for access. A no-op for these backends.
    fn enable(&mut self, part: &Part) -> Result<(), EngineError>;

    /// Enters programming mode by sweeping clock/timing setups until the
    /// target synchronizes. On failure no partial state is left behind; the
    /// caller decides whether to `disable` and `close`.
    fn initialize(&mut self, part: &Part) -> Result<(), EngineError>;

    /// One program-enable handshake, succeeding iff the sync byte echoed.
    fn program_enable(&mut self, part: &Part) -> Result<(), EngineError>;

    /// Erases flash and EEPROM, then re-enters programming mode.
    fn chip_erase(&mut self, part: &Part) -> Result<(), EngineError>;

    /// Exchanges one 4-byte ISP instruction.
    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4], EngineError>;

    /// Clocks `send` through the target's SPI, capturing into `recv`.
    /// Both buffers must have equal length.
    fn spi(&mut self, send: &[u8], recv: &mut [u8]) -> Result<(), EngineError>;

    /// Single-location read, authoritative without polling.
    fn read_byte(&mut self, mem: &Memory, addr: u32) -> Result<u8, EngineError>;

    /// Single-location write, settled by the memory's write delay.
    fn write_byte(&mut self, mem: &Memory, addr: u32, value: u8) -> Result<(), EngineError>;

    /// Reads `n_bytes` starting at `addr` into the memory's content buffer.
    fn paged_load(&mut self, mem: &mut Memory, addr: u32, n_bytes: u32)
        -> Result<(), EngineError>;

    /// Writes `n_bytes` of the memory's content buffer starting at the
    /// page-aligned `addr`, polling for write completion.
    fn paged_write(&mut self, mem: &mut Memory, addr: u32, n_bytes: u32)
        -> Result<(), EngineError>;

    /// Releases the target from reset, leaving programming mode.
    fn disable(&mut self);

    fn powerdown(&mut self);

    /// Releases the USB handle. Every later transfer fails fast.
    fn close(&mut self);
}
