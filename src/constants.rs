
/// USB wire packet size, fixed by the programmer firmware for both directions.
pub const MAX_PACKET_SIZE: usize = 64;

/// Largest SPI payload carried by a single 0x24 exchange packet
/// (subcommand byte, length byte, two reserved bytes, payload).
pub const MAX_SPI_EXCHANGE: usize = MAX_PACKET_SIZE - 4;

/// Number of (clock speed, timing) setups tried while entering program mode.
/// The target clock is unknown in advance; 8 steps cover the firmware's
/// supported SCK range.
pub const PROGRAM_ENABLE_ATTEMPTS: u8 = 8;

/// Poll-read attempts after a page write before giving up.
/// Carried over from firmware-side empirical tuning; do not change without
/// validating against real hardware.
pub const WRITE_POLL_ATTEMPTS: u32 = 1000;

/// Settle time granted to a page write that changed no byte from 0xff and
/// therefore cannot be completion-polled.
pub const WRITE_GRACE_DELAY_MS: u64 = 10;

pub mod subcommands {
    pub const FIRMWARE_VERSION: u8 = 0x00;
    pub const BULK_SEND: u8 = 0x03;
    pub const BULK_RECV: u8 = 0x04;
    pub const ISP_SETUP: u8 = 0x10;
    pub const ISP_RELEASE: u8 = 0x11;
    pub const SPI_EXCHANGE: u8 = 0x24;
    pub const SPI_RUN: u8 = 0x25;
}
