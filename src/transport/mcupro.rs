//! MCU Pro backend.
//!
//! The older of the two programmer firmwares. Large SPI batches take three
//! subcommands: stage the payload (0x03), clock it through the target (0x25),
//! then request the captured response (0x04).

use super::{verify_firmware, Channel, UsbDevice};
use crate::constants::{subcommands, MAX_PACKET_SIZE};
use crate::error::{ChannelError, EngineError};

const VENDOR_ID: u16 = 0x4348;
const PRODUCT_ID: u16 = 0x0005;

pub const FIRMWARE_VERSION: &str = "MCU PRO b221223";

pub struct McuProChannel {
    device: Option<UsbDevice>,
}

impl McuProChannel {
    /// Opens the programmer and verifies its firmware identity. The wire
    /// protocol is not self-describing, so no other command may be sent
    /// before the version string matches.
    pub fn open() -> Result<McuProChannel, EngineError> {
        let device = UsbDevice::open(VENDOR_ID, PRODUCT_ID)?;
        let mut channel = McuProChannel {
            device: Some(device),
        };
        verify_firmware(&mut channel, FIRMWARE_VERSION)?;
        Ok(channel)
    }

    fn device(&mut self) -> Result<&mut UsbDevice, ChannelError> {
        self.device.as_mut().ok_or(ChannelError::NotOpen)
    }
}

impl Channel for McuProChannel {
    fn description(&self) -> &'static str {
        "mcupro"
    }

    fn write_packet(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        self.device()?.write_packet(buf)
    }

    fn read_packet(&mut self) -> Result<[u8; MAX_PACKET_SIZE], ChannelError> {
        self.device()?.read_packet()
    }

    fn spi_bulk(&mut self, send: &[u8], recv: &mut [u8]) -> Result<(), ChannelError> {
        debug_assert_eq!(send.len(), recv.len());
        let len = send.len();
        let device = self.device()?;

        device.write_packet(&[
            subcommands::BULK_SEND,
            len as u8,
            (len >> 8) as u8,
            0,
            0,
        ])?;
        device.write_payload(send)?;

        device.write_packet(&[
            subcommands::SPI_RUN,
            len as u8,
            (len >> 8) as u8,
            0,
            0,
        ])?;

        device.write_packet(&[
            subcommands::BULK_RECV,
            len as u8,
            (len >> 8) as u8,
            (len >> 16) as u8,
            (len >> 24) as u8,
        ])?;
        device.read_payload(recv)
    }

    fn close(&mut self) {
        self.device = None;
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }
}
