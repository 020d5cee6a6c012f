//! USB ISP 3.0 backend.
//!
//! Newer firmware with a condensed bulk framing: a single run subcommand
//! clocks the staged payload and queues the response in one step. Identity is
//! double checked on open, first via the USB serial-number descriptor, then
//! via the firmware version exchange.

use super::{verify_firmware, Channel, UsbDevice};
use crate::constants::{subcommands, MAX_PACKET_SIZE};
use crate::error::{ChannelError, EngineError};

const VENDOR_ID: u16 = 0x03eb;
const PRODUCT_ID: u16 = 0xc8b4;

const SERIAL_DESCRIPTOR_INDEX: u8 = 3;

pub const SERIAL_VERSION: &str = "ICVN.VN-230722";
pub const FIRMWARE_VERSION: &str = "USB ISP 3.0 version 230726";

pub struct UsbIsp3Channel {
    device: Option<UsbDevice>,
}

impl UsbIsp3Channel {
    /// Opens the programmer and verifies both identity strings. No
    /// programming command is issued before the checks pass.
    pub fn open() -> Result<UsbIsp3Channel, EngineError> {
        let mut device = UsbDevice::open(VENDOR_ID, PRODUCT_ID)?;

        let serial = device.read_string_descriptor(SERIAL_DESCRIPTOR_INDEX)?;
        if !serial.eq_ignore_ascii_case(SERIAL_VERSION) {
            return Err(EngineError::WrongFirmware {
                expected: SERIAL_VERSION.to_string(),
                found: serial,
            });
        }

        let mut channel = UsbIsp3Channel {
            device: Some(device),
        };
        verify_firmware(&mut channel, FIRMWARE_VERSION)?;
        Ok(channel)
    }

    fn device(&mut self) -> Result<&mut UsbDevice, ChannelError> {
        self.device.as_mut().ok_or(ChannelError::NotOpen)
    }
}

impl Channel for UsbIsp3Channel {
    fn description(&self) -> &'static str {
        "usbisp3"
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
            subcommands::SPI_RUN,
            len as u8,
            (len >> 8) as u8,
            0,
            0,
        ])?;
        device.write_payload(send)?;
        device.read_payload(recv)
    }

    fn close(&mut self) {
        self.device = None;
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }
}
