//! Abstract programmer command channel.
//!
//! Both supported programmers speak fixed 64-byte USB packets on one OUT and
//! one IN endpoint, with a shared set of subcommands. Only the framing that
//! runs a large SPI batch differs between them, so the programming engine is
//! written against this trait and each backend supplies its own
//! [`Channel::spi_bulk`].

use crate::constants::{subcommands, MAX_PACKET_SIZE, MAX_SPI_EXCHANGE};
use crate::error::{ChannelError, EngineError};

pub use self::mcupro::McuProChannel;
pub use self::usb::UsbDevice;
pub use self::usbisp3::UsbIsp3Channel;

mod mcupro;
mod usb;
mod usbisp3;

/// One logical command channel to a programmer.
///
/// All calls block until the transport completes or its fixed timeout
/// elapses; no retry happens at this level.
pub trait Channel {
    /// Short name of the backend, for display purposes.
    fn description(&self) -> &'static str;

    /// Writes one packet to the command endpoint, padded to 64 bytes.
    fn write_packet(&mut self, buf: &[u8]) -> Result<(), ChannelError>;

    /// Reads one 64-byte packet from the response endpoint.
    fn read_packet(&mut self) -> Result<[u8; MAX_PACKET_SIZE], ChannelError>;

    /// Runs a SPI batch too large for a single exchange packet. The response
    /// has the same length as the request; framing is backend specific.
    fn spi_bulk(&mut self, send: &[u8], recv: &mut [u8]) -> Result<(), ChannelError>;

    /// Releases the USB handle. Further transfers fail with
    /// [`ChannelError::NotOpen`].
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Clocks up to 60 bytes through the target's SPI in one packet exchange.
    fn spi_exchange(&mut self, send: &[u8], recv: &mut [u8]) -> Result<(), ChannelError> {
        debug_assert!(send.len() <= MAX_SPI_EXCHANGE && send.len() == recv.len());
        let mut buf = [0u8; MAX_PACKET_SIZE];
        buf[0] = subcommands::SPI_EXCHANGE;
        buf[1] = send.len() as u8;
        buf[4..4 + send.len()].copy_from_slice(send);
        self.write_packet(&buf)?;
        let resp = self.read_packet()?;
        recv.copy_from_slice(&resp[..recv.len()]);
        Ok(())
    }

    /// Configures target reset and SCK timing before a program-enable try.
    fn setup(&mut self, mode: u8, speed: u8, delay: u8) -> Result<(), ChannelError> {
        self.write_packet(&[subcommands::ISP_SETUP, mode, speed, delay])
    }

    /// Releases the target from reset, leaving programming mode.
    fn release(&mut self, reset_type: u8, reset_val: u8) -> Result<(), ChannelError> {
        self.write_packet(&[subcommands::ISP_RELEASE, reset_type, reset_val])
    }

    /// Asks the programmer firmware for its version string.
    fn firmware_version(&mut self) -> Result<String, ChannelError> {
        self.write_packet(&[subcommands::FIRMWARE_VERSION])?;
        let resp = self.read_packet()?;
        let end = resp.iter().position(|&b| b == 0).unwrap_or(resp.len());
        Ok(String::from_utf8_lossy(&resp[..end]).into_owned())
    }
}

/// Compares the firmware identity string against the expected one and closes
/// the channel on mismatch, before any programming command goes out.
pub(crate) fn verify_firmware<C: Channel>(
    channel: &mut C,
    expected: &str,
) -> Result<(), EngineError> {
    let version = channel.firmware_version()?;
    if !version.eq_ignore_ascii_case(expected) {
        channel.close();
        return Err(EngineError::WrongFirmware {
            expected: expected.to_string(),
            found: version,
        });
    }
    log::debug!("{} firmware: {}", channel.description(), version);
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted channel double for engine and framing tests.

    use std::collections::VecDeque;

    use super::*;

    #[derive(Default)]
    pub struct ScriptedChannel {
        pub closed: bool,
        /// Every packet written, padded to the wire size.
        pub writes: Vec<Vec<u8>>,
        /// Queued `read_packet` results; an all-zero packet when exhausted.
        pub responses: VecDeque<[u8; MAX_PACKET_SIZE]>,
        /// Send buffers of every `spi_bulk` call.
        pub bulk_sends: Vec<Vec<u8>>,
        /// Response returned by `spi_bulk`, zero-filled when absent.
        pub bulk_response: Option<Vec<u8>>,
    }

    impl ScriptedChannel {
        pub fn new() -> ScriptedChannel {
            ScriptedChannel::default()
        }

        pub fn push_response(&mut self, prefix: &[u8]) {
            let mut packet = [0u8; MAX_PACKET_SIZE];
            packet[..prefix.len()].copy_from_slice(prefix);
            self.responses.push_back(packet);
        }

        /// Packets that carried a single SPI exchange.
        pub fn exchanges(&self) -> Vec<&Vec<u8>> {
            self.writes
                .iter()
                .filter(|p| p[0] == subcommands::SPI_EXCHANGE)
                .collect()
        }
    }

    impl Channel for ScriptedChannel {
        fn description(&self) -> &'static str {
            "scripted"
        }

        fn write_packet(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
            if self.closed {
                return Err(ChannelError::NotOpen);
            }
            let mut packet = vec![0u8; MAX_PACKET_SIZE];
            packet[..buf.len()].copy_from_slice(buf);
            self.writes.push(packet);
            Ok(())
        }

        fn read_packet(&mut self) -> Result<[u8; MAX_PACKET_SIZE], ChannelError> {
            if self.closed {
                return Err(ChannelError::NotOpen);
            }
            Ok(self.responses.pop_front().unwrap_or([0u8; MAX_PACKET_SIZE]))
        }

        fn spi_bulk(&mut self, send: &[u8], recv: &mut [u8]) -> Result<(), ChannelError> {
            if self.closed {
                return Err(ChannelError::NotOpen);
            }
            self.bulk_sends.push(send.to_vec());
            recv.fill(0);
            if let Some(resp) = &self.bulk_response {
                recv.copy_from_slice(&resp[..recv.len()]);
            }
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn is_open(&self) -> bool {
            !self.closed
        }
    }
}
