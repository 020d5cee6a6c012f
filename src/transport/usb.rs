//! Raw USB device IO shared by both programmer backends.
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::ChannelError;

const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;

/// Per-packet transfer timeout. Fixed by the firmware protocol, not tunable.
const TIMEOUT: Duration = Duration::from_secs(5);

/// An exclusively claimed programmer device.
///
/// The handle is held for the lifetime of the value and released on drop, so
/// two sessions can never share one physical device.
pub struct UsbDevice {
    device_handle: DeviceHandle<rusb::Context>,
}

impl UsbDevice {
    /// Opens the first device matching `vendor_id:product_id` and claims
    /// interface 0.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<UsbDevice, ChannelError> {
        let context = Context::new()?;

        let device = context
            .devices()?
            .iter()
            .find(|device| {
                device
                    .device_descriptor()
                    .map(|desc| {
                        desc.vendor_id() == vendor_id && desc.product_id() == product_id
                    })
                    .unwrap_or(false)
            })
            .ok_or(rusb::Error::NoDevice)?;
        log::debug!(
            "found programmer {:04x}:{:04x} at bus {} addr {}",
            vendor_id,
            product_id,
            device.bus_number(),
            device.address()
        );

        let mut device_handle = device.open()?;
        device_handle.set_active_configuration(1)?;
        device_handle.claim_interface(0)?;

        Ok(UsbDevice { device_handle })
    }

    pub fn write_bulk(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        let n = self
            .device_handle
            .write_bulk(ENDPOINT_OUT, buf, TIMEOUT)
            .map_err(map_usb_err)?;
        if n != buf.len() {
            return Err(ChannelError::ShortTransfer {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    pub fn read_bulk(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let n = self
            .device_handle
            .read_bulk(ENDPOINT_IN, buf, TIMEOUT)
            .map_err(map_usb_err)?;
        if n != buf.len() {
            return Err(ChannelError::ShortTransfer {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    /// Writes one packet padded to the fixed 64-byte size.
    pub fn write_packet(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        debug_assert!(buf.len() <= MAX_PACKET_SIZE);
        let mut packet = [0u8; MAX_PACKET_SIZE];
        packet[..buf.len()].copy_from_slice(buf);
        self.write_bulk(&packet)
    }

    pub fn read_packet(&mut self) -> Result<[u8; MAX_PACKET_SIZE], ChannelError> {
        let mut packet = [0u8; MAX_PACKET_SIZE];
        self.read_bulk(&mut packet)?;
        Ok(packet)
    }

    /// Streams a payload of arbitrary length in 64-byte units.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        for chunk in payload.chunks(MAX_PACKET_SIZE) {
            self.write_packet(chunk)?;
        }
        Ok(())
    }

    pub fn read_payload(&mut self, payload: &mut [u8]) -> Result<(), ChannelError> {
        for chunk in payload.chunks_mut(MAX_PACKET_SIZE) {
            let packet = self.read_packet()?;
            chunk.copy_from_slice(&packet[..chunk.len()]);
        }
        Ok(())
    }

    /// Reads a USB string descriptor, used for the serial-number identity
    /// check of the USB ISP 3.0 firmware.
    pub fn read_string_descriptor(&mut self, index: u8) -> Result<String, ChannelError> {
        let language = self
            .device_handle
            .read_languages(TIMEOUT)?
            .first()
            .copied()
            .ok_or(rusb::Error::NotFound)?;
        Ok(self
            .device_handle
            .read_string_descriptor(language, index, TIMEOUT)?)
    }

}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        let _ = self.device_handle.release_interface(0);
    }
}

fn map_usb_err(e: rusb::Error) -> ChannelError {
    match e {
        rusb::Error::Timeout => ChannelError::Timeout,
        other => ChannelError::Usb(other),
    }
}
