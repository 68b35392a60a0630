use hidapi::{HidApi, HidDevice, HidError};
use thiserror::Error;

use crate::{Bootloader, Transport};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no device found matching {vendor_id:04x}:{product_id:04x}")]
    NotFound { vendor_id: u16, product_id: u16 },

    #[error("HID error: {0}")]
    Hid(#[from] HidError),
}

/// Bootloader transport over a HID interface
pub struct HidTransport {
    device: HidDevice,
}

impl HidTransport {
    pub fn new(device: HidDevice) -> Self {
        Self { device }
    }
}

impl Transport<HidError> for HidTransport {
    fn write(&mut self, frame: &[u8]) -> Result<(), HidError> {
        // Frames go out as-is, the bootloader interface has no report id
        let n = self.device.write(frame)?;
        check_sent(n, frame.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, HidError> {
        self.device.read(buf)
    }
}

/// A partial frame would leave the device waiting for the remainder
fn check_sent(sent: usize, all: usize) -> Result<(), HidError> {
    if sent < all {
        error!("Short HID write ({} of {} bytes)", sent, all);
        return Err(HidError::IncompleteSendError { sent, all });
    }
    Ok(())
}

/// Check that a device with the given identifiers is attached
pub fn find_device(api: &HidApi, vendor_id: u16, product_id: u16) -> Result<(), ConnectError> {
    let found = api.device_list().find(|d| {
        d.vendor_id() == vendor_id && d.product_id() == product_id
    });

    match found {
        Some(d) => {
            debug!(
                "Found {:04x}:{:04x} at {:?} ({})",
                vendor_id,
                product_id,
                d.path(),
                d.product_string().unwrap_or("unnamed")
            );
            Ok(())
        }
        None => Err(ConnectError::NotFound {
            vendor_id,
            product_id,
        }),
    }
}

impl Bootloader<HidTransport, HidError> {
    /// Open a session with the first HID device matching the given identifiers
    pub fn hid(vendor_id: u16, product_id: u16) -> Result<Self, ConnectError> {
        let api = HidApi::new()?;

        find_device(&api, vendor_id, product_id)?;

        let device = api.open(vendor_id, product_id)?;

        Ok(Self::new(HidTransport::new(device)))
    }
}
