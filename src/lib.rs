//! Cypress HID Bootloader host.
//!
//! Drives a device resident bootloader through enter, program and exit,
//! using firmware from a `.cyacd` container.

use core::fmt;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[cfg(feature = "structopt")]
extern crate structopt;

pub mod cyacd;
pub mod flash;
pub mod protocol;

#[cfg(feature = "hid")]
pub mod hid;

pub use cyacd::{FirmwareImage, FirmwareRow, ParseError};
pub use flash::{flash, FlashReport};
pub use protocol::{Command, Response, Status, REPORT_SIZE};

/// Frame level transport to the bootloader.
///
/// Each call is a single blocking transfer, the protocol is strictly
/// request then response.
pub trait Transport<E> {
    /// Write one complete frame
    fn write(&mut self, frame: &[u8]) -> Result<(), E>;

    /// Read one response into `buf`, returning the number of bytes received
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, E>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Entered,
    Exited,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error<TransportError> {
    #[error("transport error: {0:?}")]
    Transport(TransportError),

    #[error(transparent)]
    Protocol(protocol::Error),

    #[error("invalid response to {0:?}")]
    InvalidResponse(Command),

    #[error("{command:?} not permitted in {state:?} state")]
    InvalidState { state: State, command: Command },

    #[error("{command:?} failed for array {array_id} row {row_number}")]
    CommandFailed {
        command: Command,
        array_id: u8,
        row_number: u16,
    },
}

impl<TransportError> From<TransportError> for Error<TransportError> {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

#[derive(Clone, PartialEq, Debug, Default)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Stop flashing at the first command the device rejects
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub abort_on_error: bool,

    /// Erase each row before programming it
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub erase: bool,
}

/// Identity reported by the bootloader on entry
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct DeviceIdentity {
    pub jtag_id: u32,
    pub device_revision: u8,
    pub bootloader_revision: [u8; 3],
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch] = self.bootloader_revision;
        write!(
            f,
            "jtag id 0x{:08x} rev {} (bootloader {}.{}.{})",
            self.jtag_id, self.device_revision, major, minor, patch
        )
    }
}

pub struct Bootloader<T, E> {
    state: State,
    identity: Option<DeviceIdentity>,
    transport: T,
    _err: PhantomData<E>,
}

impl<T, E> Bootloader<T, E>
where
    T: Transport<E>,
    E: core::fmt::Debug,
{
    /// Create a new bootloader session over the provided transport
    pub fn new(transport: T) -> Self {
        Self {
            state: State::Disconnected,
            identity: None,
            transport,
            _err: PhantomData,
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    /// Identity learned from a successful `enter`
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Release the underlying transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Write a command and read back its response
    pub fn send_command(&mut self, command: Command, data: &[u8]) -> Result<Response, Error<E>> {
        if self.state == State::Exited {
            return Err(Error::InvalidState {
                state: self.state,
                command,
            });
        }

        let packet = protocol::encode(command.code(), data).map_err(Error::Protocol)?;
        trace!(
            "Write 0x{:02x} ({} data bytes): {:02x?}",
            packet.command(),
            packet.data().len(),
            packet.as_bytes()
        );
        self.transport.write(packet.as_bytes())?;

        let mut buf = [0u8; REPORT_SIZE];
        let n = self.transport.read(&mut buf)?;
        trace!("Read: {:02x?}", &buf[..n]);

        let response = protocol::decode(&buf[..n]).map_err(Error::Protocol)?;
        if !response.is_ok() {
            warn!(
                "{:?} rejected: status {:?} (checksum ok: {})",
                command, response.status, response.checksum_ok
            );
        }

        Ok(response)
    }

    /// Enter the bootloader, learning the device identity.
    ///
    /// Returns `false` if the device rejected the request.
    pub fn enter(&mut self) -> Result<bool, Error<E>> {
        let command = Command::EnterBootloader;
        self.expect_state(State::Disconnected, command)?;

        debug!("Entering bootloader");
        let response = self.send_command(command, &[])?;
        if !response.is_ok() {
            return Ok(false);
        }

        let d = &response.data;
        if d.len() < 8 {
            error!("Enter response carries {} bytes, expected 8", d.len());
            return Err(Error::InvalidResponse(command));
        }

        let identity = DeviceIdentity {
            jtag_id: u32::from_le_bytes([d[0], d[1], d[2], d[3]]),
            device_revision: d[4],
            bootloader_revision: [d[7], d[6], d[5]],
        };
        info!("Bootloader entered: {}", identity);

        self.identity = Some(identity);
        self.state = State::Entered;

        Ok(true)
    }

    /// Erase a single flash row
    pub fn erase_row(&mut self, array_id: u8, row_number: u16) -> Result<bool, Error<E>> {
        let command = Command::EraseRow;
        self.expect_state(State::Entered, command)?;

        debug!("Erasing array {} row {}", array_id, row_number);
        let args = row_args(array_id, row_number);
        let response = self.send_command(command, &args)?;
        Ok(response.is_ok())
    }

    /// Buffer part of a row on the device, to be completed by `program_row`
    pub fn send_data(&mut self, data: &[u8]) -> Result<bool, Error<E>> {
        let command = Command::SendData;
        self.expect_state(State::Entered, command)?;
        check_data_len(data)?;

        debug!("Sending {} bytes", data.len());
        let response = self.send_command(command, data)?;
        Ok(response.is_ok())
    }

    /// Write any buffered data followed by `data` into a flash row
    pub fn program_row(
        &mut self,
        array_id: u8,
        row_number: u16,
        data: &[u8],
    ) -> Result<bool, Error<E>> {
        let command = Command::ProgramRow;
        self.expect_state(State::Entered, command)?;
        check_data_len(data)?;

        debug!(
            "Programming array {} row {} ({} bytes)",
            array_id,
            row_number,
            data.len()
        );
        let mut payload = Vec::with_capacity(data.len() + 3);
        payload.extend_from_slice(&row_args(array_id, row_number));
        payload.extend_from_slice(data);

        let response = self.send_command(command, &payload)?;
        Ok(response.is_ok())
    }

    /// Leave the bootloader.
    ///
    /// The device does not answer, so no response is read. The session
    /// is finished afterwards whether or not the write succeeded.
    pub fn exit(&mut self) -> Result<(), Error<E>> {
        let command = Command::ExitBootloader;
        if self.state == State::Exited {
            return Err(Error::InvalidState {
                state: self.state,
                command,
            });
        }

        debug!("Exiting bootloader");
        self.state = State::Exited;

        let packet = protocol::encode(command.code(), &[]).map_err(Error::Protocol)?;
        trace!("Write: {:02x?}", packet.as_bytes());
        self.transport.write(packet.as_bytes())?;

        Ok(())
    }

    fn expect_state(&self, expected: State, command: Command) -> Result<(), Error<E>> {
        if self.state != expected {
            return Err(Error::InvalidState {
                state: self.state,
                command,
            });
        }
        Ok(())
    }
}

/// Row data per command is limited to `MAX_DATA_LENGTH`, below the frame limit
fn check_data_len<E>(data: &[u8]) -> Result<(), Error<E>> {
    if data.len() > protocol::MAX_DATA_LENGTH {
        return Err(Error::Protocol(protocol::Error::PayloadTooLarge {
            len: data.len(),
            max: protocol::MAX_DATA_LENGTH,
        }));
    }
    Ok(())
}

fn row_args(array_id: u8, row_number: u16) -> [u8; 3] {
    let [lo, hi] = row_number.to_le_bytes();
    [array_id, lo, hi]
}
