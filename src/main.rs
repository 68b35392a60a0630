#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use cybootloader_host::hid::ConnectError;
use cybootloader_host::{flash, Bootloader, FirmwareImage, FlashReport, Options, Transport};

/// USB vendor and product identifiers, as `VID:PID` in hex
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl FromStr for UsbId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            let v = v.trim();
            let v = v
                .strip_prefix("0x")
                .or_else(|| v.strip_prefix("0X"))
                .unwrap_or(v);
            u16::from_str_radix(v, 16).map_err(|e| format!("invalid id '{}': {}", v, e))
        };

        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(vid), Some(pid), None) => Ok(UsbId {
                vendor_id: parse(vid)?,
                product_id: parse(pid)?,
            }),
            _ => Err(format!("expected VID:PID, found '{}'", s)),
        }
    }
}

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Device to flash, as VID:PID in hex
    device: UsbId,

    /// Firmware container (.cyacd) to write
    firmware: PathBuf,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(&o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: &Args) -> anyhow::Result<()> {
    // Parse firmware before touching the device
    let image = FirmwareImage::open(&o.firmware)
        .with_context(|| format!("Error loading firmware {}", o.firmware.display()))?;

    info!(
        "Loaded firmware for silicon 0x{:08x} rev {}: {} rows, {}",
        image.silicon_id,
        image.silicon_revision,
        image.rows().len(),
        bytefmt::format(image.data_len() as u64)
    );
    if image.checksum_type != 0 {
        warn!(
            "Firmware declares checksum type {}, frames use the summation checksum",
            image.checksum_type
        );
    }

    info!(
        "Connecting to {:04x}:{:04x}",
        o.device.vendor_id, o.device.product_id
    );

    let mut b = match Bootloader::hid(o.device.vendor_id, o.device.product_id) {
        Ok(b) => b,
        Err(ConnectError::NotFound { .. }) => return Err(anyhow!("Device not found!")),
        Err(e) => return Err(anyhow!("Error connecting to device: {}", e)),
    };

    let report = program(&mut b, &image, &o.options)?;
    if report.rows > 0 {
        info!(
            "Done: {} rows, {} packets, {} rejected",
            report.rows, report.packets, report.failed
        );
    }

    Ok(())
}

/// Enter, flash if the image matches the device, then exit.
///
/// Exit is attempted whenever entry was attempted, since a device that
/// answered with a malformed success may still be in its bootloader.
fn program<T, E>(
    b: &mut Bootloader<T, E>,
    image: &FirmwareImage,
    options: &Options,
) -> anyhow::Result<FlashReport>
where
    T: Transport<E>,
    E: std::fmt::Debug,
{
    let entered = match b.enter() {
        Ok(entered) => entered,
        Err(e) => {
            if let Err(x) = b.exit() {
                warn!("Error exiting bootloader: {}", x);
            }
            return Err(anyhow!("Error entering bootloader: {}", e));
        }
    };

    let identity = b.identity().copied();
    let result = match identity {
        Some(id) if entered && image.is_compatible(&id) => {
            let bar = ProgressBar::new(image.rows().len() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} rows")
                    .progress_chars("=> "),
            );

            let r = flash(b, image, options, |_| bar.inc(1));
            bar.finish();
            r.map_err(|e| anyhow!("Error flashing device: {}", e))
        }
        Some(id) => {
            warn!(
                "Firmware for 0x{:08x} rev {} does not match device {}, skipping",
                image.silicon_id, image.silicon_revision, id
            );
            Ok(Default::default())
        }
        None => {
            warn!("Bootloader rejected entry, skipping");
            Ok(Default::default())
        }
    };

    // Always leave the bootloader, even after a failed flash
    b.exit()
        .map_err(|e| anyhow!("Error exiting bootloader: {}", e))?;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use cybootloader_host::protocol::encode;
    use cybootloader_host::{State, REPORT_SIZE};

    #[derive(Debug)]
    struct Unplugged;

    /// Answers every command with the same success frame
    struct Device {
        reply: Vec<u8>,
        written: Vec<u8>,
    }

    impl Device {
        fn new(reply: &[u8]) -> Self {
            let mut report = vec![0u8; REPORT_SIZE];
            let packet = encode(0x00, reply).unwrap();
            let frame = packet.as_bytes();
            report[..frame.len()].copy_from_slice(frame);
            Self {
                reply: report,
                written: vec![],
            }
        }
    }

    impl Transport<Unplugged> for Device {
        fn write(&mut self, frame: &[u8]) -> Result<(), Unplugged> {
            self.written.push(frame[1]);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Unplugged> {
            buf.copy_from_slice(&self.reply);
            Ok(buf.len())
        }
    }

    fn image(header: &str) -> FirmwareImage {
        // One four byte row, checksum over 00 0000 0004 01020304
        let text = format!("{}\n:000000000401020304F2\n", header);
        text.parse().unwrap()
    }

    #[test]
    fn program_matching_device() {
        let id = [0x01, 0x02, 0x03, 0x04, 0x05, 0x00, 0x00, 0x01];
        let mut b = Bootloader::new(Device::new(&id));

        let report = program(&mut b, &image("040302010500"), &Options::default()).unwrap();
        assert_eq!(report.rows, 1);
        assert_eq!(b.state(), State::Exited);
        assert_eq!(b.into_inner().written, vec![0x38, 0x39, 0x3b]);
    }

    #[test]
    fn program_skips_other_device() {
        let id = [0x01, 0x02, 0x03, 0x04, 0x06, 0x00, 0x00, 0x01];
        let mut b = Bootloader::new(Device::new(&id));

        let report = program(&mut b, &image("040302010500"), &Options::default()).unwrap();
        assert_eq!(report.rows, 0);
        assert_eq!(b.into_inner().written, vec![0x38, 0x3b]);
    }

    #[test]
    fn exit_after_malformed_enter() {
        // Success status, but too short to carry an identity
        let mut b = Bootloader::new(Device::new(&[0x01, 0x02]));

        assert!(program(&mut b, &image("040302010500"), &Options::default()).is_err());
        assert_eq!(b.state(), State::Exited);
        assert_eq!(b.into_inner().written, vec![0x38, 0x3b]);
    }

    #[test]
    fn parse_usb_id() {
        assert_eq!(
            "04b4:b71d".parse::<UsbId>(),
            Ok(UsbId {
                vendor_id: 0x04b4,
                product_id: 0xb71d
            })
        );
        assert_eq!(
            "0x04B4:0xF13B".parse::<UsbId>(),
            Ok(UsbId {
                vendor_id: 0x04b4,
                product_id: 0xf13b
            })
        );
    }

    #[test]
    fn reject_bad_usb_id() {
        assert!("04b4".parse::<UsbId>().is_err());
        assert!("04b4:".parse::<UsbId>().is_err());
        assert!("04b4:b71d:00".parse::<UsbId>().is_err());
        assert!("10000:0001".parse::<UsbId>().is_err());
        assert!("zz:0001".parse::<UsbId>().is_err());
    }
}
