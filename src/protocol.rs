//! Bootloader packet framing.
//!
//! Every command and response is carried in a single frame:
//!
//! | Offset    | Size | Field                              |
//! |-----------|------|------------------------------------|
//! | 0         | 1    | start of packet (`0x01`)           |
//! | 1         | 1    | command (host) / status (device)   |
//! | 2         | 2    | data length, little endian         |
//! | 4         | len  | data                               |
//! | 4 + len   | 2    | checksum, little endian            |
//! | 6 + len   | 1    | end of packet (`0x17`)             |

pub const START_OF_PACKET: u8 = 0x01;
pub const END_OF_PACKET: u8 = 0x17;

/// Size of a single HID report, and so the largest frame on the wire
pub const REPORT_SIZE: usize = 64;

/// Start, command, length (2), checksum (2), end
pub const FRAME_OVERHEAD: usize = 7;

pub const HEADER_SIZE: usize = 4;

/// Largest data field a single frame can carry
pub const MAX_PAYLOAD: usize = REPORT_SIZE - FRAME_OVERHEAD;

/// Row data carried per frame, leaving room for the program row arguments
pub const MAX_DATA_LENGTH: usize = REPORT_SIZE - FRAME_OVERHEAD - 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Erases a single flash row
    EraseRow = 0x34,

    /// Buffers data for the next program row command
    SendData = 0x37,

    /// Starts a bootloader session, returning the device identity
    EnterBootloader = 0x38,

    /// Writes buffered data plus the attached data into a flash row
    ProgramRow = 0x39,

    /// Leaves the bootloader and launches the application
    ExitBootloader = 0x3b,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Status reported by the device in the command byte of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// The amount of data does not match the command
    Length,
    /// The data is not of the proper form
    Data,
    /// The command is not recognised
    Command,
    /// The packet checksum does not match
    Checksum,
    /// The flash array id is not valid
    Array,
    /// The flash row number is not valid
    Row,
    /// The application is not valid and cannot be launched
    App,
    /// The application is currently marked as active
    Active,
    /// A bootloader callback failed
    Callback,
    /// Unspecified bootloader error
    Unknown,
    /// Status code outside the known table
    Unrecognised(u8),
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Status::Success,
            0x03 => Status::Length,
            0x04 => Status::Data,
            0x05 => Status::Command,
            0x08 => Status::Checksum,
            0x09 => Status::Array,
            0x0a => Status::Row,
            0x0c => Status::App,
            0x0d => Status::Active,
            0x0e => Status::Callback,
            0x0f => Status::Unknown,
            other => Status::Unrecognised(other),
        }
    }
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0x00,
            Status::Length => 0x03,
            Status::Data => 0x04,
            Status::Command => 0x05,
            Status::Checksum => 0x08,
            Status::Array => 0x09,
            Status::Row => 0x0a,
            Status::App => 0x0c,
            Status::Active => 0x0d,
            Status::Callback => 0x0e,
            Status::Unknown => 0x0f,
            Status::Unrecognised(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("frame does not begin with start of packet (found 0x{0:02x})")]
    MissingStart(u8),

    #[error("frame does not finish with end of packet (found 0x{0:02x})")]
    MissingEnd(u8),

    #[error("frame of {available} bytes is too short for a {declared} byte payload")]
    Truncated { declared: usize, available: usize },
}

/// 16-bit two's complement of the byte sum
pub fn checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |sum, b| sum.wrapping_add(*b as u16))
        .wrapping_neg()
}

pub fn verify(expected: u16, data: &[u8]) -> bool {
    checksum(data) == expected
}

/// An encoded host to device frame
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    frame: Vec<u8>,
}

impl Packet {
    pub fn command(&self) -> u8 {
        self.frame[1]
    }

    pub fn data(&self) -> &[u8] {
        &self.frame[HEADER_SIZE..self.frame.len() - 3]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.frame
    }
}

/// Frame a command and its data
pub fn encode(command: u8, data: &[u8]) -> Result<Packet, Error> {
    if data.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge {
            len: data.len(),
            max: MAX_PAYLOAD,
        });
    }

    let mut frame = Vec::with_capacity(data.len() + FRAME_OVERHEAD);
    frame.push(START_OF_PACKET);
    frame.push(command);
    frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
    frame.extend_from_slice(data);

    let sum = checksum(&frame);
    frame.extend_from_slice(&sum.to_le_bytes());
    frame.push(END_OF_PACKET);

    Ok(Packet { frame })
}

/// A decoded device to host frame
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub data: Vec<u8>,
    /// Whether the frame checksum matched, independent of `status`
    pub checksum_ok: bool,
}

impl Response {
    /// Valid checksum and a success status
    pub fn is_ok(&self) -> bool {
        self.checksum_ok && self.status.is_success()
    }
}

/// Parse a received frame.
///
/// Anything after the end of packet marker (report padding) is ignored.
/// A checksum mismatch is reported through `checksum_ok` rather than failing.
pub fn decode(raw: &[u8]) -> Result<Response, Error> {
    if raw.len() < FRAME_OVERHEAD {
        return Err(Error::Truncated {
            declared: 0,
            available: raw.len(),
        });
    }

    if raw[0] != START_OF_PACKET {
        return Err(Error::MissingStart(raw[0]));
    }

    let status = Status::from(raw[1]);
    let len = u16::from_le_bytes([raw[2], raw[3]]) as usize;
    let end = HEADER_SIZE + len;

    if raw.len() < end + 3 {
        return Err(Error::Truncated {
            declared: len,
            available: raw.len(),
        });
    }

    if raw[end + 2] != END_OF_PACKET {
        return Err(Error::MissingEnd(raw[end + 2]));
    }

    let received = u16::from_le_bytes([raw[end], raw[end + 1]]);

    Ok(Response {
        status,
        data: raw[HEADER_SIZE..end].to_vec(),
        checksum_ok: verify(received, &raw[..end]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_twos_complement_of_sum() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01]), 0xffff);
        assert_eq!(checksum(&[0x01, 0x38, 0x00, 0x00]), 0xffc7);

        // Sum wraps at 16 bits
        let data = vec![0xffu8; 300];
        let sum = (0xff * 300) as u32 & 0xffff;
        assert_eq!(checksum(&data), ((!sum + 1) & 0xffff) as u16);
    }

    #[test]
    fn verify_matches_checksum() {
        let samples: [&[u8]; 4] = [&[], &[0x00], &[0x12, 0x34, 0x56], &[0xff; 64]];
        for s in samples.iter() {
            assert!(verify(checksum(s), s));
            assert!(!verify(checksum(s).wrapping_add(1), s));
        }
    }

    #[test]
    fn encode_enter_bootloader() {
        let p = encode(Command::EnterBootloader.code(), &[]).unwrap();
        assert_eq!(p.as_bytes(), &[0x01, 0x38, 0x00, 0x00, 0xc7, 0xff, 0x17]);
        assert_eq!(p.command(), 0x38);
        assert!(p.data().is_empty());
    }

    #[test]
    fn encode_erase_row_arguments() {
        let p = encode(Command::EraseRow.code(), &[0x00, 0x34, 0x12]).unwrap();
        assert_eq!(&p.as_bytes()[..7], &[0x01, 0x34, 0x03, 0x00, 0x00, 0x34, 0x12]);
        assert_eq!(p.as_bytes().len(), 3 + FRAME_OVERHEAD);
        assert_eq!(*p.as_bytes().last().unwrap(), END_OF_PACKET);
    }

    #[test]
    fn encode_limits_payload() {
        assert!(encode(0x37, &[0u8; MAX_PAYLOAD]).is_ok());
        assert_eq!(
            encode(0x37, &[0u8; MAX_PAYLOAD + 1]),
            Err(Error::PayloadTooLarge {
                len: MAX_PAYLOAD + 1,
                max: MAX_PAYLOAD
            })
        );
    }

    #[test]
    fn decode_recovers_encoded_payload() {
        for len in &[0usize, 1, 8, MAX_DATA_LENGTH, MAX_PAYLOAD] {
            let data: Vec<u8> = (0..*len as u8).collect();
            let p = encode(0x00, &data).unwrap();
            let r = decode(p.as_bytes()).unwrap();
            assert_eq!(r.status, Status::Success);
            assert_eq!(r.data, data);
            assert!(r.checksum_ok);
        }
    }

    #[test]
    fn decode_ignores_report_padding() {
        let mut report = [0u8; REPORT_SIZE];
        let p = encode(0x00, &[0xaa, 0xbb]).unwrap();
        report[..p.as_bytes().len()].copy_from_slice(p.as_bytes());

        let r = decode(&report).unwrap();
        assert_eq!(r.data, vec![0xaa, 0xbb]);
        assert!(r.is_ok());
    }

    #[test]
    fn decode_reports_bad_checksum_without_failing() {
        let mut raw = encode(0x00, &[0x01, 0x02]).unwrap().as_bytes().to_vec();
        raw[6] ^= 0xff;

        let r = decode(&raw).unwrap();
        assert_eq!(r.status, Status::Success);
        assert!(!r.checksum_ok);
        assert!(!r.is_ok());
    }

    #[test]
    fn decode_rejects_bad_markers() {
        let good = encode(0x00, &[0x01]).unwrap().as_bytes().to_vec();

        let mut bad_start = good.clone();
        bad_start[0] = 0x02;
        assert_eq!(decode(&bad_start), Err(Error::MissingStart(0x02)));

        let mut bad_end = good.clone();
        bad_end[7] = 0x00;
        assert_eq!(decode(&bad_end), Err(Error::MissingEnd(0x00)));
    }

    #[test]
    fn decode_rejects_truncated_frames() {
        assert!(matches!(decode(&[0x01, 0x00]), Err(Error::Truncated { .. })));

        // Declared length runs past the end of the buffer
        let raw = [0x01, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x17];
        assert_eq!(
            decode(&raw),
            Err(Error::Truncated {
                declared: 16,
                available: 8
            })
        );
    }

    #[test]
    fn status_table() {
        assert_eq!(Status::from(0x00), Status::Success);
        assert_eq!(Status::from(0x08), Status::Checksum);
        assert_eq!(Status::from(0x0f), Status::Unknown);
        assert_eq!(Status::from(0x42), Status::Unrecognised(0x42));

        for code in 0..=255u8 {
            assert_eq!(Status::from(code).code(), code);
        }
    }

    #[test]
    fn decode_classifies_unknown_status() {
        let raw = encode(0x77, &[]).unwrap();
        let r = decode(raw.as_bytes()).unwrap();
        assert_eq!(r.status, Status::Unrecognised(0x77));
        assert!(r.checksum_ok);
        assert!(!r.is_ok());
    }
}
