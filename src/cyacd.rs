//! Firmware container (`.cyacd`) parsing.
//!
//! The container is line oriented hex text. The first line is a header of
//! silicon id (4 bytes, big endian), silicon revision and checksum type.
//! Each following line is a record marker character followed by array id,
//! row number (2 bytes, big endian), data length (2 bytes, big endian),
//! the row data and an 8-bit line checksum.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::DeviceIdentity;

const HEADER_LEN: usize = 6;

/// Array id, row number and data length
const ROW_PREFIX_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("firmware file is empty")]
    Empty,

    #[error("header is {0} bytes, expected 6")]
    InvalidHeader(usize),

    #[error("line {line}: invalid hex")]
    Hex {
        line: usize,
        #[source]
        source: hex::FromHexError,
    },

    #[error("line {line}: record length does not match its declared data length")]
    InvalidRow { line: usize },

    #[error(
        "line {line}: checksum mismatch for array {array_id} row {row_number} (expected 0x{expected:02x}, found 0x{actual:02x})"
    )]
    ChecksumMismatch {
        line: usize,
        array_id: u8,
        row_number: u16,
        expected: u8,
        actual: u8,
    },

    #[error("reading firmware: {0}")]
    Io(#[from] std::io::Error),
}

/// 8-bit two's complement of the byte sum
pub fn line_checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, b| sum.wrapping_add(*b))
        .wrapping_neg()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareRow {
    pub array_id: u8,
    pub row_number: u16,
    pub data: Vec<u8>,
    pub checksum: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareImage {
    pub silicon_id: u32,
    pub silicon_revision: u8,
    pub checksum_type: u8,
    rows: Vec<FirmwareRow>,
}

impl FirmwareImage {
    /// Parse a container from its lines, in file order.
    ///
    /// Blank lines are skipped. Any row failing its line checksum rejects
    /// the whole image.
    pub fn parse<I, S>(lines: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut lines = lines
            .into_iter()
            .enumerate()
            .map(|(i, l)| (i + 1, l))
            .filter(|(_, l)| !AsRef::<str>::as_ref(l).trim().is_empty());

        let (n, header) = lines.next().ok_or(ParseError::Empty)?;
        let header = hex::decode(header.as_ref().trim())
            .map_err(|source| ParseError::Hex { line: n, source })?;
        if header.len() != HEADER_LEN {
            return Err(ParseError::InvalidHeader(header.len()));
        }

        let mut image = FirmwareImage {
            silicon_id: u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
            silicon_revision: header[4],
            checksum_type: header[5],
            rows: Vec::new(),
        };

        for (n, line) in lines {
            let row = parse_row(n, line.as_ref().trim())?;
            trace!(
                "Row {}: array {} row {} ({} bytes)",
                n,
                row.array_id,
                row.row_number,
                row.data.len()
            );
            image.rows.push(row);
        }

        debug!(
            "Parsed firmware for silicon 0x{:08x} rev {}: {} rows",
            image.silicon_id,
            image.silicon_revision,
            image.rows.len()
        );

        Ok(image)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ParseError> {
        let lines = BufReader::new(reader)
            .lines()
            .collect::<Result<Vec<_>, _>>()?;
        Self::parse(lines)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        Self::from_reader(File::open(path)?)
    }

    pub fn rows(&self) -> &[FirmwareRow] {
        &self.rows
    }

    /// Total row payload in bytes
    pub fn data_len(&self) -> usize {
        self.rows.iter().map(|r| r.data.len()).sum()
    }

    /// Whether this image targets the device reporting `identity`
    pub fn is_compatible(&self, identity: &DeviceIdentity) -> bool {
        self.silicon_id == identity.jtag_id && self.silicon_revision == identity.device_revision
    }
}

impl FromStr for FirmwareImage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.lines())
    }
}

fn parse_row(line: usize, text: &str) -> Result<FirmwareRow, ParseError> {
    // Skip the record marker
    let body = text.get(1..).ok_or(ParseError::InvalidRow { line })?;
    let raw = hex::decode(body).map_err(|source| ParseError::Hex { line, source })?;

    if raw.len() < ROW_PREFIX_LEN + 1 {
        return Err(ParseError::InvalidRow { line });
    }

    let array_id = raw[0];
    let row_number = u16::from_be_bytes([raw[1], raw[2]]);
    let len = u16::from_be_bytes([raw[3], raw[4]]) as usize;

    if raw.len() != ROW_PREFIX_LEN + len + 1 {
        return Err(ParseError::InvalidRow { line });
    }

    let (body, checksum) = raw.split_at(raw.len() - 1);
    let expected = line_checksum(body);
    if checksum[0] != expected {
        return Err(ParseError::ChecksumMismatch {
            line,
            array_id,
            row_number,
            expected,
            actual: checksum[0],
        });
    }

    Ok(FirmwareRow {
        array_id,
        row_number,
        data: body[ROW_PREFIX_LEN..].to_vec(),
        checksum: checksum[0],
    })
}
