//! Firmware programming.
//!
//! A row larger than a single frame is streamed with `send_data` and
//! completed with exactly one `program_row`, which carries the final chunk.

use crate::protocol::MAX_DATA_LENGTH;
use crate::{Bootloader, Command, Error, FirmwareImage, FirmwareRow, Options, Transport};

/// How a single row is split across frames
#[derive(Debug, Clone, PartialEq)]
pub struct RowPlan<'a> {
    /// Chunks sent ahead with `send_data`
    pub leading: Vec<&'a [u8]>,
    /// Chunk carried by the finalising `program_row`
    pub last: &'a [u8],
}

impl<'a> RowPlan<'a> {
    /// Number of frames needed for the row
    pub fn packets(&self) -> usize {
        self.leading.len() + 1
    }
}

/// Split row data into `MAX_DATA_LENGTH` sized chunks.
///
/// When the data divides evenly the final full chunk goes with the
/// program row command rather than being sent ahead.
pub fn split_row(data: &[u8]) -> RowPlan<'_> {
    let max = MAX_DATA_LENGTH;
    if data.len() < max {
        return RowPlan {
            leading: Vec::new(),
            last: data,
        };
    }

    let full = data.len() / max;
    let leading = if data.len() % max > 0 { full } else { full - 1 };
    let (head, last) = data.split_at(leading * max);

    RowPlan {
        leading: head.chunks(max).collect(),
        last,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlashReport {
    pub rows: usize,
    pub packets: usize,
    /// Commands rejected by the device
    pub failed: usize,
}

impl FlashReport {
    /// Account for a command result, applying the abort policy
    fn record<E>(
        &mut self,
        ok: bool,
        command: Command,
        row: &FirmwareRow,
        options: &Options,
    ) -> Result<(), Error<E>> {
        self.packets += 1;
        if ok {
            return Ok(());
        }

        self.failed += 1;
        if options.abort_on_error {
            error!(
                "{:?} failed on array {} row {}, aborting",
                command, row.array_id, row.row_number
            );
            return Err(Error::CommandFailed {
                command,
                array_id: row.array_id,
                row_number: row.row_number,
            });
        }

        Ok(())
    }
}

/// Write every row of `image` in file order.
///
/// `progress` is called after each row is finished. Rejected commands
/// are counted in the report and only stop the run when
/// `options.abort_on_error` is set; transport errors always stop it.
pub fn flash<T, E, F>(
    session: &mut Bootloader<T, E>,
    image: &FirmwareImage,
    options: &Options,
    mut progress: F,
) -> Result<FlashReport, Error<E>>
where
    T: Transport<E>,
    E: core::fmt::Debug,
    F: FnMut(&FirmwareRow),
{
    let mut report = FlashReport::default();

    info!(
        "Flashing {} rows ({} bytes)",
        image.rows().len(),
        image.data_len()
    );

    for row in image.rows() {
        if options.erase {
            let ok = session.erase_row(row.array_id, row.row_number)?;
            report.record(ok, Command::EraseRow, row, options)?;
        }

        let plan = split_row(&row.data);
        trace!(
            "Array {} row {}: {} bytes in {} packets",
            row.array_id,
            row.row_number,
            row.data.len(),
            plan.packets()
        );
        for chunk in &plan.leading {
            let ok = session.send_data(chunk)?;
            report.record(ok, Command::SendData, row, options)?;
        }

        let ok = session.program_row(row.array_id, row.row_number, plan.last)?;
        report.record(ok, Command::ProgramRow, row, options)?;

        report.rows += 1;
        progress(row);
    }

    if report.failed > 0 {
        warn!(
            "Flashing finished with {} rejected commands over {} rows",
            report.failed, report.rows
        );
    } else {
        info!("Flashed {} rows in {} packets", report.rows, report.packets);
    }

    Ok(report)
}
