//! Compressed mapping from instruction offsets to source lines
//!
//! The table is a sequence of `(byte_delta: u8, line_delta: i8)` pairs. Starting from offset `0`
//! and the first line of the code object, each pair advances the offset and then the line. A
//! line starts at an offset whenever a pair with a non-zero byte delta is reached and the line has
//! changed since the last line start.
//!
//! A single break point may need several pairs:
//!
//!   - byte deltas above 255 are split off into `(255, 0)` pairs
//!
//!   - line deltas outside `-128..=127` are split into maximal steps (`127` or `-128`), the first
//!     of which also carries the remaining byte delta
//!
//! For example, a break point 400 bytes and 300 lines after the previous one is encoded as
//! `(255, 0), (145, 127), (0, 127), (0, 46)`.

use crate::bytecode::Serialize;
use crate::util::Offset;
use crate::Error;
use byteorder::WriteBytesExt;

/// Point at which the source line changes
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct LineBreak {
    pub offset: Offset,
    pub line: u32,
}

/// One pair of the encoded table
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct LineTableEntry {
    pub byte_delta: u8,
    pub line_delta: i8,
}

impl Serialize for LineTableEntry {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.byte_delta.serialize(writer)?;
        self.line_delta.serialize(writer)
    }
}

/// Incrementally encodes break points into a line table
#[derive(Debug)]
pub struct LineTableBuilder {
    last_offset: Offset,
    last_line: u32,
    entries: Vec<LineTableEntry>,
}

impl LineTableBuilder {
    pub fn new(first_line: u32) -> LineTableBuilder {
        LineTableBuilder {
            last_offset: Offset(0),
            last_line: first_line,
            entries: vec![],
        }
    }

    /// Add the next break point
    ///
    /// Break points that don't actually change the line are skipped.
    pub fn push(&mut self, line_break: LineBreak) -> Result<(), Error> {
        if line_break.offset < self.last_offset {
            return Err(Error::NonMonotonicLineBreak {
                previous: self.last_offset,
                next: line_break.offset,
            });
        }
        if line_break.line == self.last_line {
            return Ok(());
        }

        let mut byte_delta = line_break.offset - self.last_offset;
        let mut line_delta = line_break.line as i64 - self.last_line as i64;

        while byte_delta > u8::MAX as isize {
            self.push_entry(u8::MAX, 0);
            byte_delta -= u8::MAX as isize;
        }

        if !fits_i8(line_delta) {
            let step: i64 = if line_delta > 0 {
                i8::MAX as i64
            } else {
                i8::MIN as i64
            };
            while !fits_i8(line_delta) {
                self.push_entry(byte_delta as u8, step as i8);
                byte_delta = 0;
                line_delta -= step;
            }
        }
        self.push_entry(byte_delta as u8, line_delta as i8);

        self.last_offset = line_break.offset;
        self.last_line = line_break.line;
        Ok(())
    }

    fn push_entry(&mut self, byte_delta: u8, line_delta: i8) {
        self.entries.push(LineTableEntry {
            byte_delta,
            line_delta,
        });
    }

    pub fn entries(&self) -> &[LineTableEntry] {
        &self.entries
    }

    /// Encoded table
    pub fn finish(self) -> Vec<u8> {
        self.entries.to_bytes()
    }
}

fn fits_i8(value: i64) -> bool {
    (i8::MIN as i64..=i8::MAX as i64).contains(&value)
}

/// Recover the line starts from an encoded table
///
/// The first line start is always at offset `0`. Consecutive break points at the same offset
/// collapse into the last one, and break points that don't change the line disappear.
pub fn decode(table: &[u8], first_line: u32) -> Result<Vec<LineBreak>, Error> {
    if table.len() % 2 != 0 {
        return Err(Error::MalformedLineTable {
            offset: table.len() - 1,
        });
    }

    let mut line_starts: Vec<LineBreak> = vec![];
    let mut offset = 0usize;
    let mut line = first_line as i64;
    let mut last_line: Option<i64> = None;

    for (idx, pair) in table.chunks_exact(2).enumerate() {
        let (byte_delta, line_delta) = (pair[0], pair[1] as i8);
        if byte_delta != 0 {
            if last_line != Some(line) {
                line_starts.push(line_break(offset, line, idx)?);
                last_line = Some(line);
            }
            offset += byte_delta as usize;
        }
        line += line_delta as i64;
    }
    if last_line != Some(line) {
        line_starts.push(line_break(offset, line, table.len())?);
    }

    Ok(line_starts)
}

fn line_break(offset: usize, line: i64, table_offset: usize) -> Result<LineBreak, Error> {
    let line = u32::try_from(line).map_err(|_| Error::MalformedLineTable {
        offset: table_offset,
    })?;
    Ok(LineBreak {
        offset: Offset(offset),
        line,
    })
}
