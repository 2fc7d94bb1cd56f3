//! Injected log sink (component G): receives the per-iteration cost-function
//! record. Deliberately not a global/static — the `Module` holds one by
//! value, the way this crate's design notes call for replacing the legacy
//! process-wide logger singleton.

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// ==============================================================================================
/// ========================================== Log Sink ==========================================
/// ==============================================================================================

/// Anything that can receive the literal `"IES iter:<k> cost function: <f>"`
/// text record emitted after every `updateA`.
pub trait LogSink: std::fmt::Debug {
    fn write_record(&mut self, iteration_nr: u32, cost: f64) -> io::Result<()>;
}

/// Appends records to a file, opened (and created) in append mode.
#[derive(Debug)]
pub struct FileLogSink {
    writer: BufWriter<std::fs::File>,
}

impl FileLogSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl LogSink for FileLogSink {
    fn write_record(&mut self, iteration_nr: u32, cost: f64) -> io::Result<()> {
        writeln!(self.writer, "IES iter:{iteration_nr} cost function: {cost}")?;
        self.writer.flush()
    }
}

/// A sink that discards every record; the default when no log path is
/// configured.
#[derive(Debug, Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn write_record(&mut self, _iteration_nr: u32, _cost: f64) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory sink used by tests that want to assert on the emitted records
/// without touching the filesystem.
#[derive(Debug, Default)]
pub struct RecordingLogSink {
    pub records: Vec<(u32, f64)>,
}

impl LogSink for RecordingLogSink {
    fn write_record(&mut self, iteration_nr: u32, cost: f64) -> io::Result<()> {
        self.records.push((iteration_nr, cost));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_accumulates_in_order() {
        let mut sink = RecordingLogSink::default();
        sink.write_record(1, 10.0).unwrap();
        sink.write_record(2, 5.0).unwrap();
        assert_eq!(sink.records, vec![(1, 10.0), (2, 5.0)]);
    }

    #[test]
    fn file_sink_appends_literal_format() {
        let dir = std::env::temp_dir().join(format!("ies_logsink_test_{:p}", &dir_marker()));
        let _ = std::fs::remove_file(&dir);
        {
            let mut sink = FileLogSink::open(&dir).unwrap();
            sink.write_record(3, 1.25).unwrap();
        }
        let contents = std::fs::read_to_string(&dir).unwrap();
        assert_eq!(contents, "IES iter:3 cost function: 1.25\n");
        let _ = std::fs::remove_file(&dir);
    }

    fn dir_marker() -> Box<u8> {
        Box::new(0)
    }
}
