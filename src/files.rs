//! Output sinks for acquired data (spec.md §6).
//!
//! List-mode data is a raw little-endian `u32` stream; histograms, ADC
//! traces, baselines, and run statistics are written as CSV, one file per
//! module with one column per channel. The crate owns the [`OutputSink`]
//! trait and a working file-backed default, while callers may substitute
//! their own sink — the same "provide a real implementation behind a
//! trait seam" shape `drive/mmio.rs` uses for `BusDriver`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{ApiError, ErrorCode};
use crate::fifo::FifoSink;
use crate::module::{BaselineReading, RunStatistics};

/// Where acquired data is written. Implementations must be safe to call
/// from multiple worker threads concurrently (different modules write
/// disjoint streams, but share one trait object).
pub trait OutputSink: Send + Sync {
    fn write_listmode(&self, module: usize, words: &[u32]) -> Result<(), ApiError>;
    /// `channels[c]` holds one module's worth of per-bin counts for channel `c`.
    fn write_histogram(&self, module: usize, channels: &[Vec<u32>]) -> Result<(), ApiError>;
    /// `channels[c]` holds the ADC samples for channel `c`.
    fn write_trace(&self, module: usize, channels: &[Vec<u16>]) -> Result<(), ApiError>;
    fn write_baselines(&self, module: usize, reading: &BaselineReading) -> Result<(), ApiError>;
    fn write_statistics(&self, module: usize, stats: &RunStatistics) -> Result<(), ApiError>;
}

/// File-backed sink rooted at one directory; one file per (module, kind)
/// combination, matching spec.md §6's named CSV formats.
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ApiError::new(ErrorCode::FileWriteFailure, e.to_string()))?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn append_file(&self, name: &str) -> Result<File, ApiError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name))
            .map_err(|e| ApiError::new(ErrorCode::FileWriteFailure, e.to_string()))
    }

    fn csv_header_if_new(&self, path: &Path, header: &str) -> Result<(), ApiError> {
        if !path.exists() {
            let mut f = File::create(path).map_err(|e| ApiError::new(ErrorCode::FileWriteFailure, e.to_string()))?;
            writeln!(f, "{}", header).map_err(|e| ApiError::new(ErrorCode::FileWriteFailure, e.to_string()))?;
        }
        Ok(())
    }

    fn channel_header(prefix: &str, num_channels: usize) -> String {
        let mut header = prefix.to_string();
        for c in 0..num_channels {
            header.push_str(&format!(",Chan{}", c));
        }
        header
    }
}

fn fail(e: std::io::Error) -> ApiError {
    ApiError::new(ErrorCode::FileWriteFailure, e.to_string())
}

impl OutputSink for FileSink {
    fn write_listmode(&self, module: usize, words: &[u32]) -> Result<(), ApiError> {
        let file = self.append_file(&format!("module{}.lmd", module))?;
        let mut w = BufWriter::new(file);
        for word in words {
            w.write_all(&word.to_le_bytes()).map_err(fail)?;
        }
        w.flush().map_err(fail)
    }

    fn write_histogram(&self, module: usize, channels: &[Vec<u32>]) -> Result<(), ApiError> {
        let name = format!("module{}_histogram.csv", module);
        let path = self.path(&name);
        self.csv_header_if_new(&path, &Self::channel_header("bin", channels.len()))?;
        let file = self.append_file(&name)?;
        let mut w = BufWriter::new(file);
        let bins = channels.iter().map(Vec::len).max().unwrap_or(0);
        for bin in 0..bins {
            write!(w, "{}", bin).map_err(fail)?;
            for chan in channels {
                write!(w, ",{}", chan.get(bin).copied().unwrap_or(0)).map_err(fail)?;
            }
            writeln!(w).map_err(fail)?;
        }
        w.flush().map_err(fail)
    }

    fn write_trace(&self, module: usize, channels: &[Vec<u16>]) -> Result<(), ApiError> {
        let name = format!("module{}_trace.csv", module);
        let path = self.path(&name);
        self.csv_header_if_new(&path, &Self::channel_header("bin", channels.len()))?;
        let file = self.append_file(&name)?;
        let mut w = BufWriter::new(file);
        let samples = channels.iter().map(Vec::len).max().unwrap_or(0);
        for i in 0..samples {
            write!(w, "{}", i).map_err(fail)?;
            for chan in channels {
                write!(w, ",{}", chan.get(i).copied().unwrap_or(0)).map_err(fail)?;
            }
            writeln!(w).map_err(fail)?;
        }
        w.flush().map_err(fail)
    }

    fn write_baselines(&self, module: usize, reading: &BaselineReading) -> Result<(), ApiError> {
        let name = format!("module{}_baselines.csv", module);
        let path = self.path(&name);
        self.csv_header_if_new(&path, &Self::channel_header("sample,time", reading.values.len()))?;
        let file = self.append_file(&name)?;
        let mut w = BufWriter::new(file);
        for (i, &time) in reading.timestamps.iter().enumerate() {
            write!(w, "{},{}", i, time).map_err(fail)?;
            for chan in &reading.values {
                write!(w, ",{}", chan.get(i).copied().unwrap_or(0.0)).map_err(fail)?;
            }
            writeln!(w).map_err(fail)?;
        }
        w.flush().map_err(fail)
    }

    fn write_statistics(&self, module: usize, stats: &RunStatistics) -> Result<(), ApiError> {
        let name = format!("module{}_statistics.csv", module);
        let path = self.path(&name);
        self.csv_header_if_new(&path, "channel,real_time,live_time,input_count_rate,output_count_rate")?;
        let file = self.append_file(&name)?;
        let mut w = BufWriter::new(file);
        for ch in 0..stats.live_time.len() {
            writeln!(
                w,
                "{},{},{},{},{}",
                ch, stats.real_time, stats.live_time[ch], stats.input_count_rate[ch], stats.output_count_rate[ch]
            )
            .map_err(fail)?;
        }
        w.flush().map_err(fail)
    }
}

/// Adapts any [`OutputSink`] to the FIFO worker's narrower [`FifoSink`]
/// seam (list-mode data only).
pub struct ListModeSink<'a> {
    pub sink: &'a dyn OutputSink,
}

impl FifoSink for ListModeSink<'_> {
    fn write(&self, module: usize, words: &[u32]) -> Result<(), ApiError> {
        self.sink.write_listmode(module, words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pixie16-filesink-test-{}-{:?}", tag, std::thread::current().id()))
    }

    #[test]
    fn listmode_writes_little_endian_words() {
        let root = temp_root("lmd");
        let sink = FileSink::new(&root).unwrap();
        sink.write_listmode(0, &[1, 2, 3]).unwrap();
        let bytes = std::fs::read(root.join("module0.lmd")).unwrap();
        assert_eq!(bytes, [1u8, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn histogram_csv_has_one_column_per_channel() {
        let root = temp_root("hist");
        let sink = FileSink::new(&root).unwrap();
        sink.write_histogram(0, &[vec![10, 20], vec![1, 2]]).unwrap();
        let text = std::fs::read_to_string(root.join("module0_histogram.csv")).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("bin,Chan0,Chan1"));
        assert_eq!(lines.next(), Some("0,10,1"));
        assert_eq!(lines.next(), Some("1,20,2"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn baseline_csv_carries_channel_zero_timestamps() {
        let root = temp_root("bl");
        let sink = FileSink::new(&root).unwrap();
        let reading = BaselineReading { timestamps: vec![0.0, 1.0], values: vec![vec![10.0, 11.0], vec![20.0, 21.0]] };
        sink.write_baselines(0, &reading).unwrap();
        let text = std::fs::read_to_string(root.join("module0_baselines.csv")).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("sample,time,Chan0,Chan1"));
        assert_eq!(lines.next(), Some("0,0,10,20"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn statistics_csv_has_one_row_per_channel() {
        let root = temp_root("stats");
        let sink = FileSink::new(&root).unwrap();
        let stats = RunStatistics {
            real_time: 5.0,
            live_time: vec![4.9, 4.8],
            input_count_rate: vec![100.0, 200.0],
            output_count_rate: vec![90.0, 180.0],
            hw_overflows: 0,
            host_overflows: 0,
            fifo_in: 10,
            fifo_out: 10,
        };
        sink.write_statistics(0, &stats).unwrap();
        let text = std::fs::read_to_string(root.join("module0_statistics.csv")).unwrap();
        assert_eq!(text.lines().count(), 3);
        std::fs::remove_dir_all(&root).ok();
    }
}
