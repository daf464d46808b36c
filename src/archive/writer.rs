//! Append-only EBS archive writer

use super::encode_window;
use super::header::{ArchiveHeader, HEADER_SIZE};
use crate::error::ComputeError;
use crate::types::Window;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of finalizing an archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub session_id: String,
    pub windows: u64,
    pub bytes: u64,
}

/// Byte sink an archive can be written to
///
/// Besides sequential writes the writer needs to cut the sink back to the
/// last complete window after a failed write.
pub trait ArchiveSink: Write + Seek {
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl ArchiveSink for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl ArchiveSink for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.get_mut().truncate(len);
        Ok(())
    }
}

/// Sequential writer for one session archive.
///
/// The header is written once on creation. Each window is encoded in full
/// before it is written. A failed write truncates the sink back to the last
/// complete window and moves the write position there, so the next window
/// lands exactly where the failed one should have.
#[derive(Debug)]
pub struct ArchiveWriter<S = File> {
    sink: S,
    path: PathBuf,
    header: ArchiveHeader,
    windows: u64,
    /// Length of the archive up to the last complete window
    committed: u64,
}

impl ArchiveWriter<File> {
    /// Create (or truncate) an archive and write its header
    pub fn create(path: &Path, header: ArchiveHeader) -> Result<Self, ComputeError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = Self::new(file, header)?;
        writer.path = path.to_path_buf();

        info!(
            path = %path.display(),
            session_id = %writer.header.session_id,
            channels = writer.header.channel_count(),
            window_samples = writer.header.window_samples,
            "Created archive"
        );
        Ok(writer)
    }
}

impl<S: ArchiveSink> ArchiveWriter<S> {
    /// Start an archive at the beginning of `sink`, replacing its contents
    pub fn new(mut sink: S, header: ArchiveHeader) -> Result<Self, ComputeError> {
        let block = header.encode()?;
        sink.truncate(0)?;
        sink.seek(SeekFrom::Start(0))?;
        sink.write_all(&block)?;
        Ok(Self {
            sink,
            path: PathBuf::new(),
            header,
            windows: 0,
            committed: HEADER_SIZE as u64,
        })
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Archive path, empty for archives not backed by a file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Windows written so far
    pub fn windows(&self) -> u64 {
        self.windows
    }

    /// Append one window, returning its index
    pub fn append(&mut self, window: &Window) -> Result<u64, ComputeError> {
        let bytes = encode_window(&self.header, window)?;
        if let Err(e) = self.sink.write_all(&bytes) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Window write failed, rolling back to last complete window"
            );
            self.rollback()?;
            return Err(e.into());
        }
        self.committed += bytes.len() as u64;
        self.windows += 1;
        debug!(
            session_id = %self.header.session_id,
            index = self.windows - 1,
            "Archived window"
        );
        Ok(self.windows - 1)
    }

    /// Flush and close the archive
    pub fn finish(self) -> Result<ArchiveSummary, ComputeError> {
        self.finalize().map(|(summary, _)| summary)
    }

    /// Flush and close the archive, handing back the sink
    pub fn finalize(mut self) -> Result<(ArchiveSummary, S), ComputeError> {
        self.sink.truncate(self.committed)?;
        self.sink.sync()?;
        info!(
            path = %self.path.display(),
            windows = self.windows,
            bytes = self.committed,
            "Finalized archive"
        );
        let summary = ArchiveSummary {
            path: self.path,
            session_id: self.header.session_id,
            windows: self.windows,
            bytes: self.committed,
        };
        Ok((summary, self.sink))
    }

    fn rollback(&mut self) -> Result<(), ComputeError> {
        self.sink.truncate(self.committed)?;
        self.sink.seek(SeekFrom::Start(self.committed))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{decode_archive, ArchiveReader};
    use crate::config::SegmenterConfig;
    use crate::segmenter::Segmenter;
    use crate::types::SampleChunk;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concrete_scenario_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.ebs");

        let config = SegmenterConfig::new(["F3", "F4"], 512.0, 3584).with_session_id("scenario");
        let mut segmenter = Segmenter::new(config.clone()).unwrap();
        let f3: Vec<f32> = (0..7168).map(|i| (i as f32 * 0.01).sin()).collect();
        let f4: Vec<f32> = (0..7168).map(|i| (i as f32 * 0.02).cos()).collect();
        let windows = segmenter
            .push(&SampleChunk::new(0.0, vec![f3, f4]))
            .unwrap();
        assert_eq!(windows.len(), 2);

        let mut writer = ArchiveWriter::create(&path, ArchiveHeader::from_config(&config)).unwrap();
        for window in &windows {
            writer.append(window).unwrap();
        }
        let summary = writer.finish().unwrap();
        assert_eq!(summary.windows, 2);
        assert_eq!(summary.bytes, 57856);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 57856);

        let mut reader = ArchiveReader::open(&path).unwrap();
        reader.check_schema(&config).unwrap();
        assert_eq!(reader.read_window(1).unwrap().samples, windows[1].samples);
    }

    #[test]
    fn test_rejected_window_leaves_file_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strict.ebs");
        let header = ArchiveHeader::new("strict", 2.0, vec!["A".into()], 2);
        let mut writer = ArchiveWriter::create(&path, header).unwrap();

        let good = Window {
            session_id: "strict".into(),
            channels: Arc::from(vec!["A".to_string()]),
            samples: vec![vec![1.0, 2.0]],
            start_time: 0.0,
            sample_rate: 2.0,
        };
        writer.append(&good).unwrap();

        let mut bad = good.clone();
        bad.samples[0].push(3.0);
        assert!(matches!(
            writer.append(&bad),
            Err(ComputeError::SchemaMismatchError(_))
        ));
        let summary = writer.finish().unwrap();
        assert_eq!(summary.bytes, 512 + 8);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 520);
    }

    /// In-memory sink whose writes stop after a byte budget runs out
    struct FailingSink {
        inner: Cursor<Vec<u8>>,
        budget: Rc<Cell<Option<usize>>>,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.budget.get() {
                None => self.inner.write(buf),
                Some(0) => Err(io::Error::new(io::ErrorKind::Other, "device full")),
                Some(left) => {
                    let n = self.inner.write(&buf[..buf.len().min(left)])?;
                    self.budget.set(Some(left - n));
                    Ok(n)
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingSink {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl ArchiveSink for FailingSink {
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.inner.truncate(len)
        }
    }

    #[test]
    fn test_partial_write_does_not_shift_later_windows() {
        let header = ArchiveHeader::new("flaky", 4.0, vec!["A".into(), "B".into()], 4);
        let window = |i: u64| Window {
            session_id: "flaky".into(),
            channels: Arc::from(header.channels.clone()),
            samples: vec![
                vec![i as f32 + 0.5, -1.25, 3.0e-7, f32::MIN_POSITIVE],
                vec![-(i as f32), 2.5, 1.0e6, -0.0],
            ],
            start_time: header.window_start_time(i),
            sample_rate: 4.0,
        };

        let budget = Rc::new(Cell::new(None));
        let sink = FailingSink {
            inner: Cursor::new(Vec::new()),
            budget: Rc::clone(&budget),
        };
        let mut writer = ArchiveWriter::new(sink, header.clone()).unwrap();
        assert_eq!(writer.append(&window(0)).unwrap(), 0);

        // 3 bytes of the next window get through before the sink fails
        budget.set(Some(3));
        assert!(matches!(
            writer.append(&window(1)),
            Err(ComputeError::IoError(_))
        ));
        assert_eq!(writer.windows(), 1);

        budget.set(None);
        assert_eq!(writer.append(&window(1)).unwrap(), 1);
        let (summary, sink) = writer.finalize().unwrap();
        let bytes = sink.inner.into_inner();
        assert_eq!(summary.bytes, 512 + 2 * 32);
        assert_eq!(bytes.len(), 512 + 2 * 32);

        let (decoded_header, decoded) = decode_archive(&bytes).unwrap();
        assert_eq!(decoded_header.session_id, "flaky");
        assert_eq!(decoded.len(), 2);
        for (i, w) in decoded.iter().enumerate() {
            let expected = window(i as u64);
            for (a, b) in w.samples.iter().zip(&expected.samples) {
                let a: Vec<u32> = a.iter().map(|v| v.to_bits()).collect();
                let b: Vec<u32> = b.iter().map(|v| v.to_bits()).collect();
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_concurrent_readers_on_finalized_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.ebs");
        let header = ArchiveHeader::new("shared", 8.0, vec!["A".into(), "B".into()], 4);
        let mut writer = ArchiveWriter::create(&path, header.clone()).unwrap();
        for i in 0..16 {
            writer
                .append(&Window {
                    session_id: "shared".into(),
                    channels: Arc::from(header.channels.clone()),
                    samples: vec![vec![i as f32; 4], vec![(i * 2) as f32; 4]],
                    start_time: header.window_start_time(i),
                    sample_rate: 8.0,
                })
                .unwrap();
        }
        writer.finish().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let path = path.clone();
                thread::spawn(move || {
                    let mut reader = ArchiveReader::open(&path).unwrap();
                    for i in (0..16u64).rev().filter(|i| i % 4 == t) {
                        let w = reader.read_window(i).unwrap();
                        assert_eq!(w.samples[0][0], i as f32);
                        assert_eq!(w.samples[1][3], (i * 2) as f32);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
