//! Random-access EBS archive reader

use super::header::{ArchiveHeader, HEADER_SIZE};
use super::decode_window;
use crate::config::SegmenterConfig;
use crate::error::ComputeError;
use crate::types::Window;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Reader over a finalized archive.
///
/// The file size is validated on open; any window can then be read directly
/// at `512 + i × window_bytes` without scanning earlier windows. Archives are
/// immutable once finalized, so independent readers may be opened on the same
/// file from several threads.
#[derive(Debug)]
pub struct ArchiveReader<R> {
    inner: R,
    header: ArchiveHeader,
    channels: Arc<[String]>,
    windows: u64,
}

impl ArchiveReader<File> {
    pub fn open(path: &Path) -> Result<Self, ComputeError> {
        let reader = Self::new(File::open(path)?)?;
        debug!(
            path = %path.display(),
            session_id = %reader.header.session_id,
            windows = reader.windows,
            "Opened archive"
        );
        Ok(reader)
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn new(mut inner: R) -> Result<Self, ComputeError> {
        let size = inner.seek(SeekFrom::End(0))?;
        if size < HEADER_SIZE as u64 {
            return Err(ComputeError::FormatError(format!(
                "archive is {size} bytes, shorter than the {HEADER_SIZE}-byte header"
            )));
        }

        inner.seek(SeekFrom::Start(0))?;
        let mut block = vec![0u8; HEADER_SIZE];
        inner.read_exact(&mut block)?;
        let header = ArchiveHeader::decode(&block)?;

        let data = size - HEADER_SIZE as u64;
        let window_bytes = header.window_bytes() as u64;
        if data % window_bytes != 0 {
            return Err(ComputeError::FormatError(format!(
                "archive size {size} is not 512 + k × {window_bytes}; last window is truncated"
            )));
        }

        let channels = Arc::from(header.channels.clone());
        Ok(Self {
            inner,
            windows: data / window_bytes,
            header,
            channels,
        })
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Number of windows in the archive
    pub fn len(&self) -> u64 {
        self.windows
    }

    pub fn is_empty(&self) -> bool {
        self.windows == 0
    }

    /// Fail unless the archive was written with the given session parameters
    pub fn check_schema(&self, config: &SegmenterConfig) -> Result<(), ComputeError> {
        self.header.check_schema(config)
    }

    /// Read window `index` directly
    pub fn read_window(&mut self, index: u64) -> Result<Window, ComputeError> {
        if index >= self.windows {
            return Err(ComputeError::FormatError(format!(
                "window {index} is out of range, archive holds {}",
                self.windows
            )));
        }
        self.inner
            .seek(SeekFrom::Start(self.header.window_offset(index)))?;
        let mut bytes = vec![0u8; self.header.window_bytes()];
        self.inner.read_exact(&mut bytes)?;
        decode_window(&self.header, &self.channels, index, &bytes)
    }

    /// Read window `index`, failing if the archive disagrees with the session
    pub fn read_window_checked(
        &mut self,
        index: u64,
        config: &SegmenterConfig,
    ) -> Result<Window, ComputeError> {
        self.check_schema(config)?;
        self.read_window(index)
    }

    /// Iterate over all windows in order
    pub fn windows(&mut self) -> impl Iterator<Item = Result<Window, ComputeError>> + '_ {
        (0..self.windows).map(move |i| self.read_window(i))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
