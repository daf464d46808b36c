//! EBS archive codec
//!
//! Binary layout:
//!
//! ```text
//! offset 0        512-byte header (JSON metadata, NUL padded)
//! offset 512      window 0
//! offset 512+W    window 1
//! ...
//! ```
//!
//! where `W = window_samples × channels × 4`. Inside a window samples are
//! interleaved frame by frame in header channel order (sample 0 of every
//! channel, then sample 1 of every channel, ...), each a little-endian f32.
//! A valid file is exactly `512 + k × W` bytes long.

mod header;
mod reader;
mod writer;

pub use header::{
    ArchiveHeader, BYTES_PER_SAMPLE, FORMAT_TAG, FORMAT_VERSION, HEADER_SIZE, MAX_METADATA_SIZE,
    PAD_BYTE,
};
pub use reader::ArchiveReader;
pub use writer::{ArchiveSink, ArchiveSummary, ArchiveWriter};

use crate::error::ComputeError;
use crate::types::Window;
use std::io::Cursor;
use std::sync::Arc;

/// Serialize one window in interleaved layout after checking it against the header
pub fn encode_window(header: &ArchiveHeader, window: &Window) -> Result<Vec<u8>, ComputeError> {
    check_window(header, window)?;
    let mut bytes = Vec::with_capacity(header.window_bytes());
    for i in 0..header.window_samples {
        for channel in &window.samples {
            bytes.extend_from_slice(&channel[i].to_le_bytes());
        }
    }
    Ok(bytes)
}

/// Deserialize window `index` from its interleaved bytes
pub fn decode_window(
    header: &ArchiveHeader,
    channels: &Arc<[String]>,
    index: u64,
    bytes: &[u8],
) -> Result<Window, ComputeError> {
    if bytes.len() != header.window_bytes() {
        return Err(ComputeError::FormatError(format!(
            "window {index} holds {} bytes, expected {}",
            bytes.len(),
            header.window_bytes()
        )));
    }
    let channel_count = header.channel_count();
    let mut samples = vec![Vec::with_capacity(header.window_samples); channel_count];
    for (n, raw) in bytes.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
        let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        samples[n % channel_count].push(value);
    }
    Ok(Window {
        session_id: header.session_id.clone(),
        channels: Arc::clone(channels),
        samples,
        start_time: header.window_start_time(index),
        sample_rate: header.sample_rate,
    })
}

/// Encode a complete archive in memory
pub fn encode_archive(header: &ArchiveHeader, windows: &[Window]) -> Result<Vec<u8>, ComputeError> {
    let mut bytes = header.encode()?;
    bytes.reserve(windows.len() * header.window_bytes());
    for window in windows {
        bytes.extend(encode_window(header, window)?);
    }
    Ok(bytes)
}

/// Decode a complete in-memory archive
pub fn decode_archive(bytes: &[u8]) -> Result<(ArchiveHeader, Vec<Window>), ComputeError> {
    let mut reader = ArchiveReader::new(Cursor::new(bytes))?;
    let windows = reader.windows().collect::<Result<Vec<_>, _>>()?;
    Ok((reader.header().clone(), windows))
}

fn check_window(header: &ArchiveHeader, window: &Window) -> Result<(), ComputeError> {
    if window.channels[..] != header.channels[..] {
        return Err(ComputeError::SchemaMismatchError(format!(
            "window channels {:?} differ from archive channels {:?}",
            window.channels, header.channels
        )));
    }
    if window.samples.len() != header.channel_count()
        || window
            .samples
            .iter()
            .any(|c| c.len() != header.window_samples)
    {
        return Err(ComputeError::SchemaMismatchError(format!(
            "window must hold {} samples on each of {} channels",
            header.window_samples,
            header.channel_count()
        )));
    }
    if window.sample_rate != header.sample_rate {
        return Err(ComputeError::SchemaMismatchError(format!(
            "window sample rate {} Hz differs from archive rate {} Hz",
            window.sample_rate, header.sample_rate
        )));
    }
    if window.session_id != header.session_id {
        return Err(ComputeError::SchemaMismatchError(format!(
            "window belongs to session '{}', archive to '{}'",
            window.session_id, header.session_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header() -> ArchiveHeader {
        ArchiveHeader::new("s", 4.0, vec!["A".into(), "B".into()], 3)
    }

    fn window(header: &ArchiveHeader, index: u64, a: [f32; 3], b: [f32; 3]) -> Window {
        Window {
            session_id: header.session_id.clone(),
            channels: Arc::from(header.channels.clone()),
            samples: vec![a.to_vec(), b.to_vec()],
            start_time: header.window_start_time(index),
            sample_rate: header.sample_rate,
        }
    }

    #[test]
    fn test_interleaved_little_endian_layout() {
        let h = header();
        let w = window(&h, 0, [1.0, 2.0, 3.0], [-1.0, -2.0, -3.0]);
        let bytes = encode_window(&h, &w).unwrap();
        assert_eq!(bytes.len(), 24);
        let expected: Vec<u8> = [1.0f32, -1.0, 2.0, -2.0, 3.0, -3.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(bytes, expected);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn test_roundtrip_preserves_bit_patterns() {
        let h = header();
        let odd = [
            f32::from_bits(0x7fc0_0001), // NaN with payload
            -0.0,
            f32::MIN_POSITIVE / 2.0, // subnormal
        ];
        let windows = vec![
            window(&h, 0, odd, [f32::INFINITY, f32::MAX, 1e-30]),
            window(&h, 1, [0.1, 0.2, 0.3], [7.0, 8.0, 9.0]),
        ];
        let bytes = encode_archive(&h, &windows).unwrap();
        assert_eq!(bytes.len(), 512 + 2 * 24);

        let (decoded_header, decoded) = decode_archive(&bytes).unwrap();
        assert_eq!(decoded_header, h);
        assert_eq!(decoded.len(), 2);
        for (orig, back) in windows.iter().zip(&decoded) {
            assert_eq!(back.start_time, orig.start_time);
            for (a, b) in orig.samples.iter().zip(&back.samples) {
                let a: Vec<u32> = a.iter().map(|v| v.to_bits()).collect();
                let b: Vec<u32> = b.iter().map(|v| v.to_bits()).collect();
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_window_schema_mismatch() {
        let h = header();
        let mut w = window(&h, 0, [0.0; 3], [0.0; 3]);
        w.channels = Arc::from(vec!["B".to_string(), "A".to_string()]);
        assert!(matches!(
            encode_window(&h, &w),
            Err(ComputeError::SchemaMismatchError(_))
        ));

        let mut w = window(&h, 0, [0.0; 3], [0.0; 3]);
        w.samples[1].pop();
        assert!(encode_window(&h, &w).is_err());

        let mut w = window(&h, 0, [0.0; 3], [0.0; 3]);
        w.sample_rate = 8.0;
        assert!(encode_window(&h, &w).is_err());
    }

    #[test]
    fn test_empty_archive_is_just_a_header() {
        let bytes = encode_archive(&header(), &[]).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let (_, windows) = decode_archive(&bytes).unwrap();
        assert!(windows.is_empty());
    }
}
