//! IVF container reader

use super::FrameReader;
use crate::{Error, Result};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::io::ivf_reader::IVFReader;

const MIME_TYPE_AV1: &str = "video/AV1";

/// Reads frames from an IVF file
///
/// The codec comes from the header FourCC and the frame interval from its
/// timebase (`numerator / denominator` seconds).
pub struct IvfFrameReader {
    reader: IVFReader<EofProbe<BufReader<File>>>,
    progress: Arc<ReadProgress>,
    mime_type: &'static str,
    frame_interval: Duration,
}

impl IvfFrameReader {
    /// Open `path` and parse the file header
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::MediaSourceError(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let progress = Arc::new(ReadProgress::default());
        let probe = EofProbe {
            inner: BufReader::new(file),
            progress: Arc::clone(&progress),
        };

        let (reader, header) = IVFReader::new(probe).map_err(|e| {
            Error::MediaSourceError(format!("Invalid IVF header in {}: {}", path.display(), e))
        })?;

        let mime_type = mime_type_for(&header.four_cc)?;
        let frame_interval =
            frame_interval(header.timebase_numerator, header.timebase_denominator)?;

        info!(
            "Opened {} ({}, {}x{}, {:?} per frame)",
            path.display(),
            mime_type,
            header.width,
            header.height,
            frame_interval
        );

        Ok(Self {
            reader,
            progress,
            mime_type,
            frame_interval,
        })
    }
}

impl FrameReader for IvfFrameReader {
    fn mime_type(&self) -> &str {
        self.mime_type
    }

    fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let frame_start = self.progress.consumed();
        match self.reader.parse_next_frame() {
            Ok((frame, _header)) => Ok(Some(frame.freeze())),
            // End of input only counts when it falls between frames
            Err(_) if self.progress.at_eof() && self.progress.consumed() == frame_start => {
                Ok(None)
            }
            Err(e) => Err(Error::MediaSourceError(format!(
                "Failed to decode IVF frame: {}",
                e
            ))),
        }
    }
}

fn mime_type_for(four_cc: &[u8; 4]) -> Result<&'static str> {
    match four_cc {
        b"VP80" => Ok(MIME_TYPE_VP8),
        b"VP90" => Ok(MIME_TYPE_VP9),
        b"AV01" => Ok(MIME_TYPE_AV1),
        other => Err(Error::MediaSourceError(format!(
            "Unsupported IVF codec {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn frame_interval(numerator: u32, denominator: u32) -> Result<Duration> {
    if numerator == 0 || denominator == 0 {
        return Err(Error::InvalidData(format!(
            "IVF timebase {}/{} is not usable",
            numerator, denominator
        )));
    }
    Ok(Duration::from_secs_f64(
        f64::from(numerator) / f64::from(denominator),
    ))
}

#[derive(Default)]
struct ReadProgress {
    consumed: AtomicU64,
    at_eof: AtomicBool,
}

impl ReadProgress {
    fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    fn at_eof(&self) -> bool {
        self.at_eof.load(Ordering::Acquire)
    }
}

/// Counts the bytes handed to the IVF parser and remembers end of file
struct EofProbe<R> {
    inner: R,
    progress: Arc<ReadProgress>,
}

impl<R: Read> Read for EofProbe<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.progress.at_eof.store(true, Ordering::Release);
        }
        self.progress.consumed.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }
}
