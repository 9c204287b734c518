//! Outbound media
//!
//! One [`MediaSource`] reads pre-encoded frames from a file and writes them,
//! paced by the container timebase, to a single shared track. Every session
//! attaches that same track, so each sample fans out to all connected peers.

mod ivf;
mod source;

pub use ivf::IvfFrameReader;
pub use source::{MediaSource, SourceState};

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Track handle shared by every session
pub type SharedTrack = Arc<dyn TrackLocal + Send + Sync>;

/// One encoded frame and how long it plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    /// Encoded frame bytes
    pub payload: Bytes,

    /// Display duration
    pub duration: Duration,
}

/// Sequential reader of encoded frames
pub trait FrameReader: Send + 'static {
    /// MIME type of the encoded frames (e.g. `video/VP8`)
    fn mime_type(&self) -> &str;

    /// Time between consecutive frames
    fn frame_interval(&self) -> Duration;

    /// Next frame, `Ok(None)` once the input is exhausted
    fn next_frame(&mut self) -> Result<Option<Bytes>>;
}

/// Consumer of paced samples
#[async_trait]
pub trait SampleSink: Send + Sync + 'static {
    /// Deliver one sample
    async fn write_sample(&self, sample: &MediaSample) -> Result<()>;
}

#[async_trait]
impl SampleSink for TrackLocalStaticSample {
    async fn write_sample(&self, sample: &MediaSample) -> Result<()> {
        let sample = Sample {
            data: sample.payload.clone(),
            duration: sample.duration,
            ..Default::default()
        };

        TrackLocalStaticSample::write_sample(self, &sample)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to write sample: {}", e)))
    }
}

/// Open an IVF file and start relaying it on a new video track
pub fn open_ivf(path: impl AsRef<Path>) -> Result<MediaSource> {
    let reader = IvfFrameReader::open(path)?;

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: reader.mime_type().to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_string(),
        "roomcast".to_string(),
    ));

    Ok(MediaSource::start(reader, track))
}
