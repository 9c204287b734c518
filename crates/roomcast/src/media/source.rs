//! Paced, single-pass sample producer

use super::{FrameReader, MediaSample, SampleSink, SharedTrack};
use crate::transport::PeerTransport;
use crate::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Progress of a [`MediaSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    /// Producing samples; `frames` written so far
    Running { frames: u64 },
    /// Input ran out after `frames` samples; nothing more will be produced
    Exhausted { frames: u64 },
    /// Decoding failed; nothing more will be produced
    Failed(String),
}

impl SourceState {
    /// Whether the source may still produce samples
    pub fn is_running(&self) -> bool {
        matches!(self, SourceState::Running { .. })
    }
}

/// Running media producer
///
/// Production starts in [`MediaSource::start`] and runs once through the
/// input. There is no rewind: sessions attached after exhaustion get a
/// silent track.
pub struct MediaSource {
    track: SharedTrack,
    state: watch::Receiver<SourceState>,
    task: JoinHandle<()>,
}

impl MediaSource {
    /// Start relaying `reader` onto `track`
    pub fn start<R: FrameReader>(reader: R, track: Arc<TrackLocalStaticSample>) -> Self {
        let shared: SharedTrack = track.clone();
        Self::start_with_sink(reader, track, shared)
    }

    /// Start relaying `reader` into `sink`; sessions attach `track`
    pub fn start_with_sink<R, S>(reader: R, sink: Arc<S>, track: SharedTrack) -> Self
    where
        R: FrameReader,
        S: SampleSink,
    {
        let (state_tx, state) = watch::channel(SourceState::Running { frames: 0 });
        let task = tokio::spawn(run(reader, sink, state_tx));

        Self { track, state, task }
    }

    /// The outbound track shared by every session
    pub fn track(&self) -> SharedTrack {
        Arc::clone(&self.track)
    }

    /// Bind the shared track to a session's transport
    pub async fn attach(&self, transport: &dyn PeerTransport) -> Result<()> {
        transport.add_track(self.track()).await
    }

    /// Current progress
    pub fn state(&self) -> SourceState {
        self.state.borrow().clone()
    }

    /// Wait until production has stopped, returning the final state
    pub async fn finished(&self) -> SourceState {
        let mut state = self.state.clone();
        let result = state.wait_for(|s| !s.is_running()).await.map(|s| s.clone());
        match result {
            Ok(final_state) => final_state,
            Err(_) => state.borrow().clone(),
        }
    }

    /// Stop producing
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<R, S>(mut reader: R, sink: Arc<S>, state: watch::Sender<SourceState>)
where
    R: FrameReader,
    S: SampleSink,
{
    let interval = reader.frame_interval();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Media source started ({}, {:?} per frame)",
        reader.mime_type(),
        interval
    );

    let mut frames = 0u64;
    loop {
        ticker.tick().await;

        match reader.next_frame() {
            Ok(Some(payload)) => {
                let sample = MediaSample {
                    payload,
                    duration: interval,
                };
                // A write gets at most one frame interval; late samples are dropped
                match time::timeout(interval, sink.write_sample(&sample)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Sample {} not delivered: {}", frames, e),
                    Err(_) => warn!("Sample {} dropped, consumer slower than {:?}", frames, interval),
                }
                frames += 1;
                state.send_replace(SourceState::Running { frames });
            }
            Ok(None) => {
                info!("Media source exhausted after {} frames", frames);
                state.send_replace(SourceState::Exhausted { frames });
                return;
            }
            Err(e) => {
                error!("Media source failed after {} frames: {}", frames, e);
                state.send_replace(SourceState::Failed(e.to_string()));
                return;
            }
        }
    }
}
