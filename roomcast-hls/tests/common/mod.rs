//! In-memory media engine and fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use roomcast_core::{Config, QualityTier};
use roomcast_hls::engine::{
    preferred_codecs, EngineError, MediaRouter, RelayConsumer, RelayEndpoint, RtpCapabilities,
    RtpCodecParameters, RtpParameters,
};
use roomcast_hls::{
    MediaKind, ParticipantProducers, PipelineEvent, ProducerId, ProducerSnapshot,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Marker the fake transcoder writes into its working directory
pub const STARTED_MARKER: &str = "transcoder.started";

/// Everything the pipeline asked the engine to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateEndpoint {
        endpoint: String,
    },
    Connect {
        endpoint: String,
        rtp_port: u16,
        rtcp_port: u16,
    },
    Consume {
        endpoint: String,
        consumer: String,
        producer: String,
        paused: bool,
    },
    Resume {
        consumer: String,
        /// Whether the transcoder had already started when media began to flow
        transcoder_started: bool,
    },
    Keyframe {
        consumer: String,
    },
    Close {
        endpoint: String,
        ok: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStatus {
    pub paused: bool,
    pub closed: bool,
}

#[derive(Default)]
struct EngineState {
    calls: Mutex<Vec<Call>>,
    codecs: Mutex<HashMap<String, (MediaKind, RtpCodecParameters)>>,
    consumers: Mutex<HashMap<String, ConsumerStatus>>,
    endpoint_consumers: Mutex<HashMap<String, Vec<String>>>,
    open_endpoints: Mutex<HashSet<String>>,
    failing_closes: Mutex<HashSet<usize>>,
    fail_create_after: Mutex<Option<usize>>,
    started_marker: Mutex<Option<PathBuf>>,
    next_id: AtomicUsize,
    closes: AtomicUsize,
    creates: AtomicUsize,
}

impl EngineState {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Fake router plus the knobs tests use to inspect and break it
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(&self) -> Arc<dyn MediaRouter> {
        Arc::new(FakeRouter {
            state: Arc::clone(&self.state),
        })
    }

    /// Register a producer and the codec its consumers negotiate
    pub fn add_producer(&self, id: &str, kind: MediaKind, codec: RtpCodecParameters) {
        self.state.codecs.lock().insert(id.to_string(), (kind, codec));
    }

    /// Make the `nth` close call (1-based, counted over the engine lifetime) fail
    pub fn fail_close(&self, nth: usize) {
        self.state.failing_closes.lock().insert(nth);
    }

    /// Let `count` endpoint creations succeed, fail every later one
    pub fn fail_create_after(&self, count: usize) {
        *self.state.fail_create_after.lock() = Some(count);
    }

    /// File whose existence is recorded on every resume
    pub fn watch_started_marker(&self, path: PathBuf) {
        *self.state.started_marker.lock() = Some(path);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.state.calls.lock().clear();
    }

    pub fn open_endpoints(&self) -> usize {
        self.state.open_endpoints.lock().len()
    }

    pub fn consumers(&self) -> HashMap<String, ConsumerStatus> {
        self.state.consumers.lock().clone()
    }

    /// Consumers that are neither closed nor flowing
    pub fn stranded_consumers(&self) -> usize {
        self.state
            .consumers
            .lock()
            .values()
            .filter(|c| c.paused && !c.closed)
            .count()
    }
}

struct FakeRouter {
    state: Arc<EngineState>,
}

#[async_trait]
impl MediaRouter for FakeRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        preferred_codecs()
    }

    async fn create_relay_endpoint(
        &self,
        _listen_ip: IpAddr,
    ) -> Result<Arc<dyn RelayEndpoint>, EngineError> {
        let created = self.state.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.state.fail_create_after.lock() {
            if created >= limit {
                return Err(EngineError::new("create_relay_endpoint", "worker died"));
            }
        }

        let id = self.state.next_id("endpoint");
        self.state.open_endpoints.lock().insert(id.clone());
        self.state.record(Call::CreateEndpoint { endpoint: id.clone() });
        Ok(Arc::new(FakeEndpoint {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeEndpoint {
    id: String,
    state: Arc<EngineState>,
}

#[async_trait]
impl RelayEndpoint for FakeEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(
        &self,
        _remote_ip: IpAddr,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<(), EngineError> {
        self.state.record(Call::Connect {
            endpoint: self.id.clone(),
            rtp_port,
            rtcp_port,
        });
        Ok(())
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn RelayConsumer>, EngineError> {
        let (kind, codec) = self
            .state
            .codecs
            .lock()
            .get(producer_id.as_str())
            .cloned()
            .ok_or_else(|| EngineError::new("consume", format!("unknown producer {producer_id}")))?;

        let id = self.state.next_id("consumer");
        self.state
            .consumers
            .lock()
            .insert(id.clone(), ConsumerStatus { paused, closed: false });
        self.state
            .endpoint_consumers
            .lock()
            .entry(self.id.clone())
            .or_default()
            .push(id.clone());
        self.state.record(Call::Consume {
            endpoint: self.id.clone(),
            consumer: id.clone(),
            producer: producer_id.to_string(),
            paused,
        });

        Ok(Arc::new(FakeConsumer {
            id,
            kind,
            parameters: RtpParameters { codecs: vec![codec] },
            state: Arc::clone(&self.state),
        }))
    }

    fn close(&self) -> Result<(), EngineError> {
        let nth = self.state.closes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state.failing_closes.lock().contains(&nth) {
            self.state.record(Call::Close {
                endpoint: self.id.clone(),
                ok: false,
            });
            return Err(EngineError::new("close", "channel closed"));
        }

        self.state.open_endpoints.lock().remove(&self.id);
        let owned = self
            .state
            .endpoint_consumers
            .lock()
            .remove(&self.id)
            .unwrap_or_default();
        let mut consumers = self.state.consumers.lock();
        for consumer in owned {
            if let Some(status) = consumers.get_mut(&consumer) {
                status.closed = true;
            }
        }
        drop(consumers);

        self.state.record(Call::Close {
            endpoint: self.id.clone(),
            ok: true,
        });
        Ok(())
    }
}

struct FakeConsumer {
    id: String,
    kind: MediaKind,
    parameters: RtpParameters,
    state: Arc<EngineState>,
}

#[async_trait]
impl RelayConsumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.parameters
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let transcoder_started = self
            .state
            .started_marker
            .lock()
            .as_ref()
            .is_some_and(|marker| marker.exists());
        if let Some(status) = self.state.consumers.lock().get_mut(&self.id) {
            status.paused = false;
        }
        self.state.record(Call::Resume {
            consumer: self.id.clone(),
            transcoder_started,
        });
        Ok(())
    }

    async fn request_keyframe(&self) -> Result<(), EngineError> {
        self.state.record(Call::Keyframe {
            consumer: self.id.clone(),
        });
        Ok(())
    }
}

pub fn codec(mime: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>) -> RtpCodecParameters {
    RtpCodecParameters {
        mime_type: mime.to_string(),
        payload_type,
        clock_rate,
        channels,
        parameters: BTreeMap::new(),
    }
}

pub fn h264(payload_type: u8) -> RtpCodecParameters {
    let mut codec = codec("video/H264", payload_type, 90_000, None);
    codec
        .parameters
        .insert("packetization-mode".to_string(), "1".to_string());
    codec
        .parameters
        .insert("profile-level-id".to_string(), "42e01f".to_string());
    codec
}

pub fn opus(payload_type: u8) -> RtpCodecParameters {
    codec("audio/opus", payload_type, 48_000, Some(2))
}

/// Snapshot of participants that publish both kinds
///
/// Producers are registered with the engine as `<participant>-video` and
/// `<participant>-audio`, using distinct payload types per participant.
pub fn full_snapshot(engine: &FakeEngine, participants: &[&str]) -> ProducerSnapshot {
    let mut snapshot = ProducerSnapshot::new();
    for (i, participant) in participants.iter().enumerate() {
        let offset = u8::try_from(i).unwrap() * 2;
        let video = format!("{participant}-video");
        let audio = format!("{participant}-audio");
        engine.add_producer(&video, MediaKind::Video, h264(102 + offset));
        engine.add_producer(&audio, MediaKind::Audio, opus(100 + offset));
        snapshot.insert(
            (*participant).into(),
            ParticipantProducers::new(Some(video.into()), Some(audio.into())),
        );
    }
    snapshot
}

/// Shell script standing in for the encoder: marks its start, then idles
pub fn fake_transcoder_script() -> String {
    format!("echo started > {STARTED_MARKER}; exec sleep 30")
}

/// Configuration with short delays and the fake transcoder
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.hls.base_port = 30000;
    config.hls.max_port = 30100;
    config.hls.randomize_offset = false;
    config.hls.playlist_dir = root.join("hls");
    config.hls.sdp_dir = root.join("hls");
    config.hls.warmup_ms = 300;
    config.hls.port_settle_ms = 20;
    config.hls.stop_timeout_ms = 2000;
    config.hls.keyframe_retries = 2;
    config.hls.keyframe_interval_ms = 10;

    config.transcoder.program = "/bin/sh".to_string();
    config.transcoder.pre_args = vec![
        "-c".to_string(),
        fake_transcoder_script(),
        "transcoder".to_string(),
    ];
    config
}

pub fn single_tier(config: &mut Config) {
    config.quality.tiers = vec![QualityTier::preset("720p").unwrap()];
}

/// Next event matching `pred`, skipping others
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<PipelineEvent>,
    mut pred: F,
) -> PipelineEvent
where
    F: FnMut(&PipelineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for pipeline event")
}
