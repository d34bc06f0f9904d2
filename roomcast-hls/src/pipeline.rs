//! Per-room pipeline generations
//!
//! A generation is one complete build of a room's resources: ports, relay
//! endpoints and consumers, session descriptor and the transcoder process.
//! Every restart tears the current generation down and builds a fresh one;
//! nothing is patched in place.

use crate::cleanup::PID_FILE_NAME;
use crate::engine::{MediaRouter, RelayConsumer, RelayEndpoint};
use crate::error::{HlsError, Result};
use crate::events::PipelineEvent;
use crate::layout::LayoutCompositor;
use crate::ports::PortAllocator;
use crate::quality::{master_manifest, tier_dirs};
use crate::sdp::{MediaStreamParams, ParticipantMedia, SessionDescriptor};
use crate::transcoder::{Transcoder, TranscoderHandle};
use crate::types::{
    full_participants, FullParticipant, MediaKind, ParticipantId, PortPair, ProducerSnapshot,
    RoomId, UserPorts,
};
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use roomcast_core::{Config, HlsConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// No generation
    Idle,
    Building,
    /// A generation is serving output
    Active,
    TearingDown,
}

/// Read-only view of the live generation
#[derive(Debug, Clone)]
pub struct GenerationInfo {
    pub id: u64,
    pub participants: Vec<ParticipantId>,
    pub user_ports: Vec<UserPorts>,
    pub filter_graph: String,
    pub args: Vec<String>,
    pub descriptor_path: PathBuf,
    /// Multi-variant playlist written by the transcoder
    pub playlist_path: PathBuf,
    /// Manifest written by the pipeline itself
    pub manifest_path: PathBuf,
    pub output_dir: PathBuf,
    pub transcoder: TranscoderHandle,
}

type RelayKey = (ParticipantId, MediaKind);

/// Everything one build has created so far
///
/// Stored before the first engine call so a teardown of a half-built
/// generation still finds every resource.
struct Generation {
    id: u64,
    user_ports: Vec<UserPorts>,
    endpoints: IndexMap<RelayKey, Arc<dyn RelayEndpoint>>,
    consumers: IndexMap<RelayKey, Arc<dyn RelayConsumer>>,
    filter_graph: String,
    args: Vec<String>,
    descriptor_path: Option<PathBuf>,
    transcoder: Option<TranscoderHandle>,
    exit_watch: Option<JoinHandle<()>>,
    keyframe_tasks: Vec<JoinHandle<()>>,
}

impl Generation {
    fn new(id: u64, user_ports: Vec<UserPorts>) -> Self {
        Self {
            id,
            user_ports,
            endpoints: IndexMap::new(),
            consumers: IndexMap::new(),
            filter_graph: String::new(),
            args: Vec::new(),
            descriptor_path: None,
            transcoder: None,
            exit_watch: None,
            keyframe_tasks: Vec::new(),
        }
    }

    fn endpoint(&self, id: &ParticipantId, kind: MediaKind) -> Result<&Arc<dyn RelayEndpoint>> {
        self.endpoints
            .get(&(id.clone(), kind))
            .ok_or_else(|| missing("endpoint", id, kind))
    }

    fn consumer(&self, id: &ParticipantId, kind: MediaKind) -> Result<&Arc<dyn RelayConsumer>> {
        self.consumers
            .get(&(id.clone(), kind))
            .ok_or_else(|| missing("consumer", id, kind))
    }
}

fn missing(what: &'static str, id: &ParticipantId, kind: MediaKind) -> HlsError {
    crate::engine::EngineError::new(what, format!("no {kind} {what} for participant {id}")).into()
}

/// Composited HLS output of one room
pub struct HlsPipeline {
    room_id: RoomId,
    router: Arc<dyn MediaRouter>,
    ports: Arc<PortAllocator>,
    hls: HlsConfig,
    transcoder: Transcoder,
    abort_on_early_exit: bool,
    descriptor: SessionDescriptor,
    compositor: LayoutCompositor,
    master_playlist_name: String,

    /// Current generation; held for the whole of a restart or teardown
    generation: Mutex<Option<Generation>>,
    state: RwLock<PipelineState>,
    info: RwLock<Option<GenerationInfo>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<PipelineEvent>,
}

impl std::fmt::Debug for HlsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HlsPipeline")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl HlsPipeline {
    /// `router` is borrowed capability only; the pipeline never owns the room
    ///
    /// Fails with [`HlsError::InvalidRoomId`] when the id cannot be used as a
    /// directory name below the output roots.
    pub fn new(
        room_id: RoomId,
        router: Arc<dyn MediaRouter>,
        ports: Arc<PortAllocator>,
        config: &Config,
    ) -> Result<Self> {
        if !room_id.is_valid_dir_name() {
            return Err(HlsError::InvalidRoomId(room_id));
        }

        let tiers = config.quality.tiers.clone();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            compositor: LayoutCompositor::new(tiers.len()),
            transcoder: Transcoder::new(config.transcoder.clone(), tiers),
            abort_on_early_exit: config.transcoder.abort_on_early_exit,
            master_playlist_name: config.transcoder.master_playlist_name.clone(),
            descriptor: SessionDescriptor::new(config.hls.transcoder_ip),
            hls: config.hls.clone(),
            room_id,
            router,
            ports,
            generation: Mutex::new(None),
            state: RwLock::new(PipelineState::Idle),
            info: RwLock::new(None),
            next_generation: AtomicU64::new(0),
            events,
        })
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    /// The generation currently serving output, if any
    #[must_use]
    pub fn current(&self) -> Option<GenerationInfo> {
        self.info.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.hls.room_output_dir(self.room_id.as_str())
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Rebuild the room for `snapshot`
    ///
    /// Restarts of one pipeline are serialized. On failure the partial
    /// generation is torn down, the room is left Idle and the error returned.
    pub async fn restart(&self, snapshot: &ProducerSnapshot) -> Result<()> {
        let mut slot = self.generation.lock().await;
        let participants = full_participants(snapshot);

        info!(
            room_id = %self.room_id,
            producers = snapshot.len(),
            participants = participants.len(),
            "Restarting HLS pipeline"
        );

        if participants.is_empty() {
            let was_live = slot.is_some();
            self.teardown(&mut slot).await;
            self.remove_output().await;
            self.set_state(PipelineState::Idle);
            if was_live {
                info!(room_id = %self.room_id, "No complete participants left, HLS stopped");
                self.emit(PipelineEvent::Stopped {
                    room_id: self.room_id.clone(),
                });
            }
            return Ok(());
        }

        self.teardown(&mut slot).await;
        self.set_state(PipelineState::Building);

        match self.build(&mut slot, &participants).await {
            Ok(info) => {
                let generation = info.id;
                *self.info.write() = Some(info);
                self.set_state(PipelineState::Active);

                info!(
                    room_id = %self.room_id,
                    generation,
                    participants = participants.len(),
                    "HLS pipeline restarted"
                );
                self.emit(PipelineEvent::Restarted {
                    room_id: self.room_id.clone(),
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                    participant_count: participants.len(),
                });
                Ok(())
            }
            Err(e) => {
                error!(room_id = %self.room_id, error = %e, "HLS pipeline restart failed");
                self.teardown(&mut slot).await;
                self.remove_output().await;
                self.set_state(PipelineState::Idle);
                Err(e)
            }
        }
    }

    /// Tear down the current generation and remove the room's output
    pub async fn destroy(&self) {
        let mut slot = self.generation.lock().await;
        self.teardown(&mut slot).await;
        self.remove_output().await;
        self.set_state(PipelineState::Idle);
        info!(room_id = %self.room_id, "HLS pipeline destroyed");
    }

    async fn build(
        &self,
        slot: &mut Option<Generation>,
        participants: &[FullParticipant],
    ) -> Result<GenerationInfo> {
        let id = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let ids: Vec<ParticipantId> = participants.iter().map(|p| p.id.clone()).collect();

        let user_ports = self.ports.allocate_for_participants(&ids)?;
        let generation = slot.insert(Generation::new(id, user_ports.clone()));

        // Endpoints of different participants are independent, so create
        // them all at once and keep whatever succeeded for teardown.
        let listen_ip = self.hls.listen_ip;
        let router = &self.router;
        let created = join_all(participants.iter().flat_map(|p| {
            [MediaKind::Video, MediaKind::Audio].map(|kind| {
                let participant_id = p.id.clone();
                async move {
                    let endpoint = router.create_relay_endpoint(listen_ip).await;
                    (participant_id, kind, endpoint)
                }
            })
        }))
        .await;

        let mut first_error = None;
        for (participant_id, kind, endpoint) in created {
            match endpoint {
                Ok(endpoint) => {
                    generation.endpoints.insert((participant_id, kind), endpoint);
                }
                Err(e) => {
                    warn!(
                        room_id = %self.room_id,
                        participant_id = %participant_id,
                        kind = %kind,
                        error = %e,
                        "Failed to create relay endpoint"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e.into());
        }

        generation.filter_graph = self.compositor.build(participants.len())?;

        let output_dir = self.output_dir();
        tokio::fs::create_dir_all(&output_dir).await?;
        for dir in tier_dirs(&output_dir, self.transcoder.tiers().len()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        for ports in &user_ports {
            self.connect(generation, &ports.participant_id, MediaKind::Video, ports.video)
                .await?;
            self.connect(generation, &ports.participant_id, MediaKind::Audio, ports.audio)
                .await?;
        }

        // Paused until the transcoder listens, or the first keyframes are lost
        let capabilities = self.router.rtp_capabilities();
        for participant in participants {
            for (kind, producer) in [
                (MediaKind::Video, &participant.video),
                (MediaKind::Audio, &participant.audio),
            ] {
                let consumer = generation
                    .endpoint(&participant.id, kind)?
                    .consume(producer, &capabilities, true)
                    .await?;
                generation
                    .consumers
                    .insert((participant.id.clone(), kind), consumer);
            }
        }
        debug!(
            room_id = %self.room_id,
            consumers = generation.consumers.len(),
            "Created paused relay consumers"
        );

        let media = user_ports
            .iter()
            .map(|ports| {
                Ok(ParticipantMedia {
                    participant_id: ports.participant_id.clone(),
                    video: Some(stream_params(generation, ports, MediaKind::Video)?),
                    audio: Some(stream_params(generation, ports, MediaKind::Audio)?),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let descriptor_path = self
            .descriptor
            .generate(&media, &self.hls.room_sdp_dir(self.room_id.as_str()))
            .await?;
        generation.descriptor_path = Some(descriptor_path.clone());

        let (transcoder, args) =
            self.transcoder
                .start(&descriptor_path, &output_dir, &generation.filter_graph)?;
        generation.transcoder = Some(transcoder.clone());
        generation.args = args;
        generation.exit_watch = Some(self.watch_exit(id, &transcoder));
        self.write_pid_file(&output_dir, &transcoder).await;

        if let Some(exit) = transcoder.warm_up(self.hls.warmup()).await {
            if self.abort_on_early_exit {
                return Err(HlsError::SubprocessStart(format!(
                    "transcoder exited during warm-up (code {:?}, signal {:?})",
                    exit.code, exit.signal
                )));
            }
            warn!(
                room_id = %self.room_id,
                code = ?exit.code,
                signal = ?exit.signal,
                "Transcoder exited during warm-up"
            );
        }

        for participant in participants {
            let video = Arc::clone(generation.consumer(&participant.id, MediaKind::Video)?);
            video.resume().await?;
            generation.keyframe_tasks.push(self.spawn_keyframe_requests(video));

            generation
                .consumer(&participant.id, MediaKind::Audio)?
                .resume()
                .await?;
        }

        let manifest_path = output_dir.join(&self.hls.manifest_name);
        tokio::fs::write(&manifest_path, master_manifest(self.transcoder.tiers())).await?;

        Ok(GenerationInfo {
            id,
            participants: ids,
            user_ports,
            filter_graph: generation.filter_graph.clone(),
            args: generation.args.clone(),
            descriptor_path,
            playlist_path: output_dir.join(&self.master_playlist_name),
            manifest_path,
            output_dir,
            transcoder,
        })
    }

    async fn connect(
        &self,
        generation: &Generation,
        participant_id: &ParticipantId,
        kind: MediaKind,
        ports: PortPair,
    ) -> Result<()> {
        generation
            .endpoint(participant_id, kind)?
            .connect(self.hls.transcoder_ip, ports.rtp, ports.rtcp)
            .await?;
        debug!(
            room_id = %self.room_id,
            participant_id = %participant_id,
            kind = %kind,
            rtp_port = ports.rtp,
            rtcp_port = ports.rtcp,
            "Connected relay endpoint"
        );
        Ok(())
    }

    fn spawn_keyframe_requests(&self, consumer: Arc<dyn RelayConsumer>) -> JoinHandle<()> {
        let room_id = self.room_id.clone();
        let attempts = self.hls.keyframe_retries;
        let interval = self.hls.keyframe_interval();
        tokio::spawn(async move {
            if let Err(e) = request_keyframes(consumer.as_ref(), attempts, interval).await {
                warn!(
                    room_id = %room_id,
                    consumer_id = consumer.id(),
                    error = %e,
                    "Giving up on keyframe requests"
                );
            }
        })
    }

    /// Report a transcoder that exits while its generation is live
    fn watch_exit(&self, generation: u64, transcoder: &TranscoderHandle) -> JoinHandle<()> {
        let mut exit_rx = transcoder.exit_watch();
        let events = self.events.clone();
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            let Ok(exit) = exit_rx.wait_for(Option::is_some).await.map(|exit| *exit) else {
                return;
            };
            let Some(exit) = exit else { return };
            warn!(
                room_id = %room_id,
                generation,
                code = ?exit.code,
                signal = ?exit.signal,
                "Transcoder exited unexpectedly; waiting for the next producer change"
            );
            let _ = events.send(PipelineEvent::TranscoderExited {
                room_id,
                generation,
                code: exit.code,
                signal: exit.signal,
            });
        })
    }

    async fn write_pid_file(&self, output_dir: &Path, transcoder: &TranscoderHandle) {
        let Some(pid) = transcoder.pid() else { return };
        if let Err(e) = tokio::fs::write(output_dir.join(PID_FILE_NAME), pid.to_string()).await {
            warn!(room_id = %self.room_id, error = %e, "Failed to write transcoder pid file");
        }
    }

    /// Release everything the current generation holds
    ///
    /// Best effort: a failing step is logged and the remaining resources are
    /// still released. The transcoder is stopped before ports go back to the
    /// pool, with a settle delay after each so sockets are really closed.
    async fn teardown(&self, slot: &mut Option<Generation>) {
        let Some(generation) = slot.take() else {
            return;
        };
        self.set_state(PipelineState::TearingDown);
        *self.info.write() = None;

        info!(room_id = %self.room_id, generation = generation.id, "Tearing down HLS generation");

        if let Some(task) = &generation.exit_watch {
            task.abort();
        }
        for task in &generation.keyframe_tasks {
            task.abort();
        }

        if let Some(transcoder) = &generation.transcoder {
            transcoder.stop(self.hls.stop_timeout()).await;
            self.settle().await;
        }

        for ((participant_id, kind), endpoint) in &generation.endpoints {
            if let Err(e) = endpoint.close() {
                warn!(
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    kind = %kind,
                    endpoint_id = endpoint.id(),
                    error = %e,
                    "Failed to close relay endpoint"
                );
            }
        }

        for ports in &generation.user_ports {
            self.ports.release_for_participant(ports);
        }
        if !generation.user_ports.is_empty() {
            self.settle().await;
        }
    }

    async fn settle(&self) {
        let delay = self.hls.port_settle();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn remove_output(&self) {
        let mut dirs = vec![self.output_dir()];
        let sdp_dir = self.hls.room_sdp_dir(self.room_id.as_str());
        if !dirs.contains(&sdp_dir) {
            dirs.push(sdp_dir);
        }

        for dir in dirs {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(room_id = %self.room_id, path = %dir.display(), "Removed room output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    room_id = %self.room_id,
                    path = %dir.display(),
                    error = %e,
                    "Failed to remove room output"
                ),
            }
        }
    }
}

fn stream_params(
    generation: &Generation,
    ports: &UserPorts,
    kind: MediaKind,
) -> Result<MediaStreamParams> {
    let consumer = generation.consumer(&ports.participant_id, kind)?;
    let codec = consumer
        .rtp_parameters()
        .primary_codec()
        .cloned()
        .ok_or_else(|| {
            crate::engine::EngineError::new(
                "consume",
                format!("consumer {} negotiated no codec", consumer.id()),
            )
        })?;
    Ok(MediaStreamParams {
        kind,
        ports: match kind {
            MediaKind::Video => ports.video,
            MediaKind::Audio => ports.audio,
        },
        codec,
    })
}

/// Ask for a keyframe `attempts` times, `interval` apart
///
/// A successful request does not mean a keyframe arrives, so every attempt
/// is made. Fails only if none of them went through.
pub(crate) async fn request_keyframes(
    consumer: &dyn RelayConsumer,
    attempts: u32,
    interval: Duration,
) -> Result<u32> {
    let mut delivered = 0;
    for attempt in 1..=attempts {
        match consumer.request_keyframe().await {
            Ok(()) => {
                delivered += 1;
                debug!(consumer_id = consumer.id(), attempt, attempts, "Requested keyframe");
            }
            Err(e) => {
                debug!(consumer_id = consumer.id(), attempt, error = %e, "Keyframe request failed");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    if delivered == 0 && attempts > 0 {
        return Err(HlsError::KeyframeRequest { attempts });
    }
    Ok(delivered)
}
