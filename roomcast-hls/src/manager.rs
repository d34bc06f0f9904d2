//! HLS Manager - registry of room pipelines
//!
//! This module provides:
//! - One process-wide port allocator shared by every room
//! - A restart worker per room that coalesces producer snapshots (latest wins)
//! - Room limit enforcement by evicting the oldest room

use crate::engine::MediaRouter;
use crate::error::{HlsError, Result};
use crate::pipeline::HlsPipeline;
use crate::ports::PortAllocator;
use crate::types::{ProducerSnapshot, RoomId};
use dashmap::DashMap;
use roomcast_core::Config;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RoomEntry {
    pipeline: Arc<HlsPipeline>,
    /// Latest snapshot not yet applied by the worker
    pending: watch::Sender<Option<ProducerSnapshot>>,
    worker: JoinHandle<()>,
    cancel: CancellationToken,
    /// Creation order, used for eviction
    seq: u64,
}

/// Owns every room pipeline of the process
pub struct HlsManager {
    config: Arc<Config>,
    ports: Arc<PortAllocator>,
    rooms: DashMap<RoomId, RoomEntry>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl HlsManager {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hls = &config.hls;
        let ports = if hls.randomize_offset {
            PortAllocator::new(hls.base_port, hls.max_port)
        } else {
            PortAllocator::with_offset(hls.base_port, hls.max_port, 0)
        };

        info!(
            base_port = ports.base_port(),
            max_port = ports.max_port(),
            max_rooms = hls.max_rooms,
            tiers = config.quality.tiers.len(),
            "HLS manager initialized"
        );

        Self {
            ports: Arc::new(ports),
            config: Arc::new(config),
            rooms: DashMap::new(),
            next_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The allocator shared by all rooms
    #[must_use]
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Register a room and start its restart worker
    ///
    /// With `max_rooms` set and reached, the oldest room is closed first.
    pub async fn create_room(
        &self,
        room_id: RoomId,
        router: Arc<dyn MediaRouter>,
    ) -> Result<Arc<HlsPipeline>> {
        if !room_id.is_valid_dir_name() {
            return Err(HlsError::InvalidRoomId(room_id));
        }
        if self.rooms.contains_key(&room_id) {
            return Err(HlsError::RoomExists(room_id));
        }

        let max_rooms = self.config.hls.max_rooms;
        while max_rooms > 0 && self.rooms.len() >= max_rooms {
            let Some(oldest) = self.oldest_room() else {
                break;
            };
            warn!(
                room_id = %oldest,
                current_rooms = self.rooms.len(),
                max_rooms,
                "Room limit reached, evicting oldest room"
            );
            // a concurrent close may have won the race; either way it is gone
            let _ = self.close_room(&oldest).await;
        }

        let pipeline = Arc::new(HlsPipeline::new(
            room_id.clone(),
            router,
            Arc::clone(&self.ports),
            &self.config,
        )?);

        match self.rooms.entry(room_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HlsError::RoomExists(room_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (pending, pending_rx) = watch::channel(None);
                let cancel = self.shutdown.child_token();
                let worker = tokio::spawn(run_worker(
                    Arc::clone(&pipeline),
                    pending_rx,
                    cancel.clone(),
                ));

                slot.insert(RoomEntry {
                    pipeline: Arc::clone(&pipeline),
                    pending,
                    worker,
                    cancel,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                });

                info!(
                    room_id = %room_id,
                    total_rooms = self.rooms.len(),
                    "Created HLS room"
                );
                Ok(pipeline)
            }
        }
    }

    #[must_use]
    pub fn pipeline(&self, room_id: &RoomId) -> Option<Arc<HlsPipeline>> {
        self.rooms
            .get(room_id)
            .map(|entry| Arc::clone(&entry.pipeline))
    }

    /// Queue a restart; returns immediately
    ///
    /// Snapshots queued while a restart runs replace each other, so the
    /// worker only ever applies the newest one.
    pub fn request_restart(&self, room_id: &RoomId, snapshot: ProducerSnapshot) -> Result<()> {
        let entry = self
            .rooms
            .get(room_id)
            .ok_or_else(|| HlsError::RoomNotFound(room_id.clone()))?;

        let participants = snapshot.len();
        if entry.pending.send_replace(Some(snapshot)).is_some() {
            debug!(room_id = %room_id, "Superseded a pending restart");
        }
        debug!(room_id = %room_id, participants, "Queued HLS restart");
        Ok(())
    }

    /// Restart right away and wait for the outcome
    pub async fn restart_now(&self, room_id: &RoomId, snapshot: &ProducerSnapshot) -> Result<()> {
        let pipeline = self
            .pipeline(room_id)
            .ok_or_else(|| HlsError::RoomNotFound(room_id.clone()))?;
        pipeline.restart(snapshot).await
    }

    /// Stop the room's worker and destroy its pipeline
    ///
    /// A restart already in progress is allowed to finish first.
    pub async fn close_room(&self, room_id: &RoomId) -> Result<()> {
        let (_, entry) = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| HlsError::RoomNotFound(room_id.clone()))?;

        entry.cancel.cancel();
        if let Err(e) = entry.worker.await {
            warn!(room_id = %room_id, error = %e, "Restart worker ended abnormally");
        }
        entry.pipeline.destroy().await;

        info!(
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Closed HLS room"
        );
        Ok(())
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Close every room
    pub async fn shutdown(&self) {
        info!(rooms = self.rooms.len(), "Shutting down HLS manager");
        self.shutdown.cancel();

        for room_id in self.room_ids() {
            if let Err(e) = self.close_room(&room_id).await {
                debug!(room_id = %room_id, error = %e, "Room already closed");
            }
        }

        let leaked = self.ports.allocated_count();
        if leaked > 0 {
            warn!(ports = leaked, "Ports still allocated after shutdown");
        }
    }

    fn oldest_room(&self) -> Option<RoomId> {
        self.rooms
            .iter()
            .min_by_key(|entry| entry.seq)
            .map(|entry| entry.key().clone())
    }
}

async fn run_worker(
    pipeline: Arc<HlsPipeline>,
    mut pending: watch::Receiver<Option<ProducerSnapshot>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = pending.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(snapshot) = pending.borrow_and_update().clone() else {
                    continue;
                };
                // failures are logged by the pipeline and leave the room Idle
                let _ = pipeline.restart(&snapshot).await;
            }
        }
    }
    debug!(room_id = %pipeline.room_id(), "Restart worker stopped");
}
