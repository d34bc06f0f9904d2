use crate::types::RoomId;
use serde::Serialize;

/// Notifications published by a room pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A new generation is serving output; players should reload after a
    /// grace period for the first segments
    Restarted {
        room_id: RoomId,
        timestamp_ms: i64,
        participant_count: usize,
    },

    /// The room has no complete participants left and serves nothing
    Stopped { room_id: RoomId },

    /// The transcoder of a live generation exited on its own
    ///
    /// Nothing restarts it; the next producer change rebuilds the room.
    TranscoderExited {
        room_id: RoomId,
        generation: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl PipelineEvent {
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        match self {
            Self::Restarted { room_id, .. }
            | Self::Stopped { room_id }
            | Self::TranscoderExited { room_id, .. } => room_id,
        }
    }
}
