use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineError;
use crate::types::RoomId;

#[derive(Error, Debug)]
pub enum HlsError {
    #[error("No available ports in range {base}..{max}")]
    PortExhaustion { base: u16, max: u16 },

    #[error("Unsupported participant count: {0} (layouts exist for 1-4)")]
    UnsupportedLayout(usize),

    #[error("Transcoder failed to start: {0}")]
    SubprocessStart(String),

    #[error("Failed to write session descriptor {}: {source}", path.display())]
    DescriptorWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Keyframe request failed after {attempts} attempts")]
    KeyframeRequest { attempts: u32 },

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Room {0} already exists")]
    RoomExists(RoomId),

    #[error("Room id {0:?} cannot name an output directory")]
    InvalidRoomId(RoomId),

    #[error("Room {0} not found")]
    RoomNotFound(RoomId),
}

pub type Result<T> = std::result::Result<T, HlsError>;
