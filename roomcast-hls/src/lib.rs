//! Roomcast HLS bridge
//!
//! Turns the WebRTC producers of one room into a single composited,
//! adaptive-bitrate HLS stream. Every change of the room's producer set
//! tears down the previous pipeline generation and builds a new one.
//!
//! ## Architecture
//!
//! - **`PortAllocator`**: RTP/RTCP port pool shared by all rooms
//! - **`LayoutCompositor`**: grid filter graph for 1-4 participants
//! - **`SessionDescriptor`**: one SDP document listing every relayed stream
//! - **`Transcoder`**: argument vector, spawn and lifecycle of the encoder process
//! - **`HlsPipeline`**: per-room generation state machine
//! - **`HlsManager`**: multi-room registry with coalescing restart workers
//!
//! The media engine itself is consumed through the traits in [`engine`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_hls::{HlsManager, ProducerSnapshot};
//!
//! let manager = HlsManager::new(config);
//! manager.create_room("room_id".into(), router).await?;
//! manager.request_restart(&"room_id".into(), snapshot)?;
//! ```

pub mod cleanup;
pub mod engine;
mod error;
mod events;
mod layout;
mod manager;
mod pipeline;
mod ports;
mod quality;
mod sdp;
mod transcoder;
mod types;

pub use error::{HlsError, Result};
pub use events::PipelineEvent;
pub use layout::{LayoutCompositor, MAX_PARTICIPANTS};
pub use manager::HlsManager;
pub use pipeline::{GenerationInfo, HlsPipeline, PipelineState};
pub use ports::PortAllocator;
pub use quality::master_manifest;
pub use sdp::{MediaStreamParams, ParticipantMedia, SessionDescriptor, DESCRIPTOR_FILE_NAME};
pub use transcoder::{Transcoder, TranscoderExit, TranscoderHandle, TranscoderState};
pub use types::{
    MediaKind, ParticipantId, ParticipantProducers, PortPair, ProducerId, ProducerSnapshot,
    RoomId, UserPorts,
};
