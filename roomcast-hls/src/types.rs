//! Common types used throughout the HLS bridge

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a room; also names the room's output directory
    RoomId
);
impl RoomId {
    /// Whether the id can name a directory directly below the output roots
    ///
    /// Rejects empty ids, path separators, `..` and absolute paths, so a room
    /// never resolves outside `playlist_dir` or `sdp_dir`.
    #[must_use]
    pub fn is_valid_dir_name(&self) -> bool {
        let id = self.as_str();
        !id.is_empty()
            && id != "."
            && !id.contains(['/', '\\', '\0'])
            && !id.contains("..")
            && !Path::new(id).is_absolute()
    }
}

string_id!(
    /// Identifier of a participant (peer) inside a room
    ParticipantId
);
string_id!(
    /// Media engine identifier of an inbound producer
    ProducerId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTP and RTCP destination ports of one relayed stream
///
/// Both values come from the pool independently; `rtcp == rtp + 1` only
/// holds because of allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

/// Ports reserved for one full participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPorts {
    pub participant_id: ParticipantId,
    pub video: PortPair,
    pub audio: PortPair,
}

impl UserPorts {
    /// All four port numbers in allocation order
    #[must_use]
    pub const fn ports(&self) -> [u16; 4] {
        [self.video.rtp, self.video.rtcp, self.audio.rtp, self.audio.rtcp]
    }
}

/// Producers a participant currently publishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProducers {
    pub video: Option<ProducerId>,
    pub audio: Option<ProducerId>,
}

impl ParticipantProducers {
    #[must_use]
    pub fn new(video: Option<ProducerId>, audio: Option<ProducerId>) -> Self {
        Self { video, audio }
    }

    /// Only participants publishing both kinds enter the pipeline
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.video.is_some() && self.audio.is_some()
    }
}

/// Producer set of a room as handed over by the signaling layer
///
/// Insertion order is participant order: it drives port allocation,
/// descriptor section order and layout slot order alike.
pub type ProducerSnapshot = IndexMap<ParticipantId, ParticipantProducers>;

/// A participant admitted into a generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FullParticipant {
    pub id: ParticipantId,
    pub video: ProducerId,
    pub audio: ProducerId,
}

/// Filter a snapshot down to participants with both audio and video
pub(crate) fn full_participants(snapshot: &ProducerSnapshot) -> Vec<FullParticipant> {
    snapshot
        .iter()
        .filter_map(|(id, producers)| match (&producers.video, &producers.audio) {
            (Some(video), Some(audio)) => Some(FullParticipant {
                id: id.clone(),
                video: video.clone(),
                audio: audio.clone(),
            }),
            _ => None,
        })
        .collect()
}
