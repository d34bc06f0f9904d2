//! Media engine capability interface
//!
//! The bridge never touches RTP itself. It drives an external media engine
//! (router, relay endpoints, relay consumers) through the traits below; a
//! room's router is handed to its pipeline at construction and only borrowed
//! from there, the room keeps ownership.

use crate::types::{MediaKind, ProducerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by the media engine
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {message}")]
pub struct EngineError {
    pub operation: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Negotiated codec of a relay consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCodecParameters {
    /// e.g. `video/H264`, `audio/opus`
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl RtpCodecParameters {
    /// Encoding name as used in an `rtpmap` attribute
    #[must_use]
    pub fn encoding_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map_or(self.mime_type.as_str(), |(_, name)| name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodecParameters>,
}

impl RtpParameters {
    /// The codec the stream is actually sent with
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

/// Codec a router is able to route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

/// Router codec list for rooms bridged to HLS
///
/// H264 is listed ahead of VP8/VP9 so browsers settle on the codec the
/// transcoder ingests with the least effort.
#[must_use]
pub fn preferred_codecs() -> RtpCapabilities {
    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: BTreeMap::new(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                clock_rate: 90_000,
                channels: None,
                parameters: params(&[
                    ("packetization-mode", "1"),
                    ("profile-level-id", "42e01f"),
                    ("level-asymmetry-allowed", "1"),
                    ("x-google-start-bitrate", "1000"),
                ]),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                channels: None,
                parameters: params(&[("x-google-start-bitrate", "1000")]),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP9".to_string(),
                clock_rate: 90_000,
                channels: None,
                parameters: params(&[("profile-id", "2"), ("x-google-start-bitrate", "1000")]),
            },
        ],
    }
}

/// A room's router: the factory for relay endpoints
#[async_trait]
pub trait MediaRouter: Send + Sync {
    /// Capabilities relay consumers are created with
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Create an unconnected plain-RTP relay endpoint (no RTCP mux, no comedia)
    async fn create_relay_endpoint(
        &self,
        listen_ip: IpAddr,
    ) -> Result<Arc<dyn RelayEndpoint>, EngineError>;
}

/// Plain-RTP endpoint forwarding consumed media to a fixed destination
#[async_trait]
pub trait RelayEndpoint: Send + Sync {
    fn id(&self) -> &str;

    /// Set the destination RTP/RTCP ports
    async fn connect(
        &self,
        remote_ip: IpAddr,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<(), EngineError>;

    /// Attach a consumer for `producer_id` to this endpoint
    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn RelayConsumer>, EngineError>;

    /// Close the endpoint together with its consumers
    fn close(&self) -> Result<(), EngineError>;
}

/// Read side of a relay endpoint, bound to one producer
#[async_trait]
pub trait RelayConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> &RtpParameters;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn request_keyframe(&self) -> Result<(), EngineError>;
}
