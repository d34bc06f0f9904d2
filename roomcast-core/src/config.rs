use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub hls: HlsConfig,
    pub transcoder: TranscoderConfig,
    pub quality: QualityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Pipeline orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    /// First port of the RTP/RTCP pool
    pub base_port: u16,
    /// Exclusive upper bound of the pool
    pub max_port: u16,
    /// Shift the base port by a random even offset (0-98) at startup
    pub randomize_offset: bool,
    /// Address the relay endpoints bind to
    pub listen_ip: IpAddr,
    /// Address the relay endpoints send RTP to (where the transcoder listens)
    pub transcoder_ip: IpAddr,
    /// Root of the per-room segment/playlist trees
    pub playlist_dir: PathBuf,
    /// Root of the per-room session descriptors
    pub sdp_dir: PathBuf,
    /// Fixed delay between transcoder spawn and relay activation
    pub warmup_ms: u64,
    /// Delay after transcoder stop and again after port release
    pub port_settle_ms: u64,
    /// Graceful stop budget before the transcoder is killed
    pub stop_timeout_ms: u64,
    pub keyframe_retries: u32,
    pub keyframe_interval_ms: u64,
    /// Maximum concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Top-level manifest written next to the tier directories
    pub manifest_name: String,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            base_port: 20000,
            max_port: 21000,
            randomize_offset: true,
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            transcoder_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            playlist_dir: PathBuf::from("./public/hls"),
            sdp_dir: PathBuf::from("./public/hls"),
            warmup_ms: 500,
            port_settle_ms: 1000,
            stop_timeout_ms: 5000,
            keyframe_retries: 5,
            keyframe_interval_ms: 500,
            max_rooms: 0,
            manifest_name: "index.m3u8".to_string(),
        }
    }
}

impl HlsConfig {
    #[must_use]
    pub const fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    #[must_use]
    pub const fn port_settle(&self) -> Duration {
        Duration::from_millis(self.port_settle_ms)
    }

    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    #[must_use]
    pub const fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_interval_ms)
    }

    /// Output directory of a single room
    #[must_use]
    pub fn room_output_dir(&self, room_id: &str) -> PathBuf {
        self.playlist_dir.join(room_id)
    }

    /// Directory holding the session descriptor of a single room
    #[must_use]
    pub fn room_sdp_dir(&self, room_id: &str) -> PathBuf {
        self.sdp_dir.join(room_id)
    }
}

/// External transcoder invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: String,
    /// Arguments placed before the generated argument vector
    pub pre_args: Vec<String>,

    // Jitter buffer
    pub reorder_queue_size: u32,
    pub max_delay_us: u64,
    pub buffer_size: u64,

    // Shared encoding settings
    pub frame_rate: u32,
    pub preset: String,
    pub tune: String,
    pub gop: u32,
    pub threads: u32,
    pub audio_sample_rate: u32,

    // HLS muxer
    pub segment_duration: u32,
    pub list_size: u32,
    pub hls_flags: String,
    pub master_playlist_name: String,

    /// Treat an exit during the warm-up delay as a start failure
    pub abort_on_early_exit: bool,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            pre_args: Vec::new(),
            reorder_queue_size: 50_000,
            max_delay_us: 50_000_000,
            buffer_size: 10_000_000,
            frame_rate: 24,
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
            gop: 48,
            threads: 2,
            audio_sample_rate: 48_000,
            segment_duration: 2,
            list_size: 10,
            hls_flags: "delete_segments+append_list+program_date_time+independent_segments"
                .to_string(),
            master_playlist_name: "playlist.m3u8".to_string(),
            abort_on_early_exit: false,
        }
    }
}

/// One rung of the adaptive bitrate ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityTier {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_codec: String,
    pub video_bitrate_kbps: u32,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
}

impl QualityTier {
    fn new(
        name: &str,
        (width, height): (u32, u32),
        (video_bitrate_kbps, maxrate_kbps, bufsize_kbps): (u32, u32, u32),
        audio_bitrate_kbps: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            video_codec: "libx264".to_string(),
            video_bitrate_kbps,
            maxrate_kbps,
            bufsize_kbps,
            audio_codec: "aac".to_string(),
            audio_bitrate_kbps,
        }
    }

    /// Look up one of the built-in presets by name (`144p` .. `720p`)
    #[must_use]
    pub fn preset(name: &str) -> Option<Self> {
        let tier = match name {
            "144p" => Self::new(name, (256, 144), (250, 350, 700), 64),
            "240p" => Self::new(name, (426, 240), (400, 600, 1200), 96),
            "360p" => Self::new(name, (640, 360), (800, 1000, 2000), 96),
            "480p" => Self::new(name, (854, 480), (1200, 1500, 3000), 128),
            "720p" => Self::new(name, (1280, 720), (2500, 3000, 6000), 128),
            _ => return None,
        };
        Some(tier)
    }

    /// Advertised bandwidth in bits per second (video + audio)
    #[must_use]
    pub const fn bandwidth_bps(&self) -> u64 {
        (self.video_bitrate_kbps as u64 + self.audio_bitrate_kbps as u64) * 1000
    }

    #[must_use]
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub tiers: Vec<QualityTier>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            tiers: ["720p", "360p"]
                .into_iter()
                .filter_map(QualityTier::preset)
                .collect(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMCAST__HLS__BASE_PORT=30000 etc.
        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let hls = &self.hls;

        if hls.base_port >= hls.max_port {
            errors.push(format!(
                "hls.base_port ({}) must be below hls.max_port ({})",
                hls.base_port, hls.max_port
            ));
        } else if hls.max_port - hls.base_port < 4 {
            // one participant needs a video and an audio RTP/RTCP pair
            errors.push(format!(
                "hls port range {}..{} cannot hold a single participant",
                hls.base_port, hls.max_port
            ));
        }

        if hls.base_port % 2 != 0 {
            errors.push(format!(
                "hls.base_port ({}) must be even so RTP ports stay even",
                hls.base_port
            ));
        }

        if self.quality.tiers.is_empty() {
            errors.push("quality.tiers must contain at least one tier".to_string());
        }
        for tier in &self.quality.tiers {
            if tier.width == 0 || tier.height == 0 {
                errors.push(format!("quality tier {} has an empty resolution", tier.name));
            }
            if tier.video_bitrate_kbps == 0 {
                errors.push(format!("quality tier {} has no video bitrate", tier.name));
            }
        }

        if self.transcoder.program.trim().is_empty() {
            errors.push("transcoder.program is empty".to_string());
        }
        if self.transcoder.segment_duration == 0 {
            errors.push("transcoder.segment_duration must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
