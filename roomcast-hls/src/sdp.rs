//! Session descriptor for the transcoder input
//!
//! The transcoder is started with a single input, so one document carries a
//! media section per relayed stream: participant by participant, video before
//! audio, in the order the ports were allocated. Section order is positional
//! and must line up with the `[0:v:N]`/`[0:a:N]` indices of the filter graph.

use crate::engine::RtpCodecParameters;
use crate::error::{HlsError, Result};
use crate::types::{MediaKind, ParticipantId, PortPair};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the descriptor inside a room's descriptor directory
pub const DESCRIPTOR_FILE_NAME: &str = "stream.sdp";

/// One relayed stream as the transcoder has to receive it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamParams {
    pub kind: MediaKind,
    pub ports: PortPair,
    /// Codec negotiated for the relay consumer feeding these ports
    pub codec: RtpCodecParameters,
}

/// The streams of one participant; a missing kind is simply left out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantMedia {
    pub participant_id: ParticipantId,
    pub video: Option<MediaStreamParams>,
    pub audio: Option<MediaStreamParams>,
}

#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    address: IpAddr,
    session_name: String,
    global_connection: bool,
}

impl SessionDescriptor {
    /// `address` is where the transcoder receives RTP and RTCP
    #[must_use]
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            session_name: "Roomcast HLS Stream".to_string(),
            global_connection: true,
        }
    }

    /// Leave out the session-level `c=` line
    #[must_use]
    pub const fn without_global_connection(mut self) -> Self {
        self.global_connection = false;
        self
    }

    fn addr_type(&self) -> &'static str {
        match self.address {
            IpAddr::V4(_) => "IP4",
            IpAddr::V6(_) => "IP6",
        }
    }

    /// Render the document for `participants`
    #[must_use]
    pub fn render(&self, participants: &[ParticipantMedia]) -> String {
        let addr_type = self.addr_type();
        let mut lines = vec![
            "v=0".to_string(),
            format!("o=- 0 0 IN {addr_type} {}", self.address),
            format!("s={}", self.session_name),
        ];
        if self.global_connection {
            lines.push(format!("c=IN {addr_type} {}", self.address));
        }
        lines.push("t=0 0".to_string());

        for participant in participants {
            for stream in [&participant.video, &participant.audio].into_iter().flatten() {
                self.push_media_section(&mut lines, stream);
            }
        }

        let mut document = lines.join("\n");
        document.push('\n');
        document
    }

    fn push_media_section(&self, lines: &mut Vec<String>, stream: &MediaStreamParams) {
        let codec = &stream.codec;
        let pt = codec.payload_type;

        lines.push(format!("m={} {} RTP/AVP {pt}", stream.kind, stream.ports.rtp));

        let mut rtpmap = format!("a=rtpmap:{pt} {}/{}", codec.encoding_name(), codec.clock_rate);
        if stream.kind == MediaKind::Audio {
            let _ = write!(rtpmap, "/{}", codec.channels.unwrap_or(2));
        }
        lines.push(rtpmap);

        if !codec.parameters.is_empty() {
            let fmtp = codec
                .parameters
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(";");
            lines.push(format!("a=fmtp:{pt} {fmtp}"));
        }

        lines.push(format!(
            "a=rtcp:{} IN {} {}",
            stream.ports.rtcp,
            self.addr_type(),
            self.address
        ));
        lines.push("a=recvonly".to_string());
    }

    /// Write the document to `<dir>/stream.sdp` and return its path
    pub async fn generate(&self, participants: &[ParticipantMedia], dir: &Path) -> Result<PathBuf> {
        let path = dir.join(DESCRIPTOR_FILE_NAME);
        let document = self.render(participants);

        let write = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, &document).await
        };
        write.await.map_err(|source| HlsError::DescriptorWrite {
            path: path.clone(),
            source,
        })?;

        debug!(
            path = %path.display(),
            participants = participants.len(),
            "Wrote session descriptor"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn codec(mime: &str, pt: u8, clock_rate: u32, channels: Option<u8>) -> RtpCodecParameters {
        RtpCodecParameters {
            mime_type: mime.to_string(),
            payload_type: pt,
            clock_rate,
            channels,
            parameters: BTreeMap::new(),
        }
    }

    fn participant(id: &str, base: u16, video: RtpCodecParameters, audio: RtpCodecParameters) -> ParticipantMedia {
        ParticipantMedia {
            participant_id: id.into(),
            video: Some(MediaStreamParams {
                kind: MediaKind::Video,
                ports: PortPair { rtp: base, rtcp: base + 1 },
                codec: video,
            }),
            audio: Some(MediaStreamParams {
                kind: MediaKind::Audio,
                ports: PortPair { rtp: base + 2, rtcp: base + 3 },
                codec: audio,
            }),
        }
    }

    fn localhost() -> SessionDescriptor {
        SessionDescriptor::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn test_sections_follow_participant_order() {
        let participants = vec![
            participant(
                "p1",
                20000,
                codec("video/H264", 102, 90_000, None),
                codec("audio/opus", 100, 48_000, Some(2)),
            ),
            participant(
                "p2",
                20004,
                codec("video/VP8", 96, 90_000, None),
                codec("audio/PCMU", 0, 8_000, Some(1)),
            ),
        ];

        let sdp = localhost().render(&participants);
        let media: Vec<&str> = sdp.lines().filter(|l| l.starts_with("m=")).collect();
        assert_eq!(
            media,
            [
                "m=video 20000 RTP/AVP 102",
                "m=audio 20002 RTP/AVP 100",
                "m=video 20004 RTP/AVP 96",
                "m=audio 20006 RTP/AVP 0",
            ]
        );

        let rtpmaps: Vec<&str> = sdp.lines().filter(|l| l.starts_with("a=rtpmap")).collect();
        assert_eq!(
            rtpmaps,
            [
                "a=rtpmap:102 H264/90000",
                "a=rtpmap:100 opus/48000/2",
                "a=rtpmap:96 VP8/90000",
                "a=rtpmap:0 PCMU/8000/1",
            ]
        );
        assert_eq!(sdp.matches("a=recvonly").count(), 4);
        assert!(sdp.contains("a=rtcp:20005 IN IP4 127.0.0.1"));
    }

    #[test]
    fn test_preamble() {
        let sdp = localhost().render(&[]);
        assert_eq!(
            sdp,
            "v=0\no=- 0 0 IN IP4 127.0.0.1\ns=Roomcast HLS Stream\nc=IN IP4 127.0.0.1\nt=0 0\n"
        );

        let bare = localhost().without_global_connection().render(&[]);
        assert!(!bare.contains("c=IN"));
    }

    #[test]
    fn test_fmtp_from_negotiated_parameters() {
        let mut video = codec("video/H264", 125, 90_000, None);
        video
            .parameters
            .insert("packetization-mode".to_string(), "1".to_string());
        video
            .parameters
            .insert("profile-level-id".to_string(), "42e01f".to_string());

        let sdp = localhost().render(&[participant(
            "p1",
            20000,
            video,
            codec("audio/opus", 111, 48_000, None),
        )]);
        assert!(sdp.contains("a=fmtp:125 packetization-mode=1;profile-level-id=42e01f"));
        // audio without channel count defaults to stereo, no empty fmtp line
        assert!(sdp.contains("a=rtpmap:111 opus/48000/2"));
        assert!(!sdp.contains("a=fmtp:111"));
    }

    #[test]
    fn test_missing_kind_is_omitted() {
        let mut p = participant(
            "p1",
            20000,
            codec("video/H264", 102, 90_000, None),
            codec("audio/opus", 100, 48_000, Some(2)),
        );
        p.audio = None;

        let sdp = localhost().render(&[p]);
        assert_eq!(sdp.lines().filter(|l| l.starts_with("m=")).count(), 1);
        assert!(!sdp.contains("m=audio"));
    }

    #[tokio::test]
    async fn test_generate_writes_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let room_dir = dir.path().join("room");
        let path = localhost()
            .generate(
                &[participant(
                    "p1",
                    20000,
                    codec("video/H264", 102, 90_000, None),
                    codec("audio/opus", 100, 48_000, Some(2)),
                )],
                &room_dir,
            )
            .await
            .unwrap();

        assert_eq!(path, room_dir.join(DESCRIPTOR_FILE_NAME));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("v=0\n"));
        assert_eq!(content.matches("m=").count(), 2);
    }

    #[tokio::test]
    async fn test_generate_reports_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the directory should be
        let blocker = dir.path().join("room");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = localhost().generate(&[], &blocker).await.unwrap_err();
        assert!(matches!(err, HlsError::DescriptorWrite { .. }));
    }
}
