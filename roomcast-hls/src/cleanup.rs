//! Startup cleanup of the HLS output tree
//!
//! Every generation records its transcoder pid in the room output directory.
//! A server that died without tearing its rooms down leaves those processes
//! running and holding RTP ports; they are reaped here before the output root
//! is wiped.

use crate::error::Result;
use roomcast_core::Config;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Pid file written next to a generation's output
pub const PID_FILE_NAME: &str = "transcoder.pid";

/// Kill leftover transcoders, then wipe and recreate the output root
///
/// Returns how many processes were killed.
pub async fn reset_output_root(config: &Config) -> Result<usize> {
    let hls = &config.hls;
    let mut roots = vec![hls.playlist_dir.clone()];
    if hls.sdp_dir != hls.playlist_dir {
        roots.push(hls.sdp_dir.clone());
    }

    let mut reaped = 0;
    for pid in find_pids(&hls.playlist_dir).await? {
        if reap(pid, &config.transcoder.program) {
            reaped += 1;
        }
    }
    if reaped > 0 {
        // let the kernel release the sockets of the killed processes
        tokio::time::sleep(hls.port_settle()).await;
    }

    for root in &roots {
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(root).await?;
    }

    info!(
        playlist_dir = %hls.playlist_dir.display(),
        reaped,
        "HLS output root reset"
    );
    Ok(reaped)
}

/// Pids recorded in `<root>/*/transcoder.pid`
async fn find_pids(root: &Path) -> Result<Vec<u32>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut pids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let pid_file: PathBuf = entry.path().join(PID_FILE_NAME);
        let Ok(content) = tokio::fs::read_to_string(&pid_file).await else {
            continue;
        };
        match content.trim().parse::<u32>() {
            Ok(pid) => pids.push(pid),
            Err(_) => warn!(path = %pid_file.display(), "Ignoring malformed pid file"),
        }
    }
    Ok(pids)
}

/// Kill `pid` if it still runs `program`
#[cfg(unix)]
fn reap(pid: u32, program: &str) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // pids get reused; only touch processes that still look like ours
    if !runs_program(pid, program) {
        debug!(pid, "Recorded transcoder is gone");
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => {
            info!(pid, "Killed leftover transcoder");
            true
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to kill leftover transcoder");
            false
        }
    }
}

#[cfg(not(unix))]
fn reap(_pid: u32, _program: &str) -> bool {
    false
}

/// Compare the process' argv[0] with the configured program (Linux procfs)
#[cfg(unix)]
fn runs_program(pid: u32, program: &str) -> bool {
    let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let Some(argv0) = cmdline.split(|b| *b == 0).next() else {
        return false;
    };
    let argv0 = String::from_utf8_lossy(argv0);
    file_name(&argv0) == file_name(program)
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> Config {
        let mut config = Config::default();
        config.hls.playlist_dir = root.join("hls");
        config.hls.sdp_dir = root.join("hls");
        config.hls.port_settle_ms = 10;
        config
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/usr/bin/ffmpeg"), "ffmpeg");
        assert_eq!(file_name("ffmpeg"), "ffmpeg");
    }

    #[tokio::test]
    async fn test_missing_root_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        assert_eq!(reset_output_root(&config).await.unwrap(), 0);
        assert!(config.hls.playlist_dir.is_dir());
    }

    #[tokio::test]
    async fn test_stale_output_is_wiped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let room = config.hls.room_output_dir("room-1");
        std::fs::create_dir_all(room.join("v0")).unwrap();
        std::fs::write(room.join("v0/segment-000.ts"), b"ts").unwrap();
        // a pid that cannot belong to a running transcoder
        std::fs::write(room.join(PID_FILE_NAME), "not-a-pid").unwrap();

        assert_eq!(reset_output_root(&config).await.unwrap(), 0);
        assert!(config.hls.playlist_dir.is_dir());
        assert!(!room.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_leftover_transcoder_is_killed() {
        use std::os::unix::process::ExitStatusExt;

        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.transcoder.program = "sleep".to_string();

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let room = config.hls.room_output_dir("room-1");
        std::fs::create_dir_all(&room).unwrap();
        std::fs::write(room.join(PID_FILE_NAME), child.id().to_string()).unwrap();

        assert_eq!(reset_output_root(&config).await.unwrap(), 1);
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(9));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unrelated_process_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let room = config.hls.room_output_dir("room-1");
        std::fs::create_dir_all(&room).unwrap();
        std::fs::write(room.join(PID_FILE_NAME), child.id().to_string()).unwrap();

        // configured program is ffmpeg, the recorded pid runs sleep
        assert_eq!(reset_output_root(&config).await.unwrap(), 0);
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        let _ = child.wait();
    }
}
