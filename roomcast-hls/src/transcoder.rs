//! Transcoder subprocess
//!
//! [`Transcoder`] turns the configuration into an argument vector and spawns
//! the external encoder. The returned [`TranscoderHandle`] is available
//! right after spawn so the caller can record it before the process has had
//! a chance to fail; readiness is only inferred later by a fixed warm-up.

use crate::error::{HlsError, Result};
use crate::quality::{SEGMENT_PATTERN, TIER_DIR_PATTERN, TIER_PLAYLIST};
use parking_lot::Mutex;
use roomcast_core::{QualityTier, TranscoderConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Accumulated stderr kept per process (tail wins)
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How long a killed process gets to be reaped
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long output readers may lag behind process exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscoderState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Killed,
}

impl TranscoderState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Killed)
    }
}

/// How the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscoderExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl TranscoderExit {
    fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self.code, Some(code) if code != 0)
    }
}

/// Argument builder and launcher for the external encoder
#[derive(Debug, Clone)]
pub struct Transcoder {
    config: Arc<TranscoderConfig>,
    tiers: Arc<[QualityTier]>,
}

impl Transcoder {
    #[must_use]
    pub fn new(config: TranscoderConfig, tiers: Vec<QualityTier>) -> Self {
        Self {
            config: Arc::new(config),
            tiers: tiers.into(),
        }
    }

    #[must_use]
    pub fn tiers(&self) -> &[QualityTier] {
        &self.tiers
    }

    /// Full argument vector for one run
    ///
    /// `input` is passed verbatim, so it has to resolve from the output
    /// directory the process runs in.
    #[must_use]
    pub fn build_args(&self, input: &Path, filter_graph: &str) -> Vec<String> {
        let cfg = &self.config;
        let mut args: Vec<String> = Vec::with_capacity(64 + self.tiers.len() * 20);
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| (*s).to_string()));

        push(&["-protocol_whitelist", "file,rtp,udp,crypto,data"]);

        // Composited RTP input reorders and stalls far more than a single
        // stream, hence the very generous jitter buffer.
        push(&[
            "-reorder_queue_size",
            &cfg.reorder_queue_size.to_string(),
            "-max_delay",
            &cfg.max_delay_us.to_string(),
            "-buffer_size",
            &cfg.buffer_size.to_string(),
        ]);

        push(&["-i", &input.to_string_lossy(), "-filter_complex", filter_graph]);

        for i in 0..self.tiers.len() {
            push(&["-map", &format!("[vout{i}]"), "-map", &format!("[aout{i}]")]);
        }

        for (i, tier) in self.tiers.iter().enumerate() {
            push(&[
                &format!("-c:v:{i}"),
                &tier.video_codec,
                &format!("-b:v:{i}"),
                &format!("{}k", tier.video_bitrate_kbps),
                &format!("-s:v:{i}"),
                &tier.resolution(),
                &format!("-maxrate:v:{i}"),
                &format!("{}k", tier.maxrate_kbps),
                &format!("-bufsize:v:{i}"),
                &format!("{}k", tier.bufsize_kbps),
                &format!("-c:a:{i}"),
                &tier.audio_codec,
                &format!("-b:a:{i}"),
                &format!("{}k", tier.audio_bitrate_kbps),
                &format!("-ar:a:{i}"),
                &cfg.audio_sample_rate.to_string(),
            ]);
        }

        // Fixed GOP without scene-cut keyframes keeps segment boundaries aligned
        let gop = cfg.gop.to_string();
        push(&[
            "-r",
            &cfg.frame_rate.to_string(),
            "-preset",
            &cfg.preset,
            "-tune",
            &cfg.tune,
            "-g",
            &gop,
            "-keyint_min",
            &gop,
            "-sc_threshold",
            "0",
            "-err_detect",
            "ignore_err",
            "-fflags",
            "+genpts+igndts",
            "-threads",
            &cfg.threads.to_string(),
        ]);

        let var_stream_map = (0..self.tiers.len())
            .map(|i| format!("v:{i},a:{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        push(&[
            "-f",
            "hls",
            "-hls_time",
            &cfg.segment_duration.to_string(),
            "-hls_list_size",
            &cfg.list_size.to_string(),
            "-hls_flags",
            &cfg.hls_flags,
            "-var_stream_map",
            &var_stream_map,
            "-master_pl_name",
            &cfg.master_playlist_name,
            "-hls_segment_filename",
            &format!("{TIER_DIR_PATTERN}/{SEGMENT_PATTERN}"),
            &format!("{TIER_DIR_PATTERN}/{TIER_PLAYLIST}"),
        ]);

        args
    }

    /// Spawn the encoder inside `output_dir`
    ///
    /// Returns as soon as the process exists; the handle is in
    /// [`TranscoderState::Starting`] until [`TranscoderHandle::warm_up`].
    pub fn start(
        &self,
        descriptor: &Path,
        output_dir: &Path,
        filter_graph: &str,
    ) -> Result<(TranscoderHandle, Vec<String>)> {
        let input = input_path(descriptor, output_dir)?;
        let args = self.build_args(&input, filter_graph);

        info!(
            program = %self.config.program,
            cwd = %output_dir.display(),
            args = %args.join(" "),
            "Starting transcoder"
        );

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.pre_args)
            .args(&args)
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            HlsError::SubprocessStart(format!("failed to spawn {}: {e}", self.config.program))
        })?;

        Ok((TranscoderHandle::monitor(child), args))
    }
}

/// Express the descriptor path so it resolves from `cwd`
fn input_path(descriptor: &Path, cwd: &Path) -> Result<PathBuf> {
    if let Ok(relative) = descriptor.strip_prefix(cwd) {
        return Ok(relative.to_path_buf());
    }
    if descriptor.is_absolute() {
        return Ok(descriptor.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(descriptor))
}

struct HandleInner {
    pid: Option<u32>,
    state: Mutex<TranscoderState>,
    exit_rx: watch::Receiver<Option<TranscoderExit>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    stderr: Arc<Mutex<String>>,
}

/// Shared handle to one spawned encoder process
///
/// The process is killed once the last clone of the handle is dropped.
#[derive(Clone)]
pub struct TranscoderHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for TranscoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscoderHandle")
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl TranscoderHandle {
    fn monitor(mut child: Child) -> Self {
        let pid = child.id();
        let stderr = Arc::new(Mutex::new(String::new()));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, None)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, Some(Arc::clone(&stderr)))));

        let inner = Arc::new(HandleInner {
            pid,
            state: Mutex::new(TranscoderState::Starting),
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
            stderr: Arc::clone(&stderr),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // explicit kill, or every handle dropped
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "Failed to kill transcoder");
                    }
                    child.wait().await
                }
            };

            for task in [stdout_task, stderr_task].into_iter().flatten() {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
                    debug!(pid, "Transcoder output still open after exit");
                }
            }

            let exit = match status {
                Ok(status) => TranscoderExit::from_status(&status),
                Err(e) => {
                    error!(pid, error = %e, "Failed to wait for transcoder");
                    TranscoderExit {
                        code: None,
                        signal: None,
                    }
                }
            };

            info!(pid, code = ?exit.code, signal = ?exit.signal, "Transcoder exited");
            if exit.is_failure() {
                error!(pid, stderr = %stderr.lock(), "Transcoder stderr output");
            }

            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                if *state != TranscoderState::Killed {
                    *state = TranscoderState::Stopped;
                }
            }
            exit_tx.send_replace(Some(exit));
        });

        Self { inner }
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    #[must_use]
    pub fn state(&self) -> TranscoderState {
        *self.inner.state.lock()
    }

    /// Exit information once the process is gone
    #[must_use]
    pub fn exit_status(&self) -> Option<TranscoderExit> {
        *self.inner.exit_rx.borrow()
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Receiver that turns `Some` when the process exits
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<TranscoderExit>> {
        self.inner.exit_rx.clone()
    }

    /// Everything the process wrote to stderr so far (bounded tail)
    #[must_use]
    pub fn stderr(&self) -> String {
        self.inner.stderr.lock().clone()
    }

    /// Wait until the process has exited
    pub async fn wait(&self) -> TranscoderExit {
        let mut rx = self.exit_watch();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // monitor gone without publishing; treat as exited
                return (*rx.borrow()).unwrap_or(TranscoderExit {
                    code: None,
                    signal: None,
                });
            }
        }
    }

    /// Fixed readiness delay
    ///
    /// There is no readiness handshake with the encoder; it is assumed to have
    /// bound its RTP ports once `delay` has passed. Returns the exit status if
    /// the process died in the meantime.
    pub async fn warm_up(&self, delay: Duration) -> Option<TranscoderExit> {
        tokio::time::sleep(delay).await;
        let mut state = self.inner.state.lock();
        if let Some(exit) = self.exit_status() {
            return Some(exit);
        }
        if *state == TranscoderState::Starting {
            *state = TranscoderState::Running;
        }
        None
    }

    /// Terminate gracefully, escalating to a kill after `timeout`
    pub async fn stop(&self, timeout: Duration) {
        {
            let mut state = self.inner.state.lock();
            if self.has_exited() || state.is_terminal() {
                return;
            }
            *state = TranscoderState::Stopping;
        }

        info!(pid = ?self.pid(), "Stopping transcoder gracefully");
        self.terminate();

        let mut rx = self.exit_watch();
        let graceful = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .is_ok();
        if graceful {
            info!(pid = ?self.pid(), "Transcoder stopped");
            return;
        }

        warn!(
            pid = ?self.pid(),
            timeout_ms = timeout.as_millis() as u64,
            "Transcoder did not stop gracefully, killing"
        );
        self.kill();
        if tokio::time::timeout(KILL_GRACE, rx.wait_for(Option::is_some))
            .await
            .is_err()
        {
            error!(pid = ?self.pid(), "Transcoder still not reaped after kill");
        }
    }

    /// Kill immediately
    pub fn kill(&self) {
        {
            let mut state = self.inner.state.lock();
            if self.has_exited() {
                return;
            }
            *state = TranscoderState::Killed;
        }
        if let Some(tx) = self.inner.kill_tx.lock().take() {
            info!(pid = ?self.pid(), "Killing transcoder");
            let _ = tx.send(());
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid().and_then(|pid| i32::try_from(pid).ok()) else {
            self.kill();
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(pid, error = %e, "Failed to send SIGTERM to transcoder");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        self.kill();
    }
}

/// Log a child's output line by line, optionally keeping a bounded copy
async fn forward_lines<R>(reader: R, keep: Option<Arc<Mutex<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match &keep {
                Some(buffer) => {
                    trace!(target: "roomcast_hls::transcoder::stderr", "{line}");
                    let mut buffer = buffer.lock();
                    buffer.push_str(&line);
                    buffer.push('\n');
                    truncate_front(&mut buffer, MAX_STDERR_BYTES);
                }
                None => debug!(target: "roomcast_hls::transcoder::stdout", "{line}"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Stopped reading transcoder output");
                break;
            }
        }
    }
}

fn truncate_front(buffer: &mut String, max: usize) {
    if buffer.len() <= max {
        return;
    }
    let cut = buffer.len() - max;
    let cut = (cut..buffer.len())
        .find(|&i| buffer.is_char_boundary(i))
        .unwrap_or(buffer.len());
    buffer.drain(..cut);
}
