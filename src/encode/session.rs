use std::io::{BufRead as _, BufReader, Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crate::encode::args;
use crate::encode::backend::EncodeConfig;
use crate::foundation::error::{ExportError, ExportResult};
use crate::render::surface::FrameRGBA;
use crate::tool::TranscodeTool;

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// One running transcoder process fed raw frames on stdin.
///
/// Output goes to a private temporary file that is read back and removed by
/// [`FfmpegSession::finish`]. Machine-readable progress arrives on stdout (`-progress pipe:1`).
pub struct FfmpegSession {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    progress_reader: Option<JoinHandle<()>>,
    out_path: PathBuf,
    encoded: Arc<AtomicU64>,
    scratch: Vec<u8>,
    background: [u8; 3],
    width: u32,
    height: u32,
    written: u64,
}

impl FfmpegSession {
    /// Spawn the tool for `cfg` with the given codec arguments.
    pub fn spawn(tool: &TranscodeTool, cfg: &EncodeConfig, codec_args: &[String]) -> ExportResult<Self> {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let out_path = std::env::temp_dir().join(format!(
            "reelcast-{}-{seq}.{}",
            std::process::id(),
            cfg.format.extension()
        ));

        let mut cmd = tool.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.args(["-y", "-nostats", "-progress", "pipe:1"]);
        args::push_rawvideo_input(&mut cmd, cfg.width, cfg.height, cfg.fps);
        cmd.args(codec_args);
        cmd.args(args::file_container_args(cfg.format));
        cmd.arg(&out_path);

        let mut child = cmd.spawn().map_err(|e| {
            ExportError::backend(format!(
                "failed to spawn '{}': {e}",
                tool.path.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExportError::backend("failed to open transcoder stdin"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExportError::backend("failed to open transcoder stderr"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::backend("failed to open transcoder stdout"))?;

        let stderr_drain = std::thread::spawn(move || {
            let mut bytes = Vec::new();
            stderr.read_to_end(&mut bytes)?;
            Ok(bytes)
        });

        let encoded = Arc::new(AtomicU64::new(0));
        let progress_reader = {
            let encoded = encoded.clone();
            let cfg = cfg.clone();
            std::thread::spawn(move || {
                let mut state = ProgressState::default();
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    let Some((key, value)) = line.trim().split_once('=') else {
                        continue;
                    };
                    state.update(key, value);
                    if key == "progress" {
                        encoded.store(state.frame, Ordering::Relaxed);
                        cfg.report(state.frame, state.fps);
                    }
                }
            })
        };

        tracing::debug!(
            out = %out_path.display(),
            width = cfg.width,
            height = cfg.height,
            format = cfg.format.extension(),
            "spawned transcoder session"
        );

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            stderr_drain: Some(stderr_drain),
            progress_reader: Some(progress_reader),
            out_path,
            encoded,
            scratch: Vec::with_capacity(cfg.frame_bytes()),
            background: cfg.background,
            width: cfg.width,
            height: cfg.height,
            written: 0,
        })
    }

    /// Frames written to stdin so far.
    pub fn frames_written(&self) -> u64 {
        self.written
    }

    /// Frames the tool reported as encoded.
    pub fn frames_encoded(&self) -> u64 {
        self.encoded.load(Ordering::Relaxed)
    }

    /// Whether the tool has already exited (before its input was closed, this means it failed).
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    pub fn write_frame(&mut self, frame: &FrameRGBA) -> ExportResult<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(ExportError::validation(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }
        frame.validate()?;
        frame.flatten_into(&mut self.scratch, self.background);

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ExportError::backend("transcoder session is already finished"));
        };
        stdin.write_all(&self.scratch).map_err(|e| {
            ExportError::backend(format!("failed to write frame to transcoder: {e}"))
        })?;
        self.written += 1;
        Ok(())
    }

    /// Close stdin, wait for the tool and return the encoded file contents.
    pub fn finish(mut self) -> ExportResult<Vec<u8>> {
        drop(self.stdin.take());
        let mut child = self
            .child
            .take()
            .ok_or_else(|| ExportError::backend("transcoder session not running"))?;
        let status = child
            .wait()
            .map_err(|e| ExportError::backend(format!("failed to wait for transcoder: {e}")))?;
        if let Some(h) = self.progress_reader.take() {
            let _ = h.join();
        }
        let stderr_bytes = self.join_stderr()?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_bytes);
            return Err(ExportError::backend(format!(
                "transcoder exited with status {status}: {}",
                stderr.trim()
            )));
        }

        let bytes = std::fs::read(&self.out_path).map_err(|e| {
            ExportError::backend(format!(
                "failed to read encoded output '{}': {e}",
                self.out_path.display()
            ))
        })?;
        remove_quietly(&self.out_path);
        Ok(bytes)
    }

    /// Terminate the tool and discard partial output. Safe to call repeatedly.
    pub fn kill(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(h) = self.progress_reader.take() {
            let _ = h.join();
        }
        let _ = self.join_stderr();
        remove_quietly(&self.out_path);
    }

    fn join_stderr(&mut self) -> ExportResult<Vec<u8>> {
        match self.stderr_drain.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ExportError::backend("transcoder stderr drain thread panicked"))?
                .map_err(|e| ExportError::backend(format!("transcoder stderr read failed: {e}"))),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.kill();
        } else {
            remove_quietly(&self.out_path);
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %e, "failed to remove transcoder output");
    }
}

/// Key/value state accumulated between `progress=` lines.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct ProgressState {
    frame: u64,
    fps: f64,
    complete: bool,
}

impl ProgressState {
    fn update(&mut self, key: &str, value: &str) {
        match key {
            "frame" => {
                if let Ok(n) = value.trim().parse() {
                    self.frame = n;
                }
            }
            "fps" => {
                if let Ok(v) = value.trim().parse() {
                    self.fps = v;
                }
            }
            "progress" => self.complete = value.trim() == "end",
            _ => {}
        }
    }
}
