//! Discovery and invocation helpers for the external transcoding tool (`ffmpeg` / `ffprobe`).

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Hardware H.264 encoders in preference order.
///
/// VideoToolbox only exists on macOS builds of the tool, so its position does not matter
/// elsewhere.
pub const HARDWARE_H264_ENCODERS: &[&str] = &["h264_videotoolbox", "h264_nvenc", "h264_qsv", "h264_amf"];

/// A located transcoding tool.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TranscodeTool {
    pub path: PathBuf,
    /// Companion probe binary, when found.
    pub probe_path: Option<PathBuf>,
    /// First line of `-version`.
    pub version: Option<String>,
}

impl TranscodeTool {
    /// Locate the tool, preferring `explicit` over `PATH`.
    ///
    /// Returns `None` when no runnable binary is found.
    pub fn locate(explicit: Option<&Path>) -> Option<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => which::which("ffmpeg").ok()?,
        };
        let version = read_version(&path)?;

        let probe_path = sibling_probe(&path).or_else(|| which::which("ffprobe").ok());
        Some(Self {
            path,
            probe_path,
            version: Some(version),
        })
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-hide_banner");
        cmd
    }

    pub fn probe_command(&self) -> Option<Command> {
        self.probe_path.as_ref().map(Command::new)
    }

    /// Names of every video encoder compiled into the tool.
    pub fn list_encoders(&self) -> Vec<String> {
        let out = match self
            .command()
            .arg("-encoders")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(out) if out.status.success() => out,
            _ => return Vec::new(),
        };
        parse_encoder_list(&String::from_utf8_lossy(&out.stdout))
    }

    /// Encode one synthetic frame with `encoder` and discard it.
    ///
    /// Listing an encoder only proves it was compiled in; hardware encoders additionally need a
    /// device and driver, which only a real encode reveals.
    pub fn verify_encoder(&self, encoder: &str) -> bool {
        self.command()
            .args([
                "-v",
                "error",
                "-f",
                "lavfi",
                "-i",
                "color=c=black:s=256x256:r=30",
                "-frames:v",
                "1",
                "-c:v",
                encoder,
                "-f",
                "null",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Hardware H.264 encoders that are both listed and able to encode a frame.
    pub fn verified_hardware_encoders(&self) -> Vec<String> {
        let listed = self.list_encoders();
        HARDWARE_H264_ENCODERS
            .iter()
            .filter(|name| listed.iter().any(|l| l == *name))
            .filter(|name| self.verify_encoder(name))
            .map(|name| (*name).to_string())
            .collect()
    }
}

fn read_version(path: &Path) -> Option<String> {
    let out = Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout);
    Some(text.lines().next().unwrap_or_default().trim().to_string())
}

fn sibling_probe(tool: &Path) -> Option<PathBuf> {
    let dir = tool.parent()?;
    let name = if cfg!(windows) { "ffprobe.exe" } else { "ffprobe" };
    let candidate = dir.join(name);
    candidate.is_file().then_some(candidate)
}

/// Parse the table printed by `-encoders`.
///
/// Rows look like ` V....D libx264              libx264 H.264 ...`; the header above the
/// `------` separator is skipped.
fn parse_encoder_list(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_table = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("------") {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let (Some(flags), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if flags.starts_with('V') {
            out.push(name.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_table_keeps_video_rows() {
        let text = "Encoders:\n V..... = Video\n A..... = Audio\n ------\n V....D libx264              libx264 H.264\n V....D h264_nvenc           NVIDIA NVENC H.264 encoder\n A....D aac                  AAC (Advanced Audio Coding)\n";
        assert_eq!(parse_encoder_list(text), vec!["libx264", "h264_nvenc"]);
    }

    #[test]
    fn missing_explicit_tool_is_none() {
        assert!(TranscodeTool::locate(Some(Path::new("/nonexistent/ffmpeg-xyz"))).is_none());
    }
}
