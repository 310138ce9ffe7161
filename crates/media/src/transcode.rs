//! Voice transcoding via the system ffmpeg.
//!
//! WeCom's voice message type accepts AMR only; `.wav`/`.mp3` replies are
//! converted to 8 kHz mono AMR-NB before upload.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// True when an `ffmpeg` binary is on PATH.
#[must_use]
pub fn ffmpeg_available() -> bool {
    which::which("ffmpeg").is_ok()
}

/// Extensions ffmpeg is asked to convert; everything else is sent as-is.
#[must_use]
pub fn needs_transcode(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("wav" | "mp3")
    )
}

pub(crate) fn ffmpeg_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        input.display().to_string(),
        "-ar".into(),
        "8000".into(),
        "-ac".into(),
        "1".into(),
        "-c:a".into(),
        "amr_nb".into(),
        output.display().to_string(),
    ]
}

/// Convert `input` to an `.amr` file next to it. The caller owns (and
/// removes) the result after upload.
pub async fn to_amr(input: &Path) -> Result<PathBuf> {
    if !ffmpeg_available() {
        return Err(Error::invalid_input("ffmpeg not found on PATH"));
    }
    let output = input.with_extension("amr");
    let args = ffmpeg_args(input, &output);
    debug!(input = %input.display(), output = %output.display(), "transcoding voice to amr");

    let status = tokio::process::Command::new("ffmpeg")
        .args(&args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;

    if !status.success() {
        return Err(Error::invalid_input(format!(
            "ffmpeg exited with {status} for {}",
            input.display()
        )));
    }
    Ok(output)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn args_request_8khz_mono_amr_nb() {
        let args = ffmpeg_args(Path::new("/tmp/a.wav"), Path::new("/tmp/a.amr"));
        let joined = args.join(" ");
        assert!(joined.contains("-ar 8000"), "{joined}");
        assert!(joined.contains("-ac 1"), "{joined}");
        assert!(joined.contains("-c:a amr_nb"), "{joined}");
        assert!(joined.ends_with("/tmp/a.amr"), "{joined}");
    }

    #[test]
    fn only_wav_and_mp3_are_transcoded() {
        assert!(needs_transcode(Path::new("x.wav")));
        assert!(needs_transcode(Path::new("x.MP3")));
        assert!(!needs_transcode(Path::new("x.amr")));
        assert!(!needs_transcode(Path::new("x.ogg")));
        assert!(!needs_transcode(Path::new("x")));
    }
}
