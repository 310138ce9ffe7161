use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use {
    rand::RngExt,
    tracing::{debug, warn},
};

use crate::{
    error::{Error, Result},
    mime,
};

/// Media service settings. One instance per account.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Scratch space owned exclusively by this service.
    pub temp_root: PathBuf,
    /// Root of the dated inbound archive.
    pub media_root: PathBuf,
    pub max_bytes: u64,
    pub keep_days: u32,
    pub download_timeout: Duration,
    pub api_timeout: Duration,
    pub upload_timeout: Duration,
}

impl MediaConfig {
    #[must_use]
    pub fn new(temp_root: PathBuf, media_root: PathBuf) -> Self {
        Self {
            temp_root,
            media_root,
            max_bytes: 10 * 1024 * 1024,
            keep_days: 7,
            download_timeout: Duration::from_secs(120),
            api_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(60),
        }
    }
}

/// A download request. `filename` and `declared_mime` come from the
/// platform payload when it carries them.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    /// File-name prefix, e.g. `img`, `voice`, `file`.
    pub prefix: &'a str,
    pub filename: Option<&'a str>,
    pub declared_mime: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub size: u64,
    pub mime: String,
}

pub struct MediaService {
    pub(crate) client: reqwest::Client,
    config: MediaConfig,
}

impl MediaService {
    #[must_use]
    pub fn new(config: MediaConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Download a URL into the temp root, enforcing the size cap without
    /// buffering more than the cap.
    pub async fn download(&self, req: DownloadRequest<'_>) -> Result<DownloadedFile> {
        self.download_with(req, None::<fn(Vec<u8>) -> Result<Vec<u8>>>)
            .await
    }

    /// Like [`Self::download`], with a post-download transform applied to
    /// the body before it is written (WeCom callback media is AES
    /// encrypted on the wire).
    pub async fn download_with<F>(
        &self,
        req: DownloadRequest<'_>,
        decrypt: Option<F>,
    ) -> Result<DownloadedFile>
    where
        F: FnOnce(Vec<u8>) -> Result<Vec<u8>>,
    {
        let response = self
            .client
            .get(req.url)
            .timeout(self.config.download_timeout)
            .send()
            .await?
            .error_for_status()?;

        // Reject oversized bodies before reading a single byte.
        if let Some(len) = response.content_length()
            && len > self.config.max_bytes
        {
            return Err(Error::SizeLimit {
                limit_bytes: self.config.max_bytes,
            });
        }

        let disposition = response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            if body.len() as u64 + chunk.len() as u64 > self.config.max_bytes {
                return Err(Error::SizeLimit {
                    limit_bytes: self.config.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        let body = match decrypt {
            Some(f) => f(body)?,
            None => body,
        };

        let ext = resolve_extension(
            req.filename,
            disposition.as_deref(),
            req.declared_mime.or(content_type.as_deref()),
        );
        let mime = req
            .declared_mime
            .map(str::to_string)
            .or(content_type)
            .unwrap_or_else(|| mime::mime_for_filename(&format!("x.{ext}")).to_string());

        let path = self.temp_path(req.prefix, &ext);
        write_atomic(&path, &body).await?;

        Ok(DownloadedFile {
            size: body.len() as u64,
            path,
            mime,
        })
    }

    fn temp_path(&self, prefix: &str, ext: &str) -> PathBuf {
        let now_ms = unix_ms();
        let rand: String = {
            let mut rng = rand::rng();
            (0..6)
                .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
                .collect::<String>()
                .to_ascii_lowercase()
        };
        let prefix = if prefix.is_empty() { "media" } else { prefix };
        self.config.temp_root.join(format!("{prefix}_{now_ms}_{rand}.{ext}"))
    }

    /// Move a temp file into `<media_root>/inbound/YYYY-MM-DD/` and return
    /// the new absolute path. Only files inside the temp root are moved;
    /// anything else is returned unchanged. Pruning runs opportunistically
    /// afterwards.
    pub async fn archive(&self, path: &Path) -> PathBuf {
        if !path.starts_with(&self.config.temp_root) {
            return path.to_path_buf();
        }
        let day = chrono::Local::now().format("%Y-%m-%d").to_string();
        let dir = self.config.media_root.join("inbound").join(day);
        let Some(file_name) = path.file_name() else {
            return path.to_path_buf();
        };
        let dest = dir.join(file_name);

        let moved = async {
            tokio::fs::create_dir_all(&dir).await?;
            match tokio::fs::rename(path, &dest).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    // Cross-device moves fall back to copy + delete.
                    tokio::fs::copy(path, &dest).await?;
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        debug!(path = %path.display(), error = %e, "temp cleanup failed");
                    }
                    Ok::<_, std::io::Error>(())
                },
            }
        }
        .await;

        let result = match moved {
            Ok(()) => dest,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "archive move failed, keeping temp path");
                path.to_path_buf()
            },
        };

        self.prune();
        result
    }

    /// Best-effort retention sweep over the dated inbound directories.
    /// Files younger than the cutoff are never touched; non-conforming
    /// entries are left alone.
    pub fn prune(&self) {
        let cutoff = SystemTime::now()
            - Duration::from_secs(u64::from(self.config.keep_days) * 24 * 60 * 60);
        let inbound = self.config.media_root.join("inbound");
        let Ok(entries) = std::fs::read_dir(&inbound) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if chrono::NaiveDate::parse_from_str(name, "%Y-%m-%d").is_err() {
                continue;
            }
            if !dir_older_than(&entry.path(), cutoff) {
                continue;
            }
            prune_dir(&entry.path(), cutoff);
        }
    }
}

fn dir_older_than(path: &Path, cutoff: SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| mtime < cutoff)
        .unwrap_or(false)
}

fn prune_dir(dir: &Path, cutoff: SystemTime) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if stale && let Err(e) = std::fs::remove_file(entry.path()) {
            debug!(path = %entry.path().display(), error = %e, "prune failed");
        }
    }
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = path.with_extension("part");
    tokio::fs::write(&part, body).await?;
    tokio::fs::rename(&part, path).await?;
    Ok(())
}

/// Extension precedence: caller filename, then Content-Disposition, then
/// the MIME table, then `bin`.
fn resolve_extension(
    filename: Option<&str>,
    disposition: Option<&str>,
    mime_hint: Option<&str>,
) -> String {
    if let Some(ext) = filename.and_then(mime::extension_of) {
        return ext.to_ascii_lowercase();
    }
    if let Some(name) = disposition.and_then(disposition_filename)
        && let Some(ext) = mime::extension_of(&name)
    {
        return ext.to_ascii_lowercase();
    }
    if let Some(ext) = mime_hint.and_then(mime::extension_for_mime) {
        return ext.to_string();
    }
    "bin".to_string()
}

/// Pull the file name out of a Content-Disposition header, handling both
/// the plain and the RFC 5987 (`filename*=UTF-8''…`) forms.
fn disposition_filename(header: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename*=") {
            let value = value.strip_prefix("UTF-8''").unwrap_or(value);
            return Some(urlencoding::decode(value).map(|c| c.into_owned()).unwrap_or_else(|_| value.to_string()));
        }
    }
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename=") {
            let value = value.trim_matches('"');
            let decoded = urlencoding::decode(value)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| value.to_string());
            return Some(decoded);
        }
    }
    None
}

fn unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
