use async_process::{Command, Stdio};
use async_trait::async_trait;
use futures::{
    io::{AsyncRead, BufReader},
    AsyncBufReadExt, AsyncReadExt, StreamExt,
};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{AudioStream, ProgressFn, ResolvedVideo, SearchResult, SourceError, VideoResolver};

const PROGRESS_TEMPLATE: &str =
    "download:%(progress.downloaded_bytes)s/%(progress.total_bytes)s";

/// Cliente de yt-dlp.
pub struct YtDlpResolver {
    binary: String,
    // Limitar procesos concurrentes para evitar rate limiting
    rate_limiter: Semaphore,
}

/// Información extraída de yt-dlp
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: String,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    formats: Option<Vec<Format>>,
}

#[derive(Debug, Deserialize)]
struct Format {
    format_id: String,
    url: Option<String>,
    ext: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    abr: Option<f64>,
    filesize: Option<u64>,
}

impl YtDlpInfo {
    fn author(&self) -> Option<String> {
        self.uploader.clone().or_else(|| self.channel.clone())
    }

    fn into_resolved(self) -> ResolvedVideo {
        let author = self.author();
        let webpage_url = self
            .webpage_url
            .unwrap_or_else(|| super::watch_url(&self.id));
        let streams = self
            .formats
            .unwrap_or_default()
            .into_iter()
            .filter_map(|f| {
                Some(AudioStream {
                    url: f.url?,
                    format_id: f.format_id,
                    ext: f.ext,
                    abr: f.abr,
                    filesize: f.filesize,
                    acodec: f.acodec,
                    vcodec: f.vcodec,
                })
            })
            .collect();

        ResolvedVideo {
            id: self.id,
            title: self.title,
            author,
            duration: self.duration.map(Duration::from_secs_f64),
            thumbnail: self.thumbnail,
            webpage_url,
            streams,
        }
    }

    fn into_search_result(self) -> SearchResult {
        let author = self.author();
        let url = self
            .webpage_url
            .or(self.url)
            .unwrap_or_else(|| super::watch_url(&self.id));
        SearchResult {
            duration: self.duration.map(Duration::from_secs_f64),
            id: self.id,
            title: self.title,
            author,
            url,
        }
    }
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            rate_limiter: Semaphore::new(3),
        }
    }

    /// Versión instalada de yt-dlp; sirve como health check.
    pub async fn version(&self) -> Result<String, SourceError> {
        let output = Command::new(&self.binary).arg("--version").output().await?;
        if !output.status.success() {
            return Err(failed(&output.status, &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_json(&self, args: &[&str]) -> Result<String, SourceError> {
        let _permit = self.rate_limiter.acquire().await.ok();

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(failed(&output.status, &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl VideoResolver for YtDlpResolver {
    async fn resolve(&self, url: &str) -> Result<ResolvedVideo, SourceError> {
        debug!("📊 Obteniendo info de: {}", url);

        let stdout = self
            .run_json(&["--no-playlist", "--dump-json", "--no-warnings", url])
            .await?;
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| SourceError::NotFound(url.to_string()))?;
        let info: YtDlpInfo = serde_json::from_str(line)?;

        Ok(info.into_resolved())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SourceError> {
        info!("🔍 Buscando en YouTube: {}", query);

        let search_query = format!("ytsearch{}:{}", limit, query);
        let stdout = self
            .run_json(&[
                "--no-playlist",
                "--dump-json",
                "--flat-playlist",
                "--skip-download",
                "--no-warnings",
                &search_query,
            ])
            .await?;

        let mut results = Vec::new();
        for line in stdout.lines() {
            match serde_json::from_str::<YtDlpInfo>(line) {
                Ok(info) => results.push(info.into_search_result()),
                Err(e) => debug!("Línea de búsqueda ignorada: {}", e),
            }
        }
        Ok(results)
    }

    async fn download(
        &self,
        url: &str,
        format_id: &str,
        dest: &Path,
        progress: ProgressFn,
    ) -> Result<(), SourceError> {
        let dest = dest.to_string_lossy().into_owned();
        debug!("⬇️ Descargando formato {} de {} en {}", format_id, url, dest);

        let mut child = Command::new(&self.binary)
            .args([
                "--no-playlist",
                "--no-warnings",
                "--no-part",
                "--force-overwrites",
                "--newline",
                "--progress-template",
                PROGRESS_TEMPLATE,
                "-f",
                format_id,
                "-o",
                &dest,
                url,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        // stderr a la par: con su pipe lleno yt-dlp deja de escribir progreso
        let ((), stderr) = futures::join!(
            async {
                if let Some(stdout) = stdout {
                    track_progress(stdout, &progress).await;
                }
            },
            drain(child.stderr.take()),
        );

        let status = child.status().await?;
        if !status.success() {
            return Err(failed(&status, &stderr));
        }
        Ok(())
    }
}

/// Reporta cada línea de progreso hasta que el proceso cierra stdout.
async fn track_progress<R: AsyncRead + Unpin>(stdout: R, progress: &ProgressFn) {
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if let Some((done, total)) = parse_progress(&line) {
                    progress(done, total);
                }
            }
            Err(e) => {
                warn!("Error leyendo salida de yt-dlp: {}", e);
                break;
            }
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!("stderr de yt-dlp incompleto: {}", e);
        }
    }
    buf
}

fn failed(status: &std::process::ExitStatus, stderr: &[u8]) -> SourceError {
    SourceError::Failed {
        status: status.to_string(),
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    }
}

/// Parsea una línea `descargados/totales` del progress template.
fn parse_progress(line: &str) -> Option<(u64, u64)> {
    let (done, total) = line.trim().split_once('/')?;
    let done = parse_bytes(done)?;
    let total = parse_bytes(total).unwrap_or(0);
    Some((done, total))
}

// yt-dlp imprime "NA" cuando no conoce el valor, y a veces floats
fn parse_bytes(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    raw.parse::<u64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().map(|f| f as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_progress_line_parsing() {
        assert_eq!(parse_progress("1024/4096"), Some((1024, 4096)));
        assert_eq!(parse_progress("1024/NA"), Some((1024, 0)));
        assert_eq!(parse_progress("2048.0/4096.0\n"), Some((2048, 4096)));
        assert_eq!(parse_progress("[youtube] Extracting URL"), None);
    }

    #[tokio::test]
    async fn test_stderr_is_drained_alongside_progress() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let seen = seen.clone();
            Arc::new(move |done, total| seen.lock().push((done, total)))
        };
        let stdout = futures::io::Cursor::new(
            b"[youtube] Extracting URL\n512/2048\n2048/2048\n".to_vec(),
        );
        // más de lo que cabe en un pipe
        let stderr = futures::io::Cursor::new(vec![b'e'; 256 * 1024]);

        let ((), stderr) = futures::join!(track_progress(stdout, &progress), drain(Some(stderr)));

        assert_eq!(*seen.lock(), vec![(512, 2048), (2048, 2048)]);
        assert_eq!(stderr.len(), 256 * 1024);
    }

    #[test]
    fn test_info_conversion_keeps_streams_with_urls() {
        let json = r#"{
            "id": "dQw4w9WgXcQ",
            "title": "Never Gonna Give You Up",
            "duration": 212.0,
            "channel": "Rick Astley",
            "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "formats": [
                {"format_id": "140", "url": "https://cdn/140", "ext": "m4a",
                 "acodec": "mp4a.40.2", "vcodec": "none", "abr": 129.5},
                {"format_id": "sb0", "ext": "mhtml", "acodec": "none", "vcodec": "none"}
            ]
        }"#;
        let info: YtDlpInfo = serde_json::from_str(json).unwrap();
        let video = info.into_resolved();

        assert_eq!(video.author.as_deref(), Some("Rick Astley"));
        assert_eq!(video.duration, Some(Duration::from_secs(212)));
        assert_eq!(video.streams.len(), 1);
        assert_eq!(video.best_audio().unwrap().format_id, "140");
    }

    #[test]
    fn test_flat_search_entry_falls_back_to_watch_url() {
        let json = r#"{"id": "abcdefghijk", "title": "Song", "duration": null}"#;
        let info: YtDlpInfo = serde_json::from_str(json).unwrap();
        let result = info.into_search_result();

        assert_eq!(result.url, "https://www.youtube.com/watch?v=abcdefghijk");
    }
}
