//! # Sources Module
//!
//! Video resolution for Opal Bot.
//!
//! A [`VideoResolver`] turns a URL into metadata plus its available audio
//! streams, runs text searches and downloads a chosen stream to disk while
//! reporting progress. The shipped implementation drives `yt-dlp`
//! ([`ytdlp::YtDlpResolver`]); tests use the generated `MockVideoResolver`.

pub mod ytdlp;

use async_trait::async_trait;
use regex::Regex;
use std::{
    path::Path,
    sync::{Arc, LazyLock},
    time::Duration,
};
use thiserror::Error;
use url::Url;

pub use ytdlp::YtDlpResolver;

static VIDEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:youtube\.com/(?:[^/]+/.+/|(?:v|e(?:mbed)?|shorts|live)/|.*[?&]v=)|youtu\.be/)([^"&?/\s]{11})"#,
    )
    .expect("regex de video id válido")
});

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no se pudo ejecutar yt-dlp: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("yt-dlp terminó con error ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    #[error("respuesta de yt-dlp inválida: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no se encontró el video: {0}")]
    NotFound(String),
}

/// Un stream disponible para un video.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStream {
    pub format_id: String,
    pub url: String,
    pub ext: Option<String>,
    pub abr: Option<f64>,
    pub filesize: Option<u64>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
}

impl AudioStream {
    /// Tiene audio y no trae video.
    pub fn is_audio_only(&self) -> bool {
        let has_audio = self.acodec.as_deref().is_some_and(|c| c != "none");
        let no_video = self.vcodec.as_deref().map_or(true, |c| c == "none");
        has_audio && no_video
    }
}

/// Metadata resuelta de un video.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedVideo {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
    pub webpage_url: String,
    pub streams: Vec<AudioStream>,
}

impl ResolvedVideo {
    /// El stream solo-audio de mayor bitrate.
    pub fn best_audio(&self) -> Option<&AudioStream> {
        self.streams
            .iter()
            .filter(|s| s.is_audio_only())
            .max_by(|a, b| {
                a.abr
                    .unwrap_or(0.0)
                    .partial_cmp(&b.abr.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration: Option<Duration>,
    pub url: String,
}

/// Recibe `(bytes_descargados, bytes_totales)`; total es 0 si no se conoce.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoResolver: Send + Sync {
    /// Resuelve título y streams de una URL.
    async fn resolve(&self, url: &str) -> Result<ResolvedVideo, SourceError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SourceError>;

    /// Descarga el stream `format_id` de `url` en `dest`.
    async fn download(
        &self,
        url: &str,
        format_id: &str,
        dest: &Path,
        progress: ProgressFn,
    ) -> Result<(), SourceError>;
}

/// Extrae el id de 11 caracteres de una URL de YouTube.
pub fn extract_video_id(url: &str) -> Option<String> {
    VIDEO_ID_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// URL canónica de un video.
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// `true` si la consulta es una URL http(s) y no texto de búsqueda.
pub fn is_url(query: &str) -> bool {
    Url::parse(query.trim())
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_video_id_extraction() {
        let cases = [
            ("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "dQw4w9WgXcQ"),
            ("https://youtu.be/dQw4w9WgXcQ?t=42", "dQw4w9WgXcQ"),
            ("https://www.youtube.com/embed/dQw4w9WgXcQ", "dQw4w9WgXcQ"),
            ("https://youtube.com/shorts/abcdefghijk", "abcdefghijk"),
            (
                "https://www.youtube.com/watch?feature=share&v=dQw4w9WgXcQ&list=x",
                "dQw4w9WgXcQ",
            ),
        ];
        for (url, id) in cases {
            assert_eq!(extract_video_id(url).as_deref(), Some(id), "{url}");
        }
        assert_eq!(extract_video_id("https://example.com/watch?v=short"), None);
        assert_eq!(extract_video_id("never gonna give you up"), None);
    }

    #[test]
    fn test_url_vs_search_text() {
        assert!(is_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(!is_url("rick astley"));
        assert!(!is_url("ftp://example.com/file"));
    }

    #[test]
    fn best_audio_prefers_audio_only_highest_bitrate() {
        let stream = |id: &str, abr: f64, vcodec: &str| AudioStream {
            format_id: id.to_string(),
            url: format!("https://cdn/{id}"),
            ext: Some("m4a".to_string()),
            abr: Some(abr),
            filesize: None,
            acodec: Some("mp4a.40.2".to_string()),
            vcodec: Some(vcodec.to_string()),
        };
        let video = ResolvedVideo {
            id: "dQw4w9WgXcQ".to_string(),
            title: "t".to_string(),
            author: None,
            duration: None,
            thumbnail: None,
            webpage_url: watch_url("dQw4w9WgXcQ"),
            streams: vec![
                stream("18", 256.0, "avc1"),
                stream("139", 48.0, "none"),
                stream("140", 128.0, "none"),
            ],
        };

        assert_eq!(video.best_audio().map(|s| s.format_id.as_str()), Some("140"));
    }
}
