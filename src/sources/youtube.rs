use anyhow::{Context, Result};
use async_process::Command;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{Requester, Resolved, Track, TrackResolver};

/// Verifica si el texto es una URL de YouTube (con o sin esquema)
pub fn is_youtube_url(text: &str) -> bool {
    parse_loose(text)
        .and_then(|url| url.host_str().map(is_youtube_host))
        .unwrap_or(false)
}

/// `youtube.com/playlist?list=...`
pub fn is_playlist_url(text: &str) -> bool {
    let Some(url) = parse_loose(text) else {
        return false;
    };

    url.host_str().is_some_and(is_youtube_host)
        && url.path() == "/playlist"
        && url
            .query_pairs()
            .any(|(key, value)| key == "list" && !value.is_empty())
}

/// Extrae el id de vídeo de las formas `watch?v=`, `youtu.be/`, `live/` y `shorts/`
pub fn video_id(text: &str) -> Option<String> {
    let url = parse_loose(text)?;
    let host = url.host_str()?;

    if host.eq_ignore_ascii_case("youtu.be") {
        return url
            .path_segments()?
            .next()
            .filter(|id| !id.is_empty())
            .map(str::to_string);
    }

    if !is_youtube_host(host) {
        return None;
    }

    let mut segments = url.path_segments()?;
    match segments.next()? {
        "watch" => url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned())
            .filter(|id| !id.is_empty()),
        "live" | "shorts" => segments
            .next()
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// Normaliza a `https://www.youtube.com/watch?v=<id>`, descartando `list`, `si`, etc.
pub fn canonical_watch_url(text: &str) -> Option<String> {
    video_id(text).map(|id| format!("https://www.youtube.com/watch?v={}", id))
}

fn parse_loose(text: &str) -> Option<Url> {
    let text = text.trim();
    if text.contains(char::is_whitespace) {
        return None;
    }
    Url::parse(text)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .or_else(|| Url::parse(&format!("https://{}", text)).ok())
}

fn is_youtube_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    matches!(
        host,
        "youtube.com" | "m.youtube.com" | "music.youtube.com" | "youtu.be"
    )
}

/// Información extraída de yt-dlp
#[derive(Debug, Deserialize)]
pub(crate) struct YtDlpInfo {
    id: Option<String>,
    display_id: Option<String>,
    title: Option<String>,
    /// Stream directo en modo completo, página en modo `--flat-playlist`
    url: Option<String>,
    webpage_url: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    duration: Option<f64>,
    uploader: Option<String>,
    uploader_url: Option<String>,
    channel: Option<String>,
    channel_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

/// Respuesta de `--dump-single-json` sobre una playlist
#[derive(Debug, Deserialize)]
pub(crate) struct YtDlpPlaylist {
    title: Option<String>,
    #[serde(default)]
    entries: Vec<Option<YtDlpInfo>>,
}

impl YtDlpInfo {
    /// Convierte la respuesta en un `Track`. Entradas sin título o sin id se descartan.
    pub(crate) fn into_track(self, requester: &Requester) -> Option<Track> {
        let title = self.title.filter(|t| !t.is_empty())?;
        let id = self.display_id.or(self.id)?;

        let page = self
            .webpage_url
            .as_deref()
            .and_then(canonical_watch_url)
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", id));

        let source = self
            .url
            .filter(|u| u.starts_with("http"))
            .unwrap_or_else(|| page.clone());

        let thumbnail = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().last().map(|t| t.url));

        Some(
            Track::new(title, page, requester.clone())
                .with_source(source)
                .with_thumbnail(thumbnail)
                .with_duration(
                    self.duration
                        .filter(|d| d.is_finite() && *d >= 0.0)
                        .map(Duration::from_secs_f64),
                )
                .with_video_id(Some(id))
                .with_author(
                    self.uploader.or(self.channel),
                    self.uploader_url.or(self.channel_url),
                ),
        )
    }
}

impl YtDlpPlaylist {
    pub(crate) fn into_resolved(self, requester: &Requester, max_items: usize) -> Option<Resolved> {
        let tracks: Vec<Track> = self
            .entries
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.into_track(requester))
            .take(max_items)
            .collect();

        if tracks.is_empty() {
            return None;
        }

        Some(Resolved::playlist(
            self.title.unwrap_or_else(|| "Playlist".to_string()),
            tracks,
        ))
    }
}

/// Resolver basado en yt-dlp
pub struct YtDlpResolver {
    cookies: Option<PathBuf>,
    max_playlist_size: usize,
    // Limitar procesos concurrentes para evitar rate limiting
    rate_limiter: tokio::sync::Semaphore,
}

impl YtDlpResolver {
    pub fn new(cookies: Option<PathBuf>, max_playlist_size: usize) -> Self {
        Self {
            cookies,
            max_playlist_size,
            rate_limiter: tokio::sync::Semaphore::new(3),
        }
    }

    /// Resuelve una única canción a partir de su página
    pub async fn resolve_single(&self, url: &str, requester: &Requester) -> Result<Option<Track>> {
        debug!("📊 Obteniendo info de: {}", url);

        let Some(stdout) = self
            .run(&[
                "--no-playlist",
                "--dump-json",
                "-f",
                "bestaudio[protocol=https]/bestaudio/best",
                url,
            ])
            .await?
        else {
            return Ok(None);
        };

        let info: YtDlpInfo =
            serde_json::from_str(stdout.trim()).context("Error al parsear respuesta de yt-dlp")?;
        Ok(info.into_track(requester))
    }

    async fn search(&self, query: &str, requester: &Requester) -> Result<Option<Track>> {
        info!("🔍 Buscando en YouTube: {}", query);

        let search_query = format!("ytsearch1:{}", query);
        let Some(stdout) = self
            .run(&[
                "--no-playlist",
                "--dump-json",
                "-f",
                "bestaudio[protocol=https]/bestaudio/best",
                &search_query,
            ])
            .await?
        else {
            return Ok(None);
        };

        Ok(stdout
            .lines()
            .filter_map(|line| serde_json::from_str::<YtDlpInfo>(line).ok())
            .find_map(|info| info.into_track(requester)))
    }

    async fn playlist(&self, url: &str, requester: &Requester) -> Result<Option<Resolved>> {
        info!("📋 Obteniendo playlist: {}", url);

        let limit = self.max_playlist_size.to_string();
        let Some(stdout) = self
            .run(&[
                "--flat-playlist",
                "--dump-single-json",
                "--playlist-end",
                &limit,
                url,
            ])
            .await?
        else {
            return Ok(None);
        };

        let playlist: YtDlpPlaylist =
            serde_json::from_str(stdout.trim()).context("Error al parsear playlist de yt-dlp")?;
        Ok(playlist.into_resolved(requester, self.max_playlist_size))
    }

    /// Ejecuta yt-dlp. `Ok(None)` cuando el proceso termina con error (vídeo privado, sin resultados...).
    async fn run(&self, args: &[&str]) -> Result<Option<String>> {
        let _permit = self.rate_limiter.acquire().await?;

        let mut command = Command::new("yt-dlp");
        command.args(["--no-warnings", "--skip-download"]);
        if let Some(cookies) = &self.cookies {
            command.arg("--cookies").arg(cookies);
        }

        let output = command
            .args(args)
            .output()
            .await
            .context("Error al ejecutar yt-dlp")?;

        if !output.status.success() {
            warn!(
                "⚠️ yt-dlp falló: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str, requester: &Requester) -> Result<Option<Resolved>> {
        if !is_youtube_url(query) {
            return Ok(self.search(query, requester).await?.map(Resolved::Track));
        }

        if is_playlist_url(query) {
            return self.playlist(query, requester).await;
        }

        let url = canonical_watch_url(query).unwrap_or_else(|| query.trim().to_string());
        Ok(self
            .resolve_single(&url, requester)
            .await?
            .map(Resolved::Track))
    }

    fn name(&self) -> &'static str {
        "yt-dlp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::requester;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_youtube_url_detection() {
        assert!(is_youtube_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_youtube_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_youtube_url("youtube.com/watch?v=abc"));
        assert!(is_youtube_url("https://music.youtube.com/watch?v=test"));
        assert!(!is_youtube_url("https://example.com/video"));
        assert!(!is_youtube_url("never gonna give you up"));
    }

    #[test]
    fn test_playlist_detection() {
        assert!(is_playlist_url(
            "https://www.youtube.com/playlist?list=PLg3uhUAs7P6o_mdJI3T2XZsGVTmn3g7g6"
        ));
        assert!(is_playlist_url(
            "https://youtube.com/playlist?list=PLg3uhUAs7P6o&si=RAUs33iGEwQhKhmj"
        ));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=htALtC8nZiQ"));
        assert!(!is_playlist_url(
            "https://www.youtube.com/watch?v=mBXBOLG06Wc&list=PLg3uhUAs7P6o"
        ));
    }

    #[test]
    fn test_canonical_watch_url() {
        let expected = Some("https://www.youtube.com/watch?v=mBXBOLG06Wc".to_string());

        assert_eq!(
            canonical_watch_url(
                "https://www.youtube.com/watch?v=mBXBOLG06Wc&list=PLg3uhUAs7P6o&index=1"
            ),
            expected
        );
        assert_eq!(
            canonical_watch_url("https://youtu.be/mBXBOLG06Wc?si=rOtXyr4ST31MJvzK"),
            expected
        );
        assert_eq!(
            canonical_watch_url("https://www.youtube.com/live/4Df04ViiX5U"),
            Some("https://www.youtube.com/watch?v=4Df04ViiX5U".to_string())
        );
        assert_eq!(canonical_watch_url("https://www.youtube.com/feed"), None);
        assert_eq!(canonical_watch_url("https://vimeo.com/watch?v=x"), None);
    }

    #[test]
    fn test_full_info_maps_to_track() {
        let json = r#"{
            "id": "htALtC8nZiQ",
            "display_id": "htALtC8nZiQ",
            "title": "Canción",
            "url": "https://rr1.googlevideo.com/videoplayback?x=1",
            "webpage_url": "https://www.youtube.com/watch?v=htALtC8nZiQ",
            "thumbnail": "https://i.ytimg.com/vi/htALtC8nZiQ/maxresdefault.jpg",
            "duration": 215.0,
            "uploader": "Artista",
            "uploader_url": "https://www.youtube.com/@artista"
        }"#;

        let info: YtDlpInfo = serde_json::from_str(json).unwrap();
        let track = info.into_track(&requester()).unwrap();

        assert_eq!(track.title, "Canción");
        assert_eq!(track.url, "https://www.youtube.com/watch?v=htALtC8nZiQ");
        assert_eq!(track.source, "https://rr1.googlevideo.com/videoplayback?x=1");
        assert_eq!(track.duration, Some(Duration::from_secs(215)));
        assert_eq!(track.author.as_deref(), Some("Artista"));
        assert_eq!(track.video_id.as_deref(), Some("htALtC8nZiQ"));
    }

    #[test]
    fn test_flat_playlist_maps_and_drops_incomplete_entries() {
        let json = r#"{
            "title": "Mi lista",
            "entries": [
                {"id": "a1", "title": "Uno", "url": "https://www.youtube.com/watch?v=a1",
                 "thumbnails": [{"url": "https://i.ytimg.com/vi/a1/default.jpg"},
                                {"url": "https://i.ytimg.com/vi/a1/hqdefault.jpg"}],
                 "duration": 60, "channel": "Canal"},
                {"id": "b2", "title": null},
                null,
                {"id": "c3", "title": "Tres", "url": "https://www.youtube.com/watch?v=c3"},
                {"id": "d4", "title": "Cuatro"}
            ]
        }"#;

        let playlist: YtDlpPlaylist = serde_json::from_str(json).unwrap();
        let resolved = playlist.into_resolved(&requester(), 2).unwrap();

        match resolved {
            Resolved::Playlist { title, count, tracks } => {
                assert_eq!(title, "Mi lista");
                assert_eq!(count, 2);
                assert_eq!(tracks[0].title, "Uno");
                assert_eq!(tracks[0].source, "https://www.youtube.com/watch?v=a1");
                assert_eq!(
                    tracks[0].thumbnail.as_deref(),
                    Some("https://i.ytimg.com/vi/a1/hqdefault.jpg")
                );
                assert_eq!(tracks[0].author.as_deref(), Some("Canal"));
                assert_eq!(tracks[1].title, "Tres");
            }
            other => panic!("esperaba playlist, obtuve {:?}", other),
        }
    }

    #[test]
    fn test_empty_playlist_is_not_found() {
        let playlist: YtDlpPlaylist =
            serde_json::from_str(r#"{"title": "vacía", "entries": [{"id": "x"}]}"#).unwrap();
        assert!(playlist.into_resolved(&requester(), 10).is_none());
    }
}
