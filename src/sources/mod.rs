//! # Sources Module
//!
//! Track resolution: turning a free-text request or a URL into playable [`Track`]s.
//!
//! - [`youtube`] - yt-dlp resolver and YouTube URL helpers
//! - [`lavalink`] - search through a remote Lavalink node
//! - [`hybrid`] - node search, local stream resolution
//!
//! Resolvers never fail on a miss: "not found" is `Ok(None)`.

pub mod hybrid;
pub mod lavalink;
pub mod youtube;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use std::time::Duration;

pub use hybrid::HybridResolver;
pub use lavalink::LavalinkResolver;
pub use youtube::YtDlpResolver;

/// Usuario que pidió la canción
#[derive(Debug, Clone, PartialEq)]
pub struct Requester {
    pub user_id: UserId,
    pub name: String,
    pub icon_url: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl Requester {
    pub fn new(user_id: UserId, name: impl Into<String>, icon_url: Option<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            icon_url,
            requested_at: Utc::now(),
        }
    }
}

/// Representa un track de música ya resuelto
///
/// Inmutable una vez creado; la cola que lo contiene es su dueña.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub title: String,
    /// Página canónica (`https://www.youtube.com/watch?v=...`)
    pub url: String,
    /// URI reproducible: stream directo o la página para que yt-dlp la resuelva
    pub source: String,
    pub thumbnail: Option<String>,
    pub duration: Option<Duration>,
    pub video_id: Option<String>,
    pub author: Option<String>,
    pub author_url: Option<String>,
    /// Track codificado por Lavalink, si el resolver vino del nodo
    pub node_track: Option<String>,
    pub requester: Requester,
}

impl Track {
    pub fn new(title: impl Into<String>, url: impl Into<String>, requester: Requester) -> Self {
        let url = url.into();
        Self {
            title: title.into(),
            source: url.clone(),
            url,
            thumbnail: None,
            duration: None,
            video_id: None,
            author: None,
            author_url: None,
            node_track: None,
            requester,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: Option<String>) -> Self {
        self.thumbnail = thumbnail;
        self
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_video_id(mut self, video_id: Option<String>) -> Self {
        self.video_id = video_id;
        self
    }

    pub fn with_author(mut self, author: Option<String>, author_url: Option<String>) -> Self {
        self.author = author;
        self.author_url = author_url;
        self
    }

    pub fn with_node_track(mut self, encoded: Option<String>) -> Self {
        self.node_track = encoded;
        self
    }
}

/// Resultado de una búsqueda
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Track(Track),
    Playlist {
        title: String,
        count: usize,
        tracks: Vec<Track>,
    },
}

impl Resolved {
    pub fn playlist(title: impl Into<String>, tracks: Vec<Track>) -> Self {
        Resolved::Playlist {
            title: title.into(),
            count: tracks.len(),
            tracks,
        }
    }

    /// Consume el resultado y devuelve los tracks en orden
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            Resolved::Track(track) => vec![track],
            Resolved::Playlist { tracks, .. } => tracks,
        }
    }
}

/// Trait común para todas las fuentes de música
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resuelve texto libre o una URL. `Ok(None)` significa "no encontrado".
    async fn resolve(&self, query: &str, requester: &Requester) -> Result<Option<Resolved>>;

    /// Nombre de la fuente, para logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn requester() -> Requester {
        Requester::new(UserId::new(77), "tester", None)
    }

    pub fn track(title: &str) -> Track {
        Track::new(
            title,
            format!("https://www.youtube.com/watch?v={}", title),
            requester(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_playlist_counts_tracks() {
        let resolved = Resolved::playlist("mix", vec![track("a"), track("b")]);
        match &resolved {
            Resolved::Playlist { title, count, .. } => {
                assert_eq!(title, "mix");
                assert_eq!(*count, 2);
            }
            other => panic!("esperaba playlist, obtuve {:?}", other),
        }

        let titles: Vec<String> = resolved.into_tracks().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[test]
    fn test_source_defaults_to_page_url() {
        let t = track("x");
        assert_eq!(t.source, t.url);
        assert_eq!(t.with_source("https://cdn/x.webm").source, "https://cdn/x.webm");
    }
}
