use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::youtube::{canonical_watch_url, is_playlist_url, is_youtube_url};
use super::{Requester, Resolved, Track, TrackResolver};
use crate::audio::lavalink_client::{LavalinkClient, LoadResult, NodeTrack};

/// Búsqueda y resolución a través del nodo Lavalink
pub struct LavalinkResolver {
    node: Arc<LavalinkClient>,
    max_playlist_size: usize,
}

impl LavalinkResolver {
    pub fn new(node: Arc<LavalinkClient>, max_playlist_size: usize) -> Self {
        Self {
            node,
            max_playlist_size,
        }
    }

    /// Primer resultado de buscar `text` en YouTube a través del nodo
    pub async fn search_first(&self, text: &str, requester: &Requester) -> Result<Option<Track>> {
        info!("🔍 Buscando en el nodo: {}", text);
        let result = self.node.load_tracks(&node_identifier(text)).await?;
        Ok(result
            .first_track()
            .map(|found| track_from_node(found, requester)))
    }
}

/// Identificador para `/loadtracks`: las URLs de YouTube pasan tal cual, el resto se busca
pub(crate) fn node_identifier(query: &str) -> String {
    let query = query.trim();
    if !is_youtube_url(query) {
        return format!("ytsearch:{}", query);
    }
    if is_playlist_url(query) {
        return query.to_string();
    }
    canonical_watch_url(query).unwrap_or_else(|| query.to_string())
}

pub(crate) fn track_from_node(node: NodeTrack, requester: &Requester) -> Track {
    let info = node.info;
    let youtube = info.source_name == "youtube";

    let url = info
        .uri
        .clone()
        .filter(|uri| !uri.is_empty())
        .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", info.identifier));

    let thumbnail = info.artwork_url.clone().or_else(|| {
        youtube.then(|| format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", info.identifier))
    });

    let duration = (!info.is_stream).then(|| Duration::from_millis(info.length));

    Track::new(info.title, url, requester.clone())
        .with_thumbnail(thumbnail)
        .with_duration(duration)
        .with_video_id(youtube.then_some(info.identifier))
        .with_author(Some(info.author), None)
        .with_node_track(Some(node.encoded))
}

pub(crate) fn resolved_from_node(
    result: LoadResult,
    requester: &Requester,
    max_items: usize,
) -> Option<Resolved> {
    match result {
        LoadResult::Playlist(playlist) => {
            let tracks: Vec<Track> = playlist
                .tracks
                .into_iter()
                .take(max_items)
                .map(|node| track_from_node(node, requester))
                .collect();

            if tracks.is_empty() {
                return None;
            }
            Some(Resolved::playlist(playlist.info.name, tracks))
        }
        other => other
            .first_track()
            .map(|node| Resolved::Track(track_from_node(node, requester))),
    }
}

#[async_trait]
impl TrackResolver for LavalinkResolver {
    async fn resolve(&self, query: &str, requester: &Requester) -> Result<Option<Resolved>> {
        let identifier = node_identifier(query);
        debug!("📡 loadtracks: {}", identifier);

        let result = self.node.load_tracks(&identifier).await?;
        Ok(resolved_from_node(result, requester, self.max_playlist_size))
    }

    fn name(&self) -> &'static str {
        "lavalink"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::requester;
    use pretty_assertions::assert_eq;

    const TRACK_JSON: &str = r#"{
        "encoded": "QAAAjQIAJVJpY2sgQXN0bGV5",
        "info": {
            "identifier": "dQw4w9WgXcQ",
            "isSeekable": true,
            "author": "RickAstleyVEVO",
            "length": 212000,
            "isStream": false,
            "position": 0,
            "title": "Never Gonna Give You Up",
            "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "artworkUrl": null,
            "isrc": null,
            "sourceName": "youtube"
        },
        "pluginInfo": {},
        "userData": {}
    }"#;

    #[test]
    fn test_identifier_for_text_and_urls() {
        assert_eq!(node_identifier(" lofi beats "), "ytsearch:lofi beats");
        assert_eq!(
            node_identifier("https://youtu.be/dQw4w9WgXcQ?si=abc"),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(
            node_identifier("https://www.youtube.com/playlist?list=PL123"),
            "https://www.youtube.com/playlist?list=PL123"
        );
    }

    #[test]
    fn test_node_track_maps_to_track() {
        let node: NodeTrack = serde_json::from_str(TRACK_JSON).unwrap();
        let track = track_from_node(node, &requester());

        assert_eq!(track.title, "Never Gonna Give You Up");
        assert_eq!(track.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(
            track.thumbnail.as_deref(),
            Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg")
        );
        assert_eq!(track.duration, Some(Duration::from_secs(212)));
        assert_eq!(track.node_track.as_deref(), Some("QAAAjQIAJVJpY2sgQXN0bGV5"));
        assert_eq!(track.author.as_deref(), Some("RickAstleyVEVO"));
    }

    #[test]
    fn test_search_takes_first_and_playlist_keeps_all() {
        let search = format!(r#"{{"loadType": "search", "data": [{0}, {0}]}}"#, TRACK_JSON);
        let result: LoadResult = serde_json::from_str(&search).unwrap();
        assert!(matches!(
            resolved_from_node(result, &requester(), 100),
            Some(Resolved::Track(_))
        ));

        let playlist = format!(
            r#"{{"loadType": "playlist", "data": {{
                "info": {{"name": "Favoritas", "selectedTrack": -1}},
                "pluginInfo": {{}},
                "tracks": [{0}, {0}, {0}]
            }}}}"#,
            TRACK_JSON
        );
        let result: LoadResult = serde_json::from_str(&playlist).unwrap();
        match resolved_from_node(result, &requester(), 2) {
            Some(Resolved::Playlist { title, count, tracks }) => {
                assert_eq!(title, "Favoritas");
                assert_eq!(count, 2);
                assert_eq!(tracks.len(), 2);
            }
            other => panic!("esperaba playlist, obtuve {:?}", other),
        }
    }

    #[test]
    fn test_empty_result_is_not_found() {
        let result: LoadResult = serde_json::from_str(r#"{"loadType": "empty", "data": {}}"#).unwrap();
        assert_eq!(resolved_from_node(result, &requester(), 100), None);
    }
}
