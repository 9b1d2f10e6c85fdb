use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::lavalink::LavalinkResolver;
use super::youtube::{is_youtube_url, YtDlpResolver};
use super::{Requester, Resolved, TrackResolver};

/// Busca en el nodo y resuelve el stream con yt-dlp para reproducirlo localmente
pub struct HybridResolver {
    search: LavalinkResolver,
    ytdlp: YtDlpResolver,
}

impl HybridResolver {
    pub fn new(search: LavalinkResolver, ytdlp: YtDlpResolver) -> Self {
        Self { search, ytdlp }
    }
}

#[async_trait]
impl TrackResolver for HybridResolver {
    async fn resolve(&self, query: &str, requester: &Requester) -> Result<Option<Resolved>> {
        if is_youtube_url(query) {
            return self.ytdlp.resolve(query, requester).await;
        }

        let Some(hit) = self.search.search_first(query, requester).await? else {
            return Ok(None);
        };

        debug!("🔗 Resolviendo stream local para: {}", hit.url);
        let local = match self.ytdlp.resolve_single(&hit.url, requester).await {
            Ok(Some(track)) => track,
            Ok(None) => hit.with_node_track(None),
            Err(e) => {
                warn!("⚠️ yt-dlp no resolvió '{}': {}", hit.title, e);
                hit.with_node_track(None)
            }
        };

        Ok(Some(Resolved::Track(local)))
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
