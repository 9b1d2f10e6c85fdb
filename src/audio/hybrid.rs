use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;

use super::backend::{AudioBackend, AudioError, TrackEndCallback};
use super::lavalink_client::LavalinkClient;
use super::local::LocalBackend;
use crate::sources::Track;

/// El nodo Lavalink solo busca; la reproducción es local con Songbird
pub struct HybridBackend {
    node: Arc<LavalinkClient>,
    local: LocalBackend,
}

impl HybridBackend {
    pub fn new(node: Arc<LavalinkClient>, local: LocalBackend) -> Self {
        Self { node, local }
    }
}

#[async_trait]
impl AudioBackend for HybridBackend {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    async fn connect(&self, bot_user: UserId) -> Result<(), AudioError> {
        self.local.connect(bot_user).await?;
        self.node.connect(bot_user).await
    }

    async fn ensure_player(&self, guild_id: GuildId, channel: ChannelId) -> Result<(), AudioError> {
        self.local.ensure_player(guild_id, channel).await
    }

    async fn play(
        &self,
        guild_id: GuildId,
        track: &Track,
        on_end: TrackEndCallback,
    ) -> Result<(), AudioError> {
        self.local.play(guild_id, track, on_end).await
    }

    async fn stop(&self, guild_id: GuildId) -> Result<(), AudioError> {
        self.local.stop(guild_id).await
    }

    async fn pause(&self, guild_id: GuildId) -> Result<(), AudioError> {
        self.local.pause(guild_id).await
    }

    async fn resume(&self, guild_id: GuildId) -> Result<(), AudioError> {
        self.local.resume(guild_id).await
    }

    async fn skip(&self, guild_id: GuildId) -> Result<(), AudioError> {
        self.local.skip(guild_id).await
    }

    async fn set_volume(&self, guild_id: GuildId, percent: u16) -> Result<(), AudioError> {
        self.local.set_volume(guild_id, percent).await
    }

    async fn is_playing(&self, guild_id: GuildId) -> bool {
        self.local.is_playing(guild_id).await
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), AudioError> {
        self.local.disconnect(guild_id).await
    }
}
