//! # Bot Module
//!
//! Discord surface of the bot.
//!
//! - Slash commands and status-message buttons, both routed through the
//!   [`GuildActionSerializer`]
//! - Song requests typed into each guild's music channel
//! - Voice state tracking: leave when disconnected or left alone, follow when moved

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Message, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod commands;
pub mod handlers;
pub mod serializer;

pub use serializer::{ActionError, CommandError, GuildActionSerializer};

use crate::{audio::AudioService, config::Config, sources::TrackResolver, ui::StatusBoard};

/// Handler de eventos de Discord
pub struct MusicBot {
    config: Arc<Config>,
    pub service: Arc<AudioService>,
    pub resolver: Arc<dyn TrackResolver>,
    pub board: Arc<StatusBoard>,
    pub serializer: GuildActionSerializer,
}

impl MusicBot {
    pub fn new(
        config: Arc<Config>,
        service: Arc<AudioService>,
        resolver: Arc<dyn TrackResolver>,
        board: Arc<StatusBoard>,
    ) -> Self {
        Self {
            config,
            service,
            resolver,
            board,
            serializer: GuildActionSerializer::new(),
        }
    }

    /// Registra los comandos globalmente o en la guild de desarrollo
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);

                commands::register_guild_commands(ctx, guild_id)
                    .await
                    .map_err(|e| {
                        error!("❌ Error registrando comandos de guild: {:?}", e);
                        anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                    })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    /// Detiene todo, sale del canal y deja el mensaje de estado en espera
    async fn shutdown_guild(&self, guild_id: GuildId) {
        if let Err(e) = self.service.stop(guild_id).await {
            warn!("⚠️ Error al detener reproducción en guild {}: {}", guild_id, e);
        }
        if let Err(e) = self.service.disconnect(guild_id).await {
            warn!("⚠️ Error al desconectar en guild {}: {}", guild_id, e);
        }
        self.board.show_idle(guild_id).await;
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());
        info!("🎛️ Backend de audio: {}", self.service.backend_name());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if let Err(e) = handlers::handle_song_request(&ctx, &msg, self).await {
            error!("Error manejando petición de canción: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(command_interaction) => {
                if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                    error!("Error manejando comando: {:?}", e);
                }
            }
            Interaction::Component(component_interaction) => {
                if let Err(e) = handlers::handle_component(&ctx, component_interaction, self).await {
                    error!("Error manejando componente: {:?}", e);
                }
            }
            _ => {}
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let bot_id = ctx.cache.current_user().id;

        if new.user_id == bot_id {
            match new.channel_id {
                None => {
                    if old.is_some() {
                        info!("🔌 Bot desconectado en guild {}", guild_id);
                        self.shutdown_guild(guild_id).await;
                    }
                }
                Some(channel_id) => {
                    if human_listeners(&ctx, guild_id, channel_id) == Some(0) {
                        info!("🚪 Bot movido a un canal vacío en guild {}", guild_id);
                        self.shutdown_guild(guild_id).await;
                    } else if self.service.follow_voice_channel(guild_id, channel_id).await {
                        info!("🔀 Sesión de guild {} sigue al bot al canal {}", guild_id, channel_id);
                    }
                }
            }
            return;
        }

        // Un usuario salió del canal del bot
        let Some(bot_channel) = self.service.voice_channel(guild_id).await else {
            return;
        };
        let left_bot_channel = old.and_then(|state| state.channel_id) == Some(bot_channel)
            && new.channel_id != Some(bot_channel);

        if left_bot_channel && human_listeners(&ctx, guild_id, bot_channel) == Some(0) {
            info!("🚪 Bot solo en el canal de voz en guild {}", guild_id);
            self.shutdown_guild(guild_id).await;
        }
    }
}

/// Usuarios que no son bots en `channel_id`, o `None` si la guild no está en caché
fn human_listeners(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> Option<usize> {
    let guild = ctx.cache.guild(guild_id)?;

    let count = guild
        .voice_states
        .values()
        .filter(|state| state.channel_id == Some(channel_id))
        .filter(|state| {
            let is_bot = state
                .member
                .as_ref()
                .map(|member| member.user.bot)
                .or_else(|| guild.members.get(&state.user_id).map(|m| m.user.bot))
                .unwrap_or(false);
            !is_bot
        })
        .count();

    Some(count)
}
