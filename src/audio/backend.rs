use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use thiserror::Error;

use crate::sources::Track;

/// Errores de conexión y reproducción de los backends de audio
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no hay conexión de voz para el servidor")]
    NotConnected,

    #[error("no se pudo unir al canal de voz: {0}")]
    Join(String),

    #[error("el nodo Lavalink no está listo")]
    NodeNotReady,

    #[error("protocolo del nodo: {0}")]
    Protocol(String),

    #[error("el nodo respondió {status}: {message}")]
    Node { status: u16, message: String },

    #[error("no se encontró un track reproducible")]
    NoPlayableTrack,

    #[error("error de reproducción: {0}")]
    Stream(String),

    #[error("el reproductor ya no existe en el nodo")]
    PlayerGone,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Se invoca exactamente una vez cuando el track termina, se detiene o falla.
pub type TrackEndCallback = Box<dyn FnOnce(Option<AudioError>) + Send + 'static>;

/// Capacidades que todo backend de audio debe ofrecer, siempre por servidor.
///
/// El backend es dueño de la conexión de voz. `play` no bloquea hasta el final
/// del track: devuelve en cuanto la reproducción arranca y avisa del final por
/// el callback.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Nombre corto para logs (`ffmpeg`, `lavalink`, `hybrid`)
    fn name(&self) -> &'static str;

    /// Inicialización única del proceso. Idempotente.
    async fn connect(&self, bot_user: UserId) -> Result<(), AudioError>;

    /// Une o mueve la conexión de voz a `channel`. No hace nada si ya está ahí.
    async fn ensure_player(&self, guild_id: GuildId, channel: ChannelId) -> Result<(), AudioError>;

    /// Empieza a reproducir `track`. Falla si no hay reproductor conectado.
    async fn play(
        &self,
        guild_id: GuildId,
        track: &Track,
        on_end: TrackEndCallback,
    ) -> Result<(), AudioError>;

    async fn stop(&self, guild_id: GuildId) -> Result<(), AudioError>;

    async fn pause(&self, guild_id: GuildId) -> Result<(), AudioError>;

    async fn resume(&self, guild_id: GuildId) -> Result<(), AudioError>;

    /// Detener y dejar que el callback avance la cola
    async fn skip(&self, guild_id: GuildId) -> Result<(), AudioError> {
        self.stop(guild_id).await
    }

    /// Volumen en porcentaje, limitado a 0-200
    async fn set_volume(&self, guild_id: GuildId, percent: u16) -> Result<(), AudioError>;

    async fn is_playing(&self, guild_id: GuildId) -> bool;

    /// Cierra la conexión de voz. Seguro de llamar sin conexión.
    async fn disconnect(&self, guild_id: GuildId) -> Result<(), AudioError>;
}

pub const MAX_VOLUME_PERCENT: u16 = 200;

/// Porcentaje a factor de amplitud (100% -> 1.0)
pub fn volume_factor(percent: u16) -> f32 {
    f32::from(percent.min(MAX_VOLUME_PERCENT)) / 100.0
}
