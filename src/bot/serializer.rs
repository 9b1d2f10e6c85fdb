//! Per-guild admission control for user-triggered actions.
//!
//! Each guild gets one async mutex and a pending counter. An action runs only while
//! holding the mutex, and at most [`MAX_PENDING`] actions may be queued or running at
//! once; the next one is rejected immediately instead of waiting.

use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::audio::AudioError;

pub const MAX_PENDING: usize = 5;

/// Errores que el usuario provoca y que se le muestran tal cual
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("❌ Debes estar en un canal de voz")]
    NotInVoice,

    #[error("❌ Debes estar en el mismo canal de voz que el bot")]
    OtherVoiceChannel,

    #[error("❌ No hay nada reproduciéndose")]
    NothingPlaying,

    #[error("❌ La música ya está en pausa")]
    AlreadyPaused,

    #[error("❌ La música no está en pausa")]
    NotPaused,

    #[error("❌ Se necesitan al menos 2 canciones en cola para mezclar")]
    NotEnoughTracks,

    #[error("❌ No se encontró nada para: {0}")]
    NotFound(String),

    #[error("❌ Este servidor no tiene canal de música, usa /setup")]
    NotConfigured,

    #[error("❌ Error del reproductor: {0}")]
    Backend(String),
}

impl From<AudioError> for CommandError {
    fn from(error: AudioError) -> Self {
        CommandError::Backend(error.to_string())
    }
}

/// Resultado de pasar por el serializador
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("⏳ Demasiadas solicitudes, intenta de nuevo en un momento")]
    TooManyRequests,

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Default)]
struct GuildActionState {
    lock: Mutex<()>,
    pending: AtomicUsize,
}

/// Descuenta la acción al salir, incluso si el futuro se cancela
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| Some(p.saturating_sub(1)));
    }
}

pub struct GuildActionSerializer {
    guilds: DashMap<GuildId, Arc<GuildActionState>>,
    max_pending: usize,
}

impl Default for GuildActionSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl GuildActionSerializer {
    pub fn new() -> Self {
        Self {
            guilds: DashMap::new(),
            max_pending: MAX_PENDING,
        }
    }

    /// Ejecuta `action` en exclusión mutua con las demás acciones del guild
    pub async fn run<T, F, Fut>(&self, guild_id: GuildId, action: F) -> Result<T, ActionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CommandError>>,
    {
        let state = self.guilds.entry(guild_id).or_default().value().clone();

        let admitted = state
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                (p < self.max_pending).then_some(p + 1)
            });
        if admitted.is_err() {
            debug!("🚦 Acción rechazada en guild {}: demasiadas pendientes", guild_id);
            return Err(ActionError::TooManyRequests);
        }

        let _pending = PendingGuard(&state.pending);
        let _lock = state.lock.lock().await;

        Ok(action().await?)
    }

    /// Acciones en curso o esperando para el guild
    pub fn pending(&self, guild_id: GuildId) -> usize {
        self.guilds
            .get(&guild_id)
            .map_or(0, |state| state.pending.load(Ordering::SeqCst))
    }
}
