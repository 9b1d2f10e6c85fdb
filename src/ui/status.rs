//! The live status message each guild keeps in its music channel.
//!
//! The guild → (channel, message) mapping is loaded from storage before the client
//! starts. Edits that fail transiently are retried; a message that no longer exists is
//! sent again, and a mapping that cannot be repaired is forgotten until `/setup` runs.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serenity::{
    builder::{CreateActionRow, CreateEmbed, CreateMessage, EditMessage},
    http::{Http, HttpError},
    model::id::{ChannelId, GuildId, MessageId},
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc::UnboundedReceiver, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{buttons, embeds};
use crate::audio::{AudioService, PlaybackEvent};
use crate::storage::{JsonStorage, StatusChannel};

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
];

/// Qué hacer con un error al editar el mensaje de estado
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EditFailure {
    /// El mensaje o el canal ya no existen
    #[error("el mensaje o el canal ya no existen")]
    NotFound,
    /// Error de red, 5xx o rate limit: vale la pena reintentar
    #[error("error temporal de Discord")]
    Transient,
    /// Permisos u otro 4xx: reintentar no sirve
    #[error("Discord rechazó la petición")]
    Fatal,
}

impl EditFailure {
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            429 | 500..=599 => Self::Transient,
            _ => Self::Fatal,
        }
    }

    pub fn classify(error: &serenity::Error) -> Self {
        match error {
            serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => {
                Self::from_status(response.status_code.as_u16())
            }
            serenity::Error::Http(HttpError::Request(_)) | serenity::Error::Io(_) => Self::Transient,
            _ => Self::Fatal,
        }
    }
}

/// Contenido del mensaje de estado
#[derive(Clone)]
pub struct StatusView {
    pub embed: CreateEmbed,
    pub components: Vec<CreateActionRow>,
}

impl StatusView {
    fn idle() -> Self {
        Self {
            embed: embeds::create_idle_embed(),
            components: Vec::new(),
        }
    }
}

/// Operaciones sobre los mensajes del canal de música
#[async_trait]
pub trait StatusMessages: Send + Sync {
    async fn send(&self, channel_id: ChannelId, view: &StatusView) -> Result<MessageId, EditFailure>;

    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        view: &StatusView,
    ) -> Result<(), EditFailure>;

    async fn delete(&self, channel_id: ChannelId, message_id: MessageId);
}

#[async_trait]
impl StatusMessages for Http {
    async fn send(&self, channel_id: ChannelId, view: &StatusView) -> Result<MessageId, EditFailure> {
        let message = CreateMessage::new()
            .embed(view.embed.clone())
            .components(view.components.clone());

        match channel_id.send_message(self, message).await {
            Ok(message) => Ok(message.id),
            Err(e) => {
                debug!("Error enviando mensaje en {}: {}", channel_id, e);
                Err(EditFailure::classify(&e))
            }
        }
    }

    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        view: &StatusView,
    ) -> Result<(), EditFailure> {
        let edit = EditMessage::new()
            .embed(view.embed.clone())
            .components(view.components.clone());

        match channel_id.edit_message(self, message_id, edit).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("Error editando mensaje {} en {}: {}", message_id, channel_id, e);
                Err(EditFailure::classify(&e))
            }
        }
    }

    async fn delete(&self, channel_id: ChannelId, message_id: MessageId) {
        if let Err(e) = channel_id.delete_message(self, message_id).await {
            debug!("No se pudo borrar el mensaje {}: {}", message_id, e);
        }
    }
}

pub struct StatusBoard {
    messages: Arc<dyn StatusMessages>,
    service: Arc<AudioService>,
    storage: Arc<Mutex<JsonStorage>>,
    channels: DashMap<GuildId, StatusChannel>,
    retry_delays: [Duration; 3],
}

impl StatusBoard {
    /// Carga los canales guardados. Debe terminar antes de aceptar comandos.
    pub async fn load(
        messages: Arc<dyn StatusMessages>,
        service: Arc<AudioService>,
        storage: Arc<Mutex<JsonStorage>>,
    ) -> Arc<Self> {
        let channels = DashMap::new();
        for mapping in storage.lock().await.get_all() {
            channels.insert(GuildId::new(mapping.guild_id), mapping);
        }
        info!("📋 {} canales de música cargados", channels.len());

        Arc::new(Self {
            messages,
            service,
            storage,
            channels,
            retry_delays: RETRY_DELAYS,
        })
    }

    pub fn channel_for(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.channels
            .get(&guild_id)
            .map(|mapping| ChannelId::new(mapping.channel_id))
    }

    /// Publica un mensaje de estado nuevo en `channel_id` y lo deja como canal de música
    pub async fn setup(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<()> {
        let view = self.view(guild_id).await;
        let message_id = self.messages.send(channel_id, &view).await?;

        self.storage
            .lock()
            .await
            .upsert(guild_id.get(), channel_id.get(), message_id.get())
            .await?;

        let mapping = StatusChannel {
            guild_id: guild_id.get(),
            channel_id: channel_id.get(),
            message_id: message_id.get(),
        };

        if let Some(previous) = self.channels.insert(guild_id, mapping) {
            self.messages
                .delete(
                    ChannelId::new(previous.channel_id),
                    MessageId::new(previous.message_id),
                )
                .await;
        }

        info!("✅ Canal de música de guild {} configurado en {}", guild_id, channel_id);
        Ok(())
    }

    /// Vuelve a dibujar el estado actual del guild
    pub async fn refresh(&self, guild_id: GuildId) {
        let view = self.view(guild_id).await;
        self.publish(guild_id, view).await;
    }

    pub async fn show_idle(&self, guild_id: GuildId) {
        self.publish(guild_id, StatusView::idle()).await;
    }

    /// Consume los eventos de reproducción hasta que el servicio se cierre
    pub fn spawn_event_loop(self: Arc<Self>, mut events: UnboundedReceiver<PlaybackEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let guild_id = event.guild_id();
                match event {
                    PlaybackEvent::TrackStarted(_) => self.refresh(guild_id).await,
                    PlaybackEvent::QueueEmpty(_) => self.show_idle(guild_id).await,
                }
            }
            debug!("Canal de eventos de reproducción cerrado");
        })
    }

    // Métodos privados

    async fn view(&self, guild_id: GuildId) -> StatusView {
        let Some(status) = self.service.get_status(guild_id).await else {
            return StatusView::idle();
        };

        match &status.now_playing {
            Some(track) => StatusView {
                embed: embeds::create_now_playing_embed(track, &status),
                components: buttons::create_player_controls(status.is_paused, status.loop_enabled),
            },
            None => StatusView::idle(),
        }
    }

    async fn publish(&self, guild_id: GuildId, view: StatusView) {
        let Some(mapping) = self.channels.get(&guild_id).map(|m| m.value().clone()) else {
            return;
        };
        let channel_id = ChannelId::new(mapping.channel_id);
        let message_id = MessageId::new(mapping.message_id);

        let attempts = self.retry_delays.len();
        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            let failure = match self.messages.edit(channel_id, message_id, &view).await {
                Ok(()) => return,
                Err(failure) => failure,
            };

            match failure {
                EditFailure::NotFound => {
                    self.resend(guild_id, channel_id, &view).await;
                    return;
                }
                EditFailure::Fatal => {
                    error!("❌ No se pudo editar el mensaje de estado de guild {}: {}", guild_id, failure);
                    return;
                }
                EditFailure::Transient => {
                    warn!(
                        "⚠️ Reintento {}/{} del mensaje de estado en guild {}",
                        attempt + 1,
                        attempts,
                        guild_id
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
        }

        warn!("⚠️ Mensaje de estado inaccesible en guild {}, usa /setup de nuevo", guild_id);
        self.forget(guild_id).await;
    }

    async fn resend(&self, guild_id: GuildId, channel_id: ChannelId, view: &StatusView) {
        let message_id = match self.messages.send(channel_id, view).await {
            Ok(message_id) => message_id,
            Err(e) => {
                warn!("⚠️ No se pudo recrear el mensaje de estado en guild {}: {}", guild_id, e);
                self.forget(guild_id).await;
                return;
            }
        };

        let stored = self
            .storage
            .lock()
            .await
            .update_message_id(guild_id.get(), message_id.get())
            .await;

        match stored {
            Ok(true) => {
                if let Some(mut mapping) = self.channels.get_mut(&guild_id) {
                    mapping.message_id = message_id.get();
                }
                info!("🔄 Mensaje de estado recreado en guild {}", guild_id);
            }
            Ok(false) => self.forget(guild_id).await,
            Err(e) => {
                warn!("⚠️ No se pudo guardar el nuevo mensaje de guild {}: {}", guild_id, e);
                self.forget(guild_id).await;
            }
        }
    }

    async fn forget(&self, guild_id: GuildId) {
        self.channels.remove(&guild_id);
        if let Err(e) = self.storage.lock().await.delete(guild_id.get()).await {
            error!("❌ No se pudo borrar el canal de guild {}: {}", guild_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::service::test_support::FakeBackend;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    const GUILD: GuildId = GuildId::new(1);

    /// Discord de mentira: cada llamada consume la siguiente respuesta preparada
    #[derive(Default)]
    struct ScriptedMessages {
        edits: SyncMutex<VecDeque<Result<(), EditFailure>>>,
        sends: SyncMutex<VecDeque<Result<MessageId, EditFailure>>>,
        edit_calls: SyncMutex<Vec<MessageId>>,
        send_calls: SyncMutex<Vec<ChannelId>>,
    }

    impl ScriptedMessages {
        fn with_edits(edits: Vec<Result<(), EditFailure>>) -> Self {
            Self {
                edits: SyncMutex::new(edits.into()),
                ..Default::default()
            }
        }

        fn then_send(self, result: Result<MessageId, EditFailure>) -> Self {
            self.sends.lock().push_back(result);
            self
        }
    }

    #[async_trait]
    impl StatusMessages for ScriptedMessages {
        async fn send(&self, channel_id: ChannelId, _view: &StatusView) -> Result<MessageId, EditFailure> {
            self.send_calls.lock().push(channel_id);
            self.sends
                .lock()
                .pop_front()
                .unwrap_or(Ok(MessageId::new(999)))
        }

        async fn edit(
            &self,
            _channel_id: ChannelId,
            message_id: MessageId,
            _view: &StatusView,
        ) -> Result<(), EditFailure> {
            self.edit_calls.lock().push(message_id);
            self.edits.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn delete(&self, _channel_id: ChannelId, _message_id: MessageId) {}
    }

    /// Tablero con el guild 1 ya configurado en el canal 10, mensaje 100
    async fn board(messages: Arc<ScriptedMessages>) -> (Arc<StatusBoard>, Arc<Mutex<JsonStorage>>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        storage.upsert(GUILD.get(), 10, 100).await.unwrap();
        let storage = Arc::new(Mutex::new(storage));

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let service = AudioService::new(Arc::new(FakeBackend::default()), Arc::new(tx), 100);

        let board = Arc::new(StatusBoard {
            messages,
            service,
            storage: storage.clone(),
            channels: DashMap::from_iter([(
                GUILD,
                StatusChannel {
                    guild_id: GUILD.get(),
                    channel_id: 10,
                    message_id: 100,
                },
            )]),
            retry_delays: [Duration::ZERO; 3],
        });
        (board, storage, dir)
    }

    #[test]
    fn test_status_codes_are_classified() {
        assert_eq!(EditFailure::from_status(404), EditFailure::NotFound);
        assert_eq!(EditFailure::from_status(429), EditFailure::Transient);
        assert_eq!(EditFailure::from_status(502), EditFailure::Transient);
        assert_eq!(EditFailure::from_status(403), EditFailure::Fatal);
        assert_eq!(EditFailure::from_status(400), EditFailure::Fatal);
    }

    #[test]
    fn test_io_errors_are_transient() {
        let io = serenity::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(EditFailure::classify(&io), EditFailure::Transient);
        assert_eq!(
            EditFailure::classify(&serenity::Error::Other("x")),
            EditFailure::Fatal
        );
    }

    #[tokio::test]
    async fn test_load_reads_saved_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        storage.upsert(1, 10, 100).await.unwrap();
        storage.upsert(2, 20, 200).await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let service = AudioService::new(Arc::new(FakeBackend::default()), Arc::new(tx), 100);
        let board = StatusBoard::load(
            Arc::new(ScriptedMessages::default()),
            service,
            Arc::new(Mutex::new(storage)),
        )
        .await;

        assert_eq!(board.channel_for(GuildId::new(1)), Some(ChannelId::new(10)));
        assert_eq!(board.channel_for(GuildId::new(2)), Some(ChannelId::new(20)));
        assert_eq!(board.channel_for(GuildId::new(3)), None);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries_and_drop_the_mapping() {
        let messages = Arc::new(ScriptedMessages::with_edits(vec![
            Err(EditFailure::Transient),
            Err(EditFailure::Transient),
            Err(EditFailure::Transient),
        ]));
        let (board, storage, _dir) = board(messages.clone()).await;

        board.refresh(GUILD).await;

        assert_eq!(messages.edit_calls.lock().len(), 3);
        assert!(messages.send_calls.lock().is_empty());
        assert_eq!(board.channel_for(GUILD), None);
        assert_eq!(storage.lock().await.get(GUILD.get()), None);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_keeps_the_mapping() {
        let messages = Arc::new(ScriptedMessages::with_edits(vec![
            Err(EditFailure::Transient),
            Ok(()),
        ]));
        let (board, storage, _dir) = board(messages.clone()).await;

        board.show_idle(GUILD).await;

        assert_eq!(messages.edit_calls.lock().len(), 2);
        assert_eq!(board.channel_for(GUILD), Some(ChannelId::new(10)));
        assert!(storage.lock().await.get(GUILD.get()).is_some());
    }

    #[tokio::test]
    async fn test_missing_message_is_sent_again_and_saved() {
        let messages = Arc::new(
            ScriptedMessages::with_edits(vec![Err(EditFailure::NotFound)])
                .then_send(Ok(MessageId::new(555))),
        );
        let (board, storage, _dir) = board(messages.clone()).await;

        board.refresh(GUILD).await;

        assert_eq!(messages.edit_calls.lock().clone(), vec![MessageId::new(100)]);
        assert_eq!(messages.send_calls.lock().clone(), vec![ChannelId::new(10)]);
        assert_eq!(
            storage.lock().await.get(GUILD.get()).map(|m| m.message_id),
            Some(555)
        );

        // La siguiente edición ya apunta al mensaje nuevo
        board.refresh(GUILD).await;
        assert_eq!(
            messages.edit_calls.lock().clone(),
            vec![MessageId::new(100), MessageId::new(555)]
        );
    }

    #[tokio::test]
    async fn test_failed_resend_drops_the_mapping() {
        let messages = Arc::new(
            ScriptedMessages::with_edits(vec![Err(EditFailure::NotFound)])
                .then_send(Err(EditFailure::Fatal)),
        );
        let (board, storage, _dir) = board(messages.clone()).await;

        board.refresh(GUILD).await;

        assert_eq!(board.channel_for(GUILD), None);
        assert_eq!(storage.lock().await.get(GUILD.get()), None);
    }

    #[tokio::test]
    async fn test_fatal_failure_keeps_the_mapping_without_retrying() {
        let messages = Arc::new(ScriptedMessages::with_edits(vec![Err(EditFailure::Fatal)]));
        let (board, storage, _dir) = board(messages.clone()).await;

        board.refresh(GUILD).await;

        assert_eq!(messages.edit_calls.lock().len(), 1);
        assert_eq!(board.channel_for(GUILD), Some(ChannelId::new(10)));
        assert!(storage.lock().await.get(GUILD.get()).is_some());
    }

    #[tokio::test]
    async fn test_setup_replaces_the_mapping() {
        let messages = Arc::new(ScriptedMessages::default().then_send(Ok(MessageId::new(700))));
        let (board, storage, _dir) = board(messages.clone()).await;

        board.setup(GUILD, ChannelId::new(20)).await.unwrap();

        assert_eq!(board.channel_for(GUILD), Some(ChannelId::new(20)));
        assert_eq!(
            storage.lock().await.get(GUILD.get()),
            Some(StatusChannel {
                guild_id: GUILD.get(),
                channel_id: 20,
                message_id: 700,
            })
        );
    }
}
