use serenity::model::id::GuildId;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Avisos del servicio de audio hacia la presentación.
///
/// Se llaman desde el bucle de reproducción, así que no deben bloquear.
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackHooks: Send + Sync {
    fn on_track_start(&self, guild_id: GuildId);
    fn on_queue_empty(&self, guild_id: GuildId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    TrackStarted(GuildId),
    QueueEmpty(GuildId),
}

impl PlaybackEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            PlaybackEvent::TrackStarted(id) | PlaybackEvent::QueueEmpty(id) => *id,
        }
    }
}

/// Los eventos se encolan y los consume la tarea que actualiza el mensaje de estado
impl PlaybackHooks for UnboundedSender<PlaybackEvent> {
    fn on_track_start(&self, guild_id: GuildId) {
        if self.send(PlaybackEvent::TrackStarted(guild_id)).is_err() {
            debug!("Receptor de eventos cerrado, guild {}", guild_id);
        }
    }

    fn on_queue_empty(&self, guild_id: GuildId) {
        if self.send(PlaybackEvent::QueueEmpty(guild_id)).is_err() {
            debug!("Receptor de eventos cerrado, guild {}", guild_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sender_forwards_events_in_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let guild = GuildId::new(5);

        tx.on_track_start(guild);
        tx.on_queue_empty(guild);

        assert_eq!(rx.recv().await, Some(PlaybackEvent::TrackStarted(guild)));
        assert_eq!(rx.recv().await, Some(PlaybackEvent::QueueEmpty(guild)));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<PlaybackEvent>();
        drop(rx);
        tx.on_track_start(GuildId::new(1));
    }
}
