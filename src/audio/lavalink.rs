use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::Songbird;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{AudioBackend, AudioError, TrackEndCallback, MAX_VOLUME_PERCENT};
use super::lavalink_client::{LavalinkClient, NodePlayer, PlayerUpdate, TrackUpdate, VoiceUpdate};
use crate::sources::Track;

/// Consultas fallidas seguidas antes de dar el track por perdido
const MAX_POLL_FAILURES: u32 = 5;

type CallbackSlot = Arc<Mutex<Option<TrackEndCallback>>>;

/// Vigilante del track actual: consulta el nodo hasta ver que terminó
struct Monitor {
    task: JoinHandle<()>,
    on_end: CallbackSlot,
}

impl Monitor {
    /// Cancela la consulta y completa el callback si nadie lo hizo
    fn release(self) {
        self.task.abort();
        let callback = self.on_end.lock().take();
        if let Some(callback) = callback {
            callback(None);
        }
    }
}

/// Un vigilante por guild
#[derive(Default)]
struct Monitors {
    active: DashMap<GuildId, Monitor>,
}

impl Monitors {
    /// Lanza el vigilante del guild. Uno anterior se cancela y su callback se dispara.
    fn watch<P, Fut>(&self, guild_id: GuildId, interval: Duration, on_end: TrackEndCallback, poll: P)
    where
        P: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<NodePlayer>, AudioError>> + Send + 'static,
    {
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(on_end)));
        let task_slot = slot.clone();

        let task = tokio::spawn(async move {
            let error = wait_for_end(guild_id, interval, poll).await;

            let callback = task_slot.lock().take();
            if let Some(callback) = callback {
                callback(error);
            }
        });

        if let Some(previous) = self.active.insert(guild_id, Monitor { task, on_end: slot }) {
            previous.release();
        }
    }

    fn release(&self, guild_id: GuildId) {
        if let Some((_, monitor)) = self.active.remove(&guild_id) {
            monitor.release();
        }
    }
}

/// Consulta el reproductor hasta que el track termina, desaparece o el nodo deja de responder
async fn wait_for_end<P, Fut>(guild_id: GuildId, interval: Duration, poll: P) -> Option<AudioError>
where
    P: Fn() -> Fut,
    Fut: Future<Output = Result<Option<NodePlayer>, AudioError>>,
{
    let mut failures = 0;

    loop {
        tokio::time::sleep(interval).await;

        match poll().await {
            Ok(Some(player)) if player.is_finished() => return None,
            Ok(Some(_)) => failures = 0,
            Ok(None) => return Some(AudioError::PlayerGone),
            Err(e) => {
                failures += 1;
                if failures >= MAX_POLL_FAILURES {
                    warn!(
                        "⚠️ Nodo sin respuesta para guild {} tras {} consultas: {}",
                        guild_id, failures, e
                    );
                    return Some(e);
                }
                debug!("Error consultando el nodo para guild {}: {}", guild_id, e);
            }
        }
    }
}

/// Canal de voz entregado al nodo y la sesión del nodo que lo recibió
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeVoice {
    channel: ChannelId,
    session: String,
}

/// Backend remoto: Songbird solo negocia la voz con Discord y el nodo Lavalink reproduce
pub struct LavalinkBackend {
    node: Arc<LavalinkClient>,
    songbird: Arc<Songbird>,
    poll_interval: Duration,
    players: DashMap<GuildId, NodeVoice>,
    volumes: DashMap<GuildId, u16>,
    monitors: Monitors,
}

impl LavalinkBackend {
    pub fn new(node: Arc<LavalinkClient>, songbird: Arc<Songbird>, poll_interval: Duration) -> Self {
        Self {
            node,
            songbird,
            poll_interval,
            players: DashMap::new(),
            volumes: DashMap::new(),
            monitors: Monitors::default(),
        }
    }

    async fn encoded_for(&self, track: &Track) -> Result<String, AudioError> {
        if let Some(encoded) = &track.node_track {
            return Ok(encoded.clone());
        }

        self.node
            .load_tracks(&track.url)
            .await?
            .first_track()
            .map(|found| found.encoded)
            .ok_or(AudioError::NoPlayableTrack)
    }
}

#[async_trait]
impl AudioBackend for LavalinkBackend {
    fn name(&self) -> &'static str {
        "lavalink"
    }

    async fn connect(&self, bot_user: UserId) -> Result<(), AudioError> {
        self.node.connect(bot_user).await
    }

    async fn ensure_player(&self, guild_id: GuildId, channel: ChannelId) -> Result<(), AudioError> {
        let session = self.node.session_id()?;
        let current = self.players.get(&guild_id).map(|voice| voice.value().clone());

        match current {
            Some(voice) if voice.channel == channel && voice.session == session => return Ok(()),
            // El nodo perdió la sesión anterior: hay que repetir el handshake de voz completo
            Some(voice) if voice.session != session => {
                if let Err(e) = self.songbird.leave(guild_id).await {
                    debug!("No se pudo salir del canal en guild {}: {}", guild_id, e);
                }
            }
            _ => {}
        }

        let (info, _call) = self
            .songbird
            .join_gateway(guild_id, channel)
            .await
            .map_err(|e| AudioError::Join(e.to_string()))?;

        let update = PlayerUpdate {
            voice: Some(VoiceUpdate {
                token: info.token,
                endpoint: info.endpoint,
                session_id: info.session_id,
            }),
            ..Default::default()
        };
        self.node.update_player(guild_id, &update).await?;

        self.players.insert(guild_id, NodeVoice { channel, session });
        info!("🔊 Nodo conectado al canal {} en guild {}", channel, guild_id);
        Ok(())
    }

    async fn play(
        &self,
        guild_id: GuildId,
        track: &Track,
        on_end: TrackEndCallback,
    ) -> Result<(), AudioError> {
        let channel = self
            .players
            .get(&guild_id)
            .map(|voice| voice.channel)
            .ok_or(AudioError::NotConnected)?;
        // Tras una reconexión sin reanudar, el reproductor nuevo aún no tiene voz
        self.ensure_player(guild_id, channel).await?;

        let encoded = self.encoded_for(track).await?;
        let volume = self.volumes.get(&guild_id).map_or(100, |v| *v);

        let update = PlayerUpdate {
            track: Some(TrackUpdate {
                encoded: Some(encoded),
            }),
            volume: Some(volume),
            paused: Some(false),
            ..Default::default()
        };
        self.node.update_player(guild_id, &update).await?;

        let node = self.node.clone();
        self.monitors
            .watch(guild_id, self.poll_interval, on_end, move || {
                let node = node.clone();
                async move { node.get_player(guild_id).await }
            });
        debug!("🎵 Track entregado al nodo en guild {}: {}", guild_id, track.title);
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> Result<(), AudioError> {
        if !self.players.contains_key(&guild_id) {
            return Ok(());
        }

        // Sin pausa, para que el vigilante vea el final
        let update = PlayerUpdate {
            track: Some(TrackUpdate { encoded: None }),
            paused: Some(false),
            ..Default::default()
        };
        self.node.update_player(guild_id, &update).await
    }

    async fn pause(&self, guild_id: GuildId) -> Result<(), AudioError> {
        if !self.players.contains_key(&guild_id) {
            return Ok(());
        }

        let update = PlayerUpdate {
            paused: Some(true),
            ..Default::default()
        };
        self.node.update_player(guild_id, &update).await?;
        info!("⏸️ Reproducción pausada en guild {}", guild_id);
        Ok(())
    }

    async fn resume(&self, guild_id: GuildId) -> Result<(), AudioError> {
        if !self.players.contains_key(&guild_id) {
            return Ok(());
        }

        let update = PlayerUpdate {
            paused: Some(false),
            ..Default::default()
        };
        self.node.update_player(guild_id, &update).await?;
        info!("▶️ Reproducción reanudada en guild {}", guild_id);
        Ok(())
    }

    async fn set_volume(&self, guild_id: GuildId, percent: u16) -> Result<(), AudioError> {
        let percent = percent.min(MAX_VOLUME_PERCENT);
        self.volumes.insert(guild_id, percent);

        if !self.players.contains_key(&guild_id) {
            return Ok(());
        }

        let update = PlayerUpdate {
            volume: Some(percent),
            ..Default::default()
        };
        self.node.update_player(guild_id, &update).await?;
        info!("🔊 Volumen ajustado a {}% en guild {}", percent, guild_id);
        Ok(())
    }

    async fn is_playing(&self, guild_id: GuildId) -> bool {
        if !self.players.contains_key(&guild_id) {
            return false;
        }

        match self.node.get_player(guild_id).await {
            Ok(Some(player)) => player.track.is_some() && !player.paused,
            _ => false,
        }
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), AudioError> {
        self.monitors.release(guild_id);
        self.volumes.remove(&guild_id);

        if self.players.remove(&guild_id).is_some() {
            if let Err(e) = self.node.destroy_player(guild_id).await {
                warn!("⚠️ No se pudo destruir el reproductor de guild {}: {}", guild_id, e);
            }
        }

        if self.songbird.get(guild_id).is_some() {
            if let Err(e) = self.songbird.remove(guild_id).await {
                warn!("⚠️ Error al salir del canal en guild {}: {}", guild_id, e);
            }
        }
        Ok(())
    }
}
