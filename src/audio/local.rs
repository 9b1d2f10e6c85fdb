use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::{
    input::{HttpRequest, Input, YoutubeDl},
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{volume_factor, AudioBackend, AudioError, TrackEndCallback};
use crate::sources::{youtube::is_youtube_url, Track};

/// Backend local: Songbird transcodifica el audio y lo envía por la conexión de voz
pub struct LocalBackend {
    songbird: Arc<Songbird>,
    http: reqwest::Client,
    cookies: Option<PathBuf>,
    current_tracks: DashMap<GuildId, TrackHandle>,
    volumes: DashMap<GuildId, f32>,
}

impl LocalBackend {
    pub fn new(songbird: Arc<Songbird>, http: reqwest::Client, cookies: Option<PathBuf>) -> Self {
        Self {
            songbird,
            http,
            cookies,
            current_tracks: DashMap::new(),
            volumes: DashMap::new(),
        }
    }

    /// Páginas de YouTube pasan por yt-dlp; el resto se pide por HTTP directo
    fn input_for(&self, track: &Track) -> Input {
        if is_youtube_url(&track.source) {
            let mut args = vec![
                "-f".to_string(),
                "bestaudio[ext=webm]/bestaudio/best".to_string(),
            ];
            if let Some(cookies) = &self.cookies {
                args.push("--cookies".to_string());
                args.push(cookies.display().to_string());
            }

            YoutubeDl::new(self.http.clone(), track.source.clone())
                .user_args(args)
                .into()
        } else {
            HttpRequest::new(self.http.clone(), track.source.clone()).into()
        }
    }
}

#[async_trait]
impl AudioBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn connect(&self, _bot_user: UserId) -> Result<(), AudioError> {
        Ok(())
    }

    async fn ensure_player(&self, guild_id: GuildId, channel: ChannelId) -> Result<(), AudioError> {
        if let Some(call) = self.songbird.get(guild_id) {
            if call.lock().await.current_channel() == Some(channel.into()) {
                return Ok(());
            }
        }

        self.songbird
            .join(guild_id, channel)
            .await
            .map_err(|e| AudioError::Join(e.to_string()))?;

        info!("🔊 Conectado al canal {} en guild {}", channel, guild_id);
        Ok(())
    }

    async fn play(
        &self,
        guild_id: GuildId,
        track: &Track,
        on_end: TrackEndCallback,
    ) -> Result<(), AudioError> {
        let call = self.songbird.get(guild_id).ok_or(AudioError::NotConnected)?;
        let input = self.input_for(track);

        let handle = {
            let mut call = call.lock().await;
            if call.current_channel().is_none() {
                return Err(AudioError::NotConnected);
            }
            call.play_only_input(input)
        };

        let volume = self.volumes.get(&guild_id).map_or(1.0, |v| *v);
        let _ = handle.set_volume(volume);

        // End y Error comparten el callback; el primero que llegue lo consume
        let slot = Arc::new(Mutex::new(Some(on_end)));
        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackEndNotifier {
                        guild_id,
                        slot: slot.clone(),
                    },
                )
                .map_err(|e| AudioError::Stream(e.to_string()))?;
        }

        self.current_tracks.insert(guild_id, handle);
        debug!("🎵 Track entregado a Songbird en guild {}: {}", guild_id, track.title);
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> Result<(), AudioError> {
        if let Some((_, handle)) = self.current_tracks.remove(&guild_id) {
            let _ = handle.stop();
        }
        Ok(())
    }

    async fn pause(&self, guild_id: GuildId) -> Result<(), AudioError> {
        if let Some(handle) = self.current_tracks.get(&guild_id) {
            let _ = handle.pause();
            info!("⏸️ Reproducción pausada en guild {}", guild_id);
        }
        Ok(())
    }

    async fn resume(&self, guild_id: GuildId) -> Result<(), AudioError> {
        if let Some(handle) = self.current_tracks.get(&guild_id) {
            let _ = handle.play();
            info!("▶️ Reproducción reanudada en guild {}", guild_id);
        }
        Ok(())
    }

    async fn set_volume(&self, guild_id: GuildId, percent: u16) -> Result<(), AudioError> {
        let volume = volume_factor(percent);
        self.volumes.insert(guild_id, volume);

        if let Some(handle) = self.current_tracks.get(&guild_id) {
            let _ = handle.set_volume(volume);
            info!("🔊 Volumen ajustado a {}% en guild {}", (volume * 100.0) as u16, guild_id);
        }
        Ok(())
    }

    async fn is_playing(&self, guild_id: GuildId) -> bool {
        let Some(handle) = self.current_tracks.get(&guild_id).map(|h| h.value().clone()) else {
            return false;
        };

        match handle.get_info().await {
            Ok(info) => matches!(info.playing, PlayMode::Play),
            Err(_) => false,
        }
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), AudioError> {
        if let Some((_, handle)) = self.current_tracks.remove(&guild_id) {
            let _ = handle.stop();
        }
        self.volumes.remove(&guild_id);

        if self.songbird.get(guild_id).is_some() {
            if let Err(e) = self.songbird.remove(guild_id).await {
                warn!("⚠️ Error al salir del canal en guild {}: {}", guild_id, e);
            }
        }
        Ok(())
    }
}

/// Avisa al servicio cuando el track termina o falla
struct TrackEndNotifier {
    guild_id: GuildId,
    slot: Arc<Mutex<Option<TrackEndCallback>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let error = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(AudioError::Stream(format!("{:?}", e))),
                _ => None,
            }),
            _ => None,
        };

        let callback = self.slot.lock().take();
        if let Some(callback) = callback {
            debug!("Track terminado en guild {}", self.guild_id);
            callback(error);
        }

        Some(Event::Cancel)
    }
}
