use serenity::model::id::{ChannelId, GuildId};
use std::collections::VecDeque;

use crate::sources::Track;

/// Sesión de reproducción de un servidor
///
/// `now_playing` es `Some` solo mientras el backend tiene una reproducción activa.
/// Se modifica únicamente con el lock del servidor tomado.
#[derive(Debug, Clone)]
pub struct GuildAudioState {
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub now_playing: Option<Track>,
    pub queue: VecDeque<Track>,
    /// Factor de amplitud, 1.0 = 100%
    pub volume: f32,
    pub loop_enabled: bool,
    pub is_paused: bool,
    /// Identifica la reproducción en curso; los finales con otro id son obsoletos
    pub(crate) playback_id: u64,
}

impl GuildAudioState {
    pub fn new(guild_id: GuildId, voice_channel_id: ChannelId, volume: f32) -> Self {
        Self {
            guild_id,
            voice_channel_id,
            now_playing: None,
            queue: VecDeque::new(),
            volume,
            loop_enabled: false,
            is_paused: false,
            playback_id: 0,
        }
    }

    pub fn status(&self) -> AudioStatus {
        AudioStatus {
            now_playing: self.now_playing.clone(),
            queue: self.queue.iter().cloned().collect(),
            loop_enabled: self.loop_enabled,
            is_paused: self.is_paused,
            volume: self.volume,
            voice_channel_id: self.voice_channel_id,
        }
    }

    pub fn volume_percent(&self) -> u16 {
        (self.volume * 100.0).round().clamp(0.0, 200.0) as u16
    }
}

/// Copia de solo lectura para la capa de presentación
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStatus {
    pub now_playing: Option<Track>,
    pub queue: Vec<Track>,
    pub loop_enabled: bool,
    pub is_paused: bool,
    pub volume: f32,
    pub voice_channel_id: ChannelId,
}

impl AudioStatus {
    pub fn is_playing(&self) -> bool {
        self.now_playing.is_some()
    }
}
