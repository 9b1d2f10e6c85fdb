//! Per-guild playback orchestration.
//!
//! Every guild gets an async lock around an optional [`GuildAudioState`]. The lock
//! is held only while state fields change; backend calls happen outside it so a slow
//! voice server never blocks other operations on the same guild.

use dashmap::DashMap;
use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::{volume_factor, AudioBackend, AudioError, TrackEndCallback, MAX_VOLUME_PERCENT};
use super::hooks::PlaybackHooks;
use super::state::{AudioStatus, GuildAudioState};
use crate::sources::Track;

type GuildSlot = Arc<Mutex<Option<GuildAudioState>>>;

/// Resultado de avanzar la cola con el lock tomado
enum Advance {
    Play {
        track: Track,
        playback_id: u64,
        decided_at: Instant,
    },
    Empty,
}

pub struct AudioService {
    backend: Arc<dyn AudioBackend>,
    hooks: Arc<dyn PlaybackHooks>,
    guilds: DashMap<GuildId, GuildSlot>,
    playback_seq: AtomicU64,
    default_volume: f32,
    this: Weak<AudioService>,
}

impl AudioService {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        hooks: Arc<dyn PlaybackHooks>,
        default_volume_percent: u16,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            backend,
            hooks,
            guilds: DashMap::new(),
            playback_seq: AtomicU64::new(0),
            default_volume: volume_factor(default_volume_percent),
            this: this.clone(),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Une el backend al canal y crea la sesión si no existe o si el canal cambió
    pub async fn ensure_state(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<AudioStatus, AudioError> {
        self.backend.ensure_player(guild_id, channel_id).await?;

        let slot = self.slot(guild_id);
        let (status, fresh_volume) = {
            let mut guard = slot.lock().await;
            let (state, fresh) = self.session(&mut guard, guild_id, channel_id);
            (state.status(), fresh.then(|| state.volume_percent()))
        };

        if let Some(percent) = fresh_volume {
            self.apply_volume(guild_id, percent).await;
        }

        Ok(status)
    }

    /// Añade a una sesión existente sin arrancar la reproducción.
    ///
    /// Devuelve la longitud de la cola. Falla si no hay sesión.
    pub async fn enqueue(&self, guild_id: GuildId, tracks: Vec<Track>) -> Result<usize, AudioError> {
        let slot = self.existing_slot(guild_id).ok_or(AudioError::NotConnected)?;
        let mut guard = slot.lock().await;
        let state = guard.as_mut().ok_or(AudioError::NotConnected)?;

        state.queue.extend(tracks);
        Ok(state.queue.len())
    }

    /// Encola y, si no había nada sonando, arranca la reproducción.
    ///
    /// Devuelve `true` si esta llamada inició la reproducción.
    pub async fn enqueue_and_play(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        tracks: Vec<Track>,
    ) -> Result<bool, AudioError> {
        self.backend.ensure_player(guild_id, channel_id).await?;

        let slot = self.slot(guild_id);
        let (step, fresh_volume) = {
            let mut guard = slot.lock().await;
            let (state, fresh) = self.session(&mut guard, guild_id, channel_id);

            debug!("➕ {} tracks encolados en guild {}", tracks.len(), guild_id);
            state.queue.extend(tracks);

            let step = state
                .now_playing
                .is_none()
                .then(|| self.advance(state, None));
            (step, fresh.then(|| state.volume_percent()))
        };

        if let Some(percent) = fresh_volume {
            self.apply_volume(guild_id, percent).await;
        }

        match step {
            Some(step) => {
                self.drive(guild_id, step).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Avanza la cola: re-encola `previous` si hay bucle y reproduce el siguiente
    pub fn play_next(self: Arc<Self>, guild_id: GuildId, previous: Option<Track>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let step = {
                let slot = self.slot(guild_id);
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    Some(state) => self.advance(state, previous),
                    None => return,
                }
            };

            self.drive(guild_id, step).await;
        })
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<bool, AudioError> {
        if !self.set_paused(guild_id, true).await {
            return Ok(false);
        }
        self.backend.pause(guild_id).await?;
        Ok(true)
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<bool, AudioError> {
        if !self.set_paused(guild_id, false).await {
            return Ok(false);
        }
        self.backend.resume(guild_id).await?;
        Ok(true)
    }

    /// Vacía la cola y detiene el track actual. La sesión de voz sigue abierta.
    pub async fn stop(&self, guild_id: GuildId) -> Result<bool, AudioError> {
        let Some(slot) = self.existing_slot(guild_id) else {
            return Ok(false);
        };

        let had_music = {
            let mut guard = slot.lock().await;
            let Some(state) = guard.as_mut() else {
                return Ok(false);
            };

            let had_music = state.now_playing.is_some() || !state.queue.is_empty();
            state.queue.clear();
            state.now_playing = None;
            state.is_paused = false;
            had_music
        };

        self.backend.stop(guild_id).await?;
        info!("⏹️ Reproducción detenida en guild {}", guild_id);
        Ok(had_music)
    }

    /// El final del track lo detecta el callback, que es quien avanza la cola
    pub async fn skip(&self, guild_id: GuildId) -> Result<bool, AudioError> {
        let Some(status) = self.get_status(guild_id).await.filter(AudioStatus::is_playing) else {
            return Ok(false);
        };

        // El stream ya terminó y su callback está en camino: saltar cortaría al siguiente
        if !status.is_paused && !self.backend.is_playing(guild_id).await {
            debug!("⏭️ El track de guild {} ya estaba terminando", guild_id);
            return Ok(true);
        }

        self.backend.skip(guild_id).await?;
        Ok(true)
    }

    /// Elimina la sesión y cierra la conexión de voz
    pub async fn disconnect(&self, guild_id: GuildId) -> Result<(), AudioError> {
        if let Some(slot) = self.existing_slot(guild_id) {
            slot.lock().await.take();
        }

        self.backend.disconnect(guild_id).await?;
        info!("👋 Sesión cerrada en guild {}", guild_id);
        Ok(())
    }

    /// Devuelve el nuevo valor del bucle, o `None` sin sesión
    pub async fn toggle_loop(&self, guild_id: GuildId) -> Option<bool> {
        let slot = self.existing_slot(guild_id)?;
        let mut guard = slot.lock().await;
        let state = guard.as_mut()?;

        state.loop_enabled = !state.loop_enabled;
        Some(state.loop_enabled)
    }

    /// Permutación aleatoria de la cola. Devuelve su longitud, o `None` sin sesión.
    pub async fn shuffle(&self, guild_id: GuildId) -> Option<usize> {
        let slot = self.existing_slot(guild_id)?;
        let mut guard = slot.lock().await;
        let state = guard.as_mut()?;

        state.queue.make_contiguous().shuffle(&mut rand::thread_rng());
        Some(state.queue.len())
    }

    /// Guarda el volumen en la sesión y lo aplica al backend. Devuelve el porcentaje aplicado.
    pub async fn set_volume(&self, guild_id: GuildId, percent: u16) -> Result<Option<u16>, AudioError> {
        let percent = percent.min(MAX_VOLUME_PERCENT);

        {
            let Some(slot) = self.existing_slot(guild_id) else {
                return Ok(None);
            };
            let mut guard = slot.lock().await;
            let Some(state) = guard.as_mut() else {
                return Ok(None);
            };
            state.volume = volume_factor(percent);
        }

        self.backend.set_volume(guild_id, percent).await?;
        Ok(Some(percent))
    }

    pub async fn get_status(&self, guild_id: GuildId) -> Option<AudioStatus> {
        let slot = self.existing_slot(guild_id)?;
        let guard = slot.lock().await;
        guard.as_ref().map(GuildAudioState::status)
    }

    pub async fn voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.get_status(guild_id)
            .await
            .map(|status| status.voice_channel_id)
    }

    /// El bot fue movido de canal: la sesión lo sigue sin perder la cola
    pub async fn follow_voice_channel(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        let Some(slot) = self.existing_slot(guild_id) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match guard.as_mut() {
            Some(state) => {
                state.voice_channel_id = channel_id;
                true
            }
            None => false,
        }
    }

    // Métodos privados

    fn slot(&self, guild_id: GuildId) -> GuildSlot {
        self.guilds.entry(guild_id).or_default().value().clone()
    }

    fn existing_slot(&self, guild_id: GuildId) -> Option<GuildSlot> {
        self.guilds.get(&guild_id).map(|slot| slot.value().clone())
    }

    /// Sesión actual, o una nueva si no existe o el canal de voz es otro
    fn session<'a>(
        &self,
        slot: &'a mut Option<GuildAudioState>,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> (&'a mut GuildAudioState, bool) {
        let fresh = !matches!(slot, Some(state) if state.voice_channel_id == channel_id);
        if fresh {
            if slot.is_some() {
                info!("🔀 Nueva sesión en guild {}: canal {}", guild_id, channel_id);
            }
            *slot = None;
        }

        let state = slot.get_or_insert_with(|| {
            GuildAudioState::new(guild_id, channel_id, self.default_volume)
        });
        (state, fresh)
    }

    fn advance(&self, state: &mut GuildAudioState, previous: Option<Track>) -> Advance {
        if state.loop_enabled {
            if let Some(previous) = previous {
                state.queue.push_back(previous);
            }
        }

        state.is_paused = false;

        match state.queue.pop_front() {
            Some(track) => {
                let playback_id = self.playback_seq.fetch_add(1, Ordering::Relaxed) + 1;
                state.now_playing = Some(track.clone());
                state.playback_id = playback_id;
                Advance::Play {
                    track,
                    playback_id,
                    decided_at: Instant::now(),
                }
            }
            None => {
                state.now_playing = None;
                Advance::Empty
            }
        }
    }

    /// Entrega el track al backend; si falla, lo descarta y prueba el siguiente
    async fn drive(&self, guild_id: GuildId, mut step: Advance) {
        loop {
            let (track, playback_id, decided_at) = match step {
                Advance::Empty => {
                    debug!("📭 Cola vacía en guild {}", guild_id);
                    self.hooks.on_queue_empty(guild_id);
                    return;
                }
                Advance::Play {
                    track,
                    playback_id,
                    decided_at,
                } => (track, playback_id, decided_at),
            };

            let on_end = self.track_end_callback(guild_id, playback_id, track.clone());

            match self.backend.play(guild_id, &track, on_end).await {
                Ok(()) => {
                    if !self.confirm_start(guild_id, playback_id, &track).await {
                        return;
                    }
                    info!(
                        "▶️ playback_start engine={} guild_id={} elapsed_ms={} title={}",
                        self.backend.name(),
                        guild_id,
                        decided_at.elapsed().as_millis(),
                        track.title
                    );
                    self.hooks.on_track_start(guild_id);
                    return;
                }
                Err(e) => {
                    warn!(
                        "❌ No se pudo reproducir '{}' en guild {}: {}",
                        track.title, guild_id, e
                    );

                    let slot = self.slot(guild_id);
                    let mut guard = slot.lock().await;
                    let Some(state) = guard.as_mut() else {
                        return;
                    };
                    if state.playback_id != playback_id {
                        return;
                    }
                    state.now_playing = None;
                    step = self.advance(state, None);
                }
            }
        }
    }

    /// Comprueba que nadie detuvo la sesión mientras el backend arrancaba el track.
    ///
    /// Si se detuvo, corta lo que el backend acaba de empezar. Si otro track ya tomó
    /// el relevo, no toca nada.
    async fn confirm_start(&self, guild_id: GuildId, playback_id: u64, track: &Track) -> bool {
        let (current, stopped) = {
            let slot = self.slot(guild_id);
            let guard = slot.lock().await;
            match guard.as_ref() {
                Some(state) if state.playback_id != playback_id => (false, false),
                Some(state) => (state.now_playing.is_some(), state.now_playing.is_none()),
                None => (false, true),
            }
        };

        if stopped {
            debug!(
                "⏹️ '{}' se detuvo mientras arrancaba en guild {}",
                track.title, guild_id
            );
            if let Err(e) = self.backend.stop(guild_id).await {
                warn!("⚠️ No se pudo cortar el track en guild {}: {}", guild_id, e);
            }
        }
        current
    }

    /// El backend puede invocarlo desde cualquier hilo: solo programa el avance en el runtime
    fn track_end_callback(&self, guild_id: GuildId, playback_id: u64, track: Track) -> TrackEndCallback {
        let service = self.this.clone();
        let runtime = Handle::current();

        Box::new(move |error| {
            runtime.spawn(async move {
                if let Some(service) = service.upgrade() {
                    service.finish_track(guild_id, playback_id, track, error).await;
                }
            });
        })
    }

    fn finish_track(
        self: Arc<Self>,
        guild_id: GuildId,
        playback_id: u64,
        finished: Track,
        error: Option<AudioError>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Some(e) = &error {
                warn!(
                    "⚠️ '{}' terminó con error en guild {}: {}",
                    finished.title, guild_id, e
                );
            }

            let step = {
                let slot = self.slot(guild_id);
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    Some(state) if state.playback_id == playback_id && state.now_playing.is_some() => {
                        self.advance(state, Some(finished))
                    }
                    _ => {
                        debug!("Final obsoleto ignorado en guild {}", guild_id);
                        return;
                    }
                }
            };

            self.drive(guild_id, step).await;
        })
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> bool {
        let Some(slot) = self.existing_slot(guild_id) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match guard.as_mut() {
            Some(state) if state.now_playing.is_some() => {
                state.is_paused = paused;
                true
            }
            _ => false,
        }
    }

    async fn apply_volume(&self, guild_id: GuildId, percent: u16) {
        if let Err(e) = self.backend.set_volume(guild_id, percent).await {
            warn!("⚠️ No se pudo aplicar el volumen en guild {}: {}", guild_id, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serenity::model::id::UserId;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Backend en memoria: guarda los callbacks para que el test decida cuándo termina cada track
    #[derive(Default)]
    pub struct FakeBackend {
        pub plays: SyncMutex<Vec<(GuildId, String)>>,
        pub volumes: SyncMutex<Vec<(GuildId, u16)>>,
        pub overlaps: AtomicUsize,
        pub stops: AtomicUsize,
        callbacks: SyncMutex<HashMap<GuildId, TrackEndCallback>>,
        joined: SyncMutex<HashMap<GuildId, ChannelId>>,
        failing: SyncMutex<HashSet<String>>,
        gate: SyncMutex<Option<Arc<Notify>>>,
    }

    impl FakeBackend {
        /// Los siguientes `play` esperan a que el test abra la compuerta
        pub fn hold_plays(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.gate.lock() = Some(gate.clone());
            gate
        }

        /// Saca el callback activo sin dispararlo, como un stream que acaba de terminar
        pub fn detach(&self, guild_id: GuildId) -> Option<TrackEndCallback> {
            self.callbacks.lock().remove(&guild_id)
        }

        pub fn fail_on(&self, title: &str) {
            self.failing.lock().insert(title.to_string());
        }

        /// Termina el track activo del servidor como si hubiera acabado solo
        pub fn finish(&self, guild_id: GuildId) -> bool {
            let callback = self.callbacks.lock().remove(&guild_id);
            match callback {
                Some(callback) => {
                    callback(None);
                    true
                }
                None => false,
            }
        }

        /// Termina el track activo con un error de stream
        pub fn fail_current(&self, guild_id: GuildId) -> bool {
            let callback = self.callbacks.lock().remove(&guild_id);
            match callback {
                Some(callback) => {
                    callback(Some(AudioError::Stream("conexión cortada".into())));
                    true
                }
                None => false,
            }
        }

        pub fn played(&self) -> Vec<String> {
            self.plays.lock().iter().map(|(_, title)| title.clone()).collect()
        }

        pub fn joined(&self, guild_id: GuildId) -> Option<ChannelId> {
            self.joined.lock().get(&guild_id).copied()
        }
    }

    #[async_trait]
    impl AudioBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn connect(&self, _bot_user: UserId) -> Result<(), AudioError> {
            Ok(())
        }

        async fn ensure_player(&self, guild_id: GuildId, channel: ChannelId) -> Result<(), AudioError> {
            self.joined.lock().insert(guild_id, channel);
            Ok(())
        }

        async fn play(
            &self,
            guild_id: GuildId,
            track: &Track,
            on_end: TrackEndCallback,
        ) -> Result<(), AudioError> {
            if !self.joined.lock().contains_key(&guild_id) {
                return Err(AudioError::NotConnected);
            }
            if self.failing.lock().contains(&track.title) {
                return Err(AudioError::Stream(format!("{} no disponible", track.title)));
            }

            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }

            if self.callbacks.lock().insert(guild_id, on_end).is_some() {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.plays.lock().push((guild_id, track.title.clone()));
            Ok(())
        }

        async fn stop(&self, guild_id: GuildId) -> Result<(), AudioError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.finish(guild_id);
            Ok(())
        }

        async fn pause(&self, _guild_id: GuildId) -> Result<(), AudioError> {
            Ok(())
        }

        async fn resume(&self, _guild_id: GuildId) -> Result<(), AudioError> {
            Ok(())
        }

        async fn set_volume(&self, guild_id: GuildId, percent: u16) -> Result<(), AudioError> {
            self.volumes.lock().push((guild_id, percent));
            Ok(())
        }

        async fn is_playing(&self, guild_id: GuildId) -> bool {
            self.callbacks.lock().contains_key(&guild_id)
        }

        async fn disconnect(&self, guild_id: GuildId) -> Result<(), AudioError> {
            self.joined.lock().remove(&guild_id);
            self.finish(guild_id);
            Ok(())
        }
    }

    /// Deja correr las tareas lanzadas por los callbacks
    pub async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }
}
