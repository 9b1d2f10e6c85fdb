use anyhow::{Context, Result};
use serenity::{http::Http, model::gateway::GatewayIntents, model::id::ApplicationId, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod sources;
mod storage;
mod ui;

use crate::audio::{
    AudioBackend, AudioService, HybridBackend, LavalinkBackend, LavalinkClient, LocalBackend,
};
use crate::bot::MusicBot;
use crate::config::{BackendKind, Config};
use crate::sources::{HybridResolver, LavalinkResolver, TrackResolver, YtDlpResolver};
use crate::storage::JsonStorage;
use crate::ui::StatusBoard;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tune_channel=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando tune-channel v{}", env!("CARGO_PKG_VERSION"));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    // Cargar configuración
    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    // Inicializar almacenamiento JSON
    let storage = Arc::new(tokio::sync::Mutex::new(
        JsonStorage::new(config.data_dir.clone()).await?,
    ));

    // Backend y resolver según AUDIO_BACKEND
    let http_client = reqwest::Client::new();
    let songbird = Songbird::serenity();
    let (backend, resolver) = build_audio(&config, songbird.clone(), http_client);

    // El nodo remoto debe estar listo antes de aceptar comandos
    let http = Arc::new(Http::new(&config.discord_token));
    let bot_user = http.get_current_user().await?.id;
    info!("🎼 Inicializando backend {}...", backend.name());
    backend
        .connect(bot_user)
        .await
        .with_context(|| format!("No se pudo inicializar el backend {}", backend.name()))?;
    info!("✅ Backend {} listo", backend.name());

    let (events_tx, events_rx) = unbounded_channel();
    let service = AudioService::new(backend, Arc::new(events_tx), config.default_volume);

    // Canales de música cargados antes de iniciar el cliente
    let board = StatusBoard::load(http, service.clone(), storage).await;
    board.clone().spawn_event_loop(events_rx);

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = MusicBot::new(config.clone(), service, resolver, board);

    // Construir cliente
    let mut client = Client::builder(&config.discord_token, intents)
        .application_id(ApplicationId::new(config.application_id))
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Error al registrar Ctrl+C");
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        std::process::exit(0);
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

/// Elige la implementación una sola vez, al arrancar
fn build_audio(
    config: &Config,
    songbird: Arc<Songbird>,
    http_client: reqwest::Client,
) -> (Arc<dyn AudioBackend>, Arc<dyn TrackResolver>) {
    let ytdlp = || YtDlpResolver::new(config.ytdlp_cookies.clone(), config.max_playlist_size);
    let local = || {
        LocalBackend::new(
            songbird.clone(),
            http_client.clone(),
            config.ytdlp_cookies.clone(),
        )
    };
    let node = || Arc::new(LavalinkClient::new(config.lavalink.clone(), http_client.clone()));

    let backend: Arc<dyn AudioBackend>;
    let resolver: Arc<dyn TrackResolver>;

    match config.audio_backend {
        BackendKind::Ffmpeg => {
            backend = Arc::new(local());
            resolver = Arc::new(ytdlp());
        }
        BackendKind::Lavalink => {
            let node = node();
            backend = Arc::new(LavalinkBackend::new(
                node.clone(),
                songbird.clone(),
                config.lavalink.poll_interval,
            ));
            resolver = Arc::new(LavalinkResolver::new(node, config.max_playlist_size));
        }
        BackendKind::Hybrid => {
            let node = node();
            backend = Arc::new(HybridBackend::new(node.clone(), local()));
            resolver = Arc::new(HybridResolver::new(
                LavalinkResolver::new(node, config.max_playlist_size),
                ytdlp(),
            ));
        }
    }

    (backend, resolver)
}

async fn health_check() -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
