use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

/// Backend de audio seleccionado al arrancar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Transcodificación local con Songbird
    Ffmpeg,
    /// Reproducción delegada a un nodo Lavalink
    Lavalink,
    /// Búsqueda en Lavalink, reproducción local
    Hybrid,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ffmpeg => "ffmpeg",
            BackendKind::Lavalink => "lavalink",
            BackendKind::Hybrid => "hybrid",
        }
    }

    pub fn uses_node(&self) -> bool {
        matches!(self, BackendKind::Lavalink | BackendKind::Hybrid)
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ffmpeg" => Ok(BackendKind::Ffmpeg),
            "lavalink" => Ok(BackendKind::Lavalink),
            "hybrid" => Ok(BackendKind::Hybrid),
            other => anyhow::bail!(
                "AUDIO_BACKEND desconocido: '{}' (usa ffmpeg, lavalink o hybrid)",
                other
            ),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conexión al nodo Lavalink
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LavalinkSettings {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub identifier: String,
    pub secure: bool,
    pub poll_interval: Duration,
}

impl LavalinkSettings {
    pub fn rest_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }
}

impl Default for LavalinkSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            identifier: "main".to_string(),
            secure: false,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Audio
    pub audio_backend: BackendKind,
    pub lavalink: LavalinkSettings,
    pub default_volume: u16, // Porcentaje
    pub max_playlist_size: usize,
    pub ytdlp_cookies: Option<PathBuf>,

    // Paths
    pub data_dir: PathBuf,

    // Mensajes temporales en el canal de música
    pub message_ttl: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("No se pudo crear {}", config.data_dir.display()))?;

        Ok(config)
    }

    /// Construye la configuración a partir de una función de búsqueda de variables.
    ///
    /// `load` la usa con el entorno del proceso; los tests con un mapa.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let defaults = LavalinkSettings::default();

        let config = Self {
            discord_token: lookup("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,
            application_id: lookup("APPLICATION_ID")
                .context("APPLICATION_ID no definido")?
                .parse()
                .context("APPLICATION_ID inválido")?,
            guild_id: lookup("GUILD_ID").and_then(|s| s.parse().ok()),

            audio_backend: var("AUDIO_BACKEND", "ffmpeg").parse()?,
            lavalink: LavalinkSettings {
                host: var("LAVALINK_HOST", &defaults.host),
                port: var("LAVALINK_PORT", "2333")
                    .parse()
                    .context("LAVALINK_PORT inválido")?,
                password: var("LAVALINK_PASSWORD", &defaults.password),
                identifier: var("LAVALINK_IDENTIFIER", &defaults.identifier),
                secure: var("LAVALINK_SECURE", "false")
                    .parse()
                    .context("LAVALINK_SECURE debe ser true o false")?,
                poll_interval: Duration::from_millis(
                    var("LAVALINK_POLL_INTERVAL_MS", "1000")
                        .parse()
                        .context("LAVALINK_POLL_INTERVAL_MS inválido")?,
                ),
            },
            default_volume: var("DEFAULT_VOLUME", "100")
                .parse()
                .context("DEFAULT_VOLUME inválido")?,
            max_playlist_size: var("MAX_PLAYLIST_SIZE", "100")
                .parse()
                .context("MAX_PLAYLIST_SIZE inválido")?,
            ytdlp_cookies: lookup("YTDLP_COOKIES")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),

            data_dir: var("DATA_DIR", "./data").into(),

            message_ttl: Duration::from_secs(
                var("MESSAGE_TTL_SECS", "5")
                    .parse()
                    .context("MESSAGE_TTL_SECS inválido")?,
            ),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 200 percent
    /// - Playlist cap must be greater than zero
    /// - The Lavalink poll interval must be at least 100ms when a node is used
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN está vacío");
        }

        if self.default_volume > 200 {
            anyhow::bail!(
                "Default volume must be between 0 and 200, got: {}",
                self.default_volume
            );
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        if self.audio_backend.uses_node() {
            if self.lavalink.poll_interval < Duration::from_millis(100) {
                anyhow::bail!(
                    "Lavalink poll interval too low, minimum 100ms, got: {:?}",
                    self.lavalink.poll_interval
                );
            }
            if self.lavalink.host.trim().is_empty() {
                anyhow::bail!("LAVALINK_HOST está vacío");
            }
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes tokens and the node password.
    pub fn summary(&self) -> String {
        let node = if self.audio_backend.uses_node() {
            format!(
                "{}:{} ({}, poll {}ms)",
                self.lavalink.host,
                self.lavalink.port,
                self.lavalink.identifier,
                self.lavalink.poll_interval.as_millis()
            )
        } else {
            "no".to_string()
        };

        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Audio: backend={}, {}% vol, playlist max {}\n  \
            Nodo: {}\n  \
            Datos: {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.audio_backend,
            self.default_volume,
            self.max_playlist_size,
            node,
            self.data_dir.display(),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            audio_backend: BackendKind::Ffmpeg,
            lavalink: LavalinkSettings::default(),
            default_volume: 100,
            max_playlist_size: 100,
            ytdlp_cookies: None,

            data_dir: "./data".into(),

            message_ttl: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_minimal_env() {
        let config =
            Config::from_lookup(lookup(&[("DISCORD_TOKEN", "abc"), ("APPLICATION_ID", "42")]))
                .unwrap();

        assert_eq!(config.audio_backend, BackendKind::Ffmpeg);
        assert_eq!(config.lavalink.port, 2333);
        assert_eq!(config.lavalink.password, "youshallnotpass");
        assert_eq!(config.lavalink.identifier, "main");
        assert_eq!(config.lavalink.poll_interval, Duration::from_secs(1));
        assert_eq!(config.default_volume, 100);
        assert_eq!(config.message_ttl, Duration::from_secs(5));
        assert!(config.guild_id.is_none());
    }

    #[test]
    fn test_backend_selection_is_case_insensitive() {
        assert_eq!(" Lavalink ".parse::<BackendKind>().unwrap(), BackendKind::Lavalink);
        assert_eq!("HYBRID".parse::<BackendKind>().unwrap(), BackendKind::Hybrid);
        assert!("vlc".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_node_settings_are_read() {
        let config = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("APPLICATION_ID", "42"),
            ("AUDIO_BACKEND", "lavalink"),
            ("LAVALINK_HOST", "node.local"),
            ("LAVALINK_PORT", "443"),
            ("LAVALINK_SECURE", "true"),
        ]))
        .unwrap();

        assert_eq!(config.lavalink.rest_base(), "https://node.local:443");
        assert_eq!(config.lavalink.websocket_url(), "wss://node.local:443/v4/websocket");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let loud = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("APPLICATION_ID", "42"),
            ("DEFAULT_VOLUME", "250"),
        ]));
        assert!(loud.is_err());

        let missing_token = Config::from_lookup(lookup(&[("APPLICATION_ID", "42")]));
        assert!(missing_token.is_err());

        let fast_poll = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("APPLICATION_ID", "42"),
            ("AUDIO_BACKEND", "hybrid"),
            ("LAVALINK_POLL_INTERVAL_MS", "10"),
        ]));
        assert!(fast_poll.is_err());
    }

    #[test]
    fn test_summary_hides_secrets() {
        let config = Config {
            discord_token: "super-secret".to_string(),
            ..Config::default()
        };
        assert!(!config.summary().contains("super-secret"));
        assert!(!config.summary().contains("youshallnotpass"));
    }
}
