use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, info, warn};

/// Canal y mensaje de estado de un servidor, almacenados en JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChannel {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
}

/// Manager de almacenamiento basado en archivos JSON
///
/// Un archivo `channels/guild_{id}.json` por servidor, con una copia en memoria
/// que se carga completa al inicializar.
pub struct JsonStorage {
    data_dir: PathBuf,
    channels_cache: HashMap<u64, StatusChannel>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let channels_dir = data_dir.join("channels");
        fs::create_dir_all(&channels_dir).await?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let mut storage = Self {
            data_dir,
            channels_cache: HashMap::new(),
        };

        storage.load_all_channels().await?;

        Ok(storage)
    }

    pub fn get(&self, guild_id: u64) -> Option<StatusChannel> {
        self.channels_cache.get(&guild_id).cloned()
    }

    /// Todas las asignaciones conocidas
    pub fn get_all(&self) -> Vec<StatusChannel> {
        self.channels_cache.values().cloned().collect()
    }

    /// Inserta o reemplaza la asignación del servidor
    pub async fn upsert(&mut self, guild_id: u64, channel_id: u64, message_id: u64) -> Result<()> {
        let record = StatusChannel {
            guild_id,
            channel_id,
            message_id,
        };

        self.save_channel(&record).await?;
        self.channels_cache.insert(guild_id, record);

        info!("💾 Canal de música guardado para guild {}", guild_id);
        Ok(())
    }

    /// Cambia solo el mensaje de estado. Devuelve `false` si el servidor no tiene asignación.
    pub async fn update_message_id(&mut self, guild_id: u64, message_id: u64) -> Result<bool> {
        let Some(mut record) = self.get(guild_id) else {
            return Ok(false);
        };

        record.message_id = message_id;
        self.save_channel(&record).await?;
        self.channels_cache.insert(guild_id, record);

        Ok(true)
    }

    pub async fn delete(&mut self, guild_id: u64) -> Result<()> {
        self.channels_cache.remove(&guild_id);

        let path = self.channel_file_path(guild_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("🗑️ Canal de música eliminado para guild {}", guild_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("Error eliminando canal de guild {}: {}", guild_id, e);
                Err(e.into())
            }
        }
    }

    // Métodos privados

    async fn load_channel(&self, guild_id: u64) -> Result<StatusChannel> {
        let content = fs::read_to_string(self.channel_file_path(guild_id)).await?;
        let record: StatusChannel = serde_json::from_str(&content)?;
        Ok(record)
    }

    async fn save_channel(&self, record: &StatusChannel) -> Result<()> {
        let content = serde_json::to_string_pretty(record)?;
        fs::write(self.channel_file_path(record.guild_id), content).await?;
        Ok(())
    }

    async fn load_all_channels(&mut self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("channels")).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();

            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.load_channel(guild_id).await {
                Ok(record) => {
                    self.channels_cache.insert(guild_id, record);
                    loaded_count += 1;
                }
                Err(e) => {
                    warn!("Error cargando canal para guild {}: {}", guild_id, e);
                }
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargados {} canales de música", loaded_count);
        }

        Ok(())
    }

    fn channel_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("channels")
            .join(format!("guild_{}.json", guild_id))
    }
}
