//! Cliente mínimo de Lavalink v4: sesión por WebSocket y control de reproductores por REST.

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serenity::model::id::{GuildId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::backend::AudioError;
use crate::config::LavalinkSettings;

const CLIENT_NAME: &str = concat!("tune-channel/", env!("CARGO_PKG_VERSION"));
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Espera antes de cada intento de reconexión; el último valor se repite
const RECONNECT_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Segundos que el nodo conserva los reproductores mientras no hay WebSocket
const RESUME_TIMEOUT_SECS: u64 = 60;

type NodeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SessionSlot = Arc<RwLock<Option<String>>>;

/// Mensajes que el nodo envía por el WebSocket
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeMessage {
    Ready {
        session_id: String,
        #[serde(default)]
        resumed: bool,
    },
    PlayerUpdate {
        guild_id: String,
    },
    Stats {
        #[serde(default)]
        players: u32,
        #[serde(default)]
        playing_players: u32,
    },
    Event {
        #[serde(rename = "type")]
        kind: String,
        guild_id: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTrack {
    pub encoded: String,
    pub info: NodeTrackInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTrackInfo {
    pub identifier: String,
    pub title: String,
    pub author: String,
    /// Milisegundos
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub source_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlaylist {
    pub info: NodePlaylistInfo,
    pub tracks: Vec<NodeTrack>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlaylistInfo {
    pub name: String,
    #[serde(default = "no_selection")]
    pub selected_track: i64,
}

fn no_selection() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeException {
    pub message: Option<String>,
    pub severity: String,
}

/// Respuesta de `/v4/loadtracks`
#[derive(Debug, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "lowercase")]
pub enum LoadResult {
    Track(NodeTrack),
    Playlist(NodePlaylist),
    Search(Vec<NodeTrack>),
    Empty(serde::de::IgnoredAny),
    Error(NodeException),
}

impl LoadResult {
    /// El track que se reproduciría para esta búsqueda
    pub fn first_track(self) -> Option<NodeTrack> {
        match self {
            LoadResult::Track(track) => Some(track),
            LoadResult::Search(tracks) => tracks.into_iter().next(),
            LoadResult::Playlist(playlist) => {
                let selected = usize::try_from(playlist.info.selected_track).unwrap_or(0);
                let mut tracks = playlist.tracks;
                if selected < tracks.len() {
                    Some(tracks.swap_remove(selected))
                } else {
                    tracks.into_iter().next()
                }
            }
            LoadResult::Empty(_) | LoadResult::Error(_) => None,
        }
    }
}

/// Estado de un reproductor según el nodo
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlayer {
    pub track: Option<NodeTrack>,
    #[serde(default)]
    pub volume: u16,
    #[serde(default)]
    pub paused: bool,
}

impl NodePlayer {
    /// Sin track y sin pausa: el track terminó
    pub fn is_finished(&self) -> bool {
        self.track.is_none() && !self.paused
    }
}

/// Cuerpo del PATCH de reproductor; los campos `None` no se envían
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceUpdate>,
}

/// `encoded: null` detiene el track actual
#[derive(Debug, Serialize)]
pub struct TrackUpdate {
    pub encoded: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpdate {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

pub struct LavalinkClient {
    settings: LavalinkSettings,
    http: reqwest::Client,
    session: SessionSlot,
    connecting: tokio::sync::Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LavalinkClient {
    pub fn new(settings: LavalinkSettings, http: reqwest::Client) -> Self {
        Self {
            settings,
            http,
            session: Arc::new(RwLock::new(None)),
            connecting: tokio::sync::Mutex::new(()),
            reader: Mutex::new(None),
        }
    }

    /// Abre la sesión del nodo. Mientras la tarea de lectura viva, las llamadas
    /// posteriores no hacen nada: ella misma reconecta si el nodo se cae.
    pub async fn connect(&self, user_id: UserId) -> Result<(), AudioError> {
        let _connecting = self.connecting.lock().await;
        if self
            .reader
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return Ok(());
        }

        let link = SessionLink {
            settings: self.settings.clone(),
            http: self.http.clone(),
            user_id,
            session: self.session.clone(),
        };

        info!(
            "🎛️ Conectando a Lavalink '{}' en {}:{}",
            self.settings.identifier, self.settings.host, self.settings.port
        );
        let (socket, session_id, _resumed) = link.open(None).await?;
        link.activate(&session_id).await;
        info!("✅ Sesión de Lavalink abierta: {}", session_id);

        let handle = tokio::spawn(link.keep_alive(socket, session_id));
        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Sesión actual; no hay mientras el WebSocket está caído
    pub fn session_id(&self) -> Result<String, AudioError> {
        self.session.read().clone().ok_or(AudioError::NodeNotReady)
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, AudioError> {
        let url = format!(
            "{}/v4/loadtracks?identifier={}",
            self.settings.rest_base(),
            urlencoding::encode(identifier)
        );

        let response = authorized(self.http.get(url), &self.settings).send().await?;
        let result = check(response).await?.json::<LoadResult>().await?;

        if let LoadResult::Error(exception) = &result {
            warn!(
                "⚠️ Lavalink no pudo cargar '{}': {} ({})",
                identifier,
                exception.message.as_deref().unwrap_or("sin mensaje"),
                exception.severity
            );
        }

        Ok(result)
    }

    pub async fn update_player(&self, guild_id: GuildId, update: &PlayerUpdate) -> Result<(), AudioError> {
        let url = self.player_url(guild_id)?;
        let response = authorized(self.http.patch(format!("{}?noReplace=false", url)), &self.settings)
            .json(update)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// `None` si el nodo no tiene reproductor para el servidor
    pub async fn get_player(&self, guild_id: GuildId) -> Result<Option<NodePlayer>, AudioError> {
        let url = self.player_url(guild_id)?;
        let response = authorized(self.http.get(url), &self.settings).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }

    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<(), AudioError> {
        let url = self.player_url(guild_id)?;
        let response = authorized(self.http.delete(url), &self.settings).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    // Métodos privados

    fn player_url(&self, guild_id: GuildId) -> Result<String, AudioError> {
        Ok(format!(
            "{}/v4/sessions/{}/players/{}",
            self.settings.rest_base(),
            self.session_id()?,
            guild_id
        ))
    }
}

/// Lo que la tarea de lectura necesita para reabrir la sesión por su cuenta
struct SessionLink {
    settings: LavalinkSettings,
    http: reqwest::Client,
    user_id: UserId,
    session: SessionSlot,
}

impl SessionLink {
    /// Handshake del WebSocket hasta el op `ready`. Con `resume` pide reanudar esa sesión.
    async fn open(&self, resume: Option<&str>) -> Result<(NodeSocket, String, bool), AudioError> {
        let mut request = self.settings.websocket_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header(&self.settings.password)?);
        headers.insert("User-Id", header(&self.user_id.to_string())?);
        headers.insert("Client-Name", header(CLIENT_NAME)?);
        if let Some(session_id) = resume {
            headers.insert("Session-Id", header(session_id)?);
        }

        let (mut socket, _response) = connect_async(request).await?;

        let (session_id, resumed) = tokio::time::timeout(READY_TIMEOUT, async {
            while let Some(message) = socket.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Ok(NodeMessage::Ready { session_id, resumed }) =
                            serde_json::from_str(text.as_str())
                        {
                            return Ok((session_id, resumed));
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(AudioError::from(e)),
                }
            }
            Err(AudioError::NodeNotReady)
        })
        .await
        .map_err(|_| AudioError::NodeNotReady)??;

        Ok((socket, session_id, resumed))
    }

    /// Publica la sesión y pide al nodo que conserve los reproductores si el WebSocket cae
    async fn activate(&self, session_id: &str) {
        let url = format!("{}/v4/sessions/{}", self.settings.rest_base(), session_id);
        let body = serde_json::json!({ "resuming": true, "timeout": RESUME_TIMEOUT_SECS });

        let result = match authorized(self.http.patch(url), &self.settings).json(&body).send().await {
            Ok(response) => check(response).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("⚠️ Lavalink no aceptó reanudar la sesión {}: {}", session_id, e);
        }

        *self.session.write() = Some(session_id.to_string());
    }

    /// Lee eventos mientras el WebSocket viva y reconecta cuando se cierra
    async fn keep_alive(self, mut socket: NodeSocket, mut session_id: String) {
        loop {
            self.read_until_closed(&mut socket).await;

            *self.session.write() = None;
            warn!(
                "🔌 Sesión {} de Lavalink '{}' perdida, reconectando...",
                session_id, self.settings.identifier
            );

            (socket, session_id) = self.reconnect(&session_id).await;
        }
    }

    async fn read_until_closed(&self, socket: &mut NodeSocket) {
        let identifier = &self.settings.identifier;

        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Text(text)) => log_node_message(identifier, text.as_str()),
                Ok(Message::Close(frame)) => {
                    warn!("🔌 Lavalink '{}' cerró la conexión: {:?}", identifier, frame);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("🔌 Error en el WebSocket de Lavalink '{}': {}", identifier, e);
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, previous: &str) -> (NodeSocket, String) {
        let mut attempt = 0;

        loop {
            tokio::time::sleep(reconnect_delay(attempt)).await;
            attempt += 1;

            match self.open(Some(previous)).await {
                Ok((socket, session_id, resumed)) => {
                    if resumed {
                        info!("♻️ Sesión de Lavalink reanudada: {}", session_id);
                    } else {
                        warn!(
                            "🆕 Lavalink abrió la sesión nueva {}: los reproductores anteriores se perdieron",
                            session_id
                        );
                    }
                    self.activate(&session_id).await;
                    return (socket, session_id);
                }
                Err(e) => warn!(
                    "⚠️ Reconexión {} a Lavalink '{}' fallida: {}",
                    attempt, self.settings.identifier, e
                ),
            }
        }
    }
}

fn reconnect_delay(attempt: usize) -> Duration {
    RECONNECT_DELAYS[attempt.min(RECONNECT_DELAYS.len() - 1)]
}

fn authorized(request: reqwest::RequestBuilder, settings: &LavalinkSettings) -> reqwest::RequestBuilder {
    request.header("Authorization", &settings.password)
}

impl Drop for LavalinkClient {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

fn header(value: &str) -> Result<HeaderValue, AudioError> {
    HeaderValue::from_str(value).map_err(|e| AudioError::Protocol(e.to_string()))
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, AudioError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(AudioError::Node {
        status: status.as_u16(),
        message,
    })
}

fn log_node_message(identifier: &str, text: &str) {
    match serde_json::from_str::<NodeMessage>(text) {
        Ok(NodeMessage::Event { kind, guild_id }) => {
            debug!("📨 Lavalink '{}' evento {} en guild {}", identifier, kind, guild_id);
        }
        Ok(NodeMessage::Stats {
            players,
            playing_players,
        }) => {
            debug!(
                "📊 Lavalink '{}': {} reproductores, {} sonando",
                identifier, players, playing_players
            );
        }
        Ok(NodeMessage::Ready { session_id, resumed }) => {
            debug!("Lavalink '{}' ready {} (resumed={})", identifier, session_id, resumed);
        }
        Ok(NodeMessage::PlayerUpdate { .. }) => {}
        Err(_) => debug!("Lavalink '{}' mensaje no reconocido: {}", identifier, text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TRACK: &str = r#"{
        "encoded": "QAAAjQIAJVJpY2sgQXN0bGV5",
        "info": {
            "identifier": "dQw4w9WgXcQ",
            "isSeekable": true,
            "author": "RickAstleyVEVO",
            "length": 212000,
            "isStream": false,
            "position": 0,
            "title": "Never Gonna Give You Up",
            "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "artworkUrl": null,
            "isrc": null,
            "sourceName": "youtube"
        },
        "pluginInfo": {},
        "userData": {}
    }"#;

    #[test]
    fn test_ready_message() {
        let message: NodeMessage =
            serde_json::from_str(r#"{"op":"ready","resumed":false,"sessionId":"abc123"}"#).unwrap();
        match message {
            NodeMessage::Ready { session_id, resumed } => {
                assert_eq!(session_id, "abc123");
                assert!(!resumed);
            }
            other => panic!("esperaba ready, obtuve {:?}", other),
        }
    }

    #[test]
    fn test_event_message() {
        let message: NodeMessage = serde_json::from_str(
            r#"{"op":"event","type":"TrackEndEvent","guildId":"42","reason":"finished"}"#,
        )
        .unwrap();
        assert!(matches!(message, NodeMessage::Event { kind, .. } if kind == "TrackEndEvent"));
    }

    #[test]
    fn test_load_result_search_takes_first() {
        let json = format!(r#"{{"loadType":"search","data":[{TRACK},{TRACK}]}}"#);
        let result: LoadResult = serde_json::from_str(&json).unwrap();

        let track = result.first_track().unwrap();
        assert_eq!(track.info.title, "Never Gonna Give You Up");
        assert_eq!(track.info.length, 212000);
        assert_eq!(track.info.artwork_url, None);
    }

    #[test]
    fn test_load_result_playlist_honours_selection() {
        let json = format!(
            r#"{{"loadType":"playlist","data":{{"info":{{"name":"Mix","selectedTrack":1}},"pluginInfo":{{}},"tracks":[{TRACK},{TRACK}]}}}}"#
        );
        let result: LoadResult = serde_json::from_str(&json).unwrap();
        assert!(matches!(&result, LoadResult::Playlist(p) if p.info.name == "Mix" && p.tracks.len() == 2));
        assert!(result.first_track().is_some());
    }

    #[test]
    fn test_load_result_empty_and_error() {
        let empty: LoadResult = serde_json::from_str(r#"{"loadType":"empty","data":{}}"#).unwrap();
        assert!(empty.first_track().is_none());

        let error: LoadResult = serde_json::from_str(
            r#"{"loadType":"error","data":{"message":"bloqueado","severity":"common","cause":"x"}}"#,
        )
        .unwrap();
        assert!(matches!(&error, LoadResult::Error(e) if e.severity == "common"));
        assert!(error.first_track().is_none());
    }

    #[test]
    fn test_player_update_serialization() {
        let stop = PlayerUpdate {
            track: Some(TrackUpdate { encoded: None }),
            paused: Some(false),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&stop).unwrap(),
            serde_json::json!({"track": {"encoded": null}, "paused": false})
        );

        let voice = PlayerUpdate {
            voice: Some(VoiceUpdate {
                token: "t".into(),
                endpoint: "e".into(),
                session_id: "s".into(),
            }),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&voice).unwrap(),
            serde_json::json!({"voice": {"token": "t", "endpoint": "e", "sessionId": "s"}})
        );
    }

    #[test]
    fn test_player_finished_detection() {
        let idle: NodePlayer = serde_json::from_str(r#"{"track":null,"volume":100,"paused":false}"#).unwrap();
        assert!(idle.is_finished());

        let paused: NodePlayer = serde_json::from_str(r#"{"track":null,"paused":true}"#).unwrap();
        assert!(!paused.is_finished());

        let playing: NodePlayer =
            serde_json::from_str(&format!(r#"{{"track":{TRACK},"paused":false}}"#)).unwrap();
        assert!(!playing.is_finished());
    }

    #[test]
    fn test_reconnect_delay_backs_off_and_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(5));
        assert_eq!(reconnect_delay(4), Duration::from_secs(30));
        assert_eq!(reconnect_delay(50), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_session_is_reopened_after_the_socket_closes() {
        use futures::SinkExt;
        use tokio::net::TcpListener;
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (handshakes_tx, mut handshakes) = tokio::sync::mpsc::unbounded_channel();

        // Nodo falso: la primera sesión se cierra enseguida, la segunda se mantiene
        tokio::spawn(async move {
            let mut sessions = ["primera", "segunda"].into_iter();
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };

                let mut resume = None;
                let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    resume = request
                        .headers()
                        .get("Session-Id")
                        .and_then(|value| value.to_str().ok())
                        .map(String::from);
                    Ok(response)
                };
                // El PATCH de reanudación también llega aquí y no es un WebSocket
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                    continue;
                };
                let Some(session_id) = sessions.next() else {
                    return;
                };

                let _ = handshakes_tx.send(resume);
                let ready = format!(r#"{{"op":"ready","resumed":false,"sessionId":"{session_id}"}}"#);
                ws.send(Message::text(ready)).await.unwrap();

                if session_id == "primera" {
                    let _ = ws.close(None).await;
                } else {
                    while ws.next().await.is_some() {}
                }
            }
        });

        let settings = LavalinkSettings {
            port,
            ..Default::default()
        };
        let client = LavalinkClient::new(settings, reqwest::Client::new());
        client.connect(UserId::new(7)).await.unwrap();

        assert_eq!(client.session_id().unwrap(), "primera");
        assert_eq!(handshakes.recv().await, Some(None));

        let wait = Duration::from_secs(10);
        tokio::time::timeout(wait, async {
            while client.session_id().is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // La reconexión pide reanudar la sesión perdida
        let resumed_from = tokio::time::timeout(wait, handshakes.recv()).await.unwrap();
        assert_eq!(resumed_from, Some(Some("primera".to_string())));

        tokio::time::timeout(wait, async {
            while client.session_id().ok().as_deref() != Some("segunda") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Con la tarea de lectura viva, conectar de nuevo no abre otra sesión
        client.connect(UserId::new(7)).await.unwrap();
        assert!(handshakes.try_recv().is_err());
    }

    #[test]
    fn test_session_required_for_player_routes() {
        let client = LavalinkClient::new(LavalinkSettings::default(), reqwest::Client::new());
        assert!(matches!(client.session_id(), Err(AudioError::NodeNotReady)));
        assert!(matches!(client.player_url(GuildId::new(1)), Err(AudioError::NodeNotReady)));
    }
}
