use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::File,
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{path::Path, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no hay conexión de voz en el guild {0}")]
    NotConnected(GuildId),

    #[error("no se pudo conectar al canal de voz: {0}")]
    Join(String),

    #[error("no se pudo iniciar la reproducción: {0}")]
    Play(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Playing,
    Paused,
}

/// Identifica una reproducción concreta; los eventos con un token viejo se descartan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackToken(pub u64);

/// Fin de una reproducción, enviado desde las tareas del transporte.
#[derive(Debug, Clone)]
pub struct PlaybackEvent {
    pub guild_id: GuildId,
    pub token: PlaybackToken,
    pub error: Option<String>,
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Conecta o mueve el bot al canal.
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), TransportError>;

    async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError>;

    /// Reproduce el archivo y publica un [`PlaybackEvent`] con `token` al terminar.
    async fn play(
        &self,
        guild_id: GuildId,
        path: &Path,
        token: PlaybackToken,
        events: UnboundedSender<PlaybackEvent>,
    ) -> Result<(), TransportError>;

    /// `true` si había algo que detener.
    async fn stop(&self, guild_id: GuildId) -> bool;

    async fn pause(&self, guild_id: GuildId) -> bool;

    async fn resume(&self, guild_id: GuildId) -> bool;

    async fn state(&self, guild_id: GuildId) -> TransportState;

    fn connected_guilds(&self) -> Vec<GuildId>;
}

/// Transporte de voz sobre songbird.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    tracks: DashMap<GuildId, TrackHandle>,
    joined: DashSet<GuildId>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            tracks: DashMap::new(),
            joined: DashSet::new(),
        }
    }

    /// El bot fue desconectado desde fuera (kick, canal borrado).
    pub fn forget(&self, guild_id: GuildId) {
        self.tracks.remove(&guild_id);
        self.joined.remove(&guild_id);
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), TransportError> {
        if let Some(call) = self.manager.get(guild_id) {
            let current = call.lock().await.current_channel();
            if current == Some(channel_id.into()) {
                return Ok(());
            }
        }

        self.manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;
        self.joined.insert(guild_id);

        info!("🔊 Conectado al canal de voz {} en guild {}", channel_id, guild_id);
        Ok(())
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.forget(guild_id);
        if self.manager.get(guild_id).is_none() {
            return Ok(());
        }
        self.manager
            .remove(guild_id)
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;

        info!("👋 Desconectado del canal de voz en guild {}", guild_id);
        Ok(())
    }

    async fn play(
        &self,
        guild_id: GuildId,
        path: &Path,
        token: PlaybackToken,
        events: UnboundedSender<PlaybackEvent>,
    ) -> Result<(), TransportError> {
        let call = self
            .manager
            .get(guild_id)
            .ok_or(TransportError::NotConnected(guild_id))?;

        let input = File::new(path.to_path_buf());
        let handle = call.lock().await.play_only_input(input.into());

        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackFinished {
                        guild_id,
                        token,
                        events: events.clone(),
                    },
                )
                .map_err(|e| TransportError::Play(e.to_string()))?;
        }

        self.tracks.insert(guild_id, handle);
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> bool {
        let Some((_, track)) = self.tracks.remove(&guild_id) else {
            return false;
        };
        let live = matches!(
            track.get_info().await.map(|info| info.playing),
            Ok(PlayMode::Play | PlayMode::Pause)
        );
        if let Err(e) = track.stop() {
            debug!("El track ya había terminado: {}", e);
        }
        live
    }

    async fn pause(&self, guild_id: GuildId) -> bool {
        match self.tracks.get(&guild_id) {
            Some(track) => track.pause().is_ok(),
            None => false,
        }
    }

    async fn resume(&self, guild_id: GuildId) -> bool {
        match self.tracks.get(&guild_id) {
            Some(track) => track.play().is_ok(),
            None => false,
        }
    }

    async fn state(&self, guild_id: GuildId) -> TransportState {
        let Some(track) = self.tracks.get(&guild_id).map(|t| t.clone()) else {
            return TransportState::Idle;
        };
        match track.get_info().await.map(|info| info.playing) {
            Ok(PlayMode::Play) => TransportState::Playing,
            Ok(PlayMode::Pause) => TransportState::Paused,
            _ => TransportState::Idle,
        }
    }

    fn connected_guilds(&self) -> Vec<GuildId> {
        self.joined.iter().map(|g| *g).collect()
    }
}

/// Handler para cuando termina una canción
struct TrackFinished {
    guild_id: GuildId,
    token: PlaybackToken,
    events: UnboundedSender<PlaybackEvent>,
}

#[async_trait]
impl VoiceEventHandler for TrackFinished {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let error = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(format!("{e:?}")),
                _ => None,
            }),
            _ => None,
        };

        if let Some(e) = &error {
            error!("❌ Error de reproducción en guild {}: {}", self.guild_id, e);
        } else {
            debug!("Track terminado en guild {}", self.guild_id);
        }

        let event = PlaybackEvent {
            guild_id: self.guild_id,
            token: self.token,
            error,
        };
        if self.events.send(event).is_err() {
            warn!("El loop de eventos del reproductor ya terminó");
        }

        Some(Event::Cancel)
    }
}
