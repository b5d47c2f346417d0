//! # Platform Module
//!
//! The narrow surface the bot needs from the chat platform: command
//! registration, presence, dashboard messages and announcements.
//! [`crate::bot::platform::SerenityPlatform`] implements it over Discord;
//! components only ever see [`ChatPlatform`].

use async_trait::async_trait;
use serenity::model::id::{ChannelId, MessageId};
use thiserror::Error;

use crate::audio::queue::QueueItem;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlatformError {
    #[error("recurso no encontrado")]
    NotFound,

    #[error("permisos insuficientes")]
    Forbidden,

    #[error("error HTTP: {0}")]
    Http(String),

    #[error("la conexión con Discord todavía no está lista")]
    NotReady,
}

/// Estado mostrado en la presencia del bot.
#[derive(Debug, Clone, PartialEq)]
pub enum Presence {
    Idle,
    Reloading(String),
    Playing { title: String, url: String },
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    String,
    Boolean,
    Integer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDescriptor {
    pub name: String,
    pub description: String,
    pub kind: OptionKind,
    pub required: bool,
}

/// Definición de un slash command, independiente de la librería de Discord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
    pub options: Vec<OptionDescriptor>,
    pub admin_only: bool,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            options: Vec::new(),
            admin_only: false,
        }
    }

    pub fn option(
        mut self,
        kind: OptionKind,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            description: description.into(),
            kind,
            required,
        });
        self
    }

    pub fn admin(mut self) -> Self {
        self.admin_only = true;
        self
    }
}

/// Lo que muestra el dashboard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardSnapshot {
    pub now_playing: Option<QueueItem>,
    pub up_next: Vec<QueueItem>,
    pub queued: usize,
    pub paused: bool,
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Reemplaza el conjunto remoto de comandos. Devuelve cuántos quedaron registrados.
    async fn sync_commands(&self, commands: &[CommandDescriptor]) -> Result<usize, PlatformError>;

    async fn set_presence(&self, presence: Presence);

    /// Vuelve a la última presencia que no era de recarga.
    async fn restore_presence(&self);

    async fn send_dashboard(
        &self,
        channel: ChannelId,
        snapshot: &DashboardSnapshot,
    ) -> Result<MessageId, PlatformError>;

    async fn edit_dashboard(
        &self,
        channel: ChannelId,
        message: MessageId,
        snapshot: &DashboardSnapshot,
    ) -> Result<(), PlatformError>;

    async fn delete_message(&self, channel: ChannelId, message: MessageId)
        -> Result<(), PlatformError>;

    async fn latest_message_id(&self, channel: ChannelId)
        -> Result<Option<MessageId>, PlatformError>;

    async fn announce_now_playing(
        &self,
        channel: ChannelId,
        item: &QueueItem,
    ) -> Result<(), PlatformError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::{collections::HashMap, sync::Arc};
    use tokio::sync::{Notify, Semaphore};

    /// Retiene `send_dashboard` en un canal hasta que el test libere un permiso.
    #[derive(Clone)]
    pub struct SendGate {
        pub channel: ChannelId,
        pub started: Arc<Notify>,
        pub release: Arc<Semaphore>,
    }

    impl SendGate {
        pub fn new(channel: ChannelId) -> Self {
            Self {
                channel,
                started: Arc::new(Notify::new()),
                release: Arc::new(Semaphore::new(0)),
            }
        }
    }

    /// Plataforma en memoria: cada canal es una lista ordenada de mensajes.
    #[derive(Default)]
    pub struct FakePlatform {
        pub channels: Mutex<HashMap<ChannelId, Vec<MessageId>>>,
        pub dashboards: Mutex<Vec<MessageId>>,
        pub edits: Mutex<Vec<MessageId>>,
        pub presences: Mutex<Vec<Presence>>,
        pub synced: Mutex<Vec<Vec<String>>>,
        pub announcements: Mutex<Vec<String>>,
        pub fail_deletes: Mutex<bool>,
        pub gate: Mutex<Option<SendGate>>,
        next_id: Mutex<u64>,
    }

    impl FakePlatform {
        fn allocate(&self) -> MessageId {
            let mut next = self.next_id.lock();
            *next += 1;
            MessageId::new(*next)
        }

        /// Simula un mensaje de un usuario.
        pub fn post(&self, channel: ChannelId) -> MessageId {
            let id = self.allocate();
            self.channels.lock().entry(channel).or_default().push(id);
            id
        }

        pub fn messages(&self, channel: ChannelId) -> Vec<MessageId> {
            self.channels.lock().get(&channel).cloned().unwrap_or_default()
        }

        pub fn last_presence(&self) -> Option<Presence> {
            self.presences.lock().last().cloned()
        }

        pub fn last_sync(&self) -> Option<Vec<String>> {
            self.synced.lock().last().cloned()
        }
    }

    #[async_trait]
    impl ChatPlatform for FakePlatform {
        async fn sync_commands(
            &self,
            commands: &[CommandDescriptor],
        ) -> Result<usize, PlatformError> {
            let mut names: Vec<String> = commands.iter().map(|c| c.name.clone()).collect();
            names.sort();
            self.synced.lock().push(names);
            Ok(commands.len())
        }

        async fn set_presence(&self, presence: Presence) {
            self.presences.lock().push(presence);
        }

        async fn restore_presence(&self) {
            let mut presences = self.presences.lock();
            let base = presences
                .iter()
                .rev()
                .find(|p| !matches!(p, Presence::Reloading(_)))
                .cloned()
                .unwrap_or(Presence::Idle);
            presences.push(base);
        }

        async fn send_dashboard(
            &self,
            channel: ChannelId,
            _snapshot: &DashboardSnapshot,
        ) -> Result<MessageId, PlatformError> {
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate.filter(|g| g.channel == channel) {
                gate.started.notify_one();
                let _permit = gate.release.acquire().await.unwrap();
            }
            let id = self.post(channel);
            self.dashboards.lock().push(id);
            Ok(id)
        }

        async fn edit_dashboard(
            &self,
            channel: ChannelId,
            message: MessageId,
            _snapshot: &DashboardSnapshot,
        ) -> Result<(), PlatformError> {
            if !self.messages(channel).contains(&message) {
                return Err(PlatformError::NotFound);
            }
            self.edits.lock().push(message);
            Ok(())
        }

        async fn delete_message(
            &self,
            channel: ChannelId,
            message: MessageId,
        ) -> Result<(), PlatformError> {
            if *self.fail_deletes.lock() {
                return Err(PlatformError::Forbidden);
            }
            let mut channels = self.channels.lock();
            let messages = channels.entry(channel).or_default();
            let before = messages.len();
            messages.retain(|m| *m != message);
            if messages.len() == before {
                return Err(PlatformError::NotFound);
            }
            Ok(())
        }

        async fn latest_message_id(
            &self,
            channel: ChannelId,
        ) -> Result<Option<MessageId>, PlatformError> {
            Ok(self.messages(channel).last().copied())
        }

        async fn announce_now_playing(
            &self,
            channel: ChannelId,
            item: &QueueItem,
        ) -> Result<(), PlatformError> {
            self.post(channel);
            self.announcements.lock().push(item.video_id.clone());
            Ok(())
        }
    }
}
