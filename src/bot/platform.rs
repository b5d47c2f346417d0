use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serenity::{
    builder::{CreateCommand, CreateCommandOption, CreateMessage, EditMessage, GetMessages},
    gateway::{ActivityData, ShardMessenger},
    http::{Http, HttpError},
    model::{
        application::CommandOptionType,
        id::{ChannelId, GuildId, MessageId},
        user::OnlineStatus,
    },
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    audio::queue::QueueItem,
    platform::{
        ChatPlatform, CommandDescriptor, DashboardSnapshot, OptionKind, PlatformError, Presence,
    },
    ui::{buttons, embeds},
};

#[derive(Clone)]
struct Attached {
    http: Arc<Http>,
    shard: ShardMessenger,
}

/// [`ChatPlatform`] sobre serenity. Queda operativo después del evento `ready`.
pub struct SerenityPlatform {
    attached: RwLock<Option<Attached>>,
    guilds: DashSet<GuildId>,
    /// Si está definido, los comandos solo se registran en este guild.
    dev_guild: Option<GuildId>,
    base_presence: Mutex<Presence>,
}

impl SerenityPlatform {
    pub fn new(dev_guild: Option<GuildId>) -> Self {
        Self {
            attached: RwLock::new(None),
            guilds: DashSet::new(),
            dev_guild,
            base_presence: Mutex::new(Presence::Idle),
        }
    }

    pub fn attach(&self, http: Arc<Http>, shard: ShardMessenger) {
        *self.attached.write() = Some(Attached { http, shard });
    }

    pub fn add_guild(&self, guild_id: GuildId) {
        self.guilds.insert(guild_id);
    }

    pub fn remove_guild(&self, guild_id: GuildId) {
        self.guilds.remove(&guild_id);
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }

    fn http(&self) -> Result<Arc<Http>, PlatformError> {
        self.attached
            .read()
            .as_ref()
            .map(|a| a.http.clone())
            .ok_or(PlatformError::NotReady)
    }

    fn apply_presence(&self, presence: &Presence) {
        let Some(attached) = self.attached.read().clone() else {
            debug!("Presencia ignorada, todavía sin conexión: {:?}", presence);
            return;
        };

        let (activity, status) = match presence {
            Presence::Idle => (ActivityData::listening("/play"), OnlineStatus::Online),
            Presence::Reloading(module) => (
                ActivityData::playing(format!("♻️ recargando {module}")),
                OnlineStatus::Idle,
            ),
            Presence::Playing { title, .. } => {
                (ActivityData::listening(title.clone()), OnlineStatus::Online)
            }
            Presence::ShuttingDown => {
                (ActivityData::playing("apagando…"), OnlineStatus::DoNotDisturb)
            }
        };
        attached.shard.set_presence(Some(activity), status);
    }
}

fn to_create_command(descriptor: &CommandDescriptor) -> CreateCommand {
    descriptor.options.iter().fold(
        CreateCommand::new(&descriptor.name).description(&descriptor.description),
        |command, option| {
            let kind = match option.kind {
                OptionKind::String => CommandOptionType::String,
                OptionKind::Boolean => CommandOptionType::Boolean,
                OptionKind::Integer => CommandOptionType::Integer,
            };
            command.add_option(
                CreateCommandOption::new(kind, &option.name, &option.description)
                    .required(option.required),
            )
        },
    )
}

fn map_error(e: serenity::Error) -> PlatformError {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &e {
        match response.status_code.as_u16() {
            404 => return PlatformError::NotFound,
            403 => return PlatformError::Forbidden,
            _ => {}
        }
    }
    PlatformError::Http(e.to_string())
}

#[async_trait]
impl ChatPlatform for SerenityPlatform {
    async fn sync_commands(&self, commands: &[CommandDescriptor]) -> Result<usize, PlatformError> {
        let http = self.http()?;
        let targets: Vec<GuildId> = match self.dev_guild {
            Some(guild_id) => vec![guild_id],
            None => self.guilds.iter().map(|g| *g).collect(),
        };

        if targets.is_empty() {
            warn!("⚠️ No hay guilds donde registrar comandos");
            return Ok(0);
        }

        let mut first_error = None;
        let mut synced = 0;
        for guild_id in targets {
            let create: Vec<CreateCommand> = commands.iter().map(to_create_command).collect();
            match guild_id.set_commands(&http, create).await {
                Ok(registered) => {
                    debug!("{} comandos registrados en guild {}", registered.len(), guild_id);
                    synced = registered.len();
                }
                Err(e) => {
                    error!("❌ Error registrando comandos en guild {}: {}", guild_id, e);
                    first_error.get_or_insert(map_error(e));
                }
            }
        }

        match first_error {
            Some(e) if synced == 0 && !commands.is_empty() => Err(e),
            _ => {
                info!("✅ Comandos sincronizados ({})", commands.len());
                Ok(commands.len())
            }
        }
    }

    async fn set_presence(&self, presence: Presence) {
        if !matches!(presence, Presence::Reloading(_)) {
            *self.base_presence.lock() = presence.clone();
        }
        self.apply_presence(&presence);
    }

    async fn restore_presence(&self) {
        let base = self.base_presence.lock().clone();
        self.apply_presence(&base);
    }

    async fn send_dashboard(
        &self,
        channel: ChannelId,
        snapshot: &DashboardSnapshot,
    ) -> Result<MessageId, PlatformError> {
        let message = CreateMessage::new()
            .embed(embeds::dashboard_embed(snapshot))
            .components(buttons::dashboard_controls(snapshot));
        channel
            .send_message(&self.http()?, message)
            .await
            .map(|m| m.id)
            .map_err(map_error)
    }

    async fn edit_dashboard(
        &self,
        channel: ChannelId,
        message: MessageId,
        snapshot: &DashboardSnapshot,
    ) -> Result<(), PlatformError> {
        let edit = EditMessage::new()
            .embed(embeds::dashboard_embed(snapshot))
            .components(buttons::dashboard_controls(snapshot));
        channel
            .edit_message(&self.http()?, message, edit)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), PlatformError> {
        channel
            .delete_message(&self.http()?, message)
            .await
            .map_err(map_error)
    }

    async fn latest_message_id(
        &self,
        channel: ChannelId,
    ) -> Result<Option<MessageId>, PlatformError> {
        let messages = channel
            .messages(&self.http()?, GetMessages::new().limit(1))
            .await
            .map_err(map_error)?;
        Ok(messages.first().map(|m| m.id))
    }

    async fn announce_now_playing(
        &self,
        channel: ChannelId,
        item: &QueueItem,
    ) -> Result<(), PlatformError> {
        channel
            .send_message(
                &self.http()?,
                CreateMessage::new().embed(embeds::now_playing_embed(item)),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}
