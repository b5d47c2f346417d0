//! # Bot Module
//!
//! Serenity event handler. It owns nothing itself: every event is forwarded
//! to a component of the shared [`AppContext`].
//!
//! - `ready`: attaches the platform, loads command modules once, restores
//!   dashboards.
//! - `interaction_create`: slash commands are routed to the module that
//!   registered them; buttons and menus by the `<owner>:` prefix of their id.
//! - `message` / `message_delete`: keep the dashboard as the latest message.
//! - `voice_state_update`: cleans up when the bot is disconnected externally.

use serenity::{
    all::{
        ChannelId, CommandInteraction, ComponentInteraction, Context, EventHandler, Guild, GuildId,
        Interaction, Message, MessageId, Ready, UnavailableGuild, VoiceState,
    },
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

pub mod modules;
pub mod platform;

use crate::{
    app::AppContext,
    dashboard::SyncOutcome,
    platform::{ChatPlatform, Presence},
    ui::buttons::split_custom_id,
};

pub struct Bot {
    app: Arc<AppContext>,
    started: AtomicBool,
}

impl Bot {
    pub fn new(app: Arc<AppContext>) -> Self {
        Self {
            app,
            started: AtomicBool::new(false),
        }
    }

    /// Carga de módulos y restauración de dashboards; solo en el primer `ready`.
    async fn startup(&self) {
        match self.app.reloader.load_all().await {
            Ok(report) => {
                info!(
                    "📦 {} módulos cargados, {} con errores, {} comandos",
                    report.loaded.len(),
                    report.failed.len(),
                    report.synced
                );
            }
            Err(e) => error!("❌ No se pudieron cargar los módulos: {}", e),
        }

        if self.app.config.autoreload {
            if let Err(e) = self.app.reloader.start_watching() {
                error!("❌ No se pudo activar el auto-reload: {}", e);
            }
        }

        self.app.dashboard.restore_all().await;
        self.app.platform.set_presence(Presence::Idle).await;
    }

    async fn dispatch_command(&self, ctx: &Context, command: &CommandInteraction) {
        let name = command.data.name.as_str();

        let Some(module) = self.app.reloader.resolve(name) else {
            warn!("Comando /{} sin módulo cargado", name);
            modules::reply_error(ctx, command, "Comando no disponible", "Este comando no está cargado ahora mismo").await;
            return;
        };

        if self.app.reloader.is_admin_only(name) && !self.app.config.is_admin(command.user.id.get()) {
            modules::reply_error(ctx, command, "Sin permiso", "Solo los administradores del bot pueden usar este comando").await;
            return;
        }

        debug!("/{} de {} (módulo {})", name, command.user.name, module.name());
        if let Err(e) = module.handle(ctx, command, &self.app).await {
            error!("❌ Error manejando /{}: {:?}", name, e);
            modules::reply_error(ctx, command, "Error", &e.to_string()).await;
        }
    }

    async fn dispatch_component(&self, ctx: &Context, component: &ComponentInteraction) {
        let (owner, _) = split_custom_id(&component.data.custom_id);

        // el prefijo es un comando (`play:`) o un módulo (`dashboard:`)
        let module = self
            .app
            .reloader
            .resolve(owner)
            .or_else(|| self.app.reloader.module(owner));

        let handled = match module {
            Some(module) => module.handle_component(ctx, component, &self.app).await,
            None => Ok(false),
        };

        match handled {
            Ok(true) => {}
            Ok(false) => {
                debug!("Componente sin dueño: {}", component.data.custom_id);
                if let Err(e) = modules::component_notice(ctx, component, "⌛ Este control ya no está activo").await {
                    warn!("No se pudo responder al componente: {}", e);
                }
            }
            Err(e) => {
                error!("❌ Error manejando componente {}: {:?}", component.data.custom_id, e);
                let _ = modules::component_notice(ctx, component, format!("❌ {}", e)).await;
            }
        }
    }

    async fn channel_activity(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
        was_deleted: bool,
    ) {
        match self
            .app
            .dashboard
            .on_channel_activity(guild_id, channel_id, message_id, was_deleted)
            .await
        {
            Ok(SyncOutcome::Moved { from, to }) => {
                debug!("Dashboard reubicado en {}: {} -> {}", channel_id, from, to)
            }
            Ok(_) => {}
            Err(e) => warn!("No se pudo sincronizar el dashboard en {}: {}", channel_id, e),
        }
    }
}

#[async_trait]
impl EventHandler for Bot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);

        self.app.platform.attach(ctx.http.clone(), ctx.shard.clone());
        for guild in &ready.guilds {
            self.app.platform.add_guild(guild.id);
        }
        info!("📊 Conectado a {} servidores", self.app.platform.guild_count());

        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Reconexión: módulos y dashboards ya inicializados");
            return;
        }
        self.startup().await;
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        self.app.platform.add_guild(guild.id);
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        if !incomplete.unavailable {
            info!("👋 Removido del guild {}", incomplete.id);
            self.app.platform.remove_guild(incomplete.id);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(command) => self.dispatch_command(&ctx, &command).await,
            Interaction::Component(component) => self.dispatch_component(&ctx, &component).await,
            _ => {}
        }
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        if let Some(guild_id) = msg.guild_id {
            self.channel_activity(guild_id, msg.channel_id, msg.id, false)
                .await;
        }
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        guild_id: Option<GuildId>,
    ) {
        if let Some(guild_id) = guild_id {
            self.channel_activity(guild_id, channel_id, deleted_message_id, true)
                .await;
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        // el bot fue desconectado (kick, canal borrado o /leave)
        if let Some(guild_id) = new.guild_id {
            info!("🔌 Bot desconectado en guild {}", guild_id);
            self.app.player.stop(guild_id).await;
            self.app.voice.forget(guild_id);
        }
    }
}
