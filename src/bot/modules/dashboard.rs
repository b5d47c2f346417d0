use anyhow::Result;
use async_trait::async_trait;
use serenity::{
    all::{CommandInteraction, ComponentInteraction, Context},
    builder::{
        CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::id::{ChannelId, GuildId},
};
use std::sync::Arc;
use tracing::{info, warn};

use super::{component_notice, edit_embed, require_guild, respond, respond_ephemeral, user_voice_channel};
use crate::{
    app::AppContext,
    audio::{
        player::SkipOutcome,
        voice::{TransportState, VoiceTransport},
    },
    dashboard::DashboardPlan,
    platform::{ChatPlatform, CommandDescriptor, PlatformError},
    reloader::{CommandModule, ModuleManifest},
    ui::{
        buttons::{self, button_ids, split_custom_id},
        embeds,
    },
};

pub struct DashboardModule;

pub fn factory(_manifest: &ModuleManifest) -> Arc<dyn CommandModule> {
    Arc::new(DashboardModule)
}

#[async_trait]
impl CommandModule for DashboardModule {
    fn name(&self) -> &str {
        "dashboard"
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("set-dashboard", "Instala el dashboard en este canal").admin(),
            CommandDescriptor::new("remove-dashboard", "Quita el dashboard del servidor").admin(),
        ]
    }

    async fn handle(&self, ctx: &Context, command: &CommandInteraction, app: &AppContext) -> Result<()> {
        let guild_id = require_guild(command)?;
        match command.data.name.as_str() {
            "set-dashboard" => self.set_dashboard(ctx, command, app, guild_id).await,
            "remove-dashboard" => {
                let Some(record) = app.dashboard.remove_dashboard(guild_id).await? else {
                    return respond_ephemeral(
                        ctx,
                        command,
                        embeds::info_embed("Sin dashboard", "Este servidor no tiene dashboard"),
                    )
                    .await;
                };
                match app.platform.delete_message(record.channel(), record.message()).await {
                    Ok(()) | Err(PlatformError::NotFound) => {}
                    Err(e) => warn!("No se pudo borrar el dashboard {}: {}", record.message_id, e),
                }
                info!("📌 Dashboard quitado del guild {}", guild_id);
                respond(
                    ctx,
                    command,
                    embeds::success_embed("Dashboard quitado", &format!("Estaba en <#{}>", record.channel_id)),
                )
                .await
            }
            other => anyhow::bail!("comando desconocido: {other}"),
        }
    }

    async fn handle_component(
        &self,
        ctx: &Context,
        component: &ComponentInteraction,
        app: &AppContext,
    ) -> Result<bool> {
        let (owner, action) = split_custom_id(&component.data.custom_id);
        match owner {
            "dashboard" => {}
            "set-dashboard" => {
                component_notice(ctx, component, "⌛ Esta confirmación expiró").await?;
                return Ok(true);
            }
            _ => return Ok(false),
        }

        let Some(guild_id) = component.guild_id else {
            return Ok(true);
        };

        let notice: Option<String> = match action {
            "playpause" => match app.player.state(guild_id).await {
                TransportState::Paused => (!app.player.resume(guild_id).await)
                    .then(|| "❌ No se pudo reanudar".to_string()),
                TransportState::Playing => (!app.player.pause(guild_id).await)
                    .then(|| "❌ No se pudo pausar".to_string()),
                TransportState::Idle => Some("😴 No hay nada sonando".to_string()),
            },
            "skip" => match app.player.skip(guild_id).await {
                SkipOutcome::NothingPlaying => Some("❌ No hay nada sonando".to_string()),
                SkipOutcome::AlreadySkipping => Some("⏳ Ya se está saltando".to_string()),
                SkipOutcome::Skipped(_) => None,
            },
            "join" => match user_voice_channel(ctx, guild_id, component.user.id) {
                Some(channel_id) => app
                    .voice
                    .join(guild_id, channel_id)
                    .await
                    .err()
                    .map(|e| format!("❌ {}", e)),
                None => Some("❌ Primero entra a un canal de voz".to_string()),
            },
            "refresh" => {
                app.dashboard.refresh(guild_id).await?;
                None
            }
            _ => Some("❓ Acción desconocida".to_string()),
        };

        match notice {
            Some(text) => component_notice(ctx, component, text).await?,
            None => {
                component
                    .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
                    .await?
            }
        }
        Ok(true)
    }
}

impl DashboardModule {
    async fn set_dashboard(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        app: &AppContext,
        guild_id: GuildId,
    ) -> Result<()> {
        let channel_id = command.channel_id;

        match app.dashboard.plan_set(guild_id, channel_id).await {
            DashboardPlan::AlreadyHere => {
                return respond_ephemeral(
                    ctx,
                    command,
                    embeds::info_embed("Nada que hacer", "El dashboard ya está en este canal"),
                )
                .await;
            }
            DashboardPlan::Create => {
                respond_ephemeral(ctx, command, embeds::info_embed("Dashboard", "⏳ Instalando…")).await?;
            }
            DashboardPlan::NeedsConfirmation(existing) => {
                command
                    .create_response(
                        &ctx.http,
                        CreateInteractionResponse::Message(
                            CreateInteractionResponseMessage::new()
                                .embed(embeds::warning_embed(
                                    "Ya hay un dashboard",
                                    &format!(
                                        "El dashboard está en <#{}>. ¿Moverlo a este canal?",
                                        existing.channel_id
                                    ),
                                ))
                                .components(vec![buttons::move_confirmation_controls()])
                                .ephemeral(true),
                        ),
                    )
                    .await?;

                if !self.await_confirmation(ctx, command, app).await? {
                    return Ok(());
                }
            }
        }

        self.install(ctx, command, app, guild_id, channel_id).await
    }

    /// `true` solo si se apretó "confirmar" antes del timeout.
    async fn await_confirmation(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        app: &AppContext,
    ) -> Result<bool> {
        let message = command.get_response(&ctx.http).await?;
        let choice = message
            .await_component_interaction(&ctx.shard)
            .author_id(command.user.id)
            .timeout(app.config.confirm_timeout())
            .await;

        let confirmed = choice
            .as_ref()
            .is_some_and(|c| c.data.custom_id == button_ids::CONFIRM_MOVE);

        if let Some(choice) = &choice {
            choice
                .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
                .await?;
        }

        if !confirmed {
            let text = if choice.is_some() {
                "❌ Cancelado, el dashboard queda donde estaba"
            } else {
                "⌛ Sin respuesta, el dashboard queda donde estaba"
            };
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new()
                        .content(text)
                        .embeds(vec![])
                        .components(vec![]),
                )
                .await?;
        }
        Ok(confirmed)
    }

    async fn install(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        app: &AppContext,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<()> {
        let guild_name = guild_id.name(&ctx.cache);
        let channel_name = command.channel.as_ref().and_then(|c| c.name.clone());

        let embed = match app
            .dashboard
            .set_dashboard(guild_id, channel_id, guild_name.as_deref(), channel_name.as_deref())
            .await
        {
            Ok(_) => embeds::success_embed("Dashboard instalado", &format!("Vive en <#{}>", channel_id)),
            Err(e) => embeds::error_embed("No se pudo instalar el dashboard", &e.to_string()),
        };
        edit_embed(ctx, command, embed).await
    }
}
