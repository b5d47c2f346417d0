use anyhow::Result;
use async_trait::async_trait;
use serenity::all::{CommandInteraction, Context};
use std::sync::Arc;

use super::{require_guild, respond, respond_text, user_voice_channel};
use crate::{
    app::AppContext,
    audio::voice::VoiceTransport,
    platform::CommandDescriptor,
    reloader::{CommandModule, ModuleManifest},
    ui::embeds,
};

pub struct VoiceModule;

pub fn factory(_manifest: &ModuleManifest) -> Arc<dyn CommandModule> {
    Arc::new(VoiceModule)
}

#[async_trait]
impl CommandModule for VoiceModule {
    fn name(&self) -> &str {
        "voice"
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("join", "Entra a tu canal de voz"),
            CommandDescriptor::new("leave", "Sale del canal de voz"),
        ]
    }

    async fn handle(&self, ctx: &Context, command: &CommandInteraction, app: &AppContext) -> Result<()> {
        let guild_id = require_guild(command)?;

        match command.data.name.as_str() {
            "join" => {
                let Some(channel_id) = user_voice_channel(ctx, guild_id, command.user.id) else {
                    return respond(
                        ctx,
                        command,
                        embeds::error_embed("Sin canal de voz", "Primero entra a un canal de voz"),
                    )
                    .await;
                };
                match app.voice.join(guild_id, channel_id).await {
                    Ok(()) => respond_text(ctx, command, format!("🔊 Conectado a <#{}>", channel_id)).await,
                    Err(e) => respond(ctx, command, embeds::error_embed("No pude entrar", &e.to_string())).await,
                }
            }
            "leave" => {
                if !app.voice.connected_guilds().contains(&guild_id) {
                    return respond_text(ctx, command, "❌ No estoy en un canal de voz").await;
                }
                app.player.disconnect(guild_id).await?;
                respond_text(ctx, command, "👋 Salí del canal de voz").await
            }
            other => anyhow::bail!("comando desconocido: {other}"),
        }
    }
}
