//! # Command Modules
//!
//! Built-in slash command groups. Each one is selected by a directory of the
//! same name under `MODULES_DIR` and rebuilt from its `module.json` on reload.

use anyhow::{Context as _, Result};
use serenity::{
    all::{CommandInteraction, ComponentInteraction, Context},
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        EditInteractionResponse,
    },
    model::id::{ChannelId, GuildId, UserId},
};
use std::collections::HashMap;
use tracing::warn;

use crate::{reloader::ModuleFactory, ui::embeds};

pub mod admin;
pub mod dashboard;
pub mod music;
pub mod text;
pub mod voice;

/// Módulos compilados, por nombre de directorio.
pub fn factories() -> HashMap<&'static str, ModuleFactory> {
    let mut factories: HashMap<&'static str, ModuleFactory> = HashMap::new();
    factories.insert("admin", admin::factory);
    factories.insert("dashboard", dashboard::factory);
    factories.insert("music", music::factory);
    factories.insert("text", text::factory);
    factories.insert("voice", voice::factory);
    factories
}

pub fn require_guild(command: &CommandInteraction) -> Result<GuildId> {
    command
        .guild_id
        .context("Este comando solo funciona dentro de un servidor")
}

pub fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

pub fn bool_option(command: &CommandInteraction, name: &str) -> Option<bool> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_bool())
}

pub fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

/// Canal de voz en el que está el usuario, según la caché.
pub fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|state| state.channel_id)
}

pub async fn respond(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

pub async fn respond_text(ctx: &Context, command: &CommandInteraction, content: impl Into<String>) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(content),
            ),
        )
        .await?;
    Ok(())
}

pub async fn respond_ephemeral(
    ctx: &Context,
    command: &CommandInteraction,
    embed: CreateEmbed,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embed)
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}

/// Para comandos que pueden tardar más de 3 segundos.
pub async fn defer(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;
    Ok(())
}

/// Reemplaza la respuesta (diferida o no) por un embed, quitando componentes.
pub async fn edit_embed(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new()
                .content("")
                .embed(embed)
                .components(vec![]),
        )
        .await?;
    Ok(())
}

/// Respuesta efímera a un botón o menú.
pub async fn component_notice(
    ctx: &Context,
    component: &ComponentInteraction,
    content: impl Into<String>,
) -> Result<()> {
    component
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}

/// Informa un error al usuario, respondiendo o editando la respuesta existente.
pub async fn reply_error(ctx: &Context, command: &CommandInteraction, title: &str, description: &str) {
    let embed = embeds::error_embed(title, description);
    let created = command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embed.clone())
                    .ephemeral(true),
            ),
        )
        .await;

    if created.is_err() {
        if let Err(e) = edit_embed(ctx, command, embed).await {
            warn!("No se pudo informar el error de /{}: {}", command.data.name, e);
        }
    }
}
