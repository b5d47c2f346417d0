use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use serenity::{
    all::{CommandInteraction, ComponentInteraction, ComponentInteractionDataKind, Context},
    builder::{
        CreateAttachment, CreateInteractionResponse, CreateInteractionResponseFollowup,
        EditInteractionResponse,
    },
    model::id::GuildId,
};
use std::sync::Arc;
use tracing::{error, info};

use super::{
    bool_option, component_notice, defer, edit_embed, int_option, require_guild, respond,
    respond_text, string_option, user_voice_channel,
};
use crate::{
    app::AppContext,
    audio::{
        player::{Enqueued, SkipOutcome},
        queue::QueueItem,
    },
    platform::{CommandDescriptor, OptionKind},
    reloader::{CommandModule, ModuleManifest},
    sources::{extract_video_id, is_url, watch_url, VideoResolver},
    ui::{
        buttons::{self, split_custom_id},
        embeds,
    },
};

/// Límite de adjuntos de Discord para servidores sin boost.
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

pub struct MusicModule {
    search_results: Option<usize>,
}

pub fn factory(manifest: &ModuleManifest) -> Arc<dyn CommandModule> {
    Arc::new(MusicModule {
        search_results: manifest.setting("search_results"),
    })
}

#[async_trait]
impl CommandModule for MusicModule {
    fn name(&self) -> &str {
        "music"
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("play", "Reproduce audio de YouTube")
                .option(
                    OptionKind::String,
                    "url",
                    "URL de YouTube o texto para buscar",
                    true,
                )
                .option(
                    OptionKind::Boolean,
                    "give_me_file",
                    "Además enviar el archivo de audio",
                    false,
                ),
            CommandDescriptor::new("skip", "Salta la canción actual"),
            CommandDescriptor::new("queue", "Muestra la cola").option(
                OptionKind::Integer,
                "page",
                "Página de la cola",
                false,
            ),
            CommandDescriptor::new("pause", "Pausa la reproducción"),
            CommandDescriptor::new("resume", "Reanuda la reproducción"),
            CommandDescriptor::new("stop", "Detiene la música y vacía la cola"),
            CommandDescriptor::new("nowplaying", "Muestra la canción actual"),
        ]
    }

    async fn handle(&self, ctx: &Context, command: &CommandInteraction, app: &AppContext) -> Result<()> {
        let guild_id = require_guild(command)?;
        match command.data.name.as_str() {
            "play" => self.play(ctx, command, app, guild_id).await,
            "skip" => {
                let reply = match app.player.skip(guild_id).await {
                    SkipOutcome::NothingPlaying => "❌ No hay nada sonando".to_string(),
                    SkipOutcome::AlreadySkipping => "⏳ Ya se está saltando esta canción".to_string(),
                    SkipOutcome::Skipped(item) => format!("⏭️ Saltada: **{}**", item.title),
                };
                respond_text(ctx, command, reply).await
            }
            "queue" => {
                let page = int_option(command, "page").unwrap_or(1).max(1) as usize;
                let info = app.player.queue_info(guild_id).await;
                respond(ctx, command, embeds::queue_embed(&info, page)).await
            }
            "pause" => {
                let reply = if app.player.pause(guild_id).await {
                    "⏸️ Reproducción pausada"
                } else {
                    "❌ No hay nada sonando para pausar"
                };
                respond_text(ctx, command, reply).await
            }
            "resume" => {
                let reply = if app.player.resume(guild_id).await {
                    "▶️ Reproducción reanudada"
                } else {
                    "❌ No hay nada en pausa"
                };
                respond_text(ctx, command, reply).await
            }
            "stop" => {
                let reply = if app.player.stop(guild_id).await {
                    "⏹️ Música detenida y cola vaciada"
                } else {
                    "❌ No había nada sonando"
                };
                respond_text(ctx, command, reply).await
            }
            "nowplaying" => match app.player.now_playing(guild_id).await {
                Some(item) => respond(ctx, command, embeds::now_playing_embed(&item)).await,
                None => respond_text(ctx, command, "😴 No hay nada sonando").await,
            },
            other => anyhow::bail!("comando desconocido: {other}"),
        }
    }

    async fn handle_component(
        &self,
        ctx: &Context,
        component: &ComponentInteraction,
        _app: &AppContext,
    ) -> Result<bool> {
        // los menús activos los atiende el collector; lo que llega aquí ya expiró
        let (owner, _) = split_custom_id(&component.data.custom_id);
        if owner != "play" {
            return Ok(false);
        }
        component_notice(ctx, component, "⌛ Esta búsqueda expiró, usa `/play` de nuevo").await?;
        Ok(true)
    }
}

impl MusicModule {
    async fn play(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        app: &AppContext,
        guild_id: GuildId,
    ) -> Result<()> {
        let query = string_option(command, "url")
            .context("Falta la URL o el texto a buscar")?
            .trim()
            .to_string();
        let give_me_file = bool_option(command, "give_me_file").unwrap_or(false);

        let Some(voice_channel) = user_voice_channel(ctx, guild_id, command.user.id) else {
            return respond(
                ctx,
                command,
                embeds::error_embed("Sin canal de voz", "Primero tienes que entrar a un canal de voz"),
            )
            .await;
        };

        info!("🎵 /play de {}: {}", command.user.name, query);
        defer(ctx, command).await?;

        let video_id = match extract_video_id(&query) {
            Some(id) => id,
            None if is_url(&query) => {
                return edit_embed(
                    ctx,
                    command,
                    embeds::error_embed("URL no soportada", "Solo se aceptan enlaces de YouTube"),
                )
                .await;
            }
            None => match self.pick_search_result(ctx, command, app, &query).await? {
                Some(id) => id,
                None => return Ok(()),
            },
        };
        let url = watch_url(&video_id);

        command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new()
                    .content(format!("⏬ Preparando `{}`…", video_id))
                    .embeds(vec![])
                    .components(vec![]),
            )
            .await?;

        let audio = match app.downloads.ensure_cached(&video_id, &url).await {
            Ok(audio) => audio,
            Err(e) => {
                error!("❌ Falló la descarga de {} (fase {}): {}", video_id, e.phase(), e);
                return edit_embed(
                    ctx,
                    command,
                    embeds::error_embed("No se pudo descargar", &e.to_string()),
                )
                .await;
            }
        };

        let item = QueueItem {
            video_id,
            title: audio.title.clone(),
            requested_by: command.user.name.clone(),
            url,
            duration: None,
            voice_channel,
            announce_channel: Some(command.channel_id),
            added_at: Utc::now(),
        };

        let reply = match app.player.enqueue(guild_id, item.clone()).await {
            Ok(Enqueued::Started(item)) => {
                embeds::success_embed("Empezando", &format!("▶️ **{}**", item.title))
            }
            Ok(Enqueued::Queued { position }) => embeds::track_queued_embed(&item, position),
            Err(e) => embeds::error_embed("No se pudo reproducir", &e.to_string()),
        };
        edit_embed(ctx, command, reply).await?;

        if give_me_file {
            let followup = if audio.bytes.len() > MAX_UPLOAD_BYTES {
                CreateInteractionResponseFollowup::new()
                    .content("📦 El archivo es demasiado grande para Discord")
            } else {
                let attachment = CreateAttachment::bytes(
                    audio.bytes.to_vec(),
                    format!("{}.m4a", file_name(&audio.title)),
                );
                CreateInteractionResponseFollowup::new().add_file(attachment)
            };
            command.create_followup(&ctx.http, followup).await?;
        }

        Ok(())
    }

    /// Muestra los resultados y espera la elección del usuario.
    async fn pick_search_result(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        app: &AppContext,
        query: &str,
    ) -> Result<Option<String>> {
        let limit = self.search_results.unwrap_or(app.config.search_results);
        let results = app.resolver.search(query, limit).await?;
        if results.is_empty() {
            edit_embed(
                ctx,
                command,
                embeds::warning_embed("Sin resultados", &format!("Nada encontrado para \"{}\"", query)),
            )
            .await?;
            return Ok(None);
        }

        let message = command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new()
                    .embed(embeds::search_results_embed(query, &results))
                    .components(vec![buttons::search_menu(&results)]),
            )
            .await?;

        let choice = message
            .await_component_interaction(&ctx.shard)
            .author_id(command.user.id)
            .timeout(app.config.confirm_timeout())
            .await;

        let Some(choice) = choice else {
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new()
                        .content("⌛ Se acabó el tiempo para elegir")
                        .embeds(vec![])
                        .components(vec![]),
                )
                .await?;
            return Ok(None);
        };

        choice
            .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
            .await?;

        match &choice.data.kind {
            ComponentInteractionDataKind::StringSelect { values } => Ok(values.first().cloned()),
            _ => Ok(None),
        }
    }
}

/// Nombre de archivo sin separadores de ruta ni caracteres problemáticos.
fn file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    match cleaned.trim() {
        "" => "audio".to_string(),
        name => name.to_string(),
    }
}
