use anyhow::Result;
use async_trait::async_trait;
use serenity::all::{CommandInteraction, Context};
use std::{fmt::Write as _, sync::Arc};
use tracing::info;

use super::{defer, edit_embed, require_guild, respond_ephemeral};
use crate::{
    app::AppContext,
    platform::{ChatPlatform, CommandDescriptor, Presence},
    reloader::{CommandModule, LoadReport, ModuleManifest},
    ui::embeds,
};

pub struct AdminModule;

pub fn factory(_manifest: &ModuleManifest) -> Arc<dyn CommandModule> {
    Arc::new(AdminModule)
}

#[async_trait]
impl CommandModule for AdminModule {
    fn name(&self) -> &str {
        "admin"
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("check-persistent", "Estado del dashboard de este servidor").admin(),
            CommandDescriptor::new("storage-info", "Estadísticas de almacenamiento y caché").admin(),
            CommandDescriptor::new("reload-modules", "Recarga todos los módulos de comandos").admin(),
            CommandDescriptor::new("toggle-autoreload", "Activa o desactiva el auto-reload").admin(),
            CommandDescriptor::new("reload-status", "Estado de los módulos cargados").admin(),
            CommandDescriptor::new("clear-cache", "Vacía el caché de audio").admin(),
        ]
    }

    async fn handle(&self, ctx: &Context, command: &CommandInteraction, app: &AppContext) -> Result<()> {
        match command.data.name.as_str() {
            "check-persistent" => {
                let guild_id = require_guild(command)?;
                let record = app.storage.lock().await.dashboard_for_guild(guild_id);
                let embed = match record {
                    None => embeds::info_embed("Dashboard", "Este servidor no tiene dashboard"),
                    Some(record) => {
                        let latest = app.platform.latest_message_id(record.channel()).await;
                        let position = match latest {
                            Ok(Some(id)) if id == record.message() => "✅ Es el último mensaje",
                            Ok(_) => "⚠️ No es el último mensaje",
                            Err(_) => "❓ No se pudo leer el canal",
                        };
                        embeds::info_embed(
                            "Dashboard",
                            &format!(
                                "📍 Canal: <#{}>\n🆔 Mensaje: `{}`\n🕒 Actualizado: {}\n{}",
                                record.channel_id,
                                record.message_id,
                                record.last_updated.format("%Y-%m-%d %H:%M:%S UTC"),
                                position
                            ),
                        )
                    }
                };
                respond_ephemeral(ctx, command, embed).await
            }
            "storage-info" => {
                let (stats, servers) = {
                    let storage = app.storage.lock().await;
                    (storage.get_storage_stats().await?, storage.list_servers().len())
                };
                let description = format!(
                    "```\n{}\n🏠 Servidores registrados: {}\n\n🎧 Caché de audio: {} entradas, {:.1} / {:.1} MB\n```",
                    stats,
                    servers,
                    app.store.len(),
                    app.store.used_bytes() as f64 / (1024.0 * 1024.0),
                    app.store.capacity_bytes() as f64 / (1024.0 * 1024.0),
                );
                respond_ephemeral(ctx, command, embeds::info_embed("Almacenamiento", &description)).await
            }
            "reload-modules" => {
                defer(ctx, command).await?;
                app.platform
                    .set_presence(Presence::Reloading("módulos".to_string()))
                    .await;
                let report = app.reloader.load_all().await;
                app.platform.restore_presence().await;

                let embed = match report {
                    Ok(report) => {
                        info!("♻️ Recarga manual: {} módulos", report.loaded.len());
                        report_embed(&report)
                    }
                    Err(e) => embeds::error_embed("Recarga fallida", &e.to_string()),
                };
                edit_embed(ctx, command, embed).await
            }
            "toggle-autoreload" => {
                let embed = if app.reloader.is_watching() {
                    app.reloader.stop_watching().await;
                    embeds::success_embed("Auto-reload", "⏹️ Desactivado")
                } else {
                    match app.reloader.start_watching() {
                        Ok(()) => embeds::success_embed("Auto-reload", "👀 Activado"),
                        Err(e) => embeds::error_embed("Auto-reload", &e.to_string()),
                    }
                };
                respond_ephemeral(ctx, command, embed).await
            }
            "reload-status" => {
                let mut description = format!(
                    "**Auto-reload:** {}\n**Directorio:** `{}`\n\n",
                    if app.reloader.is_watching() { "activado" } else { "desactivado" },
                    app.reloader.root().display()
                );
                for module in app.reloader.loaded_modules() {
                    let commands: Vec<String> = app
                        .reloader
                        .registered_for(&module)
                        .into_iter()
                        .map(|c| format!("`/{c}`"))
                        .collect();
                    let _ = writeln!(description, "📦 **{}**: {}", module, commands.join(" "));
                }
                if let Some(last) = app.reloader.last_reload() {
                    let _ = write!(
                        description,
                        "\n**Última recarga:** {} ({}) {}",
                        last.module,
                        last.at.format("%H:%M:%S"),
                        match &last.error {
                            Some(e) => format!("❌ {e}"),
                            None => "✅".to_string(),
                        }
                    );
                }
                respond_ephemeral(ctx, command, embeds::info_embed("Módulos", &description)).await
            }
            "clear-cache" => {
                let removed = app.cache.clear().await?;
                info!("🧹 Caché vaciado por {}: {} entradas", command.user.name, removed);
                respond_ephemeral(
                    ctx,
                    command,
                    embeds::success_embed("Caché vaciado", &format!("{} entradas eliminadas", removed)),
                )
                .await
            }
            other => anyhow::bail!("comando desconocido: {other}"),
        }
    }
}

fn report_embed(report: &LoadReport) -> serenity::builder::CreateEmbed {
    let mut description = format!(
        "✅ Cargados: {}\n🔄 Comandos sincronizados: {}",
        if report.loaded.is_empty() {
            "ninguno".to_string()
        } else {
            report.loaded.join(", ")
        },
        report.synced
    );
    for (module, error) in &report.failed {
        let _ = write!(description, "\n❌ **{}**: {}", module, error);
    }

    if report.failed.is_empty() {
        embeds::success_embed("Módulos recargados", &description)
    } else {
        embeds::warning_embed("Módulos recargados con errores", &description)
    }
}
