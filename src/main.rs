use anyhow::Result;
use clap::Parser;
use serenity::{
    model::{gateway::GatewayIntents, id::GuildId},
    Client,
};
use songbird::{SerenityInit, Songbird};
use tracing::{error, info};

mod app;
mod audio;
mod bot;
mod cache;
mod config;
mod dashboard;
mod platform;
mod reloader;
mod sources;
mod storage;
mod ui;

use crate::app::AppContext;
use crate::bot::Bot;
use crate::config::Config;
use crate::sources::ytdlp::YtDlpResolver;

#[derive(Parser, Debug)]
#[command(version, about = "Bot de música con dashboard persistente")]
struct Cli {
    /// Registra los comandos solo en GUILD_ID (desarrollo)
    #[arg(short, long)]
    guild: bool,

    /// Verifica las dependencias externas y sale
    #[arg(long)]
    health_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("opal_bot=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Opal v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    if cli.health_check {
        return health_check(&config).await;
    }

    let dev_guild = if cli.guild {
        match config.guild_id {
            Some(id) => Some(GuildId::new(id)),
            None => anyhow::bail!("--guild requiere GUILD_ID"),
        }
    } else {
        None
    };

    let token = config.discord_token.clone();
    let songbird = Songbird::serenity();
    let app = AppContext::build(config, songbird.clone(), dev_guild).await?;

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES;

    let mut client = Client::builder(&token, intents)
        .event_handler(Bot::new(app.clone()))
        .register_songbird_with(songbird)
        .await?;

    let shard_manager = client.shard_manager.clone();

    info!("🚀 Bot iniciado exitosamente");
    tokio::select! {
        result = client.start() => {
            if let Err(why) = result {
                error!("Error al ejecutar cliente: {:?}", why);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("⚠️ Señal de shutdown recibida, cerrando...");
        }
    }

    app.shutdown().await;
    shard_manager.shutdown_all().await;

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let version = YtDlpResolver::new(config.ytdlp_path.clone())
        .version()
        .await?;
    info!("yt-dlp {}", version);
    println!("OK");
    Ok(())
}
