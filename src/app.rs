//! # Application Context
//!
//! Every long-lived component, built once at startup and shared by the event
//! handler and the command modules. Background work (playback events,
//! dashboard refreshes, maintenance, the module watcher) runs on a
//! [`TaskTracker`] and stops when [`AppContext::shutdown`] cancels the root
//! token.

use anyhow::{Context as _, Result};
use serenity::model::id::GuildId;
use songbird::Songbird;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{download::DownloadCoordinator, player::AudioPlayer, voice::SongbirdTransport},
    bot::{modules, platform::SerenityPlatform},
    cache::{self, AudioCache, MemoryStore, StagingDir},
    config::Config,
    dashboard::DashboardSync,
    platform::{ChatPlatform, Presence},
    reloader::ModuleReloader,
    sources::ytdlp::YtDlpResolver,
    storage::JsonStorage,
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct AppContext {
    pub config: Arc<Config>,
    pub storage: Arc<Mutex<JsonStorage>>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<AudioCache>,
    pub resolver: Arc<YtDlpResolver>,
    pub downloads: Arc<DownloadCoordinator>,
    pub player: Arc<AudioPlayer>,
    pub dashboard: Arc<DashboardSync>,
    pub reloader: Arc<ModuleReloader>,
    pub platform: Arc<SerenityPlatform>,
    pub voice: Arc<SongbirdTransport>,
    pub tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl AppContext {
    /// Construye los componentes y arranca las tareas de fondo.
    ///
    /// Solo falla si no se puede inicializar el almacenamiento o el directorio de staging.
    pub async fn build(
        config: Config,
        songbird: Arc<Songbird>,
        dev_guild: Option<GuildId>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        let storage = JsonStorage::new(config.data_dir.clone())
            .await
            .context("no se pudo inicializar el almacenamiento")?;
        let storage = Arc::new(Mutex::new(storage));

        let staging = StagingDir::create(&config.staging_dir)
            .with_context(|| format!("no se pudo crear {}", config.staging_dir.display()))?;
        match staging.purge().await {
            Ok(0) => {}
            Ok(n) => info!("🧹 {} archivos temporales de una ejecución anterior eliminados", n),
            Err(e) => warn!("No se pudo limpiar el staging: {}", e),
        }

        let store = Arc::new(MemoryStore::new(config.store_policy()));
        let cache = Arc::new(AudioCache::new(store.clone(), staging, config.write_retry()));
        let resolver = Arc::new(YtDlpResolver::new(config.ytdlp_path.clone()));
        let downloads = Arc::new(DownloadCoordinator::new(
            resolver.clone(),
            cache.clone(),
            config.download_timing(),
        ));

        let platform = Arc::new(SerenityPlatform::new(dev_guild));
        let voice = Arc::new(SongbirdTransport::new(songbird));
        let (player, playback_events) = AudioPlayer::new(
            cache.clone(),
            voice.clone(),
            platform.clone(),
            config.player_settings(),
        );
        let dashboard = Arc::new(DashboardSync::new(
            storage.clone(),
            platform.clone(),
            player.clone(),
            config.dashboard_settle(),
        ));

        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let reloader = Arc::new(ModuleReloader::new(
            config.modules_dir.clone(),
            modules::factories(),
            platform.clone(),
            config.watch_debounce(),
            tasks.clone(),
            shutdown.clone(),
        ));

        tasks.spawn(
            player
                .clone()
                .run_events(playback_events, shutdown.child_token()),
        );
        tasks.spawn(
            dashboard
                .clone()
                .run_refresh_loop(player.subscribe(), shutdown.child_token()),
        );
        tasks.spawn(maintenance(
            store.clone(),
            resolver.clone(),
            shutdown.child_token(),
        ));

        info!("{}", config.summary());

        Ok(Arc::new(Self {
            config,
            storage,
            store,
            cache,
            resolver,
            downloads,
            player,
            dashboard,
            reloader,
            platform,
            voice,
            tasks,
            shutdown,
        }))
    }

    /// Apagado ordenado: voz, archivos temporales, almacenamiento y por último las tareas.
    pub async fn shutdown(&self) {
        info!("⚠️ Apagando...");
        self.platform.set_presence(Presence::ShuttingDown).await;

        self.player.shutdown().await;

        match self.cache.staging().purge().await {
            Ok(n) => debug!("{} archivos de staging eliminados", n),
            Err(e) => warn!("No se pudo limpiar el staging: {}", e),
        }

        if let Err(e) = self.storage.lock().await.close().await {
            error!("❌ Error cerrando el almacenamiento: {}", e);
        }

        self.reloader.stop_watching().await;
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        info!("👋 Apagado completo");
    }
}

/// Limpieza periódica del caché y verificación de yt-dlp.
async fn maintenance(store: Arc<MemoryStore>, resolver: Arc<YtDlpResolver>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    // el primer tick es inmediato
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        cache::cleanup_expired(&store);

        match resolver.version().await {
            Ok(version) => debug!("yt-dlp {}", version),
            Err(e) => warn!("⚠️ yt-dlp no responde: {}", e),
        }

        info!("🧹 Tareas de mantenimiento completadas");
    }
}
