use dashmap::{DashMap, DashSet};
use serenity::model::id::GuildId;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        queue::{MusicQueue, QueueError, QueueInfo, QueueItem},
        voice::{PlaybackEvent, PlaybackToken, TransportError, TransportState, VoiceTransport},
    },
    cache::{AudioCache, CacheError, StagedFile},
    platform::{ChatPlatform, DashboardSnapshot, Presence},
};

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no se pudo reproducir ninguna canción de la cola")]
    NothingPlayable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// La cola estaba parada y empezó a sonar este item.
    Started(QueueItem),
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipOutcome {
    NothingPlaying,
    /// Ya hay un skip en curso para esta canción.
    AlreadySkipping,
    Skipped(QueueItem),
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerSettings {
    pub max_queue_size: usize,
    pub skip_grace: Duration,
    /// Tras este tiempo sin evento de fin, un skip pendiente se da por perdido.
    pub skip_timeout: Duration,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            skip_grace: Duration::from_millis(500),
            skip_timeout: Duration::from_secs(5),
        }
    }
}

struct NowPlaying {
    token: PlaybackToken,
    // se borra al terminar la canción
    _file: StagedFile,
    skip_requested: Option<Instant>,
    paused: bool,
}

impl NowPlaying {
    fn skip_in_flight(&self, timeout: Duration) -> bool {
        self.skip_requested.is_some_and(|at| at.elapsed() < timeout)
    }
}

struct Session {
    queue: MusicQueue,
    playing: Option<NowPlaying>,
}

/// Reproductor secuencial por guild.
///
/// El transporte avisa el fin de cada canción con un [`PlaybackEvent`]; el loop de
/// eventos borra el archivo de reproducción y pasa a la siguiente.
pub struct AudioPlayer {
    sessions: DashMap<GuildId, Arc<Mutex<Session>>>,
    active: DashSet<GuildId>,
    cache: Arc<AudioCache>,
    transport: Arc<dyn VoiceTransport>,
    platform: Arc<dyn ChatPlatform>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    changes: broadcast::Sender<GuildId>,
    next_token: AtomicU64,
    settings: PlayerSettings,
}

impl AudioPlayer {
    pub fn new(
        cache: Arc<AudioCache>,
        transport: Arc<dyn VoiceTransport>,
        platform: Arc<dyn ChatPlatform>,
        settings: PlayerSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(64);
        let player = Arc::new(Self {
            sessions: DashMap::new(),
            active: DashSet::new(),
            cache,
            transport,
            platform,
            events,
            changes,
            next_token: AtomicU64::new(1),
            settings,
        });
        (player, rx)
    }

    /// Consume los eventos de fin de canción hasta que se cancele.
    pub async fn run_events(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PlaybackEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.on_playback_finished(event).await,
                    None => break,
                },
            }
        }
        debug!("Loop de eventos del reproductor terminado");
    }

    /// Cambios de estado por guild, para refrescar el dashboard.
    pub fn subscribe(&self) -> broadcast::Receiver<GuildId> {
        self.changes.subscribe()
    }

    /// Agrega a la cola y arranca la reproducción si no suena nada.
    pub async fn enqueue(&self, guild_id: GuildId, item: QueueItem) -> Result<Enqueued, PlayerError> {
        let session = self.session(guild_id);
        let mut session = session.lock().await;

        let position = session.queue.push(item)?;

        if let Some(now) = &session.playing {
            let state = self.transport.state(guild_id).await;
            if now.skip_in_flight(self.settings.skip_timeout) || state != TransportState::Idle {
                drop(session);
                self.notify(guild_id);
                return Ok(Enqueued::Queued { position });
            }
            // el transporte terminó sin avisar; el token viejo queda obsoleto
            warn!("Transporte inactivo en guild {} con canción actual, avanzando", guild_id);
        }

        match self.advance(guild_id, &mut session).await {
            Some(item) => Ok(Enqueued::Started(item)),
            None => Err(PlayerError::NothingPlayable),
        }
    }

    /// Reproduce la siguiente canción de la cola.
    pub async fn play_next(&self, guild_id: GuildId) -> Option<QueueItem> {
        let session = self.session(guild_id);
        let mut session = session.lock().await;
        self.advance(guild_id, &mut session).await
    }

    pub async fn on_playback_finished(&self, event: PlaybackEvent) {
        let Some(session) = self.sessions.get(&event.guild_id).map(|s| s.clone()) else {
            return;
        };
        let mut session = session.lock().await;

        match &session.playing {
            Some(now) if now.token == event.token => {}
            _ => {
                debug!("Evento de fin obsoleto en guild {} ({:?})", event.guild_id, event.token);
                return;
            }
        }

        if let Some(e) = &event.error {
            error!("❌ La reproducción terminó con error en guild {}: {}", event.guild_id, e);
        }

        self.advance(event.guild_id, &mut session).await;
    }

    /// Detiene la canción actual; la cadena de fin de canción avanza a la siguiente.
    pub async fn skip(&self, guild_id: GuildId) -> SkipOutcome {
        let Some(session) = self.sessions.get(&guild_id).map(|s| s.clone()) else {
            return SkipOutcome::NothingPlaying;
        };

        let timeout = self.settings.skip_timeout;
        let (token, item) = {
            let mut session = session.lock().await;
            let current = session.queue.current().cloned();
            let Some(now) = session.playing.as_mut() else {
                return SkipOutcome::NothingPlaying;
            };
            if now.skip_in_flight(timeout) {
                return SkipOutcome::AlreadySkipping;
            }
            let Some(item) = current else {
                return SkipOutcome::NothingPlaying;
            };
            if now.skip_requested.is_some() {
                // el stop anterior nunca produjo evento de fin
                warn!("Evento de fin perdido en guild {}, avanzando", guild_id);
                self.advance(guild_id, &mut session).await;
                return SkipOutcome::Skipped(item);
            }
            now.skip_requested = Some(Instant::now());
            (now.token, item)
        };

        info!("⏭️ Saltando: {}", item.title);
        if !self.transport.stop(guild_id).await {
            // no va a llegar evento de fin
            self.on_playback_finished(PlaybackEvent {
                guild_id,
                token,
                error: None,
            })
            .await;
        }

        tokio::time::sleep(self.settings.skip_grace).await;
        SkipOutcome::Skipped(item)
    }

    pub async fn pause(&self, guild_id: GuildId) -> bool {
        self.set_paused(guild_id, true).await
    }

    pub async fn resume(&self, guild_id: GuildId) -> bool {
        self.set_paused(guild_id, false).await
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> bool {
        let Some(session) = self.sessions.get(&guild_id).map(|s| s.clone()) else {
            return false;
        };
        let mut session = session.lock().await;
        let Some(now) = session.playing.as_mut() else {
            return false;
        };
        if now.paused == paused || now.skip_requested.is_some() {
            return false;
        }

        let done = if paused {
            self.transport.pause(guild_id).await
        } else {
            self.transport.resume(guild_id).await
        };
        if done {
            now.paused = paused;
            info!(
                "{} guild {}",
                if paused { "⏸️ Reproducción pausada en" } else { "▶️ Reproducción reanudada en" },
                guild_id
            );
            drop(session);
            self.notify(guild_id);
        }
        done
    }

    /// Vacía la cola y detiene la canción actual.
    pub async fn stop(&self, guild_id: GuildId) -> bool {
        let Some(had_something) = self.clear_session(guild_id).await else {
            return false;
        };

        self.transport.stop(guild_id).await;
        self.went_idle(guild_id).await;
        if had_something {
            info!("⏹️ Reproducción detenida en guild {}", guild_id);
        }
        had_something
    }

    /// Detiene todo y sale del canal de voz.
    pub async fn disconnect(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.stop(guild_id).await;
        self.sessions.remove(&guild_id);
        self.transport.leave(guild_id).await?;
        Ok(())
    }

    pub async fn now_playing(&self, guild_id: GuildId) -> Option<QueueItem> {
        let session = self.sessions.get(&guild_id).map(|s| s.clone())?;
        let session = session.lock().await;
        session.queue.current().cloned()
    }

    pub async fn queue_info(&self, guild_id: GuildId) -> QueueInfo {
        match self.sessions.get(&guild_id).map(|s| s.clone()) {
            Some(session) => session.lock().await.queue.get_info(),
            None => QueueInfo::default(),
        }
    }

    pub async fn state(&self, guild_id: GuildId) -> TransportState {
        let Some(session) = self.sessions.get(&guild_id).map(|s| s.clone()) else {
            return TransportState::Idle;
        };
        let session = session.lock().await;
        match &session.playing {
            Some(now) if now.paused => TransportState::Paused,
            Some(_) => TransportState::Playing,
            None => TransportState::Idle,
        }
    }

    /// Lo que muestra el dashboard: actual y las próximas tres.
    pub async fn snapshot(&self, guild_id: GuildId) -> DashboardSnapshot {
        let Some(session) = self.sessions.get(&guild_id).map(|s| s.clone()) else {
            return DashboardSnapshot::default();
        };
        let session = session.lock().await;
        DashboardSnapshot {
            now_playing: session.queue.current().cloned(),
            up_next: session.queue.upcoming().take(3).cloned().collect(),
            queued: session.queue.len(),
            paused: session.playing.as_ref().is_some_and(|n| n.paused),
        }
    }

    /// Detiene y desconecta todas las sesiones de voz.
    ///
    /// No toca la presencia: quien apaga ya anunció el cierre.
    pub async fn shutdown(&self) {
        let mut guilds: Vec<GuildId> = self.sessions.iter().map(|e| *e.key()).collect();
        for guild in self.transport.connected_guilds() {
            if !guilds.contains(&guild) {
                guilds.push(guild);
            }
        }

        for guild_id in guilds {
            self.clear_session(guild_id).await;
            self.transport.stop(guild_id).await;
            self.sessions.remove(&guild_id);
            self.active.remove(&guild_id);
            if let Err(e) = self.transport.leave(guild_id).await {
                warn!("Error desconectando guild {}: {}", guild_id, e);
            }
        }
    }

    /// Vacía cola y canción actual. `None` si el guild no tiene sesión.
    async fn clear_session(&self, guild_id: GuildId) -> Option<bool> {
        let session = self.sessions.get(&guild_id).map(|s| s.clone())?;
        let mut session = session.lock().await;
        let cleared = session.queue.clear();
        session.queue.take_current();
        let was_playing = session.playing.take().is_some();
        Some(cleared > 0 || was_playing)
    }

    fn session(&self, guild_id: GuildId) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Session {
                    queue: MusicQueue::new(self.settings.max_queue_size),
                    playing: None,
                }))
            })
            .clone()
    }

    /// Avanza hasta encontrar algo reproducible. Los items que fallan se registran y se saltan.
    async fn advance(&self, guild_id: GuildId, session: &mut Session) -> Option<QueueItem> {
        session.playing = None;

        while let Some(item) = session.queue.advance() {
            match self.start(guild_id, &item).await {
                Ok(now) => {
                    session.playing = Some(now);
                    info!("🎵 Reproduciendo: {}", item.title);
                    self.active.insert(guild_id);
                    self.platform
                        .set_presence(Presence::Playing {
                            title: item.title.clone(),
                            url: item.url.clone(),
                        })
                        .await;
                    if let Some(channel) = item.announce_channel {
                        if let Err(e) = self.platform.announce_now_playing(channel, &item).await {
                            warn!("No se pudo anunciar la canción en {}: {}", channel, e);
                        }
                    }
                    self.notify(guild_id);
                    return Some(item);
                }
                Err(e) => error!("❌ No se pudo reproducir {}: {}", item.title, e),
            }
        }

        self.went_idle(guild_id).await;
        None
    }

    async fn start(&self, guild_id: GuildId, item: &QueueItem) -> Result<NowPlaying, PlayerError> {
        let file = self.cache.materialize(guild_id, &item.video_id).await?;
        self.transport.join(guild_id, item.voice_channel).await?;

        let token = PlaybackToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.transport
            .play(guild_id, file.path(), token, self.events.clone())
            .await?;

        Ok(NowPlaying {
            token,
            _file: file,
            skip_requested: None,
            paused: false,
        })
    }

    async fn went_idle(&self, guild_id: GuildId) {
        self.active.remove(&guild_id);
        if self.active.is_empty() {
            self.platform.set_presence(Presence::Idle).await;
        }
        self.notify(guild_id);
    }

    fn notify(&self, guild_id: GuildId) {
        // sin suscriptores no es un error
        let _ = self.changes.send(guild_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{queue::test_item, voice::fake::FakeTransport},
        cache::{MemoryStore, StagingDir, WriteRetry},
        platform::fake::FakePlatform,
    };
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use serenity::model::id::ChannelId;

    const GUILD: GuildId = GuildId::new(1);

    struct Harness {
        player: Arc<AudioPlayer>,
        rx: mpsc::UnboundedReceiver<PlaybackEvent>,
        transport: Arc<FakeTransport>,
        platform: Arc<FakePlatform>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(ids: &[&str]) -> Self {
            Self::with_settings(
                ids,
                PlayerSettings {
                    max_queue_size: 10,
                    skip_grace: Duration::from_millis(1),
                    skip_timeout: Duration::from_secs(60),
                },
            )
            .await
        }

        async fn with_settings(ids: &[&str], settings: PlayerSettings) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache = Arc::new(AudioCache::new(
                Arc::new(MemoryStore::default()),
                StagingDir::create(dir.path()).unwrap(),
                WriteRetry::default(),
            ));
            for id in ids {
                cache.put(id, Bytes::from(format!("audio {id}"))).await.unwrap();
            }
            let transport = Arc::new(FakeTransport::default());
            let platform = Arc::new(FakePlatform::default());
            let (player, rx) =
                AudioPlayer::new(cache, transport.clone(), platform.clone(), settings);
            Self { player, rx, transport, platform, dir }
        }

        /// Entrega los eventos pendientes como lo haría el loop.
        async fn drain(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                self.player.on_playback_finished(event).await;
            }
        }

        async fn current(&self) -> Option<String> {
            self.player.now_playing(GUILD).await.map(|i| i.video_id)
        }

        fn staged_files(&self) -> usize {
            std::fs::read_dir(self.dir.path()).unwrap().count()
        }
    }

    #[tokio::test]
    async fn queue_plays_in_order_then_goes_idle() {
        let mut h = Harness::new(&["a", "b", "c"]).await;

        assert!(matches!(
            h.player.enqueue(GUILD, test_item("a")).await.unwrap(),
            Enqueued::Started(item) if item.video_id == "a"
        ));
        assert_eq!(
            h.player.enqueue(GUILD, test_item("b")).await.unwrap(),
            Enqueued::Queued { position: 1 }
        );
        assert_eq!(
            h.player.enqueue(GUILD, test_item("c")).await.unwrap(),
            Enqueued::Queued { position: 2 }
        );

        for expected in ["b", "c"] {
            h.transport.finish(GUILD);
            h.drain().await;
            assert_eq!(h.current().await.as_deref(), Some(expected));
            assert_eq!(h.staged_files(), 1);
        }

        h.transport.finish(GUILD);
        h.drain().await;
        assert_eq!(h.current().await, None);
        assert_eq!(h.player.state(GUILD).await, TransportState::Idle);
        assert_eq!(h.staged_files(), 0);
        assert_eq!(*h.transport.played.lock(), vec![
            "play_1_a.m4a".to_string(),
            "play_1_b.m4a".to_string(),
            "play_1_c.m4a".to_string(),
        ]);
        assert_eq!(h.platform.last_presence(), Some(Presence::Idle));
    }

    #[tokio::test]
    async fn repeated_skip_advances_exactly_one() {
        let mut h = Harness::new(&["a", "b", "c"]).await;
        for id in ["a", "b", "c"] {
            h.player.enqueue(GUILD, test_item(id)).await.unwrap();
        }

        let first = h.player.skip(GUILD).await;
        // el evento de fin todavía no se procesó
        let second = h.player.skip(GUILD).await;
        h.drain().await;

        assert!(matches!(first, SkipOutcome::Skipped(item) if item.video_id == "a"));
        assert_eq!(second, SkipOutcome::AlreadySkipping);
        assert_eq!(h.current().await.as_deref(), Some("b"));
        assert_eq!(h.player.queue_info(GUILD).await.total_items, 1);
    }

    #[tokio::test]
    async fn play_next_replaces_current_and_idles_when_empty() {
        let h = Harness::new(&["a", "b"]).await;
        h.player.enqueue(GUILD, test_item("a")).await.unwrap();
        h.player.enqueue(GUILD, test_item("b")).await.unwrap();

        let next = h.player.play_next(GUILD).await;
        assert_eq!(next.map(|i| i.video_id).as_deref(), Some("b"));
        assert_eq!(h.current().await.as_deref(), Some("b"));
        assert_eq!(h.staged_files(), 1);

        assert!(h.player.play_next(GUILD).await.is_none());
        assert_eq!(h.current().await, None);
        assert_eq!(h.staged_files(), 0);
        assert_eq!(h.platform.last_presence(), Some(Presence::Idle));
    }

    #[tokio::test]
    async fn lost_end_event_does_not_block_skip() {
        let mut h = Harness::with_settings(
            &["a", "b", "c"],
            PlayerSettings {
                max_queue_size: 10,
                skip_grace: Duration::from_millis(1),
                skip_timeout: Duration::from_millis(20),
            },
        )
        .await;
        for id in ["a", "b", "c"] {
            h.player.enqueue(GUILD, test_item(id)).await.unwrap();
        }

        assert!(matches!(h.player.skip(GUILD).await, SkipOutcome::Skipped(item) if item.video_id == "a"));
        // el driver nunca entrega el fin de "a"
        while h.rx.try_recv().is_ok() {}
        assert_eq!(h.player.skip(GUILD).await, SkipOutcome::AlreadySkipping);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(h.player.skip(GUILD).await, SkipOutcome::Skipped(item) if item.video_id == "a"));
        assert_eq!(h.current().await.as_deref(), Some("b"));

        assert!(matches!(h.player.skip(GUILD).await, SkipOutcome::Skipped(item) if item.video_id == "b"));
        h.drain().await;
        assert_eq!(h.current().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn shutdown_keeps_shutting_down_presence() {
        let h = Harness::new(&["a", "b"]).await;
        h.player.enqueue(GUILD, test_item("a")).await.unwrap();
        h.player.enqueue(GUILD, test_item("b")).await.unwrap();

        h.platform.set_presence(Presence::ShuttingDown).await;
        h.player.shutdown().await;

        assert_eq!(h.platform.last_presence(), Some(Presence::ShuttingDown));
        assert_eq!(h.current().await, None);
        assert_eq!(h.staged_files(), 0);
    }

    #[tokio::test]
    async fn skip_with_nothing_playing() {
        let h = Harness::new(&[]).await;
        assert_eq!(h.player.skip(GUILD).await, SkipOutcome::NothingPlaying);
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let mut h = Harness::new(&["a", "b"]).await;
        h.player.enqueue(GUILD, test_item("a")).await.unwrap();
        h.player.enqueue(GUILD, test_item("b")).await.unwrap();

        h.player
            .on_playback_finished(PlaybackEvent {
                guild_id: GUILD,
                token: PlaybackToken(999),
                error: None,
            })
            .await;
        h.drain().await;

        assert_eq!(h.current().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn failed_item_is_skipped() {
        // "missing" no está en caché
        let mut h = Harness::new(&["a", "b"]).await;
        h.player.enqueue(GUILD, test_item("a")).await.unwrap();
        h.player.enqueue(GUILD, test_item("missing")).await.unwrap();
        h.player.enqueue(GUILD, test_item("b")).await.unwrap();

        h.transport.finish(GUILD);
        h.drain().await;

        assert_eq!(h.current().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn pause_and_resume_only_from_valid_states() {
        let h = Harness::new(&["a"]).await;
        assert!(!h.player.pause(GUILD).await);

        h.player.enqueue(GUILD, test_item("a")).await.unwrap();
        assert!(h.player.pause(GUILD).await);
        assert!(!h.player.pause(GUILD).await);
        assert_eq!(h.player.state(GUILD).await, TransportState::Paused);
        assert!(h.player.snapshot(GUILD).await.paused);

        assert!(h.player.resume(GUILD).await);
        assert!(!h.player.resume(GUILD).await);
        assert_eq!(h.player.state(GUILD).await, TransportState::Playing);
    }

    #[tokio::test]
    async fn stop_clears_queue_and_ignores_late_event() {
        let mut h = Harness::new(&["a", "b"]).await;
        h.player.enqueue(GUILD, test_item("a")).await.unwrap();
        h.player.enqueue(GUILD, test_item("b")).await.unwrap();
        let mut changes = h.player.subscribe();

        assert!(h.player.stop(GUILD).await);
        h.drain().await;

        assert_eq!(h.current().await, None);
        assert_eq!(h.player.queue_info(GUILD).await.total_items, 0);
        assert_eq!(h.staged_files(), 0);
        assert_eq!(changes.try_recv().unwrap(), GUILD);
    }

    #[tokio::test]
    async fn announces_when_channel_given() {
        let h = Harness::new(&["a"]).await;
        let mut item = test_item("a");
        item.announce_channel = Some(ChannelId::new(55));

        h.player.enqueue(GUILD, item).await.unwrap();

        assert_eq!(*h.platform.announcements.lock(), vec!["a".to_string()]);
    }
}
