//! # Dashboard Module
//!
//! Keeps one live dashboard message per guild as the most recent message of
//! its channel. Every message created or deleted in a channel goes through
//! [`DashboardSync::on_channel_activity`]; work is serialized per channel and
//! the lock is held for a short settle delay so the bot's own repost does not
//! race the next event.

use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::player::AudioPlayer,
    platform::{ChatPlatform, DashboardSnapshot, PlatformError},
    storage::{JsonStorage, PersistentMessageRecord, StorageError},
};

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    NoDashboard,
    /// La actividad era el propio dashboard.
    IsDashboard,
    AlreadyLatest,
    Moved { from: MessageId, to: MessageId },
    /// Otro cambio (p. ej. `set_dashboard`) reemplazó el registro durante el reenvío.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DashboardPlan {
    Create,
    AlreadyHere,
    /// El guild ya tiene dashboard en otro canal.
    NeedsConfirmation(PersistentMessageRecord),
}

pub struct DashboardSync {
    locks: DashMap<ChannelId, Arc<Mutex<()>>>,
    storage: Arc<Mutex<JsonStorage>>,
    platform: Arc<dyn ChatPlatform>,
    player: Arc<AudioPlayer>,
    settle: Duration,
}

impl DashboardSync {
    pub fn new(
        storage: Arc<Mutex<JsonStorage>>,
        platform: Arc<dyn ChatPlatform>,
        player: Arc<AudioPlayer>,
        settle: Duration,
    ) -> Self {
        Self {
            locks: DashMap::new(),
            storage,
            platform,
            player,
            settle,
        }
    }

    /// Reacciona a un mensaje creado o borrado en `channel_id`.
    pub async fn on_channel_activity(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
        was_deleted: bool,
    ) -> Result<SyncOutcome, DashboardError> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let outcome = self
            .check_message(guild_id, channel_id, message_id, was_deleted)
            .await;

        // se libera el lock tras el settle, pase lo que pase
        tokio::time::sleep(self.settle).await;
        outcome
    }

    async fn check_message(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
        was_deleted: bool,
    ) -> Result<SyncOutcome, DashboardError> {
        let record = self.storage.lock().await.dashboard_for_channel(channel_id);
        let Some(record) = record.filter(|r| r.guild() == guild_id) else {
            return Ok(SyncOutcome::NoDashboard);
        };

        if record.message() == message_id && !was_deleted {
            return Ok(SyncOutcome::IsDashboard);
        }

        let latest = self.platform.latest_message_id(channel_id).await?;
        if latest == Some(record.message()) {
            return Ok(SyncOutcome::AlreadyLatest);
        }

        self.move_to_bottom(&record).await
    }

    /// Reenvía el dashboard como último mensaje y borra el anterior.
    async fn move_to_bottom(
        &self,
        record: &PersistentMessageRecord,
    ) -> Result<SyncOutcome, DashboardError> {
        let snapshot = self.player.snapshot(record.guild()).await;
        let new_id = self
            .platform
            .send_dashboard(record.channel(), &snapshot)
            .await?;

        // persistir antes de borrar: si el borrado falla, el registro ya apunta al nuevo
        let updated = self
            .storage
            .lock()
            .await
            .update_dashboard_message_if(record.guild(), record.channel(), record.message(), new_id)
            .await?;

        if !updated {
            debug!(
                "Dashboard del guild {} reemplazado durante el reenvío, descartando {}",
                record.guild(),
                new_id
            );
            self.delete_best_effort(record.channel(), new_id).await;
            return Ok(SyncOutcome::Superseded);
        }

        self.delete_best_effort(record.channel(), record.message())
            .await;

        debug!(
            "📌 Dashboard movido en canal {}: {} -> {}",
            record.channel(),
            record.message(),
            new_id
        );
        Ok(SyncOutcome::Moved {
            from: record.message(),
            to: new_id,
        })
    }

    /// Qué haría `set_dashboard` en este canal.
    pub async fn plan_set(&self, guild_id: GuildId, channel_id: ChannelId) -> DashboardPlan {
        match self.storage.lock().await.dashboard_for_guild(guild_id) {
            None => DashboardPlan::Create,
            Some(record) if record.channel() == channel_id => DashboardPlan::AlreadyHere,
            Some(record) => DashboardPlan::NeedsConfirmation(record),
        }
    }

    /// Instala el dashboard del guild en `channel_id`, reemplazando uno anterior.
    ///
    /// La confirmación del reemplazo es responsabilidad de quien llama (ver [`Self::plan_set`]).
    pub async fn set_dashboard(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        guild_name: Option<&str>,
        channel_name: Option<&str>,
    ) -> Result<PersistentMessageRecord, DashboardError> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        {
            let mut storage = self.storage.lock().await;
            storage.ensure_guild(guild_id, guild_name).await?;
            storage
                .ensure_channel(guild_id, channel_id, channel_name)
                .await?;
        }

        let snapshot = self.player.snapshot(guild_id).await;
        let message_id = self.platform.send_dashboard(channel_id, &snapshot).await?;

        // el anterior se lee al persistir: un reenvío en otro canal pudo cambiarlo
        let (record, replaced) = {
            let mut storage = self.storage.lock().await;
            let replaced = storage.dashboard_for_guild(guild_id);
            let record = storage
                .set_dashboard(guild_id, channel_id, message_id)
                .await?;
            (record, replaced)
        };

        if let Some(old) = replaced {
            self.delete_best_effort(old.channel(), old.message()).await;
        }

        info!("📌 Dashboard instalado en canal {} del guild {}", channel_id, guild_id);
        Ok(record)
    }

    pub async fn remove_dashboard(
        &self,
        guild_id: GuildId,
    ) -> Result<Option<PersistentMessageRecord>, DashboardError> {
        Ok(self.storage.lock().await.remove_dashboard(guild_id).await?)
    }

    /// Edita el dashboard en su lugar. Si el mensaje ya no existe, lo reenvía.
    pub async fn refresh(&self, guild_id: GuildId) -> Result<bool, DashboardError> {
        let Some(record) = self.storage.lock().await.dashboard_for_guild(guild_id) else {
            return Ok(false);
        };
        let lock = self.channel_lock(record.channel());
        let _guard = lock.lock().await;

        // pudo moverse mientras esperábamos el lock
        let Some(record) = self.storage.lock().await.dashboard_for_guild(guild_id) else {
            return Ok(false);
        };
        self.edit_or_move(&record).await?;
        Ok(true)
    }

    /// Revalida todos los dashboards guardados (al iniciar).
    pub async fn restore_all(&self) -> usize {
        let records = self.storage.lock().await.dashboards();
        let mut restored = 0;

        for record in records {
            let lock = self.channel_lock(record.channel());
            let _guard = lock.lock().await;

            let result = match self.platform.latest_message_id(record.channel()).await {
                Ok(Some(latest)) if latest == record.message() => {
                    self.edit_or_move(&record).await
                }
                Ok(_) => self.move_to_bottom(&record).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(()) => restored += 1,
                Err(e) => warn!(
                    "No se pudo restaurar el dashboard del guild {}: {}",
                    record.guild_id, e
                ),
            }
        }

        if restored > 0 {
            info!("📌 Restaurados {} dashboards", restored);
        }
        restored
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> DashboardSnapshot {
        self.player.snapshot(guild_id).await
    }

    /// Refresca el dashboard cada vez que cambia el estado del reproductor.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<GuildId>,
        cancel: CancellationToken,
    ) {
        loop {
            let guild_id = tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.recv() => match changed {
                    Ok(guild_id) => guild_id,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Refresh de dashboard atrasado ({} cambios)", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            if let Err(e) = self.refresh(guild_id).await {
                warn!("No se pudo refrescar el dashboard del guild {}: {}", guild_id, e);
            }
        }
    }

    async fn edit_or_move(&self, record: &PersistentMessageRecord) -> Result<(), DashboardError> {
        let snapshot = self.player.snapshot(record.guild()).await;
        match self
            .platform
            .edit_dashboard(record.channel(), record.message(), &snapshot)
            .await
        {
            Ok(()) => Ok(()),
            Err(PlatformError::NotFound) => self.move_to_bottom(record).await.map(|_| ()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_best_effort(&self, channel_id: ChannelId, message_id: MessageId) {
        match self.platform.delete_message(channel_id, message_id).await {
            Ok(()) => {}
            Err(PlatformError::NotFound) => debug!("El dashboard {} ya no existía", message_id),
            Err(e) => error!("No se pudo borrar el dashboard anterior {}: {}", message_id, e),
        }
    }

    fn channel_lock(&self, channel_id: ChannelId) -> Arc<Mutex<()>> {
        self.locks.entry(channel_id).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{player::PlayerSettings, voice::fake::FakeTransport},
        cache::{AudioCache, MemoryStore, StagingDir, WriteRetry},
        platform::fake::{FakePlatform, SendGate},
    };
    use futures::future::join_all;
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(1);
    const CHANNEL: ChannelId = ChannelId::new(500);

    struct Harness {
        sync: Arc<DashboardSync>,
        platform: Arc<FakePlatform>,
        storage: Arc<Mutex<JsonStorage>>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Mutex::new(
            JsonStorage::new(dir.path().join("data")).await.unwrap(),
        ));
        let cache = Arc::new(AudioCache::new(
            Arc::new(MemoryStore::default()),
            StagingDir::create(dir.path().join("staging")).unwrap(),
            WriteRetry::default(),
        ));
        let platform = Arc::new(FakePlatform::default());
        let (player, _rx) = AudioPlayer::new(
            cache,
            Arc::new(FakeTransport::default()),
            platform.clone(),
            PlayerSettings::default(),
        );
        let sync = Arc::new(DashboardSync::new(
            storage.clone(),
            platform.clone(),
            player,
            Duration::ZERO,
        ));
        Harness {
            sync,
            platform,
            storage,
            _dir: dir,
        }
    }

    impl Harness {
        async fn dashboard_id(&self) -> MessageId {
            self.storage
                .lock()
                .await
                .dashboard_for_guild(GUILD)
                .unwrap()
                .message()
        }

        /// El dashboard es el último mensaje y no hay otro dashboard vivo en el canal.
        async fn assert_single_latest(&self) {
            let messages = self.platform.messages(CHANNEL);
            let dashboard = self.dashboard_id().await;
            assert_eq!(messages.last(), Some(&dashboard));
            let live = self
                .platform
                .dashboards
                .lock()
                .iter()
                .filter(|id| messages.contains(id))
                .count();
            assert_eq!(live, 1);
        }
    }

    #[tokio::test]
    async fn dashboard_stays_latest_after_many_messages() {
        let h = harness().await;
        h.platform.post(CHANNEL);
        h.sync
            .set_dashboard(GUILD, CHANNEL, Some("guild"), Some("music"))
            .await
            .unwrap();

        for _ in 0..5 {
            let id = h.platform.post(CHANNEL);
            let outcome = h
                .sync
                .on_channel_activity(GUILD, CHANNEL, id, false)
                .await
                .unwrap();
            assert!(matches!(outcome, SyncOutcome::Moved { .. }));
            h.assert_single_latest().await;
        }
    }

    #[tokio::test]
    async fn concurrent_activity_moves_once() {
        let h = harness().await;
        h.sync.set_dashboard(GUILD, CHANNEL, None, None).await.unwrap();
        let ids: Vec<_> = (0..4).map(|_| h.platform.post(CHANNEL)).collect();

        let outcomes = join_all(
            ids.iter()
                .map(|id| h.sync.on_channel_activity(GUILD, CHANNEL, *id, false)),
        )
        .await;

        let moved = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(SyncOutcome::Moved { .. })))
            .count();
        assert_eq!(moved, 1);
        h.assert_single_latest().await;
    }

    #[tokio::test]
    async fn own_message_is_ignored() {
        let h = harness().await;
        let record = h.sync.set_dashboard(GUILD, CHANNEL, None, None).await.unwrap();

        let outcome = h
            .sync
            .on_channel_activity(GUILD, CHANNEL, record.message(), false)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::IsDashboard);
    }

    #[tokio::test]
    async fn deleted_dashboard_is_reposted() {
        let h = harness().await;
        h.platform.post(CHANNEL);
        let record = h.sync.set_dashboard(GUILD, CHANNEL, None, None).await.unwrap();
        h.platform
            .channels
            .lock()
            .get_mut(&CHANNEL)
            .unwrap()
            .retain(|m| *m != record.message());

        let outcome = h
            .sync
            .on_channel_activity(GUILD, CHANNEL, record.message(), true)
            .await
            .unwrap();

        assert!(matches!(outcome, SyncOutcome::Moved { from, .. } if from == record.message()));
        h.assert_single_latest().await;
    }

    #[tokio::test]
    async fn failed_delete_still_moves_record() {
        let h = harness().await;
        let first = h.sync.set_dashboard(GUILD, CHANNEL, None, None).await.unwrap();
        *h.platform.fail_deletes.lock() = true;

        let id = h.platform.post(CHANNEL);
        h.sync
            .on_channel_activity(GUILD, CHANNEL, id, false)
            .await
            .unwrap();

        let current = h.dashboard_id().await;
        assert_ne!(current, first.message());
        assert_eq!(h.platform.messages(CHANNEL).last(), Some(&current));
    }

    #[tokio::test]
    async fn unrelated_channel_has_no_dashboard() {
        let h = harness().await;
        let other = ChannelId::new(501);
        let id = h.platform.post(other);

        let outcome = h.sync.on_channel_activity(GUILD, other, id, false).await.unwrap();

        assert_eq!(outcome, SyncOutcome::NoDashboard);
    }

    #[tokio::test]
    async fn plan_reports_existing_dashboard() {
        let h = harness().await;
        assert_eq!(h.sync.plan_set(GUILD, CHANNEL).await, DashboardPlan::Create);

        h.sync.set_dashboard(GUILD, CHANNEL, None, None).await.unwrap();
        assert_eq!(h.sync.plan_set(GUILD, CHANNEL).await, DashboardPlan::AlreadyHere);
        assert!(matches!(
            h.sync.plan_set(GUILD, ChannelId::new(501)).await,
            DashboardPlan::NeedsConfirmation(r) if r.channel() == CHANNEL
        ));

        assert!(h.sync.remove_dashboard(GUILD).await.unwrap().is_some());
        assert_eq!(h.sync.plan_set(GUILD, CHANNEL).await, DashboardPlan::Create);
    }

    #[tokio::test]
    async fn overwrite_deletes_old_message() {
        let h = harness().await;
        let old = h.sync.set_dashboard(GUILD, CHANNEL, None, None).await.unwrap();
        let other = ChannelId::new(501);

        h.sync.set_dashboard(GUILD, other, None, None).await.unwrap();

        assert!(!h.platform.messages(CHANNEL).contains(&old.message()));
        assert_eq!(h.storage.lock().await.dashboards().len(), 1);
    }

    #[tokio::test]
    async fn repost_racing_a_move_does_not_orphan_dashboards() {
        let h = harness().await;
        let other = ChannelId::new(501);
        h.sync.set_dashboard(GUILD, CHANNEL, None, None).await.unwrap();

        let gate = SendGate::new(CHANNEL);
        *h.platform.gate.lock() = Some(gate.clone());
        let activity = h.platform.post(CHANNEL);
        let sync = h.sync.clone();
        let repost = tokio::spawn(async move {
            sync.on_channel_activity(GUILD, CHANNEL, activity, false).await
        });
        // el reenvío en CHANNEL quedó a medio camino
        gate.started.notified().await;

        let installed = h.sync.set_dashboard(GUILD, other, None, None).await.unwrap();
        gate.release.add_permits(1);
        let outcome = repost.await.unwrap().unwrap();

        assert_eq!(outcome, SyncOutcome::Superseded);
        let record = h.storage.lock().await.dashboard_for_guild(GUILD).unwrap();
        assert_eq!(record, installed);
        assert!(h.platform.messages(other).contains(&record.message()));

        let dashboards = h.platform.dashboards.lock().clone();
        let live_in_old_channel = h
            .platform
            .messages(CHANNEL)
            .iter()
            .filter(|m| dashboards.contains(m))
            .count();
        assert_eq!(live_in_old_channel, 0);
    }

    #[tokio::test]
    async fn restore_edits_in_place_or_moves() {
        let h = harness().await;
        let record = h.sync.set_dashboard(GUILD, CHANNEL, None, None).await.unwrap();

        assert_eq!(h.sync.restore_all().await, 1);
        assert_eq!(*h.platform.edits.lock(), vec![record.message()]);

        h.platform.post(CHANNEL);
        assert_eq!(h.sync.restore_all().await, 1);
        h.assert_single_latest().await;
    }
}
