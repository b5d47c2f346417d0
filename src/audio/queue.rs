use chrono::{DateTime, Utc};
use serenity::model::id::ChannelId;
use std::{collections::VecDeque, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("La cola está llena (máximo {0} canciones)")]
    Full(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub video_id: String,
    pub title: String,
    /// Nombre visible de quien la pidió.
    pub requested_by: String,
    pub url: String,
    pub duration: Option<Duration>,
    /// Canal de voz donde se reproduce.
    pub voice_channel: ChannelId,
    /// Canal de texto para anunciar "ahora suena".
    pub announce_channel: Option<ChannelId>,
    pub added_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn thumbnail_url(&self) -> String {
        format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", self.video_id)
    }
}

/// Cola FIFO de un guild más la canción actual.
#[derive(Debug)]
pub struct MusicQueue {
    items: VecDeque<QueueItem>,
    current: Option<QueueItem>,
    max_size: usize,
}

impl MusicQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            current: None,
            max_size,
        }
    }

    /// Agrega al final y devuelve la posición (1 = siguiente).
    pub fn push(&mut self, item: QueueItem) -> Result<usize, QueueError> {
        if self.items.len() >= self.max_size {
            return Err(QueueError::Full(self.max_size));
        }

        info!("➕ Agregado a la cola: {}", item.title);
        self.items.push_back(item);
        Ok(self.items.len())
    }

    /// Pasa la cabeza de la cola a "actual". Con la cola vacía, deja de haber actual.
    pub fn advance(&mut self) -> Option<QueueItem> {
        self.current = self.items.pop_front();
        match &self.current {
            Some(item) => debug!("➡️ Siguiente en cola (FIFO): {}", item.title),
            None => debug!("📭 Cola vacía, no hay siguiente track"),
        }
        self.current.clone()
    }

    /// Quita la canción actual sin avanzar.
    pub fn take_current(&mut self) -> Option<QueueItem> {
        self.current.take()
    }

    /// Limpia la cola (no la canción actual)
    pub fn clear(&mut self) -> usize {
        let removed = self.items.len();
        self.items.clear();
        if removed > 0 {
            info!("🗑️ Cola limpiada ({} canciones)", removed);
        }
        removed
    }

    pub fn current(&self) -> Option<&QueueItem> {
        self.current.as_ref()
    }

    pub fn upcoming(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.current.is_none()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get_info(&self) -> QueueInfo {
        QueueInfo {
            current: self.current.clone(),
            items: self.items.iter().cloned().collect(),
            total_items: self.items.len(),
            total_duration: self.calculate_total_duration(),
        }
    }

    fn calculate_total_duration(&self) -> Duration {
        let queue_duration: Duration = self.items.iter().filter_map(|item| item.duration).sum();

        let current_duration = self
            .current
            .as_ref()
            .and_then(|c| c.duration)
            .unwrap_or_default();

        queue_duration + current_duration
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueInfo {
    pub current: Option<QueueItem>,
    pub items: Vec<QueueItem>,
    pub total_items: usize,
    pub total_duration: Duration,
}

impl QueueInfo {
    /// Obtiene una página específica de la cola
    pub fn get_page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let total_pages = if self.total_items == 0 {
            1
        } else {
            self.total_items.div_ceil(items_per_page)
        };
        let safe_page = page.clamp(1, total_pages);
        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(self.items.len());

        QueuePage {
            items: if start < self.items.len() {
                self.items[start..end].to_vec()
            } else {
                Vec::new()
            },
            first_position: start + 1,
            current_page: safe_page,
            total_pages,
            total_items: self.total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<QueueItem>,
    /// Posición en la cola del primer elemento de la página.
    pub first_position: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

#[cfg(test)]
pub(crate) fn test_item(video_id: &str) -> QueueItem {
    QueueItem {
        video_id: video_id.to_string(),
        title: format!("Track {video_id}"),
        requested_by: "tester".to_string(),
        url: crate::sources::watch_url(video_id),
        duration: Some(Duration::from_secs(180)),
        voice_channel: ChannelId::new(10),
        announce_channel: None,
        added_at: Utc::now(),
    }
}
