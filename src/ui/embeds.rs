use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{
    audio::queue::{QueueInfo, QueueItem},
    platform::DashboardSnapshot,
    sources::SearchResult,
};

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
pub const STANDARD_FOOTER: &str = "🎵 Opal";

const QUEUE_PAGE_SIZE: usize = 10;

/// Embed de "ahora suena", usado en anuncios y en `/nowplaying`.
pub fn now_playing_embed(item: &QueueItem) -> CreateEmbed {
    CreateEmbed::default()
        .title("🎵 Reproduciendo Ahora")
        .description(format!("**[{}]({})**", item.title, item.url))
        .color(colors::SUCCESS_GREEN)
        .field("⏱️ Duración", duration_text(item.duration), true)
        .field("👤 Solicitado por", &item.requested_by, true)
        .thumbnail(item.thumbnail_url())
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn track_queued_embed(item: &QueueItem, position: usize) -> CreateEmbed {
    CreateEmbed::default()
        .title("➕ Agregado a la cola")
        .description(format!("**[{}]({})**", item.title, item.url))
        .color(colors::INFO_BLUE)
        .field("📍 Posición", position.to_string(), true)
        .field("⏱️ Duración", duration_text(item.duration), true)
        .thumbnail(item.thumbnail_url())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Contenido del mensaje de dashboard.
pub fn dashboard_embed(snapshot: &DashboardSnapshot) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("🎛️ Dashboard")
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER));

    let Some(current) = &snapshot.now_playing else {
        return embed
            .description("😴 **Nada sonando**\n\n💡 Usa `/play <canción>` para empezar")
            .color(colors::NEUTRAL_GRAY);
    };

    let status = if snapshot.paused { "⏸️ En pausa" } else { "▶️ Sonando" };
    embed = embed
        .description(format!("{}\n**[{}]({})**", status, current.title, current.url))
        .color(if snapshot.paused {
            colors::WARNING_ORANGE
        } else {
            colors::MUSIC_PURPLE
        })
        .thumbnail(current.thumbnail_url())
        .field("⏱️ Duración", duration_text(current.duration), true)
        .field("👤 Solicitado por", &current.requested_by, true);

    if !snapshot.up_next.is_empty() {
        let mut next = String::new();
        for (i, item) in snapshot.up_next.iter().enumerate() {
            next.push_str(&format!("**{}**. {}\n", i + 1, item.title));
        }
        let hidden = snapshot.queued.saturating_sub(snapshot.up_next.len());
        if hidden > 0 {
            next.push_str(&format!("*…y {} más*", hidden));
        }
        embed = embed.field("Próximas canciones", next, false);
    }

    embed
}

/// Crea un embed para mostrar la cola de reproducción
pub fn queue_embed(queue_info: &QueueInfo, page: usize) -> CreateEmbed {
    let queue_page = queue_info.get_page(page, QUEUE_PAGE_SIZE);

    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    if queue_info.current.is_none() && queue_info.total_items == 0 {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    if let Some(current) = &queue_info.current {
        embed = embed.field("▶️ Reproduciendo", format!("**{}**", current.title), false);
    }

    if !queue_page.items.is_empty() {
        let mut description = String::new();
        for (i, item) in queue_page.items.iter().enumerate() {
            let duration = item
                .duration
                .map(|d| format!(" `[{}]`", format_duration(d)))
                .unwrap_or_default();
            description.push_str(&format!(
                "**{}**. {}{} • {}\n",
                queue_page.first_position + i,
                item.title,
                duration,
                item.requested_by
            ));
        }
        embed = embed.field("Próximas canciones", description, false);
    }

    let mut info = format!("**Total:** {} canciones", queue_info.total_items);
    if queue_info.total_duration > Duration::ZERO {
        info.push_str(&format!(
            " • **Duración:** {}",
            format_duration(queue_info.total_duration)
        ));
    }
    embed = embed.field("Información", info, false);

    if queue_page.total_pages > 1 {
        embed = embed.footer(CreateEmbedFooter::new(format!(
            "Página {} de {} • Opal",
            queue_page.current_page, queue_page.total_pages
        )));
    } else {
        embed = embed.footer(CreateEmbedFooter::new(STANDARD_FOOTER));
    }

    embed.timestamp(Timestamp::now())
}

pub fn search_results_embed(query: &str, results: &[SearchResult]) -> CreateEmbed {
    let mut description = String::new();
    for (i, result) in results.iter().enumerate() {
        let duration = result
            .duration
            .map(|d| format!(" `[{}]`", format_duration(d)))
            .unwrap_or_default();
        description.push_str(&format!(
            "**{}**. {}{}\n└ {}\n",
            i + 1,
            result.title,
            duration,
            result.author.as_deref().unwrap_or("Desconocido")
        ));
    }

    CreateEmbed::default()
        .title(format!("🔍 Resultados para \"{}\"", query))
        .description(description)
        .color(colors::MUSIC_PURPLE)
        .footer(CreateEmbedFooter::new("Elige una canción en el menú • 30s"))
}

pub fn error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("ℹ️ {}", title))
        .description(description)
        .color(colors::INFO_BLUE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn warning_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("⚠️ {}", title))
        .description(description)
        .color(colors::WARNING_ORANGE)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

fn duration_text(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => format_duration(d),
        None => "Desconocida".to_string(),
    }
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(59)), "0:59");
        assert_eq!(format_duration(Duration::from_secs(185)), "3:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }
}
