use serenity::{
    all::ButtonStyle,
    builder::{
        CreateActionRow, CreateButton, CreateSelectMenu, CreateSelectMenuKind,
        CreateSelectMenuOption,
    },
};

use crate::{platform::DashboardSnapshot, sources::SearchResult, ui::embeds::format_duration};

/// IDs personalizados de los componentes, con la forma `<dueño>:<acción>`.
pub mod button_ids {
    pub const DASHBOARD_PLAY_PAUSE: &str = "dashboard:playpause";
    pub const DASHBOARD_SKIP: &str = "dashboard:skip";
    pub const DASHBOARD_JOIN: &str = "dashboard:join";
    pub const DASHBOARD_REFRESH: &str = "dashboard:refresh";

    pub const CONFIRM_MOVE: &str = "set-dashboard:confirm";
    pub const CANCEL_MOVE: &str = "set-dashboard:cancel";

    pub const SEARCH_SELECT: &str = "play:search";
}

/// Separa `"dashboard:skip"` en `("dashboard", "skip")`.
pub fn split_custom_id(custom_id: &str) -> (&str, &str) {
    custom_id.split_once(':').unwrap_or((custom_id, ""))
}

/// Controles debajo del dashboard.
pub fn dashboard_controls(snapshot: &DashboardSnapshot) -> Vec<CreateActionRow> {
    let playing = snapshot.now_playing.is_some();
    let (emoji, style) = if playing && !snapshot.paused {
        ('⏸', ButtonStyle::Secondary)
    } else {
        ('▶', ButtonStyle::Success)
    };

    let play_pause = CreateButton::new(button_ids::DASHBOARD_PLAY_PAUSE)
        .emoji(emoji)
        .style(style)
        .disabled(!playing);

    let skip = CreateButton::new(button_ids::DASHBOARD_SKIP)
        .emoji('⏭')
        .style(ButtonStyle::Primary)
        .disabled(!playing);

    let join = CreateButton::new(button_ids::DASHBOARD_JOIN)
        .label("Unirme")
        .emoji('🔊')
        .style(ButtonStyle::Secondary);

    let refresh = CreateButton::new(button_ids::DASHBOARD_REFRESH)
        .emoji('🔄')
        .style(ButtonStyle::Secondary);

    vec![CreateActionRow::Buttons(vec![play_pause, skip, join, refresh])]
}

/// Confirmación para mover el dashboard de canal.
pub fn move_confirmation_controls() -> CreateActionRow {
    let confirm = CreateButton::new(button_ids::CONFIRM_MOVE)
        .label("Sí, mover aquí")
        .emoji('✅')
        .style(ButtonStyle::Success);

    let cancel = CreateButton::new(button_ids::CANCEL_MOVE)
        .label("Cancelar")
        .emoji('❌')
        .style(ButtonStyle::Danger);

    CreateActionRow::Buttons(vec![confirm, cancel])
}

/// Menú para elegir uno de los resultados de búsqueda; el valor es el id del video.
pub fn search_menu(results: &[SearchResult]) -> CreateActionRow {
    let options = results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let label = truncate(&format!("{}. {}", i + 1, result.title), 100);
            let mut option = CreateSelectMenuOption::new(label, &result.id);
            let mut description = result.author.clone().unwrap_or_default();
            if let Some(duration) = result.duration {
                description = format!("{} • {}", format_duration(duration), description);
            }
            if !description.is_empty() {
                option = option.description(truncate(&description, 100));
            }
            option
        })
        .collect();

    CreateActionRow::SelectMenu(
        CreateSelectMenu::new(button_ids::SEARCH_SELECT, CreateSelectMenuKind::String { options })
            .placeholder("Elige una canción"),
    )
}

/// Los textos de componentes de Discord tienen límite de caracteres.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_custom_id() {
        assert_eq!(split_custom_id(button_ids::DASHBOARD_SKIP), ("dashboard", "skip"));
        assert_eq!(split_custom_id("legacy"), ("legacy", ""));
    }

    #[test]
    fn test_truncate_respects_char_limit() {
        let long = "á".repeat(150);
        let out = truncate(&long, 100);
        assert_eq!(out.chars().count(), 100);
        assert!(out.ends_with('…'));
        assert_eq!(truncate("corto", 100), "corto");
    }
}
