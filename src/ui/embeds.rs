use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{audio::AudioStatus, sources::Track};

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Escribe el nombre o la URL de una canción en este canal";

/// Canciones de la cola que se muestran en el mensaje de estado
pub const QUEUE_PREVIEW_LEN: usize = 5;

/// Embed del mensaje de estado mientras suena (o está pausado) un track
pub fn create_now_playing_embed(track: &Track, status: &AudioStatus) -> CreateEmbed {
    let (title, color) = if status.is_paused {
        ("⏸️ Música en pausa", colors::WARNING_ORANGE)
    } else {
        ("🎵 Reproduciendo Ahora", colors::SUCCESS_GREEN)
    };

    let mut requester = CreateEmbedAuthor::new(&track.requester.name);
    if let Some(icon) = &track.requester.icon_url {
        requester = requester.icon_url(icon);
    }

    let mut embed = CreateEmbed::default()
        .title(title)
        .description(format!("**[{}]({})**", track.title, track.url))
        .color(color)
        .author(requester)
        .field(
            "🎤 Artista",
            track.author.as_deref().unwrap_or("Desconocido"),
            true,
        )
        .field(
            "⏱️ Duración",
            track
                .duration
                .map(format_duration)
                .unwrap_or_else(|| "🔴 En vivo".to_string()),
            true,
        )
        .field(
            "🔁 Repetición",
            if status.loop_enabled { "Activada" } else { "Desactivada" },
            true,
        )
        .field(
            format!("📋 En cola ({})", status.queue.len()),
            queue_preview(&status.queue),
            false,
        );

    if let Some(thumbnail) = &track.thumbnail {
        embed = embed.image(thumbnail);
    }

    embed
        .timestamp(Timestamp::from(track.requester.requested_at))
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Embed del mensaje de estado sin música
pub fn create_idle_embed() -> CreateEmbed {
    CreateEmbed::default()
        .title("💤 Esperando música")
        .description("No hay nada reproduciéndose.")
        .color(colors::NEUTRAL_GRAY)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Primeros títulos de la cola más "y N más"
pub fn queue_preview(queue: &[Track]) -> String {
    if queue.is_empty() {
        return "La cola está vacía".to_string();
    }

    let mut lines: Vec<String> = queue
        .iter()
        .take(QUEUE_PREVIEW_LEN)
        .enumerate()
        .map(|(i, track)| format!("`{}.` {}", i + 1, track.title))
        .collect();

    if queue.len() > QUEUE_PREVIEW_LEN {
        lines.push(format!("... y {} más", queue.len() - QUEUE_PREVIEW_LEN));
    }

    lines.join("\n")
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
