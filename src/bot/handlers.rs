use anyhow::Result;
use serenity::{
    builder::{
        CreateInteractionResponse, CreateInteractionResponseFollowup,
        CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::{
        application::{CommandInteraction, ComponentInteraction},
        channel::Message,
        id::{ChannelId, GuildId, MessageId, UserId},
    },
    prelude::Context,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::serializer::{ActionError, CommandError};
use super::MusicBot;
use crate::{
    audio::AudioStatus,
    sources::{Requester, Resolved},
    ui::ControlAction,
};

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &MusicBot) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new().ephemeral(true)),
        )
        .await?;

    let reply = match command.data.name.as_str() {
        "setup" => handle_setup(&command, bot, guild_id).await,
        "volume" => {
            let level = command
                .data
                .options
                .iter()
                .find(|opt| opt.name == "level")
                .and_then(|opt| opt.value.as_i64())
                .unwrap_or(100)
                .clamp(0, 200) as u16;
            reply_text(handle_volume(ctx, bot, guild_id, command.user.id, level).await)
        }
        name => match ControlAction::from_custom_id(name) {
            Some(action) => reply_text(control(ctx, bot, guild_id, command.user.id, action).await),
            None => "❌ Comando no reconocido".to_string(),
        },
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(reply))
        .await?;

    Ok(())
}

/// Maneja los botones del mensaje de estado
pub async fn handle_component(
    ctx: &Context,
    component: ComponentInteraction,
    bot: &MusicBot,
) -> Result<()> {
    let guild_id = component
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Componente usado fuera de un servidor"))?;

    info!(
        "🔘 Botón {} presionado por {} en guild {}",
        component.data.custom_id, component.user.name, guild_id
    );

    let Some(action) = ControlAction::from_custom_id(&component.data.custom_id) else {
        component
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .content("❌ Acción no reconocida")
                        .ephemeral(true),
                ),
            )
            .await?;
        return Ok(());
    };

    component
        .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
        .await?;

    let reply = reply_text(control(ctx, bot, guild_id, component.user.id, action).await);
    component
        .create_followup(
            &ctx.http,
            CreateInteractionResponseFollowup::new()
                .content(reply)
                .ephemeral(true),
        )
        .await?;

    Ok(())
}

/// Mensaje escrito en el canal de música: se interpreta como petición de canción
pub async fn handle_song_request(ctx: &Context, msg: &Message, bot: &MusicBot) -> Result<()> {
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };
    if msg.author.bot || bot.board.channel_for(guild_id) != Some(msg.channel_id) {
        return Ok(());
    }

    let ttl = bot.config.message_ttl;
    delete_later(ctx, msg.channel_id, msg.id, ttl);

    let query = msg.content.trim();
    if query.is_empty() {
        return Ok(());
    }

    let user_channel = user_voice_channel(ctx, guild_id, msg.author.id);
    let session_channel = bot.service.voice_channel(guild_id).await;
    let voice_channel = match check_listener(user_channel, session_channel) {
        Ok(channel) => channel,
        Err(e) => {
            send_transient(ctx, msg.channel_id, e.to_string(), ttl).await;
            return Ok(());
        }
    };

    info!("🎶 Petición de {} en guild {}: {}", msg.author.name, guild_id, query);

    let requester = Requester::new(
        msg.author.id,
        msg.author
            .global_name
            .clone()
            .unwrap_or_else(|| msg.author.name.clone()),
        msg.author.avatar_url(),
    );

    let resolved = match bot.resolver.resolve(query, &requester).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => {
            let reply = CommandError::NotFound(query.to_string()).to_string();
            send_transient(ctx, msg.channel_id, reply, ttl).await;
            return Ok(());
        }
        Err(e) => {
            warn!("⚠️ {} no pudo resolver '{}': {:?}", bot.resolver.name(), query, e);
            let reply = CommandError::NotFound(query.to_string()).to_string();
            send_transient(ctx, msg.channel_id, reply, ttl).await;
            return Ok(());
        }
    };

    let ack = match &resolved {
        Resolved::Track(track) => format!("🎵 **{}** agregada a la cola", track.title),
        Resolved::Playlist { title, count, .. } => {
            format!("📋 **{}** agregada, {} canciones", title, count)
        }
    };

    if let Err(e) = bot
        .service
        .enqueue_and_play(guild_id, voice_channel, resolved.into_tracks())
        .await
    {
        error!("❌ No se pudo iniciar la reproducción en guild {}: {}", guild_id, e);
        send_transient(ctx, msg.channel_id, CommandError::from(e).to_string(), ttl).await;
        return Ok(());
    }

    send_transient(ctx, msg.channel_id, ack, ttl).await;
    bot.board.refresh(guild_id).await;
    Ok(())
}

// Handlers específicos

async fn handle_setup(command: &CommandInteraction, bot: &MusicBot, guild_id: GuildId) -> String {
    let Some(channel_id) = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "channel")
        .and_then(|opt| opt.value.as_channel_id())
    else {
        return "❌ Debes indicar un canal de texto".to_string();
    };

    match bot.board.setup(guild_id, channel_id).await {
        Ok(()) => format!("✅ Canal de música configurado en <#{}>", channel_id),
        Err(e) => {
            error!("❌ Error configurando canal en guild {}: {:?}", guild_id, e);
            format!("❌ No se pudo configurar el canal: {}", e)
        }
    }
}

async fn handle_volume(
    ctx: &Context,
    bot: &MusicBot,
    guild_id: GuildId,
    user_id: UserId,
    level: u16,
) -> Result<String, ActionError> {
    let session_channel = bot.service.voice_channel(guild_id).await;
    check_listener(user_voice_channel(ctx, guild_id, user_id), session_channel)?;
    if session_channel.is_none() {
        return Err(CommandError::NothingPlaying.into());
    }

    bot.serializer
        .run(guild_id, || async {
            match bot.service.set_volume(guild_id, level).await? {
                Some(applied) => Ok(format!("🔊 Volumen ajustado a {}%", applied)),
                None => Err(CommandError::NothingPlaying),
            }
        })
        .await
}

/// Verifica las precondiciones fuera del serializador y ejecuta la acción dentro
async fn control(
    ctx: &Context,
    bot: &MusicBot,
    guild_id: GuildId,
    user_id: UserId,
    action: ControlAction,
) -> Result<String, ActionError> {
    let session_channel = bot.service.voice_channel(guild_id).await;
    check_listener(user_voice_channel(ctx, guild_id, user_id), session_channel)?;

    let status = bot.service.get_status(guild_id).await;
    check_control(action, status.as_ref())?;

    bot.serializer
        .run(guild_id, || execute(bot, guild_id, action))
        .await
}

async fn execute(bot: &MusicBot, guild_id: GuildId, action: ControlAction) -> Result<String, CommandError> {
    let service = &bot.service;

    let reply = match action {
        ControlAction::Stop => {
            service.stop(guild_id).await?;
            service.disconnect(guild_id).await?;
            bot.board.show_idle(guild_id).await;
            return Ok("⏹️ Reproducción detenida y cola limpiada".to_string());
        }
        ControlAction::Pause => {
            if !service.pause(guild_id).await? {
                return Err(CommandError::NothingPlaying);
            }
            "⏸️ Reproducción pausada".to_string()
        }
        ControlAction::Resume => {
            if !service.resume(guild_id).await? {
                return Err(CommandError::NothingPlaying);
            }
            "▶️ Reproducción reanudada".to_string()
        }
        ControlAction::Skip => {
            if !service.skip(guild_id).await? {
                return Err(CommandError::NothingPlaying);
            }
            // El mensaje de estado lo actualiza el evento del siguiente track
            return Ok("⏭️ Canción saltada".to_string());
        }
        ControlAction::Loop => match service.toggle_loop(guild_id).await {
            Some(true) => "🔁 Repetición activada".to_string(),
            Some(false) => "➡️ Repetición desactivada".to_string(),
            None => return Err(CommandError::NothingPlaying),
        },
        ControlAction::Shuffle => match service.shuffle(guild_id).await {
            Some(count) => format!("🔀 Cola mezclada ({} canciones)", count),
            None => return Err(CommandError::NothingPlaying),
        },
    };

    bot.board.refresh(guild_id).await;
    Ok(reply)
}

/// El usuario debe estar en voz, y en el canal del bot si ya hay sesión
pub(crate) fn check_listener(
    user_channel: Option<ChannelId>,
    session_channel: Option<ChannelId>,
) -> Result<ChannelId, CommandError> {
    let user_channel = user_channel.ok_or(CommandError::NotInVoice)?;
    match session_channel {
        Some(session) if session != user_channel => Err(CommandError::OtherVoiceChannel),
        _ => Ok(user_channel),
    }
}

pub(crate) fn check_control(action: ControlAction, status: Option<&AudioStatus>) -> Result<(), CommandError> {
    let status = status.ok_or(CommandError::NothingPlaying)?;

    match action {
        ControlAction::Stop | ControlAction::Loop => Ok(()),
        ControlAction::Pause if status.now_playing.is_none() => Err(CommandError::NothingPlaying),
        ControlAction::Pause if status.is_paused => Err(CommandError::AlreadyPaused),
        ControlAction::Resume if status.now_playing.is_none() => Err(CommandError::NothingPlaying),
        ControlAction::Resume if !status.is_paused => Err(CommandError::NotPaused),
        ControlAction::Skip if status.now_playing.is_none() => Err(CommandError::NothingPlaying),
        ControlAction::Shuffle if status.queue.len() < 2 => Err(CommandError::NotEnoughTracks),
        _ => Ok(()),
    }
}

fn reply_text(result: Result<String, ActionError>) -> String {
    result.unwrap_or_else(|e| {
        debug!("Acción rechazada: {}", e);
        e.to_string()
    })
}

// Funciones auxiliares

pub(crate) fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

async fn send_transient(ctx: &Context, channel_id: ChannelId, content: String, ttl: Duration) {
    match channel_id.say(&ctx.http, content).await {
        Ok(message) => delete_later(ctx, channel_id, message.id, ttl),
        Err(e) => warn!("⚠️ No se pudo enviar mensaje en {}: {}", channel_id, e),
    }
}

fn delete_later(ctx: &Context, channel_id: ChannelId, message_id: MessageId, ttl: Duration) {
    let http = ctx.http.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Err(e) = channel_id.delete_message(&http, message_id).await {
            debug!("No se pudo borrar el mensaje {}: {}", message_id, e);
        }
    });
}
