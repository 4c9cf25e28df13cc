use std::sync::Arc;

use serenity::client::Context;
use serenity::framework::standard::macros::{command, group};
use serenity::framework::standard::{Args, CommandError, CommandResult};
use serenity::model::channel::Message;
use serenity::model::guild::Guild;
use serenity::Result as SerenityResult;
use tracing::info;

use crate::engine::{PlayOutcome, Player};
use crate::error::{PlayerError, ResolveError};
use crate::resolver::ResolverGateway;
use crate::{PlayerKey, ResolverKey};

#[group]
#[commands(play, skip, pause, resume, stop, queue, help)]
pub struct General;

#[command]
#[only_in(guilds)]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let message = r#"
**Commands:**
    **play [URL|Title]** - Plays (or adds to the queue) a track given a URL or a search phrase.
    **skip** - Skips the currently playing track.
    **pause** - Pauses the current track.
    **resume** - Resumes the currently paused track.
    **stop** - Stops playback, clears the queue and leaves the channel.
    **queue** - Shows the queue of tracks.
    "#;

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let query = args.message().trim().to_string();
    if query.is_empty() {
        check_msg(msg.reply(ctx, "Give me a link or something to search for.").await);
        return Ok(());
    }

    let guild = get_guild(ctx, msg)?;
    let guild_id = guild.id.0;

    // The invoking user must be in a voice channel for us to join.
    let voice_channel = guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id);

    let voice_channel = match voice_channel {
        Some(channel) => channel,
        None => {
            check_msg(msg.reply(ctx, "You must be in a voice channel.").await);
            return Ok(());
        }
    };

    info!("PLAY - guild {guild_id} query {query}");

    let resolver = resolver(ctx).await?;
    let track = match resolver.resolve(&query).await {
        Ok(track) => track,
        Err(error) => {
            info!("PLAY - resolve failed for {query}: {error}");
            check_msg(msg.channel_id.say(&ctx.http, resolve_reply(&error)).await);
            return Ok(());
        }
    };

    let player = player(ctx).await?;
    match player.play(guild_id, voice_channel, msg.channel_id, track).await {
        // The backend announces started tracks in the channel itself.
        Ok(PlayOutcome::Started(_)) => {}
        Ok(PlayOutcome::Queued(title)) => {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, format!("Added to queue: **{title}**"))
                    .await,
            );
        }
        Err(error) => {
            check_msg(msg.channel_id.say(&ctx.http, player_reply(&error)).await);
        }
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let reply = match player(ctx).await?.skip(guild_id).await {
        Ok(()) => "Skipped the current song.".to_string(),
        Err(PlayerError::NothingPlaying | PlayerError::NotConnected) => {
            "Not playing anything to skip.".to_string()
        }
        Err(error) => player_reply(&error),
    };

    check_msg(msg.channel_id.say(&ctx.http, reply).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let reply = match player(ctx).await?.pause(guild_id).await {
        Ok(()) => "Playback paused!".to_string(),
        Err(error) => player_reply(&error),
    };

    check_msg(msg.channel_id.say(&ctx.http, reply).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let reply = match player(ctx).await?.resume(guild_id).await {
        Ok(()) => "Playback resumed!".to_string(),
        Err(error) => player_reply(&error),
    };

    check_msg(msg.channel_id.say(&ctx.http, reply).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let reply = match player(ctx).await?.stop(guild_id).await {
        Ok(()) => "Stopped playback and disconnected!".to_string(),
        Err(error) => player_reply(&error),
    };

    check_msg(msg.channel_id.say(&ctx.http, reply).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let reply = match player(ctx).await?.queue_snapshot(guild_id) {
        None => "There is nothing queued up!".to_string(),
        Some(tracks) if tracks.is_empty() => "The queue is empty!".to_string(),
        Some(tracks) => {
            let max_tracks = 20;
            let listing = tracks
                .iter()
                .take(max_tracks)
                .enumerate()
                .map(|(index, track)| {
                    format!(
                        "{}. {} [{}]",
                        index + 1,
                        track.title,
                        track.duration_display()
                    )
                })
                .collect::<Vec<String>>()
                .join("\n");

            format!("**Queue:**\n```{listing}```")
        }
    };

    check_msg(msg.channel_id.say(&ctx.http, reply).await);

    Ok(())
}

fn resolve_reply(error: &ResolveError) -> &'static str {
    match error {
        ResolveError::NoResults => "No results found.",
        ResolveError::LookupFailure(_) => "Could not load that track.",
        ResolveError::TimedOut => "The lookup took too long. Try again.",
    }
}

fn player_reply(error: &PlayerError) -> String {
    match error {
        PlayerError::NotConnected => "I'm not connected to any voice channel.".to_string(),
        PlayerError::NothingPlaying => "Nothing is currently playing.".to_string(),
        PlayerError::AlreadyPaused => "Playback is already paused.".to_string(),
        PlayerError::NotPaused => "I'm not paused right now.".to_string(),
        PlayerError::Sink(_) => "Could not play that track.".to_string(),
        PlayerError::EngineClosed => "The player is shutting down.".to_string(),
    }
}

async fn player(ctx: &Context) -> Result<Arc<Player>, CommandError> {
    let data = ctx.data.read().await;

    data.get::<PlayerKey>()
        .cloned()
        .ok_or_else(|| CommandError::from("Player placed in at initialisation."))
}

async fn resolver(ctx: &Context) -> Result<Arc<ResolverGateway>, CommandError> {
    let data = ctx.data.read().await;

    data.get::<ResolverKey>()
        .cloned()
        .ok_or_else(|| CommandError::from("Resolver placed in at initialisation."))
}

fn get_guild(ctx: &Context, msg: &Message) -> Result<Guild, CommandError> {
    msg.guild(&ctx.cache)
        .ok_or_else(|| CommandError::from("Guild not found"))
}

fn get_guild_id(ctx: &Context, msg: &Message) -> Result<u64, CommandError> {
    Ok(get_guild(ctx, msg)?.id.0)
}

/// Checks that a message successfully sent; if not, then logs why.
pub fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}
