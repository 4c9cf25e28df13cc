use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serenity::async_trait;
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId};
use songbird::tracks::TrackHandle;
use songbird::TrackEvent::End;
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird};
use tracing::info;

use crate::commands::check_msg;
use crate::engine::{AudioBackend, SessionHandle};
use crate::error::PlayerError;
use crate::track::Track;

/// Voice I/O over songbird. Holds at most one live track handle per guild;
/// the handle is how pause/resume/halt reach the sink.
pub struct SongbirdBackend {
    manager: Arc<Songbird>,
    http: Arc<Http>,
    guilds: Mutex<HashMap<u64, GuildAudio>>,
}

struct GuildAudio {
    announce_channel: ChannelId,
    track_handle: Option<TrackHandle>,
}

impl SongbirdBackend {
    pub fn new(manager: Arc<Songbird>, http: Arc<Http>) -> Self {
        SongbirdBackend {
            manager,
            http,
            guilds: Mutex::new(HashMap::new()),
        }
    }

    fn current_handle(&self, guild_id: u64) -> Option<TrackHandle> {
        let guilds = self.guilds.lock().expect("backend state lock poisoned");
        guilds
            .get(&guild_id)
            .and_then(|audio| audio.track_handle.clone())
    }

    fn take_handle(&self, guild_id: u64) -> Option<TrackHandle> {
        let mut guilds = self.guilds.lock().expect("backend state lock poisoned");
        guilds
            .get_mut(&guild_id)
            .and_then(|audio| audio.track_handle.take())
    }

    fn store_handle(&self, guild_id: u64, handle: TrackHandle) -> Option<ChannelId> {
        let mut guilds = self.guilds.lock().expect("backend state lock poisoned");
        let audio = guilds.get_mut(&guild_id)?;
        audio.track_handle = Some(handle);
        Some(audio.announce_channel)
    }
}

#[async_trait]
impl AudioBackend for SongbirdBackend {
    async fn connect(
        &self,
        guild_id: u64,
        voice_channel: ChannelId,
        announce_channel: ChannelId,
    ) -> Result<(), PlayerError> {
        // join also moves an existing connection when the channel differs.
        let (call, result) = self.manager.join(GuildId(guild_id), voice_channel).await;
        result.map_err(|error| PlayerError::Sink(error.to_string()))?;

        {
            let mut handler = call.lock().await;
            if !handler.is_deaf() {
                if let Err(error) = handler.deafen(true).await {
                    info!("Deafen failed due to {error:?}");
                }
            }
        }

        let mut guilds = self.guilds.lock().expect("backend state lock poisoned");
        let audio = guilds.entry(guild_id).or_insert(GuildAudio {
            announce_channel,
            track_handle: None,
        });
        audio.announce_channel = announce_channel;

        Ok(())
    }

    async fn disconnect(&self, guild_id: u64) -> Result<(), PlayerError> {
        self.take_handle(guild_id);

        let guild = GuildId(guild_id);
        if self.manager.get(guild).is_some() {
            self.manager
                .remove(guild)
                .await
                .map_err(|error| PlayerError::Sink(error.to_string()))?;
        }

        Ok(())
    }

    async fn play(
        &self,
        guild_id: u64,
        track: &Track,
        session: SessionHandle,
    ) -> Result<(), PlayerError> {
        let call = self
            .manager
            .get(GuildId(guild_id))
            .ok_or(PlayerError::NotConnected)?;

        let source = songbird::ytdl(&track.stream_url)
            .await
            .map_err(|error| PlayerError::Sink(error.to_string()))?;

        let handle = {
            let mut handler = call.lock().await;
            handler.stop(); // just in case something was left playing
            handler.play_source(source)
        };

        handle
            .add_event(Event::Track(End), TrackEndNotifier { session })
            .map_err(|error| PlayerError::Sink(error.to_string()))?;

        if let Some(channel) = self.store_handle(guild_id, handle) {
            check_msg(
                channel
                    .say(
                        &self.http,
                        format!(
                            "Now playing: **{}** [{}]",
                            track.title,
                            track.duration_display()
                        ),
                    )
                    .await,
            );
        }

        Ok(())
    }

    async fn pause(&self, guild_id: u64) -> Result<(), PlayerError> {
        let handle = self
            .current_handle(guild_id)
            .ok_or(PlayerError::NothingPlaying)?;

        handle
            .pause()
            .map_err(|error| PlayerError::Sink(error.to_string()))
    }

    async fn resume(&self, guild_id: u64) -> Result<(), PlayerError> {
        let handle = self
            .current_handle(guild_id)
            .ok_or(PlayerError::NothingPlaying)?;

        handle
            .play()
            .map_err(|error| PlayerError::Sink(error.to_string()))
    }

    async fn stop(&self, guild_id: u64) -> Result<(), PlayerError> {
        // Tolerant of nothing playing; halting doubles as the skip
        // primitive and fires the End event like a natural finish.
        if let Some(handle) = self.take_handle(guild_id) {
            handle
                .stop()
                .map_err(|error| PlayerError::Sink(error.to_string()))?;
        }

        Ok(())
    }
}

struct TrackEndNotifier {
    session: SessionHandle,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        // Fired on songbird's driver thread; the handle funnels it back
        // into the guild's worker mailbox.
        self.session.track_ended(Ok(()));
        None
    }
}
