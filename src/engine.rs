use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serenity::async_trait;
use serenity::model::id::ChannelId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::queue::QueueStore;
use crate::track::Track;

/// Voice connection and sink control, as the engine needs it. Implemented
/// over songbird in production and mocked in tests.
#[async_trait]
pub trait AudioBackend: Send + Sync + 'static {
    /// Joins the voice channel (or moves the existing connection there) and
    /// remembers where track announcements for this guild should go.
    async fn connect(
        &self,
        guild_id: u64,
        voice_channel: ChannelId,
        announce_channel: ChannelId,
    ) -> Result<(), PlayerError>;

    async fn disconnect(&self, guild_id: u64) -> Result<(), PlayerError>;

    /// Starts streaming the track. Exactly one completion must eventually
    /// reach `session.track_ended`, whether the track ends naturally, is
    /// halted, or dies mid-stream.
    async fn play(
        &self,
        guild_id: u64,
        track: &Track,
        session: SessionHandle,
    ) -> Result<(), PlayerError>;

    async fn pause(&self, guild_id: u64) -> Result<(), PlayerError>;

    async fn resume(&self, guild_id: u64) -> Result<(), PlayerError>;

    /// Halts the current track, firing the same completion as a natural
    /// end. Must tolerate nothing playing.
    async fn stop(&self, guild_id: u64) -> Result<(), PlayerError>;
}

/// Lifecycle of a guild's playback session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionStatus {
    Idle,
    Starting,
    Playing,
    Paused,
}

/// What the command surface should tell the user after a play request.
#[derive(Debug)]
pub enum PlayOutcome {
    /// Playback started; the backend announces the track itself.
    Started(String),
    /// Something was already playing, the track joined the queue.
    Queued(String),
}

/// Delivers sink completions back into the owning guild's mailbox. The
/// sink may fire from any thread; the message always lands in the same
/// single-consumer worker, so completions can never race an `advance`.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl SessionHandle {
    pub fn track_ended(&self, result: Result<(), PlayerError>) {
        // The worker may already be gone during shutdown.
        let _ = self.tx.send(WorkerMessage::TrackEnded(result));
    }
}

type Reply = oneshot::Sender<Result<(), PlayerError>>;

enum WorkerMessage {
    Play {
        voice_channel: ChannelId,
        announce_channel: ChannelId,
        track: Track,
        reply: oneshot::Sender<Result<PlayOutcome, PlayerError>>,
    },
    Skip { reply: Reply },
    Pause { reply: Reply },
    Resume { reply: Reply },
    Stop { reply: Reply },
    /// The platform dropped our voice connection; reset without driving
    /// the (gone) connection.
    Reset,
    TrackEnded(Result<(), PlayerError>),
}

/// Per-guild playback controller.
///
/// Every guild gets its own worker task with a FIFO mailbox; commands and
/// sink completions are messages into that mailbox, so state transitions
/// and queue mutations for one guild form a total order while guilds stay
/// fully independent of each other.
pub struct Player {
    backend: Arc<dyn AudioBackend>,
    queues: Arc<QueueStore>,
    workers: Mutex<HashMap<u64, mpsc::UnboundedSender<WorkerMessage>>>,
}

impl Player {
    pub fn new(backend: Arc<dyn AudioBackend>, queues: Arc<QueueStore>) -> Self {
        Player {
            backend,
            queues,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn play(
        &self,
        guild_id: u64,
        voice_channel: ChannelId,
        announce_channel: ChannelId,
        track: Track,
    ) -> Result<PlayOutcome, PlayerError> {
        let (reply, outcome) = oneshot::channel();

        self.worker(guild_id)
            .send(WorkerMessage::Play {
                voice_channel,
                announce_channel,
                track,
                reply,
            })
            .map_err(|_| PlayerError::EngineClosed)?;

        outcome.await.map_err(|_| PlayerError::EngineClosed)?
    }

    pub async fn skip(&self, guild_id: u64) -> Result<(), PlayerError> {
        self.control(guild_id, |reply| WorkerMessage::Skip { reply })
            .await
    }

    pub async fn pause(&self, guild_id: u64) -> Result<(), PlayerError> {
        self.control(guild_id, |reply| WorkerMessage::Pause { reply })
            .await
    }

    pub async fn resume(&self, guild_id: u64) -> Result<(), PlayerError> {
        self.control(guild_id, |reply| WorkerMessage::Resume { reply })
            .await
    }

    pub async fn stop(&self, guild_id: u64) -> Result<(), PlayerError> {
        self.control(guild_id, |reply| WorkerMessage::Stop { reply })
            .await
    }

    /// The bot was disconnected from voice externally (kicked, channel
    /// deleted). Drop the guild's pipeline without touching the connection.
    pub fn reset(&self, guild_id: u64) {
        let workers = self.workers.lock().expect("worker map lock poisoned");
        if let Some(worker) = workers.get(&guild_id) {
            let _ = worker.send(WorkerMessage::Reset);
        }
    }

    /// Read-only queue listing. `None` means the guild never queued
    /// anything; `Some` but empty means it did and the queue drained.
    pub fn queue_snapshot(&self, guild_id: u64) -> Option<Vec<Track>> {
        self.queues.snapshot(guild_id)
    }

    async fn control<F>(&self, guild_id: u64, message: F) -> Result<(), PlayerError>
    where
        F: FnOnce(Reply) -> WorkerMessage,
    {
        let worker = {
            let workers = self.workers.lock().expect("worker map lock poisoned");
            workers.get(&guild_id).cloned()
        };

        // No worker means the guild never started a session.
        let worker = worker.ok_or(PlayerError::NotConnected)?;

        let (reply, outcome) = oneshot::channel();
        worker
            .send(message(reply))
            .map_err(|_| PlayerError::EngineClosed)?;

        outcome.await.map_err(|_| PlayerError::EngineClosed)?
    }

    fn worker(&self, guild_id: u64) -> mpsc::UnboundedSender<WorkerMessage> {
        let mut workers = self.workers.lock().expect("worker map lock poisoned");

        workers
            .entry(guild_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();

                let worker = GuildWorker {
                    guild_id,
                    backend: self.backend.clone(),
                    queues: self.queues.clone(),
                    session: SessionHandle { tx: tx.clone() },
                    status: SessionStatus::Idle,
                };
                tokio::spawn(worker.run(rx));

                tx
            })
            .clone()
    }
}

struct GuildWorker {
    guild_id: u64,
    backend: Arc<dyn AudioBackend>,
    queues: Arc<QueueStore>,
    session: SessionHandle,
    status: SessionStatus,
}

impl GuildWorker {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<WorkerMessage>) {
        while let Some(message) = mailbox.recv().await {
            match message {
                WorkerMessage::Play {
                    voice_channel,
                    announce_channel,
                    track,
                    reply,
                } => {
                    let outcome = self.handle_play(voice_channel, announce_channel, track).await;
                    let _ = reply.send(outcome);
                }
                WorkerMessage::Skip { reply } => {
                    let _ = reply.send(self.handle_skip().await);
                }
                WorkerMessage::Pause { reply } => {
                    let _ = reply.send(self.handle_pause().await);
                }
                WorkerMessage::Resume { reply } => {
                    let _ = reply.send(self.handle_resume().await);
                }
                WorkerMessage::Stop { reply } => {
                    let _ = reply.send(self.handle_stop().await);
                }
                WorkerMessage::Reset => self.handle_reset().await,
                WorkerMessage::TrackEnded(result) => self.handle_track_ended(result).await,
            }
        }
    }

    async fn handle_play(
        &mut self,
        voice_channel: ChannelId,
        announce_channel: ChannelId,
        track: Track,
    ) -> Result<PlayOutcome, PlayerError> {
        let title = track.title.clone();

        if self.status != SessionStatus::Idle {
            self.queues.enqueue(self.guild_id, track);
            info!("guild {}: queued {title}", self.guild_id);
            return Ok(PlayOutcome::Queued(title));
        }

        self.backend
            .connect(self.guild_id, voice_channel, announce_channel)
            .await?;

        self.queues.enqueue(self.guild_id, track);
        self.advance().await;

        if self.status == SessionStatus::Idle {
            // The freshly queued track failed to start and the queue drained.
            return Err(PlayerError::Sink(format!("could not start {title}")));
        }

        Ok(PlayOutcome::Started(title))
    }

    async fn handle_skip(&mut self) -> Result<(), PlayerError> {
        match self.status {
            SessionStatus::Playing | SessionStatus::Paused => {
                info!("guild {}: skipping current track", self.guild_id);
                // Halting the sink fires the same completion as a natural
                // end; the next track starts from that message.
                self.backend.stop(self.guild_id).await
            }
            _ => Err(PlayerError::NothingPlaying),
        }
    }

    async fn handle_pause(&mut self) -> Result<(), PlayerError> {
        match self.status {
            SessionStatus::Playing => {
                self.backend.pause(self.guild_id).await?;
                self.status = SessionStatus::Paused;
                Ok(())
            }
            SessionStatus::Paused => Err(PlayerError::AlreadyPaused),
            _ => Err(PlayerError::NothingPlaying),
        }
    }

    async fn handle_resume(&mut self) -> Result<(), PlayerError> {
        match self.status {
            SessionStatus::Paused => {
                self.backend.resume(self.guild_id).await?;
                self.status = SessionStatus::Playing;
                Ok(())
            }
            SessionStatus::Playing | SessionStatus::Starting => Err(PlayerError::NotPaused),
            SessionStatus::Idle => Err(PlayerError::NothingPlaying),
        }
    }

    async fn handle_stop(&mut self) -> Result<(), PlayerError> {
        if self.status == SessionStatus::Idle {
            return Err(PlayerError::NotConnected);
        }

        info!("guild {}: stop, clearing queue and disconnecting", self.guild_id);
        self.queues.clear(self.guild_id);

        if let Err(error) = self.backend.stop(self.guild_id).await {
            debug!("guild {}: halt on stop failed: {error}", self.guild_id);
        }

        // Going Idle first: the halt above fires a completion, and an Idle
        // worker drops it as stale instead of restarting playback.
        self.status = SessionStatus::Idle;
        self.backend.disconnect(self.guild_id).await
    }

    async fn handle_reset(&mut self) {
        info!("guild {}: voice connection dropped, resetting", self.guild_id);
        self.queues.clear(self.guild_id);

        if self.status != SessionStatus::Idle {
            if let Err(error) = self.backend.stop(self.guild_id).await {
                debug!("guild {}: halt on reset failed: {error}", self.guild_id);
            }
        }

        self.status = SessionStatus::Idle;
    }

    async fn handle_track_ended(&mut self, result: Result<(), PlayerError>) {
        if self.status == SessionStatus::Idle {
            // Completion of a track that stop/reset already dealt with.
            debug!("guild {}: stale completion ignored", self.guild_id);
            return;
        }

        if let Err(error) = result {
            warn!("guild {}: sink error, moving on: {error}", self.guild_id);
        }

        self.advance().await;
    }

    /// Pulls queued tracks until one starts or the queue drains. Only ever
    /// runs on this worker's task, so per guild there is at most one
    /// advance in flight.
    async fn advance(&mut self) {
        loop {
            let Some(track) = self.queues.dequeue_front(self.guild_id) else {
                info!("guild {}: queue drained, disconnecting", self.guild_id);
                if let Err(error) = self.backend.disconnect(self.guild_id).await {
                    warn!("guild {}: disconnect failed: {error}", self.guild_id);
                }
                self.status = SessionStatus::Idle;
                return;
            };

            self.status = SessionStatus::Starting;

            match self
                .backend
                .play(self.guild_id, &track, self.session.clone())
                .await
            {
                Ok(()) => {
                    info!("guild {}: now playing {}", self.guild_id, track.title);
                    self.status = SessionStatus::Playing;
                    return;
                }
                Err(error) => {
                    // One bad track must not stall the pipeline.
                    warn!(
                        "guild {}: failed to start {}: {error}",
                        self.guild_id, track.title
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const GUILD: u64 = 42;
    const VOICE: ChannelId = ChannelId(100);
    const TEXT: ChannelId = ChannelId(200);

    fn track(title: &str) -> Track {
        Track {
            stream_url: format!("https://cdn.example.com/{title}"),
            title: title.to_string(),
            duration_seconds: 180,
        }
    }

    /// Sink double: records every call and hands completion control to the
    /// test, mirroring the real contract (halting fires the completion).
    struct MockBackend {
        log: Mutex<Vec<String>>,
        live: Mutex<HashMap<u64, SessionHandle>>,
        rejected_urls: Mutex<HashSet<String>>,
    }

    impl MockBackend {
        fn new() -> Arc<Self> {
            Arc::new(MockBackend {
                log: Mutex::new(Vec::new()),
                live: Mutex::new(HashMap::new()),
                rejected_urls: Mutex::new(HashSet::new()),
            })
        }

        fn reject(&self, track: &Track) {
            self.rejected_urls
                .lock()
                .unwrap()
                .insert(track.stream_url.clone());
        }

        /// Natural end of the current track.
        fn finish(&self, guild_id: u64) {
            let session = self.live.lock().unwrap().remove(&guild_id);
            session.expect("a track is live").track_ended(Ok(()));
        }

        /// Mid-stream failure of the current track.
        fn fail_current(&self, guild_id: u64) {
            let session = self.live.lock().unwrap().remove(&guild_id);
            session
                .expect("a track is live")
                .track_ended(Err(PlayerError::Sink("stream died".to_string())));
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn plays(&self) -> Vec<String> {
            self.log()
                .into_iter()
                .filter(|entry| entry.starts_with("play:"))
                .collect()
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl AudioBackend for MockBackend {
        async fn connect(
            &self,
            guild_id: u64,
            voice_channel: ChannelId,
            _announce_channel: ChannelId,
        ) -> Result<(), PlayerError> {
            self.record(format!("connect:{guild_id}:{voice_channel}"));
            Ok(())
        }

        async fn disconnect(&self, guild_id: u64) -> Result<(), PlayerError> {
            self.live.lock().unwrap().remove(&guild_id);
            self.record(format!("disconnect:{guild_id}"));
            Ok(())
        }

        async fn play(
            &self,
            guild_id: u64,
            track: &Track,
            session: SessionHandle,
        ) -> Result<(), PlayerError> {
            if self.rejected_urls.lock().unwrap().contains(&track.stream_url) {
                self.record(format!("reject:{}", track.title));
                return Err(PlayerError::Sink("unreachable stream".to_string()));
            }

            self.live.lock().unwrap().insert(guild_id, session);
            self.record(format!("play:{}", track.title));
            Ok(())
        }

        async fn pause(&self, guild_id: u64) -> Result<(), PlayerError> {
            self.record(format!("pause:{guild_id}"));
            Ok(())
        }

        async fn resume(&self, guild_id: u64) -> Result<(), PlayerError> {
            self.record(format!("resume:{guild_id}"));
            Ok(())
        }

        async fn stop(&self, guild_id: u64) -> Result<(), PlayerError> {
            self.record(format!("halt:{guild_id}"));
            if let Some(session) = self.live.lock().unwrap().remove(&guild_id) {
                session.track_ended(Ok(()));
            }
            Ok(())
        }
    }

    fn player(backend: Arc<MockBackend>) -> Player {
        Player::new(backend, Arc::new(QueueStore::new()))
    }

    /// Probes worker state through the mailbox. Because the mailbox is
    /// FIFO, the reply is only produced after every previously injected
    /// completion has been processed.
    async fn is_playing(player: &Player, guild_id: u64) -> bool {
        match player.pause(guild_id).await {
            Ok(()) => {
                player.resume(guild_id).await.expect("undo probe pause");
                true
            }
            Err(PlayerError::AlreadyPaused) => true,
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn first_play_starts_later_plays_queue() {
        let backend = MockBackend::new();
        let player = player(backend.clone());

        assert!(player.queue_snapshot(GUILD).is_none());

        let outcome = player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Started(ref title) if title == "a"));
        assert_eq!(player.queue_snapshot(GUILD).unwrap().len(), 0);

        let outcome = player.play(GUILD, VOICE, TEXT, track("b")).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Queued(ref title) if title == "b"));
        let pending = player.queue_snapshot(GUILD).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "b");

        // a finishes: b is pulled and started.
        backend.finish(GUILD);
        assert!(is_playing(&player, GUILD).await);
        assert_eq!(backend.plays(), vec!["play:a", "play:b"]);

        // b finishes with nothing queued: session ends, connection drops.
        backend.finish(GUILD);
        assert!(matches!(
            player.pause(GUILD).await,
            Err(PlayerError::NothingPlaying)
        ));
        assert!(backend.log().contains(&format!("disconnect:{GUILD}")));
    }

    #[tokio::test]
    async fn skip_selects_the_same_next_track_as_natural_end() {
        let natural = MockBackend::new();
        let natural_player = player(natural.clone());
        natural_player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();
        natural_player.play(GUILD, VOICE, TEXT, track("b")).await.unwrap();
        natural.finish(GUILD);
        assert!(is_playing(&natural_player, GUILD).await);

        let skipped = MockBackend::new();
        let skipped_player = player(skipped.clone());
        skipped_player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();
        skipped_player.play(GUILD, VOICE, TEXT, track("b")).await.unwrap();
        skipped_player.skip(GUILD).await.unwrap();
        assert!(is_playing(&skipped_player, GUILD).await);

        assert_eq!(natural.plays(), skipped.plays());

        // Both pipelines also end the same way once the queue is empty.
        natural.finish(GUILD);
        skipped.finish(GUILD);
        assert!(!is_playing(&natural_player, GUILD).await);
        assert!(!is_playing(&skipped_player, GUILD).await);
        assert!(natural.log().contains(&format!("disconnect:{GUILD}")));
        assert!(skipped.log().contains(&format!("disconnect:{GUILD}")));
    }

    #[tokio::test]
    async fn stop_clears_queue_and_ignores_the_late_completion() {
        let backend = MockBackend::new();
        let player = player(backend.clone());

        player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();
        player.play(GUILD, VOICE, TEXT, track("b")).await.unwrap();

        player.stop(GUILD).await.unwrap();

        // Empty, not "never queued".
        assert_eq!(player.queue_snapshot(GUILD).unwrap().len(), 0);
        assert!(backend.log().contains(&format!("disconnect:{GUILD}")));

        // The halt fired a completion; an idle worker must not restart b.
        assert!(matches!(
            player.skip(GUILD).await,
            Err(PlayerError::NothingPlaying)
        ));
        assert_eq!(backend.plays(), vec!["play:a"]);
    }

    #[tokio::test]
    async fn pause_and_resume_enforce_their_preconditions() {
        let backend = MockBackend::new();
        let player = player(backend.clone());

        // Never-seen guild: no session at all.
        assert!(matches!(
            player.pause(GUILD).await,
            Err(PlayerError::NotConnected)
        ));

        player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();

        assert!(matches!(
            player.resume(GUILD).await,
            Err(PlayerError::NotPaused)
        ));
        player.pause(GUILD).await.unwrap();
        assert!(matches!(
            player.pause(GUILD).await,
            Err(PlayerError::AlreadyPaused)
        ));
        player.resume(GUILD).await.unwrap();

        // Paused sessions can still be skipped.
        player.pause(GUILD).await.unwrap();
        player.skip(GUILD).await.unwrap();
        assert!(matches!(
            player.pause(GUILD).await,
            Err(PlayerError::NothingPlaying)
        ));
    }

    #[tokio::test]
    async fn mid_stream_sink_error_advances_to_the_next_track() {
        let backend = MockBackend::new();
        let player = player(backend.clone());

        player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();
        player.play(GUILD, VOICE, TEXT, track("b")).await.unwrap();

        backend.fail_current(GUILD);

        assert!(is_playing(&player, GUILD).await);
        assert_eq!(backend.plays(), vec!["play:a", "play:b"]);
    }

    #[tokio::test]
    async fn unstartable_tracks_are_drained_until_one_plays() {
        let backend = MockBackend::new();
        let player = player(backend.clone());

        let bad = track("bad");
        backend.reject(&bad);

        player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();
        player.play(GUILD, VOICE, TEXT, bad).await.unwrap();
        player.play(GUILD, VOICE, TEXT, track("c")).await.unwrap();

        backend.finish(GUILD);

        assert!(is_playing(&player, GUILD).await);
        assert_eq!(backend.plays(), vec!["play:a", "play:c"]);
        assert!(backend.log().contains(&"reject:bad".to_string()));
    }

    #[tokio::test]
    async fn play_fails_cleanly_when_the_only_track_cannot_start() {
        let backend = MockBackend::new();
        let player = player(backend.clone());

        let bad = track("bad");
        backend.reject(&bad);

        assert!(matches!(
            player.play(GUILD, VOICE, TEXT, bad).await,
            Err(PlayerError::Sink(_))
        ));
        assert!(backend.log().contains(&format!("disconnect:{GUILD}")));
        // The guild is back to Idle and can start over.
        let outcome = player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Started(_)));
    }

    #[tokio::test]
    async fn external_disconnect_resets_the_pipeline() {
        let backend = MockBackend::new();
        let player = player(backend.clone());

        player.play(GUILD, VOICE, TEXT, track("a")).await.unwrap();
        player.play(GUILD, VOICE, TEXT, track("b")).await.unwrap();

        player.reset(GUILD);

        // Mailbox FIFO: this probe runs after the reset was handled.
        assert!(matches!(
            player.skip(GUILD).await,
            Err(PlayerError::NothingPlaying)
        ));
        assert_eq!(player.queue_snapshot(GUILD).unwrap().len(), 0);
        assert_eq!(backend.plays(), vec!["play:a"]);
    }

    #[tokio::test]
    async fn guilds_are_isolated_from_each_other() {
        let backend = MockBackend::new();
        let player = player(backend.clone());

        player.play(1, VOICE, TEXT, track("one-a")).await.unwrap();
        player.play(2, VOICE, TEXT, track("two-a")).await.unwrap();
        player.play(2, VOICE, TEXT, track("two-b")).await.unwrap();

        backend.fail_current(1);

        // Guild 1 drained and went idle; guild 2 is untouched.
        assert!(!is_playing(&player, 1).await);
        assert!(is_playing(&player, 2).await);
        assert_eq!(player.queue_snapshot(2).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn controls_on_an_unknown_guild_report_not_connected() {
        let backend = MockBackend::new();
        let player = player(backend);

        assert!(matches!(
            player.skip(GUILD).await,
            Err(PlayerError::NotConnected)
        ));
        assert!(matches!(
            player.stop(GUILD).await,
            Err(PlayerError::NotConnected)
        ));
        assert!(player.queue_snapshot(GUILD).is_none());
    }
}
