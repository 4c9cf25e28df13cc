/// A resolved, playable track.
///
/// Produced by the resolver, consumed once by the playback engine. Stream
/// URLs are signed with an expiry upstream, so a track must not be cached
/// beyond one playback attempt.
#[derive(Clone, Debug)]
pub struct Track {
    pub stream_url: String,
    pub title: String,
    pub duration_seconds: u64,
}

impl Track {
    pub fn duration_display(&self) -> String {
        let minutes = self.duration_seconds / 60;
        let seconds = self.duration_seconds % 60;

        format!("{minutes}:{seconds:02}")
    }
}
