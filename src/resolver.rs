use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serenity::async_trait;
use tracing::info;

use crate::error::ResolveError;
use crate::track::Track;

const UNKNOWN_TRACK_TITLE: &str = "UNKNOWN TRACK";

/// Turns an opaque user query into a playable track.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<Track, ResolveError>;
}

/// Front door used by the command surface: wraps the configured resolver
/// with the lookup timeout so a hanging extractor fails one `play` instead
/// of blocking it forever.
pub struct ResolverGateway {
    resolver: Arc<dyn TrackResolver>,
    timeout: Duration,
}

impl ResolverGateway {
    pub fn new(resolver: Arc<dyn TrackResolver>, timeout: Duration) -> Self {
        ResolverGateway { resolver, timeout }
    }

    pub async fn resolve(&self, query: &str) -> Result<Track, ResolveError> {
        match tokio::time::timeout(self.timeout, self.resolver.resolve(query)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::TimedOut),
        }
    }
}

/// Direct links pass through untouched; anything else becomes a
/// single-result search.
fn build_lookup_target(query: &str) -> String {
    if query.starts_with("http://") || query.starts_with("https://") {
        query.to_string()
    } else {
        format!("ytsearch1:{query}")
    }
}

/// The subset of a `yt-dlp -j` record the bot cares about.
#[derive(Deserialize)]
struct LookupEntry {
    url: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
}

/// Metadata lookup backed by the `yt-dlp` binary. The subprocess blocks
/// for seconds, so it runs on the blocking thread pool.
pub struct YtDlpResolver;

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<Track, ResolveError> {
        let target = build_lookup_target(query);

        info!("Looking up {target}");

        let output = tokio::task::spawn_blocking(move || {
            Command::new("yt-dlp")
                .arg("-j")
                .arg("--no-playlist")
                .arg("--format")
                .arg("bestaudio/best")
                .arg(&target)
                .output()
        })
        .await
        .map_err(|error| ResolveError::LookupFailure(error.to_string()))?
        .map_err(|error| ResolveError::LookupFailure(error.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolveError::LookupFailure(stderr.trim().to_string()));
        }

        first_entry(&String::from_utf8_lossy(&output.stdout))
    }
}

/// `yt-dlp -j` prints one JSON record per line: a single record for direct
/// links, several for searches and playlists. Only the first one is kept.
fn first_entry(raw: &str) -> Result<Track, ResolveError> {
    let first = raw
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or(ResolveError::NoResults)?;

    let entry: LookupEntry = serde_json::from_str(first)
        .map_err(|error| ResolveError::LookupFailure(error.to_string()))?;

    let stream_url = entry.url.ok_or_else(|| {
        ResolveError::LookupFailure("response had no playable URL".to_string())
    })?;

    Ok(Track {
        stream_url,
        title: entry
            .title
            .unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
        duration_seconds: entry.duration.map(|secs| secs.max(0.0) as u64).unwrap_or(0),
    })
}
