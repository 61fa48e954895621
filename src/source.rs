//! Recognition of the video-sharing URLs a conversion may start from.

use std::fmt;

use thiserror::Error;
use url::Url;

const VIDEO_ID_LEN: usize = 11;

const LONG_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
];

const SHORT_HOSTS: &[&str] = &["youtu.be", "www.youtu.be"];

// Path prefixes that are followed by the video id, e.g. `/shorts/<id>`.
const ID_PATH_PREFIXES: &[&str] = &["shorts", "embed", "v", "live"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceUrlError {
    #[error("no URL provided")]
    Empty,
    #[error("not a valid absolute URL")]
    Malformed,
    #[error("unsupported URL scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("`{0}` is not a supported video host")]
    UnsupportedHost(String),
    #[error("URL does not contain a video id")]
    MissingVideoId,
}

/// A validated source URL. The raw input is kept verbatim; the video id is
/// what workers actually need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    raw: String,
    video_id: String,
}

impl SourceUrl {
    pub fn parse(input: &str) -> Result<Self, SourceUrlError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SourceUrlError::Empty);
        }

        let url = Url::parse(trimmed).map_err(|_| SourceUrlError::Malformed)?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(SourceUrlError::UnsupportedScheme(other.to_string())),
        }

        let host = url
            .host_str()
            .ok_or(SourceUrlError::Malformed)?
            .to_ascii_lowercase();
        let candidate = if SHORT_HOSTS.contains(&host.as_str()) {
            url.path_segments()
                .and_then(|mut segments| segments.next())
                .map(str::to_string)
        } else if LONG_HOSTS.contains(&host.as_str()) {
            video_id_from_long_url(&url)
        } else {
            return Err(SourceUrlError::UnsupportedHost(host));
        };

        let video_id = candidate
            .filter(|id| is_video_id(id))
            .ok_or(SourceUrlError::MissingVideoId)?;

        Ok(Self {
            raw: trimmed.to_string(),
            video_id,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Watch URL without playlist or tracking parameters. Workers receive
    /// this instead of the raw input so a `&list=` suffix cannot turn one
    /// conversion into a playlist download.
    pub fn canonical(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.video_id)
    }
}

impl fmt::Display for SourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn video_id_from_long_url(url: &Url) -> Option<String> {
    if url.path().trim_end_matches('/') == "/watch" {
        return url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned());
    }

    let mut segments = url.path_segments()?;
    let first = segments.next()?;
    if ID_PATH_PREFIXES.contains(&first) {
        segments.next().map(str::to_string)
    } else {
        None
    }
}

fn is_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
