//! Media load payload for the receiver application.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::Track;

pub const DEFAULT_CONTENT_TYPE: &str = "audio/mp3";
pub const UNKNOWN_ARTIST: &str = "Unknown artist";

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]\s*").expect("bracket pattern is valid"));

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamType {
    Buffered,
    Live,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageSize {
    Small,
    Large,
}

impl ImageSize {
    fn artwork_suffix(&self) -> &'static str {
        match self {
            ImageSize::Small => "t67x67",
            ImageSize::Large => "t500x500",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaImage {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    #[serde(rename = "type")]
    pub kind: u8,
    pub metadata_type: u8,
    pub title: String,
    pub artist: String,
    pub images: Vec<MediaImage>,
}

/// What the receiver shows as "up next".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTrackPreview {
    pub title: String,
    pub artist: String,
    pub images: Vec<MediaImage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomData {
    pub next_track: Option<NextTrackPreview>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub content_id: String,
    pub content_type: String,
    pub stream_type: StreamType,
    pub metadata: MediaMetadata,
    pub custom_data: CustomData,
}

/// Turns catalog tracks into URLs the receiver can fetch.
pub trait StreamUrlResolver: Send + Sync {
    fn stream_url(&self, track: &Track) -> String;

    fn image_url(&self, track: &Track, size: ImageSize) -> Option<String>;

    fn content_type(&self) -> &str {
        DEFAULT_CONTENT_TYPE
    }
}

/// Resolver for the streaming API: appends the API client id to stream URLs
/// and picks the artwork variant matching the image size.
#[derive(Clone, Debug)]
pub struct ClientIdResolver {
    client_id: String,
    content_type: String,
}

impl ClientIdResolver {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    pub fn from_config(config: &crate::config::StreamingConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            content_type: config.content_type.clone(),
        }
    }

    fn append_client_id(&self, url: &str) -> String {
        if self.client_id.is_empty() {
            return url.to_string();
        }
        match Url::parse(url) {
            Ok(mut parsed) => {
                parsed
                    .query_pairs_mut()
                    .append_pair("client_id", &self.client_id);
                parsed.to_string()
            }
            Err(_) => {
                let separator = if url.contains('?') { '&' } else { '?' };
                format!("{}{}client_id={}", url, separator, self.client_id)
            }
        }
    }
}

impl StreamUrlResolver for ClientIdResolver {
    fn stream_url(&self, track: &Track) -> String {
        match &track.stream_url {
            Some(url) => self.append_client_id(url),
            None => self.append_client_id(&format!("{}/stream", track.uri)),
        }
    }

    fn image_url(&self, track: &Track, size: ImageSize) -> Option<String> {
        let artwork = track
            .artwork_url
            .as_ref()
            .or_else(|| track.user.as_ref().and_then(|u| u.avatar_url.as_ref()))?;
        Some(artwork.replace("large", size.artwork_suffix()))
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }
}

/// Removes bracketed annotations (`[...]`) and the whitespace following them.
///
/// `"Song [Remix Edit]"` becomes `"Song "`.
pub fn sanitize_title(title: &str) -> String {
    BRACKETED.replace_all(title, "").into_owned()
}

fn artist_of(track: &Track) -> String {
    track
        .user
        .as_ref()
        .map(|user| user.username.clone())
        .unwrap_or_else(|| UNKNOWN_ARTIST.to_string())
}

fn images_of(track: &Track, resolver: &dyn StreamUrlResolver) -> Vec<MediaImage> {
    [ImageSize::Small, ImageSize::Large]
        .iter()
        .filter_map(|size| resolver.image_url(track, *size))
        .map(|url| MediaImage { url })
        .collect()
}

/// Builds the load payload for `track`, announcing `next_track` when the
/// queue has one.
pub fn build_media_descriptor(
    track: &Track,
    next_track: Option<&Track>,
    resolver: &dyn StreamUrlResolver,
) -> MediaDescriptor {
    let next_track = next_track.map(|next| NextTrackPreview {
        title: sanitize_title(&next.title),
        artist: artist_of(next),
        images: images_of(next, resolver),
    });

    MediaDescriptor {
        content_id: resolver.stream_url(track),
        content_type: resolver.content_type().to_string(),
        stream_type: StreamType::Buffered,
        metadata: MediaMetadata {
            kind: 0,
            metadata_type: 0,
            title: sanitize_title(&track.title),
            artist: artist_of(track),
            images: images_of(track, resolver),
        },
        custom_data: CustomData { next_track },
    }
}
