//! Local capture tracks and the media source collaborator.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use huddle_shared::types::MediaKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Timed out waiting for media")]
    Timeout,
}

/// Where the outgoing video comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    Camera { device_id: Option<String> },
    Screen,
}

impl VideoSource {
    pub fn camera() -> Self {
        VideoSource::Camera { device_id: None }
    }

    pub fn is_screen(&self) -> bool {
        matches!(self, VideoSource::Screen)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera { device_id: Option<String> },
    Screen,
}

/// A handle on one live capture track. The id is unique per acquisition, so
/// a re-acquired camera yields a different track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub source: TrackSource,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, source: TrackSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            source,
        }
    }
}

/// At most one outgoing track per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSet {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl TrackSet {
    pub fn get(&self, kind: MediaKind) -> Option<&LocalTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub fn insert(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        let slot = match track.kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        };
        slot.replace(track)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    /// Tracks of `self` that differ from the track of the same kind in
    /// `previous`.
    pub fn replacements<'a>(
        &'a self,
        previous: &'a TrackSet,
    ) -> impl Iterator<Item = &'a LocalTrack> {
        self.iter()
            .filter(move |track| previous.get(track.kind).map(|t| &t.id) != Some(&track.id))
    }

    /// Overlay `newer` onto `self`. Returns the combined set and the tracks of
    /// `self` that were displaced and must be stopped.
    pub fn overlay(&self, newer: &TrackSet) -> (TrackSet, TrackSet) {
        let mut merged = self.clone();
        let mut displaced = TrackSet::default();
        for track in newer.iter() {
            if let Some(old) = merged.insert(track.clone()) {
                if old.id != track.id {
                    displaced.insert(old);
                }
            }
        }
        (merged, displaced)
    }
}

/// Platform capture devices.
///
/// Acquisition may wait on a permission prompt; callers bound it with
/// `SessionConfig::media_timeout`.
#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    /// Microphone plus camera.
    async fn acquire_camera(&self, device_id: Option<&str>) -> Result<TrackSet, MediaError>;

    /// Screen video only.
    async fn acquire_screen_capture(&self) -> Result<TrackSet, MediaError>;

    /// Mute or unmute the current local track of `kind`.
    fn set_enabled(&self, kind: MediaKind, enabled: bool);

    /// Release the devices behind `tracks`.
    fn stop(&self, tracks: &TrackSet);
}
