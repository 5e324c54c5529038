//! Remote Stream Registry: participant -> inbound media and display name.
//!
//! Observers subscribe to a `watch` channel and always see a complete
//! snapshot. The table is eventually consistent: an entry may carry a name
//! and no media (still negotiating) or media and no name (name relayed late).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::media::MediaKind;
use crate::signaling::ParticipantId;

pub const PLACEHOLDER_NAME: &str = "Guest";

/// One inbound track.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    remote: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            remote: None,
        }
    }

    pub fn from_remote(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
            remote: Some(track),
        }
    }

    /// The live RTP source, absent for tracks not backed by a connection.
    pub fn remote(&self) -> Option<&Arc<TrackRemote>> {
        self.remote.as_ref()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.stream_id == other.stream_id && self.kind == other.kind
    }
}

/// Media handle of a remote participant: every inbound track received so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteMedia {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    pub fn push(&mut self, track: RemoteTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStreamEntry {
    pub participant: ParticipantId,
    pub media: Option<RemoteMedia>,
    pub name: Option<String>,
}

impl RemoteStreamEntry {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(PLACEHOLDER_NAME)
    }
}

/// Partial update merged by [`RemoteStreamRegistry::upsert`].
#[derive(Debug, Clone, Default)]
pub struct RemoteStreamUpdate {
    pub media: Option<RemoteMedia>,
    pub name: Option<String>,
}

impl RemoteStreamUpdate {
    pub fn media(media: RemoteMedia) -> Self {
        Self {
            media: Some(media),
            name: None,
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            media: None,
            name: Some(name.into()),
        }
    }
}

pub type RemoteStreams = BTreeMap<ParticipantId, RemoteStreamEntry>;

pub struct RemoteStreamRegistry {
    streams: watch::Sender<RemoteStreams>,
}

impl Default for RemoteStreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStreamRegistry {
    pub fn new() -> Self {
        let (streams, _) = watch::channel(RemoteStreams::new());
        Self { streams }
    }

    pub fn subscribe(&self) -> watch::Receiver<RemoteStreams> {
        self.streams.subscribe()
    }

    /// Merges `update` without clobbering known fields. Blank names are ignored.
    pub fn upsert(&self, participant: &ParticipantId, update: RemoteStreamUpdate) {
        let name = update.name.filter(|n| !n.trim().is_empty());
        self.streams.send_modify(|streams| {
            let entry = streams
                .entry(participant.clone())
                .or_insert_with(|| RemoteStreamEntry {
                    participant: participant.clone(),
                    media: None,
                    name: None,
                });
            if let Some(media) = update.media {
                entry.media = Some(media);
            }
            if let Some(name) = name {
                entry.name = Some(name);
            }
        });
        debug!("Registry upsert for {}", participant);
    }

    pub fn remove(&self, participant: &ParticipantId) -> bool {
        let mut removed = false;
        self.streams.send_if_modified(|streams| {
            removed = streams.remove(participant).is_some();
            removed
        });
        if removed {
            debug!("Registry entry for {} removed", participant);
        }
        removed
    }

    pub fn clear(&self) {
        self.streams.send_if_modified(|streams| {
            let had_entries = !streams.is_empty();
            streams.clear();
            had_entries
        });
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<RemoteStreamEntry> {
        self.streams.borrow().get(participant).cloned()
    }

    pub fn snapshot(&self) -> RemoteStreams {
        self.streams.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.streams.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_media() -> RemoteMedia {
        let mut media = RemoteMedia::default();
        media.push(RemoteTrack::new("a1", "s1", MediaKind::Audio));
        media
    }

    #[test]
    fn name_then_media_are_merged() {
        let registry = RemoteStreamRegistry::new();
        let id = ParticipantId::from("b");

        registry.upsert(&id, RemoteStreamUpdate::name("Bob"));
        let entry = registry.get(&id).unwrap();
        assert!(entry.media.is_none());
        assert_eq!(entry.display_name(), "Bob");

        registry.upsert(&id, RemoteStreamUpdate::media(audio_media()));
        let entry = registry.get(&id).unwrap();
        assert_eq!(entry.name.as_deref(), Some("Bob"));
        assert!(entry.media.unwrap().has(MediaKind::Audio));
    }

    #[test]
    fn media_first_uses_placeholder_until_named() {
        let registry = RemoteStreamRegistry::new();
        let id = ParticipantId::from("b");

        registry.upsert(&id, RemoteStreamUpdate::media(audio_media()));
        assert_eq!(registry.get(&id).unwrap().display_name(), PLACEHOLDER_NAME);

        registry.upsert(&id, RemoteStreamUpdate::name("  "));
        assert!(registry.get(&id).unwrap().name.is_none());

        registry.upsert(&id, RemoteStreamUpdate::name("Bob"));
        registry.upsert(&id, RemoteStreamUpdate::name(""));
        assert_eq!(registry.get(&id).unwrap().display_name(), "Bob");
    }

    #[test]
    fn remove_unknown_is_noop() {
        let registry = RemoteStreamRegistry::new();
        let mut rx = registry.subscribe();
        assert!(!registry.remove(&ParticipantId::from("ghost")));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let registry = RemoteStreamRegistry::new();
        let mut rx = registry.subscribe();
        let id = ParticipantId::from("b");

        registry.upsert(&id, RemoteStreamUpdate::name("Bob"));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().contains_key(&id));

        registry.remove(&id);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn duplicate_tracks_are_not_repeated() {
        let mut media = audio_media();
        media.push(RemoteTrack::new("a1", "s1", MediaKind::Audio));
        media.push(RemoteTrack::new("v1", "s1", MediaKind::Video));
        assert_eq!(media.tracks.len(), 2);
    }
}
