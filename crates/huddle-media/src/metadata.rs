//! Presentation snapshots: the local copy that is broadcast and the per-link
//! view of the remote one.

use tracing::debug;

use huddle_shared::error::ProtocolError;
use huddle_shared::protocol::PresentationSnapshot;

/// The local participant's presentation. Every effective change bumps `seq`.
#[derive(Debug, Clone)]
pub struct LocalPresentation {
    snapshot: PresentationSnapshot,
}

impl LocalPresentation {
    pub fn new(name: impl Into<String>) -> Self {
        let mut snapshot = PresentationSnapshot::new(name);
        snapshot.seq = 1;
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &PresentationSnapshot {
        &self.snapshot
    }

    pub fn set_name(&mut self, name: &str) -> Option<PresentationSnapshot> {
        self.update(|s| s.name = name.to_string())
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> Option<PresentationSnapshot> {
        self.update(|s| s.audio_enabled = enabled)
    }

    pub fn set_video_enabled(&mut self, enabled: bool) -> Option<PresentationSnapshot> {
        self.update(|s| s.video_enabled = enabled)
    }

    pub fn set_mirrored(&mut self, mirrored: bool) -> Option<PresentationSnapshot> {
        self.update(|s| s.mirrored = mirrored)
    }

    /// Last snapshot sent before leaving. The stored state stays connected so
    /// a later join starts clean.
    pub fn farewell(&mut self) -> PresentationSnapshot {
        self.snapshot.seq += 1;
        PresentationSnapshot {
            connected: false,
            ..self.snapshot.clone()
        }
    }

    /// Returns the new snapshot only when something actually changed.
    fn update(&mut self, f: impl FnOnce(&mut PresentationSnapshot)) -> Option<PresentationSnapshot> {
        let before = self.snapshot.clone();
        f(&mut self.snapshot);
        if self.snapshot == before {
            return None;
        }
        self.snapshot.seq += 1;
        Some(self.snapshot.clone())
    }
}

/// Receive side of one link's `meta` channel.
#[derive(Debug, Default)]
pub struct RemotePresentation {
    current: Option<PresentationSnapshot>,
}

impl RemotePresentation {
    pub fn current(&self) -> Option<&PresentationSnapshot> {
        self.current.as_ref()
    }

    /// Whole-snapshot upsert. Unnumbered snapshots (`seq == 0`) always win;
    /// numbered ones must be newer than what is held. Returns the stored
    /// snapshot when the visible state changed.
    pub fn apply(&mut self, incoming: PresentationSnapshot) -> Option<&PresentationSnapshot> {
        if let Some(current) = &self.current {
            if incoming.seq != 0 && current.seq != 0 && incoming.seq <= current.seq {
                debug!(seq = incoming.seq, held = current.seq, "Ignoring stale snapshot");
                return None;
            }
            if same_presentation(current, &incoming) {
                self.current = Some(incoming);
                return None;
            }
        }
        self.current = Some(incoming);
        self.current.as_ref()
    }

    pub fn receive(&mut self, payload: &str) -> Result<Option<&PresentationSnapshot>, ProtocolError> {
        let snapshot = PresentationSnapshot::from_json(payload)?;
        Ok(self.apply(snapshot))
    }
}

fn same_presentation(a: &PresentationSnapshot, b: &PresentationSnapshot) -> bool {
    a.name == b.name
        && a.audio_enabled == b.audio_enabled
        && a.video_enabled == b.video_enabled
        && a.mirrored == b.mirrored
        && a.connected == b.connected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchanged_setter_is_silent() {
        let mut local = LocalPresentation::new("Ada");
        assert!(local.set_audio_enabled(true).is_none());
        assert_eq!(local.snapshot().seq, 1);

        let changed = local.set_audio_enabled(false).unwrap();
        assert!(!changed.audio_enabled);
        assert_eq!(changed.seq, 2);
    }

    #[test]
    fn test_farewell_is_not_sticky() {
        let mut local = LocalPresentation::new("Ada");
        let farewell = local.farewell();
        assert!(!farewell.connected);
        assert!(local.snapshot().connected);
        assert!(farewell.seq > 1);
    }

    #[test]
    fn test_remote_converges_to_latest() {
        let mut local = LocalPresentation::new("Ada");
        let first = local.set_video_enabled(false).unwrap();
        let second = local.set_mirrored(true).unwrap();

        let mut remote = RemotePresentation::default();
        assert!(remote.apply(second.clone()).is_some());
        assert!(remote.apply(first).is_none());
        assert_eq!(remote.current(), Some(&second));
    }

    #[test]
    fn test_unnumbered_snapshots_always_apply() {
        let mut remote = RemotePresentation::default();
        let mut numbered = PresentationSnapshot::new("Ada");
        numbered.seq = 9;
        remote.apply(numbered);

        let mut browser = PresentationSnapshot::new("Ada");
        browser.audio_enabled = false;
        let applied = remote.apply(browser).cloned();
        assert_eq!(applied.map(|s| s.audio_enabled), Some(false));
    }

    #[test]
    fn test_receive_rejects_garbage() {
        let mut remote = RemotePresentation::default();
        assert!(remote.receive("not json").is_err());
        assert!(remote.current().is_none());
    }
}
