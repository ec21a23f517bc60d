use huddle_shared::types::PeerId;

/// Which tile is enlarged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusTarget {
    Local,
    Peer(PeerId),
}

#[derive(Debug, Default)]
pub struct FocusState {
    current: Option<FocusTarget>,
}

impl FocusState {
    pub fn current(&self) -> Option<&FocusTarget> {
        self.current.as_ref()
    }

    /// Returns `true` if the focus changed.
    pub fn set(&mut self, target: Option<FocusTarget>) -> bool {
        if self.current == target {
            return false;
        }
        self.current = target;
        true
    }

    /// Drop focus from a peer that went away.
    pub fn clear_if_peer(&mut self, peer: &PeerId) -> bool {
        if matches!(&self.current, Some(FocusTarget::Peer(p)) if p == peer) {
            self.current = None;
            return true;
        }
        false
    }
}
