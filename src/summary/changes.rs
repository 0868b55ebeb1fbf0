//! Change sets produced by check and sync.

/// Uids added, removed, changed or newly arrived during one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeInfo {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub recent: Vec<String>,
}

impl ChangeInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_uid(&mut self, uid: &str) {
        push_unique(&mut self.added, uid);
    }

    /// Record a removal. A uid added earlier in the same set cancels out.
    pub fn remove_uid(&mut self, uid: &str) {
        if let Some(pos) = self.added.iter().position(|u| u == uid) {
            self.added.remove(pos);
            self.recent.retain(|u| u != uid);
            self.changed.retain(|u| u != uid);
            return;
        }
        self.changed.retain(|u| u != uid);
        push_unique(&mut self.removed, uid);
    }

    pub fn change_uid(&mut self, uid: &str) {
        if self.added.iter().any(|u| u == uid) {
            return;
        }
        push_unique(&mut self.changed, uid);
    }

    pub fn recent_uid(&mut self, uid: &str) {
        push_unique(&mut self.recent, uid);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.recent.is_empty()
    }

    pub fn clear(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.changed.clear();
        self.recent.clear();
    }
}

fn push_unique(list: &mut Vec<String>, uid: &str) {
    if !list.iter().any(|u| u == uid) {
        list.push(uid.to_string());
    }
}

/// Consumer of change sets.
pub trait ChangeSink {
    fn notify(&self, changes: &ChangeInfo);
}

impl<F: Fn(&ChangeInfo)> ChangeSink for F {
    fn notify(&self, changes: &ChangeInfo) {
        self(changes)
    }
}
