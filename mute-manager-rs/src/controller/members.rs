//! Observable collection of member controllers.

use super::SharedControl;
use crate::audio::DeviceId;
use crate::events::{lock, Notifier, Subscription};
use std::sync::Mutex;
use tracing::debug;

/// Members added and removed in one batch.
#[derive(Clone, Default)]
pub struct MembershipChange {
    pub added: Vec<SharedControl>,
    pub removed: Vec<SharedControl>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl std::fmt::Debug for MembershipChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = |members: &[SharedControl]| -> Vec<DeviceId> {
            members.iter().map(|m| m.device_id()).collect()
        };
        f.debug_struct("MembershipChange")
            .field("added", &ids(&self.added))
            .field("removed", &ids(&self.removed))
            .finish()
    }
}

/// Members of an aggregate, keyed by device id.
///
/// Changes are applied in batches and every non-empty batch is published as
/// one [`MembershipChange`]. Batches are serialized including publication.
#[derive(Default)]
pub struct MemberSet {
    members: Mutex<Vec<SharedControl>>,
    batch: Mutex<()>,
    notifier: Notifier<MembershipChange>,
}

impl MemberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<SharedControl> {
        lock(&self.members).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.members).is_empty()
    }

    pub fn get(&self, id: &DeviceId) -> Option<SharedControl> {
        lock(&self.members)
            .iter()
            .find(|m| &m.device_id() == id)
            .cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.get(id).is_some()
    }

    /// Add and remove members in one batch.
    ///
    /// Members whose id is already present are skipped; removals of unknown
    /// ids are ignored. Returns what actually changed.
    pub fn apply(&self, added: Vec<SharedControl>, removed: &[DeviceId]) -> MembershipChange {
        let _batch = lock(&self.batch);

        let change = {
            let mut members = lock(&self.members);
            let mut change = MembershipChange::default();

            members.retain(|m| {
                if removed.contains(&m.device_id()) {
                    change.removed.push(m.clone());
                    false
                } else {
                    true
                }
            });

            for member in added {
                let id = member.device_id();
                if members.iter().any(|m| m.device_id() == id) {
                    continue;
                }
                members.push(member.clone());
                change.added.push(member);
            }
            change
        };

        if !change.is_empty() {
            debug!(?change, "Membership changed");
            self.notifier.emit(&change);
        }
        change
    }

    pub fn insert(&self, member: SharedControl) -> bool {
        !self.apply(vec![member], &[]).added.is_empty()
    }

    pub fn remove(&self, id: &DeviceId) -> bool {
        !self.apply(Vec::new(), std::slice::from_ref(id)).removed.is_empty()
    }

    /// Observe membership batches. Listeners must not modify this set.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MembershipChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.notifier.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeMember;
    use std::sync::Arc;

    #[test]
    fn test_apply_publishes_one_batch() {
        let set = MemberSet::new();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let b = batches.clone();
        let _sub = set.subscribe(move |change| {
            lock(&b).push((change.added.len(), change.removed.len()));
        });

        set.apply(
            vec![FakeMember::shared("a"), FakeMember::shared("b"), FakeMember::shared("c")],
            &[],
        );
        set.apply(vec![FakeMember::shared("d")], &[DeviceId::new("a"), DeviceId::new("b")]);

        assert_eq!(*lock(&batches), vec![(3, 0), (1, 2)]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&DeviceId::new("d")));
    }

    #[test]
    fn test_duplicates_and_unknown_removals_are_ignored() {
        let set = MemberSet::new();
        let batches = Arc::new(Mutex::new(0));
        let b = batches.clone();
        let _sub = set.subscribe(move |_| *lock(&b) += 1);

        assert!(set.insert(FakeMember::shared("a")));
        assert!(!set.insert(FakeMember::shared("a")));
        assert!(!set.remove(&DeviceId::new("zzz")));

        assert_eq!(*lock(&batches), 1);
        assert_eq!(set.len(), 1);
    }
}
