//! Read/compose aggregate over a member set.

use super::members::{MemberSet, MembershipChange};
use super::{normalize_volume, ControlEvent, ControlListener, SharedControl, VolumeControl};
use crate::audio::DeviceId;
use crate::events::{lock, Notifier, Subscription};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// `Some(true)` iff there is at least one member and every member reads
/// `Some(true)`. An unknown member state counts as not muted.
pub fn reduce_mute(values: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut any = false;
    let mut all_muted = true;
    for value in values {
        any = true;
        all_muted &= value == Some(true);
    }
    any.then_some(all_muted)
}

/// Minimum of the known volumes.
pub fn reduce_volume(values: impl IntoIterator<Item = Option<f32>>) -> Option<f32> {
    values
        .into_iter()
        .flatten()
        .filter(|v| !v.is_nan())
        .reduce(f32::min)
}

pub(crate) fn watch_member(
    member: &SharedControl,
    on_event: impl Fn(&ControlEvent) + Send + Sync + 'static,
) -> (SharedControl, Subscription) {
    let subscription = member.subscribe(Box::new(on_event));
    (member.clone(), subscription)
}

/// Drop the subscriptions of removed members.
pub(crate) fn forget_members(
    watched: &mut Vec<(SharedControl, Subscription)>,
    removed: &[SharedControl],
) -> Vec<Subscription> {
    let mut released = Vec::new();
    let mut index = 0;
    while index < watched.len() {
        if removed.iter().any(|r| Arc::ptr_eq(r, &watched[index].0)) {
            released.push(watched.swap_remove(index).1);
        } else {
            index += 1;
        }
    }
    released
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Reduced {
    mute: Option<bool>,
    volume: Option<f32>,
    connected: bool,
}

impl Reduced {
    fn of(members: &[SharedControl]) -> Self {
        Self {
            mute: reduce_mute(members.iter().map(|m| m.mute())),
            volume: reduce_volume(members.iter().map(|m| m.volume())),
            connected: members.iter().any(|m| m.is_connected()),
        }
    }

    fn changes_from(&self, previous: &Reduced) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        if self.mute != previous.mute {
            events.push(ControlEvent::MuteChanged(self.mute));
        }
        if self.volume != previous.volume {
            events.push(ControlEvent::VolumeChanged(self.volume));
        }
        if self.connected != previous.connected {
            events.push(ControlEvent::ConnectedChanged(self.connected));
        }
        events
    }
}

struct AggregateInner {
    members: Arc<MemberSet>,
    reduced: Mutex<Reduced>,
    watched: Mutex<Vec<(SharedControl, Subscription)>>,

    /// Serializes recomputation so a slow pass cannot overwrite a newer one
    recompute: Mutex<()>,

    notifier: Notifier<ControlEvent>,
}

/// Aggregate whose state is derived from its members (AND for mute, MIN for
/// volume). Writes fan out to every member.
pub struct AggregateController {
    inner: Arc<AggregateInner>,
    _membership: Subscription,
}

impl AggregateController {
    pub fn new(members: Arc<MemberSet>) -> Self {
        let inner = Arc::new(AggregateInner {
            members: members.clone(),
            reduced: Mutex::new(Reduced::default()),
            watched: Mutex::new(Vec::new()),
            recompute: Mutex::new(()),
            notifier: Notifier::new(),
        });

        let weak = Arc::downgrade(&inner);
        let membership = members.subscribe(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_membership_change(change);
            }
        });

        let initial = MembershipChange {
            added: members.snapshot(),
            removed: Vec::new(),
        };
        inner.on_membership_change(&initial);

        Self {
            inner,
            _membership: membership,
        }
    }

    pub fn members(&self) -> &Arc<MemberSet> {
        &self.inner.members
    }
}

impl AggregateInner {
    fn on_membership_change(self: &Arc<Self>, change: &MembershipChange) {
        let added: Vec<_> = change
            .added
            .iter()
            .map(|member| {
                let weak: Weak<AggregateInner> = Arc::downgrade(self);
                watch_member(member, move |_event| {
                    if let Some(inner) = weak.upgrade() {
                        inner.recompute();
                    }
                })
            })
            .collect();

        let released = {
            let mut watched = lock(&self.watched);
            watched.extend(added);
            forget_members(&mut watched, &change.removed)
        };
        drop(released);

        self.recompute();
    }

    fn recompute(&self) {
        let events = {
            let _pass = lock(&self.recompute);
            let next = Reduced::of(&self.members.snapshot());
            let mut reduced = lock(&self.reduced);
            let events = next.changes_from(&reduced);
            *reduced = next;
            events
        };

        for event in &events {
            self.notifier.emit(event);
        }
    }
}

impl VolumeControl for AggregateController {
    fn device_id(&self) -> DeviceId {
        DeviceId::all()
    }

    fn mute(&self) -> Option<bool> {
        lock(&self.inner.reduced).mute
    }

    fn set_mute(&self, muted: Option<bool>) {
        let Some(muted) = muted else { return };
        let members = self.inner.members.snapshot();
        debug!(muted, members = members.len(), "Aggregate mute write");
        for member in members {
            member.set_mute(Some(muted));
        }
    }

    fn volume(&self) -> Option<f32> {
        lock(&self.inner.reduced).volume
    }

    fn set_volume(&self, volume: Option<f32>) {
        let Some(volume) = normalize_volume(volume) else { return };
        let members = self.inner.members.snapshot();
        debug!(volume, members = members.len(), "Aggregate volume write");
        for member in members {
            member.set_volume(Some(volume));
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner.reduced).connected
    }

    fn subscribe(&self, listener: ControlListener) -> Subscription {
        self.inner.notifier.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EventLog, FakeMember};

    #[test]
    fn test_reduce_mute_table() {
        assert_eq!(reduce_mute(std::iter::empty()), None);
        assert_eq!(reduce_mute([Some(true)]), Some(true));
        assert_eq!(reduce_mute([Some(true), Some(false)]), Some(false));
        assert_eq!(reduce_mute([Some(true), Some(true)]), Some(true));
        assert_eq!(reduce_mute([Some(true), None]), Some(false));
    }

    #[test]
    fn test_reduce_volume_table() {
        assert_eq!(reduce_volume(std::iter::empty()), None);
        assert_eq!(reduce_volume([Some(0.2), Some(0.5)]), Some(0.2));
        assert_eq!(reduce_volume([Some(0.7)]), Some(0.7));
        assert_eq!(reduce_volume([None, Some(0.4)]), Some(0.4));
        assert_eq!(reduce_volume([None, None]), None);
    }

    #[test]
    fn test_empty_aggregate() {
        let aggregate = AggregateController::new(Arc::new(MemberSet::new()));
        assert_eq!(aggregate.mute(), None);
        assert_eq!(aggregate.volume(), None);
        assert!(!aggregate.is_connected());
        assert!(aggregate.device_id().is_all());
        aggregate.set_mute(Some(true));
        assert_eq!(aggregate.mute(), None);
    }

    #[test]
    fn test_follows_member_changes() {
        let a = FakeMember::new("a", Some(true), Some(0.5));
        let b = FakeMember::new("b", Some(true), Some(0.9));
        let members = Arc::new(MemberSet::new());
        members.apply(vec![a.control(), b.control()], &[]);

        let aggregate = AggregateController::new(members);
        assert_eq!(aggregate.mute(), Some(true));
        assert_eq!(aggregate.volume(), Some(0.5));

        let log = EventLog::attach(&aggregate);
        b.external_mute(false);
        a.external_volume(0.95);

        assert_eq!(aggregate.mute(), Some(false));
        assert_eq!(aggregate.volume(), Some(0.9));
        assert_eq!(
            log.events(),
            vec![
                ControlEvent::MuteChanged(Some(false)),
                ControlEvent::VolumeChanged(Some(0.9)),
            ]
        );
    }

    #[test]
    fn test_membership_batch_recomputes_once() {
        let members = Arc::new(MemberSet::new());
        let aggregate = AggregateController::new(members.clone());
        let log = EventLog::attach(&aggregate);

        members.apply(
            vec![
                FakeMember::new("a", Some(true), Some(0.3)).control(),
                FakeMember::new("b", Some(true), Some(0.6)).control(),
            ],
            &[],
        );

        assert_eq!(
            log.events(),
            vec![
                ControlEvent::MuteChanged(Some(true)),
                ControlEvent::VolumeChanged(Some(0.3)),
                ControlEvent::ConnectedChanged(true),
            ]
        );

        log.clear();
        members.apply(Vec::new(), &[DeviceId::new("a"), DeviceId::new("b")]);
        assert_eq!(
            log.events(),
            vec![
                ControlEvent::MuteChanged(None),
                ControlEvent::VolumeChanged(None),
                ControlEvent::ConnectedChanged(false),
            ]
        );
    }

    #[test]
    fn test_writes_fan_out() {
        let a = FakeMember::new("a", Some(false), Some(0.5));
        let b = FakeMember::new("b", Some(false), Some(0.5));
        let members = Arc::new(MemberSet::new());
        members.apply(vec![a.control(), b.control()], &[]);
        let aggregate = AggregateController::new(members);

        aggregate.set_mute(Some(true));
        aggregate.set_volume(Some(2.0));

        assert_eq!((a.mute_writes(), b.mute_writes()), (1, 1));
        assert_eq!((a.volume_writes(), b.volume_writes()), (1, 1));
        assert_eq!(a.volume(), Some(1.0));
        assert_eq!(aggregate.mute(), Some(true));
        assert_eq!(aggregate.volume(), Some(1.0));
    }

    #[test]
    fn test_removed_member_is_no_longer_observed() {
        let a = FakeMember::new("a", Some(false), Some(0.5));
        let members = Arc::new(MemberSet::new());
        members.apply(vec![a.control()], &[]);
        let aggregate = AggregateController::new(members.clone());

        members.remove(&DeviceId::new("a"));
        let log = EventLog::attach(&aggregate);
        a.external_mute(true);
        assert!(log.events().is_empty());
    }
}
