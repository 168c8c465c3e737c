//! Two-way synchronized aggregate.
//!
//! Unlike [`super::AggregateController`] this aggregate owns its mute/volume
//! state. User writes are stored and pushed to every member while the
//! [`UpdateLatch`] is held, so the members' resulting change events cannot
//! feed back into the aggregate. Changes a member reports on its own (a
//! hardware button, another application) are adopted as the new aggregate
//! state. Members joining later are seeded with the current state.

use super::aggregate::{forget_members, reduce_mute, reduce_volume, watch_member};
use super::latch::UpdateLatch;
use super::members::{MemberSet, MembershipChange};
use super::{normalize_volume, ControlEvent, ControlListener, SharedControl, VolumeControl};
use crate::audio::DeviceId;
use crate::events::{lock, Notifier, Subscription};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Member writes performed by user-driven fan-out
    pub fan_out_writes: u64,

    /// Member changes adopted as aggregate state
    pub member_adoptions: u64,

    /// Member events ignored because a fan-out was in progress
    pub suppressed_member_events: u64,

    /// Members that received the aggregate state on joining
    pub seeded_members: u64,
}

#[derive(Default)]
struct Counters {
    fan_out_writes: AtomicU64,
    member_adoptions: AtomicU64,
    suppressed_member_events: AtomicU64,
    seeded_members: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SyncState {
    mute: Option<bool>,
    volume: Option<f32>,
    connected: bool,
}

struct SyncInner {
    members: Arc<MemberSet>,
    latch: UpdateLatch,
    state: Mutex<SyncState>,
    watched: Mutex<Vec<(SharedControl, Subscription)>>,
    counters: Counters,
    notifier: Notifier<ControlEvent>,
}

pub struct SynchronizingAggregateController {
    inner: Arc<SyncInner>,
    _membership: Subscription,
}

impl SynchronizingAggregateController {
    /// Create the aggregate. Its initial state is the reduction of the members
    /// present now; they are not written to.
    pub fn new(members: Arc<MemberSet>) -> Self {
        let current = members.snapshot();
        let initial = SyncState {
            mute: reduce_mute(current.iter().map(|m| m.mute())),
            volume: reduce_volume(current.iter().map(|m| m.volume())),
            connected: current.iter().any(|m| m.is_connected()),
        };

        let inner = Arc::new(SyncInner {
            members: members.clone(),
            latch: UpdateLatch::new(),
            state: Mutex::new(initial),
            watched: Mutex::new(Vec::new()),
            counters: Counters::default(),
            notifier: Notifier::new(),
        });

        let watched: Vec<_> = current.iter().map(|m| inner.watch(m)).collect();
        lock(&inner.watched).extend(watched);

        let weak = Arc::downgrade(&inner);
        let membership = members.subscribe(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_membership_change(change);
            }
        });

        Self {
            inner,
            _membership: membership,
        }
    }

    pub fn members(&self) -> &Arc<MemberSet> {
        &self.inner.members
    }

    pub fn stats(&self) -> SyncStats {
        let c = &self.inner.counters;
        SyncStats {
            fan_out_writes: c.fan_out_writes.load(Ordering::Relaxed),
            member_adoptions: c.member_adoptions.load(Ordering::Relaxed),
            suppressed_member_events: c.suppressed_member_events.load(Ordering::Relaxed),
            seeded_members: c.seeded_members.load(Ordering::Relaxed),
        }
    }
}

impl SyncInner {
    fn watch(self: &Arc<Self>, member: &SharedControl) -> (SharedControl, Subscription) {
        let weak = Arc::downgrade(self);
        watch_member(member, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_member_event(event);
            }
        })
    }

    fn on_member_event(&self, event: &ControlEvent) {
        match event {
            ControlEvent::MuteChanged(Some(muted)) => {
                let muted = *muted;
                self.adopt(|state| {
                    let changed = state.mute != Some(muted);
                    state.mute = Some(muted);
                    changed.then_some(ControlEvent::MuteChanged(Some(muted)))
                });
            }
            ControlEvent::VolumeChanged(Some(volume)) => {
                let volume = normalize_volume(Some(*volume));
                self.adopt(|state| {
                    let changed = volume.is_some() && state.volume != volume;
                    if changed {
                        state.volume = volume;
                    }
                    changed.then_some(ControlEvent::VolumeChanged(volume))
                });
            }
            ControlEvent::ConnectedChanged(_) => self.update_connected(),
            // Unbinding members and id changes carry no state to adopt
            _ => {}
        }
    }

    fn adopt(&self, update: impl FnOnce(&mut SyncState) -> Option<ControlEvent>) {
        if self.latch.is_held() {
            self.counters
                .suppressed_member_events
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let event = update(&mut lock(&self.state));
        if let Some(event) = event {
            self.counters.member_adoptions.fetch_add(1, Ordering::Relaxed);
            debug!(?event, "Adopted member change");
            self.notifier.emit(&event);
        }
    }

    fn update_connected(&self) {
        let connected = self.members.snapshot().iter().any(|m| m.is_connected());
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.connected != connected;
            state.connected = connected;
            changed
        };
        if changed {
            self.notifier.emit(&ControlEvent::ConnectedChanged(connected));
        }
    }

    fn on_membership_change(self: &Arc<Self>, change: &MembershipChange) {
        let released = {
            let mut watched = lock(&self.watched);
            forget_members(&mut watched, &change.removed)
        };
        drop(released);

        for member in &change.added {
            let watch = self.watch(member);
            lock(&self.watched).push(watch);
            self.seed(member);
        }

        self.update_connected();
    }

    /// Push the aggregate state onto a new member, or take the member's
    /// state if the aggregate has none yet.
    fn seed(&self, member: &SharedControl) {
        let SyncState { mute, volume, .. } = *lock(&self.state);

        let mut adopted = Vec::new();
        {
            let _latch = self.latch.enter();
            if mute.is_some() {
                member.set_mute(mute);
            }
            if volume.is_some() {
                member.set_volume(volume);
            }
        }

        if mute.is_none() || volume.is_none() {
            let (member_mute, member_volume) = (member.mute(), member.volume());
            let mut state = lock(&self.state);
            if state.mute.is_none() && member_mute.is_some() {
                state.mute = member_mute;
                adopted.push(ControlEvent::MuteChanged(member_mute));
            }
            if state.volume.is_none() && member_volume.is_some() {
                state.volume = member_volume;
                adopted.push(ControlEvent::VolumeChanged(member_volume));
            }
        }

        self.counters.seeded_members.fetch_add(1, Ordering::Relaxed);
        info!(device_id = %member.device_id(), ?mute, ?volume, "Seeded new member");

        for event in &adopted {
            self.notifier.emit(event);
        }
    }

    /// Store a user write and fan it out under the latch.
    fn write(
        &self,
        event: ControlEvent,
        store: impl FnOnce(&mut SyncState) -> bool,
        fan_out: impl Fn(&SharedControl),
    ) {
        let _latch = self.latch.enter();

        let changed = store(&mut lock(&self.state));
        if changed {
            self.notifier.emit(&event);
        }

        for member in self.members.snapshot() {
            fan_out(&member);
            self.counters.fan_out_writes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl VolumeControl for SynchronizingAggregateController {
    fn device_id(&self) -> DeviceId {
        DeviceId::all()
    }

    fn mute(&self) -> Option<bool> {
        lock(&self.inner.state).mute
    }

    fn set_mute(&self, muted: Option<bool>) {
        let Some(muted) = muted else { return };
        debug!(muted, "Aggregate mute write");
        self.inner.write(
            ControlEvent::MuteChanged(Some(muted)),
            |state| {
                let changed = state.mute != Some(muted);
                state.mute = Some(muted);
                changed
            },
            |member| member.set_mute(Some(muted)),
        );
    }

    fn volume(&self) -> Option<f32> {
        lock(&self.inner.state).volume
    }

    fn set_volume(&self, volume: Option<f32>) {
        let Some(volume) = normalize_volume(volume) else { return };
        debug!(volume, "Aggregate volume write");
        self.inner.write(
            ControlEvent::VolumeChanged(Some(volume)),
            |state| {
                let changed = state.volume != Some(volume);
                state.volume = Some(volume);
                changed
            },
            |member| member.set_volume(Some(volume)),
        );
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner.state).connected
    }

    fn subscribe(&self, listener: ControlListener) -> Subscription {
        self.inner.notifier.subscribe(listener)
    }
}
