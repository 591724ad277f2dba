//! Channel Ownership Manager
//!
//! Each durable group keeps its members in registration order. Every
//! membership change recomputes the allocation under the group's lock,
//! bumps the generation and pushes the difference to each member as
//! `Revoked` / `Assigned` events, followed by a wake-up.
//!
//! Allocation rules (see `allocate`):
//! 1. Explicit channel requests first, in registration order. First wins.
//! 2. Remaining channels split into contiguous even runs, in channel-id
//!    order, over the automatic members in registration order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;
use hashlink::LinkedHashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::brokers::topics::position::ChannelId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnershipEvent {
    Assigned(Vec<ChannelId>),
    Revoked(Vec<ChannelId>),
    /// Membership is gone (timeout, group destroyed). Reconnect to rejoin.
    Lost,
}

struct Member {
    explicit: Option<BTreeSet<ChannelId>>,
    events: mpsc::UnboundedSender<OwnershipEvent>,
    wake: Arc<Notify>,
    last_heartbeat: Instant,
    owned: BTreeSet<ChannelId>,
}

impl Member {
    fn send(&self, event: OwnershipEvent) -> bool {
        let delivered = self.events.send(event).is_ok();
        self.wake.notify_waiters();
        delivered
    }
}

struct GroupAllocation {
    members: LinkedHashMap<Uuid, Member>,
    owners: Vec<Option<Uuid>>,
    generation: u64,
}

// ==========================================
// PURE ALLOCATION
// ==========================================

/// Deterministic channel allocation from a registration-ordered member list.
pub fn allocate(channel_count: u32, members: &[(Uuid, Option<&BTreeSet<ChannelId>>)]) -> Vec<Option<Uuid>> {
    let mut owners: Vec<Option<Uuid>> = vec![None; channel_count as usize];

    for (id, explicit) in members {
        if let Some(channels) = explicit {
            for &c in channels.iter() {
                if let Some(slot) = owners.get_mut(c as usize) {
                    if slot.is_none() {
                        *slot = Some(*id);
                    }
                }
            }
        }
    }

    let automatic: Vec<Uuid> = members
        .iter()
        .filter(|(_, explicit)| explicit.is_none())
        .map(|(id, _)| *id)
        .collect();
    if automatic.is_empty() {
        return owners;
    }

    let free: Vec<usize> = (0..owners.len()).filter(|&c| owners[c].is_none()).collect();
    let base = free.len() / automatic.len();
    let extra = free.len() % automatic.len();

    let mut cursor = 0;
    for (i, id) in automatic.iter().enumerate() {
        let take = base + usize::from(i < extra);
        for &c in &free[cursor..cursor + take] {
            owners[c] = Some(*id);
        }
        cursor += take;
    }
    owners
}

// ==========================================
// MANAGER
// ==========================================

pub struct OwnershipManager {
    topic: String,
    channel_count: u32,
    groups: DashMap<String, Mutex<GroupAllocation>>,
}

impl OwnershipManager {
    pub fn new(topic: &str, channel_count: u32) -> Self {
        Self {
            topic: topic.to_string(),
            channel_count,
            groups: DashMap::new(),
        }
    }

    /// Registers `id` in `group` and returns its event stream. The initial
    /// allocation arrives as an `Assigned` event.
    pub fn join(
        &self,
        group: &str,
        id: Uuid,
        explicit: Option<BTreeSet<ChannelId>>,
        wake: Arc<Notify>,
    ) -> mpsc::UnboundedReceiver<OwnershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = self.groups.entry(group.to_string()).or_insert_with(|| {
            Mutex::new(GroupAllocation {
                members: LinkedHashMap::new(),
                owners: vec![None; self.channel_count as usize],
                generation: 0,
            })
        });
        let mut alloc = entry.lock();
        alloc.members.insert(id, Member {
            explicit,
            events: tx,
            wake,
            last_heartbeat: Instant::now(),
            owned: BTreeSet::new(),
        });
        info!(topic = %self.topic, group, member = %id, members = alloc.members.len(), "Member joined");
        self.recompute(group, &mut alloc);
        rx
    }

    pub fn leave(&self, group: &str, id: &Uuid) -> bool {
        let entry = match self.groups.get(group) {
            Some(entry) => entry,
            None => return false,
        };
        let mut alloc = entry.lock();
        if alloc.members.remove(id).is_none() {
            return false;
        }
        info!(topic = %self.topic, group, member = %id, "Member left");
        self.recompute(group, &mut alloc);
        true
    }

    pub fn heartbeat(&self, group: &str, id: &Uuid) -> bool {
        match self.groups.get(group) {
            Some(entry) => match entry.lock().members.get_mut(id) {
                Some(member) => {
                    member.last_heartbeat = Instant::now();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Removes members silent for longer than `timeout`, sends them `Lost`
    /// and reallocates. Returns the expired members.
    pub fn expire(&self, timeout: Duration) -> Vec<(String, Uuid)> {
        let mut expired = Vec::new();
        for entry in self.groups.iter() {
            let group = entry.key();
            let mut alloc = entry.value().lock();
            let stale: Vec<Uuid> = alloc
                .members
                .iter()
                .filter(|(_, m)| m.last_heartbeat.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect();
            if stale.is_empty() {
                continue;
            }
            for id in stale {
                if let Some(member) = alloc.members.remove(&id) {
                    warn!(topic = %self.topic, group = %group, member = %id, "Member heartbeat timed out");
                    member.send(OwnershipEvent::Lost);
                    expired.push((group.clone(), id));
                }
            }
            self.recompute(group, &mut alloc);
        }
        expired
    }

    /// Drops the group's allocation, sending `Lost` to every member.
    pub fn drop_group(&self, group: &str) -> usize {
        match self.groups.remove(group) {
            Some((_, alloc)) => {
                let alloc = alloc.into_inner();
                for member in alloc.members.values() {
                    member.send(OwnershipEvent::Lost);
                }
                alloc.members.len()
            }
            None => 0,
        }
    }

    /// Sends `Lost` to every member of every group and clears all allocations.
    pub fn lose_all(&self) {
        let groups: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        for group in groups {
            self.drop_group(&group);
        }
    }

    pub fn owner_of(&self, group: &str, channel: ChannelId) -> Option<Uuid> {
        let entry = self.groups.get(group)?;
        let alloc = entry.lock();
        alloc.owners.get(channel as usize).copied().flatten()
    }

    pub fn channels_of(&self, group: &str, id: &Uuid) -> Vec<ChannelId> {
        self.groups
            .get(group)
            .and_then(|entry| entry.lock().members.get(id).map(|m| m.owned.iter().copied().collect()))
            .unwrap_or_default()
    }

    pub fn members(&self, group: &str) -> Vec<Uuid> {
        self.groups
            .get(group)
            .map(|entry| entry.lock().members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn generation(&self, group: &str) -> u64 {
        self.groups.get(group).map(|entry| entry.lock().generation).unwrap_or(0)
    }

    // --- Internal ---

    fn recompute(&self, group: &str, alloc: &mut GroupAllocation) {
        loop {
            let owners = {
                let snapshot: Vec<(Uuid, Option<&BTreeSet<ChannelId>>)> = alloc
                    .members
                    .iter()
                    .map(|(id, m)| (*id, m.explicit.as_ref()))
                    .collect();
                allocate(self.channel_count, &snapshot)
            };
            alloc.owners = owners;
            alloc.generation += 1;

            let mut unreachable = Vec::new();
            for (id, member) in alloc.members.iter_mut() {
                let target: BTreeSet<ChannelId> = alloc
                    .owners
                    .iter()
                    .enumerate()
                    .filter(|(_, owner)| owner.as_ref() == Some(id))
                    .map(|(c, _)| c as ChannelId)
                    .collect();

                let revoked: Vec<ChannelId> = member.owned.difference(&target).copied().collect();
                let assigned: Vec<ChannelId> = target.difference(&member.owned).copied().collect();
                member.owned = target;

                let mut reachable = true;
                if !revoked.is_empty() {
                    reachable &= member.send(OwnershipEvent::Revoked(revoked));
                }
                if !assigned.is_empty() {
                    reachable &= member.send(OwnershipEvent::Assigned(assigned));
                }
                if !reachable {
                    unreachable.push(*id);
                }
            }

            debug!(
                topic = %self.topic, group, generation = alloc.generation,
                members = alloc.members.len(), "Allocation recomputed"
            );

            if unreachable.is_empty() {
                return;
            }
            for id in unreachable {
                warn!(topic = %self.topic, group, member = %id, "Member unreachable, removing");
                alloc.members.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OwnershipEvent>) -> Vec<OwnershipEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_allocate_even_contiguous_runs() {
        let m = ids(3);
        let members: Vec<_> = m.iter().map(|id| (*id, None)).collect();
        let owners = allocate(8, &members);
        // 8 over 3 -> 3, 3, 2
        assert_eq!(owners[0..3], [Some(m[0]); 3]);
        assert_eq!(owners[3..6], [Some(m[1]); 3]);
        assert_eq!(owners[6..8], [Some(m[2]); 2]);
        assert_eq!(allocate(8, &members), owners);
    }

    #[test]
    fn test_allocate_explicit_first_and_first_wins() {
        let m = ids(3);
        let a: BTreeSet<ChannelId> = [0, 5].into_iter().collect();
        let b: BTreeSet<ChannelId> = [5, 6].into_iter().collect();
        let owners = allocate(8, &[(m[0], Some(&a)), (m[1], Some(&b)), (m[2], None)]);

        assert_eq!(owners[0], Some(m[0]));
        assert_eq!(owners[5], Some(m[0]));
        assert_eq!(owners[6], Some(m[1]));
        for c in [1, 2, 3, 4, 7] {
            assert_eq!(owners[c], Some(m[2]));
        }
    }

    #[test]
    fn test_allocate_more_members_than_channels() {
        let m = ids(4);
        let members: Vec<_> = m.iter().map(|id| (*id, None)).collect();
        let owners = allocate(2, &members);
        assert_eq!(owners, vec![Some(m[0]), Some(m[1])]);
    }

    #[test]
    fn test_join_and_leave_push_events() {
        let manager = OwnershipManager::new("t", 4);
        let m = ids(2);
        let mut rx_a = manager.join("g", m[0], None, Arc::new(Notify::new()));
        assert_eq!(drain(&mut rx_a), vec![OwnershipEvent::Assigned(vec![0, 1, 2, 3])]);

        let mut rx_b = manager.join("g", m[1], None, Arc::new(Notify::new()));
        assert_eq!(drain(&mut rx_a), vec![OwnershipEvent::Revoked(vec![2, 3])]);
        assert_eq!(drain(&mut rx_b), vec![OwnershipEvent::Assigned(vec![2, 3])]);
        assert_eq!(manager.owner_of("g", 3), Some(m[1]));
        assert_eq!(manager.generation("g"), 2);

        assert!(manager.leave("g", &m[0]));
        assert_eq!(drain(&mut rx_b), vec![OwnershipEvent::Assigned(vec![0, 1])]);
        assert_eq!(manager.channels_of("g", &m[1]), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unreachable_member_is_removed() {
        let manager = OwnershipManager::new("t", 2);
        let m = ids(2);
        let rx_a = manager.join("g", m[0], None, Arc::new(Notify::new()));
        drop(rx_a);
        let mut rx_b = manager.join("g", m[1], None, Arc::new(Notify::new()));

        // a could not be told about its revocation, so b gets everything
        assert_eq!(manager.members("g"), vec![m[1]]);
        assert_eq!(manager.channels_of("g", &m[1]), vec![0, 1]);
        assert_eq!(
            drain(&mut rx_b),
            vec![OwnershipEvent::Assigned(vec![1]), OwnershipEvent::Assigned(vec![0])]
        );
    }

    #[test]
    fn test_expire_sends_lost_and_reallocates() {
        let manager = OwnershipManager::new("t", 2);
        let m = ids(2);
        let mut rx_a = manager.join("g", m[0], None, Arc::new(Notify::new()));
        std::thread::sleep(Duration::from_millis(30));
        let mut rx_b = manager.join("g", m[1], None, Arc::new(Notify::new()));
        drain(&mut rx_a);
        drain(&mut rx_b);

        let expired = manager.expire(Duration::from_millis(20));
        assert_eq!(expired, vec![("g".to_string(), m[0])]);
        assert_eq!(drain(&mut rx_a), vec![OwnershipEvent::Lost]);
        assert_eq!(drain(&mut rx_b), vec![OwnershipEvent::Assigned(vec![0])]);
        assert!(!manager.heartbeat("g", &m[0]));
        assert!(manager.heartbeat("g", &m[1]));
    }

    #[test]
    fn test_drop_group_sends_lost() {
        let manager = OwnershipManager::new("t", 2);
        let id = Uuid::new_v4();
        let mut rx = manager.join("g", id, None, Arc::new(Notify::new()));
        drain(&mut rx);
        assert_eq!(manager.drop_group("g"), 1);
        assert_eq!(drain(&mut rx), vec![OwnershipEvent::Lost]);
        assert_eq!(manager.owner_of("g", 0), None);
    }
}
