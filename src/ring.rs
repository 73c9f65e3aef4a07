use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Size of the consistent-hash ring space. Member identities and keys are
/// both reduced into this space before placement.
pub const RING_SPACE: u64 = 512;

/// How many replicas hold each key.
pub const REPLICATION_FACTOR: usize = 3;

/// An opaque node identity: the address the node is reachable at.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Member(String);

impl Member {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn addr(&self) -> &str {
        &self.0
    }

    /// Position of this member on the ring.
    pub fn ring_hash(&self) -> u64 {
        stable_hash(&self.0) % RING_SPACE
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a key on the ring.
pub fn key_position(key: &str) -> u64 {
    stable_hash(key) % RING_SPACE
}

// DefaultHasher::new() is keyed with fixed constants, so every node computes
// the same positions for the same identities and keys.
fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Membership protocol handle the node polls for the current live members.
/// The snapshot is assumed deduplicated and unordered.
pub trait Membership {
    fn current_members(&self) -> Vec<Member>;
}

/// Fixed member list, for deployments wired up from static configuration.
pub struct StaticMembership {
    members: Vec<Member>,
}

impl StaticMembership {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }
}

impl Membership for StaticMembership {
    fn current_members(&self) -> Vec<Member> {
        self.members.clone()
    }
}

/// The ring: all live members sorted ascending by identity hash. Rebuilt
/// wholesale on every membership poll, never mutated in place.
#[derive(Clone, Debug, Default)]
pub struct Ring {
    members: Vec<Member>,
}

impl Ring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in ring order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Rebuild the ring from a membership snapshot plus this node itself.
    /// Returns whether the ring changed, judged by member count alone: a
    /// coarse signal that misses same-size churn.
    pub fn refresh(&mut self, snapshot: &[Member], me: &Member) -> bool {
        let mut next: Vec<Member> = snapshot.to_vec();
        if !next.contains(me) {
            next.push(me.clone());
        }
        // ties on the hash are broken by address so all nodes sort identically
        next.sort_by(|a, b| {
            a.ring_hash()
                .cmp(&b.ring_hash())
                .then_with(|| a.addr().cmp(b.addr()))
        });
        next.dedup();

        let changed = next.len() != self.members.len();
        self.members = next;
        changed
    }

    /// The ordered replica set for a key: primary, secondary, tertiary.
    ///
    /// Rings with fewer than `REPLICATION_FACTOR` members yield an empty set;
    /// no safe replication is possible and callers must treat the operation
    /// as failed up front.
    pub fn replicas_for(&self, key: &str) -> Vec<Member> {
        if self.members.len() < REPLICATION_FACTOR {
            return Vec::new();
        }

        let position = key_position(key);
        let lowest = self.members[0].ring_hash();
        let highest = self.members[self.members.len() - 1].ring_hash();

        // at or before the first member, or past the last: the ring head
        // owns the wrap-around span
        let start = if position <= lowest || position > highest {
            0
        } else {
            self.members
                .iter()
                .position(|m| m.ring_hash() >= position)
                .unwrap_or(0)
        };

        (0..REPLICATION_FACTOR)
            .map(|i| self.members[(start + i) % self.members.len()].clone())
            .collect()
    }
}
