pub mod audit;
pub mod config;
pub mod message;
pub mod net;
pub mod ring;
pub mod store;
pub mod transport;

pub use audit::{AuditRecord, AuditSink, LogAudit, MemoryAudit, Outcome};
pub use config::Config;
pub use message::{Message, MessageKind, Op, ReplicaRole, TxnId};
pub use ring::{
    key_position, Member, Membership, Ring, StaticMembership, REPLICATION_FACTOR, RING_SPACE,
};
pub use store::{LocalStore, MemStore};
pub use transport::{LoopbackHub, LoopbackNet, Transport};

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Matching replies required to finalize an operation.
pub const QUORUM: usize = 2;

/// Ticks a transaction may stay pending before it is failed.
pub const TXN_TIMEOUT: u64 = 10;

// One pending client-issued operation, shared by every replica it was sent
// to. Owned exclusively by the coordinator's pending table.
struct Transaction {
    issued_at: u64,
    op: Op,
    key: String,
    value: Option<String>,
    replies: usize,
    successes: usize,
    read_value: Option<String>,
}

/// One node's replication engine: ring maintenance, operation coordination,
/// request handling, and stabilization, driven by `tick()`.
///
/// All state is owned by this struct and only mutated from `tick()` and the
/// client calls; nothing here is shared across threads.
pub struct Node<T, S, A> {
    me: Member,
    ring: Ring,
    transport: T,
    store: S,
    audit: A,
    pending: BTreeMap<TxnId, Transaction>,
    next_txn: TxnId,
    time: u64,
}

impl<T, S, A> Node<T, S, A>
where
    T: Transport,
    S: LocalStore,
    A: AuditSink,
{
    pub fn new(me: Member, transport: T, store: S, audit: A) -> Self {
        Self {
            me,
            ring: Ring::new(),
            transport,
            store,
            audit,
            pending: BTreeMap::new(),
            next_txn: 0,
            time: 0,
        }
    }

    pub fn me(&self) -> &Member {
        &self.me
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn audit(&self) -> &A {
        &self.audit
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Rebuild the ring from a fresh membership snapshot. A ring-size change
    /// with local data on hand triggers re-replication of every held key.
    pub fn refresh_ring(&mut self, snapshot: &[Member]) {
        let changed = self.ring.refresh(snapshot, &self.me);
        if changed && !self.store.is_empty() {
            info!(
                "[{}] ring changed ({} members), re-replicating local keys",
                self.me,
                self.ring.len()
            );
            self.stabilize();
        }
    }

    pub fn create(&mut self, key: &str, value: &str) -> Result<TxnId> {
        self.issue(Op::Create, key, Some(value))
    }

    pub fn read(&mut self, key: &str) -> Result<TxnId> {
        self.issue(Op::Read, key, None)
    }

    pub fn update(&mut self, key: &str, value: &str) -> Result<TxnId> {
        self.issue(Op::Update, key, Some(value))
    }

    pub fn delete(&mut self, key: &str) -> Result<TxnId> {
        self.issue(Op::Delete, key, None)
    }

    /// One cooperative step: advance the logical clock, drain and dispatch
    /// every queued inbound message in arrival order, then run one quorum
    /// sweep over the pending table.
    pub fn tick(&mut self) {
        self.time += 1;
        for msg in self.transport.drain() {
            self.dispatch(msg);
        }
        self.sweep();
    }

    fn issue(&mut self, op: Op, key: &str, value: Option<&str>) -> Result<TxnId> {
        if value.is_some_and(str::is_empty) {
            bail!("empty values are reserved to mean absent");
        }
        let replicas = self.ring.replicas_for(key);
        if replicas.is_empty() {
            bail!(
                "no replica set for {:?}: ring has {} members, need {}",
                key,
                self.ring.len(),
                REPLICATION_FACTOR
            );
        }

        let id = self.next_txn;
        self.next_txn += 1;
        self.pending.insert(
            id,
            Transaction {
                issued_at: self.time,
                op,
                key: key.to_string(),
                value: value.map(str::to_string),
                replies: 0,
                successes: 0,
                read_value: None,
            },
        );

        // fire-and-forget; the quorum sweep observes completion
        for (index, replica) in replicas.iter().enumerate() {
            let kind = request_kind(op, key, value, ReplicaRole::from_index(index));
            self.transport.send(
                replica,
                Message {
                    txn: Some(id),
                    from: self.me.clone(),
                    kind,
                },
            );
        }
        Ok(id)
    }

    fn dispatch(&mut self, msg: Message) {
        let Message { txn, from, kind } = msg;
        debug!("[{}] {:?} from {}", self.me, kind, from);
        match kind {
            MessageKind::Create { key, value, .. } => {
                let ok = self.store.create(&key, &value);
                self.audit.record(
                    &self.me,
                    false,
                    txn,
                    Op::Create,
                    ok.into(),
                    &key,
                    Some(value.as_str()),
                );
                self.send_reply(txn, &from, MessageKind::Reply { success: ok });
            }
            MessageKind::Update { key, value, .. } => {
                let ok = self.store.update(&key, &value);
                self.audit.record(
                    &self.me,
                    false,
                    txn,
                    Op::Update,
                    ok.into(),
                    &key,
                    Some(value.as_str()),
                );
                self.send_reply(txn, &from, MessageKind::Reply { success: ok });
            }
            MessageKind::Delete { key } => {
                let ok = self.store.delete(&key);
                self.audit
                    .record(&self.me, false, txn, Op::Delete, ok.into(), &key, None);
                self.send_reply(txn, &from, MessageKind::Reply { success: ok });
            }
            MessageKind::Read { key } => {
                let value = self.store.read(&key);
                self.audit.record(
                    &self.me,
                    false,
                    txn,
                    Op::Read,
                    value.is_some().into(),
                    &key,
                    value.as_deref(),
                );
                self.send_reply(txn, &from, MessageKind::ReadReply { value });
            }
            MessageKind::Reply { success } => {
                // replies for finalized, foreign, or untracked transactions
                // are dropped
                let Some(id) = txn else { return };
                if let Some(t) = self.pending.get_mut(&id) {
                    t.replies += 1;
                    if success {
                        t.successes += 1;
                    }
                }
            }
            MessageKind::ReadReply { value } => {
                let Some(id) = txn else { return };
                if let Some(t) = self.pending.get_mut(&id) {
                    t.replies += 1;
                    if value.is_some() {
                        t.successes += 1;
                        t.read_value = value;
                    }
                }
            }
        }
    }

    fn send_reply(&mut self, txn: Option<TxnId>, to: &Member, kind: MessageKind) {
        self.transport.send(
            to,
            Message {
                txn,
                from: self.me.clone(),
                kind,
            },
        );
    }

    // The only place a transaction reaches a terminal state. Success as soon
    // as the quorum is met; failure once it is unreachable or the
    // transaction has aged out.
    fn sweep(&mut self) {
        let mut finalized: Vec<(TxnId, Outcome)> = Vec::new();
        for (&id, t) in &self.pending {
            let failures = t.replies - t.successes;
            let verdict = if t.successes >= QUORUM {
                Some(Outcome::Success)
            } else if failures > REPLICATION_FACTOR - QUORUM || t.replies >= REPLICATION_FACTOR {
                Some(Outcome::Failure)
            } else if self.time - t.issued_at > TXN_TIMEOUT {
                Some(Outcome::Failure)
            } else {
                None
            };
            if let Some(outcome) = verdict {
                finalized.push((id, outcome));
            }
        }

        for (id, outcome) in finalized {
            if let Some(t) = self.pending.remove(&id) {
                let value = t.read_value.as_deref().or(t.value.as_deref());
                self.audit
                    .record(&self.me, true, Some(id), t.op, outcome, &t.key, value);
            }
        }
    }

    // Re-push every locally held key to its current replica set, self
    // included. The sentinel `txn: None` marks the traffic as untracked;
    // replicas still reply, and those replies are dropped at intake.
    fn stabilize(&mut self) {
        for (key, value) in self.store.entries() {
            let replicas = self.ring.replicas_for(&key);
            for (index, replica) in replicas.iter().enumerate() {
                let kind = MessageKind::Create {
                    key: key.clone(),
                    value: value.clone(),
                    role: ReplicaRole::from_index(index),
                };
                self.transport.send(
                    replica,
                    Message {
                        txn: None,
                        from: self.me.clone(),
                        kind,
                    },
                );
            }
        }
    }
}

fn request_kind(op: Op, key: &str, value: Option<&str>, role: Option<ReplicaRole>) -> MessageKind {
    match op {
        Op::Create => MessageKind::Create {
            key: key.to_string(),
            value: value.unwrap_or_default().to_string(),
            role,
        },
        Op::Read => MessageKind::Read {
            key: key.to_string(),
        },
        Op::Update => MessageKind::Update {
            key: key.to_string(),
            value: value.unwrap_or_default().to_string(),
            role,
        },
        Op::Delete => MessageKind::Delete {
            key: key.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestNode = Node<LoopbackNet, MemStore, MemoryAudit>;

    fn members(n: usize) -> Vec<Member> {
        (0..n)
            .map(|i| Member::new(format!("10.1.0.{}:7400", i + 1)))
            .collect()
    }

    fn cluster_on(hub: &LoopbackHub, members: &[Member]) -> Vec<TestNode> {
        members
            .iter()
            .map(|m| {
                let mut node =
                    Node::new(m.clone(), hub.register(m), MemStore::new(), MemoryAudit::default());
                node.refresh_ring(members);
                node
            })
            .collect()
    }

    fn cluster(n: usize) -> Vec<TestNode> {
        cluster_on(&LoopbackHub::new(), &members(n))
    }

    fn coordinator_outcomes(node: &TestNode) -> Vec<(Op, Outcome)> {
        node.audit()
            .records
            .iter()
            .filter(|r| r.coordinator)
            .map(|r| (r.op, r.outcome))
            .collect()
    }

    #[test]
    fn create_reaches_quorum_after_two_replies() {
        let mut nodes = cluster(3);
        nodes[0].create("jupiter", "gas giant").unwrap();

        // the coordinator applies its own replica write, one peer acks
        nodes[0].tick();
        nodes[1].tick();
        nodes[0].tick();

        assert_eq!(
            coordinator_outcomes(&nodes[0]),
            vec![(Op::Create, Outcome::Success)]
        );
        assert_eq!(nodes[0].pending_count(), 0);
        assert_eq!(nodes[0].store().read("jupiter").as_deref(), Some("gas giant"));
        assert_eq!(nodes[1].store().read("jupiter").as_deref(), Some("gas giant"));

        // the third ack lands on an already-finalized transaction
        nodes[2].tick();
        nodes[0].tick();
        assert_eq!(coordinator_outcomes(&nodes[0]).len(), 1);
        assert_eq!(nodes[2].store().read("jupiter").as_deref(), Some("gas giant"));
    }

    #[test]
    fn quorum_success_with_one_replica_down() {
        let mut nodes = cluster(3);
        nodes[0].create("saturn", "rings").unwrap();

        // nodes[2] never runs
        nodes[0].tick();
        nodes[1].tick();
        nodes[0].tick();

        assert_eq!(
            coordinator_outcomes(&nodes[0]),
            vec![(Op::Create, Outcome::Success)]
        );
        assert_eq!(nodes[0].pending_count(), 0);
    }

    #[test]
    fn quorum_failure_once_two_replicas_reject() {
        let mut nodes = cluster(3);
        assert!(nodes[1].store_mut().create("io", "volcanic"));
        assert!(nodes[2].store_mut().create("io", "volcanic"));

        nodes[0].create("io", "moon").unwrap();
        nodes[1].tick();
        nodes[2].tick();
        // two rejections are in before the coordinator's own ack: the quorum
        // is already unreachable
        nodes[0].tick();

        assert_eq!(
            coordinator_outcomes(&nodes[0]),
            vec![(Op::Create, Outcome::Failure)]
        );
        assert_eq!(nodes[0].pending_count(), 0);
    }

    #[test]
    fn late_rejection_cannot_flip_success() {
        let mut nodes = cluster(3);
        assert!(nodes[2].store_mut().create("ceres", "dwarf"));

        nodes[0].create("ceres", "belt").unwrap();
        nodes[0].tick();
        nodes[1].tick();
        nodes[0].tick(); // two acks, finalized as success

        nodes[2].tick(); // the rejection arrives afterwards
        nodes[0].tick();

        assert_eq!(
            coordinator_outcomes(&nodes[0]),
            vec![(Op::Create, Outcome::Success)]
        );
    }

    #[test]
    fn read_returns_quorum_value() {
        let mut nodes = cluster(3);
        nodes[0].create("europa", "ice shell").unwrap();
        for _ in 0..2 {
            for node in nodes.iter_mut() {
                node.tick();
            }
        }
        assert_eq!(
            coordinator_outcomes(&nodes[0]),
            vec![(Op::Create, Outcome::Success)]
        );

        nodes[0].read("europa").unwrap();
        nodes[0].tick();
        nodes[1].tick();
        nodes[0].tick();

        let records = &nodes[0].audit().records;
        let read = records
            .iter()
            .filter(|r| r.coordinator && r.op == Op::Read)
            .next_back()
            .unwrap();
        assert_eq!(read.outcome, Outcome::Success);
        assert_eq!(read.value.as_deref(), Some("ice shell"));
    }

    #[test]
    fn read_misses_count_as_failures() {
        let mut nodes = cluster(3);
        nodes[0].read("nothing-here").unwrap();

        nodes[1].tick();
        nodes[2].tick();
        nodes[0].tick(); // two misses: quorum unreachable

        assert_eq!(
            coordinator_outcomes(&nodes[0]),
            vec![(Op::Read, Outcome::Failure)]
        );
    }

    #[test]
    fn update_of_missing_key_fails_quorum() {
        let mut nodes = cluster(3);
        nodes[0].update("ghost", "value").unwrap();

        nodes[1].tick();
        nodes[2].tick();
        nodes[0].tick();

        assert_eq!(
            coordinator_outcomes(&nodes[0]),
            vec![(Op::Update, Outcome::Failure)]
        );
    }

    #[test]
    fn unanswered_transaction_times_out_once() {
        let hub = LoopbackHub::new();
        let ms = members(3);
        // peers are on the ring but never run; only the coordinator's own
        // rejection ever arrives
        let mut coordinator = Node::new(
            ms[0].clone(),
            hub.register(&ms[0]),
            MemStore::new(),
            MemoryAudit::default(),
        );
        coordinator.refresh_ring(&ms);
        coordinator.delete("phantom").unwrap();

        for _ in 0..TXN_TIMEOUT + 2 {
            coordinator.tick();
        }
        assert_eq!(
            coordinator_outcomes(&coordinator),
            vec![(Op::Delete, Outcome::Failure)]
        );
        assert_eq!(coordinator.pending_count(), 0);

        // never finalized twice
        for _ in 0..5 {
            coordinator.tick();
        }
        assert_eq!(coordinator_outcomes(&coordinator).len(), 1);
    }

    #[test]
    fn too_few_members_rejects_operations() {
        let mut nodes = cluster(2);
        assert!(nodes[0].create("k", "v").is_err());
        assert!(nodes[0].read("k").is_err());
        assert_eq!(nodes[0].pending_count(), 0);

        nodes[1].tick();
        assert!(nodes[1].store().is_empty());
    }

    #[test]
    fn empty_values_are_rejected_up_front() {
        let mut nodes = cluster(3);
        assert!(nodes[0].create("k", "").is_err());
        assert!(nodes[0].update("k", "").is_err());
        assert_eq!(nodes[0].pending_count(), 0);
    }

    #[test]
    fn transaction_ids_are_monotonic() {
        let mut nodes = cluster(3);
        let a = nodes[0].create("one", "1").unwrap();
        let b = nodes[0].read("one").unwrap();
        let c = nodes[0].delete("one").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn ring_growth_restores_replication() {
        let hub = LoopbackHub::new();
        let three = members(3);
        let mut nodes = cluster_on(&hub, &three);

        nodes[0].create("europa", "ice").unwrap();
        nodes[0].create("titan", "haze").unwrap();
        for _ in 0..3 {
            for node in nodes.iter_mut() {
                node.tick();
            }
        }
        assert_eq!(coordinator_outcomes(&nodes[0]).len(), 2);
        assert_eq!(nodes[0].pending_count(), 0);

        // a fourth member joins; every holder re-pushes its keys
        let four = members(4);
        let mut joiner = Node::new(
            four[3].clone(),
            hub.register(&four[3]),
            MemStore::new(),
            MemoryAudit::default(),
        );
        joiner.refresh_ring(&four);
        for node in nodes.iter_mut() {
            node.refresh_ring(&four);
        }

        joiner.tick();
        for node in nodes.iter_mut() {
            node.tick();
        }

        // every key is held by its newly computed replica set
        for key in ["europa", "titan"] {
            for member in nodes[0].ring().replicas_for(key) {
                let value = if member == four[3] {
                    joiner.store().read(key)
                } else {
                    nodes
                        .iter()
                        .find(|n| *n.me() == member)
                        .unwrap()
                        .store()
                        .read(key)
                };
                assert!(value.is_some(), "{member} should hold {key}");
            }
        }

        // sentinel replies never open transactions anywhere
        for node in nodes.iter_mut() {
            node.tick();
            assert_eq!(node.pending_count(), 0);
        }
        joiner.tick();
        assert_eq!(joiner.pending_count(), 0);
    }
}
