use crate::message::{Op, TxnId};
use crate::ring::Member;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Sink every operation outcome is recorded to. Replica-local outcomes are
/// recorded with `coordinator = false`; the finalized quorum verdict is
/// recorded once by the issuing node with `coordinator = true`.
pub trait AuditSink {
    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        actor: &Member,
        coordinator: bool,
        txn: Option<TxnId>,
        op: Op,
        outcome: Outcome,
        key: &str,
        value: Option<&str>,
    );
}

/// Audit sink that writes to the log and tallies coordinator verdicts.
#[derive(Debug, Default)]
pub struct LogAudit {
    pub successes: u64,
    pub failures: u64,
}

impl AuditSink for LogAudit {
    fn record(
        &mut self,
        actor: &Member,
        coordinator: bool,
        txn: Option<TxnId>,
        op: Op,
        outcome: Outcome,
        key: &str,
        value: Option<&str>,
    ) {
        let side = if coordinator { "coordinator" } else { "replica" };
        match outcome {
            Outcome::Success => info!(
                "[{}] {} {} ok: txn={:?} key={} value={:?}",
                actor, side, op, txn, key, value
            ),
            Outcome::Failure => warn!(
                "[{}] {} {} failed: txn={:?} key={}",
                actor, side, op, txn, key
            ),
        }
        if coordinator {
            match outcome {
                Outcome::Success => self.successes += 1,
                Outcome::Failure => self.failures += 1,
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditRecord {
    pub actor: Member,
    pub coordinator: bool,
    pub txn: Option<TxnId>,
    pub op: Op,
    pub outcome: Outcome,
    pub key: String,
    pub value: Option<String>,
}

/// Capturing sink, used to assert on outcomes in tests.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    pub records: Vec<AuditRecord>,
}

impl AuditSink for MemoryAudit {
    fn record(
        &mut self,
        actor: &Member,
        coordinator: bool,
        txn: Option<TxnId>,
        op: Op,
        outcome: Outcome,
        key: &str,
        value: Option<&str>,
    ) {
        self.records.push(AuditRecord {
            actor: actor.clone(),
            coordinator,
            txn,
            op,
            outcome,
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }
}
