use crate::message::Message;
use crate::ring::Member;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Point-to-point message plumbing between members. Sends are
/// fire-and-forget: the wire may lose or duplicate traffic, and the engine
/// tolerates both (timeouts cover loss, idempotent storage covers
/// duplication).
pub trait Transport {
    fn send(&mut self, to: &Member, msg: Message);

    /// Every queued inbound message, in arrival order.
    fn drain(&mut self) -> Vec<Message>;
}

/// In-process switchboard connecting the loopback endpoints of a simulated
/// cluster. One queue per registered member.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    queues: Arc<Mutex<HashMap<Member, VecDeque<Message>>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a member and hand back its endpoint.
    pub fn register(&self, member: &Member) -> LoopbackNet {
        self.queues
            .lock()
            .expect("transport state poisoned")
            .entry(member.clone())
            .or_default();
        LoopbackNet {
            me: member.clone(),
            queues: Arc::clone(&self.queues),
        }
    }
}

pub struct LoopbackNet {
    me: Member,
    queues: Arc<Mutex<HashMap<Member, VecDeque<Message>>>>,
}

impl Transport for LoopbackNet {
    fn send(&mut self, to: &Member, msg: Message) {
        let mut queues = self.queues.lock().expect("transport state poisoned");
        match queues.get_mut(to) {
            Some(queue) => queue.push_back(msg),
            // unknown destination: the wire is allowed to lose traffic
            None => debug!("[{}] dropping message to unregistered {}", self.me, to),
        }
    }

    fn drain(&mut self) -> Vec<Message> {
        let mut queues = self.queues.lock().expect("transport state poisoned");
        queues
            .get_mut(&self.me)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, TxnId};

    fn reply(from: &Member, txn: TxnId) -> Message {
        Message {
            txn: Some(txn),
            from: from.clone(),
            kind: MessageKind::Reply { success: true },
        }
    }

    #[test]
    fn delivers_in_arrival_order() {
        let hub = LoopbackHub::new();
        let a = Member::new("10.1.0.1:7400");
        let b = Member::new("10.1.0.2:7400");
        let mut net_a = hub.register(&a);
        let mut net_b = hub.register(&b);

        net_a.send(&b, reply(&a, 1));
        net_a.send(&b, reply(&a, 2));

        let inbound: Vec<_> = net_b.drain().into_iter().map(|m| m.txn).collect();
        assert_eq!(inbound, vec![Some(1), Some(2)]);
        assert!(net_b.drain().is_empty());
    }

    #[test]
    fn self_sends_loop_back() {
        let hub = LoopbackHub::new();
        let a = Member::new("10.1.0.1:7400");
        let mut net_a = hub.register(&a);

        net_a.send(&a, reply(&a, 7));
        assert_eq!(net_a.drain().len(), 1);
    }

    #[test]
    fn unknown_destinations_are_dropped() {
        let hub = LoopbackHub::new();
        let a = Member::new("10.1.0.1:7400");
        let ghost = Member::new("10.1.0.250:7400");
        let mut net_a = hub.register(&a);

        net_a.send(&ghost, reply(&a, 1));
        assert!(net_a.drain().is_empty());
    }
}
