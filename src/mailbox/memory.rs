//! In-memory mailbox, enough for tests and the demo CLI. A real
//! deployment plugs a persistent store into [`MailboxHandler`] instead.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::{MailboxError, MailboxHandler, OutboundMessage, ReceivedMessage};
use crate::fbb::{Address, Proposal, ProposalAnswer};

/// CMS-style store: every queued message may be delivered through whichever
/// station we are connected to.
#[derive(Default)]
pub struct MemoryMailbox {
    outbound: Vec<OutboundMessage>,
    deferred: HashSet<String>,
    sent: Vec<(String, bool)>,
    received: Vec<ReceivedMessage>,
    seen_mids: HashSet<String>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message for delivery.
    pub fn queue(&mut self, msg: OutboundMessage) {
        self.seen_mids.insert(msg.mid.clone());
        self.outbound.push(msg);
    }

    pub fn received(&self) -> &[ReceivedMessage] {
        &self.received
    }

    /// `(mid, rejected)` pairs in delivery order.
    pub fn sent(&self) -> &[(String, bool)] {
        &self.sent
    }

    pub fn deferred(&self) -> &HashSet<String> {
        &self.deferred
    }
}

impl MailboxHandler for MemoryMailbox {
    fn get_outbound(&mut self, _fw: &[Address]) -> Vec<OutboundMessage> {
        self.outbound
            .iter()
            .filter(|m| !self.deferred.contains(&m.mid))
            .cloned()
            .collect()
    }

    fn set_sent(&mut self, mid: &str, rejected: bool) {
        self.outbound.retain(|m| m.mid != mid);
        self.sent.push((mid.to_string(), rejected));
    }

    fn set_deferred(&mut self, mid: &str) {
        self.deferred.insert(mid.to_string());
    }

    fn get_inbound_answer(&mut self, proposal: &Proposal) -> ProposalAnswer {
        if self.seen_mids.contains(proposal.mid()) {
            ProposalAnswer::Reject
        } else {
            ProposalAnswer::Accept
        }
    }

    fn process_inbound(&mut self, message: ReceivedMessage) -> Result<(), MailboxError> {
        self.seen_mids.insert(message.mid.clone());
        self.received.push(message);
        Ok(())
    }
}

/// Clonable handle sharing one [`MemoryMailbox`] across sessions; each
/// exchange gets its own boxed handler while state lives in one place.
#[derive(Clone, Default)]
pub struct SharedMailbox(Arc<Mutex<MemoryMailbox>>);

impl SharedMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MemoryMailbox) -> R) -> R {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("mailbox lock poisoned, continuing with inner state");
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    }
}

impl MailboxHandler for SharedMailbox {
    fn prepare(&mut self) -> Result<(), MailboxError> {
        self.with(|mb| mb.prepare())
    }

    fn get_outbound(&mut self, fw: &[Address]) -> Vec<OutboundMessage> {
        self.with(|mb| mb.get_outbound(fw))
    }

    fn set_sent(&mut self, mid: &str, rejected: bool) {
        self.with(|mb| mb.set_sent(mid, rejected));
    }

    fn set_deferred(&mut self, mid: &str) {
        self.with(|mb| mb.set_deferred(mid));
    }

    fn get_inbound_answer(&mut self, proposal: &Proposal) -> ProposalAnswer {
        self.with(|mb| mb.get_inbound_answer(proposal))
    }

    fn process_inbound(&mut self, message: ReceivedMessage) -> Result<(), MailboxError> {
        self.with(|mb| mb.process_inbound(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(mid: &str) -> OutboundMessage {
        OutboundMessage {
            mid: mid.into(),
            title: "t".into(),
            msg_type: "EM".into(),
            size: 10,
            compressed_data: vec![1, 2, 3],
        }
    }

    #[test]
    fn deferred_excluded_from_outbound() {
        let mut mb = MemoryMailbox::new();
        mb.queue(msg("A"));
        mb.queue(msg("B"));
        mb.set_deferred("A");

        let out = mb.get_outbound(&[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mid, "B");
    }

    #[test]
    fn sent_removed_from_queue() {
        let mut mb = MemoryMailbox::new();
        mb.queue(msg("A"));
        mb.set_sent("A", false);
        assert!(mb.get_outbound(&[]).is_empty());
        assert_eq!(mb.sent(), &[("A".to_string(), false)]);
    }

    #[test]
    fn duplicate_mid_rejected() {
        let mut mb = MemoryMailbox::new();
        mb.process_inbound(ReceivedMessage {
            mid: "DUP".into(),
            title: "t".into(),
            code: Default::default(),
            size: 0,
            compressed_data: Vec::new(),
        })
        .unwrap();

        let prop = Proposal::decode_line("FC EM DUP 10 5 0").unwrap();
        assert_eq!(mb.get_inbound_answer(&prop), ProposalAnswer::Reject);
    }
}
