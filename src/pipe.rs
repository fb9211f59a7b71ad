//! Bidirectional pipe between two socket patterns.
//!
//! A pipe pair is two [`Pipe`] objects sharing two SPSC queues, one per
//! direction. Each half is owned by exactly one socket; the halves address
//! each other only by id through the peer's mailbox, so neither side holds
//! a reference into the other and teardown order is free.
//!
//! Flow control is credit based: the writer tracks
//! `msgs_written - peers_msgs_read` against the high-water mark, and the
//! reader reports consumed counts every `lwm` messages with an
//! `ActivateWrite` command.
//!
//! Orderly shutdown travels in-band: each side writes a delimiter frame as
//! its last message, waits to observe the peer's delimiter, then exchanges
//! acknowledgements out of band. Only when an end has seen the peer
//! delimiter, sent its ack and received the peer's ack does it reach
//! `Terminated` and become safe to release.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::mailbox::{Command, Mailbox};
use crate::msg::Msg;
use crate::spsc::{YPipe, MSG_PIPE_GRANULARITY};

pub(crate) type PipeId = u64;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

type MsgQueue = YPipe<Msg, MSG_PIPE_GRANULARITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeState {
    Active,
    WaitingForDelimiter,
    DelimiterReceived,
    TermAckSent,
    Terminated,
}

pub(crate) struct Pipe {
    id: PipeId,
    peer_id: PipeId,
    inq: Arc<MsgQueue>,
    outq: Arc<MsgQueue>,
    peer_mailbox: Arc<Mailbox>,
    /// Outbound limit in frames; 0 = unlimited.
    hwm: u64,
    /// Inbound credit-report batch; 0 = never report.
    lwm: u64,
    msgs_read: u64,
    msgs_written: u64,
    peers_msgs_read: u64,
    in_active: bool,
    out_active: bool,
    state: PipeState,
    ack_sent: bool,
    ack_received: bool,
    /// Drop inbound user messages while draining towards the delimiter.
    discard_inbound: bool,
    /// Never delay termination on this pipe (PUB attachments).
    nodelay: bool,
    /// Peer routing identity, when known at attach time.
    identity: Option<Vec<u8>>,
}

fn compute_lwm(hwm: u64) -> u64 {
    if hwm == 0 {
        0
    } else {
        (hwm + 1) / 2
    }
}

/// Create a connected pipe pair. `a_to_b_hwm` bounds the first half's
/// outbound direction, `b_to_a_hwm` the second's. Both halves reference
/// each other before either is visible to a socket.
pub(crate) fn pipe_pair(
    a_mailbox: Arc<Mailbox>,
    b_mailbox: Arc<Mailbox>,
    a_to_b_hwm: u64,
    b_to_a_hwm: u64,
) -> (Pipe, Pipe) {
    let a_to_b: Arc<MsgQueue> = Arc::new(YPipe::new());
    let b_to_a: Arc<MsgQueue> = Arc::new(YPipe::new());
    let id_a = NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed);
    let id_b = NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed);
    let half_a = Pipe {
        id: id_a,
        peer_id: id_b,
        inq: Arc::clone(&b_to_a),
        outq: Arc::clone(&a_to_b),
        peer_mailbox: b_mailbox,
        hwm: a_to_b_hwm,
        lwm: compute_lwm(b_to_a_hwm),
        msgs_read: 0,
        msgs_written: 0,
        peers_msgs_read: 0,
        in_active: true,
        out_active: true,
        state: PipeState::Active,
        ack_sent: false,
        ack_received: false,
        discard_inbound: false,
        nodelay: false,
        identity: None,
    };
    let half_b = Pipe {
        id: id_b,
        peer_id: id_a,
        inq: a_to_b,
        outq: b_to_a,
        peer_mailbox: a_mailbox,
        hwm: b_to_a_hwm,
        lwm: compute_lwm(a_to_b_hwm),
        msgs_read: 0,
        msgs_written: 0,
        peers_msgs_read: 0,
        in_active: true,
        out_active: true,
        state: PipeState::Active,
        ack_sent: false,
        ack_received: false,
        discard_inbound: false,
        nodelay: false,
        identity: None,
    };
    (half_a, half_b)
}

impl Pipe {
    pub fn id(&self) -> PipeId {
        self.id
    }

    #[cfg(test)]
    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn identity(&self) -> Option<&[u8]> {
        self.identity.as_deref()
    }

    pub fn set_identity(&mut self, identity: Option<Vec<u8>>) {
        self.identity = identity;
    }

    pub fn set_nodelay(&mut self) {
        self.nodelay = true;
    }

    fn readable_state(&self) -> bool {
        matches!(
            self.state,
            PipeState::Active | PipeState::WaitingForDelimiter
        )
    }

    /// True iff a user message can be read right now. Consumes a pending
    /// delimiter as a side effect of discovering it.
    pub fn check_read(&mut self) -> bool {
        if !self.in_active || !self.readable_state() {
            return false;
        }
        match self.inq.probe(|msg| msg.is_delimiter()) {
            None => {
                self.in_active = false;
                false
            }
            Some(true) => {
                let _ = self.inq.read();
                self.process_delimiter();
                false
            }
            Some(false) => true,
        }
    }

    /// Read one frame. `None` when empty or past the delimiter.
    pub fn read(&mut self) -> Option<Msg> {
        if !self.in_active || !self.readable_state() {
            return None;
        }
        loop {
            let Some(msg) = self.inq.read() else {
                self.in_active = false;
                return None;
            };
            if msg.is_delimiter() {
                self.process_delimiter();
                return None;
            }
            self.msgs_read += 1;
            if self.lwm > 0 && self.msgs_read % self.lwm == 0 {
                self.peer_mailbox.send(Command::ActivateWrite {
                    pipe: self.peer_id,
                    msgs_read: self.msgs_read,
                });
            }
            if self.discard_inbound {
                continue;
            }
            return Some(msg);
        }
    }

    /// True iff another frame fits under the high-water mark. A full pipe
    /// deactivates its write side until the peer reports credit.
    pub fn check_write(&mut self) -> bool {
        if !self.out_active || self.state != PipeState::Active {
            return false;
        }
        if self.hwm > 0 && self.msgs_written - self.peers_msgs_read >= self.hwm {
            self.out_active = false;
            return false;
        }
        true
    }

    /// Write one frame; frames of a multipart message stay unpublished
    /// until the final frame so the peer observes whole messages only.
    pub fn write(&mut self, msg: Msg) -> bool {
        if !self.check_write() {
            return false;
        }
        let incomplete = msg.has_more();
        self.outq.write(msg, incomplete);
        self.msgs_written += 1;
        true
    }

    /// Discard any frames written since the last flush.
    pub fn rollback(&mut self) {
        while self.outq.unwrite().is_some() {
            self.msgs_written -= 1;
        }
    }

    /// Publish pending writes, waking the peer if it went to sleep.
    pub fn flush(&mut self) {
        if self.state == PipeState::Terminated {
            return;
        }
        if !self.outq.flush() {
            self.peer_mailbox
                .send(Command::ActivateRead { pipe: self.peer_id });
        }
    }

    /// Start orderly shutdown of this end. With `delay` the pipe keeps
    /// delivering inbound messages until the peer's delimiter; without it
    /// everything still queued inbound is dropped while draining.
    pub fn terminate(&mut self, delay: bool) {
        let delay = delay && !self.nodelay;
        if !delay {
            self.discard_inbound = true;
        }
        match self.state {
            PipeState::Active => {
                self.rollback();
                self.send_delimiter();
                self.peer_mailbox
                    .send(Command::PipeTerm { pipe: self.peer_id });
                self.state = PipeState::WaitingForDelimiter;
            }
            PipeState::DelimiterReceived => {
                self.rollback();
                self.send_delimiter();
                self.peer_mailbox
                    .send(Command::PipeTerm { pipe: self.peer_id });
                self.state = PipeState::TermAckSent;
                self.send_ack();
            }
            PipeState::WaitingForDelimiter
            | PipeState::TermAckSent
            | PipeState::Terminated => {}
        }
        self.out_active = false;
    }

    /// Peer asked this end to terminate.
    pub fn process_pipe_term(&mut self) {
        match self.state {
            PipeState::Active => {
                self.rollback();
                self.send_delimiter();
                self.state = PipeState::WaitingForDelimiter;
            }
            PipeState::DelimiterReceived => {
                self.rollback();
                self.send_delimiter();
                self.state = PipeState::TermAckSent;
                self.send_ack();
            }
            PipeState::WaitingForDelimiter
            | PipeState::TermAckSent
            | PipeState::Terminated => {}
        }
        self.out_active = false;
    }

    /// Peer acknowledged our termination. Returns true when the pipe just
    /// reached `Terminated`.
    pub fn process_pipe_term_ack(&mut self) -> bool {
        self.ack_received = true;
        self.maybe_finish()
    }

    /// Credit report from the peer. Returns true when the write side just
    /// became active again.
    pub fn process_activate_write(&mut self, msgs_read: u64) -> bool {
        if msgs_read > self.peers_msgs_read {
            self.peers_msgs_read = msgs_read;
        }
        if self.out_active || self.state != PipeState::Active {
            return false;
        }
        if self.hwm > 0 && self.msgs_written - self.peers_msgs_read >= self.hwm {
            return false;
        }
        self.out_active = true;
        true
    }

    /// Wake-up from the peer's flush. Returns true when the read side just
    /// became active again.
    pub fn process_activate_read(&mut self) -> bool {
        if self.in_active || !self.readable_state() {
            return false;
        }
        self.in_active = true;
        true
    }

    /// Drop queued inbound messages looking for the peer delimiter.
    /// Used by the closing socket to make progress without a reader.
    pub fn drain_inbound(&mut self) {
        if self.state != PipeState::WaitingForDelimiter {
            return;
        }
        self.discard_inbound = true;
        self.in_active = true;
        while self.state == PipeState::WaitingForDelimiter {
            if self.read().is_none() && self.state == PipeState::WaitingForDelimiter {
                break;
            }
        }
    }

    /// True once both ends have acknowledged termination.
    pub fn is_terminated(&self) -> bool {
        self.state == PipeState::Terminated
    }

    /// Abandon the handshake from this side. The unconditional ack lets
    /// the peer complete its half alone; this half is dropped by the
    /// caller right after.
    pub fn force_close(&mut self) {
        if !self.ack_sent {
            self.ack_sent = true;
            self.peer_mailbox
                .send(Command::PipeTermAck { pipe: self.peer_id });
        }
        self.state = PipeState::Terminated;
    }

    fn send_delimiter(&mut self) {
        self.outq.write(Msg::delimiter(), false);
        if !self.outq.flush() {
            self.peer_mailbox
                .send(Command::ActivateRead { pipe: self.peer_id });
        }
    }

    fn send_ack(&mut self) {
        if !self.ack_sent {
            self.ack_sent = true;
            self.peer_mailbox
                .send(Command::PipeTermAck { pipe: self.peer_id });
        }
        self.maybe_finish();
    }

    fn process_delimiter(&mut self) {
        self.in_active = false;
        match self.state {
            PipeState::Active => self.state = PipeState::DelimiterReceived,
            PipeState::WaitingForDelimiter => {
                self.state = PipeState::TermAckSent;
                self.send_ack();
            }
            _ => {}
        }
    }

    fn maybe_finish(&mut self) -> bool {
        if self.state == PipeState::TermAckSent && self.ack_sent && self.ack_received {
            self.state = PipeState::Terminated;
            log::trace!("pipe {} terminated", self.id);
            return true;
        }
        false
    }
}

/// The pipes a socket currently owns, keyed by id. Scheduler structures
/// (fair queue, distributor) store ids and resolve them here.
pub(crate) struct PipeMap {
    map: HashMap<PipeId, Pipe>,
}

impl PipeMap {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, pipe: Pipe) -> PipeId {
        let id = pipe.id();
        self.map.insert(id, pipe);
        id
    }

    pub fn get_mut(&mut self, id: PipeId) -> Option<&mut Pipe> {
        self.map.get_mut(&id)
    }

    pub fn get(&self, id: PipeId) -> Option<&Pipe> {
        self.map.get(&id)
    }

    pub fn remove(&mut self, id: PipeId) -> Option<Pipe> {
        self.map.remove(&id)
    }

    pub fn contains(&self, id: PipeId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<PipeId> {
        self.map.keys().copied().collect()
    }

    pub fn terminated_ids(&self) -> Vec<PipeId> {
        self.map
            .values()
            .filter(|pipe| pipe.is_terminated())
            .map(|pipe| pipe.id())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pipe> {
        self.map.values_mut()
    }
}
