//! Distributor: outbound scheduler for PUB-side fan-out.
//!
//! Keeps the outbound pipes partitioned by three indices,
//! `matching <= active <= eligible <= len`:
//!
//! - `[0, matching)`: pipes selected for the message being sent;
//! - `[0, active)`: pipes a message may be started on right now;
//! - `[0, eligible)`: attached pipes that are not blocked by their
//!   high-water mark;
//! - `[eligible, len)`: pipes waiting for credit from the peer.
//!
//! A pipe attached or re-activated in the middle of a multipart send only
//! becomes `eligible`; promotion to `active` happens when the in-flight
//! message completes. Otherwise the peer would receive a message missing
//! its initial frames. The only `active` change inside a message is the
//! demotion of a pipe whose high-water mark was hit.

use crate::msg::Msg;
use crate::pipe::{PipeId, PipeMap};

pub(crate) struct Dist {
    pipes: Vec<PipeId>,
    matching: usize,
    active: usize,
    eligible: usize,
    /// True while inside a multipart send.
    more: bool,
}

impl Dist {
    pub fn new() -> Self {
        Self {
            pipes: Vec::new(),
            matching: 0,
            active: 0,
            eligible: 0,
            more: false,
        }
    }

    fn position(&self, pipe: PipeId) -> Option<usize> {
        self.pipes.iter().position(|&id| id == pipe)
    }

    pub fn attach(&mut self, pipe: PipeId) {
        self.pipes.push(pipe);
        let last = self.pipes.len() - 1;
        if self.more {
            self.pipes.swap(last, self.eligible);
            self.eligible += 1;
        } else {
            self.pipes.swap(last, self.eligible);
            self.eligible += 1;
            self.pipes.swap(self.eligible - 1, self.active);
            self.active += 1;
        }
    }

    pub fn has_pipe(&self, pipe: PipeId) -> bool {
        self.position(pipe).is_some()
    }

    /// A pipe reported fresh credit after hitting its high-water mark.
    pub fn activated(&mut self, pipe: PipeId) {
        let Some(index) = self.position(pipe) else {
            return;
        };
        if index < self.eligible {
            return;
        }
        self.pipes.swap(index, self.eligible);
        self.eligible += 1;
        if !self.more {
            self.pipes.swap(self.eligible - 1, self.active);
            self.active += 1;
        }
    }

    /// Select `pipe` for the next `send_to_matching`.
    pub fn matched(&mut self, pipe: PipeId) {
        let Some(index) = self.position(pipe) else {
            return;
        };
        // Only active pipes can be matched; duplicates are absorbed.
        if index < self.matching || index >= self.active {
            return;
        }
        self.pipes.swap(index, self.matching);
        self.matching += 1;
    }

    /// Swap matched and unmatched pipes within the active region.
    pub fn reverse_match(&mut self) {
        let previously_matching = self.matching;
        self.matching = 0;
        for index in previously_matching..self.active {
            self.pipes.swap(index, self.matching);
            self.matching += 1;
        }
    }

    pub fn unmatch(&mut self) {
        self.matching = 0;
    }

    pub fn pipe_terminated(&mut self, pipe: PipeId) {
        let Some(mut index) = self.position(pipe) else {
            return;
        };
        if index < self.matching {
            self.pipes.swap(index, self.matching - 1);
            self.matching -= 1;
            index = self.matching;
        }
        if index < self.active {
            self.pipes.swap(index, self.active - 1);
            self.active -= 1;
            index = self.active;
        }
        if index < self.eligible {
            self.pipes.swap(index, self.eligible - 1);
            self.eligible -= 1;
            index = self.eligible;
        }
        self.pipes.swap_remove(index);
    }

    /// Write `msg` to every matched pipe. On the final frame the matching
    /// set resets and pipes attached mid-message become active.
    pub fn send_to_matching(&mut self, pipes: &mut PipeMap, msg: Msg) {
        let msg_more = msg.has_more();
        self.distribute(pipes, msg);
        if !msg_more {
            self.active = self.eligible;
            self.matching = 0;
        }
        self.more = msg_more;
    }

    /// Write `msg` to every active pipe.
    pub fn send_to_all(&mut self, pipes: &mut PipeMap, msg: Msg) {
        self.matching = self.active;
        self.send_to_matching(pipes, msg);
    }

    fn distribute(&mut self, pipes: &mut PipeMap, msg: Msg) {
        if self.matching == 0 {
            return;
        }
        let mut index = 0;
        while index < self.matching {
            // Copies are cheap: inline memcpy or a refcount bump.
            if self.write(pipes, index, msg.clone()) {
                index += 1;
            }
            // On failure the pipe at `index` was demoted and a different
            // pipe swapped in; retry the same slot.
        }
    }

    /// Write one frame to the pipe at `index`; demote it out of matching,
    /// active and eligible when its high-water mark is hit.
    fn write(&mut self, pipes: &mut PipeMap, index: usize, msg: Msg) -> bool {
        let id = self.pipes[index];
        let msg_more = msg.has_more();
        let accepted = pipes
            .get_mut(id)
            .map(|pipe| pipe.write(msg))
            .unwrap_or(false);
        if !accepted {
            self.pipes.swap(index, self.matching - 1);
            self.matching -= 1;
            self.pipes.swap(self.matching, self.active - 1);
            self.active -= 1;
            self.pipes.swap(self.active, self.eligible - 1);
            self.eligible -= 1;
            return false;
        }
        if !msg_more {
            if let Some(pipe) = pipes.get_mut(id) {
                pipe.flush();
            }
        }
        true
    }

    /// Do all matched pipes have room for another frame?
    pub fn check_hwm(&self, pipes: &mut PipeMap) -> bool {
        self.pipes[..self.matching].iter().all(|&id| {
            pipes
                .get_mut(id)
                .map(|pipe| pipe.check_write())
                .unwrap_or(false)
        })
    }

    pub fn matching_count(&self) -> usize {
        self.matching
    }

    pub fn active_count(&self) -> usize {
        self.active
    }
}
