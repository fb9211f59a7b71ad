//! Fair-queue inbound scheduler.
//!
//! Round-robin over the attached pipes at message boundaries: once a pipe
//! yields the first frame of a multipart message, the scheduler sticks to
//! it until the final frame, so messages from different peers never
//! interleave. Pipes that run dry are rotated out of the active region and
//! rotated back in when their `read_activated` notification arrives.

use crate::msg::Msg;
use crate::pipe::{PipeId, PipeMap};

pub(crate) struct FairQueue {
    pipes: Vec<PipeId>,
    /// Pipes in `[0, active)` are believed readable.
    active: usize,
    /// Round-robin cursor into the active region.
    current: usize,
    /// Mid-multipart: stay on `current` until the final frame.
    more: bool,
}

impl FairQueue {
    pub fn new() -> Self {
        Self {
            pipes: Vec::new(),
            active: 0,
            current: 0,
            more: false,
        }
    }

    fn position(&self, pipe: PipeId) -> Option<usize> {
        self.pipes.iter().position(|&id| id == pipe)
    }

    pub fn attach(&mut self, pipe: PipeId) {
        self.pipes.push(pipe);
        let last = self.pipes.len() - 1;
        self.pipes.swap(last, self.active);
        self.active += 1;
    }

    pub fn activated(&mut self, pipe: PipeId) {
        let Some(index) = self.position(pipe) else {
            return;
        };
        if index < self.active {
            return;
        }
        self.pipes.swap(index, self.active);
        self.active += 1;
    }

    pub fn pipe_terminated(&mut self, pipe: PipeId) {
        let Some(index) = self.position(pipe) else {
            return;
        };
        let dead = if index < self.active {
            self.active -= 1;
            self.pipes.swap(index, self.active);
            if self.current == self.active {
                self.current = 0;
            }
            self.active
        } else {
            index
        };
        self.pipes.swap_remove(dead);
    }

    /// Read one frame, fair across peers at message boundaries. Returns
    /// the frame and the pipe it came from.
    pub fn recv(&mut self, pipes: &mut PipeMap) -> Option<(Msg, PipeId)> {
        while self.active > 0 {
            let id = self.pipes[self.current];
            let frame = pipes.get_mut(id).and_then(|pipe| pipe.read());
            match frame {
                Some(msg) => {
                    self.more = msg.has_more();
                    if !self.more {
                        self.current = (self.current + 1) % self.active;
                    }
                    return Some((msg, id));
                }
                None => {
                    // A multipart message is published atomically, so a
                    // pipe cannot run dry in the middle of one.
                    debug_assert!(!self.more);
                    self.active -= 1;
                    self.pipes.swap(self.current, self.active);
                    if self.current == self.active {
                        self.current = 0;
                    }
                }
            }
        }
        None
    }

    /// Would `recv` yield a frame right now?
    pub fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        if self.more {
            return true;
        }
        while self.active > 0 {
            let id = self.pipes[self.current];
            let readable = pipes
                .get_mut(id)
                .map(|pipe| pipe.check_read())
                .unwrap_or(false);
            if readable {
                return true;
            }
            self.active -= 1;
            self.pipes.swap(self.current, self.active);
            if self.current == self.active {
                self.current = 0;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Mailbox;
    use crate::msg::MORE;
    use crate::pipe::pipe_pair;
    use std::sync::Arc;

    /// Builds N writer halves feeding one reader-side PipeMap.
    fn rig(n: usize) -> (Vec<crate::pipe::Pipe>, PipeMap, FairQueue) {
        let reader_mailbox = Arc::new(Mailbox::new());
        let mut writers = Vec::new();
        let mut pipes = PipeMap::new();
        let mut fq = FairQueue::new();
        for _ in 0..n {
            let writer_mailbox = Arc::new(Mailbox::new());
            let (w, r) = pipe_pair(writer_mailbox, Arc::clone(&reader_mailbox), 0, 0);
            let id = pipes.insert(r);
            fq.attach(id);
            writers.push(w);
        }
        (writers, pipes, fq)
    }

    #[test]
    fn round_robin_at_message_boundaries() {
        let (mut writers, mut pipes, mut fq) = rig(2);
        for writer in writers.iter_mut() {
            for i in 0..2u8 {
                assert!(writer.write(Msg::from(&[i][..])));
            }
            writer.flush();
        }
        let mut order = Vec::new();
        while let Some((_msg, id)) = fq.recv(&mut pipes) {
            order.push(id);
        }
        assert_eq!(order.len(), 4);
        // Strict alternation between the two peers.
        assert_ne!(order[0], order[1]);
        assert_eq!(order[0], order[2]);
        assert_eq!(order[1], order[3]);
    }

    #[test]
    fn multipart_is_never_interleaved() {
        let (mut writers, mut pipes, mut fq) = rig(2);
        for (peer, writer) in writers.iter_mut().enumerate() {
            let mut head = Msg::from(&[peer as u8, 0][..]);
            head.set_flags(MORE);
            assert!(writer.write(head));
            assert!(writer.write(Msg::from(&[peer as u8, 1][..])));
            writer.flush();
        }
        let mut frames = Vec::new();
        while let Some((msg, _id)) = fq.recv(&mut pipes) {
            frames.push(msg.data().to_vec());
        }
        assert_eq!(frames.len(), 4);
        // Both frames of one message are adjacent.
        assert_eq!(frames[0][0], frames[1][0]);
        assert_eq!(frames[2][0], frames[3][0]);
        assert_ne!(frames[0][0], frames[2][0]);
    }

    #[test]
    fn drained_pipe_is_reactivated() {
        let (mut writers, mut pipes, mut fq) = rig(1);
        assert!(fq.recv(&mut pipes).is_none());
        assert!(writers[0].write(Msg::from("late")));
        writers[0].flush();
        // The read-side wake-up arrives as a command in the real socket;
        // here we poke the pipe and the scheduler directly.
        let id = pipes.ids()[0];
        assert!(pipes.get_mut(id).unwrap().process_activate_read());
        fq.activated(id);
        assert!(fq.recv(&mut pipes).is_some());
    }

    #[test]
    fn terminated_pipe_is_skipped() {
        let (mut writers, mut pipes, mut fq) = rig(2);
        for writer in writers.iter_mut() {
            assert!(writer.write(Msg::from("x")));
            writer.flush();
        }
        let victim = pipes.ids()[0];
        fq.pipe_terminated(victim);
        pipes.remove(victim);
        let mut seen = 0;
        while fq.recv(&mut pipes).is_some() {
            seen += 1;
        }
        assert_eq!(seen, 1);
    }
}
