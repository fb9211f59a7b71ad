//! ROUTER: identity-addressed request routing.
//!
//! Every inbound message is prefixed with a frame naming the peer it came
//! from; the first frame of every outbound message names the peer it goes
//! to. Peers announce an identity at attach time or are assigned a
//! zero-prefixed counter identity.

use std::collections::HashMap;

use crate::fq::FairQueue;
use crate::msg::{Msg, MORE};
use crate::options::{OptionName, OptionValue, Options, SocketOption};
use crate::pipe::{PipeId, PipeMap};
use crate::socket::PatternSocket;
use crate::{Error, Result};

pub(crate) struct Router {
    fq: FairQueue,
    /// Routing identity -> outbound pipe.
    out_pipes: HashMap<Vec<u8>, PipeId>,
    /// First frame of a new message, parked while its origin identity is
    /// delivered ahead of it.
    prefetched_msg: Option<Msg>,
    more_in: bool,
    current_out: Option<PipeId>,
    more_out: bool,
    /// Unroutable send_to fails instead of dropping silently.
    mandatory: bool,
    /// A reconnecting identity displaces the previous pipe.
    handover: bool,
    next_auto_id: u32,
}

impl Router {
    pub fn new() -> Self {
        Self {
            fq: FairQueue::new(),
            out_pipes: HashMap::new(),
            prefetched_msg: None,
            more_in: false,
            current_out: None,
            more_out: false,
            mandatory: false,
            handover: false,
            next_auto_id: 0,
        }
    }

    fn generate_identity(&mut self) -> Vec<u8> {
        // Zero first byte marks generated identities; user identities may
        // not start with it.
        let mut identity = vec![0u8];
        identity.extend_from_slice(&self.next_auto_id.to_be_bytes());
        self.next_auto_id = self.next_auto_id.wrapping_add(1);
        identity
    }
}

impl PatternSocket for Router {
    fn attach_pipe(&mut self, pipes: &mut PipeMap, pipe: PipeId, _opts: &Options) {
        let identity = pipes
            .get(pipe)
            .and_then(|p| p.identity().map(|id| id.to_vec()))
            .unwrap_or_else(|| self.generate_identity());

        if let Some(&existing) = self.out_pipes.get(&identity) {
            if !self.handover {
                log::warn!("rejecting peer with duplicate routing identity");
                if let Some(rejected) = pipes.get_mut(pipe) {
                    rejected.terminate(false);
                }
                return;
            }
            // Handover: the newcomer takes the identity, the old pipe is
            // shut down in an orderly fashion.
            self.out_pipes.remove(&identity);
            if let Some(displaced) = pipes.get_mut(existing) {
                displaced.set_identity(None);
                displaced.terminate(true);
            }
        }
        if let Some(attached) = pipes.get_mut(pipe) {
            attached.set_identity(Some(identity.clone()));
        }
        self.out_pipes.insert(identity, pipe);
        self.fq.attach(pipe);
    }

    fn send(&mut self, pipes: &mut PipeMap, msg: &mut Msg, _opts: &Options) -> Result<()> {
        if !self.more_out {
            // First frame addresses the message.
            let msg_more = msg.has_more();
            self.current_out = None;
            let destination = self.out_pipes.get(msg.data()).copied();
            match destination {
                Some(pipe) => {
                    let writable = pipes
                        .get_mut(pipe)
                        .map(|p| p.check_write())
                        .unwrap_or(false);
                    if writable {
                        self.current_out = Some(pipe);
                    } else if self.mandatory {
                        return Err(Error::WouldBlock);
                    }
                }
                None => {
                    if self.mandatory {
                        return Err(Error::HostUnreachable);
                    }
                    // Default policy: swallow the whole message silently.
                }
            }
            self.more_out = msg_more;
            let _ = msg.take();
            return Ok(());
        }

        // Body frames follow the address.
        let msg_more = msg.has_more();
        self.more_out = msg_more;
        if let Some(pipe) = self.current_out {
            let frame = msg.take();
            let accepted = pipes.get_mut(pipe).map(|p| p.write(frame)).unwrap_or(false);
            if !accepted {
                // Overflow in the middle of a message: the partial tail
                // is rolled back and the rest swallowed.
                if let Some(p) = pipes.get_mut(pipe) {
                    p.rollback();
                }
                self.current_out = None;
            } else if !msg_more {
                if let Some(p) = pipes.get_mut(pipe) {
                    p.flush();
                }
                self.current_out = None;
            }
        } else {
            let _ = msg.take();
        }
        Ok(())
    }

    fn recv(&mut self, pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        if let Some(msg) = self.prefetched_msg.take() {
            self.more_in = msg.has_more();
            return Ok(msg);
        }
        let Some((msg, pipe)) = self.fq.recv(pipes) else {
            return Err(Error::WouldBlock);
        };
        if self.more_in {
            self.more_in = msg.has_more();
            return Ok(msg);
        }
        // New logical message: deliver the origin identity first.
        let identity = pipes
            .get(pipe)
            .and_then(|p| p.identity().map(|id| id.to_vec()))
            .unwrap_or_default();
        self.prefetched_msg = Some(msg);
        let mut id_frame = Msg::from(identity);
        id_frame.set_flags(MORE);
        Ok(id_frame)
    }

    fn has_in(&mut self, pipes: &mut PipeMap, _opts: &Options) -> bool {
        if self.prefetched_msg.is_some() || self.more_in {
            return true;
        }
        self.fq.has_in(pipes)
    }

    fn has_out(&mut self, pipes: &mut PipeMap, _opts: &Options) -> bool {
        if self.more_out {
            return true;
        }
        self.out_pipes
            .values()
            .any(|&id| pipes.get_mut(id).map(|p| p.check_write()).unwrap_or(false))
    }

    fn read_activated(&mut self, _pipes: &mut PipeMap, pipe: PipeId) {
        self.fq.activated(pipe);
    }

    fn pipe_terminated(&mut self, pipes: &mut PipeMap, pipe: PipeId) {
        if let Some(identity) = pipes.get(pipe).and_then(|p| p.identity().map(|id| id.to_vec())) {
            if self.out_pipes.get(&identity) == Some(&pipe) {
                self.out_pipes.remove(&identity);
            }
        }
        self.fq.pipe_terminated(pipe);
        if self.current_out == Some(pipe) {
            self.current_out = None;
        }
    }

    fn set_option(
        &mut self,
        _pipes: &mut PipeMap,
        _opts: &mut Options,
        option: &SocketOption<'_>,
    ) -> Result<()> {
        match *option {
            SocketOption::RouterMandatory(on) => {
                self.mandatory = on;
                Ok(())
            }
            SocketOption::RouterHandover(on) => {
                self.handover = on;
                Ok(())
            }
            _ => Err(Error::InvalidArgument("option not valid for this socket type")),
        }
    }

    fn get_option(&mut self, _opts: &Options, name: OptionName) -> Option<OptionValue> {
        match name {
            OptionName::RouterMandatory => Some(OptionValue::Bool(self.mandatory)),
            OptionName::RouterHandover => Some(OptionValue::Bool(self.handover)),
            _ => None,
        }
    }
}
