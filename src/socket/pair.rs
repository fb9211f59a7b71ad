//! PAIR: exclusive one-to-one connection.

use crate::msg::Msg;
use crate::options::Options;
use crate::pipe::{PipeId, PipeMap};
use crate::socket::PatternSocket;
use crate::{Error, Result};

pub(crate) struct Pair {
    pipe: Option<PipeId>,
}

impl Pair {
    pub fn new() -> Self {
        Self { pipe: None }
    }
}

impl PatternSocket for Pair {
    fn attach_pipe(&mut self, pipes: &mut PipeMap, pipe: PipeId, _opts: &Options) {
        if self.pipe.is_some() {
            // Exclusive pair: a second connection is refused outright.
            log::warn!("PAIR socket rejecting second connection");
            if let Some(rejected) = pipes.get_mut(pipe) {
                rejected.terminate(false);
            }
            return;
        }
        self.pipe = Some(pipe);
    }

    fn send(&mut self, pipes: &mut PipeMap, msg: &mut Msg, _opts: &Options) -> Result<()> {
        let Some(id) = self.pipe else {
            return Err(Error::WouldBlock);
        };
        let Some(pipe) = pipes.get_mut(id) else {
            return Err(Error::WouldBlock);
        };
        if !pipe.check_write() {
            return Err(Error::WouldBlock);
        }
        let more = msg.has_more();
        let accepted = pipe.write(msg.take());
        debug_assert!(accepted);
        if !more {
            pipe.flush();
        }
        Ok(())
    }

    fn recv(&mut self, pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        let frame = self
            .pipe
            .and_then(|id| pipes.get_mut(id))
            .and_then(|pipe| pipe.read());
        frame.ok_or(Error::WouldBlock)
    }

    fn has_in(&mut self, pipes: &mut PipeMap, _opts: &Options) -> bool {
        self.pipe
            .and_then(|id| pipes.get_mut(id))
            .map(|pipe| pipe.check_read())
            .unwrap_or(false)
    }

    fn has_out(&mut self, pipes: &mut PipeMap, _opts: &Options) -> bool {
        self.pipe
            .and_then(|id| pipes.get_mut(id))
            .map(|pipe| pipe.check_write())
            .unwrap_or(false)
    }

    fn read_activated(&mut self, _pipes: &mut PipeMap, _pipe: PipeId) {}

    fn pipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: PipeId) {
        if self.pipe == Some(pipe) {
            self.pipe = None;
        }
    }
}
