//! XSUB: subscriber side of the pub/sub pair.
//!
//! SUB is XSUB in a restricted mode (`is_sub`): inbound filtering is on,
//! user sends are rejected, and subscriptions arrive as socket options
//! which are converted into command frames and pushed through the normal
//! send path so every connected publisher learns of them.
//!
//! Glob pattern subscriptions stay local: the first pattern raises one
//! implicit subscribe-to-everything upstream and the matching happens on
//! receipt, so publishers keep a plain prefix trie.

use crate::dist::Dist;
use crate::fq::FairQueue;
use crate::msg::Msg;
use crate::options::{OptionName, OptionValue, Options, SocketOption};
use crate::pattern::PatternSet;
use crate::pipe::{PipeId, PipeMap};
use crate::socket::PatternSocket;
use crate::trie::Trie;
use crate::{Error, Result};

pub(crate) struct XSub {
    fq: FairQueue,
    /// Distributes subscription commands to every publisher.
    dist: Dist,
    subscriptions: Trie,
    pattern_subscriptions: PatternSet,
    /// Forward duplicate cancels upstream instead of swallowing them.
    verbose_unsubs: bool,
    /// Message matched during `has_in`, returned by the next `recv`.
    has_message: Option<Msg>,
    more_send: bool,
    more_recv: bool,
    process_subscribe: bool,
    only_first_subscribe: bool,
    is_sub: bool,
    /// Count of distinct patterns backing the implicit upstream
    /// subscribe-to-all.
    pattern_count: usize,
}

impl XSub {
    pub fn new(is_sub: bool) -> Self {
        Self {
            fq: FairQueue::new(),
            dist: Dist::new(),
            subscriptions: Trie::new(),
            pattern_subscriptions: PatternSet::new(),
            verbose_unsubs: false,
            has_message: None,
            more_send: false,
            more_recv: false,
            process_subscribe: false,
            only_first_subscribe: false,
            is_sub,
            pattern_count: 0,
        }
    }

    fn matches(&self, msg: &Msg, opts: &Options) -> bool {
        let topic = msg.data();
        let matched =
            self.subscriptions.check(topic) || self.pattern_subscriptions.check(topic);
        matched != opts.invert_matching
    }

    /// Replay the cached subscription state to one pipe (fresh attach or
    /// transport hiccup).
    fn replay_subscriptions(&mut self, pipes: &mut PipeMap, pipe: PipeId) {
        let Some(target) = pipes.get_mut(pipe) else {
            return;
        };
        self.subscriptions.apply(|prefix| {
            let sent = target.write(Msg::subscribe(prefix));
            // Past the high-water mark the subscription is dropped, same
            // as a subscribe option racing a full pipe.
            if !sent {
                log::warn!("dropping subscription replay on full pipe");
            }
        });
        if self.pattern_count > 0 {
            let _ = target.write(Msg::subscribe(b""));
        }
        target.flush();
    }

    /// The real XSUB send path, also used internally by SUB option
    /// handling. Subscribe/cancel frames update the local trie and are
    /// forwarded to every publisher; anything else flows upstream as is.
    fn send_internal(&mut self, pipes: &mut PipeMap, msg: &mut Msg, _opts: &Options) -> Result<()> {
        let first_part = !self.more_send;
        self.more_send = msg.has_more();

        if first_part {
            self.process_subscribe = !self.only_first_subscribe;
        } else if !self.process_subscribe {
            self.dist.send_to_all(pipes, msg.take());
            return Ok(());
        }

        let data = msg.data();
        if msg.is_subscribe() || (!data.is_empty() && data[0] == 1) {
            let topic = if msg.is_subscribe() {
                msg.command_body().to_vec()
            } else {
                data[1..].to_vec()
            };
            // Duplicates are forwarded on purpose: the publisher side
            // deduplicates, and filtering here would break XPUB verbose
            // mode across forwarding devices.
            self.subscriptions.add(&topic);
            self.process_subscribe = true;
            self.dist.send_to_all(pipes, msg.take());
            return Ok(());
        }
        if msg.is_cancel() || (!data.is_empty() && data[0] == 0) {
            let topic = if msg.is_cancel() {
                msg.command_body().to_vec()
            } else {
                data[1..].to_vec()
            };
            self.process_subscribe = true;
            let removed = self.subscriptions.rm(&topic);
            if removed || self.verbose_unsubs {
                self.dist.send_to_all(pipes, msg.take());
            } else {
                let _ = msg.take();
            }
            return Ok(());
        }
        // User message heading upstream to the publisher.
        self.dist.send_to_all(pipes, msg.take());
        Ok(())
    }
}

impl PatternSocket for XSub {
    fn attach_pipe(&mut self, pipes: &mut PipeMap, pipe: PipeId, _opts: &Options) {
        self.fq.attach(pipe);
        self.dist.attach(pipe);
        self.replay_subscriptions(pipes, pipe);
    }

    fn send(&mut self, pipes: &mut PipeMap, msg: &mut Msg, opts: &Options) -> Result<()> {
        if self.is_sub {
            return Err(Error::Unsupported("SUB sockets cannot send"));
        }
        self.send_internal(pipes, msg, opts)
    }

    fn recv(&mut self, pipes: &mut PipeMap, opts: &Options) -> Result<Msg> {
        if let Some(msg) = self.has_message.take() {
            self.more_recv = msg.has_more();
            return Ok(msg);
        }
        loop {
            let Some((msg, _pipe)) = self.fq.recv(pipes) else {
                return Err(Error::WouldBlock);
            };
            // Non-initial frames of an accepted message bypass the filter.
            if self.more_recv || !opts.filter || self.matches(&msg, opts) {
                self.more_recv = msg.has_more();
                return Ok(msg);
            }
            // Rejected: drop the remaining frames of the message.
            let mut tail = msg;
            while tail.has_more() {
                match self.fq.recv(pipes) {
                    Some((next, _)) => tail = next,
                    None => break,
                }
            }
        }
    }

    fn has_in(&mut self, pipes: &mut PipeMap, opts: &Options) -> bool {
        if self.more_recv || self.has_message.is_some() {
            return true;
        }
        loop {
            let Some((msg, _pipe)) = self.fq.recv(pipes) else {
                return false;
            };
            if !opts.filter || self.matches(&msg, opts) {
                self.has_message = Some(msg);
                return true;
            }
            let mut tail = msg;
            while tail.has_more() {
                match self.fq.recv(pipes) {
                    Some((next, _)) => tail = next,
                    None => break,
                }
            }
        }
    }

    fn has_out(&mut self, _pipes: &mut PipeMap, _opts: &Options) -> bool {
        // Subscriptions can be queued at any time.
        !self.is_sub
    }

    fn read_activated(&mut self, _pipes: &mut PipeMap, pipe: PipeId) {
        self.fq.activated(pipe);
    }

    fn write_activated(&mut self, _pipes: &mut PipeMap, pipe: PipeId) {
        self.dist.activated(pipe);
    }

    fn hiccuped(&mut self, pipes: &mut PipeMap, pipe: PipeId) {
        self.replay_subscriptions(pipes, pipe);
    }

    fn pipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: PipeId) {
        self.fq.pipe_terminated(pipe);
        self.dist.pipe_terminated(pipe);
    }

    fn set_option(
        &mut self,
        pipes: &mut PipeMap,
        opts: &mut Options,
        option: &SocketOption<'_>,
    ) -> Result<()> {
        match *option {
            SocketOption::Subscribe(topic) => {
                let mut msg = Msg::subscribe(topic);
                self.send_internal(pipes, &mut msg, opts)
            }
            SocketOption::Unsubscribe(topic) => {
                let mut msg = Msg::cancel(topic);
                self.send_internal(pipes, &mut msg, opts)
            }
            SocketOption::PSubscribe(pattern) => {
                if self.pattern_subscriptions.add(pattern)? {
                    self.pattern_count += 1;
                    if self.pattern_count == 1 {
                        // Patterns filter locally; ask publishers for
                        // everything while any pattern is live.
                        let mut msg = Msg::subscribe(b"");
                        self.send_internal(pipes, &mut msg, opts)?;
                    }
                }
                Ok(())
            }
            SocketOption::PUnsubscribe(pattern) => {
                if self.pattern_subscriptions.rm(pattern) {
                    self.pattern_count -= 1;
                    if self.pattern_count == 0 {
                        let mut msg = Msg::cancel(b"");
                        self.send_internal(pipes, &mut msg, opts)?;
                    }
                }
                Ok(())
            }
            SocketOption::OnlyFirstSubscribe(on) => {
                self.only_first_subscribe = on;
                Ok(())
            }
            SocketOption::XsubVerboseUnsubscribe(on) => {
                self.verbose_unsubs = on;
                Ok(())
            }
            _ => Err(Error::InvalidArgument("option not valid for this socket type")),
        }
    }

    fn get_option(&mut self, _opts: &Options, name: OptionName) -> Option<OptionValue> {
        match name {
            OptionName::TopicsCount => {
                Some(OptionValue::Int(self.subscriptions.num_prefixes() as i32))
            }
            _ => None,
        }
    }
}
