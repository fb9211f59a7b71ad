//! XPUB: publisher that surfaces subscription traffic.
//!
//! PUB is XPUB in a restricted mode (`is_pub`): it never surfaces
//! sub/cancel events, rejects `recv`, and attaches pipes with no-delay
//! termination since there is nobody to drain a delimiter towards.
//!
//! Inbound frames from subscriber peers are interpreted as subscription
//! commands, either real command frames or the legacy form with a 0x01
//! (subscribe) / 0x00 (cancel) first byte, and folded into the multi-trie.
//! Outbound messages are matched against the trie and handed to the
//! distributor.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::dist::Dist;
use crate::msg::{Metadata, Msg};
use crate::mtrie::{MultiTrie, RmResult};
use crate::options::{OptionName, OptionValue, Options, SocketOption};
use crate::pipe::{PipeId, PipeMap};
use crate::socket::PatternSocket;
use crate::{Error, Result};

/// A queued event or upstream user message, kept verbatim for `recv`.
struct PendingUpstream {
    data: Vec<u8>,
    metadata: Option<Arc<Metadata>>,
    flags: u8,
}

pub(crate) struct XPub {
    dist: Dist,
    /// Prefix -> subscriber pipes; drives outbound matching.
    subscriptions: MultiTrie<PipeId>,
    /// Shadow trie of not-yet-applied subscriptions in manual mode.
    manual_subscriptions: MultiTrie<PipeId>,
    verbose_subs: bool,
    verbose_unsubs: bool,
    /// Stays true when a non-lossy send of the final frame returned
    /// WouldBlock: the caller is still mid-message and retries the frame.
    more_send: bool,
    more_recv: bool,
    process_subscribe: bool,
    only_first_subscribe: bool,
    /// Drop on a full pipe (default) instead of failing the whole send.
    lossy: bool,
    manual: bool,
    send_last_pipe: bool,
    last_pipe: Option<PipeId>,
    pending_pipes: VecDeque<Option<PipeId>>,
    welcome_msg: Option<Msg>,
    pending: VecDeque<PendingUpstream>,
    is_pub: bool,
}

impl XPub {
    pub fn new(is_pub: bool) -> Self {
        Self {
            dist: Dist::new(),
            subscriptions: MultiTrie::new(),
            manual_subscriptions: MultiTrie::new(),
            verbose_subs: false,
            verbose_unsubs: false,
            more_send: false,
            more_recv: false,
            process_subscribe: false,
            only_first_subscribe: false,
            lossy: true,
            manual: false,
            send_last_pipe: false,
            last_pipe: None,
            pending_pipes: VecDeque::new(),
            welcome_msg: None,
            pending: VecDeque::new(),
            is_pub,
        }
    }

    /// Decode a frame as subscribe/cancel: command frames carry the topic
    /// in the body, the legacy form prefixes it with 0x01/0x00.
    fn decode_subscription(msg: &Msg) -> Option<(Vec<u8>, bool)> {
        if msg.is_subscribe() {
            return Some((msg.command_body().to_vec(), true));
        }
        if msg.is_cancel() {
            return Some((msg.command_body().to_vec(), false));
        }
        let data = msg.data();
        if !data.is_empty() && (data[0] == 0 || data[0] == 1) {
            return Some((data[1..].to_vec(), data[0] == 1));
        }
        None
    }
}

/// Event payload in the legacy wire shape: status byte then topic.
fn subscription_event(subscribe: bool, topic: &[u8]) -> Vec<u8> {
    let mut event = Vec::with_capacity(topic.len() + 1);
    event.push(subscribe as u8);
    event.extend_from_slice(topic);
    event
}

impl PatternSocket for XPub {
    fn attach_pipe(&mut self, pipes: &mut PipeMap, pipe: PipeId, _opts: &Options) {
        if self.is_pub {
            // No one drains a PUB peer's delimiter; never delay teardown.
            if let Some(attached) = pipes.get_mut(pipe) {
                attached.set_nodelay();
            }
        }
        self.dist.attach(pipe);
        if let Some(welcome) = &self.welcome_msg {
            if let Some(attached) = pipes.get_mut(pipe) {
                if attached.write(welcome.clone()) {
                    attached.flush();
                }
            }
        }
        // The pipe may already hold subscriptions; apply them now.
        self.read_activated(pipes, pipe);
    }

    fn read_activated(&mut self, pipes: &mut PipeMap, pipe: PipeId) {
        loop {
            let Some(msg) = pipes.get_mut(pipe).and_then(|p| p.read()) else {
                return;
            };
            let metadata = msg.metadata().cloned();
            let first_part = !self.more_recv;
            self.more_recv = msg.has_more();

            let decoded = if first_part || self.process_subscribe {
                Self::decode_subscription(&msg)
            } else {
                None
            };
            if first_part {
                self.process_subscribe = !self.only_first_subscribe || decoded.is_some();
            }

            match decoded {
                Some((topic, subscribe)) => {
                    let mut notify = false;
                    if self.manual {
                        if subscribe {
                            self.manual_subscriptions.add(&topic, pipe);
                        } else {
                            self.manual_subscriptions.rm(&topic, pipe);
                        }
                        self.pending_pipes.push_back(Some(pipe));
                    } else if subscribe {
                        let first_added = self.subscriptions.add(&topic, pipe);
                        notify = first_added || self.verbose_subs;
                    } else {
                        let result = self.subscriptions.rm(&topic, pipe);
                        notify = result != RmResult::ValuesRemain || self.verbose_unsubs;
                    }
                    if self.manual || (!self.is_pub && notify) {
                        self.pending.push_back(PendingUpstream {
                            data: subscription_event(subscribe, &topic),
                            metadata,
                            flags: 0,
                        });
                    }
                }
                None if !self.is_pub => {
                    // User message flowing upstream from an XSUB peer.
                    self.pending.push_back(PendingUpstream {
                        data: msg.data().to_vec(),
                        metadata,
                        flags: msg.flags(),
                    });
                }
                None => {}
            }
        }
    }

    fn send(&mut self, pipes: &mut PipeMap, msg: &mut Msg, opts: &Options) -> Result<()> {
        let msg_more = msg.has_more();

        // First frame of a message selects the audience.
        if !self.more_send {
            self.dist.unmatch();
            let dist = &mut self.dist;
            if self.manual && self.send_last_pipe && self.last_pipe.is_some() {
                let last = self.last_pipe.take();
                self.subscriptions.matches(msg.data(), |pipe| {
                    if last == Some(pipe) {
                        dist.matched(pipe);
                    }
                });
            } else {
                self.subscriptions
                    .matches(msg.data(), |pipe| dist.matched(pipe));
            }
            if opts.invert_matching {
                self.dist.reverse_match();
            }
        }

        if !self.lossy && !self.dist.check_hwm(pipes) {
            return Err(Error::WouldBlock);
        }
        self.dist.send_to_matching(pipes, msg.take());
        if !msg_more {
            self.dist.unmatch();
        }
        self.more_send = msg_more;
        Ok(())
    }

    fn recv(&mut self, _pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        if self.is_pub {
            return Err(Error::Unsupported("PUB sockets cannot receive"));
        }
        let Some(event) = self.pending.pop_front() else {
            return Err(Error::WouldBlock);
        };
        if self.manual && !self.pending_pipes.is_empty() {
            self.last_pipe = self.pending_pipes.pop_front().flatten();
            // A pipe that terminated since the event was queued must not
            // receive manual subscriptions.
            if let Some(last) = self.last_pipe {
                if !self.dist.has_pipe(last) {
                    self.last_pipe = None;
                }
            }
        }
        let mut msg = Msg::from(event.data);
        if let Some(metadata) = event.metadata {
            msg.set_metadata(metadata);
        }
        msg.set_flags(event.flags);
        Ok(msg)
    }

    fn has_in(&mut self, _pipes: &mut PipeMap, _opts: &Options) -> bool {
        !self.is_pub && !self.pending.is_empty()
    }

    fn has_out(&mut self, _pipes: &mut PipeMap, _opts: &Options) -> bool {
        true
    }

    fn write_activated(&mut self, _pipes: &mut PipeMap, pipe: PipeId) {
        self.dist.activated(pipe);
    }

    fn pipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: PipeId) {
        let is_pub = self.is_pub;
        let manual = self.manual;
        if manual {
            // The manual shadow trie drives the unsubscription events;
            // the applied trie is cleaned quietly.
            let pending = &mut self.pending;
            let pending_pipes = &mut self.pending_pipes;
            self.manual_subscriptions.remove_peer(pipe, false, |prefix| {
                if !is_pub {
                    pending.push_back(PendingUpstream {
                        data: subscription_event(false, prefix),
                        metadata: None,
                        flags: 0,
                    });
                    pending_pipes.push_back(None);
                }
            });
            self.subscriptions.remove_peer(pipe, false, |_| {});
            if self.last_pipe == Some(pipe) {
                self.last_pipe = None;
            }
        } else {
            let pending = &mut self.pending;
            self.subscriptions
                .remove_peer(pipe, !self.verbose_unsubs, |prefix| {
                    if !is_pub {
                        pending.push_back(PendingUpstream {
                            data: subscription_event(false, prefix),
                            metadata: None,
                            flags: 0,
                        });
                    }
                });
        }
        self.dist.pipe_terminated(pipe);
    }

    fn set_option(
        &mut self,
        _pipes: &mut PipeMap,
        _opts: &mut Options,
        option: &SocketOption<'_>,
    ) -> Result<()> {
        match *option {
            SocketOption::XpubVerbose(on) => {
                self.verbose_subs = on;
                self.verbose_unsubs = false;
            }
            SocketOption::XpubVerboser(on) => {
                self.verbose_subs = on;
                self.verbose_unsubs = on;
            }
            SocketOption::XpubNoDrop(on) => self.lossy = !on,
            SocketOption::XpubManual(on) => self.manual = on,
            SocketOption::XpubManualLastValue(on) => {
                self.manual = on;
                self.send_last_pipe = on;
            }
            SocketOption::OnlyFirstSubscribe(on) => self.only_first_subscribe = on,
            SocketOption::XpubWelcomeMsg(payload) => {
                self.welcome_msg = (!payload.is_empty()).then(|| Msg::from_slice(payload));
            }
            SocketOption::Subscribe(topic) if self.manual => {
                if let Some(last) = self.last_pipe {
                    self.subscriptions.add(topic, last);
                }
            }
            SocketOption::Unsubscribe(topic) if self.manual => {
                if let Some(last) = self.last_pipe {
                    self.subscriptions.rm(topic, last);
                }
            }
            _ => return Err(Error::InvalidArgument("option not valid for this socket type")),
        }
        Ok(())
    }

    fn get_option(&mut self, _opts: &Options, name: OptionName) -> Option<OptionValue> {
        match name {
            OptionName::TopicsCount => {
                Some(OptionValue::Int(self.subscriptions.num_prefixes() as i32))
            }
            OptionName::XpubNoDrop => Some(OptionValue::Bool(!self.lossy)),
            _ => None,
        }
    }
}
