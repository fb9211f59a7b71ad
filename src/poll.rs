//! Readiness multiplexing over sockets.
//!
//! `poll` drains each socket's mailbox, checks pattern readiness, and
//! parks on a shared watcher signaler that every involved mailbox pings.
//! File-descriptor items belong to the transport layer and are not part
//! of the in-process core.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mailbox::Signaler;
use crate::socket::Socket;
use crate::Result;

/// Interest/readiness bit: a message can be received.
pub const POLLIN: u16 = 0x01;
/// Interest/readiness bit: a message can be sent.
pub const POLLOUT: u16 = 0x02;

/// One socket's interest registration and readiness result.
pub struct PollItem<'a> {
    socket: &'a mut Socket,
    events: u16,
    revents: u16,
}

impl<'a> PollItem<'a> {
    pub fn new(socket: &'a mut Socket, events: u16) -> Self {
        Self {
            socket,
            events,
            revents: 0,
        }
    }

    /// Readiness bits set by the last `poll` call.
    pub fn revents(&self) -> u16 {
        self.revents
    }

    pub fn is_readable(&self) -> bool {
        self.revents & POLLIN != 0
    }

    pub fn is_writable(&self) -> bool {
        self.revents & POLLOUT != 0
    }
}

/// Wait until at least one item is ready or the timeout expires. Returns
/// the number of ready items (0 on timeout). `None` waits indefinitely.
pub fn poll(items: &mut [PollItem<'_>], timeout: Option<Duration>) -> Result<usize> {
    let watcher = Arc::new(Signaler::new());
    for item in items.iter() {
        item.socket.poll_mailbox().set_watcher(Arc::clone(&watcher));
    }
    let deadline = timeout.map(|t| Instant::now() + t);
    let result = poll_loop(items, &watcher, deadline);
    for item in items.iter() {
        item.socket.poll_mailbox().clear_watcher();
    }
    result
}

fn poll_loop(
    items: &mut [PollItem<'_>],
    watcher: &Signaler,
    deadline: Option<Instant>,
) -> Result<usize> {
    loop {
        let mut ready = 0;
        for item in items.iter_mut() {
            item.revents = 0;
            let (readable, writable) = item
                .socket
                .poll_ready(item.events & POLLIN != 0, item.events & POLLOUT != 0)?;
            if readable {
                item.revents |= POLLIN;
            }
            if writable {
                item.revents |= POLLOUT;
            }
            if item.revents != 0 {
                ready += 1;
            }
        }
        if ready > 0 {
            return Ok(ready);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok(0);
            }
        }
        watcher.wait_deadline(deadline);
    }
}
