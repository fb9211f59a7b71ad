//! Inter-thread commands and the per-socket mailbox.
//!
//! Every socket owns one mailbox. Peers (and the context) post typed
//! commands into it; the socket drains them at the start of every API call
//! and while parked inside a blocking call. The queue itself is the same
//! SPSC pipe as the data path at command granularity; a mutex serializes
//! the many producers, the single consumer side stays lock-free, and a
//! latched condvar signaler carries the wake-up when the consumer is
//! parked.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::pipe::{Pipe, PipeId};
use crate::spsc::{YPipe, CMD_PIPE_GRANULARITY};

/// Commands delivered to a socket's mailbox.
///
/// `Attach` transfers ownership of a pipe half to the receiving socket;
/// the rest address a pipe the socket already owns by id.
pub(crate) enum Command {
    /// Context is terminating; every blocking call must return.
    Stop,
    /// Adopt a freshly created pipe half (inproc connect or transport
    /// session handing over a connection).
    Attach {
        pipe: Pipe,
        endpoint: String,
    },
    /// The peer published messages while this end's reader was asleep.
    ActivateRead { pipe: PipeId },
    /// Credit report: the peer consumed messages up to `msgs_read`.
    ActivateWrite { pipe: PipeId, msgs_read: u64 },
    /// Transport reconnected under the pipe; replay state (subscriptions).
    Hiccup { pipe: PipeId },
    /// The peer started orderly termination of the pipe.
    PipeTerm { pipe: PipeId },
    /// The peer acknowledged our termination.
    PipeTermAck { pipe: PipeId },
}

/// Latched wake-up flag. A signal posted while nobody waits is consumed by
/// the next wait, so the drain-then-park pattern cannot lose wake-ups.
pub(crate) struct Signaler {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signaler {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut flag = lock_ignore_poison(&self.flag);
        *flag = true;
        self.cond.notify_all();
    }

    /// Wait until signaled or `deadline` passes. Returns false on timeout.
    pub fn wait_deadline(&self, deadline: Option<Instant>) -> bool {
        let mut flag = lock_ignore_poison(&self.flag);
        loop {
            if *flag {
                *flag = false;
                return true;
            }
            match deadline {
                None => {
                    flag = self
                        .cond
                        .wait(flag)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _timeout) = self
                        .cond
                        .wait_timeout(flag, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    flag = guard;
                }
            }
        }
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panicking sender cannot leave the flag in a state worse than
    // "spurious wake-up", which the drain loop already tolerates.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct Mailbox {
    queue: YPipe<Command, CMD_PIPE_GRANULARITY>,
    send_lock: Mutex<()>,
    signaler: Signaler,
    // Installed by `poll` so one waiter can watch several sockets.
    watcher: Mutex<Option<std::sync::Arc<Signaler>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            queue: YPipe::new(),
            send_lock: Mutex::new(()),
            signaler: Signaler::new(),
            watcher: Mutex::new(None),
        }
    }

    /// Post a command. Callable from any thread.
    pub fn send(&self, command: Command) {
        let awake = {
            let _guard = lock_ignore_poison(&self.send_lock);
            self.queue.write(command, false);
            self.queue.flush()
        };
        if !awake {
            self.signaler.signal();
            let watcher = lock_ignore_poison(&self.watcher);
            if let Some(watcher) = watcher.as_ref() {
                watcher.signal();
            }
        }
    }

    /// Non-blocking drain step. Owner thread only.
    pub fn try_recv(&self) -> Option<Command> {
        self.queue.read()
    }

    /// Park for at most `timeout` waiting for a command, without consuming
    /// it. Used by blocking send/recv loops between drain rounds.
    pub fn wait(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        if self.queue.probe(|_| ()).is_some() {
            return;
        }
        self.signaler.wait_deadline(deadline);
    }

    pub fn set_watcher(&self, watcher: std::sync::Arc<Signaler>) {
        *lock_ignore_poison(&self.watcher) = Some(watcher);
    }

    pub fn clear_watcher(&self) {
        *lock_ignore_poison(&self.watcher) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn send_then_recv_same_thread() {
        let mailbox = Mailbox::new();
        mailbox.send(Command::Stop);
        assert!(matches!(mailbox.try_recv(), Some(Command::Stop)));
        assert!(mailbox.try_recv().is_none());
    }

    #[test]
    fn wait_times_out_when_nothing_arrives() {
        let mailbox = Mailbox::new();
        assert!(mailbox.try_recv().is_none());
        let start = Instant::now();
        mailbox.wait(Some(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(mailbox.try_recv().is_none());
    }

    #[test]
    fn cross_thread_wakeup() {
        let mailbox = Arc::new(Mailbox::new());
        // Park the consumer first so the producer has to signal.
        assert!(mailbox.try_recv().is_none());

        let producer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                mailbox.send(Command::Stop);
            })
        };
        let start = Instant::now();
        mailbox.wait(Some(Duration::from_secs(5)));
        assert!(matches!(mailbox.try_recv(), Some(Command::Stop)));
        assert!(start.elapsed() < Duration::from_secs(5));
        producer.join().expect("producer thread");
    }

    #[test]
    fn watcher_is_signaled() {
        let mailbox = Arc::new(Mailbox::new());
        let watcher = Arc::new(Signaler::new());
        mailbox.set_watcher(Arc::clone(&watcher));

        // Drain so the sleeping flag is set, then send.
        assert!(mailbox.try_recv().is_none());
        mailbox.send(Command::Stop);
        assert!(watcher.wait_deadline(Some(Instant::now() + Duration::from_secs(1))));
        mailbox.clear_watcher();
    }
}
