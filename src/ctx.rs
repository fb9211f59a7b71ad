//! Context: process-wide owner of sockets and inproc endpoints.
//!
//! The context holds the socket registry (slot -> mailbox), the inproc
//! endpoint registry that `bind`/`connect` rendezvous through, and the
//! termination barrier. It is the only piece of shared state guarded by a
//! mutex, and the mutex is held only across registry mutations, never
//! across message flow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::mailbox::{Command, Mailbox};
use crate::options::SocketType;
use crate::socket::Socket;
use crate::{Error, Result};

/// Default cap on concurrently open sockets.
pub const DEFAULT_MAX_SOCKETS: usize = 1023;

/// Registration a bound socket leaves behind for connecting peers:
/// everything needed to build and deliver a pipe pair.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub slot: u32,
    pub mailbox: Arc<Mailbox>,
    pub socket_type: SocketType,
    pub sndhwm: i32,
    pub rcvhwm: i32,
    pub routing_id: Vec<u8>,
}

struct CtxState {
    sockets: HashMap<u32, Arc<Mailbox>>,
    next_slot: u32,
    endpoints: HashMap<String, Endpoint>,
    max_sockets: usize,
    io_threads: u32,
    max_msg_size: usize,
    thread_name_prefix: String,
    cpu_affinity: Vec<u32>,
}

pub(crate) struct CtxInner {
    state: Mutex<CtxState>,
    cond: Condvar,
    terminating: AtomicBool,
}

impl CtxInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, CtxState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub fn max_msg_size(&self) -> usize {
        self.lock().max_msg_size
    }

    pub fn register_socket(&self, mailbox: Arc<Mailbox>) -> Result<u32> {
        let mut state = self.lock();
        // Checked under the lock: a socket registered after the stop
        // broadcast would otherwise never learn about termination.
        if self.terminating() {
            return Err(Error::Terminated);
        }
        if state.sockets.len() >= state.max_sockets {
            return Err(Error::ResourceLimit("socket limit reached"));
        }
        let slot = state.next_slot;
        state.next_slot += 1;
        state.sockets.insert(slot, mailbox);
        Ok(slot)
    }

    pub fn unregister_socket(&self, slot: u32) {
        let mut state = self.lock();
        state.sockets.remove(&slot);
        // Any endpoint the socket left registered dies with it.
        state.endpoints.retain(|_, endpoint| endpoint.slot != slot);
        drop(state);
        self.cond.notify_all();
    }

    pub fn register_endpoint(&self, name: &str, endpoint: Endpoint) -> Result<()> {
        let mut state = self.lock();
        if state.endpoints.contains_key(name) {
            return Err(Error::AddrInUse);
        }
        state.endpoints.insert(name.to_string(), endpoint);
        Ok(())
    }

    pub fn unregister_endpoint(&self, name: &str, slot: u32) -> Result<()> {
        let mut state = self.lock();
        match state.endpoints.get(name) {
            Some(endpoint) if endpoint.slot == slot => {
                state.endpoints.remove(name);
                Ok(())
            }
            _ => Err(Error::AddrNotAvailable),
        }
    }

    pub fn lookup_endpoint(&self, name: &str) -> Option<Endpoint> {
        self.lock().endpoints.get(name).cloned()
    }
}

/// Process-wide socket factory and lifecycle root.
///
/// Cloning is cheap and shares the same underlying context, which is how
/// sockets are created from several threads. [`Context::terminate`] makes
/// every blocked socket call return [`Error::Terminated`] and then waits
/// for the last socket to close.
#[derive(Clone)]
pub struct Context {
    inner: Arc<CtxInner>,
}

/// Context-level options.
#[derive(Debug, Clone)]
pub enum CtxOption {
    /// Number of I/O threads the transport layer may spin up. Stored for
    /// the transport layer; the in-process core runs none.
    IoThreads(u32),
    MaxSockets(usize),
    /// Upper bound on frame size accepted by `send`.
    MaxMsgSize(usize),
    ThreadNamePrefix(String),
    CpuAffinityAdd(u32),
    CpuAffinityRemove(u32),
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CtxInner {
                state: Mutex::new(CtxState {
                    sockets: HashMap::new(),
                    next_slot: 0,
                    endpoints: HashMap::new(),
                    max_sockets: DEFAULT_MAX_SOCKETS,
                    io_threads: 1,
                    max_msg_size: usize::MAX,
                    thread_name_prefix: String::new(),
                    cpu_affinity: Vec::new(),
                }),
                cond: Condvar::new(),
                terminating: AtomicBool::new(false),
            }),
        }
    }

    /// Create a socket of the given pattern.
    pub fn socket(&self, socket_type: SocketType) -> Result<Socket> {
        Socket::open(Arc::clone(&self.inner), socket_type)
    }

    pub fn set(&self, option: CtxOption) -> Result<()> {
        let mut state = self.inner.lock();
        match option {
            CtxOption::IoThreads(count) => state.io_threads = count,
            CtxOption::MaxSockets(count) => {
                if count == 0 {
                    return Err(Error::InvalidArgument("max sockets must be > 0"));
                }
                state.max_sockets = count;
            }
            CtxOption::MaxMsgSize(size) => state.max_msg_size = size,
            CtxOption::ThreadNamePrefix(prefix) => state.thread_name_prefix = prefix,
            CtxOption::CpuAffinityAdd(cpu) => {
                if !state.cpu_affinity.contains(&cpu) {
                    state.cpu_affinity.push(cpu);
                }
            }
            CtxOption::CpuAffinityRemove(cpu) => {
                state.cpu_affinity.retain(|&c| c != cpu);
            }
        }
        Ok(())
    }

    pub fn io_threads(&self) -> u32 {
        self.inner.lock().io_threads
    }

    pub fn max_sockets(&self) -> usize {
        self.inner.lock().max_sockets
    }

    pub fn max_msg_size(&self) -> usize {
        self.inner.lock().max_msg_size
    }

    pub fn thread_name_prefix(&self) -> String {
        self.inner.lock().thread_name_prefix.clone()
    }

    /// CPUs the transport layer should pin its I/O threads to.
    pub fn cpu_affinity(&self) -> Vec<u32> {
        self.inner.lock().cpu_affinity.clone()
    }

    /// Begin shutdown and block until every socket has been closed.
    ///
    /// Sockets blocked in `send`/`recv`/`close` observe the stop command
    /// and return [`Error::Terminated`]; their owners are expected to
    /// close (or drop) them, which is what releases this call.
    pub fn terminate(&self) {
        self.inner.terminating.store(true, Ordering::Release);
        let mailboxes: Vec<Arc<Mailbox>> = {
            let state = self.inner.lock();
            state.sockets.values().cloned().collect()
        };
        for mailbox in mailboxes {
            mailbox.send(Command::Stop);
        }
        log::debug!("context terminating, waiting for sockets to close");
        let mut state = self.inner.lock();
        while !state.sockets.is_empty() {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Static capability probe.
pub fn capability(name: &str) -> bool {
    matches!(
        name,
        "pair" | "pub" | "sub" | "xpub" | "xsub" | "router" | "inproc"
    )
}

/// Library version as (major, minor, patch).
pub fn version() -> (u32, u32, u32) {
    let mut parts = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(|part| part.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major, minor, patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_probe() {
        assert!(capability("pub"));
        assert!(capability("inproc"));
        assert!(!capability("tcp"));
        assert!(!capability("ipc"));
        assert!(!capability("curve"));
    }

    #[test]
    fn version_is_parsed() {
        let (major, _minor, _patch) = version();
        assert_eq!(major, 0);
    }

    #[test]
    fn socket_limit_is_enforced() {
        let ctx = Context::new();
        ctx.set(CtxOption::MaxSockets(1)).unwrap();
        let first = ctx.socket(SocketType::Pair).unwrap();
        let second = ctx.socket(SocketType::Pair);
        assert!(matches!(second, Err(Error::ResourceLimit(_))));
        drop(first);
    }

    #[test]
    fn endpoint_registry_rejects_duplicates() {
        let ctx = Context::new();
        let mailbox = Arc::new(Mailbox::new());
        let endpoint = Endpoint {
            slot: 0,
            mailbox,
            socket_type: SocketType::Pub,
            sndhwm: 0,
            rcvhwm: 0,
            routing_id: Vec::new(),
        };
        ctx.inner.register_endpoint("market", endpoint.clone()).unwrap();
        assert!(matches!(
            ctx.inner.register_endpoint("market", endpoint),
            Err(Error::AddrInUse)
        ));
        assert!(ctx.inner.lookup_endpoint("market").is_some());
        ctx.inner.unregister_endpoint("market", 0).unwrap();
        assert!(ctx.inner.lookup_endpoint("market").is_none());
    }
}
