//! courier: in-process message routing library.
//!
//! Sockets exchange multi-part framed messages through a small set of
//! patterns: exclusive pairs ([`SocketType::Pair`]), publish/subscribe
//! with prefix and glob-pattern filtering ([`SocketType::Pub`] /
//! [`SocketType::Sub`] and their raw [`SocketType::Xpub`] /
//! [`SocketType::Xsub`] forms), and identity-addressed routing
//! ([`SocketType::Router`]).
//!
//! Peers are linked by bidirectional pipes built on lock-free SPSC
//! queues; cross-thread coordination runs over per-socket command
//! mailboxes, so a socket's state is only ever touched by the thread
//! driving it. Delivery is at-most-once per connection with per-pipe
//! high-water-mark backpressure.
//!
//! ```
//! use courier::{Context, Msg, RecvFlags, SendFlags, SocketOption, SocketType};
//!
//! let ctx = Context::new();
//! let mut publisher = ctx.socket(SocketType::Pub)?;
//! publisher.bind("inproc://market")?;
//!
//! let mut subscriber = ctx.socket(SocketType::Sub)?;
//! subscriber.connect("inproc://market")?;
//! subscriber.set_option(SocketOption::Subscribe(b"news."))?;
//!
//! publisher.send(Msg::from("news.sports score=3"), SendFlags::default())?;
//! let msg = subscriber.recv(RecvFlags::default())?;
//! assert_eq!(msg.data(), b"news.sports score=3");
//! # Ok::<(), courier::Error>(())
//! ```

mod ctx;
mod dist;
mod error;
mod fq;
mod mailbox;
mod monitor;
mod msg;
mod mtrie;
mod options;
mod pattern;
mod pipe;
mod poll;
mod socket;
mod spsc;
mod trie;
pub mod wire;

pub use ctx::{capability, version, Context, CtxOption, DEFAULT_MAX_SOCKETS};
pub use error::{Error, Result};
pub use monitor::{
    MonitorEvent, EVENT_ACCEPTED, EVENT_ALL, EVENT_BIND_FAILED, EVENT_CLOSED, EVENT_CONNECTED,
    EVENT_DISCONNECTED, EVENT_HANDSHAKE_FAIL, EVENT_HANDSHAKE_OK, EVENT_HANDSHAKE_START,
    EVENT_HEARTBEAT_FAIL, EVENT_HEARTBEAT_OK, EVENT_LISTENING,
};
pub use msg::{Metadata, Msg, COMMAND, MAX_INLINE, MAX_ROUTING_ID, MORE};
pub use options::{OptionName, OptionValue, SocketOption, SocketType, DEFAULT_HWM};
pub use poll::{poll, PollItem, POLLIN, POLLOUT};
pub use socket::{RecvFlags, SendFlags, Socket};
