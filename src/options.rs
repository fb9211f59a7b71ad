//! Socket options.
//!
//! Generic options live in [`Options`] on the socket core; pattern-specific
//! options (subscriptions, XPUB modes, ROUTER policies) are routed to the
//! pattern state machine, which keeps them next to the state they control.

use crate::msg::MAX_ROUTING_ID;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Pair,
    Pub,
    Sub,
    Xpub,
    Xsub,
    Router,
}

impl SocketType {
    pub fn name(self) -> &'static str {
        match self {
            SocketType::Pair => "PAIR",
            SocketType::Pub => "PUB",
            SocketType::Sub => "SUB",
            SocketType::Xpub => "XPUB",
            SocketType::Xsub => "XSUB",
            SocketType::Router => "ROUTER",
        }
    }

    /// Which peer types a connection is accepted from.
    pub(crate) fn compatible_with(self, peer: SocketType) -> bool {
        use SocketType::*;
        matches!(
            (self, peer),
            (Pair, Pair)
                | (Pub | Xpub, Sub | Xsub)
                | (Sub | Xsub, Pub | Xpub)
                | (Router, Router)
        )
    }
}

/// Default per-pipe high-water mark, in frames.
pub const DEFAULT_HWM: i32 = 1000;

/// Option bag shared by all socket types.
#[derive(Debug, Clone)]
pub(crate) struct Options {
    pub socket_type: SocketType,
    pub sndhwm: i32,
    pub rcvhwm: i32,
    /// Close grace period in ms; 0 = none, -1 = unbounded.
    pub linger: i32,
    pub sndtimeo: i32,
    pub rcvtimeo: i32,
    pub routing_id: Vec<u8>,
    /// Identity announced by the next connect only.
    pub connect_routing_id: Option<Vec<u8>>,
    pub invert_matching: bool,
    /// SUB-style inbound filtering (off for XSUB).
    pub filter: bool,
    /// Upper bound on frame size, inherited from the context.
    pub max_msg_size: usize,
}

impl Options {
    pub fn new(socket_type: SocketType, max_msg_size: usize) -> Self {
        Self {
            socket_type,
            sndhwm: DEFAULT_HWM,
            rcvhwm: DEFAULT_HWM,
            // In-process transport: there is no asynchronous I/O thread to
            // hand lingering pipes to, so the default is an immediate close.
            linger: 0,
            sndtimeo: -1,
            rcvtimeo: -1,
            routing_id: Vec::new(),
            connect_routing_id: None,
            invert_matching: false,
            filter: false,
            max_msg_size,
        }
    }

    /// Apply a generic option. Returns false when the option is not
    /// handled here and must be offered to the pattern.
    pub fn set_core(&mut self, option: &SocketOption<'_>) -> Result<bool> {
        match *option {
            SocketOption::RoutingId(id) => {
                if id.is_empty() || id.len() > MAX_ROUTING_ID {
                    return Err(Error::InvalidArgument("routing id must be 1..=255 bytes"));
                }
                if id[0] == 0 {
                    return Err(Error::InvalidArgument(
                        "routing id may not start with a zero byte",
                    ));
                }
                self.routing_id = id.to_vec();
                Ok(true)
            }
            SocketOption::ConnectRoutingId(id) => {
                if id.is_empty() || id.len() > MAX_ROUTING_ID {
                    return Err(Error::InvalidArgument("routing id must be 1..=255 bytes"));
                }
                self.connect_routing_id = Some(id.to_vec());
                Ok(true)
            }
            SocketOption::Linger(ms) => {
                if ms < -1 {
                    return Err(Error::InvalidArgument("linger must be >= -1"));
                }
                self.linger = ms;
                Ok(true)
            }
            SocketOption::SndHwm(hwm) => {
                if hwm < 0 {
                    return Err(Error::InvalidArgument("high-water mark must be >= 0"));
                }
                self.sndhwm = hwm;
                Ok(true)
            }
            SocketOption::RcvHwm(hwm) => {
                if hwm < 0 {
                    return Err(Error::InvalidArgument("high-water mark must be >= 0"));
                }
                self.rcvhwm = hwm;
                Ok(true)
            }
            SocketOption::SndTimeout(ms) => {
                if ms < -1 {
                    return Err(Error::InvalidArgument("timeout must be >= -1"));
                }
                self.sndtimeo = ms;
                Ok(true)
            }
            SocketOption::RcvTimeout(ms) => {
                if ms < -1 {
                    return Err(Error::InvalidArgument("timeout must be >= -1"));
                }
                self.rcvtimeo = ms;
                Ok(true)
            }
            SocketOption::InvertMatching(on) => {
                self.invert_matching = on;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Read a generic option. `None` when the option belongs to the pattern.
    pub fn get_core(&self, name: OptionName) -> Option<OptionValue> {
        match name {
            OptionName::Linger => Some(OptionValue::Int(self.linger)),
            OptionName::SndHwm => Some(OptionValue::Int(self.sndhwm)),
            OptionName::RcvHwm => Some(OptionValue::Int(self.rcvhwm)),
            OptionName::SndTimeout => Some(OptionValue::Int(self.sndtimeo)),
            OptionName::RcvTimeout => Some(OptionValue::Int(self.rcvtimeo)),
            OptionName::RoutingId => Some(OptionValue::Bytes(self.routing_id.clone())),
            OptionName::InvertMatching => Some(OptionValue::Bool(self.invert_matching)),
            OptionName::Type => Some(OptionValue::Str(self.socket_type.name().to_string())),
            _ => None,
        }
    }
}

/// Settable socket options.
#[derive(Debug, Clone, Copy)]
pub enum SocketOption<'a> {
    RoutingId(&'a [u8]),
    ConnectRoutingId(&'a [u8]),
    RouterMandatory(bool),
    RouterHandover(bool),
    Linger(i32),
    SndHwm(i32),
    RcvHwm(i32),
    SndTimeout(i32),
    RcvTimeout(i32),
    Subscribe(&'a [u8]),
    Unsubscribe(&'a [u8]),
    PSubscribe(&'a [u8]),
    PUnsubscribe(&'a [u8]),
    XpubVerbose(bool),
    XpubVerboser(bool),
    XpubNoDrop(bool),
    XpubManual(bool),
    XpubManualLastValue(bool),
    XpubWelcomeMsg(&'a [u8]),
    OnlyFirstSubscribe(bool),
    XsubVerboseUnsubscribe(bool),
    InvertMatching(bool),
}

/// Readable socket options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionName {
    Linger,
    SndHwm,
    RcvHwm,
    SndTimeout,
    RcvTimeout,
    RoutingId,
    InvertMatching,
    Type,
    TopicsCount,
    XpubNoDrop,
    RouterMandatory,
    RouterHandover,
    LastEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i32),
    Bool(bool),
    Bytes(Vec<u8>),
    Str(String),
}

impl OptionValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            OptionValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            OptionValue::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

/// Pipe capacity for one direction of an inproc connection. Both ends
/// bound the same queue, so the stricter of the two non-zero marks wins;
/// 0 means that side asks for no bound.
pub(crate) fn pipe_hwm(send_side: i32, recv_side: i32) -> u64 {
    match (send_side, recv_side) {
        (0, 0) => 0,
        (0, recv) => recv as u64,
        (send, 0) => send as u64,
        (send, recv) => send.min(recv) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_options_round_trip() {
        let mut opts = Options::new(SocketType::Pub, usize::MAX);
        assert!(opts.set_core(&SocketOption::SndHwm(4)).unwrap());
        assert!(opts.set_core(&SocketOption::Linger(-1)).unwrap());
        assert_eq!(opts.get_core(OptionName::SndHwm), Some(OptionValue::Int(4)));
        assert_eq!(opts.get_core(OptionName::Linger), Some(OptionValue::Int(-1)));
    }

    #[test]
    fn pattern_options_are_not_handled_here() {
        let mut opts = Options::new(SocketType::Sub, usize::MAX);
        assert!(!opts.set_core(&SocketOption::Subscribe(b"news.")).unwrap());
        assert!(opts.get_core(OptionName::TopicsCount).is_none());
    }

    #[test]
    fn routing_id_validation() {
        let mut opts = Options::new(SocketType::Router, usize::MAX);
        assert!(opts.set_core(&SocketOption::RoutingId(b"")).is_err());
        assert!(opts.set_core(&SocketOption::RoutingId(b"\0auto")).is_err());
        assert!(opts.set_core(&SocketOption::RoutingId(b"MASTER")).unwrap());
        assert_eq!(opts.routing_id, b"MASTER");
    }

    #[test]
    fn socket_type_compatibility() {
        assert!(SocketType::Pub.compatible_with(SocketType::Sub));
        assert!(SocketType::Xsub.compatible_with(SocketType::Xpub));
        assert!(SocketType::Router.compatible_with(SocketType::Router));
        assert!(!SocketType::Pub.compatible_with(SocketType::Pub));
        assert!(!SocketType::Pair.compatible_with(SocketType::Router));
    }

    #[test]
    fn pipe_hwm_takes_the_stricter_bound() {
        assert_eq!(pipe_hwm(0, 0), 0);
        assert_eq!(pipe_hwm(0, 100), 100);
        assert_eq!(pipe_hwm(100, 0), 100);
        assert_eq!(pipe_hwm(3, 4), 3);
    }
}
