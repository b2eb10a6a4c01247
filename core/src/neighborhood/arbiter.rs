//! Connection-race arbitration.
//!
//! Two neighbors may dial each other at the same moment. Both ends run the same
//! deterministic tie-break on their link addresses, so exactly one of the two
//! attempts survives without any extra round trip.

use crate::transport::{LinkAddress, SessionId};
use std::fmt;
use thiserror::Error;

/// Per (neighbor, protocol) connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    /// We dialed; the attempt is still in flight
    ConnectionInitiated(SessionId),
    Connected(SessionId),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::NotConnected => f.write_str("NOT_CONNECTED"),
            ConnectionState::ConnectionInitiated(id) => write!(f, "CONNECTION_INITIATED({})", id),
            ConnectionState::Connected(id) => write!(f, "CONNECTED({})", id),
        }
    }
}

/// Outcome of an inbound connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundVerdict {
    Accept,
    Refuse,
    /// Accept the inbound session and abort our own dial
    AcceptAndCancel { outgoing: SessionId },
}

impl InboundVerdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, InboundVerdict::Refuse)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Illegal transition '{transition}' from {from}")]
    IllegalTransition {
        from: ConnectionState,
        transition: &'static str,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionArbiter {
    state: ConnectionState,
}

impl ConnectionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn illegal(&self, transition: &'static str) -> StateError {
        StateError::IllegalTransition {
            from: self.state,
            transition,
        }
    }

    /// A local dial is about to start
    pub fn begin_dial(&mut self, outgoing: SessionId) -> Result<(), StateError> {
        match self.state {
            ConnectionState::NotConnected => {
                self.state = ConnectionState::ConnectionInitiated(outgoing);
                Ok(())
            }
            _ => Err(self.illegal("begin dial")),
        }
    }

    /// Decide the fate of an inbound attempt from `remote`.
    ///
    /// While our own dial is in flight the lexicographically smaller address
    /// refuses, the larger one accepts and cancels its dial.
    pub fn resolve_inbound(
        &mut self,
        local: &LinkAddress,
        remote: &LinkAddress,
        inbound: SessionId,
    ) -> InboundVerdict {
        match self.state {
            ConnectionState::NotConnected => {
                self.state = ConnectionState::Connected(inbound);
                InboundVerdict::Accept
            }
            ConnectionState::ConnectionInitiated(outgoing) => {
                if local < remote {
                    InboundVerdict::Refuse
                } else {
                    self.state = ConnectionState::Connected(inbound);
                    InboundVerdict::AcceptAndCancel { outgoing }
                }
            }
            ConnectionState::Connected(_) => InboundVerdict::Refuse,
        }
    }

    /// The remote end accepted our dial
    pub fn dial_succeeded(&mut self, outgoing: SessionId) -> Result<(), StateError> {
        match self.state {
            ConnectionState::ConnectionInitiated(id) if id == outgoing => {
                self.state = ConnectionState::Connected(outgoing);
                Ok(())
            }
            _ => Err(self.illegal("dial succeeded")),
        }
    }

    /// Our dial was refused or failed
    pub fn dial_failed(&mut self, outgoing: SessionId) -> Result<(), StateError> {
        match self.state {
            ConnectionState::ConnectionInitiated(id) if id == outgoing => {
                self.state = ConnectionState::NotConnected;
                Ok(())
            }
            _ => Err(self.illegal("dial failed")),
        }
    }

    pub fn session_closed(&mut self, session: SessionId) -> Result<(), StateError> {
        match self.state {
            ConnectionState::Connected(id) if id == session => {
                self.state = ConnectionState::NotConnected;
                Ok(())
            }
            _ => Err(self.illegal("session closed")),
        }
    }
}
