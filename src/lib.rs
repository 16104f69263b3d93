//! AITT: IoT messaging middleware. A peer publishes and subscribes to
//! topics over a broker-mediated default transport (`BUS`) and, optionally,
//! direct broker-less transports (`TCP`, `TCP_SECURE`, `UDP_SRTP`), with
//! peer reachability tracked by a discovery plane running on its own
//! reserved topic.
//!
//! [`Aitt`] is the entry point. Everything else in this crate exists to
//! support it: [`bus`] and [`transport`] provide the pub/sub backends it
//! dispatches across, [`discovery`] tracks peer reachability, [`registry`]
//! owns transport module lifetimes, [`mainloop`] gives a host application a
//! single-threaded reactor to drive sockets with, [`srtp`] and [`net`]
//! are the wire-level building blocks `UDP_SRTP`/`TCP` are built from.

pub mod bus;
pub mod discovery;
pub mod error;
pub mod facade;
pub mod mainloop;
pub mod net;
pub mod option;
pub mod registry;
pub mod srtp;
pub mod transport;
pub mod types;

pub use error::{AittError, Result};
pub use facade::{Aitt, SubscriptionHandle};
pub use option::AittOption;
pub use types::{PeerId, Protocol, ProtocolSet, Qos, RegistrationId};
