//! Core runtime primitives for a tree-overlay distributed broker: topology,
//! futures, a reduction engine, interthread transport, a message-channel
//! adapter, and the autorelease/reactor/collaborator plumbing they share.
//!
//! Every other broker service (job manager, scheduler, KVS, job-list,
//! execution) is built on top of the handful of mechanisms this crate
//! exposes; none of those services live here.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod error;

#[cfg(feature = "std")]
pub mod aux;
#[cfg(feature = "std")]
pub mod autorelease;
#[cfg(feature = "std")]
pub mod collab;
#[cfg(feature = "std")]
pub mod config;
#[cfg(feature = "std")]
pub mod future;
#[cfg(feature = "std")]
pub mod itransport;
#[cfg(feature = "std")]
pub mod msgchannel;
#[cfg(feature = "std")]
pub mod observability;
#[cfg(feature = "std")]
pub mod reactor;
#[cfg(feature = "std")]
pub mod reduce;
#[cfg(feature = "std")]
pub mod topology;

#[cfg(feature = "std")]
pub mod prelude {
    //! Commonly paired imports for a broker process wiring these primitives
    //! together.
    pub use crate::aux::Aux;
    pub use crate::autorelease::{autorelease, AutoScope};
    pub use crate::collab::{EventBus, Kvs, Logger, PluginStack, Rpc};
    pub use crate::error::{CoreError, Result, Status};
    pub use crate::future::{CompositeFuture, CompositeMode, Future};
    pub use crate::msgchannel::MsgChan;
    pub use crate::reactor::Reactor;
    pub use crate::reduce::{ReduceFlags, Reduction};
    pub use crate::topology::{Rank, Topology};
}
