//! cachemesh-ring — weighted consistent-hash ring.
//!
//! Maps resource names to server ids through a multiset of *angles*
//! (position, server) placed pseudo-randomly on a modular position
//! space. A server's weight is its angle count; the balancer grows and
//! shrinks it from load telemetry so that only a bounded fraction of
//! keys move per change.

pub mod hash;
pub mod ring;

pub use ring::{HashRing, RingError};
