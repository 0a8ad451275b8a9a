//! Session router
//!
//! Pairs listeners with broadcasters and relays negotiation messages
//! (offer, answer, candidate) between exactly the two connections of a
//! pairing. Relayed messages are never inspected or rewritten.
//!
//! Per-pairing ordering falls out of the hub: it handles events one at a
//! time and each connection has a single ordered outbound queue, so messages
//! reach the counterpart in the order the router saw them.

pub mod error;
pub mod pairing;
pub mod table;

pub use error::RouteError;
pub use pairing::{Delivery, Pairing};
pub use table::Router;
