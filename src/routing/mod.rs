//! Read/write routing
//!
//! The target for a connection request is decided from the transaction
//! context the caller passes in:
//!
//! | active | read-only | target |
//! |--------|-----------|--------|
//! | no     | any       | WRITE  |
//! | yes    | yes       | READ   |
//! | yes    | no        | WRITE  |
//!
//! Anything ambiguous resolves to WRITE.

mod selector;
mod source;


pub use selector::{select_target, TargetKey, TransactionContext};
pub use source::{ConnectionSource, RoutingConnectionSource, RoutingConnectionSourceBuilder};
