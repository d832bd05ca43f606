//! At-least-once lease engine.
//!
//! ```text
//! Delivery Pump ──admit──▶ Lease Table ◀──reserve/finalize── Ack Coordinator ◀── MessageHandle
//!       │                      ▲
//!       ▼                      └──────sweep────── Deadline Monitor
//!   consumers (bounded channel)
//! ```
//!
//! The table is the only shared mutable state. Ack and extend reserve their
//! transition under the table lock, call the backend with the lock released,
//! then finalize or roll back.

pub(crate) mod coordinator;
pub(crate) mod handle;
pub(crate) mod monitor;
pub(crate) mod pump;
pub mod table;

pub use handle::MessageHandle;
pub use table::{LeaseSnapshot, LeaseState, LeaseTable};
