//! Bearerbox: the message-routing engine of an SMS/WAP gateway.
//!
//! Bridges SMSCs and WDP/UDP endpoints on one side with SMS/WAP box
//! service processes on the other. This crate is the core (routing,
//! queues, connection lifecycle, supervision); per-dialect SMSC wire
//! protocols, the full admin HTTP surface, and character-set tables are
//! out of scope (see `SPEC_FULL.md`).

pub mod admin;
pub mod box_conn;
pub mod config;
pub mod conn;
pub mod driver;
pub mod error;
pub mod message;
pub mod pidfile;
pub mod queue;
pub mod router;
pub mod smsc;
pub mod supervisor;

pub use error::{Error, Result};
pub use message::Message;
pub use queue::Queue;
pub use supervisor::{State, Supervisor};
