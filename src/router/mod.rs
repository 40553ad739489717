//! Outbound routers: SMS (§4.6) and WDP (§4.7). Each is a single thread
//! consuming one global outgoing queue and distributing to per-SMSC
//! outgoing lists.

pub mod sms;
pub mod wdp;

pub use sms::run_sms_router;
pub use wdp::{run_udp_receiver, run_wdp_router};
