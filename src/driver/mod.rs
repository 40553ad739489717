//! `SmscDriver`: the uniform interface every wire dialect implements.
//!
//! Only the `fake` dialect (a newline-delimited loopback protocol, modeled
//! on the reference implementation's own echo-test driver) is implemented
//! here. The other nine dialect tags exist as [`Dialect`] variants so
//! configuration and dispatch code has somewhere to route them, but
//! [`open`] returns [`crate::error::Error::Unimplemented`] for all of
//! them — their bit-level wire encodings are out of scope.

mod fake;

pub use fake::FakeDriver;

use std::fmt;

use crate::config::SmscConfig;
use crate::error::{Error, Result};
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLevel {
    Preferred,
    Allowed,
    Denied,
    Neutral,
}

#[derive(Debug)]
pub enum DriverError {
    /// Worth retrying (after `reopen`/backoff).
    Transient(String),
    /// Give up on this connection.
    Fatal(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Transient(msg) => write!(f, "transient driver error: {msg}"),
            DriverError::Fatal(msg) => write!(f, "fatal driver error: {msg}"),
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Cimd,
    Cimd2,
    Emi,
    EmiIp,
    Smpp,
    Sema,
    Ois,
    Oisd,
    At,
    Fake,
}

impl Dialect {
    pub fn parse(tag: &str) -> Result<Dialect> {
        match tag.to_ascii_lowercase().as_str() {
            "cimd" => Ok(Dialect::Cimd),
            "cimd2" => Ok(Dialect::Cimd2),
            "emi" => Ok(Dialect::Emi),
            "emi-ip" | "emiip" => Ok(Dialect::EmiIp),
            "smpp" => Ok(Dialect::Smpp),
            "sema" | "sema-sms2000" => Ok(Dialect::Sema),
            "ois" => Ok(Dialect::Ois),
            "oisd" => Ok(Dialect::Oisd),
            "at" => Ok(Dialect::At),
            "fake" => Ok(Dialect::Fake),
            other => Err(Error::ConfigSyntax(format!("unknown smsc dialect '{other}'"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Cimd => "cimd",
            Dialect::Cimd2 => "cimd2",
            Dialect::Emi => "emi",
            Dialect::EmiIp => "emi-ip",
            Dialect::Smpp => "smpp",
            Dialect::Sema => "sema",
            Dialect::Ois => "ois",
            Dialect::Oisd => "oisd",
            Dialect::At => "at",
            Dialect::Fake => "fake",
        }
    }
}

/// Capability set common to every wire dialect. `open` itself is a free
/// function ([`open`]) rather than a trait method, since constructing a
/// driver needs no `self` to dispatch on.
pub trait SmscDriver: Send {
    /// Close and re-establish the underlying connection. `Fatal` means
    /// never retry again; `Transient` means the caller may retry (with
    /// backoff).
    fn reopen(&mut self) -> DriverResult<()>;

    /// Non-blocking poll for one inbound message. `Ok(None)` means nothing
    /// is available yet, not an error.
    fn receive(&mut self) -> DriverResult<Option<Message>>;

    /// Submit one outbound message. Short blocking call.
    fn submit(&mut self, msg: &Message) -> DriverResult<()>;

    /// Whether `receive` would currently return `Some`.
    fn pending(&self) -> bool;

    /// Close the connection. Errors are logged by the caller, never
    /// propagated — matches the source's `smsc_close`, which is
    /// infallible by design.
    fn close(&mut self);

    fn matches_receiver(&self, number: &str) -> MatchLevel;

    fn smsc_id(&self) -> &str;

    /// Whether this driver can carry WDP datagrams over the same
    /// connection (§4.7). False for every dialect modeled here.
    fn accepts_wdp(&self) -> bool {
        false
    }
}

/// Apply the per-driver address filters from §4.4: denied prefixes force
/// `Denied`; preferred prefixes promote to `Preferred`; an `allowed_prefix`
/// list, if non-empty, restricts matches to that list (anything else is
/// `Denied`); otherwise any non-denied number is `Neutral`.
pub fn match_level_for(
    number: &str,
    preferred_prefix: &[String],
    allowed_prefix: &[String],
    denied_prefix: &[String],
) -> MatchLevel {
    if denied_prefix.iter().any(|p| number.starts_with(p.as_str())) {
        return MatchLevel::Denied;
    }
    if preferred_prefix.iter().any(|p| number.starts_with(p.as_str())) {
        return MatchLevel::Preferred;
    }
    if allowed_prefix.is_empty() {
        return MatchLevel::Neutral;
    }
    if allowed_prefix.iter().any(|p| number.starts_with(p.as_str())) {
        return MatchLevel::Allowed;
    }
    MatchLevel::Denied
}

/// Construct a driver for `dialect`, dispatching to its implementation.
pub fn open(dialect: Dialect, cfg: SmscConfig) -> Result<Box<dyn SmscDriver>> {
    match dialect {
        Dialect::Fake => Ok(Box::new(FakeDriver::open(cfg)?)),
        other => Err(Error::Unimplemented(other.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn denied_prefix_wins_over_preferred() {
        let level = match_level_for("5551234", &prefixes(&["555"]), &[], &prefixes(&["555"]));
        assert_eq!(level, MatchLevel::Denied);
    }

    #[test]
    fn preferred_prefix_matches() {
        let level = match_level_for("55599", &prefixes(&["555"]), &[], &[]);
        assert_eq!(level, MatchLevel::Preferred);
    }

    #[test]
    fn no_allowed_list_is_neutral() {
        let level = match_level_for("44400", &[], &[], &[]);
        assert_eq!(level, MatchLevel::Neutral);
    }

    #[test]
    fn allowed_list_restricts() {
        let level = match_level_for("99999", &[], &prefixes(&["111"]), &[]);
        assert_eq!(level, MatchLevel::Denied);
        let level = match_level_for("11199", &[], &prefixes(&["111"]), &[]);
        assert_eq!(level, MatchLevel::Allowed);
    }

    #[test]
    fn dialect_round_trips_through_name() {
        for tag in ["cimd", "cimd2", "emi", "emi-ip", "smpp", "sema", "ois", "oisd", "at", "fake"] {
            let d = Dialect::parse(tag).unwrap();
            assert_eq!(Dialect::parse(d.name()).unwrap(), d);
        }
    }

    #[test]
    fn unimplemented_dialect_open_fails() {
        let cfg = SmscConfig {
            dialect: "smpp".into(),
            host: "localhost".into(),
            port: 1,
            username: None,
            password: None,
            smsc_id: "x".into(),
            preferred_prefix: vec![],
            allowed_prefix: vec![],
            denied_prefix: vec![],
            preferred_smsc_id: vec![],
            denied_smsc_id: vec![],
            dial_prefix: vec![],
        };
        let err = open(Dialect::Smpp, cfg).unwrap_err();
        assert!(matches!(err, Error::Unimplemented("smpp")));
    }
}
