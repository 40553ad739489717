//! Reader for the group-based key/value configuration file (§6).
//!
//! # Format
//!
//! Blank-line-separated blocks; each block's first `key = value` line must
//! be `group = <core|smsc|smsbox|wapbox>`, the remaining lines are that
//! group's keys. `#` starts a comment running to end of line. List-valued
//! keys (prefix lists, IP lists, dial-prefix rewrites) are `;`-separated.
//!
//! ```text
//! group = core
//! smsbox-port = 13001
//! wapbox-port = 13002
//! admin-port = 13000
//! heartbeat-freq = 30
//!
//! group = smsc
//! smsc = fake
//! smsc-id = fake-1
//! host = 127.0.0.1
//! port = 9000
//! preferred-prefix = 555
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub smsbox_port: u16,
    pub wapbox_port: u16,
    pub admin_port: u16,
    pub admin_password: Option<String>,
    pub heartbeat_freq: u64,
    pub pid_file: Option<String>,
    pub log_file: Option<String>,
    pub log_level: Option<String>,
    /// Local port for the WDP/UDP endpoint (§4.7's "UDP sender (local
    /// network)" path). Not in spec.md's literal key list; supplemented
    /// here since C7 cannot reach the local-network UDP path without one
    /// — see DESIGN.md. `None` disables the local UDP listener; outbound
    /// WDP then only reaches SMSCs with `accepts_wdp`.
    pub udp_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct SmscConfig {
    pub dialect: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub smsc_id: String,
    pub preferred_prefix: Vec<String>,
    pub allowed_prefix: Vec<String>,
    pub denied_prefix: Vec<String>,
    pub preferred_smsc_id: Vec<String>,
    pub denied_smsc_id: Vec<String>,
    /// `(from, to)` rewrite pairs applied to a sender number's leading digits.
    pub dial_prefix: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct BoxAccessConfig {
    pub allow_ip: Vec<String>,
    pub deny_ip: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub core: CoreConfig,
    pub smsc: Vec<SmscConfig>,
    pub smsbox: BoxAccessConfig,
    pub wapbox: BoxAccessConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        let mut core = None;
        let mut smsc = Vec::new();
        let mut smsbox = BoxAccessConfig::default();
        let mut wapbox = BoxAccessConfig::default();

        for block in split_blocks(text) {
            let group = RawGroup::parse(&block)?;
            match group.require("group")?.as_str() {
                "core" => core = Some(parse_core(&group)?),
                "smsc" => smsc.push(parse_smsc(&group)?),
                "smsbox" => smsbox = parse_access(&group),
                "wapbox" => wapbox = parse_access(&group),
                other => {
                    return Err(Error::ConfigSyntax(format!("unknown group type '{other}'")));
                }
            }
        }

        let core = core.ok_or_else(|| Error::ConfigSyntax("missing 'group = core' block".into()))?;
        Ok(Config {
            core,
            smsc,
            smsbox,
            wapbox,
        })
    }
}

fn split_blocks(text: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for raw_line in text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(line);
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

struct RawGroup {
    pairs: HashMap<String, String>,
}

impl RawGroup {
    fn parse(lines: &[&str]) -> Result<RawGroup> {
        let mut pairs = HashMap::new();
        for line in lines {
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::ConfigSyntax(format!("expected 'key = value', got '{line}'"))
            })?;
            pairs.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(RawGroup { pairs })
    }

    fn get(&self, key: &'static str) -> Option<&str> {
        self.pairs.get(key).map(|s| s.as_str())
    }

    fn require(&self, key: &'static str) -> Result<String> {
        self.get(key)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::ConfigMissingKey {
                group: self.get("group").unwrap_or("?").to_string(),
                key,
            })
    }

    fn list(&self, key: &'static str) -> Vec<String> {
        match self.get(key) {
            None => Vec::new(),
            Some(s) => s
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

fn parse_core(group: &RawGroup) -> Result<CoreConfig> {
    Ok(CoreConfig {
        smsbox_port: parse_port(group, "smsbox-port")?,
        wapbox_port: parse_port(group, "wapbox-port")?,
        admin_port: parse_port(group, "admin-port")?,
        admin_password: group.get("admin-password").map(str::to_string),
        heartbeat_freq: group
            .get("heartbeat-freq")
            .map(|s| s.parse::<u64>().map_err(|_| bad_int("heartbeat-freq")))
            .transpose()?
            .unwrap_or(30),
        pid_file: group.get("pid-file").map(str::to_string),
        log_file: group.get("log-file").map(str::to_string),
        log_level: group.get("log-level").map(str::to_string),
        udp_port: group
            .get("udp-port")
            .map(|s| s.parse::<u16>().map_err(|_| bad_int("udp-port")))
            .transpose()?,
    })
}

fn parse_smsc(group: &RawGroup) -> Result<SmscConfig> {
    let dial_prefix = group
        .list("dial-prefix")
        .into_iter()
        .map(|pair| {
            let (from, to) = pair.split_once(':').unwrap_or((pair.as_str(), ""));
            (from.to_string(), to.to_string())
        })
        .collect();
    Ok(SmscConfig {
        dialect: group.require("smsc")?,
        host: group.require("host")?,
        port: parse_port(group, "port")?,
        username: group.get("username").map(str::to_string),
        password: group.get("password").map(str::to_string),
        smsc_id: group.require("smsc-id")?,
        preferred_prefix: group.list("preferred-prefix"),
        allowed_prefix: group.list("allowed-prefix"),
        denied_prefix: group.list("denied-prefix"),
        preferred_smsc_id: group.list("preferred-smsc-id"),
        denied_smsc_id: group.list("denied-smsc-id"),
        dial_prefix,
    })
}

fn parse_access(group: &RawGroup) -> BoxAccessConfig {
    BoxAccessConfig {
        allow_ip: group.list("allow-ip"),
        deny_ip: group.list("deny-ip"),
    }
}

fn parse_port(group: &RawGroup, key: &'static str) -> Result<u16> {
    group
        .require(key)?
        .parse::<u16>()
        .map_err(|_| bad_int(key))
}

fn bad_int(key: &'static str) -> Error {
    Error::ConfigSyntax(format!("'{key}' must be a valid integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
        group = core
        smsbox-port = 13001
        wapbox-port = 13002
        admin-port = 13000
        admin-password = secret
        heartbeat-freq = 10

        # an smsc
        group = smsc
        smsc = fake
        smsc-id = fake-1
        host = 127.0.0.1
        port = 9000
        preferred-prefix = 555
        denied-prefix = 000;111

        group = smsbox
        allow-ip = 127.0.0.1
    ";

    #[test]
    fn parses_full_sample() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.core.smsbox_port, 13001);
        assert_eq!(cfg.core.admin_password.as_deref(), Some("secret"));
        assert_eq!(cfg.smsc.len(), 1);
        assert_eq!(cfg.smsc[0].smsc_id, "fake-1");
        assert_eq!(cfg.smsc[0].denied_prefix, vec!["000", "111"]);
        assert_eq!(cfg.smsbox.allow_ip, vec!["127.0.0.1"]);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let text = "group = smsc\nsmsc = fake\n";
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, Error::ConfigMissingKey { .. }));
    }

    #[test]
    fn missing_core_group_is_an_error() {
        let text = "group = smsc\nsmsc = fake\nsmsc-id = x\nhost = h\nport = 1\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn dial_prefix_parses_pairs() {
        let text = "
            group = core
            smsbox-port = 1
            wapbox-port = 2
            admin-port = 3

            group = smsc
            smsc = fake
            smsc-id = x
            host = h
            port = 1
            dial-prefix = 358:0;1:001
        ";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(
            cfg.smsc[0].dial_prefix,
            vec![("358".to_string(), "0".to_string()), ("1".to_string(), "001".to_string())]
        );
    }
}
