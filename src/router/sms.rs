//! SMS router (C6): selects a target SMSC for each outbound SMS by
//! combining the receiver's matching prefix rules with the message's own
//! `smsc_id` preference, then picks among the winning tier by load.
//! Grounded on `bb_smsc.c`'s `sms_router`, generalized from its "pick the
//! first SMSC" stub into the full Preferred/Allowed/Denied/Neutral rule.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};

use crate::driver::{match_level_for, MatchLevel};
use crate::message::Message;
use crate::smsc::smsc_die;
use crate::supervisor::{Supervisor, SmscHandle};

/// Combine the message's own `smsc_id` preference (if it names one) with
/// the prefix-derived level: a name in `denied_smsc_id` forces `Denied`; a
/// name in `preferred_smsc_id` promotes to `Preferred` unless already
/// denied. This is SPEC_FULL's reading of "smsc_id membership in
/// configured preferred/denied id-lists" (§4.6), recorded as an Open
/// Question resolution in DESIGN.md.
fn combined_level(msg_smsc_id: Option<&str>, prefix_level: MatchLevel, handle: &SmscHandle) -> MatchLevel {
    let Some(id) = msg_smsc_id else {
        return prefix_level;
    };
    if handle.denied_smsc_id.iter().any(|d| d == id) {
        return MatchLevel::Denied;
    }
    if prefix_level != MatchLevel::Denied && handle.preferred_smsc_id.iter().any(|p| p == id) {
        return MatchLevel::Preferred;
    }
    prefix_level
}

/// Pick the best SMSC for `receiver`/`smsc_id_hint` among the registry's
/// live handles: any `Preferred` wins outright (lowest load, ties by
/// registry order); otherwise the least-loaded `Allowed`/`Neutral`
/// candidate; otherwise `None` (no route).
pub fn select<'a>(
    registry: impl Iterator<Item = (usize, &'a SmscHandle)>,
    receiver: &str,
    smsc_id_hint: Option<&str>,
) -> Option<(usize, &'a SmscHandle)> {
    let scored: Vec<(usize, &SmscHandle, MatchLevel)> = registry
        .map(|(id, h)| {
            let prefix_level = match_level_for(receiver, &h.preferred_prefix, &h.allowed_prefix, &h.denied_prefix);
            let level = combined_level(smsc_id_hint, prefix_level, h);
            (id, h, level)
        })
        .collect();

    let preferred: Vec<_> = scored
        .iter()
        .filter(|(_, _, level)| *level == MatchLevel::Preferred)
        .collect();
    let pool = if !preferred.is_empty() {
        preferred
    } else {
        scored
            .iter()
            .filter(|(_, _, level)| matches!(level, MatchLevel::Allowed | MatchLevel::Neutral))
            .collect()
    };

    pool.into_iter()
        .min_by_key(|(id, h, _)| (h.load.load(Ordering::Relaxed), *id))
        .map(|(id, h, _)| (*id, *h))
}

pub fn run_sms_router(supervisor: Arc<Supervisor>) {
    supervisor.flow_threads.add_producer();
    debug!("START: sms_router");

    loop {
        let Some(msg) = supervisor.outgoing_sms.consume() else {
            break;
        };
        let sms = match msg {
            Message::Sms(sms) => sms,
            _ => {
                warn!("sms_router received a non-Sms message on outgoing_sms; dropping");
                continue;
            }
        };

        let registry = supervisor.smsc_registry.lock().expect("smsc registry poisoned");
        match select(registry.iter(), &sms.receiver, sms.smsc_id.as_deref()) {
            Some((_, handle)) => handle.outgoing_list.produce(Message::Sms(sms)),
            None => warn!("NoRoute: no smsc accepts receiver {}", sms.receiver),
        }
    }

    smsc_die(&supervisor);
    debug!("EXIT: sms_router");
    supervisor.flow_threads.remove_producer();
}
