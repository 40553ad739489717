//! Per-SMSC receiver/sender thread pair and reopen-with-backoff, grounded
//! on the reference implementation's `sms_receiver`/`sms_sender`/
//! `create_new_smsc` (`bb_smsc.c`).

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::SmscConfig;
use crate::driver::{Dialect, DriverError, DriverResult, SmscDriver};
use crate::message::Message;
use crate::queue::Queue;
use crate::supervisor::{SmscHandle, State, Supervisor};

/// `1, 2, 4, 8, 16, 32, 60, 60, ...` seconds, doubling and capped at 60.
/// §4.5 describes this unit as minutes, but Testable Property 7 (§8) pins
/// it to seconds so the suite completes in bounded wall-clock time; see
/// DESIGN.md for this resolution.
const BACKOFF_START_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;

fn next_backoff(current: Duration) -> Duration {
    let doubled = current.as_secs().saturating_mul(2);
    Duration::from_secs(doubled.min(BACKOFF_CAP_SECS))
}

/// Start one SMSC connection: register it in the registry, spawn its
/// receiver and sender threads. Returns the registry id.
pub fn start(dialect: Dialect, cfg: SmscConfig, supervisor: Arc<Supervisor>) -> crate::error::Result<usize> {
    let driver = crate::driver::open(dialect, cfg.clone())?;
    let outgoing_list = Arc::new(Queue::new());
    // One producer registration per router that may feed this queue: the
    // SMS router always can; the WDP router only for a WDP-capable driver.
    // Each registration is removed exactly once, by that router's own
    // drain handler (`smsc_die`/`smsc_endwdp`) — see DESIGN.md.
    outgoing_list.add_producer();
    if driver.accepts_wdp() {
        outgoing_list.add_producer();
    }

    let id = {
        let mut registry = supervisor.smsc_registry.lock().expect("smsc registry poisoned");
        registry.insert(SmscHandle {
            smsc_id: cfg.smsc_id.clone(),
            outgoing_list: Arc::clone(&outgoing_list),
            preferred_prefix: cfg.preferred_prefix.clone(),
            allowed_prefix: cfg.allowed_prefix.clone(),
            denied_prefix: cfg.denied_prefix.clone(),
            preferred_smsc_id: cfg.preferred_smsc_id.clone(),
            denied_smsc_id: cfg.denied_smsc_id.clone(),
            accepts_wdp: driver.accepts_wdp(),
            load: std::sync::atomic::AtomicI32::new(0),
        })
    };

    let recv_sup = Arc::clone(&supervisor);
    let send_sup = Arc::clone(&supervisor);
    let dial_prefix = cfg.dial_prefix.clone();
    let smsc_id = cfg.smsc_id.clone();
    let accepts_wdp = driver.accepts_wdp();

    let driver = Arc::new(std::sync::Mutex::new(driver));
    let recv_driver = Arc::clone(&driver);
    let send_driver = driver;

    let recv_handle = thread::spawn(move || {
        sms_receiver(recv_driver, dial_prefix, smsc_id, accepts_wdp, recv_sup);
    });
    thread::spawn(move || {
        sms_sender(send_driver, outgoing_list, send_sup, id, recv_handle);
    });

    Ok(id)
}

/// Rewrite a sender number's leading digits per the configured
/// `dial-prefix` rewrite table; first match wins.
fn apply_dial_prefix(number: &str, rewrites: &[(String, String)]) -> String {
    for (from, to) in rewrites {
        if let Some(rest) = number.strip_prefix(from.as_str()) {
            return format!("{to}{rest}");
        }
    }
    number.to_string()
}

fn sms_receiver(
    driver: Arc<std::sync::Mutex<Box<dyn SmscDriver>>>,
    dial_prefix: Vec<(String, String)>,
    smsc_id: String,
    accepts_wdp: bool,
    supervisor: Arc<Supervisor>,
) {
    supervisor.flow_threads.add_producer();
    supervisor.incoming_sms.add_producer();
    if accepts_wdp {
        supervisor.incoming_wdp.add_producer();
    }
    debug!("START: sms_receiver ({smsc_id})");

    let mut backoff = Duration::from_secs(BACKOFF_START_SECS);
    'outer: while !matches!(supervisor.state(), State::Dead | State::Shutdown) {
        supervisor.isolated.consume();

        let result = {
            let mut d = driver.lock().expect("driver mutex poisoned");
            d.receive()
        };

        match result {
            Ok(Some(Message::Sms(mut sms))) => {
                sms.sender = apply_dial_prefix(&sms.sender, &dial_prefix);
                sms.smsc_id = Some(smsc_id.clone());
                supervisor.incoming_sms.produce(Message::Sms(sms));
            }
            Ok(Some(other)) => {
                // non-SMS payload from an SMSC driver that also carries WDP
                supervisor.incoming_wdp.produce(other);
            }
            Ok(None) => thread::sleep(Duration::from_secs(1)),
            Err(DriverError::Transient(msg)) => {
                warn!("{smsc_id} receive transient error: {msg}, reopening");
                if !reopen_with_backoff(&driver, &supervisor, &mut backoff) {
                    break 'outer;
                }
            }
            Err(DriverError::Fatal(msg)) => {
                warn!("{smsc_id} receive fatal error: {msg}, giving up");
                break 'outer;
            }
        }
    }

    supervisor.incoming_sms.remove_producer();
    if accepts_wdp {
        supervisor.incoming_wdp.remove_producer();
    }
    debug!("EXIT: sms_receiver ({smsc_id})");
    supervisor.flow_threads.remove_producer();
}

/// Reopen the driver with capped exponential backoff, checking for
/// supervisor death every second so backoff never outlives the process.
/// Returns false if the supervisor died during the wait.
fn reopen_with_backoff(
    driver: &Arc<std::sync::Mutex<Box<dyn SmscDriver>>>,
    supervisor: &Supervisor,
    backoff: &mut Duration,
) -> bool {
    let mut waited = Duration::ZERO;
    while waited < *backoff {
        if supervisor.state() == State::Dead {
            return false;
        }
        let step = Duration::from_secs(1).min(*backoff - waited);
        thread::sleep(step);
        waited += step;
    }
    let reopened = {
        let mut d = driver.lock().expect("driver mutex poisoned");
        d.reopen()
    };
    match reopened {
        Ok(()) => {
            *backoff = Duration::from_secs(BACKOFF_START_SECS);
            true
        }
        Err(_) => {
            *backoff = next_backoff(*backoff);
            true
        }
    }
}

fn sms_sender(
    driver: Arc<std::sync::Mutex<Box<dyn SmscDriver>>>,
    outgoing_list: Arc<Queue<Message>>,
    supervisor: Arc<Supervisor>,
    id: usize,
    receiver: thread::JoinHandle<()>,
) {
    supervisor.flow_threads.add_producer();
    debug!("START: sms_sender");

    let mut backoff = Duration::from_secs(BACKOFF_START_SECS);
    while supervisor.state() != State::Dead {
        supervisor.suspended.consume();
        let Some(msg) = outgoing_list.consume() else {
            break;
        };

        let result = {
            let mut d = driver.lock().expect("driver mutex poisoned");
            d.submit(&msg)
        };
        match result {
            Ok(()) => {}
            Err(DriverError::Transient(e)) => {
                warn!("submit transient error: {e}, reopening then retrying");
                if !reopen_with_backoff(&driver, &supervisor, &mut backoff) {
                    break;
                }
                let mut d = driver.lock().expect("driver mutex poisoned");
                if let Err(e) = d.submit(&msg) {
                    warn!("submit retry failed, dropping message: {e}");
                }
            }
            Err(DriverError::Fatal(e)) => {
                warn!("submit fatal error, dropping message: {e}");
            }
        }
    }

    let _ = receiver.join();
    {
        let mut d = driver.lock().expect("driver mutex poisoned");
        d.close();
    }
    supervisor.smsc_registry.lock().expect("smsc registry poisoned").remove(id);
    debug!("EXIT: sms_sender");
    supervisor.flow_threads.remove_producer();
}

/// Remove every SMSC's producer registration on its own outgoing queue,
/// propagating the drain avalanche from `outgoing_sms`'s router into every
/// sender thread. Called once the router itself has drained.
pub fn smsc_die(supervisor: &Supervisor) {
    let registry = supervisor.smsc_registry.lock().expect("smsc registry poisoned");
    for (_, handle) in registry.iter() {
        handle.outgoing_list.remove_producer();
    }
    info!("smsc_die: removed producers from all smsc outgoing lists");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MatchLevel;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    /// A driver whose `receive` returns `Transient` the first N times it is
    /// called, then `Some(sms)` forever after — used to exercise S3
    /// (spec.md §8): a transient receive error followed by a successful
    /// receive must still reach `incoming_sms`.
    struct FlakyDriver {
        calls: AtomicUsize,
        fail_first: usize,
        reopened: StdMutex<usize>,
    }

    impl SmscDriver for FlakyDriver {
        fn reopen(&mut self) -> DriverResult<()> {
            *self.reopened.lock().unwrap() += 1;
            Ok(())
        }

        fn receive(&mut self) -> DriverResult<Option<Message>> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if call < self.fail_first {
                return Err(DriverError::Transient("simulated transient failure".into()));
            }
            Ok(Some(Message::Sms(crate::message::Sms {
                sender: "1111".into(),
                receiver: "2222".into(),
                flag_8bit: false,
                flag_udh: false,
                udh_data: vec![],
                msg_data: b"recovered".to_vec(),
                time: 0,
                smsc_id: None,
            })))
        }

        fn submit(&mut self, _msg: &Message) -> DriverResult<()> {
            Ok(())
        }

        fn pending(&self) -> bool {
            false
        }

        fn close(&mut self) {}

        fn matches_receiver(&self, _number: &str) -> MatchLevel {
            MatchLevel::Neutral
        }

        fn smsc_id(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn next_backoff_doubles_and_caps_at_sixty() {
        let mut d = Duration::from_secs(1);
        let mut seen = vec![d.as_secs()];
        for _ in 0..8 {
            d = next_backoff(d);
            seen.push(d.as_secs());
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn transient_receive_recovers_within_bounded_time() {
        let supervisor = Arc::new(Supervisor::new(30));
        let driver: Arc<std::sync::Mutex<Box<dyn SmscDriver>>> = Arc::new(std::sync::Mutex::new(Box::new(FlakyDriver {
            calls: AtomicUsize::new(0),
            fail_first: 1,
            reopened: StdMutex::new(0),
        })));

        let sup = Arc::clone(&supervisor);
        let d = Arc::clone(&driver);
        let handle = thread::spawn(move || {
            sms_receiver(d, vec![], "flaky".into(), false, sup);
        });

        let got = supervisor.incoming_sms.consume();
        assert!(got.is_some(), "expected a message to reach incoming_sms within the test's own join timeout");
        match got.unwrap() {
            Message::Sms(sms) => assert_eq!(sms.msg_data, b"recovered"),
            _ => panic!("expected Sms"),
        }

        // `mark_dead` (rather than `shutdown`) stops the receiver without
        // touching `incoming_sms`'s producer count, which this test's own
        // `sms_receiver` call already owns exactly one registration on.
        supervisor.mark_dead();
        handle.join().unwrap();
    }
}
