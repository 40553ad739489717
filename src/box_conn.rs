//! Length-prefixed protocol to SMS/WAP boxes: accept loop, per-connection
//! receiver/sender threads, heartbeat tracking, IP allow/deny policy.
//!
//! Grounded on the reference implementation's `boxc_open`/
//! `boxc_send_message`/`boxc_get_message`: IP policy check at accept time
//! (and, per this crate's heartbeat-driven receiver loop, re-checked per
//! inbound frame), heartbeat frames update a load factor without being
//! enqueued, and MT frames are handed to the global outgoing queues.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::BoxAccessConfig;
use crate::conn::{recv_frame, send_frame};
use crate::message::Message;
use crate::queue::Queue;
use crate::supervisor::{BoxHandle, Supervisor};

/// Poll interval for the non-blocking accept loops (`run_accept_loop`,
/// `admin::run`): short enough that a `Shutdown`/`Dead` transition is
/// noticed promptly without a connection ever having to arrive, long
/// enough to avoid spinning.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    Sms,
    Wap,
}

impl BoxKind {
    fn label(&self) -> &'static str {
        match self {
            BoxKind::Sms => "smsbox",
            BoxKind::Wap => "wapbox",
        }
    }
}

/// Whether `ip` is allowed to connect under `cfg`'s prefix lists: denied
/// prefixes win outright; a non-empty allow list restricts to itself;
/// otherwise everything not denied is allowed.
pub fn ip_allowed(ip: &str, cfg: &BoxAccessConfig) -> bool {
    if cfg.deny_ip.iter().any(|p| ip.starts_with(p.as_str())) {
        return false;
    }
    if cfg.allow_ip.is_empty() {
        return true;
    }
    cfg.allow_ip.iter().any(|p| ip.starts_with(p.as_str()))
}

/// Accept connections on `listener`, spawning a receiver/sender thread pair
/// for each one admitted by `access`. Polls rather than blocks in `accept`
/// so the loop rechecks supervisor state on a fixed cadence and can exit on
/// `Shutdown`/`Dead` even with no connection ever arriving — `main` moves
/// the listener into this thread and retains no handle of its own to close
/// it from the outside.
pub fn run_accept_loop(
    listener: TcpListener,
    kind: BoxKind,
    supervisor: Arc<Supervisor>,
    access: BoxAccessConfig,
) {
    supervisor.flow_threads.add_producer();
    if let Err(e) = listener.set_nonblocking(true) {
        warn!("{} failed to set listener non-blocking: {e}", kind.label());
    }
    while !matches!(
        supervisor.state(),
        crate::supervisor::State::Shutdown | crate::supervisor::State::Dead
    ) {
        let stream = match listener.accept() {
            Ok((s, _)) => s,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                warn!("{} accept error: {e}", kind.label());
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
        };
        let peer_ip = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        if !ip_allowed(&peer_ip, &access) {
            info!("{} rejecting connection from denied ip {peer_ip}", kind.label());
            continue;
        }
        spawn_box(stream, peer_ip, kind, Arc::clone(&supervisor));
    }
    supervisor.flow_threads.remove_producer();
}

fn spawn_box(stream: TcpStream, peer_ip: String, kind: BoxKind, supervisor: Arc<Supervisor>) {
    let outbox = Arc::new(Queue::new());
    outbox.add_producer();
    let id = {
        let mut registry = supervisor.box_registry.lock().expect("box registry poisoned");
        registry.insert(BoxHandle {
            kind,
            peer_ip: peer_ip.clone(),
            outbox: Arc::clone(&outbox),
            load: AtomicI32::new(0),
        })
    };

    let receiver_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("{} failed to clone socket: {e}", kind.label());
            return;
        }
    };
    let sup_recv = Arc::clone(&supervisor);
    let sup_send = Arc::clone(&supervisor);
    let recv_handle = thread::spawn(move || {
        box_receiver(receiver_stream, kind, id, sup_recv);
    });
    thread::spawn(move || {
        box_sender(stream, outbox, sup_send, id);
        let _ = recv_handle.join();
    });
}

/// `2 * heartbeat_freq` expressed as the socket read timeout: the receiver
/// loop wakes at least this often even with no traffic, so it can notice a
/// missed heartbeat without a separate watchdog thread.
fn heartbeat_timeout(supervisor: &Supervisor) -> Duration {
    Duration::from_secs(2 * supervisor.heartbeat_freq.max(1))
}

fn box_receiver(stream: TcpStream, kind: BoxKind, id: usize, supervisor: Arc<Supervisor>) {
    supervisor.flow_threads.add_producer();
    debug!("START: box_receiver ({})", kind.label());

    let timeout = heartbeat_timeout(&supervisor);
    let _ = stream.set_read_timeout(Some(timeout));
    let mut last_heartbeat = Instant::now();

    loop {
        if matches!(
            supervisor.state(),
            crate::supervisor::State::Shutdown | crate::supervisor::State::Dead
        ) {
            break;
        }
        let mut s = &stream;
        match recv_frame(&mut s) {
            Ok(body) => match Message::unpack(&body) {
                Ok(Message::Heartbeat(hb)) => {
                    last_heartbeat = Instant::now();
                    if let Some(handle) = supervisor
                        .box_registry
                        .lock()
                        .expect("box registry poisoned")
                        .get(id)
                    {
                        handle.load.store(hb.load, Ordering::Relaxed);
                    }
                }
                Ok(msg) => {
                    if !message_kind_matches(&msg, kind) {
                        warn!("{} sent a message of the wrong kind; dropping", kind.label());
                        continue;
                    }
                    route_mt(msg, &supervisor);
                }
                Err(e) => {
                    warn!("{} sent a malformed frame: {e}", kind.label());
                }
            },
            Err(crate::error::Error::Io(e)) if is_timeout(&e) => {
                if last_heartbeat.elapsed() > timeout {
                    info!("{} heartbeat expired, closing connection", kind.label());
                    break;
                }
            }
            Err(_) => break,
        }
    }

    if let Some(handle) = supervisor.box_registry.lock().expect("box registry poisoned").remove(id) {
        handle.outbox.remove_producer();
    }
    debug!("EXIT: box_receiver ({})", kind.label());
    supervisor.flow_threads.remove_producer();
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn message_kind_matches(msg: &Message, kind: BoxKind) -> bool {
    matches!(
        (msg, kind),
        (Message::Sms(_), BoxKind::Sms) | (Message::WdpDatagram(_), BoxKind::Wap)
    )
}

fn route_mt(msg: Message, supervisor: &Supervisor) {
    match msg {
        Message::Sms(_) => supervisor.outgoing_sms.produce(msg),
        Message::WdpDatagram(_) => supervisor.outgoing_wdp.produce(msg),
        Message::Heartbeat(_) => {}
    }
}

fn box_sender(mut stream: TcpStream, outbox: Arc<Queue<Message>>, supervisor: Arc<Supervisor>, id: usize) {
    supervisor.flow_threads.add_producer();
    debug!("START: box_sender");
    loop {
        supervisor.suspended.consume();
        let Some(msg) = outbox.consume() else {
            break;
        };
        let body = msg.pack();
        if send_frame(&mut stream, &body).is_err() {
            if let Some(handle) = supervisor.box_registry.lock().expect("box registry poisoned").remove(id) {
                handle.outbox.remove_producer();
            }
            break;
        }
    }
    debug!("EXIT: box_sender");
    supervisor.flow_threads.remove_producer();
}

/// MO delivery picker: for each `kind`, one thread consumes the matching
/// global incoming queue and hands each message to the least-loaded
/// connected box of that kind (ties broken by registration order), per
/// §4.8's "load factor is used by the SMS box picker". This mirrors the
/// SMS/WDP routers (§4.6/§4.7) but for mobile-originated delivery instead
/// of mobile-terminated routing.
pub fn run_delivery_pump(kind: BoxKind, supervisor: Arc<Supervisor>) {
    supervisor.flow_threads.add_producer();
    debug!("START: box delivery pump ({})", kind.label());

    loop {
        let source = match kind {
            BoxKind::Sms => &supervisor.incoming_sms,
            BoxKind::Wap => &supervisor.incoming_wdp,
        };
        let Some(msg) = source.consume() else {
            break;
        };
        let registry = supervisor.box_registry.lock().expect("box registry poisoned");
        let picked = registry
            .iter()
            .filter(|(_, h)| h.kind == kind)
            .min_by_key(|(_, h)| h.load.load(Ordering::Relaxed));
        match picked {
            Some((_, handle)) => handle.outbox.produce(msg),
            None => warn!("no {} connected, dropping MO message", kind.label()),
        }
    }

    let registry = supervisor.box_registry.lock().expect("box registry poisoned");
    for (_, handle) in registry.iter().filter(|(_, h)| h.kind == kind) {
        handle.outbox.remove_producer();
    }
    drop(registry);
    debug!("EXIT: box delivery pump ({})", kind.label());
    supervisor.flow_threads.remove_producer();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(allow: &[&str], deny: &[&str]) -> BoxAccessConfig {
        BoxAccessConfig {
            allow_ip: allow.iter().map(|s| s.to_string()).collect(),
            deny_ip: deny.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn denied_prefix_wins_over_empty_allow_list() {
        assert!(!ip_allowed("10.0.0.5", &access(&[], &["10.0"])));
    }

    #[test]
    fn empty_allow_list_permits_anything_not_denied() {
        assert!(ip_allowed("192.168.1.5", &access(&[], &[])));
    }

    #[test]
    fn non_empty_allow_list_restricts() {
        let cfg = access(&["127.0.0.1"], &[]);
        assert!(ip_allowed("127.0.0.1", &cfg));
        assert!(!ip_allowed("10.0.0.1", &cfg));
    }

    #[test]
    fn message_kind_matches_rejects_cross_wiring() {
        let sms = Message::Sms(crate::message::Sms {
            sender: "1".into(),
            receiver: "2".into(),
            flag_8bit: false,
            flag_udh: false,
            udh_data: vec![],
            msg_data: vec![],
            time: 0,
            smsc_id: None,
        });
        assert!(message_kind_matches(&sms, BoxKind::Sms));
        assert!(!message_kind_matches(&sms, BoxKind::Wap));
    }
}
