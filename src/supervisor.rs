//! Lifecycle state machine, gate-lists, and the arena-indexed registries
//! that replace the source's raw-pointer `SMSCenter`/`BoxConnection` web
//! (§9 Design Notes: "arena-index the registry ... lookup is O(1);
//! removal is by tombstoning").

use std::net::UdpSocket;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::box_conn::BoxKind;
use crate::message::Message;
use crate::queue::Queue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Running = 0,
    Isolated = 1,
    Suspended = 2,
    Shutdown = 3,
    Dead = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Running,
            1 => State::Isolated,
            2 => State::Suspended,
            3 => State::Shutdown,
            _ => State::Dead,
        }
    }
}

/// An arena-indexed registry: integer ids, O(1) lookup, removal by
/// tombstoning (`Option::take`) so other holders of the same id see a
/// dead slot rather than a dangling pointer.
pub struct Registry<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry { slots: Vec::new() }
    }
}

impl<T> Registry<T> {
    pub fn insert(&mut self, value: T) -> usize {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                return i;
            }
        }
        self.slots.push(Some(value));
        self.slots.len() - 1
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the registry keeps about a live SMSC for routing purposes: a
/// snapshot of its static address-filter configuration plus a live load
/// factor, rather than a handle onto the driver itself — the driver is
/// single-threaded by construction (owned alternately by its receiver and
/// sender thread), so cross-thread routing decisions are made from this
/// snapshot instead of calling back into the driver concurrently.
pub struct SmscHandle {
    pub smsc_id: String,
    pub outgoing_list: Arc<Queue<Message>>,
    pub preferred_prefix: Vec<String>,
    pub allowed_prefix: Vec<String>,
    pub denied_prefix: Vec<String>,
    pub preferred_smsc_id: Vec<String>,
    pub denied_smsc_id: Vec<String>,
    pub accepts_wdp: bool,
    pub load: AtomicI32,
}

pub struct BoxHandle {
    pub kind: BoxKind,
    pub peer_ip: String,
    pub outbox: Arc<Queue<Message>>,
    pub load: AtomicI32,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: State,
    pub smsc_count: usize,
    pub sms_box_count: usize,
    pub wap_box_count: usize,
    pub incoming_sms_len: usize,
    pub incoming_wdp_len: usize,
    pub outgoing_sms_len: usize,
    pub outgoing_wdp_len: usize,
}

pub struct Supervisor {
    state: AtomicU8,
    pub incoming_sms: Queue<Message>,
    pub incoming_wdp: Queue<Message>,
    pub outgoing_sms: Queue<Message>,
    pub outgoing_wdp: Queue<Message>,
    /// Gate-lists: queues used only for their producer-count semantics.
    /// Blocking on `consume` pauses the thread; they never actually carry
    /// items.
    pub flow_threads: Queue<()>,
    pub suspended: Queue<()>,
    pub isolated: Queue<()>,
    pub smsc_registry: Mutex<Registry<SmscHandle>>,
    pub box_registry: Mutex<Registry<BoxHandle>>,
    pub udp_socket: Mutex<Option<UdpSocket>>,
    pub heartbeat_freq: u64,
}

impl Supervisor {
    pub fn new(heartbeat_freq: u64) -> Self {
        Supervisor {
            state: AtomicU8::new(State::Running as u8),
            incoming_sms: Queue::new(),
            incoming_wdp: Queue::new(),
            outgoing_sms: Queue::new(),
            outgoing_wdp: Queue::new(),
            flow_threads: Queue::new(),
            suspended: Queue::new(),
            isolated: Queue::new(),
            smsc_registry: Mutex::new(Registry::default()),
            box_registry: Mutex::new(Registry::default()),
            udp_socket: Mutex::new(None),
            heartbeat_freq,
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Relaxed);
    }

    pub fn suspend(&self) {
        if self.state() != State::Running {
            return;
        }
        self.set_state(State::Suspended);
        self.suspended.add_producer();
        self.isolated.add_producer();
    }

    pub fn isolate(&self) {
        if self.state() != State::Running {
            return;
        }
        self.set_state(State::Isolated);
        self.isolated.add_producer();
    }

    pub fn resume(&self) {
        match self.state() {
            State::Suspended => {
                self.suspended.remove_producer();
                self.isolated.remove_producer();
                self.set_state(State::Running);
            }
            State::Isolated => {
                self.isolated.remove_producer();
                self.set_state(State::Running);
            }
            _ => {}
        }
    }

    /// Begin the shutdown avalanche: deregister as a producer on every
    /// global queue. Every receiver/router blocked in a `consume` on one
    /// of these sees the drain sentinel and starts its own exit.
    pub fn shutdown(&self) {
        if matches!(self.state(), State::Shutdown | State::Dead) {
            return;
        }
        self.set_state(State::Shutdown);
        self.incoming_sms.remove_producer();
        self.incoming_wdp.remove_producer();
        self.outgoing_sms.remove_producer();
        self.outgoing_wdp.remove_producer();
    }

    /// Called once every worker thread has joined (`flow_threads` has
    /// drained).
    pub fn mark_dead(&self) {
        self.set_state(State::Dead);
    }

    pub fn status_report(&self) -> StatusReport {
        let smsc = self.smsc_registry.lock().expect("smsc registry poisoned");
        let boxes = self.box_registry.lock().expect("box registry poisoned");
        let sms_box_count = boxes.iter().filter(|(_, h)| h.kind == BoxKind::Sms).count();
        let wap_box_count = boxes.iter().filter(|(_, h)| h.kind == BoxKind::Wap).count();
        StatusReport {
            state: self.state(),
            smsc_count: smsc.len(),
            sms_box_count,
            wap_box_count,
            incoming_sms_len: self.incoming_sms.len(),
            incoming_wdp_len: self.incoming_wdp.len(),
            outgoing_sms_len: self.outgoing_sms.len(),
            outgoing_wdp_len: self.outgoing_wdp.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_then_resume_round_trips_state() {
        let sup = Supervisor::new(30);
        assert_eq!(sup.state(), State::Running);
        sup.suspend();
        assert_eq!(sup.state(), State::Suspended);
        assert_eq!(sup.suspended.producer_count(), 1);
        assert_eq!(sup.isolated.producer_count(), 1);
        sup.resume();
        assert_eq!(sup.state(), State::Running);
        assert_eq!(sup.suspended.producer_count(), 0);
        assert_eq!(sup.isolated.producer_count(), 0);
    }

    #[test]
    fn isolate_blocks_only_receivers() {
        let sup = Supervisor::new(30);
        sup.isolate();
        assert_eq!(sup.state(), State::Isolated);
        assert_eq!(sup.isolated.producer_count(), 1);
        assert_eq!(sup.suspended.producer_count(), 0);
        sup.resume();
        assert_eq!(sup.isolated.producer_count(), 0);
    }

    #[test]
    fn shutdown_drains_all_global_queues() {
        let sup = Supervisor::new(30);
        sup.incoming_sms.add_producer();
        sup.incoming_wdp.add_producer();
        sup.outgoing_sms.add_producer();
        sup.outgoing_wdp.add_producer();
        sup.shutdown();
        assert_eq!(sup.state(), State::Shutdown);
        assert_eq!(sup.incoming_sms.consume(), None);
        assert_eq!(sup.incoming_wdp.consume(), None);
        assert_eq!(sup.outgoing_sms.consume(), None);
        assert_eq!(sup.outgoing_wdp.consume(), None);
    }

    #[test]
    fn registry_reuses_tombstoned_slots() {
        let mut reg: Registry<&'static str> = Registry::default();
        let a = reg.insert("a");
        let _b = reg.insert("b");
        reg.remove(a);
        let c = reg.insert("c");
        assert_eq!(c, a);
        assert_eq!(reg.len(), 2);
    }
}
