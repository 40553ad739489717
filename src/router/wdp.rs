//! WDP router (C7): a binary choice per outbound datagram between the
//! local UDP sender and an SMSC whose driver declares WDP-over-SMSC
//! capability (§4.7). No prefix-based routing table — grounded on
//! `bb_smsc.c`'s `udp_router`, which does the same "local network or
//! bearerbox-attached SMSC" binary dispatch.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::conn::udp_sendto;
use crate::message::{Message, WdpDatagram};
use crate::supervisor::{State, Supervisor};

/// Poll interval for the UDP receiver's socket read timeout: short enough
/// that a `Dead`/`Shutdown` transition is noticed promptly, long enough
/// to avoid spinning.
const UDP_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// The UDP receiver thread (§5): reads inbound WDP datagrams off the
/// process-wide socket and produces them into `incoming_wdp`, stamping
/// the sender's address/port. Exits on `Shutdown`/`Dead`, mirroring
/// `udp_die()`'s role of tearing down the local-network half of C7.
pub fn run_udp_receiver(socket: UdpSocket, local_port: u16, supervisor: Arc<Supervisor>) {
    supervisor.flow_threads.add_producer();
    supervisor.incoming_wdp.add_producer();
    debug!("START: udp_receiver");

    let _ = socket.set_read_timeout(Some(UDP_POLL_TIMEOUT));
    let mut buf = vec![0u8; 64 * 1024];

    while !matches!(supervisor.state(), State::Dead | State::Shutdown) {
        supervisor.isolated.consume();
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                supervisor.incoming_wdp.produce(Message::WdpDatagram(WdpDatagram {
                    source_address: from.ip(),
                    source_port: from.port(),
                    destination_address: socket.local_addr().map(|a| a.ip()).unwrap_or(from.ip()),
                    destination_port: local_port,
                    user_data: buf[..n].to_vec(),
                }));
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!("udp_receiver socket error: {e}");
                break;
            }
        }
    }

    supervisor.incoming_wdp.remove_producer();
    info!("udp_die: udp receiver stopped");
    debug!("EXIT: udp_receiver");
    supervisor.flow_threads.remove_producer();
}

/// Deregister every WDP-capable SMSC's outgoing-list producer. Mirrors
/// `smsc_die` (§4.6) but is its own function since only a subset of the
/// registry carries WDP traffic.
pub fn smsc_endwdp(supervisor: &Supervisor) {
    let registry = supervisor.smsc_registry.lock().expect("smsc registry poisoned");
    for (_, handle) in registry.iter().filter(|(_, h)| h.accepts_wdp) {
        handle.outgoing_list.remove_producer();
    }
}

pub fn run_wdp_router(supervisor: Arc<Supervisor>) {
    supervisor.flow_threads.add_producer();
    debug!("START: wdp_router");

    loop {
        let Some(msg) = supervisor.outgoing_wdp.consume() else {
            break;
        };
        let wdp = match msg {
            Message::WdpDatagram(wdp) => wdp,
            _ => {
                warn!("wdp_router received a non-WdpDatagram message on outgoing_wdp; dropping");
                continue;
            }
        };

        let sent = {
            let socket_guard = supervisor.udp_socket.lock().expect("udp socket mutex poisoned");
            match socket_guard.as_ref() {
                Some(socket) => {
                    let addr = std::net::SocketAddr::new(wdp.destination_address, wdp.destination_port);
                    udp_sendto(socket, addr, &wdp.user_data).is_ok()
                }
                None => false,
            }
        };

        if sent {
            continue;
        }

        let registry = supervisor.smsc_registry.lock().expect("smsc registry poisoned");
        match registry.iter().find(|(_, h)| h.accepts_wdp) {
            Some((_, handle)) => handle.outgoing_list.produce(Message::WdpDatagram(wdp)),
            None => warn!("NoRoute: no udp socket and no wdp-capable smsc for this datagram"),
        }
    }

    smsc_endwdp(&supervisor);
    debug!("EXIT: wdp_router");
    supervisor.flow_threads.remove_producer();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;
    use crate::supervisor::SmscHandle;
    use std::net::UdpSocket;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn prefers_udp_socket_when_present() {
        let sup = Supervisor::new(30);
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        let listener_addr = listener.local_addr().unwrap();
        *sup.udp_socket.lock().unwrap() = Some(socket);

        sup.outgoing_wdp.add_producer();
        sup.outgoing_wdp.produce(Message::WdpDatagram(crate::message::WdpDatagram {
            source_address: "127.0.0.1".parse().unwrap(),
            source_port: 1111,
            destination_address: listener_addr.ip(),
            destination_port: listener_addr.port(),
            user_data: vec![9, 9],
        }));
        sup.outgoing_wdp.remove_producer();

        run_wdp_router(Arc::new(sup));

        let mut buf = [0u8; 16];
        listener.set_read_timeout(Some(std::time::Duration::from_secs(1))).unwrap();
        let (n, _) = listener.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[9, 9]);
    }

    #[test]
    fn falls_back_to_wdp_capable_smsc_with_no_socket() {
        let sup = Supervisor::new(30);
        let outgoing_list = Arc::new(Queue::new());
        outgoing_list.add_producer();
        sup.smsc_registry.lock().unwrap().insert(SmscHandle {
            smsc_id: "wdp-1".into(),
            outgoing_list: Arc::clone(&outgoing_list),
            preferred_prefix: vec![],
            allowed_prefix: vec![],
            denied_prefix: vec![],
            preferred_smsc_id: vec![],
            denied_smsc_id: vec![],
            accepts_wdp: true,
            load: AtomicI32::new(0),
        });

        sup.outgoing_wdp.add_producer();
        sup.outgoing_wdp.produce(Message::WdpDatagram(crate::message::WdpDatagram {
            source_address: "127.0.0.1".parse().unwrap(),
            source_port: 1111,
            destination_address: "127.0.0.1".parse().unwrap(),
            destination_port: 2222,
            user_data: vec![1, 2, 3],
        }));
        sup.outgoing_wdp.remove_producer();

        run_wdp_router(Arc::new(sup));

        assert_eq!(outgoing_list.len(), 1);
    }
}
