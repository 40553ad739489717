//! `fake` dialect: a newline-delimited loopback protocol, grounded on the
//! reference implementation's own echo-test SMSC driver. A line on the
//! wire is `sender receiver text\n`; no binary/UDH framing, no
//! acknowledgements. Useful for exercising the rest of the system without
//! a real SMSC.

use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{match_level_for, DriverError, DriverResult, MatchLevel, SmscDriver};
use crate::config::SmscConfig;
use crate::error::Result;
use crate::message::{Message, Sms};

/// Simulated dial-up latency, matching the reference driver's one-second
/// pause after connecting.
const CONNECT_LATENCY: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

pub struct FakeDriver {
    stream: TcpStream,
    buf: RefCell<Vec<u8>>,
    cfg: SmscConfig,
}

impl FakeDriver {
    pub fn open(cfg: SmscConfig) -> Result<FakeDriver> {
        let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))?;
        thread::sleep(CONNECT_LATENCY);
        Ok(FakeDriver {
            stream,
            buf: RefCell::new(Vec::new()),
            cfg,
        })
    }

    /// Pull whatever bytes are currently available into the line buffer,
    /// without blocking beyond a 1 ms poll (per §5's "1 ms select").
    fn pull_available(&self) {
        if self.stream.set_read_timeout(Some(POLL_TIMEOUT)).is_err() {
            return;
        }
        let mut chunk = [0u8; 512];
        loop {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.buf.borrow_mut().extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => break,
                Err(_) => break,
            }
        }
        let _ = self.stream.set_read_timeout(None);
    }

    fn take_line(&self) -> Option<Vec<u8>> {
        let mut buf = self.buf.borrow_mut();
        let pos = buf.iter().position(|&b| b == b'\n')?;
        Some(buf.drain(..=pos).collect())
    }
}

fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl SmscDriver for FakeDriver {
    fn reopen(&mut self) -> DriverResult<()> {
        self.close();
        let fresh = FakeDriver::open(self.cfg.clone()).map_err(|e| DriverError::Transient(e.to_string()))?;
        *self = fresh;
        Ok(())
    }

    fn receive(&mut self) -> DriverResult<Option<Message>> {
        self.pull_available();
        let Some(line) = self.take_line() else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, ' ');
        let sender = parts.next().unwrap_or("").to_string();
        let receiver = parts.next().unwrap_or("").to_string();
        let text = parts.next().unwrap_or("").to_string();
        Ok(Some(Message::Sms(Sms {
            sender,
            receiver,
            flag_8bit: false,
            flag_udh: false,
            udh_data: Vec::new(),
            msg_data: text.into_bytes(),
            time: now_unix(),
            smsc_id: Some(self.cfg.smsc_id.clone()),
        })))
    }

    fn submit(&mut self, msg: &Message) -> DriverResult<()> {
        let sms = match msg {
            Message::Sms(sms) => sms,
            _ => return Err(DriverError::Fatal("fake driver only carries Sms".into())),
        };
        let line = format!(
            "{} {} {}\n",
            sms.sender,
            sms.receiver,
            String::from_utf8_lossy(&sms.msg_data)
        );
        self.stream
            .write_all(line.as_bytes())
            .map_err(|e| DriverError::Transient(e.to_string()))
    }

    fn pending(&self) -> bool {
        self.pull_available();
        self.buf.borrow().contains(&b'\n')
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn matches_receiver(&self, number: &str) -> MatchLevel {
        match_level_for(
            number,
            &self.cfg.preferred_prefix,
            &self.cfg.allowed_prefix,
            &self.cfg.denied_prefix,
        )
    }

    fn smsc_id(&self) -> &str {
        &self.cfg.smsc_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn test_cfg(port: u16) -> SmscConfig {
        SmscConfig {
            dialect: "fake".into(),
            host: "127.0.0.1".into(),
            port,
            username: None,
            password: None,
            smsc_id: "fake-1".into(),
            preferred_prefix: vec![],
            allowed_prefix: vec![],
            denied_prefix: vec![],
            preferred_smsc_id: vec![],
            denied_smsc_id: vec![],
            dial_prefix: vec![],
        }
    }

    #[test]
    fn submit_writes_expected_line() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            line
        });

        let mut driver = FakeDriver::open(test_cfg(port)).unwrap();
        driver
            .submit(&Message::Sms(Sms {
                sender: "1234".into(),
                receiver: "5678".into(),
                flag_8bit: false,
                flag_udh: false,
                udh_data: vec![],
                msg_data: b"hi".to_vec(),
                time: 0,
                smsc_id: None,
            }))
            .unwrap();

        let line = handle.join().unwrap();
        assert_eq!(line, "1234 5678 hi\n");
    }

    #[test]
    fn receive_parses_echoed_line() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"1234 5678 hi\n").unwrap();
        });

        let mut driver = FakeDriver::open(test_cfg(port)).unwrap();
        handle.join().unwrap();
        let mut msg = driver.receive().unwrap();
        for _ in 0..50 {
            if msg.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
            msg = driver.receive().unwrap();
        }
        match msg.unwrap() {
            Message::Sms(sms) => {
                assert_eq!(sms.sender, "1234");
                assert_eq!(sms.receiver, "5678");
                assert_eq!(sms.msg_data, b"hi");
            }
            _ => panic!("expected Sms"),
        }
    }
}
