//! The wire message type exchanged between bearerbox, SMSC drivers and boxes.
//!
//! # Wire format
//!
//! A packed [`Message`] is `<u32 type><body>`, the payload a caller hands to
//! [`crate::conn::send_frame`] (which prepends the `<u32 length>` prefix) or
//! receives back from [`crate::conn::recv_frame`]. Integers are big-endian
//! 32-bit; byte-strings are `<u32 length><bytes>` with length `0xFFFF_FFFF`
//! meaning "field absent". IP addresses are encoded as their textual form
//! through the same optional byte-string field, since nothing else in this
//! wire format carries binary socket-address bytes.

use std::net::IpAddr;

use crate::error::{Error, Result};

const TYPE_HEARTBEAT: u32 = 0;
const TYPE_SMS: u32 = 1;
const TYPE_WDP_DATAGRAM: u32 = 2;

const ABSENT: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sms(Sms),
    WdpDatagram(WdpDatagram),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sms {
    pub sender: String,
    pub receiver: String,
    pub flag_8bit: bool,
    pub flag_udh: bool,
    pub udh_data: Vec<u8>,
    pub msg_data: Vec<u8>,
    pub time: u32,
    pub smsc_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WdpDatagram {
    pub source_address: IpAddr,
    pub source_port: u16,
    pub destination_address: IpAddr,
    pub destination_port: u16,
    pub user_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub load: i32,
}

impl Message {
    pub fn type_code(&self) -> u32 {
        match self {
            Message::Heartbeat(_) => TYPE_HEARTBEAT,
            Message::Sms(_) => TYPE_SMS,
            Message::WdpDatagram(_) => TYPE_WDP_DATAGRAM,
        }
    }

    /// Encode `<u32 type><body>`. Does not include the outer length prefix;
    /// that is [`crate::conn::send_frame`]'s job.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.type_code().to_be_bytes());
        match self {
            Message::Heartbeat(h) => out.extend_from_slice(&h.load.to_be_bytes()),
            Message::Sms(sms) => {
                put_string(&mut out, &sms.sender);
                put_string(&mut out, &sms.receiver);
                put_bool(&mut out, sms.flag_8bit);
                put_bool(&mut out, sms.flag_udh);
                put_bytes(&mut out, &sms.udh_data);
                put_bytes(&mut out, &sms.msg_data);
                out.extend_from_slice(&sms.time.to_be_bytes());
                put_opt_string(&mut out, sms.smsc_id.as_deref());
            }
            Message::WdpDatagram(wdp) => {
                put_opt_string(&mut out, Some(&wdp.source_address.to_string()));
                out.extend_from_slice(&wdp.source_port.to_be_bytes());
                put_opt_string(&mut out, Some(&wdp.destination_address.to_string()));
                out.extend_from_slice(&wdp.destination_port.to_be_bytes());
                put_bytes(&mut out, &wdp.user_data);
            }
        }
        out
    }

    /// Parse `<u32 type><body>` as produced by [`Message::pack`].
    pub fn unpack(bytes: &[u8]) -> Result<Message> {
        let mut cur = Cursor::new(bytes);
        let type_code = cur.take_u32()?;
        let msg = match type_code {
            TYPE_HEARTBEAT => Message::Heartbeat(Heartbeat {
                load: cur.take_u32()? as i32,
            }),
            TYPE_SMS => {
                let sender = cur.take_string()?;
                let receiver = cur.take_string()?;
                let flag_8bit = cur.take_bool()?;
                let flag_udh = cur.take_bool()?;
                let udh_data = cur.take_bytes()?;
                let msg_data = cur.take_bytes()?;
                let time = cur.take_u32()?;
                let smsc_id = cur.take_opt_string()?;
                if flag_udh && udh_data.is_empty() {
                    return Err(Error::Malformed("udh flag set but udh_data is empty"));
                }
                Message::Sms(Sms {
                    sender,
                    receiver,
                    flag_8bit,
                    flag_udh,
                    udh_data,
                    msg_data,
                    time,
                    smsc_id,
                })
            }
            TYPE_WDP_DATAGRAM => {
                let source_address = cur.take_ip()?;
                let source_port = cur.take_u16()?;
                let destination_address = cur.take_ip()?;
                let destination_port = cur.take_u16()?;
                let user_data = cur.take_bytes()?;
                Message::WdpDatagram(WdpDatagram {
                    source_address,
                    source_port,
                    destination_address,
                    destination_port,
                    user_data,
                })
            }
            other => return Err(Error::UnknownMessageType(other)),
        };
        if !cur.is_empty() {
            return Err(Error::Malformed("trailing bytes after message body"));
        }
        Ok(msg)
    }
}

fn put_bool(out: &mut Vec<u8>, v: bool) {
    out.extend_from_slice(&(v as u32).to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_opt_string(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        None => out.extend_from_slice(&ABSENT.to_be_bytes()),
        Some(s) => put_string(out, s),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take_u32(&mut self) -> Result<u32> {
        let end = self
            .pos
            .checked_add(4)
            .filter(|&e| e <= self.bytes.len())
            .ok_or(Error::Malformed("short read"))?;
        let v = u32::from_be_bytes(self.bytes[self.pos..end].try_into().unwrap());
        self.pos = end;
        Ok(v)
    }

    fn take_u16(&mut self) -> Result<u16> {
        let end = self
            .pos
            .checked_add(2)
            .filter(|&e| e <= self.bytes.len())
            .ok_or(Error::Malformed("short read"))?;
        let v = u16::from_be_bytes(self.bytes[self.pos..end].try_into().unwrap());
        self.pos = end;
        Ok(v)
    }

    fn take_bool(&mut self) -> Result<bool> {
        Ok(self.take_u32()? != 0)
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.take_u32()?;
        if len == ABSENT {
            return Err(Error::Malformed("required byte field marked absent"));
        }
        let len = len as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.bytes.len())
            .ok_or(Error::Malformed("short read"))?;
        let v = self.bytes[self.pos..end].to_vec();
        self.pos = end;
        Ok(v)
    }

    fn take_opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.take_u32()?;
        if len == ABSENT {
            return Ok(None);
        }
        let len = len as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.bytes.len())
            .ok_or(Error::Malformed("short read"))?;
        let v = self.bytes[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(v))
    }

    fn take_string(&mut self) -> Result<String> {
        String::from_utf8(self.take_bytes()?).map_err(|_| Error::Malformed("invalid utf-8"))
    }

    fn take_opt_string(&mut self) -> Result<Option<String>> {
        match self.take_opt_bytes()? {
            None => Ok(None),
            Some(bytes) => {
                String::from_utf8(bytes).map(Some).map_err(|_| Error::Malformed("invalid utf-8"))
            }
        }
    }

    fn take_ip(&mut self) -> Result<IpAddr> {
        let s = self
            .take_opt_string()?
            .ok_or(Error::Malformed("required address field marked absent"))?;
        s.parse().map_err(|_| Error::Malformed("invalid ip address"))
    }
}

/// Encode a full wire frame, `<u32 length><u32 type><body>`, including the
/// outer length prefix. Convenience for tests and callers that do not go
/// through [`crate::conn::send_frame`] directly.
pub fn pack(msg: &Message) -> Vec<u8> {
    let body = msg.pack();
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decode a full wire frame produced by [`pack`], validating that the
/// declared length prefix matches the delivered byte count.
pub fn unpack(frame: &[u8]) -> Result<Message> {
    if frame.len() < 4 {
        return Err(Error::Malformed("frame shorter than length prefix"));
    }
    let declared = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
    let body = &frame[4..];
    if declared != body.len() {
        return Err(Error::Malformed("declared length disagrees with content length"));
    }
    Message::unpack(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sms() -> Message {
        Message::Sms(Sms {
            sender: "1234".into(),
            receiver: "5678".into(),
            flag_8bit: false,
            flag_udh: true,
            udh_data: vec![0x06, 0x05, 0x04, 0x0b, 0x01, 0x01],
            msg_data: b"hi".to_vec(),
            time: 1_700_000_000,
            smsc_id: Some("fake-1".into()),
        })
    }

    #[test]
    fn sms_round_trips() {
        let msg = sample_sms();
        let framed = pack(&msg);
        assert_eq!(unpack(&framed).unwrap(), msg);
    }

    #[test]
    fn heartbeat_round_trips() {
        let msg = Message::Heartbeat(Heartbeat { load: -3 });
        assert_eq!(unpack(&pack(&msg)).unwrap(), msg);
    }

    #[test]
    fn wdp_round_trips() {
        let msg = Message::WdpDatagram(WdpDatagram {
            source_address: "10.0.0.1".parse().unwrap(),
            source_port: 9200,
            destination_address: "10.0.0.2".parse().unwrap(),
            destination_port: 9201,
            user_data: vec![1, 2, 3, 4],
        });
        assert_eq!(unpack(&pack(&msg)).unwrap(), msg);
    }

    #[test]
    fn rejects_short_frame() {
        let mut framed = pack(&sample_sms());
        framed.truncate(framed.len() - 2);
        assert!(matches!(unpack(&framed), Err(Error::Malformed(_))));
    }

    #[test]
    fn rejects_declared_length_mismatch() {
        let mut framed = pack(&sample_sms());
        let real_len = (framed.len() - 4) as u32;
        framed[0..4].copy_from_slice(&(real_len + 1).to_be_bytes());
        assert!(matches!(unpack(&framed), Err(Error::Malformed(_))));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut framed = pack(&Message::Heartbeat(Heartbeat { load: 0 }));
        framed[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(unpack(&framed), Err(Error::UnknownMessageType(99))));
    }

    #[test]
    fn rejects_udh_flag_without_data() {
        let mut sms = match sample_sms() {
            Message::Sms(s) => s,
            _ => unreachable!(),
        };
        sms.udh_data.clear();
        let framed = pack(&Message::Sms(sms));
        assert!(matches!(unpack(&framed), Err(Error::Malformed(_))));
    }
}
