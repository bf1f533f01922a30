//! Authenticated wire format.
//!
//! Three frame types travel over the air, all little-endian, all with fixed
//! field widths and no length prefixes — both sides know every count from
//! their shared [`Config`](crate::Config):
//!
//! * [`SubeventFrame`] (advertiser → scanner, one per subevent):
//!   `[register × N] [ack × R] [counter:8] [mac:32]` where `N` is the number
//!   of register descriptors for subevent 0 and zero elsewhere.
//! * [`ResponseFrame`] (scanner → advertiser):
//!   `[sender_id:2] [payload:PAYLOAD_LEN] [counter:8] [mac:32]`.
//! * [`Announcement`] (advertiser → scanner, inside the extended advertising
//!   manufacturer data): `[num_register_slots:1] [counter:8] [mac:32]`.
//!
//! [`sign_message`] appends the HMAC-SHA-256 tag over everything before it;
//! [`verify_message`] recomputes it, compares in constant time and then
//! enforces the replay floor before a single body byte is interpreted.

use crate::{
    crypto::{KeyId, KeyStore, MAC_LEN},
    DeviceId, Error, ErrorKind, Result, SlotCoord,
};

/// Length of the authentication tag on every frame.
pub const TAG_LEN: usize = MAC_LEN;

/// Length of the replay counter field.
pub const COUNTER_LEN: usize = 8;

/// Largest response PDU the controller accepts in a response slot.
pub const MAX_RESPONSE_PDU: usize = 244;

/// Fixed payload length of a [`ResponseFrame`].
pub const RESPONSE_PAYLOAD_LEN: usize = MAX_RESPONSE_PDU - 2 - COUNTER_LEN - TAG_LEN;

/// Manufacturer id carried in the extended advertising data.
pub const MANUFACTURER_ID: u16 = 0xffff;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_MANUFACTURER: u8 = 0xff;
/// LE General Discoverable | BR/EDR not supported.
const AD_FLAGS: u8 = 0x06;

/// Appends the HMAC-SHA-256 tag over the current buffer contents.
pub fn sign_message(buf: &mut Vec<u8>, keys: &dyn KeyStore, key: KeyId) -> Result<()> {
    let tag = keys
        .compute_mac(key, buf)
        .map_err(|err| Error::with_message(ErrorKind::MacCompute, err.to_string()))?;
    buf.extend_from_slice(&tag);
    Ok(())
}

/// Verifies a signed message and returns its authenticated body.
///
/// On success the replay floor is raised to the counter carried in the
/// message. Frames whose counter equals the floor are accepted: the
/// advertiser may legitimately resend a counter value after a partially
/// filled cycle was cut short by a reboot.
pub fn verify_message<'a>(
    message: &'a [u8], keys: &dyn KeyStore, key: KeyId, floor: &mut u64,
) -> Result<&'a [u8]> {
    if message.len() < TAG_LEN + COUNTER_LEN {
        return Err(Error::new(ErrorKind::MessageTooShort));
    }
    let (body, tag) = message.split_at(message.len() - TAG_LEN);
    let expected = keys
        .compute_mac(key, body)
        .map_err(|err| Error::with_message(ErrorKind::MacCompute, err.to_string()))?;
    if !ct_eq(&expected, tag) {
        log::trace!("mac mismatch, presented {}", hex::encode(tag));
        return Err(Error::new(ErrorKind::InvalidMac));
    }
    let counter = read_counter(body);
    if counter < *floor {
        return Err(Error::with_message(
            ErrorKind::CounterMismatch,
            format!("counter {counter} below floor {floor}"),
        ));
    }
    *floor = counter;
    Ok(body)
}

/// Reads the trailing counter field of a frame body.
fn read_counter(body: &[u8]) -> u64 {
    let mut raw = [0u8; COUNTER_LEN];
    raw.copy_from_slice(&body[body.len() - COUNTER_LEN..]);
    u64::from_le_bytes(raw)
}

/// Constant-time byte comparison.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Advertiser frame for one subevent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubeventFrame {
    /// Register descriptors; present only in subevent 0.
    pub register_slots: Vec<SlotCoord>,
    /// Acknowledgement per response slot; 0 denies.
    pub acks: Vec<u16>,
    /// Advertiser replay counter.
    pub counter: u64,
}

impl SubeventFrame {
    /// Unsigned body length for the given counts.
    pub fn body_len(num_register: usize, num_slots: usize) -> usize {
        num_register * 2 + num_slots * 2 + COUNTER_LEN
    }

    /// Serializes the frame body into `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for coord in &self.register_slots {
            buf.push(coord.subevent);
            buf.push(coord.slot);
        }
        for ack in &self.acks {
            buf.extend_from_slice(&ack.to_le_bytes());
        }
        buf.extend_from_slice(&self.counter.to_le_bytes());
    }

    /// Parses a verified frame body with the given counts.
    pub fn decode(body: &[u8], num_register: usize, num_slots: usize) -> Result<Self> {
        let expected = Self::body_len(num_register, num_slots);
        if body.len() < expected {
            return Err(Error::new(ErrorKind::MessageTooShort));
        }
        if body.len() > expected {
            return Err(Error::with_message(ErrorKind::Protocol, "oversized subevent frame"));
        }
        let mut register_slots = Vec::with_capacity(num_register);
        let mut at = 0;
        for _ in 0..num_register {
            register_slots.push(SlotCoord::new(body[at], body[at + 1]));
            at += 2;
        }
        let mut acks = Vec::with_capacity(num_slots);
        for _ in 0..num_slots {
            acks.push(u16::from_le_bytes([body[at], body[at + 1]]));
            at += 2;
        }
        Ok(Self { register_slots, acks, counter: read_counter(body) })
    }

    /// Acknowledged device in the given response slot, if any.
    pub fn ack_for(&self, slot: u8) -> Option<DeviceId> {
        match self.acks.get(usize::from(slot)) {
            Some(0) | None => None,
            Some(&id) => Some(DeviceId(id)),
        }
    }
}

/// Scanner frame sent in a response slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseFrame {
    /// Sender identity.
    pub sender_id: DeviceId,
    /// Opaque payload, always [`RESPONSE_PAYLOAD_LEN`] bytes.
    pub payload: Vec<u8>,
    /// Scanner replay counter.
    pub counter: u64,
}

impl ResponseFrame {
    /// Unsigned body length.
    pub const BODY_LEN: usize = 2 + RESPONSE_PAYLOAD_LEN + COUNTER_LEN;

    /// Serializes the frame body into `buf`.
    ///
    /// Payloads shorter than [`RESPONSE_PAYLOAD_LEN`] are zero-padded so the
    /// fixed layout holds.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sender_id.0.to_le_bytes());
        let take = self.payload.len().min(RESPONSE_PAYLOAD_LEN);
        buf.extend_from_slice(&self.payload[..take]);
        buf.resize(buf.len() + RESPONSE_PAYLOAD_LEN - take, 0);
        buf.extend_from_slice(&self.counter.to_le_bytes());
    }

    /// Parses a verified frame body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < Self::BODY_LEN {
            return Err(Error::new(ErrorKind::MessageTooShort));
        }
        if body.len() > Self::BODY_LEN {
            return Err(Error::with_message(ErrorKind::Protocol, "oversized response frame"));
        }
        let sender = u16::from_le_bytes([body[0], body[1]]);
        if sender == 0 {
            return Err(Error::with_message(ErrorKind::Protocol, "response from device 0"));
        }
        Ok(Self {
            sender_id: DeviceId(sender),
            payload: body[2..2 + RESPONSE_PAYLOAD_LEN].to_vec(),
            counter: read_counter(body),
        })
    }

    /// Reads the sender id of a still-unverified response.
    ///
    /// The advertiser needs the sender before verification to pick the right
    /// key and replay floor; nothing else of the message may be trusted yet.
    pub fn peek_sender(message: &[u8]) -> Result<DeviceId> {
        if message.len() < 2 {
            return Err(Error::new(ErrorKind::MessageTooShort));
        }
        match u16::from_le_bytes([message[0], message[1]]) {
            0 => Err(Error::with_message(ErrorKind::Protocol, "response from device 0")),
            id => Ok(DeviceId(id)),
        }
    }
}

/// Signed announcement carried in the extended advertising data.
///
/// Lets a scanner check the shared register-slot count and seed its replay
/// floor for the advertiser key before the first periodic frame arrives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Announcement {
    /// Register descriptors published per cycle.
    pub num_register_slots: u8,
    /// Advertiser replay counter at the time of advertising start.
    pub counter: u64,
}

impl Announcement {
    /// Unsigned body length.
    pub const BODY_LEN: usize = 1 + COUNTER_LEN;

    /// Serializes the announcement body into `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.num_register_slots);
        buf.extend_from_slice(&self.counter.to_le_bytes());
    }

    /// Parses a verified announcement body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() != Self::BODY_LEN {
            return Err(Error::new(ErrorKind::MessageTooShort));
        }
        Ok(Self { num_register_slots: body[0], counter: read_counter(body) })
    }
}

/// Builds the extended advertising payload around a signed announcement.
pub fn encode_adv_data(signed_announcement: &[u8], buf: &mut Vec<u8>) {
    buf.clear();
    buf.extend_from_slice(&[2, AD_TYPE_FLAGS, AD_FLAGS]);
    buf.push(3 + signed_announcement.len() as u8);
    buf.push(AD_TYPE_MANUFACTURER);
    buf.extend_from_slice(&MANUFACTURER_ID.to_le_bytes());
    buf.extend_from_slice(signed_announcement);
}

/// Extracts our manufacturer data from an advertising payload.
///
/// Walks the AD structures and returns the payload of the first
/// manufacturer-data entry carrying [`MANUFACTURER_ID`].
pub fn manufacturer_data(ad: &[u8]) -> Option<&[u8]> {
    let mut at = 0;
    while at < ad.len() {
        let len = usize::from(ad[at]);
        if len == 0 || at + 1 + len > ad.len() {
            return None;
        }
        let kind = ad[at + 1];
        let data = &ad[at + 2..at + 1 + len];
        if kind == AD_TYPE_MANUFACTURER
            && data.len() >= 2
            && u16::from_le_bytes([data[0], data[1]]) == MANUFACTURER_ID
        {
            return Some(&data[2..]);
        }
        at += 1 + len;
    }
    None
}
