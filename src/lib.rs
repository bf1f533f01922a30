//! # PAwR coordination engine
//!
//! This library implements an authenticated one-to-many coordination protocol
//! on top of Bluetooth LE *Periodic Advertising with Responses* (PAwR).
//! A single [`Advertiser`] broadcasts a signed frame per subevent; [`Scanner`]s
//! join dynamically, confirm their assigned response slot and then report
//! sensor data on a periodic duty cycle while the advertiser tracks liveness
//! of every occupied slot.
//!
//! The following functionality is provided.
//!
//! * [Advertiser engine](Advertiser)
//!     * slot reservation with a bounded [free list](free_list::FreeList)
//!     * per-subevent frame assembly and acknowledgement vectors
//!     * liveness decay and reclamation of stale slots
//!     * [monitoring event stream](Advertiser::events)
//! * [Scanner state machine](Scanner)
//!     * scan, sync and registration over a randomly chosen register slot
//!     * confirmation against the acknowledgement vector
//!     * sleep/wake duty cycle driven by a [data generator](data_gen::DataGenerator)
//! * [authenticated wire format](wire)
//!     * HMAC-SHA-256 over every frame, verified in constant time
//!     * monotonic replay counters bound into each message
//! * [persistent replay counter](counter::ReplayCounter)
//! * [key store surface](crypto::KeyStore) with a software implementation
//! * [in-process loopback radio](loopback::LoopbackRadio) for tests and
//!   host-side experiments
//!
//! The radio itself is consumed through the traits in [`radio`]; no transport
//! backend is part of this crate. This library depends on the [tokio]
//! asynchronous runtime for its state machine tasks and timers.
//!
//! ## Basic usage
//! Create a [`Config`], connect an [`Advertiser`] or [`Scanner`] to a radio
//! implementation, a [`crypto::KeyStore`] and a [`counter::CounterStore`],
//! then drive the engine with [`Advertiser::run`] or [`Scanner::run`] until it
//! requests a [`Reboot`].

#![warn(missing_docs)]

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Deref, DerefMut},
    str::FromStr,
    time::Duration,
};

use macaddr::MacAddr6;
use num_derive::FromPrimitive;
use strum::Display as EnumDisplay;

pub mod advertiser;
pub mod counter;
pub mod crypto;
pub mod data_gen;
mod event;
pub mod free_list;
pub mod interactive;
pub mod loopback;
pub mod radio;
pub mod scanner;
pub mod wire;

pub use crate::{
    advertiser::{Advertiser, AdvertiserEvent, Controls},
    scanner::Scanner,
};

/// PAwR coordination error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// PAwR coordination error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// protocol configuration is invalid
    Config,
    /// radio driver rejected the operation
    Radio,
    /// key store operation failed
    Crypto,
    /// persistent storage operation failed
    Storage,
    /// message shorter than its fixed layout
    MessageTooShort,
    /// message authentication code mismatch
    InvalidMac,
    /// replay counter below the verified floor
    CounterMismatch,
    /// message authentication code could not be computed
    MacCompute,
    /// free list full or slot population exhausted
    Capacity,
    /// malformed frame or unexpected sender
    Protocol,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

/// PAwR coordination result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth device address.
///
/// The string representation is colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

/// Identity of a scanner device.
///
/// Provisioned out-of-band together with the device key. The wire encoding
/// reserves the value 0 to mean *empty slot* or *denied acknowledgement*, so
/// real devices are numbered from 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId(pub u16);

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One response opportunity per PAwR cycle: a subevent paired with a
/// response slot inside it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SlotCoord {
    /// Subevent index, `0 ≤ subevent < num_subevents`.
    pub subevent: u8,
    /// Response slot index inside the subevent, `0 ≤ slot < num_response_slots`.
    pub slot: u8,
}

impl SlotCoord {
    /// Creates a slot coordinate.
    pub const fn new(subevent: u8, slot: u8) -> Self {
        Self { subevent, slot }
    }
}

impl Display for SlotCoord {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.subevent, self.slot)
    }
}

/// Why an engine run ended and what the host should do next.
///
/// Both engines commit their replay counter before returning this; the host
/// is expected to cold-reboot (or re-create the engine) afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reboot {
    /// Graceful restart requested through [`Controls::soft_reboot`].
    Soft,
    /// An unrecoverable fault was hit.
    Fault(FaultReason),
}

/// Reason for an unrecoverable fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumDisplay, FromPrimitive)]
#[repr(u8)]
pub enum FaultReason {
    /// The radio driver failed during bring-up or scan start.
    RadioFailure = 1,
    /// The key store failed to initialize or to compute a MAC.
    CryptoFailure = 2,
    /// The persistent counter could not be loaded or committed.
    StorageFailure = 3,
    /// The slot population is exhausted; the configuration is undersized.
    SlotsExhausted = 4,
}

/// Protocol configuration.
///
/// Both sides of the air interface must run the same configuration: the wire
/// format carries no version or length fields, all counts are agreed upon
/// here (see [`validate`](Self::validate)).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    /// Number of subevents per periodic advertising cycle.
    pub num_subevents: u8,
    /// Number of response slots per subevent.
    pub num_response_slots: u8,
    /// Number of register descriptors simultaneously published in subevent 0.
    pub num_register_slots: u8,
    /// Capacity of the reclaimed-slot free list.
    pub max_free_slots: usize,
    /// PAwR cycles a scanner sleeps between data transmissions.
    pub events_per_block: u8,
    /// Unacknowledged responses tolerated before re-registration.
    pub max_unconfirmed_ticks: u8,
    /// Periodic advertising interval in 1.25 ms units.
    pub interval: u16,
    /// Time between subevents in 1.25 ms units.
    pub subevent_interval: u8,
    /// Time from subevent start to the first response slot, in 1.25 ms units.
    pub response_slot_delay: u8,
    /// Time between response slots in 0.125 ms units. At least 2.
    pub response_slot_spacing: u8,
    /// Missed cycles before the controller declares sync loss.
    pub failed_syncs: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_subevents: 46,
            num_response_slots: 10,
            num_register_slots: 3,
            max_free_slots: 32,
            events_per_block: 4,
            max_unconfirmed_ticks: 5,
            interval: 2000,
            subevent_interval: 43,
            response_slot_delay: 24,
            response_slot_spacing: 2,
            failed_syncs: 5,
        }
    }
}

impl Config {
    /// Checks the configuration against the protocol and controller limits.
    pub fn validate(&self) -> Result<()> {
        if self.num_subevents == 0 || self.num_response_slots == 0 {
            return Err(Error::with_message(ErrorKind::Config, "empty slot population"));
        }
        if self.num_register_slots == 0 || self.num_register_slots > self.num_response_slots {
            return Err(Error::with_message(
                ErrorKind::Config,
                format!(
                    "{} register slots do not fit {} response slots",
                    self.num_register_slots, self.num_response_slots
                ),
            ));
        }
        if self.max_free_slots == 0 {
            return Err(Error::with_message(ErrorKind::Config, "free list has no capacity"));
        }
        if self.events_per_block == 0 || self.events_per_block > u8::MAX / 3 {
            return Err(Error::with_message(ErrorKind::Config, "events per block out of range"));
        }
        if self.max_unconfirmed_ticks == 0 {
            return Err(Error::with_message(ErrorKind::Config, "unconfirmed tick budget is zero"));
        }
        if self.response_slot_spacing < 2 {
            return Err(Error::with_message(ErrorKind::Config, "response slot spacing below 2"));
        }
        if u32::from(self.subevent_interval) * u32::from(self.num_subevents) > u32::from(self.interval) {
            return Err(Error::with_message(ErrorKind::Config, "subevents do not fit the interval"));
        }
        Ok(())
    }

    /// Total number of slot coordinates, including the register region.
    pub fn total_slots(&self) -> usize {
        usize::from(self.num_subevents) * usize::from(self.num_response_slots)
    }

    /// Cycles without a response after which an occupied slot is reclaimed.
    pub fn liveness_limit(&self) -> u8 {
        3 * self.events_per_block
    }

    /// Duration of one full PAwR cycle.
    pub fn cycle(&self) -> Duration {
        Duration::from_micros(u64::from(self.interval) * 1250)
    }

    /// Time a scanner sleeps between data transmissions.
    pub fn block_time(&self) -> Duration {
        self.cycle() * u32::from(self.events_per_block)
    }
}
