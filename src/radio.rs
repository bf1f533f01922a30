//! Radio driver surfaces.
//!
//! The engines never talk to a controller directly; they consume the traits
//! here and implement the matching hook traits. Hook methods are delivered on
//! driver context: they must not block, must not panic and may only touch
//! engine state through atomics and short mutexes. Radio methods likewise
//! return quickly; a rejected call surfaces as [`ErrorKind::Radio`] and the
//! engines either retry on the next cycle or fault, depending on the phase.
//!
//! [`ErrorKind::Radio`]: crate::ErrorKind::Radio

use std::sync::Arc;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use strum::Display;

use crate::{Address, Config, Result};

/// Parameters of the periodic advertising train.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeriodicParams {
    /// Advertising interval in 1.25 ms units.
    pub interval: u16,
    /// Subevents per cycle.
    pub num_subevents: u8,
    /// Time between subevents in 1.25 ms units.
    pub subevent_interval: u8,
    /// Time from subevent start to the first response slot, in 1.25 ms units.
    pub response_slot_delay: u8,
    /// Time between response slots in 0.125 ms units.
    pub response_slot_spacing: u8,
    /// Response slots per subevent.
    pub num_response_slots: u8,
}

impl PeriodicParams {
    /// Derives the controller parameters from the protocol configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.interval,
            num_subevents: config.num_subevents,
            subevent_interval: config.subevent_interval,
            response_slot_delay: config.response_slot_delay,
            response_slot_spacing: config.response_slot_spacing,
            num_response_slots: config.num_response_slots,
        }
    }
}

/// Controller request for subevent data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataRequest {
    /// First subevent the controller asks data for.
    pub start: u8,
    /// Number of consecutive subevents requested.
    pub count: u8,
}

/// Origin of a received response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResponseInfo {
    /// Subevent the response was heard in.
    pub subevent: u8,
    /// Response slot the response was heard in.
    pub response_slot: u8,
}

/// Data for one subevent of the upcoming cycle.
#[derive(Debug)]
pub struct SubeventEntry<'a> {
    /// Subevent index.
    pub subevent: u8,
    /// First response slot listened to.
    pub response_slot_start: u8,
    /// Number of response slots listened to.
    pub response_slot_count: u8,
    /// Signed frame bytes.
    pub data: &'a [u8],
}

/// Advertiser-side upcalls, implemented by the engine.
pub trait AdvertiserHooks: Send + Sync {
    /// The controller asks for the next subevent buffers.
    fn data_request(&self, request: &DataRequest);

    /// A response was received in a response slot.
    fn response(&self, info: &ResponseInfo, data: &[u8]);
}

/// Advertiser-side controller surface.
pub trait AdvertiserRadio: Send + Sync {
    /// Powers the controller on.
    fn enable(&self) -> Result<()>;

    /// Creates the extended advertising set delivering the given hooks.
    fn create_adv_set(&self, hooks: Arc<dyn AdvertiserHooks>) -> Result<()>;

    /// Configures the periodic advertising train.
    fn set_periodic_params(&self, params: &PeriodicParams) -> Result<()>;

    /// Sets the extended advertising payload.
    fn set_adv_data(&self, data: &[u8]) -> Result<()>;

    /// Starts periodic advertising.
    fn start_periodic(&self) -> Result<()>;

    /// Starts extended advertising.
    fn start_extended(&self) -> Result<()>;

    /// Hands the controller the buffers for the requested subevents.
    fn set_subevent_data(&self, entries: &[SubeventEntry<'_>]) -> Result<()>;
}

/// Scan parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanParams {
    /// Scan interval in 0.625 ms units.
    pub interval: u16,
    /// Scan window in 0.625 ms units.
    pub window: u16,
    /// Active scanning.
    pub active: bool,
    /// Filter duplicate reports.
    pub filter_duplicates: bool,
}

impl Default for ScanParams {
    fn default() -> Self {
        // 100 ms interval, 50 ms window.
        Self { interval: 0x00a0, window: 0x0050, active: true, filter_duplicates: true }
    }
}

/// Extended advertising report with periodic sync information.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanInfo {
    /// Advertiser address.
    pub addr: Address,
    /// Advertising set id.
    pub sid: u8,
    /// Periodic advertising interval in 1.25 ms units. Zero if the report
    /// carries no sync info.
    pub interval: u16,
}

impl ScanInfo {
    /// Sync supervision timeout in 10 ms units for the given budget of
    /// missed cycles.
    pub fn sync_timeout(&self, failed_syncs: u8) -> u16 {
        (self.interval / 8).saturating_mul(u16::from(failed_syncs)).max(0x000a)
    }
}

/// Parameters for creating a periodic advertising sync.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncParams {
    /// Advertiser address.
    pub addr: Address,
    /// Advertising set id.
    pub sid: u8,
    /// Periodic advertising events that can be skipped.
    pub skip: u16,
    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
}

/// Details of an established sync.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncInfo {
    /// Advertiser address.
    pub addr: Address,
    /// Subevents per cycle of the synced train.
    pub num_subevents: u8,
}

/// Details of a terminated sync.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TermInfo {
    /// Advertiser address.
    pub addr: Address,
    /// Raw controller reason code.
    pub reason: u8,
}

impl TermInfo {
    /// Decoded termination reason, if the code is known.
    pub fn kind(&self) -> Option<SyncTermReason> {
        SyncTermReason::from_u8(self.reason)
    }
}

/// Known sync termination reasons.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, FromPrimitive)]
#[repr(u8)]
pub enum SyncTermReason {
    /// Supervision timeout: too many cycles were missed.
    SupervisionTimeout = 0x08,
    /// The local host deleted the sync.
    LocalHost = 0x16,
    /// Sync establishment gave up.
    EstablishmentFailed = 0x3e,
}

/// Reception context of a periodic frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecvInfo {
    /// Periodic event counter of the controller.
    pub periodic_event_counter: u16,
    /// Subevent the frame was received in.
    pub subevent: u8,
}

/// Placement of a queued response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResponseParams {
    /// Periodic event counter of the frame being answered.
    pub request_event: u16,
    /// Subevent of the frame being answered.
    pub request_subevent: u8,
    /// Subevent to respond in.
    pub response_subevent: u8,
    /// Response slot to respond in.
    pub response_slot: u8,
}

/// Scanner-side upcalls, implemented by the engine.
pub trait ScannerHooks: Send + Sync {
    /// An extended advertising report was received while scanning.
    fn scan_report(&self, info: &ScanInfo, data: &[u8]);

    /// A periodic sync was established.
    fn synced(&self, info: &SyncInfo);

    /// The periodic sync was terminated.
    fn terminated(&self, info: &TermInfo);

    /// A periodic frame was received in a synced subevent.
    fn received(&self, info: &RecvInfo, data: &[u8]);
}

/// Scanner-side controller surface.
pub trait ScannerRadio: Send + Sync {
    /// Powers the controller on.
    fn enable(&self) -> Result<()>;

    /// Starts scanning, delivering reports to the given hooks.
    fn start_scan(&self, params: &ScanParams, hooks: Arc<dyn ScannerHooks>) -> Result<()>;

    /// Stops scanning.
    fn stop_scan(&self) -> Result<()>;

    /// Creates a sync to the periodic train described by `params`.
    fn create_sync(&self, params: &SyncParams) -> Result<()>;

    /// Restricts the sync to the given subevents.
    fn sync_subevents(&self, subevents: &[u8]) -> Result<()>;

    /// Enables frame reception on the sync.
    fn recv_enable(&self) -> Result<()>;

    /// Disables frame reception on the sync; the sync itself stays alive.
    fn recv_disable(&self) -> Result<()>;

    /// Deletes the sync.
    fn delete_sync(&self) -> Result<()>;

    /// Queues a response frame for transmission in a response slot.
    fn set_response_data(&self, params: &ResponseParams, data: &[u8]) -> Result<()>;
}
