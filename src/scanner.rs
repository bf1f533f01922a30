//! Scanner state machine.
//!
//! A scanner scans for the advertiser's announcement, syncs to its periodic
//! train, registers by answering in a randomly chosen register slot of
//! subevent 0 and then watches the acknowledgement vector of its assigned
//! slot. Once confirmed it duty-cycles: sleep until the data generator
//! fires, wake for one acknowledgement round, transmit, sleep again.
//!
//! Receive handling runs inside the radio callback — a response must be
//! queued before the air slot passes — so every state installs its receive
//! handler by switching the shared receive mode; the state machine task only
//! waits on events and drives transitions:
//!
//! ```text
//! INITIALIZE ─ok─▶ SYNCING ─▶ REGISTERING ─▶ CONFIRMING ─▶ SLEEPING ⇄ ENABLED
//!                    ▲             ▲              │            │        │
//!                    └── invalid hash / sync loss ┴────────────┴────────┘
//! ```

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use num_traits::FromPrimitive as _;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use strum::Display;

use crate::{
    counter::{CounterStore, ReplayCounter, COUNTER_UID},
    crypto::{scanner_key_id, KeyId, KeyStore, ADVERTISER_KEY_ID},
    event::EventCell,
    interactive::{Indicator, NullIndicator},
    radio::{
        RecvInfo, ResponseParams, ScanInfo, ScanParams, ScannerHooks, ScannerRadio, SyncInfo,
        SyncParams, TermInfo,
    },
    wire::{self, Announcement, ResponseFrame, SubeventFrame, RESPONSE_PAYLOAD_LEN},
    Config, DeviceId, Error, ErrorKind, FaultReason, Reboot, Result, SlotCoord,
};

const LINK_SYNCED: u8 = 1;
const LINK_SYNC_LOST: u8 = 2;

const PROTO_REGISTERED: u8 = 1;
const PROTO_CONFIRMED: u8 = 2;
const PROTO_DENIED: u8 = 3;
const PROTO_INVALID_HASH: u8 = 4;
const PROTO_ACKED: u8 = 5;
const PROTO_ACK_MISSED: u8 = 6;

const DATA_GENERATED: u8 = 1;

const MODE_IDLE: u8 = 0;
const MODE_REGISTER: u8 = 1;
const MODE_CONFIRM: u8 = 2;
const MODE_DATA: u8 = 3;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum State {
    Initialize,
    Syncing,
    Registering,
    Confirming,
    Sleeping,
    Enabled,
    FaultHandling,
}

enum Wake {
    Link(u8),
    Proto(u8),
    Data,
    Timeout,
}

struct LinkState {
    /// Slot assigned during registration; survives sync loss so a resync can
    /// go straight back to confirmation.
    selected: Option<SlotCoord>,
    /// Replay floor for the advertiser key, seeded from the announcement.
    adv_floor: u64,
    unconfirmed_ticks: u8,
    sent_this_block: bool,
    payload: Vec<u8>,
    rng: StdRng,
}

struct Shared {
    config: Config,
    device: DeviceId,
    key: KeyId,
    radio: Arc<dyn ScannerRadio>,
    keys: Arc<dyn KeyStore>,
    store: Arc<dyn CounterStore>,
    mode: AtomicU8,
    link: Mutex<LinkState>,
    counter: Mutex<ReplayCounter>,
    link_events: EventCell,
    proto_events: EventCell,
    data_events: EventCell,
    fault: AtomicU8,
    indicator: Mutex<Arc<dyn Indicator>>,
}

impl Shared {
    fn set_fault(&self, reason: FaultReason) {
        self.fault.store(reason as u8, Ordering::Release);
    }

    /// Queues a signed response in the given slot of the current subevent.
    fn respond(&self, info: &RecvInfo, slot: u8) {
        let counter = self.counter.lock().unwrap().next();
        let mut buf = Vec::with_capacity(ResponseFrame::BODY_LEN + wire::TAG_LEN);
        {
            let link = self.link.lock().unwrap();
            let frame =
                ResponseFrame { sender_id: self.device, payload: link.payload.clone(), counter };
            frame.encode_into(&mut buf);
        }
        if let Err(err) = wire::sign_message(&mut buf, &*self.keys, self.key) {
            log::error!("cannot sign response: {err}");
            self.set_fault(FaultReason::CryptoFailure);
            self.proto_events.post(PROTO_INVALID_HASH);
            return;
        }
        let params = ResponseParams {
            request_event: info.periodic_event_counter,
            request_subevent: info.subevent,
            response_subevent: info.subevent,
            response_slot: slot,
        };
        log::trace!("responding in subevent {}, slot {}", info.subevent, slot);
        if let Err(err) = self.radio.set_response_data(&params, &buf) {
            // The next frame gives another chance.
            log::warn!("failed to queue response: {err}");
        }
    }

    /// Verifies a periodic frame and decodes it for the synced subevent.
    fn verify_frame(&self, info: &RecvInfo, data: &[u8]) -> Option<SubeventFrame> {
        let num_register =
            if info.subevent == 0 { usize::from(self.config.num_register_slots) } else { 0 };
        let body = {
            let mut link = self.link.lock().unwrap();
            match wire::verify_message(data, &*self.keys, ADVERTISER_KEY_ID, &mut link.adv_floor) {
                Ok(body) => body.to_vec(),
                Err(err) if err.kind == ErrorKind::InvalidMac => {
                    log::warn!("frame in subevent {} failed verification: {err}", info.subevent);
                    self.proto_events.post(PROTO_INVALID_HASH);
                    return None;
                }
                Err(err) => {
                    log::warn!("dropping frame in subevent {}: {err}", info.subevent);
                    return None;
                }
            }
        };
        match SubeventFrame::decode(&body, num_register, usize::from(self.config.num_response_slots)) {
            Ok(frame) => Some(frame),
            Err(err) => {
                log::warn!("malformed frame in subevent {}: {err}", info.subevent);
                None
            }
        }
    }

    fn register_recv(&self, info: &RecvInfo, data: &[u8]) {
        let Some(frame) = self.verify_frame(info, data) else { return };
        if frame.register_slots.is_empty() {
            log::warn!("registration frame without register data in subevent {}", info.subevent);
            return;
        }
        let slot = {
            let mut link = self.link.lock().unwrap();
            let slot = link.rng.gen_range(0..self.config.num_register_slots);
            let assigned = frame.register_slots[usize::from(slot)];
            link.selected = Some(assigned);
            link.unconfirmed_ticks = 0;
            log::info!("registering in slot {slot}, assigned {assigned}");
            slot
        };
        self.respond(info, slot);
        self.proto_events.post(PROTO_REGISTERED);
    }

    fn confirm_recv(&self, info: &RecvInfo, data: &[u8]) {
        let Some(frame) = self.verify_frame(info, data) else { return };
        let Some(selected) = self.link.lock().unwrap().selected else { return };
        if frame.ack_for(selected.slot) == Some(self.device) {
            self.proto_events.post(PROTO_CONFIRMED);
            return;
        }
        let ticks = {
            let mut link = self.link.lock().unwrap();
            link.unconfirmed_ticks += 1;
            link.unconfirmed_ticks
        };
        if ticks >= self.config.max_unconfirmed_ticks {
            self.proto_events.post(PROTO_DENIED);
        } else {
            self.respond(info, selected.slot);
        }
    }

    fn data_recv(&self, info: &RecvInfo, data: &[u8]) {
        let Some(frame) = self.verify_frame(info, data) else { return };
        let Some(selected) = self.link.lock().unwrap().selected else { return };
        if frame.ack_for(selected.slot) == Some(self.device) {
            self.link.lock().unwrap().unconfirmed_ticks = 0;
            self.proto_events.post(PROTO_ACKED);
            return;
        }
        // First frame after wake-up carries no ack yet; transmit before
        // counting any of them as missed.
        let (first, ticks) = {
            let mut link = self.link.lock().unwrap();
            if link.sent_this_block {
                link.unconfirmed_ticks += 1;
            } else {
                link.sent_this_block = true;
            }
            (link.unconfirmed_ticks == 0, link.unconfirmed_ticks)
        };
        if !first && ticks >= self.config.max_unconfirmed_ticks {
            self.proto_events.post(PROTO_ACK_MISSED);
        } else {
            self.respond(info, selected.slot);
        }
    }
}

impl ScannerHooks for Shared {
    fn scan_report(&self, info: &ScanInfo, data: &[u8]) {
        if info.interval == 0 {
            // Extended advertising without sync info, keep scanning.
            return;
        }
        let Some(payload) = wire::manufacturer_data(data) else { return };
        {
            let mut link = self.link.lock().unwrap();
            let body =
                match wire::verify_message(payload, &*self.keys, ADVERTISER_KEY_ID, &mut link.adv_floor) {
                    Ok(body) => body.to_vec(),
                    Err(err) => {
                        log::warn!("ignoring announcement from {}: {err}", info.addr);
                        return;
                    }
                };
            let announcement = match Announcement::decode(&body) {
                Ok(announcement) => announcement,
                Err(err) => {
                    log::warn!("malformed announcement from {}: {err}", info.addr);
                    return;
                }
            };
            if announcement.num_register_slots != self.config.num_register_slots {
                log::warn!(
                    "peer {} publishes {} register slots, expected {}",
                    info.addr,
                    announcement.num_register_slots,
                    self.config.num_register_slots
                );
                return;
            }
        }
        let params = SyncParams {
            addr: info.addr,
            sid: info.sid,
            skip: 1,
            timeout: info.sync_timeout(self.config.failed_syncs),
        };
        if let Err(err) = self.radio.create_sync(&params) {
            log::warn!("failed to create sync to {}: {err}", info.addr);
            return;
        }
        log::info!("creating sync to {} (sid {})", info.addr, info.sid);
        if let Err(err) = self.radio.stop_scan() {
            log::warn!("couldn't stop scanning: {err}");
        }
    }

    fn synced(&self, info: &SyncInfo) {
        log::info!("synced to {} with {} subevents", info.addr, info.num_subevents);
        let subevent = self.link.lock().unwrap().selected.map(|s| s.subevent).unwrap_or(0);
        match self.radio.sync_subevents(&[subevent]) {
            Ok(()) => log::info!("following subevent {subevent}"),
            Err(err) => log::warn!("failed to set subevents to sync to: {err}"),
        }
        self.link_events.post(LINK_SYNCED);
    }

    fn terminated(&self, info: &TermInfo) {
        match info.kind() {
            Some(reason) => log::warn!("sync terminated: {reason}"),
            None => log::warn!("sync terminated (reason {})", info.reason),
        }
        self.link_events.post(LINK_SYNC_LOST);
    }

    fn received(&self, info: &RecvInfo, data: &[u8]) {
        if data.is_empty() {
            log::warn!("received empty indication in subevent {}", info.subevent);
            return;
        }
        match self.mode.load(Ordering::Acquire) {
            MODE_REGISTER => self.register_recv(info, data),
            MODE_CONFIRM => self.confirm_recv(info, data),
            MODE_DATA => self.data_recv(info, data),
            _ => {}
        }
    }
}

/// PAwR scanner.
///
/// Cheaply cloneable handle around the shared engine state.
#[derive(Clone)]
pub struct Scanner {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner").field("device", &self.shared.device).finish()
    }
}

impl Scanner {
    /// Creates a scanner with the given identity over a radio, key store and
    /// counter store.
    ///
    /// Loads the device's replay counter, seeding it on first boot.
    pub fn new(
        config: Config, device: DeviceId, radio: Arc<dyn ScannerRadio>, keys: Arc<dyn KeyStore>,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        config.validate()?;
        if device.0 == 0 {
            return Err(Error::with_message(ErrorKind::Config, "device id 0 is reserved"));
        }
        let counter = ReplayCounter::load(&*store, &*keys, COUNTER_UID)?;
        let shared = Arc::new(Shared {
            key: scanner_key_id(device),
            mode: AtomicU8::new(MODE_IDLE),
            link: Mutex::new(LinkState {
                selected: None,
                adv_floor: 0,
                unconfirmed_ticks: 0,
                sent_this_block: false,
                payload: vec![0; RESPONSE_PAYLOAD_LEN],
                rng: StdRng::from_entropy(),
            }),
            counter: Mutex::new(counter),
            link_events: EventCell::new(),
            proto_events: EventCell::new(),
            data_events: EventCell::new(),
            fault: AtomicU8::new(0),
            indicator: Mutex::new(Arc::new(NullIndicator) as Arc<dyn Indicator>),
            config,
            device,
            radio,
            keys,
            store,
        });
        Ok(Self { shared })
    }

    /// Attaches an indicator LED, lit while the scanner holds a confirmed slot.
    pub fn set_indicator(&self, indicator: Arc<dyn Indicator>) {
        *self.shared.indicator.lock().unwrap() = indicator;
    }

    /// Reseeds the register-index selection for reproducible runs.
    pub fn set_register_seed(&self, seed: u64) {
        self.shared.link.lock().unwrap().rng = StdRng::seed_from_u64(seed);
    }

    /// The hook surface to connect to a radio driver.
    pub fn hooks(&self) -> Arc<dyn ScannerHooks> {
        self.shared.clone()
    }

    /// Handle for feeding response payloads, usually owned by a
    /// [`DataGenerator`](crate::data_gen::DataGenerator).
    pub fn data_feed(&self) -> DataFeed {
        DataFeed { shared: self.shared.clone() }
    }

    /// Runs the state machine until a reboot is required.
    ///
    /// Commits the replay counter before returning.
    pub async fn run(&self) -> Reboot {
        let mut state = State::Initialize;
        loop {
            log::info!("scanner {} entering state {state}", self.shared.device);
            state = match state {
                State::Initialize => self.initialize(),
                State::Syncing => self.syncing().await,
                State::Registering => self.registering().await,
                State::Confirming => self.confirming().await,
                State::Sleeping => self.sleeping().await,
                State::Enabled => self.enabled().await,
                State::FaultHandling => {
                    let reason = FaultReason::from_u8(self.shared.fault.load(Ordering::Acquire))
                        .unwrap_or(FaultReason::RadioFailure);
                    log::error!("scanner rebooting after fault: {reason}");
                    self.shutdown();
                    return Reboot::Fault(reason);
                }
            };
        }
    }

    fn initialize(&self) -> State {
        match self.shared.radio.enable() {
            Ok(()) => State::Syncing,
            Err(err) => {
                log::error!("radio bring-up failed: {err}");
                self.shared.set_fault(FaultReason::RadioFailure);
                State::FaultHandling
            }
        }
    }

    async fn syncing(&self) -> State {
        let shared = &self.shared;
        shared.mode.store(MODE_IDLE, Ordering::Release);
        self.indicate(false);
        // Drop whatever sync may be left over before scanning anew.
        let _ = shared.radio.delete_sync();
        if let Err(err) = shared.radio.start_scan(&ScanParams::default(), shared.clone()) {
            log::error!("failed to start scanning: {err}");
            shared.set_fault(FaultReason::RadioFailure);
            return State::FaultHandling;
        }
        let mut iterations = 0usize;
        loop {
            match tokio::time::timeout(Duration::from_secs(10), shared.link_events.wait()).await {
                Err(_) => {
                    iterations += 1;
                    log::info!("still syncing, iterations {iterations}");
                }
                Ok(LINK_SYNCED) => break,
                Ok(_) => continue,
            }
        }
        let link = shared.link.lock().unwrap();
        if link.selected.is_some() && link.unconfirmed_ticks < shared.config.max_unconfirmed_ticks {
            // The assignment survived the sync loss; confirm it instead of
            // burning a register slot again.
            State::Confirming
        } else {
            State::Registering
        }
    }

    async fn registering(&self) -> State {
        let shared = &self.shared;
        {
            let mut link = shared.link.lock().unwrap();
            link.selected = None;
            link.unconfirmed_ticks = 0;
            link.sent_this_block = false;
        }
        if let Err(err) = shared.radio.sync_subevents(&[0]) {
            log::warn!("failed to move sync to subevent 0: {err}");
        }
        shared.mode.store(MODE_REGISTER, Ordering::Release);
        if let Err(err) = shared.radio.recv_enable() {
            log::warn!("failed to enable reception: {err}");
        }
        loop {
            match self.next_wake(Duration::from_secs(10)).await {
                Wake::Proto(PROTO_REGISTERED) => {
                    let subevent =
                        shared.link.lock().unwrap().selected.map(|s| s.subevent).unwrap_or(0);
                    if let Err(err) = shared.radio.sync_subevents(&[subevent]) {
                        log::warn!("failed to follow assigned subevent: {err}");
                    }
                    return State::Confirming;
                }
                Wake::Proto(PROTO_INVALID_HASH) | Wake::Link(LINK_SYNC_LOST) => return State::Syncing,
                Wake::Timeout => log::info!("still registering"),
                _ => continue,
            }
        }
    }

    async fn confirming(&self) -> State {
        let shared = &self.shared;
        shared.mode.store(MODE_CONFIRM, Ordering::Release);
        if let Err(err) = shared.radio.recv_enable() {
            log::warn!("failed to enable reception: {err}");
        }
        loop {
            match self.next_wake(Duration::from_secs(10)).await {
                Wake::Proto(PROTO_CONFIRMED) => {
                    shared.link.lock().unwrap().unconfirmed_ticks = 0;
                    log::info!("slot assignment confirmed");
                    return State::Sleeping;
                }
                Wake::Proto(PROTO_DENIED) => {
                    log::warn!("registration was not acknowledged, re-registering");
                    return State::Registering;
                }
                Wake::Proto(PROTO_INVALID_HASH) | Wake::Link(LINK_SYNC_LOST) => return State::Syncing,
                Wake::Timeout => log::info!("still confirming"),
                _ => continue,
            }
        }
    }

    async fn sleeping(&self) -> State {
        let shared = &self.shared;
        shared.mode.store(MODE_IDLE, Ordering::Release);
        if let Err(err) = shared.radio.recv_disable() {
            log::warn!("failed to disable reception: {err}");
        }
        self.indicate(true);
        loop {
            match self.next_wake(Duration::from_secs(30)).await {
                Wake::Data => {
                    let mut link = shared.link.lock().unwrap();
                    link.sent_this_block = false;
                    link.unconfirmed_ticks = 0;
                    return State::Enabled;
                }
                Wake::Link(LINK_SYNC_LOST) => return State::Syncing,
                Wake::Timeout => log::info!("still alive"),
                _ => continue,
            }
        }
    }

    async fn enabled(&self) -> State {
        let shared = &self.shared;
        shared.mode.store(MODE_DATA, Ordering::Release);
        if let Err(err) = shared.radio.recv_enable() {
            log::warn!("failed to enable reception: {err}");
        }
        loop {
            match self.next_wake(Duration::from_secs(10)).await {
                Wake::Proto(PROTO_ACKED) => return State::Sleeping,
                Wake::Proto(PROTO_ACK_MISSED) => {
                    log::warn!(
                        "no acknowledgement after {} frames, re-registering",
                        shared.config.max_unconfirmed_ticks
                    );
                    return State::Registering;
                }
                Wake::Proto(PROTO_INVALID_HASH) | Wake::Link(LINK_SYNC_LOST) => return State::Syncing,
                Wake::Timeout => log::info!("still waiting for acknowledgement"),
                _ => continue,
            }
        }
    }

    fn shutdown(&self) {
        self.indicate(false);
        let counter = self.shared.counter.lock().unwrap();
        if let Err(err) = counter.commit(&*self.shared.store) {
            log::error!("failed to commit replay counter: {err}");
        }
    }

    async fn next_wake(&self, timeout: Duration) -> Wake {
        let shared = &self.shared;
        tokio::select! {
            event = shared.link_events.wait() => Wake::Link(event),
            event = shared.proto_events.wait() => Wake::Proto(event),
            _ = shared.data_events.wait() => Wake::Data,
            _ = tokio::time::sleep(timeout) => Wake::Timeout,
        }
    }

    fn indicate(&self, lit: bool) {
        self.shared.indicator.lock().unwrap().set(lit);
    }

    // Diagnostics below: snapshots for supervision and tests.

    /// This scanner's identity.
    pub fn device_id(&self) -> DeviceId {
        self.shared.device
    }

    /// The slot assigned during registration, if any.
    pub fn selected_slot(&self) -> Option<SlotCoord> {
        self.shared.link.lock().unwrap().selected
    }

    /// Replay floor currently enforced for the advertiser key.
    pub fn advertiser_floor(&self) -> u64 {
        self.shared.link.lock().unwrap().adv_floor
    }

    /// Current value of this scanner's own replay counter.
    pub fn counter(&self) -> u64 {
        self.shared.counter.lock().unwrap().value()
    }

    /// Responses sent without seeing an acknowledgement.
    pub fn unconfirmed_ticks(&self) -> u8 {
        self.shared.link.lock().unwrap().unconfirmed_ticks
    }
}

/// Feed into a scanner's response payload buffer.
///
/// Cloneable; the [`DataGenerator`](crate::data_gen::DataGenerator) drives it
/// on a timer, tests may call it directly.
#[derive(Clone)]
pub struct DataFeed {
    shared: Arc<Shared>,
}

impl DataFeed {
    /// Fills the payload buffer with fresh random bytes and wakes the
    /// state machine.
    pub fn generate(&self) {
        {
            let mut guard = self.shared.link.lock().unwrap();
            let link = &mut *guard;
            link.rng.fill_bytes(&mut link.payload);
        }
        self.shared.data_events.post(DATA_GENERATED);
    }

    /// Takes the pending wake-up, if any. Test instrumentation.
    #[cfg(test)]
    pub(crate) fn take_generated(&self) -> bool {
        self.shared.data_events.take() != 0
    }

    /// Replaces the payload buffer and wakes the state machine.
    ///
    /// Longer payloads are truncated to the fixed response length, shorter
    /// ones are zero-padded.
    pub fn push(&self, payload: &[u8]) {
        {
            let mut link = self.shared.link.lock().unwrap();
            let take = payload.len().min(RESPONSE_PAYLOAD_LEN);
            link.payload[..take].copy_from_slice(&payload[..take]);
            link.payload[take..].fill(0);
        }
        self.shared.data_events.post(DATA_GENERATED);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;
    use crate::{counter::MemoryStore, crypto::SoftKeyStore, Address};

    #[derive(Default)]
    struct StubRadio {
        hooks: Mutex<Option<Arc<dyn ScannerHooks>>>,
        scanning: AtomicBool,
        scans: AtomicUsize,
        scan_stops: AtomicUsize,
        syncs: Mutex<Vec<SyncParams>>,
        subevents: Mutex<Vec<u8>>,
        recv_enabled: AtomicBool,
        recv_enables: AtomicUsize,
        responses: Mutex<Vec<(ResponseParams, Vec<u8>)>>,
    }

    impl ScannerRadio for StubRadio {
        fn enable(&self) -> crate::Result<()> {
            Ok(())
        }
        fn start_scan(&self, _params: &ScanParams, hooks: Arc<dyn ScannerHooks>) -> crate::Result<()> {
            *self.hooks.lock().unwrap() = Some(hooks);
            self.scanning.store(true, Ordering::SeqCst);
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop_scan(&self) -> crate::Result<()> {
            self.scanning.store(false, Ordering::SeqCst);
            self.scan_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn create_sync(&self, params: &SyncParams) -> crate::Result<()> {
            self.syncs.lock().unwrap().push(*params);
            Ok(())
        }
        fn sync_subevents(&self, subevents: &[u8]) -> crate::Result<()> {
            *self.subevents.lock().unwrap() = subevents.to_vec();
            Ok(())
        }
        fn recv_enable(&self) -> crate::Result<()> {
            self.recv_enabled.store(true, Ordering::SeqCst);
            self.recv_enables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn recv_disable(&self) -> crate::Result<()> {
            self.recv_enabled.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn delete_sync(&self) -> crate::Result<()> {
            Ok(())
        }
        fn set_response_data(&self, params: &ResponseParams, data: &[u8]) -> crate::Result<()> {
            self.responses.lock().unwrap().push((*params, data.to_vec()));
            Ok(())
        }
    }

    struct Rig {
        scanner: Scanner,
        radio: Arc<StubRadio>,
        keys: Arc<SoftKeyStore>,
        adv_counter: u64,
    }

    fn rig() -> Rig {
        let radio = Arc::new(StubRadio::default());
        let keys = Arc::new(SoftKeyStore::new());
        keys.import_key(ADVERTISER_KEY_ID, b"advertiser key material 32 bytes").unwrap();
        keys.generate_key(scanner_key_id(DeviceId(7))).unwrap();
        let store = Arc::new(MemoryStore::new());
        store.commit(COUNTER_UID, 500).unwrap();
        let scanner = Scanner::new(
            Config { max_unconfirmed_ticks: 3, ..Config::default() },
            DeviceId(7),
            radio.clone(),
            keys.clone(),
            store,
        )
        .unwrap();
        scanner.set_register_seed(11);
        Rig { scanner, radio, keys, adv_counter: 100 }
    }

    impl Rig {
        fn hooks(&self) -> Arc<dyn ScannerHooks> {
            self.radio.hooks.lock().unwrap().clone().expect("scanner is not scanning yet")
        }

        fn announcement(&self) -> Vec<u8> {
            let mut signed = Vec::new();
            Announcement { num_register_slots: 3, counter: self.adv_counter }.encode_into(&mut signed);
            wire::sign_message(&mut signed, &*self.keys, ADVERTISER_KEY_ID).unwrap();
            let mut ad = Vec::new();
            wire::encode_adv_data(&signed, &mut ad);
            ad
        }

        fn scan_info(&self) -> ScanInfo {
            ScanInfo { addr: Address::new([0xc0, 0, 0, 0, 0, 1]), sid: 1, interval: 2000 }
        }

        fn frame(&mut self, subevent: u8, register: Vec<SlotCoord>, acks: Vec<u16>) -> Vec<u8> {
            self.adv_counter += 1;
            let frame = SubeventFrame { register_slots: register, acks, counter: self.adv_counter };
            let mut buf = Vec::new();
            frame.encode_into(&mut buf);
            wire::sign_message(&mut buf, &*self.keys, ADVERTISER_KEY_ID).unwrap();
            buf
        }

        fn register_frame(&mut self) -> Vec<u8> {
            self.frame(
                0,
                vec![SlotCoord::new(0, 3), SlotCoord::new(0, 4), SlotCoord::new(0, 5)],
                vec![0; 10],
            )
        }

        fn deliver(&self, subevent: u8, data: &[u8]) {
            self.hooks().received(&RecvInfo { periodic_event_counter: 9, subevent }, data);
        }

        async fn wait_for(&self, what: &str, cond: impl Fn(&Rig) -> bool) {
            for _ in 0..2000 {
                if cond(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            panic!("timed out waiting for {what}");
        }

        /// Drives the scanner through registration into the confirming state.
        async fn register(&mut self) -> SlotCoord {
            self.wait_for("scan start", |r| r.radio.scanning.load(Ordering::SeqCst)).await;
            self.hooks().scan_report(&self.scan_info(), &self.announcement());
            self.hooks().synced(&SyncInfo { addr: self.scan_info().addr, num_subevents: 46 });
            self.wait_for("receive enable", |r| r.radio.recv_enabled.load(Ordering::SeqCst)).await;
            let enables = self.radio.recv_enables.load(Ordering::SeqCst);
            let frame = self.register_frame();
            self.deliver(0, &frame);
            // The confirming state re-enables reception; only then is the
            // receive mode switched over and further frames safe to deliver.
            self.wait_for("confirm phase", |r| {
                r.radio.recv_enables.load(Ordering::SeqCst) > enables
            })
            .await;
            self.scanner.selected_slot().unwrap()
        }
    }

    #[tokio::test]
    async fn announcement_with_bad_mac_is_ignored() {
        let rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });
        rig.wait_for("scan start", |r| r.radio.scanning.load(Ordering::SeqCst)).await;

        let mut ad = rig.announcement();
        let len = ad.len();
        ad[len - 1] ^= 0x01;
        rig.hooks().scan_report(&rig.scan_info(), &ad);
        assert!(rig.radio.syncs.lock().unwrap().is_empty());
        assert!(rig.radio.scanning.load(Ordering::SeqCst));
        task.abort();
    }

    #[tokio::test]
    async fn announcement_with_foreign_register_count_is_ignored() {
        let rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });
        rig.wait_for("scan start", |r| r.radio.scanning.load(Ordering::SeqCst)).await;

        let mut signed = Vec::new();
        Announcement { num_register_slots: 5, counter: 100 }.encode_into(&mut signed);
        wire::sign_message(&mut signed, &*rig.keys, ADVERTISER_KEY_ID).unwrap();
        let mut ad = Vec::new();
        wire::encode_adv_data(&signed, &mut ad);
        rig.hooks().scan_report(&rig.scan_info(), &ad);
        assert!(rig.radio.syncs.lock().unwrap().is_empty());
        task.abort();
    }

    #[tokio::test]
    async fn valid_announcement_creates_sync_and_seeds_the_floor() {
        let rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });
        rig.wait_for("scan start", |r| r.radio.scanning.load(Ordering::SeqCst)).await;

        rig.hooks().scan_report(&rig.scan_info(), &rig.announcement());
        let syncs = rig.radio.syncs.lock().unwrap().clone();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].addr, rig.scan_info().addr);
        assert_eq!(syncs[0].timeout, 1250);
        assert!(!rig.radio.scanning.load(Ordering::SeqCst));
        assert_eq!(rig.scanner.advertiser_floor(), 100);
        task.abort();
    }

    #[tokio::test]
    async fn registration_picks_a_register_slot_and_records_the_assignment() {
        let mut rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });

        let own_counter = rig.scanner.counter();
        let assigned = rig.register().await;
        assert!([SlotCoord::new(0, 3), SlotCoord::new(0, 4), SlotCoord::new(0, 5)]
            .contains(&assigned));

        let responses = rig.radio.responses.lock().unwrap().clone();
        assert_eq!(responses.len(), 1);
        let (params, data) = &responses[0];
        assert_eq!(params.response_subevent, 0);
        assert!(params.response_slot < 3);
        assert_eq!(usize::from(params.response_slot),
            [SlotCoord::new(0, 3), SlotCoord::new(0, 4), SlotCoord::new(0, 5)]
                .iter()
                .position(|&c| c == assigned)
                .unwrap());

        // The response is signed with the scanner's key and advances its counter.
        let mut floor = 0;
        let body =
            wire::verify_message(data, &*rig.keys, scanner_key_id(DeviceId(7)), &mut floor).unwrap();
        let frame = ResponseFrame::decode(body).unwrap();
        assert_eq!(frame.sender_id, DeviceId(7));
        assert_eq!(frame.counter, own_counter + 1);
        assert_eq!(rig.scanner.counter(), own_counter + 1);

        // The sync now follows the assigned subevent.
        rig.wait_for("subevent follow", |r| {
            *r.radio.subevents.lock().unwrap() == vec![assigned.subevent]
        })
        .await;
        task.abort();
    }

    #[tokio::test]
    async fn confirmation_ack_sends_the_scanner_to_sleep() {
        let mut rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });

        let assigned = rig.register().await;
        let mut acks = vec![0u16; 10];
        acks[usize::from(assigned.slot)] = 7;
        let frame = rig.frame(assigned.subevent, reg_for(assigned.subevent), acks);
        rig.deliver(assigned.subevent, &frame);
        rig.wait_for("sleep", |r| !r.radio.recv_enabled.load(Ordering::SeqCst)).await;
        assert_eq!(rig.scanner.unconfirmed_ticks(), 0);
        task.abort();
    }

    #[tokio::test]
    async fn unconfirmed_frames_are_answered_until_the_budget_runs_out() {
        let mut rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });

        let assigned = rig.register().await;
        let before = rig.radio.responses.lock().unwrap().len();

        // Two unacknowledged frames: retransmissions in the assigned slot.
        for _ in 0..2 {
            let frame = rig.frame(assigned.subevent, reg_for(assigned.subevent), vec![0; 10]);
            rig.deliver(assigned.subevent, &frame);
        }
        rig.wait_for("retransmissions", |r| r.radio.responses.lock().unwrap().len() == before + 2)
            .await;
        let responses = rig.radio.responses.lock().unwrap().clone();
        for (params, _) in &responses[before..] {
            assert_eq!(params.response_slot, assigned.slot);
        }

        // The third unacknowledged frame exhausts the budget of 3.
        let frame = rig.frame(assigned.subevent, reg_for(assigned.subevent), vec![0; 10]);
        rig.deliver(assigned.subevent, &frame);
        rig.wait_for("re-registration", |r| r.scanner.selected_slot().is_none()).await;
        task.abort();
    }

    fn reg_for(subevent: u8) -> Vec<SlotCoord> {
        if subevent == 0 {
            vec![SlotCoord::new(0, 6), SlotCoord::new(0, 7), SlotCoord::new(0, 8)]
        } else {
            vec![]
        }
    }

    #[tokio::test]
    async fn invalid_hash_returns_to_syncing() {
        let mut rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });

        let assigned = rig.register().await;
        let mut forged = rig.frame(assigned.subevent, reg_for(assigned.subevent), vec![0; 10]);
        let len = forged.len();
        forged[len - 1] ^= 0x80;
        let scans = rig.radio.scans.load(Ordering::SeqCst);
        rig.deliver(assigned.subevent, &forged);
        rig.wait_for("rescan", |r| r.radio.scans.load(Ordering::SeqCst) == scans + 1).await;
        // The assignment is kept for the resync.
        assert_eq!(rig.scanner.selected_slot(), Some(assigned));
        task.abort();
    }

    #[tokio::test]
    async fn data_cycle_transmits_then_sleeps_on_ack() {
        let mut rig = rig();
        let scanner = rig.scanner.clone();
        let feed = rig.scanner.data_feed();
        let task = tokio::spawn(async move { scanner.run().await });

        let assigned = rig.register().await;
        let mut acks = vec![0u16; 10];
        acks[usize::from(assigned.slot)] = 7;
        let frame = rig.frame(assigned.subevent, reg_for(assigned.subevent), acks.clone());
        rig.deliver(assigned.subevent, &frame);
        rig.wait_for("sleep", |r| !r.radio.recv_enabled.load(Ordering::SeqCst)).await;

        // The generator fires: reception comes back for one ack round.
        feed.push(b"sensor readings");
        rig.wait_for("wake", |r| r.radio.recv_enabled.load(Ordering::SeqCst)).await;

        let before = rig.radio.responses.lock().unwrap().len();
        let frame = rig.frame(assigned.subevent, reg_for(assigned.subevent), vec![0; 10]);
        rig.deliver(assigned.subevent, &frame);
        rig.wait_for("data response", |r| r.radio.responses.lock().unwrap().len() == before + 1)
            .await;
        let (_, data) = rig.radio.responses.lock().unwrap().last().unwrap().clone();
        let mut floor = 0;
        let body =
            wire::verify_message(&data, &*rig.keys, scanner_key_id(DeviceId(7)), &mut floor).unwrap();
        let response = ResponseFrame::decode(body).unwrap();
        assert_eq!(&response.payload[..15], b"sensor readings");

        // The ack arrives: back to sleep.
        let frame = rig.frame(assigned.subevent, reg_for(assigned.subevent), acks);
        rig.deliver(assigned.subevent, &frame);
        rig.wait_for("sleep again", |r| !r.radio.recv_enabled.load(Ordering::SeqCst)).await;
        task.abort();
    }

    #[tokio::test]
    async fn sync_loss_preserves_the_assignment() {
        let mut rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });

        let assigned = rig.register().await;
        let scans = rig.radio.scans.load(Ordering::SeqCst);
        rig.hooks().terminated(&TermInfo { addr: rig.scan_info().addr, reason: 0x16 });
        rig.wait_for("rescan", |r| r.radio.scans.load(Ordering::SeqCst) == scans + 1).await;
        assert_eq!(rig.scanner.selected_slot(), Some(assigned));

        // After resync the scanner goes straight to confirming: an ack in the
        // assigned slot suffices, no new registration is sent.
        let enables = rig.radio.recv_enables.load(Ordering::SeqCst);
        rig.hooks().scan_report(&rig.scan_info(), &rig.announcement());
        rig.hooks().synced(&SyncInfo { addr: rig.scan_info().addr, num_subevents: 46 });
        let mut acks = vec![0u16; 10];
        acks[usize::from(assigned.slot)] = 7;
        rig.wait_for("confirm phase", |r| r.radio.recv_enables.load(Ordering::SeqCst) > enables)
            .await;
        let frame = rig.frame(assigned.subevent, reg_for(assigned.subevent), acks);
        rig.deliver(assigned.subevent, &frame);
        rig.wait_for("sleep", |r| !r.radio.recv_enabled.load(Ordering::SeqCst)).await;
        assert_eq!(rig.scanner.selected_slot(), Some(assigned));
        task.abort();
    }

    #[tokio::test]
    async fn stale_counter_frames_are_dropped_quietly() {
        let mut rig = rig();
        let scanner = rig.scanner.clone();
        let task = tokio::spawn(async move { scanner.run().await });

        let assigned = rig.register().await;
        let floor = rig.scanner.advertiser_floor();

        // Replay an old frame: counter below the floor.
        let stale = SubeventFrame { register_slots: reg_for(assigned.subevent), acks: vec![0; 10], counter: 1 };
        let mut buf = Vec::new();
        stale.encode_into(&mut buf);
        wire::sign_message(&mut buf, &*rig.keys, ADVERTISER_KEY_ID).unwrap();
        let scans = rig.radio.scans.load(Ordering::SeqCst);
        rig.deliver(assigned.subevent, &buf);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // No resync was triggered and the floor is unchanged.
        assert_eq!(rig.radio.scans.load(Ordering::SeqCst), scans);
        assert_eq!(rig.scanner.advertiser_floor(), floor);
        task.abort();
    }

    #[test]
    fn device_zero_is_rejected() {
        let radio = Arc::new(StubRadio::default());
        let keys = Arc::new(SoftKeyStore::new());
        let store = Arc::new(MemoryStore::new());
        let err = Scanner::new(Config::default(), DeviceId(0), radio, keys, store).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }
}
