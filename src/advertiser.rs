//! Advertiser engine.
//!
//! The advertiser owns the slot population: it publishes register
//! descriptors inviting new scanners, assembles one signed frame per
//! subevent with the acknowledgement vector, verifies every response and
//! decays the liveness of occupied slots until they are reclaimed into the
//! [free list](crate::free_list::FreeList).
//!
//! Frame assembly and response handling run on driver context via
//! [`AdvertiserHooks`]; the state machine task only performs bring-up,
//! liveness logging and the shutdown paths.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::Stream;
use num_traits::FromPrimitive as _;
use strum::Display;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    counter::{CounterStore, ReplayCounter, COUNTER_UID},
    crypto::{scanner_key_id, KeyStore, ADVERTISER_KEY_ID},
    event::EventCell,
    free_list::FreeList,
    interactive::{Indicator, NullIndicator},
    radio::{AdvertiserHooks, AdvertiserRadio, DataRequest, PeriodicParams, ResponseInfo, SubeventEntry},
    wire::{self, Announcement, ResponseFrame, SubeventFrame},
    Config, DeviceId, Error, ErrorKind, FaultReason, Reboot, Result, SlotCoord,
};

const CONTROL_SOFT_REBOOT: u8 = 1;
const CONTROL_FAULT: u8 = 2;

/// Advertiser-side view of one response slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SlotState {
    /// Occupying device, if any.
    pub device_id: Option<DeviceId>,
    /// PAwR cycles since the occupant was last heard.
    pub inactive_for: u8,
}

/// Notable change observed by the advertiser.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AdvertiserEvent {
    /// A device registered into a slot.
    DeviceRegistered {
        /// Newly registered device.
        device: DeviceId,
        /// Slot it was assigned.
        coord: SlotCoord,
    },
    /// An occupied slot timed out or failed verification and was reclaimed.
    DeviceLost {
        /// Device that went silent.
        device: DeviceId,
        /// Slot that was reclaimed.
        coord: SlotCoord,
    },
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum State {
    Initialize,
    Advertising,
    SoftReboot,
    FaultHandling,
}

struct SlotTable {
    /// Row-major `[subevent][slot]` states.
    slots: Vec<SlotState>,
    /// The currently offered register descriptors, always `num_register_slots` long.
    descriptors: Vec<SlotCoord>,
    /// Replay floor per scanner device, learned in RAM.
    floors: HashMap<u16, u64>,
    /// Preallocated frame backing storage, one buffer per subevent.
    bufs: Vec<Vec<u8>>,
    /// Subevent-0 passes since the counter was last advanced.
    rollover: u32,
}

impl SlotTable {
    fn index(&self, config: &Config, coord: SlotCoord) -> usize {
        usize::from(coord.subevent) * usize::from(config.num_response_slots) + usize::from(coord.slot)
    }
}

/// Linear reservation cursor over the slot population.
struct Cursor {
    next: Option<SlotCoord>,
}

impl Cursor {
    fn new(config: &Config) -> Self {
        // The first register-slot region of subevent 0 is never handed out.
        let next = if config.num_register_slots < config.num_response_slots {
            Some(SlotCoord::new(0, config.num_register_slots))
        } else if config.num_subevents > 1 {
            Some(SlotCoord::new(1, 0))
        } else {
            None
        };
        Self { next }
    }

    fn advance(&mut self, config: &Config) -> Option<SlotCoord> {
        let coord = self.next?;
        self.next = if coord.slot + 1 < config.num_response_slots {
            Some(SlotCoord::new(coord.subevent, coord.slot + 1))
        } else if coord.subevent + 1 < config.num_subevents {
            Some(SlotCoord::new(coord.subevent + 1, 0))
        } else {
            None
        };
        Some(coord)
    }

    fn remaining(&self, config: &Config) -> usize {
        match self.next {
            Some(coord) => {
                let per_subevent = usize::from(config.num_response_slots);
                (usize::from(config.num_subevents) - usize::from(coord.subevent) - 1) * per_subevent
                    + per_subevent
                    - usize::from(coord.slot)
            }
            None => 0,
        }
    }
}

struct Shared {
    config: Config,
    radio: Arc<dyn AdvertiserRadio>,
    keys: Arc<dyn KeyStore>,
    store: Arc<dyn CounterStore>,
    slots: Mutex<SlotTable>,
    cursor: Mutex<Cursor>,
    free_list: FreeList,
    counter: Mutex<ReplayCounter>,
    events: EventCell,
    fault: AtomicU8,
    watchers: Mutex<Vec<mpsc::UnboundedSender<AdvertiserEvent>>>,
    indicator: Mutex<Arc<dyn Indicator>>,
}

impl Shared {
    fn reserve_slot(&self) -> Result<SlotCoord> {
        if let Some(coord) = self.free_list.pop() {
            return Ok(coord);
        }
        let mut cursor = self.cursor.lock().unwrap();
        cursor
            .advance(&self.config)
            .ok_or_else(|| Error::with_message(ErrorKind::Capacity, "slot population exhausted"))
    }

    fn set_fault(&self, reason: FaultReason) {
        self.fault.store(reason as u8, Ordering::Release);
        self.events.post(CONTROL_FAULT);
    }

    fn notify_watchers(&self, event: AdvertiserEvent) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(event).is_ok());
    }

    /// Builds the signed extended-advertising payload for the given counter.
    fn announcement_data(&self, counter: u64) -> Result<Vec<u8>> {
        let announcement =
            Announcement { num_register_slots: self.config.num_register_slots, counter };
        let mut signed = Vec::with_capacity(Announcement::BODY_LEN + wire::TAG_LEN);
        announcement.encode_into(&mut signed);
        wire::sign_message(&mut signed, &*self.keys, ADVERTISER_KEY_ID)?;
        let mut ad = Vec::new();
        wire::encode_adv_data(&signed, &mut ad);
        Ok(ad)
    }

    fn reclaim(&self, table: &mut SlotTable, coord: SlotCoord, device: DeviceId) {
        let idx = table.index(&self.config, coord);
        table.slots[idx] = SlotState::default();
        if let Err(err) = self.free_list.append(coord) {
            log::warn!("{err}");
        }
        self.notify_watchers(AdvertiserEvent::DeviceLost { device, coord });
    }

    /// Assigns the slot behind `descriptor` to `device` and publishes a
    /// fresh reservation in its place.
    fn register(&self, table: &mut SlotTable, descriptor: usize, device: DeviceId) {
        let coord = table.descriptors[descriptor];
        let idx = table.index(&self.config, coord);
        if table.slots[idx].device_id.is_some() {
            // Only reachable once reservation has failed and the descriptor
            // went stale; the engine is already faulting.
            log::warn!("registration of {device} into occupied descriptor {coord} dropped");
            return;
        }
        table.slots[idx] = SlotState { device_id: Some(device), inactive_for: 0 };
        log::info!("device {device} registered into {coord}");
        match self.reserve_slot() {
            Ok(next) => table.descriptors[descriptor] = next,
            Err(err) => {
                log::error!("cannot replace register descriptor {descriptor}: {err}");
                self.set_fault(FaultReason::SlotsExhausted);
            }
        }
        self.notify_watchers(AdvertiserEvent::DeviceRegistered { device, coord });
    }
}

impl AdvertiserHooks for Shared {
    fn data_request(&self, request: &DataRequest) {
        let mut guard = self.slots.lock().unwrap();
        let table = &mut *guard;

        // One increment per cycle, batched here instead of once per frame.
        if table.rollover > 0 {
            self.counter.lock().unwrap().advance(u64::from(table.rollover));
            table.rollover = 0;
        }
        let counter_base = self.counter.lock().unwrap().value();

        let num_slots = usize::from(self.config.num_response_slots);
        let limit = self.config.liveness_limit();
        let count = usize::from(request.count).min(usize::from(self.config.num_subevents));
        let mut served = Vec::with_capacity(count);

        for i in 0..count {
            let subevent =
                ((usize::from(request.start) + i) % usize::from(self.config.num_subevents)) as u8;
            let mut acks = Vec::with_capacity(num_slots);
            for slot in 0..self.config.num_response_slots {
                let coord = SlotCoord::new(subevent, slot);
                let idx = table.index(&self.config, coord);
                let state = &mut table.slots[idx];
                state.inactive_for = state.inactive_for.saturating_add(1);
                if let Some(device) = state.device_id {
                    if state.inactive_for > limit {
                        log::info!("device {device} disconnected, reclaiming {coord}");
                        self.reclaim(table, coord, device);
                    }
                }
                let state = &table.slots[idx];
                acks.push(match state.device_id {
                    Some(device) if state.inactive_for == 1 => device.0,
                    _ => 0,
                });
            }

            let register_slots = if subevent == 0 {
                table.rollover += 1;
                table.descriptors.clone()
            } else {
                Vec::new()
            };

            let frame = SubeventFrame {
                register_slots,
                acks,
                counter: counter_base + u64::from(table.rollover),
            };
            let buf = &mut table.bufs[usize::from(subevent)];
            buf.clear();
            frame.encode_into(buf);
            if let Err(err) = wire::sign_message(buf, &*self.keys, ADVERTISER_KEY_ID) {
                log::error!("cannot sign subevent {subevent}: {err}");
                self.set_fault(FaultReason::CryptoFailure);
                return;
            }
            served.push(subevent);
        }

        let entries: Vec<SubeventEntry> = served
            .iter()
            .map(|&subevent| SubeventEntry {
                subevent,
                response_slot_start: 0,
                response_slot_count: self.config.num_response_slots,
                data: &table.bufs[usize::from(subevent)],
            })
            .collect();
        if let Err(err) = self.radio.set_subevent_data(&entries) {
            // The controller will ask again next cycle.
            log::warn!("failed to set subevent data: {err}");
        } else {
            log::trace!(
                "subevent data set, start {} count {} counter {}",
                request.start,
                served.len(),
                counter_base + u64::from(table.rollover)
            );
        }

        // Keep the announcement fresh so rescanning devices never see a
        // counter below their floor.
        if served.contains(&0) {
            match self.announcement_data(counter_base + u64::from(table.rollover)) {
                Ok(ad) => {
                    if let Err(err) = self.radio.set_adv_data(&ad) {
                        log::warn!("failed to refresh announcement: {err}");
                    }
                }
                Err(err) => {
                    log::error!("cannot sign announcement: {err}");
                    self.set_fault(FaultReason::CryptoFailure);
                }
            }
        }
    }

    fn response(&self, info: &ResponseInfo, data: &[u8]) {
        let coord = SlotCoord::new(info.subevent, info.response_slot);
        let sender = match ResponseFrame::peek_sender(data) {
            Ok(sender) => sender,
            Err(err) => {
                log::warn!("dropping response in {coord}: {err}");
                return;
            }
        };

        let mut guard = self.slots.lock().unwrap();
        let table = &mut *guard;
        let floor = table.floors.entry(sender.0).or_insert(0);
        let body = match wire::verify_message(data, &*self.keys, scanner_key_id(sender), floor) {
            Ok(body) => body,
            Err(err) if err.kind == ErrorKind::CounterMismatch => {
                log::warn!("replayed response from {sender} in {coord}: {err}");
                return;
            }
            Err(err) => {
                log::warn!("unverifiable response claiming {sender} in {coord}: {err}");
                // The occupant's own key failing means the peer state is no
                // longer trustworthy; clear the slot and let it re-register.
                let idx = table.index(&self.config, coord);
                if table.slots[idx].device_id == Some(sender) {
                    self.reclaim(table, coord, sender);
                }
                return;
            }
        };
        let frame = match ResponseFrame::decode(body) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("malformed response in {coord}: {err}");
                return;
            }
        };

        if info.subevent == 0 && info.response_slot < self.config.num_register_slots {
            // Register region: the response slot indexes the descriptor list.
            self.register(table, usize::from(info.response_slot), frame.sender_id);
            return;
        }

        let idx = table.index(&self.config, coord);
        match table.slots[idx].device_id {
            None => match table.descriptors.iter().position(|&d| d == coord) {
                // A scanner responding in its assigned slot before the
                // advertiser saw its registration claims the offer directly.
                Some(descriptor) => self.register(table, descriptor, frame.sender_id),
                None => log::warn!("response from {sender} in unoffered empty slot {coord}"),
            },
            Some(owner) if owner == sender => {
                table.slots[idx].inactive_for = 0;
                log::trace!("data from {sender} in {coord}, counter {}", frame.counter);
            }
            Some(owner) => {
                // The legitimate holder's liveness will time the slot out.
                log::warn!("response from {sender} in {coord} held by {owner}");
            }
        }
    }
}

/// PAwR advertiser.
///
/// Cheaply cloneable handle around the shared engine state.
#[derive(Clone)]
pub struct Advertiser {
    shared: Arc<Shared>,
}

impl Advertiser {
    /// Creates an advertiser over the given radio, key store and counter
    /// store.
    ///
    /// Loads the replay counter (seeding it on first boot) and reserves the
    /// initial register descriptors; the radio itself is only touched by
    /// [`run`](Self::run).
    pub fn new(
        config: Config, radio: Arc<dyn AdvertiserRadio>, keys: Arc<dyn KeyStore>,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        config.validate()?;
        let counter = ReplayCounter::load(&*store, &*keys, COUNTER_UID)?;

        let num_slots = usize::from(config.num_response_slots);
        let frame_capacity = SubeventFrame::body_len(usize::from(config.num_register_slots), num_slots)
            + wire::TAG_LEN;
        let table = SlotTable {
            slots: vec![SlotState::default(); config.total_slots()],
            descriptors: Vec::with_capacity(usize::from(config.num_register_slots)),
            floors: HashMap::new(),
            bufs: (0..config.num_subevents).map(|_| Vec::with_capacity(frame_capacity)).collect(),
            rollover: 0,
        };

        let shared = Arc::new(Shared {
            free_list: FreeList::new(config.max_free_slots),
            cursor: Mutex::new(Cursor::new(&config)),
            slots: Mutex::new(table),
            counter: Mutex::new(counter),
            events: EventCell::new(),
            fault: AtomicU8::new(0),
            watchers: Mutex::new(Vec::new()),
            indicator: Mutex::new(Arc::new(NullIndicator) as Arc<dyn Indicator>),
            config,
            radio,
            keys,
            store,
        });

        for _ in 0..config.num_register_slots {
            let coord = shared.reserve_slot()?;
            shared.slots.lock().unwrap().descriptors.push(coord);
        }

        Ok(Self { shared })
    }

    /// Attaches an indicator LED, lit while the engine is advertising.
    pub fn set_indicator(&self, indicator: Arc<dyn Indicator>) {
        *self.shared.indicator.lock().unwrap() = indicator;
    }

    /// The hook surface to connect to a radio driver.
    ///
    /// [`run`](Self::run) passes this to
    /// [`create_adv_set`](AdvertiserRadio::create_adv_set); it is exposed for
    /// drivers that wire callbacks up-front.
    pub fn hooks(&self) -> Arc<dyn AdvertiserHooks> {
        self.shared.clone()
    }

    /// Control handle for the button and host-side supervision.
    pub fn controls(&self) -> Controls {
        Controls { shared: self.shared.clone() }
    }

    /// Stream of registration and loss events.
    pub fn events(&self) -> impl Stream<Item = AdvertiserEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.watchers.lock().unwrap().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Runs the engine until a reboot is required.
    ///
    /// Commits the replay counter on both exit paths.
    pub async fn run(&self) -> Reboot {
        let mut state = State::Initialize;
        loop {
            log::info!("advertiser entering state {state}");
            state = match state {
                State::Initialize => self.initialize(),
                State::Advertising => self.advertising().await,
                State::SoftReboot => {
                    self.shutdown();
                    return Reboot::Soft;
                }
                State::FaultHandling => {
                    let reason = FaultReason::from_u8(self.shared.fault.load(Ordering::Acquire))
                        .unwrap_or(FaultReason::RadioFailure);
                    log::error!("advertiser rebooting after fault: {reason}");
                    self.shutdown();
                    return Reboot::Fault(reason);
                }
            };
        }
    }

    fn initialize(&self) -> State {
        match self.bring_up() {
            Ok(()) => {
                self.indicate(true);
                State::Advertising
            }
            Err(err) => {
                log::error!("advertiser bring-up failed: {err}");
                let reason = match err.kind {
                    ErrorKind::Crypto | ErrorKind::MacCompute => FaultReason::CryptoFailure,
                    ErrorKind::Storage => FaultReason::StorageFailure,
                    _ => FaultReason::RadioFailure,
                };
                self.shared.fault.store(reason as u8, Ordering::Release);
                State::FaultHandling
            }
        }
    }

    fn bring_up(&self) -> Result<()> {
        let shared = &self.shared;
        shared.radio.enable()?;
        shared.radio.create_adv_set(shared.clone())?;
        shared.radio.set_periodic_params(&PeriodicParams::from_config(&shared.config))?;

        let ad = shared.announcement_data(shared.counter.lock().unwrap().value())?;
        shared.radio.set_adv_data(&ad)?;

        shared.radio.start_periodic()?;
        shared.radio.start_extended()?;
        log::info!("periodic and extended advertising started");
        Ok(())
    }

    async fn advertising(&self) -> State {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), self.shared.events.wait()).await {
                Err(_) => log::info!("still alive"),
                Ok(CONTROL_SOFT_REBOOT) => return State::SoftReboot,
                Ok(_) => return State::FaultHandling,
            }
        }
    }

    fn shutdown(&self) {
        self.indicate(false);
        // Fold the not-yet-batched cycle increment in so the next boot does
        // not reuse a counter value already on the air.
        let pending = {
            let mut table = self.shared.slots.lock().unwrap();
            std::mem::take(&mut table.rollover)
        };
        let mut counter = self.shared.counter.lock().unwrap();
        counter.advance(u64::from(pending));
        if let Err(err) = counter.commit(&*self.shared.store) {
            log::error!("failed to commit replay counter: {err}");
        }
    }

    fn indicate(&self, lit: bool) {
        self.shared.indicator.lock().unwrap().set(lit);
    }

    // Diagnostics below: snapshots for supervision and tests.

    /// State of one slot.
    pub fn slot(&self, coord: SlotCoord) -> SlotState {
        let table = self.shared.slots.lock().unwrap();
        let idx = table.index(&self.shared.config, coord);
        table.slots[idx]
    }

    /// All currently occupied slots.
    pub fn occupied(&self) -> Vec<(SlotCoord, DeviceId)> {
        let table = self.shared.slots.lock().unwrap();
        let num_slots = self.shared.config.num_response_slots;
        table
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, state)| {
                let coord =
                    SlotCoord::new((idx / usize::from(num_slots)) as u8, (idx % usize::from(num_slots)) as u8);
                state.device_id.map(|device| (coord, device))
            })
            .collect()
    }

    /// The currently published register descriptors.
    pub fn register_descriptors(&self) -> Vec<SlotCoord> {
        self.shared.slots.lock().unwrap().descriptors.clone()
    }

    /// Number of coordinates waiting in the free list.
    pub fn free_slots(&self) -> usize {
        self.shared.free_list.len()
    }

    /// Whether the given coordinate waits in the free list.
    pub fn free_contains(&self, coord: SlotCoord) -> bool {
        self.shared.free_list.contains(coord)
    }

    /// Number of coordinates never handed out yet.
    pub fn unreserved_slots(&self) -> usize {
        self.shared.cursor.lock().unwrap().remaining(&self.shared.config)
    }

    /// Current replay counter value.
    pub fn counter(&self) -> u64 {
        self.shared.counter.lock().unwrap().value()
    }
}

/// Control handle of a running [`Advertiser`].
#[derive(Clone)]
pub struct Controls {
    shared: Arc<Shared>,
}

impl Controls {
    /// Requests a graceful reboot; wired to the falling edge of the button.
    ///
    /// Safe to call from interrupt or signal context.
    pub fn soft_reboot(&self) {
        self.shared.events.post(CONTROL_SOFT_REBOOT);
    }

    /// Raises an unrecoverable fault.
    pub fn fault(&self, reason: FaultReason) {
        self.shared.set_fault(reason);
    }
}
