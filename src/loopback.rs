//! In-process loopback radio.
//!
//! Connects one advertiser and any number of scanners without a controller:
//! the air is a mutexed table, a PAwR cycle is an explicit [`step_cycle`]
//! call. Everything a real controller does asynchronously happens here in a
//! deterministic order — sync establishment first, then one data request,
//! then per-subevent delivery and response collection. Two responses landing
//! in the same response slot destroy each other, as they would on air.
//!
//! Intended for integration tests and host-side experiments; the fault
//! injection knobs ([`drop_responses`], [`terminate_sync`]) simulate air loss
//! and supervision timeouts.
//!
//! [`step_cycle`]: LoopbackRadio::step_cycle
//! [`drop_responses`]: LoopbackRadio::drop_responses
//! [`terminate_sync`]: LoopbackRadio::terminate_sync

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::{
    radio::{
        AdvertiserHooks, AdvertiserRadio, DataRequest, PeriodicParams, RecvInfo, ResponseInfo,
        ResponseParams, ScanInfo, ScanParams, ScannerHooks, ScannerRadio, SubeventEntry, SyncInfo,
        SyncParams, TermInfo,
    },
    Address, Error, ErrorKind, Result,
};

struct ScannerLink {
    hooks: Option<Arc<dyn ScannerHooks>>,
    scanning: bool,
    sync_pending: bool,
    synced: bool,
    recv_enabled: bool,
    subevents: Vec<u8>,
    response: Option<(u8, u8, Vec<u8>)>,
}

impl ScannerLink {
    fn new() -> Self {
        Self {
            hooks: None,
            scanning: false,
            sync_pending: false,
            synced: false,
            recv_enabled: false,
            subevents: Vec::new(),
            response: None,
        }
    }
}

struct AirState {
    adv_hooks: Option<Arc<dyn AdvertiserHooks>>,
    params: Option<PeriodicParams>,
    adv_data: Vec<u8>,
    periodic_running: bool,
    extended_running: bool,
    subevent_data: Vec<Option<Vec<u8>>>,
    event_counter: u16,
    scanners: Vec<ScannerLink>,
    drop_responses: u32,
}

struct Air {
    addr: Address,
    sid: u8,
    state: Mutex<AirState>,
}

/// The shared air between one advertiser and its scanners.
#[derive(Clone)]
pub struct LoopbackRadio {
    inner: Arc<Air>,
}

impl LoopbackRadio {
    /// Creates a loopback air for an advertiser with the given identity.
    pub fn new(addr: Address, sid: u8) -> Self {
        Self {
            inner: Arc::new(Air {
                addr,
                sid,
                state: Mutex::new(AirState {
                    adv_hooks: None,
                    params: None,
                    adv_data: Vec::new(),
                    periodic_running: false,
                    extended_running: false,
                    subevent_data: Vec::new(),
                    event_counter: 0,
                    scanners: Vec::new(),
                    drop_responses: 0,
                }),
            }),
        }
    }

    /// The advertiser's end of the air.
    pub fn advertiser_port(&self) -> AdvertiserPort {
        AdvertiserPort { inner: self.inner.clone() }
    }

    /// Attaches a new scanner to the air and returns its end.
    pub fn scanner_port(&self) -> ScannerPort {
        let mut state = self.inner.state.lock().unwrap();
        state.scanners.push(ScannerLink::new());
        ScannerPort { inner: self.inner.clone(), index: state.scanners.len() - 1 }
    }

    /// Delivers the extended advertising data to every scanning scanner.
    pub fn deliver_scan_reports(&self) {
        let (listeners, info, data) = {
            let state = self.inner.state.lock().unwrap();
            if !state.extended_running || state.adv_data.is_empty() {
                return;
            }
            let info = ScanInfo {
                addr: self.inner.addr,
                sid: self.inner.sid,
                interval: state.params.map(|p| p.interval).unwrap_or(0),
            };
            let listeners: Vec<_> =
                state.scanners.iter().filter(|s| s.scanning).filter_map(|s| s.hooks.clone()).collect();
            (listeners, info, state.adv_data.clone())
        };
        for hooks in listeners {
            hooks.scan_report(&info, &data);
        }
    }

    /// Runs one full PAwR cycle.
    ///
    /// Establishes pending syncs, asks the advertiser for all subevents, then
    /// delivers each subevent to its listeners and their surviving responses
    /// back to the advertiser.
    pub fn step_cycle(&self) {
        self.establish_syncs();

        let (adv_hooks, num_subevents, event_counter) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.periodic_running {
                return;
            }
            let Some(hooks) = state.adv_hooks.clone() else { return };
            let Some(params) = state.params else { return };
            state.event_counter = state.event_counter.wrapping_add(1);
            for entry in &mut state.subevent_data {
                *entry = None;
            }
            (hooks, params.num_subevents, state.event_counter)
        };

        adv_hooks.data_request(&DataRequest { start: 0, count: num_subevents });

        for subevent in 0..num_subevents {
            let frame = {
                let state = self.inner.state.lock().unwrap();
                state.subevent_data.get(usize::from(subevent)).cloned().flatten()
            };
            let Some(frame) = frame else { continue };

            let listeners: Vec<_> = {
                let state = self.inner.state.lock().unwrap();
                state
                    .scanners
                    .iter()
                    .filter(|s| s.synced && s.recv_enabled && s.subevents.contains(&subevent))
                    .filter_map(|s| s.hooks.clone())
                    .collect()
            };
            let info = RecvInfo { periodic_event_counter: event_counter, subevent };
            for hooks in listeners {
                hooks.received(&info, &frame);
            }

            // Collect this subevent's responses; same-slot transmissions
            // garble each other.
            let mut by_slot: HashMap<u8, Vec<Vec<u8>>> = HashMap::new();
            {
                let mut state = self.inner.state.lock().unwrap();
                for link in &mut state.scanners {
                    if let Some((se, slot, bytes)) = link.response.take() {
                        if se == subevent {
                            by_slot.entry(slot).or_default().push(bytes);
                        } else {
                            link.response = Some((se, slot, bytes));
                        }
                    }
                }
            }
            let mut slots: Vec<_> = by_slot.into_iter().collect();
            slots.sort_by_key(|&(slot, _)| slot);
            for (slot, mut frames) in slots {
                if frames.len() > 1 {
                    log::debug!("air collision in subevent {subevent}, slot {slot}");
                    continue;
                }
                let dropped = {
                    let mut state = self.inner.state.lock().unwrap();
                    if state.drop_responses > 0 {
                        state.drop_responses -= 1;
                        true
                    } else {
                        false
                    }
                };
                if dropped {
                    log::debug!("dropping response in subevent {subevent}, slot {slot}");
                    continue;
                }
                adv_hooks
                    .response(&ResponseInfo { subevent, response_slot: slot }, &frames.pop().unwrap());
            }
        }

        // Whatever was queued for a subevent that never aired is gone.
        let mut state = self.inner.state.lock().unwrap();
        for link in &mut state.scanners {
            link.response = None;
        }
    }

    /// Drops the next `n` otherwise deliverable responses, simulating air loss.
    pub fn drop_responses(&self, n: u32) {
        self.inner.state.lock().unwrap().drop_responses = n;
    }

    /// Tears down a scanner's sync with the given controller reason code.
    pub fn terminate_sync(&self, port: &ScannerPort, reason: u8) {
        let hooks = {
            let mut state = self.inner.state.lock().unwrap();
            let link = &mut state.scanners[port.index];
            if !link.synced && !link.sync_pending {
                None
            } else {
                link.synced = false;
                link.sync_pending = false;
                link.hooks.clone()
            }
        };
        if let Some(hooks) = hooks {
            hooks.terminated(&TermInfo { addr: self.inner.addr, reason });
        }
    }

    /// Drives scan delivery and cycles on a timer until the handle is dropped.
    pub fn spawn(&self, period: Duration) -> LoopbackHandle {
        let air = self.clone();
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                timer.tick().await;
                air.deliver_scan_reports();
                air.step_cycle();
            }
        });
        LoopbackHandle { task }
    }

    fn establish_syncs(&self) {
        let established: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            let num_subevents = state.params.map(|p| p.num_subevents).unwrap_or(0);
            let addr = self.inner.addr;
            state
                .scanners
                .iter_mut()
                .filter(|link| link.sync_pending)
                .filter_map(|link| {
                    link.sync_pending = false;
                    link.synced = true;
                    link.hooks.clone().map(|hooks| (hooks, SyncInfo { addr, num_subevents }))
                })
                .collect()
        };
        for (hooks, info) in established {
            hooks.synced(&info);
        }
    }
}

/// Handle of a timer-driven loopback; dropping it stops the timer.
pub struct LoopbackHandle {
    task: JoinHandle<()>,
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Advertiser's end of a [`LoopbackRadio`].
#[derive(Clone)]
pub struct AdvertiserPort {
    inner: Arc<Air>,
}

impl AdvertiserRadio for AdvertiserPort {
    fn enable(&self) -> Result<()> {
        Ok(())
    }

    fn create_adv_set(&self, hooks: Arc<dyn AdvertiserHooks>) -> Result<()> {
        self.inner.state.lock().unwrap().adv_hooks = Some(hooks);
        Ok(())
    }

    fn set_periodic_params(&self, params: &PeriodicParams) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.subevent_data = (0..params.num_subevents).map(|_| None).collect();
        state.params = Some(*params);
        Ok(())
    }

    fn set_adv_data(&self, data: &[u8]) -> Result<()> {
        self.inner.state.lock().unwrap().adv_data = data.to_vec();
        Ok(())
    }

    fn start_periodic(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.params.is_none() {
            return Err(Error::with_message(ErrorKind::Radio, "periodic parameters not set"));
        }
        state.periodic_running = true;
        Ok(())
    }

    fn start_extended(&self) -> Result<()> {
        self.inner.state.lock().unwrap().extended_running = true;
        Ok(())
    }

    fn set_subevent_data(&self, entries: &[SubeventEntry<'_>]) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        for entry in entries {
            let slot = state
                .subevent_data
                .get_mut(usize::from(entry.subevent))
                .ok_or_else(|| Error::with_message(ErrorKind::Radio, "subevent out of range"))?;
            *slot = Some(entry.data.to_vec());
        }
        Ok(())
    }
}

/// One scanner's end of a [`LoopbackRadio`].
#[derive(Clone)]
pub struct ScannerPort {
    inner: Arc<Air>,
    index: usize,
}

impl ScannerPort {
    fn link<R>(&self, f: impl FnOnce(&mut ScannerLink) -> R) -> R {
        let mut state = self.inner.state.lock().unwrap();
        f(&mut state.scanners[self.index])
    }

    /// Whether this scanner is currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.link(|link| link.scanning)
    }

    /// Whether this scanner holds an established sync.
    pub fn is_synced(&self) -> bool {
        self.link(|link| link.synced)
    }

    /// Whether frame reception is enabled.
    pub fn is_receiving(&self) -> bool {
        self.link(|link| link.recv_enabled)
    }
}

impl ScannerRadio for ScannerPort {
    fn enable(&self) -> Result<()> {
        Ok(())
    }

    fn start_scan(&self, _params: &ScanParams, hooks: Arc<dyn ScannerHooks>) -> Result<()> {
        self.link(|link| {
            link.hooks = Some(hooks);
            link.scanning = true;
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        self.link(|link| link.scanning = false);
        Ok(())
    }

    fn create_sync(&self, params: &SyncParams) -> Result<()> {
        if params.addr != self.inner.addr || params.sid != self.inner.sid {
            return Err(Error::with_message(ErrorKind::Radio, "no such periodic train"));
        }
        self.link(|link| link.sync_pending = true);
        Ok(())
    }

    fn sync_subevents(&self, subevents: &[u8]) -> Result<()> {
        self.link(|link| link.subevents = subevents.to_vec());
        Ok(())
    }

    fn recv_enable(&self) -> Result<()> {
        self.link(|link| link.recv_enabled = true);
        Ok(())
    }

    fn recv_disable(&self) -> Result<()> {
        self.link(|link| link.recv_enabled = false);
        Ok(())
    }

    fn delete_sync(&self) -> Result<()> {
        // A locally deleted sync ends without a termination upcall.
        self.link(|link| {
            link.synced = false;
            link.sync_pending = false;
        });
        Ok(())
    }

    fn set_response_data(&self, params: &ResponseParams, data: &[u8]) -> Result<()> {
        self.link(|link| {
            if !link.synced {
                return Err(Error::with_message(ErrorKind::Radio, "not synced"));
            }
            link.response = Some((params.response_subevent, params.response_slot, data.to_vec()));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CollectingAdvertiser {
        requests: AtomicUsize,
        responses: Mutex<Vec<(ResponseInfo, Vec<u8>)>>,
    }

    struct AdvertiserDriver {
        hooks: Arc<CollectingAdvertiser>,
        port: AdvertiserPort,
    }

    impl AdvertiserHooks for CollectingAdvertiser {
        fn data_request(&self, _request: &DataRequest) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn response(&self, info: &ResponseInfo, data: &[u8]) {
            self.responses.lock().unwrap().push((*info, data.to_vec()));
        }
    }

    #[derive(Default)]
    struct CollectingScanner {
        received: Mutex<Vec<(RecvInfo, Vec<u8>)>>,
        respond_in: Mutex<Option<(u8, u8, Vec<u8>)>>,
        port: Mutex<Option<ScannerPort>>,
    }

    impl ScannerHooks for CollectingScanner {
        fn scan_report(&self, _info: &ScanInfo, _data: &[u8]) {}
        fn synced(&self, _info: &SyncInfo) {}
        fn terminated(&self, _info: &TermInfo) {}

        fn received(&self, info: &RecvInfo, data: &[u8]) {
            self.received.lock().unwrap().push((*info, data.to_vec()));
            if let Some((subevent, slot, bytes)) = self.respond_in.lock().unwrap().clone() {
                if subevent == info.subevent {
                    let params = ResponseParams {
                        request_event: info.periodic_event_counter,
                        request_subevent: info.subevent,
                        response_subevent: subevent,
                        response_slot: slot,
                    };
                    let port = self.port.lock().unwrap();
                    port.as_ref().unwrap().set_response_data(&params, &bytes).unwrap();
                }
            }
        }
    }

    fn advertiser(air: &LoopbackRadio) -> AdvertiserDriver {
        let hooks = Arc::new(CollectingAdvertiser::default());
        let port = air.advertiser_port();
        port.enable().unwrap();
        port.create_adv_set(hooks.clone()).unwrap();
        let params = PeriodicParams {
            interval: 2000,
            num_subevents: 4,
            subevent_interval: 43,
            response_slot_delay: 24,
            response_slot_spacing: 2,
            num_response_slots: 4,
        };
        port.set_periodic_params(&params).unwrap();
        port.set_adv_data(&[2, 0x01, 0x06]).unwrap();
        port.start_periodic().unwrap();
        port.start_extended().unwrap();
        AdvertiserDriver { hooks, port }
    }

    fn scanner(air: &LoopbackRadio, subevent: u8) -> Arc<CollectingScanner> {
        let hooks = Arc::new(CollectingScanner::default());
        let port = air.scanner_port();
        port.start_scan(&ScanParams::default(), hooks.clone()).unwrap();
        port.create_sync(&SyncParams { addr: air.inner.addr, sid: air.inner.sid, skip: 1, timeout: 100 })
            .unwrap();
        port.sync_subevents(&[subevent]).unwrap();
        port.recv_enable().unwrap();
        *hooks.port.lock().unwrap() = Some(port);
        hooks
    }

    fn air() -> LoopbackRadio {
        LoopbackRadio::new(Address::new([0xc0, 0, 0, 0, 0, 1]), 1)
    }

    #[test]
    fn frames_reach_only_the_synced_subevent() {
        let air = air();
        let adv = advertiser(&air);
        let sc = scanner(&air, 2);
        air.establish_syncs();

        struct Feeder(AdvertiserPort);
        impl AdvertiserHooks for Feeder {
            fn data_request(&self, _request: &DataRequest) {
                self.0
                    .set_subevent_data(&[
                        SubeventEntry {
                            subevent: 0,
                            response_slot_start: 0,
                            response_slot_count: 4,
                            data: &[0x00],
                        },
                        SubeventEntry {
                            subevent: 2,
                            response_slot_start: 0,
                            response_slot_count: 4,
                            data: &[0xd0, 0x0d],
                        },
                        SubeventEntry {
                            subevent: 3,
                            response_slot_start: 0,
                            response_slot_count: 4,
                            data: &[0x03],
                        },
                    ])
                    .unwrap();
            }
            fn response(&self, _info: &ResponseInfo, _data: &[u8]) {}
        }
        adv.port.create_adv_set(Arc::new(Feeder(adv.port.clone()))).unwrap();

        air.step_cycle();
        let received = sc.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.subevent, 2);
        assert_eq!(received[0].1, vec![0xd0, 0x0d]);
    }

    #[test]
    fn responses_flow_back_to_the_advertiser() {
        let air = air();
        let adv = advertiser(&air);
        let sc = scanner(&air, 1);
        air.establish_syncs();
        *sc.respond_in.lock().unwrap() = Some((1, 3, vec![0x11, 0x22]));

        // An advertiser that always submits data for subevent 1.
        struct Feeder {
            port: AdvertiserPort,
            collect: Arc<CollectingAdvertiser>,
        }
        impl AdvertiserHooks for Feeder {
            fn data_request(&self, request: &DataRequest) {
                self.collect.data_request(request);
                self.port
                    .set_subevent_data(&[SubeventEntry {
                        subevent: 1,
                        response_slot_start: 0,
                        response_slot_count: 4,
                        data: &[0x01],
                    }])
                    .unwrap();
            }
            fn response(&self, info: &ResponseInfo, data: &[u8]) {
                self.collect.response(info, data);
            }
        }
        let feeder =
            Arc::new(Feeder { port: adv.port.clone(), collect: adv.hooks.clone() });
        adv.port.create_adv_set(feeder).unwrap();

        air.step_cycle();
        let responses = adv.hooks.responses.lock().unwrap().clone();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, ResponseInfo { subevent: 1, response_slot: 3 });
        assert_eq!(responses[0].1, vec![0x11, 0x22]);
        assert_eq!(adv.hooks.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_slot_responses_collide_and_vanish() {
        let air = air();
        let adv = advertiser(&air);
        let a = scanner(&air, 0);
        let b = scanner(&air, 0);
        air.establish_syncs();
        *a.respond_in.lock().unwrap() = Some((0, 1, vec![0xaa]));
        *b.respond_in.lock().unwrap() = Some((0, 1, vec![0xbb]));

        struct Feeder(AdvertiserPort);
        impl AdvertiserHooks for Feeder {
            fn data_request(&self, _request: &DataRequest) {
                self.0
                    .set_subevent_data(&[SubeventEntry {
                        subevent: 0,
                        response_slot_start: 0,
                        response_slot_count: 4,
                        data: &[0x00],
                    }])
                    .unwrap();
            }
            fn response(&self, _info: &ResponseInfo, _data: &[u8]) {
                panic!("collided responses must not be delivered");
            }
        }
        adv.port.create_adv_set(Arc::new(Feeder(adv.port.clone()))).unwrap();
        air.step_cycle();
        // Both scanners heard the frame, the advertiser heard nothing.
        assert_eq!(a.received.lock().unwrap().len(), 1);
        assert_eq!(b.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn distinct_slots_do_not_collide() {
        let air = air();
        let adv = advertiser(&air);
        let a = scanner(&air, 0);
        let b = scanner(&air, 0);
        air.establish_syncs();
        *a.respond_in.lock().unwrap() = Some((0, 1, vec![0xaa]));
        *b.respond_in.lock().unwrap() = Some((0, 2, vec![0xbb]));

        struct Feeder {
            port: AdvertiserPort,
            collect: Arc<CollectingAdvertiser>,
        }
        impl AdvertiserHooks for Feeder {
            fn data_request(&self, _request: &DataRequest) {
                self.port
                    .set_subevent_data(&[SubeventEntry {
                        subevent: 0,
                        response_slot_start: 0,
                        response_slot_count: 4,
                        data: &[0x00],
                    }])
                    .unwrap();
            }
            fn response(&self, info: &ResponseInfo, data: &[u8]) {
                self.collect.response(info, data);
            }
        }
        adv.port
            .create_adv_set(Arc::new(Feeder { port: adv.port.clone(), collect: adv.hooks.clone() }))
            .unwrap();
        air.step_cycle();
        let responses = adv.hooks.responses.lock().unwrap().clone();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].1, vec![0xaa]);
        assert_eq!(responses[1].1, vec![0xbb]);
    }

    #[test]
    fn dropped_responses_are_counted_down() {
        let air = air();
        let adv = advertiser(&air);
        let sc = scanner(&air, 0);
        air.establish_syncs();
        *sc.respond_in.lock().unwrap() = Some((0, 1, vec![0xaa]));
        air.drop_responses(1);

        struct Feeder {
            port: AdvertiserPort,
            collect: Arc<CollectingAdvertiser>,
        }
        impl AdvertiserHooks for Feeder {
            fn data_request(&self, _request: &DataRequest) {
                self.port
                    .set_subevent_data(&[SubeventEntry {
                        subevent: 0,
                        response_slot_start: 0,
                        response_slot_count: 4,
                        data: &[0x00],
                    }])
                    .unwrap();
            }
            fn response(&self, info: &ResponseInfo, data: &[u8]) {
                self.collect.response(info, data);
            }
        }
        adv.port
            .create_adv_set(Arc::new(Feeder { port: adv.port.clone(), collect: adv.hooks.clone() }))
            .unwrap();

        air.step_cycle();
        assert!(adv.hooks.responses.lock().unwrap().is_empty());
        air.step_cycle();
        assert_eq!(adv.hooks.responses.lock().unwrap().len(), 1);
    }

    #[test]
    fn sync_to_an_unknown_train_is_rejected() {
        let air = air();
        let port = air.scanner_port();
        let err = port
            .create_sync(&SyncParams { addr: Address::any(), sid: 9, skip: 1, timeout: 100 })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Radio);
    }

    #[test]
    fn responses_without_a_sync_are_rejected() {
        let air = air();
        let _adv = advertiser(&air);
        let port = air.scanner_port();
        let params = ResponseParams {
            request_event: 0,
            request_subevent: 0,
            response_subevent: 0,
            response_slot: 0,
        };
        assert_eq!(port.set_response_data(&params, &[0x00]).unwrap_err().kind, ErrorKind::Radio);
    }
}
