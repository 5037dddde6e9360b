//! The cast manager: reconciles discovery events into a device table, owns
//! control channels on demand and fans all channel events into one stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::channel::{self, CastChannel, ChannelStream};
use crate::config::CastConfig;
use crate::device::{CastDevice, Family};
use crate::discovery::{DiscoveryEvent, DiscoveryEventKind, DiscoverySource};
use crate::error::CastError;
use crate::event::{CastEvent, ChannelEvent};

const EVENT_QUEUE_CAPACITY: usize = 256;
const LOOKUP_INITIAL_DELAY: Duration = Duration::from_millis(100);
const LOOKUP_DEADLINE: Duration = Duration::from_secs(1);
const IDLE_LOOP_SLEEP: Duration = Duration::from_millis(25);

struct ManagerInner {
    discovery: Arc<dyn DiscoverySource>,
    service_type: String,
    connect_timeout: Duration,
    lookup_interval: Duration,
    devices: Mutex<HashMap<String, CastDevice>>,
    channels: Mutex<HashMap<u64, (CastChannel, CastDevice)>>,
    events: Mutex<Option<broadcast::Sender<CastEvent>>>,
    fanouts: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: AtomicBool,
    closed: AtomicBool,
}

/// Discovers cast devices through a [`DiscoverySource`] and publishes device
/// and channel events on a single stream.
///
/// Cheap to clone; all clones share one device table, channel table and
/// publisher. Background work runs on two threads (periodic lookup kicks and
/// discovery-event reconciliation) plus one fan-out thread per open channel.
#[derive(Clone)]
pub struct CastManager {
    inner: Arc<ManagerInner>,
}

impl CastManager {
    pub fn new(discovery: Arc<dyn DiscoverySource>, config: &CastConfig) -> CastManager {
        let (events, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        let inner = Arc::new(ManagerInner {
            discovery,
            service_type: config.service_type.clone(),
            connect_timeout: config.connect_timeout(),
            lookup_interval: config.lookup_interval(),
            devices: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            events: Mutex::new(Some(events)),
            fanouts: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let manager = CastManager { inner };

        // Subscribe before the tasks start so no discovery event is missed.
        let subscription = manager.inner.discovery.subscribe();
        let watch_inner = Arc::clone(&manager.inner);
        let watch = thread::spawn(move || run_watch(watch_inner, subscription));
        let lookup_inner = Arc::clone(&manager.inner);
        let lookup = thread::spawn(move || run_lookup(lookup_inner));
        lock(&manager.inner.tasks).extend([watch, lookup]);

        manager
    }

    /// Snapshot of the current device table.
    pub fn devices(&self) -> Vec<CastDevice> {
        lock(&self.inner.devices).values().cloned().collect()
    }

    /// Number of open channels.
    pub fn channels(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CastEvent> {
        match lock(&self.inner.events).as_ref() {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Opens a control channel to `device`, resolving an address by family
    /// preference. `timeout` falls back to the configured connect timeout.
    /// Fails with [`CastError::NotFound`] when the device expired while
    /// dialling.
    pub fn connect(
        &self,
        device: &CastDevice,
        family: Family,
        any: bool,
        timeout: Option<Duration>,
    ) -> Result<CastChannel, CastError> {
        if self.inner.closed.load(Ordering::Acquire) || device.id().is_empty() {
            return Err(CastError::BadParam);
        }
        let ip = device.addr(family, any)?;
        let timeout = timeout.unwrap_or(self.inner.connect_timeout);
        let stream = channel::dial(ip, device.port(), timeout)?;
        let remote_addr = SocketAddr::new(ip, device.port()).to_string();
        self.attach(device, stream, remote_addr)
    }

    /// Registers an established stream as a channel for `device`: verifies
    /// the device is still in the table, inserts the channel, spawns the
    /// event fan-out and starts the protocol.
    pub(crate) fn attach(
        &self,
        device: &CastDevice,
        stream: Box<dyn ChannelStream>,
        remote_addr: String,
    ) -> Result<CastChannel, CastError> {
        let channel = CastChannel::from_stream(stream, remote_addr);
        if !lock(&self.inner.devices).contains_key(device.id()) {
            let _ = channel.close();
            return Err(CastError::NotFound);
        }
        lock(&self.inner.channels).insert(channel.id(), (channel.clone(), device.clone()));

        let subscription = channel.subscribe();
        let fanout_inner = Arc::clone(&self.inner);
        let fanout_device = device.clone();
        let fanout_remote = channel.remote_addr().to_string();
        let handle =
            thread::spawn(move || run_fanout(fanout_inner, fanout_device, fanout_remote, subscription));
        lock(&self.inner.fanouts).push(handle);

        if let Err(err) = channel.start() {
            lock(&self.inner.channels).remove(&channel.id());
            let _ = channel.close();
            return Err(err);
        }
        Ok(channel)
    }

    /// Removes the channel from the table and closes it. The channel's
    /// `Disconnect` is the final event observed for it.
    pub fn disconnect(&self, channel: &CastChannel) -> Result<(), CastError> {
        if lock(&self.inner.channels).remove(&channel.id()).is_none() {
            return Err(CastError::NotFound);
        }
        channel.close()
    }

    /// Closes every channel, drains the fan-out threads, stops background
    /// tasks and closes the publisher. Failures are collected, never
    /// short-circuited.
    pub fn close(&self) -> Result<(), CastError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("CastManager: closing");
        let mut errors = Vec::new();

        let channels: Vec<CastChannel> = {
            let mut table = lock(&self.inner.channels);
            table.drain().map(|(_, (channel, _))| channel).collect()
        };
        for channel in channels {
            if let Err(err) = channel.close() {
                errors.push(err);
            }
        }

        let fanouts: Vec<JoinHandle<()>> = lock(&self.inner.fanouts).drain(..).collect();
        for handle in fanouts {
            let _ = handle.join();
        }

        self.inner.stop.store(true, Ordering::Release);
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for handle in tasks {
            let _ = handle.join();
        }

        lock(&self.inner.events).take();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CastError::Shutdown(errors))
        }
    }
}

impl ManagerInner {
    fn emit(&self, event: CastEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    /// Applies one discovery event to the device table. Identical snapshots
    /// are deduplicated; expiry of an unknown device is a no-op.
    fn reconcile(&self, event: DiscoveryEvent) {
        if event.record.service() != self.service_type {
            return;
        }
        let device = CastDevice::new(event.record);
        if device.id().is_empty() {
            return;
        }
        match event.kind {
            DiscoveryEventKind::Expired => {
                let removed = lock(&self.devices).remove(device.id());
                if let Some(known) = removed {
                    debug!("CastManager: device {} expired", known.id());
                    self.emit(CastEvent::DeviceRemoved { device: known });
                }
            }
            DiscoveryEventKind::Added | DiscoveryEventKind::Updated => {
                let mut table = lock(&self.devices);
                match table.get(device.id()) {
                    None => {
                        table.insert(device.id().to_string(), device.clone());
                        drop(table);
                        debug!("CastManager: device {} added", device.id());
                        self.emit(CastEvent::DeviceAdded { device });
                    }
                    Some(known) if known != &device => {
                        table.insert(device.id().to_string(), device.clone());
                        drop(table);
                        debug!("CastManager: device {} updated", device.id());
                        self.emit(CastEvent::DeviceUpdated { device });
                    }
                    Some(_) => {}
                }
            }
        }
    }
}

fn run_watch(inner: Arc<ManagerInner>, mut subscription: broadcast::Receiver<DiscoveryEvent>) {
    debug!("CastManager: watch task started");
    while !inner.stop.load(Ordering::Acquire) {
        match subscription.try_recv() {
            Ok(event) => inner.reconcile(event),
            Err(TryRecvError::Empty) => thread::sleep(IDLE_LOOP_SLEEP),
            Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("CastManager: discovery stream lagged by {skipped} events");
            }
        }
    }
    debug!("CastManager: watch task stopped");
}

fn run_lookup(inner: Arc<ManagerInner>) {
    debug!("CastManager: lookup task started");
    let mut next_lookup = Instant::now() + LOOKUP_INITIAL_DELAY;
    while !inner.stop.load(Ordering::Acquire) {
        if Instant::now() >= next_lookup {
            if let Err(err) = inner.discovery.lookup(LOOKUP_DEADLINE, &inner.service_type) {
                warn!("CastManager: lookup failed: {err}");
            }
            next_lookup = Instant::now() + inner.lookup_interval;
        }
        thread::sleep(IDLE_LOOP_SLEEP);
    }
    debug!("CastManager: lookup task stopped");
}

/// Forwards one channel's events onto the manager stream, stamped with the
/// originating device. Terminates after forwarding the terminal disconnect.
fn run_fanout(
    inner: Arc<ManagerInner>,
    device: CastDevice,
    remote_addr: String,
    mut subscription: broadcast::Receiver<ChannelEvent>,
) {
    loop {
        match subscription.blocking_recv() {
            Ok(event) => {
                let last = matches!(event, ChannelEvent::Disconnect);
                inner.emit(CastEvent::from_channel(&device, &remote_addr, event));
                if last {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    "CastManager: channel stream for {} lagged by {skipped} events",
                    device.id()
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("CastManager: fan-out for {} finished", device.id());
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use tokio::sync::broadcast;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::CastManager;
    use crate::codec::{self, CastMessage};
    use crate::config::CastConfig;
    use crate::device::{CastDevice, Family};
    use crate::discovery::{
        DiscoveryEvent, DiscoveryEventKind, DiscoverySource, ServiceRecord,
    };
    use crate::error::CastError;
    use crate::event::{CastEvent, EventKind};

    const EVENT_WAIT: Duration = Duration::from_secs(3);

    struct FakeDiscovery {
        events: broadcast::Sender<DiscoveryEvent>,
        lookups: AtomicU32,
    }

    impl FakeDiscovery {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                events,
                lookups: AtomicU32::new(0),
            })
        }

        fn publish(&self, kind: DiscoveryEventKind, record: ServiceRecord) {
            let _ = self.events.send(DiscoveryEvent { kind, record });
        }

        fn lookups(&self) -> u32 {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    impl DiscoverySource for FakeDiscovery {
        fn lookup(&self, _deadline: Duration, _service_type: &str) -> Result<(), CastError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
            self.events.subscribe()
        }
    }

    fn record(txt: &[&str]) -> ServiceRecord {
        ServiceRecord::new(
            "fake-host".to_string(),
            "_googlecast._tcp".to_string(),
            8009,
            txt.iter().map(|entry| entry.to_string()).collect(),
            vec![Ipv4Addr::LOCALHOST],
            Vec::new(),
        )
    }

    fn recv_event(
        events: &mut broadcast::Receiver<CastEvent>,
        wait: Duration,
    ) -> Option<CastEvent> {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            match events.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
        None
    }

    #[test]
    fn test_add_identical_update_expire_sequence() {
        let discovery = FakeDiscovery::new();
        let manager = CastManager::new(discovery.clone(), &CastConfig::default());
        let mut events = manager.subscribe();
        let snapshot = record(&["id=A", "fn=Kitchen", "md=Chromecast", "rs=", "st=1"]);

        discovery.publish(DiscoveryEventKind::Added, snapshot.clone());
        match recv_event(&mut events, EVENT_WAIT) {
            Some(CastEvent::DeviceAdded { device }) => {
                assert_eq!(device.id(), "A");
                assert_eq!(device.name(), "Kitchen");
            }
            other => panic!("expected DeviceAdded, got {:?}", other.map(|e| e.kind())),
        }
        assert_eq!(manager.devices().len(), 1);

        // An identical snapshot is deduplicated.
        discovery.publish(DiscoveryEventKind::Updated, snapshot.clone());
        assert!(recv_event(&mut events, Duration::from_millis(300)).is_none());

        discovery.publish(DiscoveryEventKind::Expired, snapshot);
        match recv_event(&mut events, EVENT_WAIT) {
            Some(CastEvent::DeviceRemoved { device }) => assert_eq!(device.id(), "A"),
            other => panic!("expected DeviceRemoved, got {:?}", other.map(|e| e.kind())),
        }
        assert!(manager.devices().is_empty());

        // Expiring an unknown device is a no-op.
        discovery.publish(DiscoveryEventKind::Expired, record(&["id=Z"]));
        assert!(recv_event(&mut events, Duration::from_millis(300)).is_none());

        manager.close().expect("close");
    }

    #[test]
    fn test_changed_snapshot_emits_device_updated() {
        let discovery = FakeDiscovery::new();
        let manager = CastManager::new(discovery.clone(), &CastConfig::default());
        let mut events = manager.subscribe();

        discovery.publish(DiscoveryEventKind::Added, record(&["id=B", "fn=Old"]));
        match recv_event(&mut events, EVENT_WAIT) {
            Some(CastEvent::DeviceAdded { device }) => assert_eq!(device.name(), "Old"),
            other => panic!("expected DeviceAdded, got {:?}", other.map(|e| e.kind())),
        }

        discovery.publish(DiscoveryEventKind::Updated, record(&["id=B", "fn=New"]));
        match recv_event(&mut events, EVENT_WAIT) {
            Some(CastEvent::DeviceUpdated { device }) => assert_eq!(device.name(), "New"),
            other => panic!("expected DeviceUpdated, got {:?}", other.map(|e| e.kind())),
        }

        manager.close().expect("close");
    }

    #[test]
    fn test_records_without_id_or_other_services_are_ignored() {
        let discovery = FakeDiscovery::new();
        let manager = CastManager::new(discovery.clone(), &CastConfig::default());
        let mut events = manager.subscribe();

        discovery.publish(DiscoveryEventKind::Added, record(&["fn=NoId"]));
        let other_service = ServiceRecord::new(
            "printer".to_string(),
            "_ipp._tcp".to_string(),
            631,
            vec!["id=P".to_string()],
            vec![Ipv4Addr::LOCALHOST],
            Vec::new(),
        );
        discovery.publish(DiscoveryEventKind::Added, other_service);
        assert!(recv_event(&mut events, Duration::from_millis(300)).is_none());
        assert!(manager.devices().is_empty());

        manager.close().expect("close");
    }

    #[test]
    fn test_lookup_is_kicked_shortly_after_start() {
        let discovery = FakeDiscovery::new();
        let manager = CastManager::new(discovery.clone(), &CastConfig::default());
        let deadline = Instant::now() + Duration::from_secs(2);
        while discovery.lookups() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(discovery.lookups() >= 1);
        manager.close().expect("close");
    }

    #[test]
    fn test_connect_rejects_devices_without_id() {
        let discovery = FakeDiscovery::new();
        let manager = CastManager::new(discovery.clone(), &CastConfig::default());
        let device = CastDevice::new(record(&["fn=NoId"]));
        assert!(matches!(
            manager.connect(&device, Family::Both, false, None),
            Err(CastError::BadParam)
        ));
        manager.close().expect("close");
    }

    #[test]
    fn test_attach_fails_for_unknown_device() {
        let discovery = FakeDiscovery::new();
        let manager = CastManager::new(discovery.clone(), &CastConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let stream = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let device = CastDevice::new(record(&["id=ghost"]));
        assert!(matches!(
            manager.attach(&device, Box::new(stream), "127.0.0.1:8009".to_string()),
            Err(CastError::NotFound)
        ));
        assert_eq!(manager.channels(), 0);

        manager.close().expect("close");
    }

    #[test]
    fn test_disconnect_symmetry() {
        let discovery = FakeDiscovery::new();
        let manager = CastManager::new(discovery.clone(), &CastConfig::default());
        let mut events = manager.subscribe();

        discovery.publish(
            DiscoveryEventKind::Added,
            record(&["id=B", "fn=Lounge", "md=Chromecast"]),
        );
        assert!(matches!(
            recv_event(&mut events, EVENT_WAIT),
            Some(CastEvent::DeviceAdded { .. })
        ));
        let device = manager.devices().pop().expect("device");

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (mut server, _) = listener.accept().expect("accept");
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");

        let fake = thread::spawn(move || {
            // Read until the virtual-connection CLOSE shows up; the status
            // poll may interleave.
            loop {
                let body = codec::read_frame_from(&mut server)
                    .expect("read")
                    .expect("frame");
                let msg: CastMessage = codec::decode_message(&body).expect("decode");
                if msg.namespace == crate::channel::NS_CONNECTION {
                    let payload: serde_json::Value =
                        serde_json::from_str(&msg.payload).expect("json");
                    if payload["type"] == "CLOSE" {
                        return msg;
                    }
                }
            }
        });

        let channel = manager
            .attach(&device, Box::new(client), "127.0.0.1:8009".to_string())
            .expect("attach");
        assert_eq!(manager.channels(), 1);
        match recv_event(&mut events, EVENT_WAIT) {
            Some(CastEvent::ChannelConnect { device, .. }) => assert_eq!(device.id(), "B"),
            other => panic!("expected ChannelConnect, got {:?}", other.map(|e| e.kind())),
        }

        manager.disconnect(&channel).expect("disconnect");
        let close_frame = fake.join().expect("fake device");
        assert_eq!(close_frame.destination_id, crate::channel::DEFAULT_RECEIVER);

        match recv_event(&mut events, EVENT_WAIT) {
            Some(CastEvent::ChannelDisconnect { device, .. }) => assert_eq!(device.id(), "B"),
            other => {
                panic!("expected ChannelDisconnect, got {:?}", other.map(|e| e.kind()))
            }
        }
        assert!(recv_event(&mut events, Duration::from_millis(300)).is_none());
        assert_eq!(manager.channels(), 0);

        // A second disconnect finds no table entry.
        assert!(matches!(
            manager.disconnect(&channel),
            Err(CastError::NotFound)
        ));

        manager.close().expect("close");
    }

    #[test]
    fn test_device_events_bracket_channel_events() {
        let discovery = FakeDiscovery::new();
        let manager = CastManager::new(discovery.clone(), &CastConfig::default());
        let mut events = manager.subscribe();

        discovery.publish(DiscoveryEventKind::Added, record(&["id=C", "fn=Attic"]));
        assert!(matches!(
            recv_event(&mut events, EVENT_WAIT),
            Some(CastEvent::DeviceAdded { .. })
        ));
        let device = manager.devices().pop().expect("device");

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (_server, _) = listener.accept().expect("accept");

        let channel = manager
            .attach(&device, Box::new(client), "127.0.0.1:8009".to_string())
            .expect("attach");
        manager.disconnect(&channel).expect("disconnect");

        let mut kinds = Vec::new();
        while kinds.len() < 2 {
            match recv_event(&mut events, EVENT_WAIT) {
                Some(event) => kinds.push(event.kind()),
                None => break,
            }
        }
        assert_eq!(kinds, [EventKind::ChannelConnect, EventKind::ChannelDisconnect]);

        // Only after the terminal channel event does the device expire.
        discovery.publish(DiscoveryEventKind::Expired, record(&["id=C", "fn=Attic"]));
        match recv_event(&mut events, EVENT_WAIT) {
            Some(CastEvent::DeviceRemoved { device }) => assert_eq!(device.id(), "C"),
            other => panic!("expected DeviceRemoved, got {:?}", other.map(|e| e.kind())),
        }
        assert!(recv_event(&mut events, Duration::from_millis(300)).is_none());

        manager.close().expect("close");
    }
}
