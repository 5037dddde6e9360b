//! RPC service: mirrors the manager's event stream and device table to
//! remote consumers over plain TCP, one frame per message.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::channel::CastChannel;
use crate::codec;
use crate::config::CastConfig;
use crate::device::Family;
use crate::error::CastError;
use crate::event::CastEvent;
use crate::manager::CastManager;
use crate::rpc::proto::{self, RpcDevice, RpcEvent, RpcMethod};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_millis(500);
const IDLE_LOOP_SLEEP: Duration = Duration::from_millis(25);
const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(30);
const ACCEPT_RETRY_SLEEP: Duration = Duration::from_millis(120);

struct ServiceInner {
    manager: CastManager,
    cancel: broadcast::Sender<()>,
    connected: Mutex<HashMap<String, CastChannel>>,
    stop: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Serves `Ping`, `Devices` and `StreamEvents` over TCP. Streaming replies
/// carry a zero-value keepalive every second; `cancel_requests` tears down
/// every in-flight stream.
pub struct CastService {
    inner: Arc<ServiceInner>,
}

impl CastService {
    /// Wraps a manager handle. With `auto_connect` configured, a background
    /// task opens a channel for every added device and closes it again when
    /// the device expires.
    pub fn new(manager: CastManager, config: &CastConfig) -> CastService {
        let (cancel, _) = broadcast::channel(4);
        let inner = Arc::new(ServiceInner {
            manager,
            cancel,
            connected: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        let service = CastService { inner };

        if config.auto_connect {
            let task_inner = Arc::clone(&service.inner);
            let subscription = task_inner.manager.subscribe();
            let handle = thread::spawn(move || run_auto_connect(task_inner, subscription));
            lock(&service.inner.tasks).push(handle);
        }

        service
    }

    /// Accepts connections on `listener` until the service is closed.
    pub fn serve(&self, listener: TcpListener) -> Result<(), CastError> {
        listener.set_nonblocking(true)?;
        if let Ok(addr) = listener.local_addr() {
            info!("CastService: listening on {addr}");
        }
        let accept_inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || run_accept(accept_inner, listener));
        lock(&self.inner.tasks).push(handle);
        Ok(())
    }

    /// Sends the cancellation sentinel through every streaming handler.
    pub fn cancel_requests(&self) {
        debug!("CastService: cancelling requests");
        let _ = self.inner.cancel.send(());
    }

    /// Stops the accept loop and all handlers, then releases any
    /// auto-connected channels.
    pub fn close(&self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("CastService: closing");
        let _ = self.inner.cancel.send(());
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for handle in tasks {
            let _ = handle.join();
        }
        let connected: Vec<CastChannel> = lock(&self.inner.connected)
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in connected {
            if let Err(err) = self.inner.manager.disconnect(&channel) {
                warn!("CastService: disconnect during close failed: {err}");
            }
        }
    }
}

fn run_accept(inner: Arc<ServiceInner>, listener: TcpListener) {
    while !inner.stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("CastService: connection from {peer}");
                let conn_inner = Arc::clone(&inner);
                let handle = thread::spawn(move || {
                    if let Err(err) = handle_connection(&conn_inner, stream) {
                        debug!("CastService: connection from {peer} ended: {err}");
                    }
                });
                lock(&inner.tasks).push(handle);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE_SLEEP);
            }
            Err(err) => {
                warn!("CastService: accept failed: {err}");
                thread::sleep(ACCEPT_RETRY_SLEEP);
            }
        }
    }
    debug!("CastService: accept loop stopped");
}

fn handle_connection(inner: &Arc<ServiceInner>, mut stream: TcpStream) -> Result<(), CastError> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    loop {
        if inner.stop.load(Ordering::Acquire) {
            return Ok(());
        }
        let body = match codec::read_frame_from(&mut stream) {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        match proto::decode_request(&body)? {
            RpcMethod::Ping => {
                debug!("CastService: ping");
                codec::write_frame_to(&mut stream, &[])?;
            }
            RpcMethod::Devices => {
                let devices: Vec<RpcDevice> = inner
                    .manager
                    .devices()
                    .iter()
                    .map(RpcDevice::from)
                    .collect();
                codec::write_frame_to(&mut stream, &proto::encode_devices_reply(&devices))?;
            }
            RpcMethod::StreamEvents => return stream_events(inner, &mut stream),
        }
    }
}

/// Writes manager events as frames plus a zero-value keepalive every second.
/// Ends on write failure, publisher close or the cancellation sentinel.
fn stream_events(inner: &Arc<ServiceInner>, stream: &mut TcpStream) -> Result<(), CastError> {
    let mut events = inner.manager.subscribe();
    let mut cancel = inner.cancel.subscribe();
    let mut keepalive_at = Instant::now() + KEEPALIVE_INTERVAL;
    debug!("CastService: event stream started");
    loop {
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        match cancel.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break, // sentinel received, or the sender is gone
        }

        let mut wrote = false;
        match events.try_recv() {
            Ok(event) => {
                codec::write_frame_to(stream, &proto::encode_event(&RpcEvent::from(&event)))?;
                wrote = true;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("CastService: event stream lagged by {skipped} events");
            }
        }
        if Instant::now() >= keepalive_at {
            codec::write_frame_to(stream, &proto::encode_event(&RpcEvent::keepalive()))?;
            keepalive_at = Instant::now() + KEEPALIVE_INTERVAL;
            wrote = true;
        }
        if !wrote {
            thread::sleep(IDLE_LOOP_SLEEP);
        }
    }
    debug!("CastService: event stream ended");
    Ok(())
}

/// Opens a channel for every added device, first registration per device id
/// wins, and disconnects it when the device expires.
fn run_auto_connect(inner: Arc<ServiceInner>, mut subscription: broadcast::Receiver<CastEvent>) {
    debug!("CastService: auto-connect task started");
    while !inner.stop.load(Ordering::Acquire) {
        match subscription.try_recv() {
            Ok(CastEvent::DeviceAdded { device }) => {
                if lock(&inner.connected).contains_key(device.id()) {
                    continue;
                }
                match inner.manager.connect(&device, Family::Both, false, None) {
                    Ok(channel) => {
                        match lock(&inner.connected).entry(device.id().to_string()) {
                            Entry::Vacant(slot) => {
                                info!("CastService: watching {}", device.id());
                                slot.insert(channel);
                            }
                            Entry::Occupied(_) => {
                                // Lost the registration race; drop the spare.
                                let _ = inner.manager.disconnect(&channel);
                            }
                        }
                    }
                    Err(err) => {
                        warn!("CastService: connect to {} failed: {err}", device.id());
                    }
                }
            }
            Ok(CastEvent::DeviceRemoved { device }) => {
                let channel = lock(&inner.connected).remove(device.id());
                if let Some(channel) = channel {
                    info!("CastService: releasing {}", device.id());
                    if let Err(err) = inner.manager.disconnect(&channel) {
                        warn!("CastService: disconnect for {} failed: {err}", device.id());
                    }
                }
            }
            Ok(_) => {}
            Err(TryRecvError::Empty) => thread::sleep(IDLE_LOOP_SLEEP),
            Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("CastService: auto-connect stream lagged by {skipped} events");
            }
        }
    }
    debug!("CastService: auto-connect task stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
