//! Control-channel protocol engine: one authenticated TLS session per cast
//! device, speaking length-prefixed CASTv2 envelopes across the connection,
//! heartbeat, receiver and media namespaces.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use native_tls::TlsStream;
use serde_json::json;
use tokio::sync::broadcast;

use crate::codec::{self, CastMessage};
use crate::error::CastError;
use crate::event::ChannelEvent;
use crate::status::{
    Application, MediaSession, MediaStatusResponse, PayloadHeader, ReceiverStatusResponse, Volume,
};

pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";

pub const DEFAULT_SENDER: &str = "sender-0";
pub const DEFAULT_RECEIVER: &str = "receiver-0";

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const STATUS_FIRST_DELAY: Duration = Duration::from_millis(500);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);
const ERROR_ESCALATION_WINDOW: Duration = Duration::from_secs(1);
const EVENT_QUEUE_CAPACITY: usize = 64;
const MAX_MESSAGE_ID: i32 = 99_999;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Narrow view of the channel socket. Production wires a TLS stream; tests
/// wire a plain TCP stream.
pub(crate) trait ChannelStream: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn shutdown(&self) -> io::Result<()>;
}

impl ChannelStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl ChannelStream for TlsStream<TcpStream> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.get_ref().set_read_timeout(timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.get_ref().shutdown(Shutdown::Both)
    }
}

/// Dials the device control port and completes the TLS handshake. Cast
/// devices present self-signed certificates for their IP, so verification is
/// skipped and the keepalive/write deadlines are tied to `timeout`.
pub(crate) fn dial(
    addr: IpAddr,
    port: u16,
    timeout: Duration,
) -> Result<Box<dyn ChannelStream>, CastError> {
    let remote = SocketAddr::new(addr, port);
    let dial_err = |source: Box<dyn std::error::Error + Send + Sync>| CastError::Dial {
        addr: remote.to_string(),
        source,
    };

    let tcp = TcpStream::connect_timeout(&remote, timeout).map_err(|err| dial_err(err.into()))?;
    let keepalive = socket2::TcpKeepalive::new().with_time(timeout);
    if let Err(err) = socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
        warn!("CastChannel: keepalive setup for {remote} failed: {err}");
    }
    tcp.set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|err| dial_err(err.into()))?;
    tcp.set_write_timeout(Some(timeout))
        .map_err(|err| dial_err(err.into()))?;

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|err| dial_err(err.into()))?;
    let stream = connector
        .connect(&addr.to_string(), tcp)
        .map_err(|err| dial_err(err.into()))?;
    Ok(Box::new(stream))
}

#[derive(Default)]
struct ChannelState {
    message_id: i32,
    application: Option<Application>,
    volume: Option<Volume>,
    media: Option<Vec<MediaSession>>,
}

struct ChannelInner {
    id: u64,
    remote_addr: String,
    conn: Mutex<Box<dyn ChannelStream>>,
    state: Mutex<ChannelState>,
    events: Mutex<Option<broadcast::Sender<ChannelEvent>>>,
    stop: AtomicBool,
    closed: AtomicBool,
    disconnect_emitted: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Live control session to one device.
///
/// Cheap to clone; all clones address the same session. Created by
/// [`crate::manager::CastManager::connect`], destroyed by disconnecting or
/// when the socket dies — once `Disconnect` has been observed on the event
/// stream the channel emits nothing further.
#[derive(Clone)]
pub struct CastChannel {
    inner: Arc<ChannelInner>,
}

impl CastChannel {
    /// Opens a channel over an established stream. The receive loop does not
    /// run until [`CastChannel::start`] is called, so callers can subscribe
    /// without missing the connect event.
    pub(crate) fn from_stream(
        stream: Box<dyn ChannelStream>,
        remote_addr: String,
    ) -> CastChannel {
        if let Err(err) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
            warn!("CastChannel: read deadline setup for {remote_addr} failed: {err}");
        }
        let (events, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        CastChannel {
            inner: Arc::new(ChannelInner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                remote_addr,
                conn: Mutex::new(stream),
                state: Mutex::new(ChannelState::default()),
                events: Mutex::new(Some(events)),
                stop: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                disconnect_emitted: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        }
    }

    /// Spawns the receive loop and announces the sender to the device.
    /// Emits `Connect` once the CONNECT frame is on the wire.
    pub(crate) fn start(&self) -> Result<(), CastError> {
        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || run_receive(inner));
        *lock(&self.inner.reader) = Some(handle);

        self.inner.send(
            DEFAULT_SENDER,
            DEFAULT_RECEIVER,
            NS_CONNECTION,
            &json!({"type": "CONNECT", "origin": {}}),
        )?;
        self.inner.emit(ChannelEvent::Connect);
        Ok(())
    }

    /// Opaque channel identity, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        match lock(&self.inner.events).as_ref() {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Snapshot of the observed application, if any.
    pub fn application(&self) -> Option<Application> {
        lock(&self.inner.state).application.clone()
    }

    /// Snapshot of the observed volume, if any.
    pub fn volume(&self) -> Option<Volume> {
        lock(&self.inner.state).volume.clone()
    }

    /// Snapshot of the observed media sessions. `None` until the first
    /// MEDIA_STATUS arrives; distinct from an empty session list.
    pub fn media(&self) -> Option<Vec<MediaSession>> {
        lock(&self.inner.state).media.clone()
    }

    /// Resumes (`true`) or stops (`false`) the current media session.
    pub fn set_play(&self, play: bool) -> Result<i32, CastError> {
        self.media_command(if play { "PLAY" } else { "STOP" })
    }

    /// Pauses (`true`) or resumes (`false`) the current media session.
    pub fn set_pause(&self, pause: bool) -> Result<i32, CastError> {
        self.media_command(if pause { "PAUSE" } else { "PLAY" })
    }

    /// Sets the receiver volume level, clamped to `[0.0, 1.0]`.
    pub fn set_volume(&self, level: f32) -> Result<i32, CastError> {
        let request_id = self.inner.next_message_id();
        self.inner.send(
            DEFAULT_SENDER,
            DEFAULT_RECEIVER,
            NS_RECEIVER,
            &json!({
                "type": "SET_VOLUME",
                "requestId": request_id,
                "volume": {"level": level.clamp(0.0, 1.0)},
            }),
        )?;
        Ok(request_id)
    }

    /// Mutes or unmutes the receiver.
    pub fn set_muted(&self, muted: bool) -> Result<i32, CastError> {
        let request_id = self.inner.next_message_id();
        self.inner.send(
            DEFAULT_SENDER,
            DEFAULT_RECEIVER,
            NS_RECEIVER,
            &json!({
                "type": "SET_VOLUME",
                "requestId": request_id,
                "volume": {"muted": muted},
            }),
        )?;
        Ok(request_id)
    }

    /// Closes the channel: best-effort CLOSE frame, receive loop and timer
    /// stopped, socket shut down, publisher closed. Emits `Disconnect` if
    /// the receive loop has not already reported one. Idempotent; after it
    /// returns no further events are emitted.
    pub fn close(&self) -> Result<(), CastError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("CastChannel: closing {}", self.inner.remote_addr);

        if let Err(err) = self.inner.send(
            DEFAULT_SENDER,
            DEFAULT_RECEIVER,
            NS_CONNECTION,
            &json!({"type": "CLOSE"}),
        ) {
            warn!(
                "CastChannel: CLOSE to {} failed: {err}",
                self.inner.remote_addr
            );
        }

        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.inner.reader).take() {
            let _ = handle.join();
        }

        let shutdown_result = lock(&self.inner.conn).shutdown();
        self.inner.emit_disconnect();
        lock(&self.inner.events).take();

        match shutdown_result {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(CastError::Io(err)),
            _ => Ok(()),
        }
    }

    fn media_command(&self, command: &str) -> Result<i32, CastError> {
        let (transport_id, media_session_id) = {
            let state = lock(&self.inner.state);
            let application = state.application.as_ref().ok_or(CastError::NotFound)?;
            let session = state
                .media
                .as_ref()
                .and_then(|sessions| sessions.first())
                .ok_or(CastError::NotFound)?;
            (application.transport_id.clone(), session.media_session_id)
        };
        let request_id = self.inner.next_message_id();
        self.inner.send(
            DEFAULT_SENDER,
            &transport_id,
            NS_MEDIA,
            &json!({
                "type": command,
                "requestId": request_id,
                "mediaSessionId": media_session_id,
            }),
        )?;
        Ok(request_id)
    }
}

impl ChannelInner {
    /// Serialises the payload and writes one frame. The conn mutex is held
    /// only around the write; the socket write deadline bounds it.
    fn send(
        &self,
        source: &str,
        destination: &str,
        namespace: &str,
        payload: &serde_json::Value,
    ) -> Result<(), CastError> {
        let frame = codec::encode_frame(&CastMessage {
            source_id: source.to_string(),
            destination_id: destination.to_string(),
            namespace: namespace.to_string(),
            payload: payload.to_string(),
        })?;
        let mut conn = lock(&self.conn);
        conn.write_all(&frame)?;
        Ok(())
    }

    fn emit(&self, event: ChannelEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    fn emit_disconnect(&self) {
        if !self.disconnect_emitted.swap(true, Ordering::SeqCst) {
            self.emit(ChannelEvent::Disconnect);
        }
    }

    /// Message ids cycle 1..=99_999; zero never appears on the wire.
    fn next_message_id(&self) -> i32 {
        let mut state = lock(&self.state);
        state.message_id = if state.message_id >= MAX_MESSAGE_ID {
            1
        } else {
            state.message_id + 1
        };
        state.message_id
    }

    /// Reads one frame under the rolling read deadline. `Ok(None)` covers
    /// deadline expiry and zero-sized frames, both benign.
    fn read_frame(&self) -> io::Result<Option<Vec<u8>>> {
        let mut conn = lock(&self.conn);
        let mut len_buf = [0u8; 4];
        match conn.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            warn!("CastChannel: zero-sized frame from {}", self.remote_addr);
            return Ok(None);
        }
        if len > codec::MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds limit"),
            ));
        }
        let mut body = vec![0u8; len];
        conn.read_exact(&mut body)?;
        Ok(Some(body))
    }

    fn handle_frame(&self, body: &[u8]) {
        let msg = match codec::decode_message(body) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("CastChannel: bad frame from {}: {err}", self.remote_addr);
                return;
            }
        };
        match msg.namespace.as_str() {
            NS_HEARTBEAT => self.handle_heartbeat(&msg),
            NS_CONNECTION => self.handle_connection(&msg),
            NS_RECEIVER => self.handle_receiver(&msg),
            NS_MEDIA => self.handle_media(&msg),
            namespace => {
                debug!("CastChannel: ignoring message in namespace {namespace:?}");
            }
        }
    }

    fn handle_heartbeat(&self, msg: &CastMessage) {
        let header: PayloadHeader = match serde_json::from_str(&msg.payload) {
            Ok(header) => header,
            Err(err) => {
                warn!("CastChannel: bad heartbeat payload: {err}");
                return;
            }
        };
        if header.message_type == "PING" {
            // Reply to the originator; -1 marks an unsolicited response.
            if let Err(err) = self.send(
                &msg.destination_id,
                &msg.source_id,
                NS_HEARTBEAT,
                &json!({"type": "PONG", "requestId": -1}),
            ) {
                warn!("CastChannel: PONG to {} failed: {err}", msg.source_id);
            }
        } else {
            debug!(
                "CastChannel: ignoring heartbeat message {:?}",
                header.message_type
            );
        }
    }

    fn handle_connection(&self, msg: &CastMessage) {
        let header: PayloadHeader = match serde_json::from_str(&msg.payload) {
            Ok(header) => header,
            Err(err) => {
                warn!("CastChannel: bad connection payload: {err}");
                return;
            }
        };
        if header.message_type == "CLOSE" {
            debug!(
                "CastChannel: {} closed its virtual connection",
                msg.source_id
            );
        }
    }

    fn handle_receiver(&self, msg: &CastMessage) {
        let header: PayloadHeader = match serde_json::from_str(&msg.payload) {
            Ok(header) => header,
            Err(err) => {
                warn!("CastChannel: bad receiver payload: {err}");
                return;
            }
        };
        if header.message_type != "RECEIVER_STATUS" {
            debug!(
                "CastChannel: ignoring receiver message {:?}",
                header.message_type
            );
            return;
        }
        let response: ReceiverStatusResponse = match serde_json::from_str(&msg.payload) {
            Ok(response) => response,
            Err(err) => {
                warn!("CastChannel: bad RECEIVER_STATUS: {err}");
                return;
            }
        };
        if let Some(volume) = response.status.volume {
            self.update_volume(volume, response.request_id);
        }
        self.update_application(response.status.applications, response.request_id);
    }

    fn handle_media(&self, msg: &CastMessage) {
        let header: PayloadHeader = match serde_json::from_str(&msg.payload) {
            Ok(header) => header,
            Err(err) => {
                warn!("CastChannel: bad media payload: {err}");
                return;
            }
        };
        if header.message_type != "MEDIA_STATUS" {
            debug!(
                "CastChannel: ignoring media message {:?}",
                header.message_type
            );
            return;
        }
        let response: MediaStatusResponse = match serde_json::from_str(&msg.payload) {
            Ok(response) => response,
            Err(err) => {
                warn!("CastChannel: bad MEDIA_STATUS: {err}");
                return;
            }
        };
        self.update_media(response.status, response.request_id);
    }

    /// The first listed application is the representative. A change clears
    /// media state; losing the application also reports cleared media.
    fn update_application(&self, mut applications: Vec<Application>, request_id: i32) {
        let next = if applications.is_empty() {
            None
        } else {
            Some(applications.remove(0))
        };
        let mut state = lock(&self.state);
        match next {
            None => {
                if state.application.take().is_some() {
                    state.media = None;
                    drop(state);
                    self.emit(ChannelEvent::ApplicationUpdated {
                        application: None,
                        request_id,
                    });
                    self.emit(ChannelEvent::MediaUpdated {
                        media: None,
                        request_id,
                    });
                }
            }
            Some(application) => {
                if state.application.as_ref() != Some(&application) {
                    state.application = Some(application.clone());
                    state.media = None;
                    drop(state);
                    self.emit(ChannelEvent::ApplicationUpdated {
                        application: Some(application.clone()),
                        request_id,
                    });
                    self.watch_application(&application);
                }
            }
        }
    }

    fn update_volume(&self, volume: Volume, request_id: i32) {
        let mut state = lock(&self.state);
        if state.volume.as_ref() != Some(&volume) {
            state.volume = Some(volume.clone());
            drop(state);
            self.emit(ChannelEvent::VolumeUpdated { volume, request_id });
        }
    }

    /// Media is replaced wholesale and always re-emitted; downstream filters
    /// on identity if it needs to.
    fn update_media(&self, sessions: Vec<MediaSession>, request_id: i32) {
        lock(&self.state).media = Some(sessions.clone());
        self.emit(ChannelEvent::MediaUpdated {
            media: Some(sessions),
            request_id,
        });
    }

    /// Joins the application's transport and requests its media status.
    fn watch_application(&self, application: &Application) {
        if application.transport_id.is_empty() {
            warn!(
                "CastChannel: application {} has no transport id",
                application.app_id
            );
            return;
        }
        if let Err(err) = self.send(
            DEFAULT_SENDER,
            &application.transport_id,
            NS_CONNECTION,
            &json!({"type": "CONNECT", "origin": {}}),
        ) {
            warn!(
                "CastChannel: CONNECT to transport {} failed: {err}",
                application.transport_id
            );
            return;
        }
        let request_id = self.next_message_id();
        if let Err(err) = self.send(
            DEFAULT_SENDER,
            &application.transport_id,
            NS_MEDIA,
            &json!({"type": "GET_STATUS", "requestId": request_id}),
        ) {
            warn!(
                "CastChannel: media GET_STATUS to {} failed: {err}",
                application.transport_id
            );
        }
    }

    fn request_receiver_status(&self) -> Result<i32, CastError> {
        let request_id = self.next_message_id();
        self.send(
            DEFAULT_SENDER,
            DEFAULT_RECEIVER,
            NS_RECEIVER,
            &json!({"type": "GET_STATUS", "requestId": request_id}),
        )?;
        Ok(request_id)
    }

    /// One poll step: receiver status while nothing is known, media status
    /// while an application is known but its media is not.
    fn status_tick(&self) {
        let (application, volume_known, media_known) = {
            let state = lock(&self.state);
            (
                state.application.clone(),
                state.volume.is_some(),
                state.media.is_some(),
            )
        };
        match application {
            None if !volume_known => {
                if let Err(err) = self.request_receiver_status() {
                    warn!(
                        "CastChannel: GET_STATUS to {} failed: {err}",
                        self.remote_addr
                    );
                }
            }
            Some(application) if !media_known => self.watch_application(&application),
            _ => {}
        }
    }
}

fn run_receive(inner: Arc<ChannelInner>) {
    debug!("CastChannel: receive loop started for {}", inner.remote_addr);
    let mut status_at = Instant::now() + STATUS_FIRST_DELAY;
    let mut last_read_error: Option<Instant> = None;
    loop {
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        if Instant::now() >= status_at {
            inner.status_tick();
            status_at = Instant::now() + STATUS_INTERVAL;
        }
        match inner.read_frame() {
            Ok(Some(body)) => {
                last_read_error = None;
                inner.handle_frame(&body);
            }
            Ok(None) => {
                last_read_error = None;
            }
            Err(err) => {
                warn!("CastChannel: read from {} failed: {err}", inner.remote_addr);
                let now = Instant::now();
                match last_read_error {
                    // Two back-to-back failures mean the socket is unusable.
                    Some(previous)
                        if now.duration_since(previous) < ERROR_ESCALATION_WINDOW =>
                    {
                        inner.emit_disconnect();
                        break;
                    }
                    _ => last_read_error = Some(now),
                }
            }
        }
    }
    debug!("CastChannel: receive loop stopped for {}", inner.remote_addr);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
