//! RPC client: snapshot calls plus a streaming subscription guarded by a
//! 5-second idle watchdog.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::broadcast;

use crate::codec;
use crate::error::CastError;
use crate::event::EventKind;
use crate::rpc::proto::{self, RpcDevice, RpcEvent, RpcMethod};

/// Any inbound frame (keepalive or real) resets this window; a silent server
/// beyond it is a fatal stall. Unrelated to the device-side PING/PONG
/// heartbeat.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(1);
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Connection to a [`crate::rpc::CastService`]. Calls serialise on the
/// single connection; `stream_events` holds it for the stream's lifetime.
pub struct CastClient {
    conn: Mutex<TcpStream>,
    timeout: Duration,
    events: broadcast::Sender<RpcEvent>,
}

impl CastClient {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<CastClient, CastError> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|err| CastError::Dial {
            addr: addr.to_string(),
            source: err.into(),
        })?;
        stream.set_write_timeout(Some(timeout))?;
        let (events, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Ok(CastClient {
            conn: Mutex::new(stream),
            timeout,
            events,
        })
    }

    /// Events decoded from the stream; keepalives are filtered out.
    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.events.subscribe()
    }

    pub fn ping(&self) -> Result<(), CastError> {
        let mut conn = lock(&self.conn);
        conn.set_read_timeout(Some(self.timeout))?;
        codec::write_frame_to(&mut *conn, &proto::encode_request(RpcMethod::Ping))?;
        match codec::read_frame_from(&mut *conn)? {
            Some(_) => Ok(()),
            None => Err(CastError::DeadlineExceeded),
        }
    }

    /// Fetches the remote device-table snapshot.
    pub fn devices(&self) -> Result<Vec<RpcDevice>, CastError> {
        let mut conn = lock(&self.conn);
        conn.set_read_timeout(Some(self.timeout))?;
        codec::write_frame_to(&mut *conn, &proto::encode_request(RpcMethod::Devices))?;
        match codec::read_frame_from(&mut *conn)? {
            Some(body) => proto::decode_devices_reply(&body),
            None => Err(CastError::DeadlineExceeded),
        }
    }

    /// Streams events to the subscribers until the server ends the stream
    /// (returns `Ok`) or nothing arrives for the watchdog window (cancels
    /// the connection and returns [`CastError::DeadlineExceeded`]).
    pub fn stream_events(&self) -> Result<(), CastError> {
        let mut conn = lock(&self.conn);
        codec::write_frame_to(&mut *conn, &proto::encode_request(RpcMethod::StreamEvents))?;
        conn.set_read_timeout(Some(STREAM_READ_TIMEOUT))?;
        debug!("CastClient: event stream started");
        let mut last_frame = Instant::now();
        loop {
            match codec::read_frame_from(&mut *conn) {
                Ok(Some(body)) => {
                    last_frame = Instant::now();
                    match proto::decode_event(&body) {
                        Ok(event) if event.kind != EventKind::None => {
                            let _ = self.events.send(event);
                        }
                        Ok(_) => {} // keepalive
                        Err(err) => warn!("CastClient: bad event frame: {err}"),
                    }
                }
                Ok(None) => {
                    if last_frame.elapsed() > HEARTBEAT_TIMEOUT {
                        warn!("CastClient: stream stalled, cancelling");
                        let _ = conn.shutdown(Shutdown::Both);
                        return Err(CastError::DeadlineExceeded);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("CastClient: event stream ended");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
