//! Service discovery collaborator: the narrow interface the manager
//! consumes, plus an mDNS implementation backed by `mdns-sd`.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::broadcast;

use crate::error::CastError;

const EVENT_QUEUE_CAPACITY: usize = 64;

/// Snapshot of one DNS-SD service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    name: String,
    service: String,
    port: u16,
    txt: Vec<String>,
    ip4: Vec<Ipv4Addr>,
    ip6: Vec<Ipv6Addr>,
}

impl ServiceRecord {
    pub fn new(
        name: String,
        service: String,
        port: u16,
        txt: Vec<String>,
        ip4: Vec<Ipv4Addr>,
        ip6: Vec<Ipv6Addr>,
    ) -> Self {
        Self {
            name,
            service,
            port,
            txt,
            ip4,
            ip6,
        }
    }

    /// Instance or host name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service type, e.g. `_googlecast._tcp`.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Raw TXT entries (`key=value` strings).
    pub fn txt(&self) -> &[String] {
        &self.txt
    }

    pub fn ip4(&self) -> &[Ipv4Addr] {
        &self.ip4
    }

    pub fn ip6(&self) -> &[Ipv6Addr] {
        &self.ip6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    Added,
    Updated,
    Expired,
}

/// One reconciliation input for the manager.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub record: ServiceRecord,
}

/// Capability set the manager needs from a discovery layer: a non-blocking
/// lookup kick and an event subscription.
pub trait DiscoverySource: Send + Sync {
    /// Kicks a lookup for `service_type`. Results arrive asynchronously on
    /// the subscription; implementations bound their own work by `deadline`.
    fn lookup(&self, deadline: Duration, service_type: &str) -> Result<(), CastError>;

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

/// mDNS-backed discovery source. Browsing is continuous once kicked; every
/// resolved service is republished as `Added` on first sight and `Updated`
/// afterwards, and `ServiceRemoved` becomes `Expired` carrying the last
/// resolved record.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    events: broadcast::Sender<DiscoveryEvent>,
    browsing: Mutex<HashSet<String>>,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self, CastError> {
        let daemon = ServiceDaemon::new()
            .map_err(|err| CastError::Discovery(format!("failed to start mDNS daemon: {err}")))?;
        let (events, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Ok(Self {
            daemon,
            events,
            browsing: Mutex::new(HashSet::new()),
        })
    }

    /// Stops the mDNS daemon. Subscribers observe a closed stream once the
    /// translator threads drain.
    pub fn shutdown(&self) {
        if let Err(err) = self.daemon.shutdown() {
            warn!("MdnsDiscovery: daemon shutdown failed: {err}");
        }
    }
}

impl DiscoverySource for MdnsDiscovery {
    fn lookup(&self, _deadline: Duration, service_type: &str) -> Result<(), CastError> {
        let full_type = format!("{service_type}.local.");
        {
            let mut browsing = self
                .browsing
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // The daemon keeps browsing after the first kick; later lookups
            // are satisfied by the ongoing browse.
            if !browsing.insert(full_type.clone()) {
                return Ok(());
            }
        }

        let receiver = self.daemon.browse(&full_type).map_err(|err| {
            CastError::Discovery(format!("failed to browse {full_type}: {err}"))
        })?;
        let events = self.events.clone();
        let service = service_type.to_string();
        thread::spawn(move || {
            let mut known: HashMap<String, ServiceRecord> = HashMap::new();
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let record = resolved_record(&service, &info);
                        let fullname = info.get_fullname().to_string();
                        let kind = if known.contains_key(&fullname) {
                            DiscoveryEventKind::Updated
                        } else {
                            DiscoveryEventKind::Added
                        };
                        known.insert(fullname, record.clone());
                        let _ = events.send(DiscoveryEvent { kind, record });
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        if let Some(record) = known.remove(&fullname) {
                            let _ = events.send(DiscoveryEvent {
                                kind: DiscoveryEventKind::Expired,
                                record,
                            });
                        }
                    }
                    ServiceEvent::SearchStarted(ty) | ServiceEvent::SearchStopped(ty) => {
                        debug!("MdnsDiscovery: search event for {ty}");
                    }
                    _ => {}
                }
            }
            debug!("MdnsDiscovery: browse stream for {service} closed");
        });

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

fn resolved_record(service: &str, info: &mdns_sd::ServiceInfo) -> ServiceRecord {
    let mut ip4 = Vec::new();
    let mut ip6 = Vec::new();
    for addr in info.get_addresses() {
        match addr {
            IpAddr::V4(v4) => ip4.push(*v4),
            IpAddr::V6(v6) => ip6.push(*v6),
        }
    }
    ip4.sort();
    ip6.sort();

    let txt = info
        .get_properties()
        .iter()
        .map(|property| format!("{}={}", property.key(), property.val_str()))
        .collect();

    ServiceRecord::new(
        info.get_hostname().trim_end_matches('.').to_string(),
        service.to_string(),
        info.get_port(),
        txt,
        ip4,
        ip6,
    )
}

#[cfg(test)]
mod tests {
    use super::ServiceRecord;

    #[test]
    fn test_record_accessors() {
        let record = ServiceRecord::new(
            "kitchen".to_string(),
            "_googlecast._tcp".to_string(),
            8009,
            vec!["id=abc".to_string()],
            vec![std::net::Ipv4Addr::new(192, 168, 1, 10)],
            Vec::new(),
        );
        assert_eq!(record.name(), "kitchen");
        assert_eq!(record.service(), "_googlecast._tcp");
        assert_eq!(record.port(), 8009);
        assert_eq!(record.txt(), ["id=abc".to_string()]);
        assert_eq!(record.ip4().len(), 1);
        assert!(record.ip6().is_empty());
    }
}
