//! Discovered cast device records.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::OnceLock;

use rand::Rng;

use crate::discovery::ServiceRecord;
use crate::error::CastError;

/// Address family preference for [`CastDevice::addr`]. `Both` tries IPv4
/// first and falls back to IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    V4,
    V6,
    #[default]
    Both,
}

/// Immutable snapshot of a discovered cast device.
///
/// Identity and attributes come from the DNS-SD TXT record; the TXT map is
/// parsed once on first access. Two snapshots compare equal when the five
/// canonical attributes (id, name, model, service, state) match — address
/// changes alone are not an update.
#[derive(Debug, Clone)]
pub struct CastDevice {
    record: ServiceRecord,
    txt: OnceLock<HashMap<String, String>>,
}

impl CastDevice {
    pub fn new(record: ServiceRecord) -> Self {
        Self {
            record,
            txt: OnceLock::new(),
        }
    }

    /// Unique device id (TXT key `id`). Empty when the record carries none.
    pub fn id(&self) -> &str {
        self.txt("id")
    }

    /// Friendly name (TXT key `fn`).
    pub fn name(&self) -> &str {
        self.txt("fn")
    }

    /// Model description (TXT key `md`).
    pub fn model(&self) -> &str {
        self.txt("md")
    }

    /// Receiver status/service string (TXT key `rs`).
    pub fn service(&self) -> &str {
        self.txt("rs")
    }

    /// Device state (TXT key `st`). Absent or non-numeric values read as 0;
    /// that is documented behavior, not an error.
    pub fn state(&self) -> u32 {
        self.txt("st").parse().unwrap_or(0)
    }

    /// Control-channel TCP port.
    pub fn port(&self) -> u16 {
        self.record.port()
    }

    /// The service record this snapshot was built from.
    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    /// Picks an address by family preference. With `any` set, a uniformly
    /// random element of the chosen family list is returned; otherwise the
    /// first. Fails with [`CastError::NoAddress`] when the requested family
    /// has no entries.
    pub fn addr(&self, family: Family, any: bool) -> Result<IpAddr, CastError> {
        match family {
            Family::V4 => pick(self.record.ip4(), any).map(IpAddr::V4),
            Family::V6 => pick(self.record.ip6(), any).map(IpAddr::V6),
            Family::Both => self
                .addr(Family::V4, any)
                .or_else(|_| self.addr(Family::V6, any)),
        }
    }

    fn txt(&self, key: &str) -> &str {
        let map = self.txt.get_or_init(|| parse_txt(self.record.txt()));
        map.get(key).map(String::as_str).unwrap_or("")
    }
}

impl PartialEq for CastDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
            && self.name() == other.name()
            && self.model() == other.model()
            && self.service() == other.service()
            && self.state() == other.state()
    }
}

impl Eq for CastDevice {}

impl std::fmt::Display for CastDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:?} model={:?} state={})",
            self.id(),
            self.name(),
            self.model(),
            self.state()
        )
    }
}

/// Splits each TXT entry at the first `=`. Entries without a separator are
/// ignored; the first occurrence of a repeated key wins.
fn parse_txt(entries: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(entries.len());
    for entry in entries {
        if let Some((key, value)) = entry.split_once('=') {
            map.entry(key.to_string()).or_insert_with(|| value.to_string());
        }
    }
    map
}

fn pick<T: Copy>(list: &[T], any: bool) -> Result<T, CastError> {
    if list.is_empty() {
        return Err(CastError::NoAddress);
    }
    if any {
        let index = rand::thread_rng().gen_range(0..list.len());
        Ok(list[index])
    } else {
        Ok(list[0])
    }
}
