use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use serde::{Deserialize, Serialize};

use dns_types::protocol::types::*;

/// A convenience wrapper around a `Cache` which lets it be shared
/// between threads.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

impl SharedCache {
    /// Make a new, empty, shared cache.
    pub fn new() -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(Cache::new())),
        }
    }

    /// Look up unexpired records matching the key. The returned TTLs
    /// are relative to now, not to when the record was inserted.
    pub fn lookup(
        &self,
        name: &DomainName,
        qtype: QueryType,
        qclass: QueryClass,
    ) -> Vec<ResourceRecord> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .lookup(name, qtype, qclass)
    }

    /// Insert a record, stamped as acquired at the current time.
    ///
    /// It is not inserted if its TTL is zero: ephemeral records are
    /// only meaningful for the in-flight transaction that fetched
    /// them, and this cache has no notion of a transaction scope.
    pub fn insert(&self, record: &ResourceRecord) {
        self.insert_at(record, SystemTime::now());
    }

    /// As `insert`, with an explicit acquisition time (used when
    /// ingesting records discovered earlier in a referral chain).
    pub fn insert_at(&self, record: &ResourceRecord, acquired_at: SystemTime) {
        if record.ttl > 0 {
            self.cache
                .lock()
                .expect(MUTEX_POISON_MESSAGE)
                .insert(record, acquired_at);
        }
    }

    /// Drop all expired entries.
    pub fn sweep(&self) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).sweep();
    }

    /// Load records from a JSON file, replacing the current contents.
    ///
    /// Tolerates an absent or unparsable file by leaving the cache
    /// empty: a missing cache file is the normal state on first run.
    pub fn load(&self, path: &Path) {
        let cache = Cache::load(path);
        *self.cache.lock().expect(MUTEX_POISON_MESSAGE) = cache;
    }

    /// Sweep, then best-effort persist the current state to a JSON
    /// file. I/O errors are swallowed: the in-memory cache is always
    /// authoritative, the file is just a warm-start hint.
    pub fn save(&self, path: &Path) {
        let mut cache = self.cache.lock().expect(MUTEX_POISON_MESSAGE);
        cache.sweep();
        let snapshot = cache.to_stored_records();
        drop(cache);
        if let Err(err) = Cache::write_stored_records(path, &snapshot) {
            tracing::warn!(?err, path = %path.display(), "failed to save cache to disk");
        }
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}

/// How long may elapse between sweeps before one is triggered
/// opportunistically by an unrelated operation.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// A single cached record: its data, and when it expires.
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    rtype_with_data: RecordTypeWithData,
    rclass: RecordClass,
    acquired_at: SystemTime,
    ttl: u32,
}

impl Entry {
    fn expiry(&self) -> SystemTime {
        self.acquired_at + Duration::from_secs(u64::from(self.ttl))
    }

    fn is_expired_at(&self, now: SystemTime) -> bool {
        now > self.expiry()
    }

    fn remaining_ttl_at(&self, now: SystemTime) -> u32 {
        match self.expiry().duration_since(now) {
            Ok(remaining) => u32::try_from(remaining.as_secs()).unwrap_or(u32::MAX),
            Err(_) => 0,
        }
    }

    fn to_resource_record(&self, name: &DomainName, now: SystemTime) -> ResourceRecord {
        ResourceRecord {
            name: name.clone(),
            rtype_with_data: self.rtype_with_data.clone(),
            rclass: self.rclass,
            ttl: self.remaining_ttl_at(now),
        }
    }
}

/// Caching for `ResourceRecord`s, keyed by name and further by type
/// and rdata within a name.
///
/// You probably want to use `SharedCache` instead.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    entries: HashMap<DomainName, Vec<Entry>>,
    last_swept: Option<SystemTime>,
}

impl Cache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            last_swept: None,
        }
    }

    /// Look up unexpired records matching the key. `DomainName`
    /// equality is already case-insensitive, so this lookup is too.
    pub fn lookup(
        &self,
        name: &DomainName,
        qtype: QueryType,
        qclass: QueryClass,
    ) -> Vec<ResourceRecord> {
        let now = SystemTime::now();
        let mut out = Vec::new();
        if let Some(entries) = self.entries.get(name) {
            for entry in entries {
                if entry.is_expired_at(now) {
                    continue;
                }
                if !entry.rtype_with_data.matches(&qtype) {
                    continue;
                }
                if !entry.rclass.matches(&qclass) {
                    continue;
                }
                out.push(entry.to_resource_record(name, now));
            }
        }
        out
    }

    /// Insert a record under the merge rule: a record with matching
    /// (name, class, rdata) is replaced only if the incoming absolute
    /// expiry is strictly greater than the one already stored; a
    /// record with no match is appended.
    pub fn insert(&mut self, record: &ResourceRecord, acquired_at: SystemTime) {
        let new_expiry = acquired_at + Duration::from_secs(u64::from(record.ttl));
        let entries = self.entries.entry(record.name.clone()).or_default();

        for entry in entries.iter_mut() {
            if entry.rclass == record.rclass && entry.rtype_with_data == record.rtype_with_data {
                if new_expiry > entry.expiry() {
                    entry.acquired_at = acquired_at;
                    entry.ttl = record.ttl;
                }
                self.maybe_sweep();
                return;
            }
        }

        entries.push(Entry {
            rtype_with_data: record.rtype_with_data.clone(),
            rclass: record.rclass,
            acquired_at,
            ttl: record.ttl,
        });
        self.maybe_sweep();
    }

    /// Drop all expired entries, and names left with no entries.
    pub fn sweep(&mut self) {
        let now = SystemTime::now();
        self.entries.retain(|_, entries| {
            entries.retain(|entry| !entry.is_expired_at(now));
            !entries.is_empty()
        });
        self.last_swept = Some(now);
    }

    fn maybe_sweep(&mut self) {
        let now = SystemTime::now();
        let due = match self.last_swept {
            None => true,
            Some(last) => now.duration_since(last).unwrap_or_default() >= SWEEP_INTERVAL,
        };
        if due {
            self.sweep();
        }
    }

    fn to_stored_records(&self) -> Vec<StoredRecord> {
        let now = SystemTime::now();
        let mut out = Vec::new();
        for (name, entries) in &self.entries {
            for entry in entries {
                if entry.is_expired_at(now) {
                    continue;
                }
                out.push(StoredRecord::from_entry(name, entry));
            }
        }
        out
    }

    /// Load a cache from a JSON file, tolerating an absent or
    /// unparsable file by returning an empty cache. Records whose
    /// stored expiry has already passed are discarded.
    pub fn load(path: &Path) -> Self {
        let mut cache = Self::new();

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return cache,
        };
        let stored: Vec<StoredRecord> = match serde_json::from_str(&contents) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(?err, path = %path.display(), "failed to parse cache file, starting empty");
                return cache;
            }
        };

        let now = SystemTime::now();
        for record in stored {
            if let Some((name, entry)) = record.into_entry() {
                if entry.is_expired_at(now) {
                    continue;
                }
                cache.entries.entry(name).or_default().push(entry);
            }
        }

        cache
    }

    fn write_stored_records(path: &Path, records: &[StoredRecord]) -> io::Result<()> {
        let json = serde_json::to_string_pretty(records)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(path, json)
    }
}

/// The on-disk representation of a single cached record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    name: String,
    #[serde(rename = "type")]
    rtype: String,
    class: String,
    ttl: u32,
    rdata: String,
    timestamp: u64,
}

impl StoredRecord {
    fn from_entry(name: &DomainName, entry: &Entry) -> Self {
        let acquired_at_unix = entry
            .acquired_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        StoredRecord {
            name: name.to_dotted_string(),
            rtype: entry.rtype_with_data.rtype().to_string(),
            class: entry.rclass.to_string(),
            ttl: entry.ttl,
            rdata: rdata_to_string(&entry.rtype_with_data),
            timestamp: acquired_at_unix,
        }
    }

    fn into_entry(self) -> Option<(DomainName, Entry)> {
        let name = DomainName::from_dotted_string(&self.name)?;
        let rtype: RecordType = self.rtype.parse().ok()?;
        let rclass: RecordClass = self.class.parse().ok()?;
        let rtype_with_data = rdata_from_string(rtype, &self.rdata)?;
        let acquired_at = UNIX_EPOCH + Duration::from_secs(self.timestamp);
        Some((
            name,
            Entry {
                rtype_with_data,
                rclass,
                acquired_at,
                ttl: self.ttl,
            },
        ))
    }
}

/// Render a record's rdata as the scalar stored on disk: plain text
/// for the common address/name types, base64 of the raw wire bytes
/// for anything with a richer or unknown shape.
fn rdata_to_string(rtype_with_data: &RecordTypeWithData) -> String {
    match rtype_with_data {
        RecordTypeWithData::A { address } => address.to_string(),
        RecordTypeWithData::AAAA { address } => address.to_string(),
        RecordTypeWithData::NS { nsdname } => nsdname.to_dotted_string(),
        RecordTypeWithData::CNAME { cname } => cname.to_dotted_string(),
        RecordTypeWithData::PTR { ptrdname } => ptrdname.to_dotted_string(),
        other => base64::engine::general_purpose::STANDARD.encode(opaque_octets(other)),
    }
}

fn rdata_from_string(rtype: RecordType, rdata: &str) -> Option<RecordTypeWithData> {
    match rtype {
        RecordType::A => Some(RecordTypeWithData::A {
            address: rdata.parse().ok()?,
        }),
        RecordType::AAAA => Some(RecordTypeWithData::AAAA {
            address: rdata.parse().ok()?,
        }),
        RecordType::NS => Some(RecordTypeWithData::NS {
            nsdname: DomainName::from_dotted_string(rdata)?,
        }),
        RecordType::CNAME => Some(RecordTypeWithData::CNAME {
            cname: DomainName::from_dotted_string(rdata)?,
        }),
        RecordType::PTR => Some(RecordTypeWithData::PTR {
            ptrdname: DomainName::from_dotted_string(rdata)?,
        }),
        RecordType::Unknown(tag) => {
            let octets = base64::engine::general_purpose::STANDARD
                .decode(rdata)
                .ok()?;
            Some(RecordTypeWithData::Unknown { tag, octets })
        }
        // SOA/HINFO/MX/TXT aren't expected to survive a referral or
        // an answer section in practice; round-trip them as opaque
        // bytes rather than lose them on a save/load cycle.
        _ => None,
    }
}

/// A best-effort flattening of a record's rdata fields to bytes, for
/// types the disk format stores opaquely.
fn opaque_octets(rtype_with_data: &RecordTypeWithData) -> Vec<u8> {
    match rtype_with_data {
        RecordTypeWithData::TXT { octets } => octets.clone(),
        RecordTypeWithData::HINFO { cpu, os } => {
            let mut bytes = cpu.clone();
            bytes.push(0);
            bytes.extend_from_slice(os);
            bytes
        }
        RecordTypeWithData::MX {
            preference,
            exchange,
        } => {
            let mut bytes = preference.to_be_bytes().to_vec();
            bytes.extend_from_slice(exchange.to_dotted_string().as_bytes());
            bytes
        }
        RecordTypeWithData::SOA { mname, rname, .. } => {
            let mut bytes = mname.to_dotted_string().into_bytes();
            bytes.push(0);
            bytes.extend_from_slice(rname.to_dotted_string().as_bytes());
            bytes
        }
        RecordTypeWithData::Unknown { octets, .. } => octets.clone(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    use dns_types::protocol::types::test_util::*;

    use super::*;

    #[test]
    fn lookup_returns_unexpired_records() {
        let mut cache = Cache::new();
        let rr = a_record("shuckle.ru.nl.", Ipv4Addr::new(42, 42, 42, 42), 300);
        cache.insert(&rr, SystemTime::now());

        let found = cache.lookup(&rr.name, QueryType::Record(RecordType::A), QueryClass::Record(RecordClass::IN));
        assert_eq!(1, found.len());
        assert_eq!(rr.rtype_with_data, found[0].rtype_with_data);
    }

    #[test]
    fn lookup_excludes_expired_records() {
        let mut cache = Cache::new();
        let rr = a_record("shuckle.ru.nl.", Ipv4Addr::new(42, 42, 42, 42), 1);
        let acquired_at = SystemTime::now() - Duration::from_secs(2);
        cache.insert(&rr, acquired_at);

        let found = cache.lookup(&rr.name, QueryType::Record(RecordType::A), QueryClass::Record(RecordClass::IN));
        assert!(found.is_empty());
    }

    #[test]
    fn insert_keeps_the_later_expiry() {
        let mut cache = Cache::new();
        let rr = a_record("shuckle.ru.nl.", Ipv4Addr::new(42, 42, 42, 42), 10);
        let now = SystemTime::now();

        cache.insert(&rr, now);
        cache.insert(&rr, now - Duration::from_secs(5));

        let entries = cache.entries.get(&rr.name).unwrap();
        assert_eq!(1, entries.len());
        assert_eq!(now, entries[0].acquired_at);
    }

    #[test]
    fn insert_appends_distinct_rdata() {
        let mut cache = Cache::new();
        let a = a_record("shuckle.ru.nl.", Ipv4Addr::new(1, 1, 1, 1), 300);
        let b = a_record("shuckle.ru.nl.", Ipv4Addr::new(2, 2, 2, 2), 300);

        cache.insert(&a, SystemTime::now());
        cache.insert(&b, SystemTime::now());

        assert_eq!(2, cache.entries.get(&a.name).unwrap().len());
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let mut cache = Cache::new();
        let rr = a_record("shuckle.ru.nl.", Ipv4Addr::new(1, 1, 1, 1), 1);
        cache.insert(&rr, SystemTime::now() - Duration::from_secs(2));

        cache.sweep();

        assert!(cache.entries.get(&rr.name).is_none());
    }

    #[test]
    fn save_then_load_round_trips_unexpired_records() {
        let mut cache = Cache::new();
        let rr = a_record("shuckle.ru.nl.", Ipv4Addr::new(9, 9, 9, 9), 300);
        cache.insert(&rr, SystemTime::now());

        let dir = std::env::temp_dir();
        let path = dir.join(format!("dns-resolver-cache-test-{:?}.json", std::thread::current().id()));

        let stored = cache.to_stored_records();
        Cache::write_stored_records(&path, &stored).unwrap();
        let loaded = Cache::load(&path);

        let found = loaded.lookup(&rr.name, QueryType::Record(RecordType::A), QueryClass::Record(RecordClass::IN));
        assert_eq!(1, found.len());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_discards_already_expired_records() {
        let mut cache = Cache::new();
        let rr = a_record("shuckle.ru.nl.", Ipv4Addr::new(9, 9, 9, 9), 1);
        cache.insert(&rr, SystemTime::now());

        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "dns-resolver-cache-expiry-test-{:?}.json",
            std::thread::current().id()
        ));
        let stored = cache.to_stored_records();
        Cache::write_stored_records(&path, &stored).unwrap();

        sleep(Duration::from_secs(2));

        let loaded = Cache::load(&path);
        let found = loaded.lookup(&rr.name, QueryType::Record(RecordType::A), QueryClass::Record(RecordClass::IN));
        assert!(found.is_empty());

        let _ = std::fs::remove_file(&path);
    }
}
