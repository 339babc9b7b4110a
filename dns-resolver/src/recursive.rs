use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime};

use dns_types::protocol::types::*;

use crate::cache::SharedCache;
use crate::util::hostname::is_valid_hostname;
use crate::util::nameserver::query_nameserver;

/// The 13 IPv4 root server addresses (A-M), compiled in as the
/// ultimate fallback hints for the referral loop.
pub const ROOT_SERVERS: [Ipv4Addr; 13] = [
    Ipv4Addr::new(198, 41, 0, 4),
    Ipv4Addr::new(192, 228, 79, 201),
    Ipv4Addr::new(192, 33, 4, 12),
    Ipv4Addr::new(199, 7, 91, 13),
    Ipv4Addr::new(192, 203, 230, 10),
    Ipv4Addr::new(192, 5, 5, 241),
    Ipv4Addr::new(192, 112, 36, 4),
    Ipv4Addr::new(198, 97, 190, 53),
    Ipv4Addr::new(192, 36, 148, 17),
    Ipv4Addr::new(192, 58, 128, 30),
    Ipv4Addr::new(193, 0, 14, 129),
    Ipv4Addr::new(199, 7, 83, 42),
    Ipv4Addr::new(202, 12, 27, 33),
];

/// Configuration for a single `resolve` call.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Addresses tried before the root servers.
    pub seed_nameservers: Vec<Ipv4Addr>,
    /// Per-hint UDP timeout.
    pub timeout: Duration,
    /// Bound on CNAME chain length, to guarantee termination on an
    /// adversarial alias loop.
    pub max_aliases: usize,
    /// Whether the shared cache is consulted and populated at all.
    /// When `false`, every `resolve` call does a fresh referral walk
    /// and never reads or writes `cache` (the `-c`/`--caching` CLI
    /// flag is wired to this).
    pub caching: bool,
    /// When set to a nonzero value, every record ingested during a
    /// referral walk is stamped with this TTL before it is cached,
    /// overriding whatever TTL the upstream nameserver sent. `None`
    /// (the `-t`/`--ttl` default of 0) means no override: cache the
    /// record's own TTL.
    pub ttl_override: Option<u32>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            seed_nameservers: Vec::new(),
            timeout: Duration::from_secs(5),
            max_aliases: 16,
            caching: true,
            ttl_override: None,
        }
    }
}

/// The outcome of a `resolve` call: the name as given by the caller,
/// the chain of CNAME aliases followed on the way to an answer (if
/// any), and the addresses found for the final name in that chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub qname: String,
    pub aliases: Vec<DomainName>,
    pub addresses: Vec<Ipv4Addr>,
}

impl Resolved {
    fn empty(qname: &str) -> Self {
        Resolved {
            qname: qname.to_string(),
            aliases: Vec::new(),
            addresses: Vec::new(),
        }
    }
}

/// A pending referral target: either an address ready to query, or a
/// nameserver name that first needs its own address resolved.
#[derive(Debug, Clone)]
enum Hint {
    Address(Ipv4Addr),
    Name(DomainName),
}

/// Resolve a hostname by validating it, checking the cache, and, on a
/// miss, walking a hint stack of nameservers seeded with
/// `config.seed_nameservers` followed by the root servers.
///
/// This never returns an error: validation failure, referral
/// exhaustion, and network failure all surface as an empty alias and
/// address list, never as an exception to the caller.
pub fn resolve(qname_str: &str, cache: &SharedCache, config: &ResolverConfig) -> Resolved {
    let mut visited_ns_names = HashSet::new();
    resolve_inner(qname_str, cache, config, &mut visited_ns_names)
}

fn resolve_inner(
    qname_str: &str,
    cache: &SharedCache,
    config: &ResolverConfig,
    visited_ns_names: &mut HashSet<DomainName>,
) -> Resolved {
    if !is_valid_hostname(qname_str) {
        return Resolved::empty(qname_str);
    }
    let Some(qname) = DomainName::from_dotted_string(qname_str) else {
        return Resolved::empty(qname_str);
    };

    let mut aliases = Vec::new();

    // Cache hit path: follow any CNAME chain already on file before
    // doing any network activity. Skipped entirely when caching is
    // disabled, since there is nothing meaningful to have been
    // populated by a prior call.
    if config.caching {
        let mut current = qname.clone();
        loop {
            let a_hits = cache.lookup(
                &current,
                QueryType::Record(RecordType::A),
                QueryClass::Record(RecordClass::IN),
            );
            if !a_hits.is_empty() {
                return Resolved {
                    qname: qname_str.to_string(),
                    aliases,
                    addresses: extract_addresses(&a_hits),
                };
            }

            let cname_hits = cache.lookup(
                &current,
                QueryType::Record(RecordType::CNAME),
                QueryClass::Record(RecordClass::IN),
            );
            match first_cname_target(&cname_hits) {
                Some(target) if aliases.len() < config.max_aliases && !aliases.contains(&target) => {
                    aliases.push(target.clone());
                    current = target;
                }
                _ => break,
            }
        }
    }

    let mut accept_names: HashSet<DomainName> = HashSet::new();
    accept_names.insert(qname.clone());
    accept_names.extend(aliases.iter().cloned());

    let mut glue: HashMap<DomainName, Ipv4Addr> = HashMap::new();
    let mut stack: VecDeque<Hint> = VecDeque::new();
    for ip in &config.seed_nameservers {
        stack.push_back(Hint::Address(*ip));
    }
    for ip in ROOT_SERVERS {
        stack.push_back(Hint::Address(ip));
    }

    while let Some(hint) = stack.pop_front() {
        let address = match hint {
            Hint::Address(ip) => ip,
            Hint::Name(ns_name) => match resolve_nameserver_address(
                &ns_name,
                &glue,
                cache,
                config,
                visited_ns_names,
            ) {
                Some(ip) => ip,
                None => continue,
            },
        };

        let Some(response) = query_nameserver(
            SocketAddr::new(address.into(), 53),
            &qname,
            config.timeout,
        ) else {
            continue;
        };

        let acquired_at = SystemTime::now();
        for rr in response
            .answers
            .iter()
            .chain(response.authority.iter())
            .chain(response.additional.iter())
        {
            if config.caching {
                match config.ttl_override {
                    Some(ttl) => {
                        let mut overridden = rr.clone();
                        overridden.ttl = ttl;
                        cache.insert_at(&overridden, acquired_at);
                    }
                    None => cache.insert_at(rr, acquired_at),
                }
            }
            if let RecordTypeWithData::A { address } = &rr.rtype_with_data {
                glue.insert(rr.name.clone(), *address);
            }
        }

        let mut found_addresses = Vec::new();
        for rr in response.answers.iter().chain(response.additional.iter()) {
            if !accept_names.contains(&rr.name) {
                continue;
            }
            match &rr.rtype_with_data {
                RecordTypeWithData::A { address } => found_addresses.push(*address),
                RecordTypeWithData::CNAME { cname } => {
                    if aliases.len() < config.max_aliases && !aliases.contains(cname) {
                        aliases.push(cname.clone());
                        accept_names.insert(cname.clone());
                    }
                }
                _ => (),
            }
        }

        if !found_addresses.is_empty() {
            return Resolved {
                qname: qname_str.to_string(),
                aliases,
                addresses: found_addresses,
            };
        }

        for rr in &response.authority {
            if let RecordTypeWithData::NS { nsdname } = &rr.rtype_with_data {
                stack.push_front(Hint::Name(nsdname.clone()));
            }
        }
    }

    Resolved {
        qname: qname_str.to_string(),
        aliases,
        addresses: Vec::new(),
    }
}

/// Resolve a nameserver name found in a referral's authority section
/// to an address: prefer glue co-delivered with the referral, falling
/// back to a recursive lookup. A name is never recursively resolved
/// more than once within a single outer `resolve` call.
fn resolve_nameserver_address(
    ns_name: &DomainName,
    glue: &HashMap<DomainName, Ipv4Addr>,
    cache: &SharedCache,
    config: &ResolverConfig,
    visited_ns_names: &mut HashSet<DomainName>,
) -> Option<Ipv4Addr> {
    if let Some(address) = glue.get(ns_name) {
        return Some(*address);
    }
    if !visited_ns_names.insert(ns_name.clone()) {
        return None;
    }
    resolve_inner(&ns_name.to_dotted_string(), cache, config, visited_ns_names)
        .addresses
        .first()
        .copied()
}

fn extract_addresses(rrs: &[ResourceRecord]) -> Vec<Ipv4Addr> {
    rrs.iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::A { address } => Some(*address),
            _ => None,
        })
        .collect()
}

fn first_cname_target(rrs: &[ResourceRecord]) -> Option<DomainName> {
    rrs.iter().find_map(|rr| match &rr.rtype_with_data {
        RecordTypeWithData::CNAME { cname } => Some(cname.clone()),
        _ => None,
    })
}
