use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dns_resolver::cache::SharedCache;
use dns_resolver::recursive::{self, ResolverConfig};
use dns_types::protocol::types::*;
use dns_types::zones::types::Catalog;

mod zonefile;

/// How long a `recv_from` on the listening socket may block before
/// the accept loop re-checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum size of a datagram this server will read.
const MAX_DATAGRAM_SIZE: usize = 1024;

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// A recursive DNS name server: answers authoritatively from a small
/// zone catalog, falling back to recursive resolution via the root
/// servers for everything else.
struct Args {
    /// Port to listen on
    #[clap(short, long, value_parser, default_value_t = 5353)]
    port: u16,

    /// Consult and populate the shared record cache
    #[clap(short, long, action(clap::ArgAction::SetTrue))]
    caching: bool,

    /// Override the TTL of every record learned during resolution
    /// with this value; 0 (the default) means no override
    #[clap(short, long, value_parser, default_value_t = 0)]
    ttl: u32,

    /// Path to a JSON zone file to serve authoritatively; can be
    /// given more than once
    #[clap(short, long, value_parser)]
    zone_file: Vec<PathBuf>,

    /// Path to the on-disk cache file
    #[clap(long, value_parser, default_value = "cache.json")]
    cache_file: PathBuf,
}

fn begin_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Everything a query handler thread needs, cheaply clonable.
#[derive(Clone)]
struct HandlerState {
    catalog: Arc<Catalog>,
    cache: SharedCache,
    resolver_config: Arc<ResolverConfig>,
    socket: Arc<UdpSocket>,
    send_mutex: Arc<Mutex<()>>,
}

fn main() {
    let args = Args::parse();
    begin_logging();

    let catalog = Arc::new(zonefile::load_catalog(&args.zone_file));

    let cache = SharedCache::new();
    if args.caching {
        cache.load(&args.cache_file);
    }

    let resolver_config = Arc::new(ResolverConfig {
        caching: args.caching,
        ttl_override: if args.ttl > 0 { Some(args.ttl) } else { None },
        ..ResolverConfig::default()
    });

    tracing::info!(port = %args.port, caching = %args.caching, "binding DNS UDP socket");
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, args.port)) {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };
    if let Err(error) = socket.set_read_timeout(Some(ACCEPT_POLL_INTERVAL)) {
        tracing::error!(?error, "could not set socket read timeout");
        process::exit(1);
    }

    let state = HandlerState {
        catalog,
        cache: cache.clone(),
        resolver_config,
        socket: Arc::new(socket),
        send_mutex: Arc::new(Mutex::new(())),
    };

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        if let Err(error) = ctrlc::set_handler(move || {
            tracing::info!("received shutdown signal");
            done.store(true, Ordering::SeqCst);
        }) {
            tracing::error!(?error, "could not install signal handler");
            process::exit(1);
        }
    }

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    while !done.load(Ordering::SeqCst) {
        let (size, peer) = match state.socket.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(error) if is_timeout(&error) => continue,
            Err(error) => {
                tracing::warn!(?error, "socket error, continuing");
                continue;
            }
        };

        let datagram = buf[..size].to_vec();
        let state = state.clone();
        thread::spawn(move || handle_datagram(&state, &datagram, peer));
    }

    tracing::info!("shutting down");
    if args.caching {
        cache.save(&args.cache_file);
    }
}

fn is_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Decode, validate, answer, and send a response for one received
/// datagram. A decode failure or a multi-question query is dropped
/// silently, per the protocol's malformed-query handling.
fn handle_datagram(state: &HandlerState, datagram: &[u8], peer: SocketAddr) {
    let query = match Message::from_octets(datagram) {
        Ok(query) => query,
        Err(error) => {
            tracing::debug!(?peer, ?error, "dropping undecodable datagram");
            return;
        }
    };

    if query.questions.len() != 1 {
        tracing::debug!(?peer, count = query.questions.len(), "dropping multi-question query");
        return;
    }
    if query.header.reserved_z {
        tracing::debug!(?peer, "dropping query with reserved header bits set");
        return;
    }
    let question = &query.questions[0];

    let response = build_response(state, &query, question);

    let Ok(serialised) = response.to_octets() else {
        tracing::warn!(?peer, ?response, "failed to serialise response");
        return;
    };

    {
        let _guard = state.send_mutex.lock().expect("send mutex poisoned");
        if let Err(error) = state.socket.send_to(&serialised, peer) {
            tracing::debug!(?peer, ?error, "failed to send response");
        }
    }
}

fn build_response(state: &HandlerState, query: &Message, question: &Question) -> Message {
    let (answers, authorities, found) = state.catalog.lookup(&question.name, question.qtype);

    if found {
        let mut response = query.make_response();
        response.header.is_authoritative = true;
        response.answers = answers;
        response.authority = authorities;
        return response;
    }

    if query.header.recursion_desired {
        let default_ttl = state.resolver_config.ttl_override.unwrap_or(0);
        let resolved = recursive::resolve(
            &question.name.to_dotted_string(),
            &state.cache,
            &state.resolver_config,
        );

        let mut response = query.make_response();
        let mut owner = question.name.clone();
        for alias in &resolved.aliases {
            response.answers.push(ResourceRecord {
                name: owner.clone(),
                rtype_with_data: RecordTypeWithData::CNAME {
                    cname: alias.clone(),
                },
                rclass: RecordClass::IN,
                ttl: default_ttl,
            });
            owner = alias.clone();
        }
        for address in &resolved.addresses {
            response.answers.push(ResourceRecord {
                name: owner.clone(),
                rtype_with_data: RecordTypeWithData::A { address: *address },
                rclass: RecordClass::IN,
                ttl: default_ttl,
            });
        }
        return response;
    }

    query.make_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;

    fn server_state(catalog: Catalog) -> (HandlerState, UdpSocket) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(ACCEPT_POLL_INTERVAL)).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();

        let state = HandlerState {
            catalog: Arc::new(catalog),
            cache: SharedCache::new(),
            resolver_config: Arc::new(ResolverConfig::default()),
            socket: Arc::new(socket),
            send_mutex: Arc::new(Mutex::new(())),
        };
        (state, client)
    }

    #[test]
    fn authoritative_hit_sets_aa_and_copies_id() {
        use dns_types::zones::types::Zone;

        let mut zone = Zone::new(domain("ru.nl."));
        zone.insert(a_record("shuckle.ru.nl.", Ipv4Addr::new(1, 2, 3, 4), 300));
        let mut catalog = Catalog::new();
        catalog.insert(zone);

        let (state, _client) = server_state(catalog);

        let query = Message::from_question(
            4242,
            Question {
                name: domain("shuckle.ru.nl."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
            false,
        );
        let response = build_response(&state, &query, &query.questions[0]);

        assert_eq!(4242, response.header.id);
        assert!(response.header.is_authoritative);
        assert_eq!(1, response.answers.len());
    }

    #[test]
    fn non_recursive_miss_gets_an_empty_non_authoritative_response() {
        let (state, _client) = server_state(Catalog::new());

        let query = Message::from_question(
            7,
            Question {
                name: domain("example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
            false,
        );
        let response = build_response(&state, &query, &query.questions[0]);

        assert_eq!(7, response.header.id);
        assert!(!response.header.is_authoritative);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn end_to_end_datagram_round_trip() {
        use dns_types::zones::types::Zone;

        let mut zone = Zone::new(domain("ru.nl."));
        zone.insert(a_record("shuckle.ru.nl.", Ipv4Addr::new(1, 2, 3, 4), 300));
        let mut catalog = Catalog::new();
        catalog.insert(zone);

        let (state, client) = server_state(catalog);
        let server_addr = state.socket.local_addr().unwrap();

        let query = Message::from_question(
            99,
            Question {
                name: domain("shuckle.ru.nl."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
            false,
        );
        client.send_to(&query.to_octets().unwrap(), server_addr).unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (size, peer) = state.socket.recv_from(&mut buf).unwrap();
        let handle = {
            let state = state.clone();
            let datagram = buf[..size].to_vec();
            thread::spawn(move || handle_datagram(&state, &datagram, peer))
        };
        handle.join().unwrap();

        let mut reply_buf = [0u8; MAX_DATAGRAM_SIZE];
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (reply_size, _) = client.recv_from(&mut reply_buf).unwrap();
        let reply = Message::from_octets(&reply_buf[..reply_size]).unwrap();

        assert_eq!(99, reply.header.id);
        assert_eq!(1, reply.answers.len());
    }
}
