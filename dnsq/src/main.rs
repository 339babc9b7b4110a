use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dns_resolver::cache::SharedCache;
use dns_resolver::recursive::{resolve, ResolverConfig};

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// DNS recursive lookup utility: resolves a hostname to its addresses
/// by walking the referral chain from the root servers, the same way
/// `resolved` does internally.
struct Args {
    /// Hostname to resolve
    hostname: String,

    /// Consult and populate the shared record cache
    #[clap(short, long, action(clap::ArgAction::SetTrue))]
    caching: bool,

    /// Override the TTL of every record learned during resolution
    /// with this value; 0 (the default) means no override
    #[clap(short, long, value_parser, default_value_t = 0)]
    ttl: u32,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = ResolverConfig {
        caching: args.caching,
        ttl_override: if args.ttl > 0 { Some(args.ttl) } else { None },
        ..ResolverConfig::default()
    };

    tracing::debug!(hostname = %args.hostname, caching = %args.caching, ttl = %args.ttl, "resolving");
    let resolved = resolve(&args.hostname, &SharedCache::new(), &config);
    tracing::debug!(?resolved, "resolved");

    println!(";; QUESTION");
    println!("{}\tIN\tA", resolved.qname);

    if resolved.addresses.is_empty() && resolved.aliases.is_empty() {
        println!("\n;; ANSWER");
        println!("; resolution failed");
        process::exit(1);
    }

    println!("\n;; ANSWER");
    let mut owner = resolved.qname.clone();
    for alias in &resolved.aliases {
        println!("{owner}\tCNAME\t{alias}");
        owner = alias.to_dotted_string();
    }
    for address in &resolved.addresses {
        println!("{owner}\tA\t{address}");
    }
}
