//! Loading the authoritative zone catalog from disk.
//!
//! The master-file text format of RFC 1035 section 5 is out of scope
//! here (this implementation is specified only by the records it
//! yields); instead a zone file is a JSON document naming a zone root
//! and the record set to serve for it, in the same scalar-rdata shape
//! the cache file uses. Several files, each describing one zone, can
//! be supplied with repeated `--zone-file` flags.

use std::fs;
use std::path::Path;

use base64::Engine;
use serde::Deserialize;

use dns_types::protocol::types::*;
use dns_types::zones::types::{Catalog, Zone};

#[derive(Debug, Deserialize)]
struct ZoneFile {
    root: String,
    records: Vec<ZoneFileRecord>,
}

#[derive(Debug, Deserialize)]
struct ZoneFileRecord {
    name: String,
    #[serde(rename = "type")]
    rtype: String,
    class: String,
    ttl: u32,
    rdata: String,
}

/// Parse one zone file and merge it into `catalog`. Returns an error
/// string (rather than failing the whole server) so the caller can
/// log which file was at fault and carry on with the rest.
fn load_one(path: &Path, catalog: &mut Catalog) -> Result<(), String> {
    let contents =
        fs::read_to_string(path).map_err(|err| format!("could not read file: {err}"))?;
    let parsed: ZoneFile =
        serde_json::from_str(&contents).map_err(|err| format!("could not parse JSON: {err}"))?;

    let root = DomainName::from_dotted_string(&parsed.root)
        .ok_or_else(|| format!("invalid zone root {:?}", parsed.root))?;
    let mut zone = Zone::new(root);

    for record in parsed.records {
        let name = DomainName::from_dotted_string(&record.name)
            .ok_or_else(|| format!("invalid record name {:?}", record.name))?;
        let rtype: RecordType = record
            .rtype
            .parse()
            .map_err(|_| format!("invalid record type {:?}", record.rtype))?;
        let rclass: RecordClass = record
            .class
            .parse()
            .map_err(|_| format!("invalid record class {:?}", record.class))?;
        let rtype_with_data = rdata_from_string(rtype, &record.rdata)
            .ok_or_else(|| format!("invalid rdata {:?} for type {:?}", record.rdata, rtype))?;

        zone.insert(ResourceRecord {
            name,
            rtype_with_data,
            rclass,
            ttl: record.ttl,
        });
    }

    catalog.insert(zone);
    Ok(())
}

/// Load every zone file given on the command line into a single
/// catalog. A file that fails to load is logged and skipped, rather
/// than failing startup: the server should still serve whatever it
/// could load, falling back to recursive resolution for the rest.
pub fn load_catalog(paths: &[impl AsRef<Path>]) -> Catalog {
    let mut catalog = Catalog::new();
    for path in paths {
        let path = path.as_ref();
        if let Err(err) = load_one(path, &mut catalog) {
            tracing::warn!(path = %path.display(), %err, "failed to load zone file, skipping");
        }
    }
    catalog
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
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "resolved-zonefile-test-{name}-{:?}",
            std::thread::current().id()
        ))
    }

    #[test]
    fn loads_a_well_formed_zone_file() {
        let path = temp_path("well-formed");
        fs::write(
            &path,
            r#"{
                "root": "ru.nl.",
                "records": [
                    {"name": "shuckle.ru.nl.", "type": "A", "class": "IN", "ttl": 300, "rdata": "1.2.3.4"},
                    {"name": "cs.ru.nl.", "type": "NS", "class": "IN", "ttl": 300, "rdata": "secondary.cs.ru.nl."},
                    {"name": "secondary.cs.ru.nl.", "type": "A", "class": "IN", "ttl": 300, "rdata": "131.174.16.6"}
                ]
            }"#,
        )
        .unwrap();

        let catalog = load_catalog(&[&path]);
        let (answers, _, found) = catalog.lookup(
            &DomainName::from_dotted_string("shuckle.ru.nl.").unwrap(),
            QueryType::Record(RecordType::A),
        );
        assert!(found);
        assert_eq!(1, answers.len());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_yields_an_empty_catalog() {
        let catalog = load_catalog(&["/nonexistent/path/to/a/zone.json"]);
        let (_, _, found) = catalog.lookup(
            &DomainName::from_dotted_string("example.com.").unwrap(),
            QueryType::Record(RecordType::A),
        );
        assert!(!found);
    }

    #[test]
    fn file_with_a_malformed_record_is_skipped_entirely() {
        let path = temp_path("malformed-record");
        fs::write(
            &path,
            r#"{
                "root": "ru.nl.",
                "records": [
                    {"name": "shuckle.ru.nl.", "type": "A", "class": "IN", "ttl": 300, "rdata": "not-an-ip"}
                ]
            }"#,
        )
        .unwrap();

        let catalog = load_catalog(&[&path]);
        let (_, _, found) = catalog.lookup(
            &DomainName::from_dotted_string("shuckle.ru.nl.").unwrap(),
            QueryType::Record(RecordType::A),
        );
        assert!(!found);

        let _ = fs::remove_file(&path);
    }
}
