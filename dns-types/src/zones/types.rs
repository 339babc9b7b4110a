//! The authoritative zone catalog (`Catalog`): a read-only mapping
//! from fully qualified names to record sets, grouped into `Zone`s by
//! their root.  Populating a zone from a master file is outside this
//! crate's scope (see the CLI's `--zone-file` flag for the reduced,
//! structured stand-in this implementation accepts instead); this
//! module models only the data and the lookup algorithm of RFC 1034
//! section 4.3.2 step 3.

use std::collections::HashMap;

use crate::protocol::types::*;

/// All the records for which some server is authoritative, rooted at
/// `root` and keyed by their exact owner name.
#[derive(Debug, Clone)]
pub struct Zone {
    root: DomainName,
    records: HashMap<DomainName, Vec<ResourceRecord>>,
}

impl Zone {
    pub fn new(root: DomainName) -> Self {
        Self {
            root,
            records: HashMap::new(),
        }
    }

    pub fn root(&self) -> &DomainName {
        &self.root
    }

    /// Insert a record at its owner name.  The caller is responsible
    /// for ensuring `rr.name` is a subdomain of (or equal to) the
    /// zone's root; records at other names are simply never found by
    /// `lookup`.
    pub fn insert(&mut self, rr: ResourceRecord) {
        self.records.entry(rr.name.clone()).or_default().push(rr);
    }

    /// The record set stored at exactly this name.
    pub fn records_at(&self, name: &DomainName) -> &[ResourceRecord] {
        self.records.get(name).map_or(&[], Vec::as_slice)
    }
}

/// A collection of zones.  `lookup` is the only operation: select the
/// zone whose root is the longest suffix of the query name, then walk
/// suffixes of the query name from most to least specific, collecting
/// matching answers and NS authorities, restarting within the zone on
/// a CNAME match.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    zones: HashMap<DomainName, Zone>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            zones: HashMap::new(),
        }
    }

    /// Create or replace the zone with this root.
    pub fn insert(&mut self, zone: Zone) {
        self.zones.insert(zone.root.clone(), zone);
    }

    /// The zone whose root is the longest suffix of `name`, if any.
    fn zone_for(&self, name: &DomainName) -> Option<&Zone> {
        let mut best: Option<&Zone> = None;
        for zone in self.zones.values() {
            if name == &zone.root || name.is_subdomain_of(&zone.root) {
                let is_longer = match best {
                    Some(b) => zone.root.labels.len() > b.root.labels.len(),
                    None => true,
                };
                if is_longer {
                    best = Some(zone);
                }
            }
        }
        best
    }

    /// Look up `qname`/`qtype` against the catalog.  `found` is
    /// `true` iff the answer or authority sets are non-empty; a zone
    /// that merely claims the name but has no matching records at any
    /// suffix (and no NS delegation) yields `found = false`, same as
    /// no zone claiming the name at all.
    pub fn lookup(
        &self,
        qname: &DomainName,
        qtype: QueryType,
    ) -> (Vec<ResourceRecord>, Vec<ResourceRecord>, bool) {
        match self.zone_for(qname) {
            Some(zone) => {
                let (answers, authorities) = Self::lookup_in_zone(zone, qname, qtype, 0);
                let found = !answers.is_empty() || !authorities.is_empty();
                (answers, authorities, found)
            }
            None => (Vec::new(), Vec::new(), false),
        }
    }

    /// Bound on CNAME-restart depth within a single zone lookup, so a
    /// zone misconfigured with a CNAME cycle cannot hang the server.
    const MAX_CNAME_RESTARTS: usize = 16;

    fn lookup_in_zone(
        zone: &Zone,
        qname: &DomainName,
        qtype: QueryType,
        restarts: usize,
    ) -> (Vec<ResourceRecord>, Vec<ResourceRecord>) {
        let mut answers = Vec::new();
        let mut authorities = Vec::new();
        let mut cname_target = None;

        for suffix in qname.suffixes() {
            for rr in zone.records_at(&suffix) {
                let rtype = rr.rtype_with_data.rtype();
                if rtype == RecordType::NS {
                    authorities.push(rr.clone());
                } else if rtype.matches(&qtype) {
                    answers.push(rr.clone());
                } else if rtype == RecordType::CNAME
                    && qtype != QueryType::Record(RecordType::CNAME)
                {
                    if let RecordTypeWithData::CNAME { cname } = &rr.rtype_with_data {
                        answers.push(rr.clone());
                        if suffix == *qname && cname_target.is_none() {
                            cname_target = Some(cname.clone());
                        }
                    }
                }
            }
        }

        if restarts < Self::MAX_CNAME_RESTARTS {
            if let Some(target) = cname_target {
                let (mut more_answers, mut more_authorities) =
                    Self::lookup_in_zone(zone, &target, qtype, restarts + 1);
                answers.append(&mut more_answers);
                authorities.append(&mut more_authorities);
            }
        }

        (answers, authorities)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::protocol::types::test_util::*;

    fn example_zone() -> Zone {
        let mut zone = Zone::new(domain("ru.nl."));
        zone.insert(a_record("shuckle.ru.nl.", Ipv4Addr::new(1, 2, 3, 4), 300));
        zone.insert(ns_record("cs.ru.nl.", "secondary.cs.ru.nl.", 300));
        zone.insert(a_record(
            "secondary.cs.ru.nl.",
            Ipv4Addr::new(131, 174, 16, 6),
            300,
        ));
        zone
    }

    #[test]
    fn authoritative_hit() {
        let mut catalog = Catalog::new();
        catalog.insert(example_zone());

        let (answers, authorities, found) =
            catalog.lookup(&domain("shuckle.ru.nl."), QueryType::Record(RecordType::A));
        assert!(found);
        assert_eq!(1, answers.len());
        assert!(authorities.is_empty());
    }

    #[test]
    fn referral_has_no_answer_but_is_found() {
        let mut catalog = Catalog::new();
        catalog.insert(example_zone());

        let (answers, authorities, found) =
            catalog.lookup(&domain("cs.ru.nl."), QueryType::Record(RecordType::A));
        assert!(found);
        assert!(answers.is_empty());
        assert_eq!(1, authorities.len());
    }

    #[test]
    fn no_zone_claims_name() {
        let catalog = Catalog::new();
        let (answers, authorities, found) =
            catalog.lookup(&domain("example.com."), QueryType::Record(RecordType::A));
        assert!(!found);
        assert!(answers.is_empty());
        assert!(authorities.is_empty());
    }

    #[test]
    fn cname_restarts_within_zone() {
        let mut zone = Zone::new(DomainName::root_domain());
        zone.insert(cname_record("alias.example.", "target.example.", 300));
        zone.insert(a_record("target.example.", Ipv4Addr::new(9, 9, 9, 9), 300));
        let mut catalog = Catalog::new();
        catalog.insert(zone);

        let (answers, _, found) =
            catalog.lookup(&domain("alias.example."), QueryType::Record(RecordType::A));
        assert!(found);
        assert_eq!(2, answers.len());
    }
}
