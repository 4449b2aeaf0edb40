//! Pairs portal records with at most one remote record.

use std::collections::HashMap;

use recon_core::{MatchType, PortalRecord, RemoteRecord};
use tracing::debug;

/// Lookup tables over one remote snapshot.
///
/// Id matches win over contact matches. When several remote records share a
/// contact id the one with the lowest remote id is used, so the pairing does
/// not depend on fetch order.
#[derive(Debug)]
pub struct Matcher<'a> {
    by_id: HashMap<&'a str, &'a RemoteRecord>,
    by_contact: HashMap<&'a str, &'a RemoteRecord>,
}

impl<'a> Matcher<'a> {
    pub fn new(remote: &'a [RemoteRecord]) -> Self {
        let mut by_id = HashMap::with_capacity(remote.len());
        let mut by_contact: HashMap<&'a str, &'a RemoteRecord> = HashMap::new();

        for record in remote {
            by_id.entry(record.id.as_str()).or_insert(record);

            if let Some(contact) = record.contact() {
                by_contact
                    .entry(contact)
                    .and_modify(|current| {
                        debug!(
                            contact,
                            existing = %current.id,
                            candidate = %record.id,
                            "several remote records share a contact"
                        );
                        if record.id < current.id {
                            *current = record;
                        }
                    })
                    .or_insert(record);
            }
        }

        Self { by_id, by_contact }
    }

    pub fn match_record(&self, portal: &PortalRecord) -> (MatchType, Option<&'a RemoteRecord>) {
        if let Some(remote) = portal.opportunity_id().and_then(|id| self.by_id.get(id)) {
            return (MatchType::IdMatch, Some(*remote));
        }
        if let Some(remote) = portal.contact_id().and_then(|id| self.by_contact.get(id)) {
            return (MatchType::ContactMatch, Some(*remote));
        }
        (MatchType::NoMatch, None)
    }
}
