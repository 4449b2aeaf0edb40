//! Field-level comparison of matched pairs.

use recon_core::{
    normalize_value, values_equal, ComparisonResult, Difference, DifferenceKind, FieldMap,
    LookupSource, MatchType, PortalRecord, RemoteRecord,
};

use crate::matcher::Matcher;

/// Field label used for the single difference of an unmatched record.
pub const MISSING_RECORD_FIELD: &str = "record";

/// Prefix separating unmapped remote custom fields from mapped fields.
pub const REMOTE_ONLY_PREFIX: &str = "remote:";

fn normalized(raw: Option<&str>) -> Option<String> {
    normalize_value(raw).map(ToString::to_string)
}

pub struct Differ<'a> {
    field_map: &'a FieldMap,
}

impl<'a> Differ<'a> {
    pub fn new(field_map: &'a FieldMap) -> Self {
        Self { field_map }
    }

    /// Differences in stable order: basic-attribute fields in table order,
    /// then custom fields in table order, then unmapped remote custom fields
    /// in fetch order.
    pub fn diff(&self, portal: &PortalRecord, remote: &RemoteRecord) -> Vec<Difference> {
        let mut basic = Vec::new();
        let mut custom = Vec::new();

        for mapping in &self.field_map.mappings {
            let lookup = mapping.resolve(remote);
            let portal_value = portal.field_text(&mapping.portal_field);
            if values_equal(portal_value.as_deref(), lookup.value.as_deref()) {
                continue;
            }

            let (bucket, kind) = match lookup.source {
                LookupSource::Basic => (&mut basic, DifferenceKind::Basic),
                LookupSource::Custom => (&mut custom, DifferenceKind::Custom),
            };
            bucket.push(Difference {
                field: mapping.portal_field.clone(),
                portal_value: normalized(portal_value.as_deref()),
                remote_value: normalized(lookup.value.as_deref()),
                kind,
            });
        }

        let mapped = self.field_map.mapped_remote_ids();
        let remote_only = remote
            .custom_fields
            .iter()
            .filter(|field| !mapped.contains(field.id.as_str()))
            .filter_map(|field| {
                let value = normalized(field.text().as_deref())?;
                Some(Difference {
                    field: format!("{REMOTE_ONLY_PREFIX}{}", field.display_name()),
                    portal_value: None,
                    remote_value: Some(value),
                    kind: DifferenceKind::RemoteOnly,
                })
            });

        basic.extend(custom);
        basic.extend(remote_only);
        basic
    }

    pub fn unmatched(&self, portal: PortalRecord) -> ComparisonResult {
        let label = portal.label(self.field_map.label_field());
        ComparisonResult {
            portal_record: portal,
            remote_record: None,
            match_type: MatchType::NoMatch,
            differences: vec![Difference {
                field: MISSING_RECORD_FIELD.to_string(),
                portal_value: Some(label),
                remote_value: None,
                kind: DifferenceKind::Missing,
            }],
        }
    }
}

/// Match every portal record and diff the matched pairs. Output order
/// follows the portal input.
pub fn compare(
    portal: &[PortalRecord],
    remote: &[RemoteRecord],
    field_map: &FieldMap,
) -> Vec<ComparisonResult> {
    let matcher = Matcher::new(remote);
    let differ = Differ::new(field_map);

    portal
        .iter()
        .map(|record| match matcher.match_record(record) {
            (match_type, Some(remote)) => ComparisonResult {
                portal_record: record.clone(),
                remote_record: Some(remote.clone()),
                match_type,
                differences: differ.diff(record, remote),
            },
            (_, None) => differ.unmatched(record.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::{CustomField, FieldMapping};
    use serde_json::json;

    fn field_map() -> FieldMap {
        FieldMap::new(vec![
            FieldMapping::custom("contactPhone", "PHONE_ID"),
            FieldMapping::basic("contactName", "contact.name").with_fallback_field_id("NAME_ID"),
            FieldMapping::custom("loanRequest", "LOAN_ID"),
            FieldMapping::basic("dealName", "name"),
        ])
        .expect("valid map")
        .with_label_field("dealName")
    }

    #[test]
    fn phone_formatting_difference_is_reported_verbatim() {
        let portal = vec![PortalRecord::new("d1")
            .with_field("contactPhone", "5551234567")
            .with_remote_ids(Some("opp1"), None)];
        let remote = vec![RemoteRecord::new("opp1")
            .with_contact_id("c1")
            .with_custom_field(CustomField::new("PHONE_ID", "phone", "555-123-4567"))];
        let map = FieldMap::new(vec![FieldMapping::custom("contactPhone", "PHONE_ID")]).unwrap();

        let results = compare(&portal, &remote, &map);
        assert_eq!(results[0].match_type, MatchType::IdMatch);
        assert_eq!(
            results[0].differences,
            vec![Difference {
                field: "contactPhone".into(),
                portal_value: Some("5551234567".into()),
                remote_value: Some("555-123-4567".into()),
                kind: DifferenceKind::Custom,
            }]
        );
    }

    #[test]
    fn ordering_is_basic_then_custom_then_remote_only() {
        let portal = PortalRecord::new("d1")
            .with_field("contactPhone", "1")
            .with_field("contactName", "Old Name")
            .with_field("loanRequest", "$52M")
            .with_field("dealName", "Old Deal");
        let remote = RemoteRecord::new("opp1")
            .with_attribute("name", "New Deal")
            .with_attribute("contact", json!({ "name": "New Name" }))
            .with_custom_field(CustomField::new("EXTRA_2", "broker", "Jane"))
            .with_custom_field(CustomField::new("LOAN_ID", "loan", "52000000"))
            .with_custom_field(CustomField::new("PHONE_ID", "phone", "2"))
            .with_custom_field(CustomField::new("EXTRA_1", "", "  lender  "))
            .with_custom_field(CustomField::new("EXTRA_3", "blank", "(empty)"));

        let map = field_map();
        let diffs = Differ::new(&map).diff(&portal, &remote);
        let fields = diffs.iter().map(|d| d.field.as_str()).collect::<Vec<_>>();
        assert_eq!(
            fields,
            vec![
                "contactName",
                "dealName",
                "contactPhone",
                "loanRequest",
                "remote:broker",
                "remote:EXTRA_1",
            ]
        );
        assert_eq!(diffs[4].kind, DifferenceKind::RemoteOnly);
        assert_eq!(diffs[5].remote_value.as_deref(), Some("lender"));
        assert_eq!(diffs[3].portal_value.as_deref(), Some("$52M"));
    }

    #[test]
    fn fallback_lookup_reports_custom_kind() {
        let portal = PortalRecord::new("d1").with_field("contactName", "Ada");
        let remote = RemoteRecord::new("opp1")
            .with_custom_field(CustomField::new("NAME_ID", "name", "Ada L."));
        let map = field_map();
        let diffs = Differ::new(&map).diff(&portal, &remote);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].field, "contactName");
        assert_eq!(diffs[0].kind, DifferenceKind::Custom);
    }

    #[test]
    fn empty_forms_compare_equal_and_yield_no_differences() {
        let portal = PortalRecord::new("d1")
            .with_field("contactPhone", " (empty) ")
            .with_field("contactName", "  Ada  ")
            .with_field("loanRequest", "")
            .with_field("dealName", "Main St");
        let remote = RemoteRecord::new("opp1")
            .with_attribute("name", "Main St ")
            .with_attribute("contact", json!({ "name": "Ada" }))
            .with_custom_field(CustomField::new("PHONE_ID", "phone", json!(null)))
            .with_custom_field(CustomField::new("UNMAPPED", "note", "   "));
        let map = field_map();
        assert!(Differ::new(&map).diff(&portal, &remote).is_empty());
    }

    #[test]
    fn unmatched_record_carries_exactly_one_missing_difference() {
        let portal = vec![PortalRecord::new("d3")
            .with_field("dealName", "Harbor View")
            .with_remote_ids(Some("opp-gone"), Some("c9"))];
        let results = compare(&portal, &[], &field_map());

        assert_eq!(results[0].match_type, MatchType::NoMatch);
        assert!(results[0].remote_record.is_none());
        assert_eq!(results[0].differences.len(), 1);
        assert_eq!(results[0].differences[0].kind, DifferenceKind::Missing);
        assert_eq!(
            results[0].differences[0].portal_value.as_deref(),
            Some("Harbor View")
        );
        assert!(!results[0].needs_sync());
    }

    #[test]
    fn compare_is_deterministic_for_fixed_inputs() {
        let portal = vec![
            PortalRecord::new("d1").with_remote_ids(None, Some("c1")),
            PortalRecord::new("d2").with_remote_ids(Some("opp5"), None),
        ];
        let remote = vec![
            RemoteRecord::new("opp7").with_contact_id("c1"),
            RemoteRecord::new("opp5"),
            RemoteRecord::new("opp4").with_contact_id("c1"),
        ];
        let map = field_map();
        let first = compare(&portal, &remote, &map);
        let second = compare(&portal, &remote, &map);
        assert_eq!(first, second);
        assert_eq!(
            first[0].remote_record.as_ref().map(|r| r.id.as_str()),
            Some("opp4")
        );
    }
}
