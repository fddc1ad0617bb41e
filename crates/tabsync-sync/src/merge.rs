//! Dataset Merger: left join of a primary dataset against key-unique secondaries.

use std::collections::{BTreeMap, HashMap, HashSet};

use tabsync_core::{MergedDataset, NormalizedDataset, NormalizedRecord};
use tracing::info;

use crate::error::JoinCardinalityError;

fn index_unique(dataset: &NormalizedDataset) -> Result<HashMap<&str, &NormalizedRecord>, JoinCardinalityError> {
    let mut index = HashMap::with_capacity(dataset.records.len());
    for record in &dataset.records {
        if index.insert(record.key.as_str(), record).is_some() {
            let occurrences = dataset.records.iter().filter(|r| r.key == record.key).count();
            return Err(JoinCardinalityError {
                dataset: dataset.name.clone(),
                key: record.key.clone(),
                occurrences,
            });
        }
    }
    Ok(index)
}

/// Every primary row is kept exactly once. Overlapping fields keep the primary value
/// and fill it from the secondary only when the primary value is null.
pub fn merge(
    primary: NormalizedDataset,
    secondaries: &[NormalizedDataset],
) -> Result<MergedDataset, JoinCardinalityError> {
    let mut fields = primary.fields.clone();
    let mut known: HashSet<String> = fields.iter().cloned().collect();
    for secondary in secondaries {
        for field in &secondary.fields {
            if known.insert(field.clone()) {
                fields.push(field.clone());
            }
        }
    }

    let indexes = secondaries
        .iter()
        .map(index_unique)
        .collect::<Result<Vec<_>, _>>()?;

    let mut match_counts: BTreeMap<String, usize> =
        secondaries.iter().map(|s| (s.name.clone(), 0)).collect();

    let mut records = primary.records;
    for record in &mut records {
        for (secondary, index) in secondaries.iter().zip(&indexes) {
            let Some(other) = index.get(record.key.as_str()) else {
                continue;
            };
            let mut populated = false;
            for field in &secondary.fields {
                let incoming = other.get(field);
                populated |= !incoming.is_null();
                if record.get(field).is_null() {
                    record.set(field.clone(), incoming.clone());
                }
            }
            if populated {
                *match_counts.entry(secondary.name.clone()).or_default() += 1;
            }
        }
        for field in &fields {
            record.fields.entry(field.clone()).or_default();
        }
    }

    info!(rows = records.len(), matches = ?match_counts, "merged datasets");
    Ok(MergedDataset {
        key_field: primary.key_field,
        fields,
        records,
        match_counts,
    })
}
