//! Snapshot catalogs read from `zfs get -Hp creation` output
//!
//! A catalog is the set of snapshots found on one endpoint at one instant. Records are
//! kept in chain order: ascending creation time, with equal creation times ordered by
//! snapshot name so that the order is always total.

use std::collections::{BTreeSet, HashMap};

/// One named, timestamped snapshot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotRecord {
    /// Creation time in seconds since the epoch
    pub creation: u64,
    /// Snapshot name, the part after `@`
    pub name: String,
}

impl SnapshotRecord {
    pub fn new(name: impl Into<String>, creation: u64) -> Self {
        Self {
            creation,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SnapshotRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotCatalog {
    records: BTreeSet<SnapshotRecord>,
    by_name: HashMap<String, u64>,
}

impl SnapshotCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse tab-separated `zfs get` output, one snapshot per line.
    ///
    /// Lines that are not `<dataset>@<name>\tcreation\t<epoch>\t<source>` are skipped, so a
    /// catalog is never rejected as a whole because of malformed input.
    pub fn parse(output: &str) -> Self {
        let mut catalog = Self::new();
        for line in output.lines() {
            match parse_line(line) {
                Some(record) => {
                    catalog.insert(record);
                }
                None => tracing::debug!("skipping catalog line: {:?}", line),
            }
        }
        catalog
    }

    /// Add a record, returns false if a snapshot with the same name is already present
    pub fn insert(&mut self, record: SnapshotRecord) -> bool {
        if let Some(creation) = self.by_name.get(&record.name) {
            tracing::warn!(
                "duplicate snapshot name {:?} (creation {} and {}), keeping the first one",
                record.name,
                creation,
                record.creation
            );
            return false;
        }
        self.by_name.insert(record.name.clone(), record.creation);
        self.records.insert(record);
        true
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn creation_of(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// Snapshot created at the given time; the first one in chain order on collisions
    pub fn name_at(&self, creation: u64) -> Option<&str> {
        self.records
            .iter()
            .find(|record| record.creation == creation)
            .map(|record| record.name.as_str())
    }

    /// Records in chain order
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<SnapshotRecord> for SnapshotCatalog {
    fn from_iter<I: IntoIterator<Item = SnapshotRecord>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for record in iter {
            catalog.insert(record);
        }
        catalog
    }
}

impl<'a> IntoIterator for &'a SnapshotCatalog {
    type Item = &'a SnapshotRecord;
    type IntoIter = std::collections::btree_set::Iter<'a, SnapshotRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

fn parse_line(line: &str) -> Option<SnapshotRecord> {
    let mut fields = line.trim().split('\t');
    let dataset = fields.next()?;
    let property = fields.next()?;
    let value = fields.next()?;
    // the property source column ("-" for creation) must be there but is not used
    fields.next()?;
    if property != "creation" {
        return None;
    }
    let (_, name) = dataset.rsplit_once('@')?;
    if name.is_empty() {
        return None;
    }
    let creation = value.parse::<u64>().ok()?;
    Some(SnapshotRecord::new(name, creation))
}
