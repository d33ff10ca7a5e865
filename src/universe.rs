//! Universe collaborators and the per-date snapshot cache

use crate::error::{PipelineError, Result};
use crate::types::AssetId;
use chrono::NaiveDate;
use hashbrown::HashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

/// Source of the tradable asset set for a date
pub trait UniverseSource: Send + Sync {
    /// Ordered set of asset identifiers considered on `date`
    fn snapshot(&self, date: NaiveDate) -> Vec<AssetId>;
}

/// Same assets on every date
#[derive(Debug, Clone)]
pub struct StaticUniverse {
    assets: Vec<AssetId>,
}

impl StaticUniverse {
    pub fn new(assets: impl IntoIterator<Item = AssetId>) -> Self {
        let mut assets: Vec<AssetId> = assets.into_iter().collect();
        assets.sort_unstable();
        assets.dedup();
        Self { assets }
    }
}

impl UniverseSource for StaticUniverse {
    fn snapshot(&self, _date: NaiveDate) -> Vec<AssetId> {
        self.assets.clone()
    }
}

#[derive(Debug, Deserialize)]
struct MembershipRecord {
    date: NaiveDate,
    asset: AssetId,
}

/// Explicit per-date membership; dates without an entry are empty
#[derive(Debug, Clone, Default)]
pub struct DatedUniverse {
    members: BTreeMap<NaiveDate, Vec<AssetId>>,
}

impl DatedUniverse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, date: NaiveDate, assets: impl IntoIterator<Item = AssetId>) {
        let mut assets: Vec<AssetId> = assets.into_iter().collect();
        assets.sort_unstable();
        assets.dedup();
        self.members.insert(date, assets);
    }

    /// Load a two-column CSV `date,asset`
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut grouped: BTreeMap<NaiveDate, Vec<AssetId>> = BTreeMap::new();
        for record in csv_reader.deserialize() {
            let record: MembershipRecord = record?;
            grouped.entry(record.date).or_default().push(record.asset);
        }

        let mut universe = Self::new();
        for (date, assets) in grouped {
            universe.set(date, assets);
        }
        Ok(universe)
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            PipelineError::Data(format!("Failed to open {}: {}", path.display(), e))
        })?;
        Self::from_reader(file)
    }
}

impl UniverseSource for DatedUniverse {
    fn snapshot(&self, date: NaiveDate) -> Vec<AssetId> {
        self.members.get(&date).cloned().unwrap_or_default()
    }
}

/// Write-once-per-date cache of universe snapshots.
///
/// The map lock is only held to find or create the per-date cell; the
/// snapshot itself is fetched through `OnceLock`, so concurrent evaluations of
/// the same date block on a single fetch instead of repeating it.
pub struct UniverseCache {
    source: Arc<dyn UniverseSource>,
    entries: Mutex<HashMap<NaiveDate, Arc<OnceLock<Arc<Vec<AssetId>>>>>>,
}

impl UniverseCache {
    pub fn new(source: Arc<dyn UniverseSource>) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot for `date`, fetched at most once
    pub fn snapshot(&self, date: NaiveDate) -> Arc<Vec<AssetId>> {
        let cell = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries
                .entry(date)
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };

        cell.get_or_init(|| Arc::new(self.source.snapshot(date)))
            .clone()
    }

    /// Number of dates fetched so far
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|cell| cell.get().is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
