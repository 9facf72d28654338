//! Feature and geometry counters

use crate::types::{Chunk, FeatureClass, GeometryClass};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Counts contributed by one imported chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterDelta {
    pub features: HashMap<FeatureClass, u64>,
    pub geometries: HashMap<GeometryClass, u64>,
}

impl CounterDelta {
    /// Count every feature and geometry of a chunk
    pub fn from_chunk(chunk: &Chunk) -> Self {
        let mut delta = Self::default();
        for feature in &chunk.features {
            *delta.features.entry(feature.class.clone()).or_default() += 1;
        }
        for geometry in &chunk.geometries {
            *delta.geometries.entry(geometry.class).or_default() += 1;
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.geometries.is_empty()
    }
}

/// Run-wide counter aggregates, safe for concurrent updates
#[derive(Debug, Default)]
pub struct ImportCounters {
    features: DashMap<FeatureClass, u64>,
    geometries: DashMap<GeometryClass, u64>,
}

impl ImportCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delta: &CounterDelta) {
        for (class, count) in &delta.features {
            *self.features.entry(class.clone()).or_default() += count;
        }
        for (class, count) in &delta.geometries {
            *self.geometries.entry(*class).or_default() += count;
        }
    }

    pub fn features(&self, class: &FeatureClass) -> u64 {
        self.features.get(class).map(|c| *c).unwrap_or(0)
    }

    pub fn geometries(&self, class: GeometryClass) -> u64 {
        self.geometries.get(&class).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            features: self
                .features
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            geometries: self
                .geometries
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }
}

/// Point-in-time copy of the counters, keyed by class name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub features: BTreeMap<String, u64>,
    pub geometries: BTreeMap<String, u64>,
}

impl CounterSnapshot {
    pub fn total_features(&self) -> u64 {
        self.features.values().sum()
    }

    pub fn total_geometries(&self) -> u64 {
        self.geometries.values().sum()
    }
}
