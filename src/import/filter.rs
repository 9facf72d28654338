//! Input and element-ordinal filters

use super::source::ImportError;
use crate::config::{AppearanceConfig, FilterConfig};
use crate::types::FeatureClass;
use std::collections::HashSet;

/// Decides which feature classes a reader hands out
#[derive(Debug, Clone, Default)]
pub struct InputFilter {
    /// Allowed classes (`None` = all)
    classes: Option<HashSet<FeatureClass>>,
    import_appearance: bool,
}

impl InputFilter {
    pub fn new(classes: Option<HashSet<FeatureClass>>, import_appearance: bool) -> Self {
        Self {
            classes,
            import_appearance,
        }
    }

    pub fn from_config(
        filter: &FilterConfig,
        appearance: &AppearanceConfig,
    ) -> Result<Self, ImportError> {
        let classes = if filter.feature_classes.is_empty() {
            None
        } else {
            let mut set = HashSet::new();
            for name in &filter.feature_classes {
                let class = FeatureClass::parse(name)
                    .ok_or_else(|| ImportError::Config(format!("unknown feature class '{}'", name)))?;
                set.insert(class);
            }
            Some(set)
        };
        Ok(Self::new(classes, appearance.import_appearance))
    }

    /// Whether chunks of this class should be imported
    pub fn accept(&self, class: &FeatureClass) -> bool {
        if *class == FeatureClass::Appearance {
            return self.import_appearance;
        }
        match self.classes {
            Some(ref classes) => classes.contains(class),
            None => true,
        }
    }
}

/// Outcome of counting one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Before the first ordinal
    Skip,
    Accept,
    /// Past the last ordinal; nothing more will be accepted
    Stop,
}

/// Counts chunks across all files of a run and applies the 1-based
/// first/last ordinal window
#[derive(Debug, Clone)]
pub struct ElementCounter {
    first: u64,
    last: u64,
    count: u64,
}

impl ElementCounter {
    pub fn new(first: Option<u64>, last: Option<u64>) -> Self {
        Self {
            first: first.unwrap_or(1),
            last: last.unwrap_or(u64::MAX),
            count: 0,
        }
    }

    pub fn from_config(filter: &FilterConfig) -> Self {
        Self::new(filter.first_element, filter.last_element)
    }

    /// Count the next chunk
    pub fn next(&mut self) -> FilterDecision {
        self.count = self.count.saturating_add(1);
        if self.count < self.first {
            FilterDecision::Skip
        } else if self.count > self.last {
            FilterDecision::Stop
        } else {
            FilterDecision::Accept
        }
    }

    /// True once the window has been passed
    pub fn is_exhausted(&self) -> bool {
        self.count > self.last
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}
