//! Violation and compliance counting from detection labels.

use ml_core::DetectionRecord;
use serde::Serialize;

/// Which counter a label feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    Violation,
    Helmet,
    Vest,
}

/// Label vocabulary for each bucket.
///
/// Violations match by prefix, helmets and vests by exact label. Matching is
/// case-sensitive and checked violation, then helmet, then vest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterRules {
    pub violation_prefixes: Vec<String>,
    pub helmet_labels: Vec<String>,
    pub vest_labels: Vec<String>,
}

impl Default for CounterRules {
    fn default() -> Self {
        Self {
            violation_prefixes: vec!["NO-".into()],
            helmet_labels: vec!["Hardhat".into(), "helmet".into()],
            vest_labels: vec!["Safety Vest".into(), "vest".into()],
        }
    }
}

impl CounterRules {
    pub fn classify(&self, label: &str) -> Option<Bucket> {
        if self
            .violation_prefixes
            .iter()
            .any(|prefix| label.starts_with(prefix.as_str()))
        {
            Some(Bucket::Violation)
        } else if self.helmet_labels.iter().any(|name| name == label) {
            Some(Bucket::Helmet)
        } else if self.vest_labels.iter().any(|name| name == label) {
            Some(Bucket::Vest)
        } else {
            None
        }
    }
}

/// Running totals for one detection session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub violation_count: u64,
    pub helmet_count: u64,
    pub vest_count: u64,
}

impl Counters {
    /// Fold one frame's detections into a new set of totals.
    pub fn update(self, rules: &CounterRules, detections: &[DetectionRecord]) -> Counters {
        detections
            .iter()
            .filter_map(|det| rules.classify(&det.label))
            .fold(self, |mut acc, bucket| {
                match bucket {
                    Bucket::Violation => acc.violation_count += 1,
                    Bucket::Helmet => acc.helmet_count += 1,
                    Bucket::Vest => acc.vest_count += 1,
                }
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn records(labels: &[&str]) -> Vec<DetectionRecord> {
        labels
            .iter()
            .map(|label| DetectionRecord {
                timestamp: Utc::now(),
                label: label.to_string(),
                confidence: 0.9,
                bounding_box: None,
            })
            .collect()
    }

    #[test]
    fn one_bucket_per_detection() {
        let rules = CounterRules::default();
        let counters = Counters::default().update(
            &rules,
            &records(&["NO-Helmet", "Hardhat", "Safety Vest"]),
        );
        assert_eq!(
            counters,
            Counters {
                violation_count: 1,
                helmet_count: 1,
                vest_count: 1
            }
        );
    }

    #[test]
    fn repeated_violations_accumulate() {
        let rules = CounterRules::default();
        let counters = Counters::default().update(&rules, &records(&["NO-Vest", "NO-Vest"]));
        assert_eq!(
            counters,
            Counters {
                violation_count: 2,
                helmet_count: 0,
                vest_count: 0
            }
        );
    }

    #[test]
    fn violation_wins_ties() {
        let rules = CounterRules {
            violation_prefixes: vec!["NO-".into()],
            helmet_labels: vec!["NO-Hardhat".into()],
            vest_labels: vec!["NO-Hardhat".into()],
        };
        assert_eq!(rules.classify("NO-Hardhat"), Some(Bucket::Violation));

        let rules = CounterRules {
            violation_prefixes: Vec::new(),
            helmet_labels: vec!["gear".into()],
            vest_labels: vec!["gear".into()],
        };
        assert_eq!(rules.classify("gear"), Some(Bucket::Helmet));
    }

    #[test]
    fn unmatched_labels_count_nothing() {
        let rules = CounterRules::default();
        let counters =
            Counters::default().update(&rules, &records(&["Person", "hardhat", "machinery"]));
        assert_eq!(counters, Counters::default());
    }

    #[test]
    fn vocabulary_is_configurable() {
        let rules = CounterRules {
            violation_prefixes: vec!["missing_".into()],
            helmet_labels: vec!["casco".into()],
            vest_labels: vec!["chaleco".into()],
        };
        let counters = Counters {
            violation_count: 3,
            helmet_count: 0,
            vest_count: 0,
        }
        .update(&rules, &records(&["missing_vest", "casco", "chaleco", "NO-Vest"]));
        assert_eq!(counters.violation_count, 4);
        assert_eq!(counters.helmet_count, 1);
        assert_eq!(counters.vest_count, 1);
    }
}
