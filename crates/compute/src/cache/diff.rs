use std::collections::BTreeMap;

use kiln_core::Overlay;

/// Overlay id -> weight. Ordered so backend calls happen in a stable order.
pub type OverlaySet = BTreeMap<String, f32>;

/// Build the target set for a task. Ids have their extension stripped; when
/// an id repeats, the last entry wins.
pub fn target_set(overlays: &[Overlay]) -> OverlaySet {
    overlays
        .iter()
        .map(|o| (o.id().to_string(), o.weight))
        .collect()
}

pub(crate) fn weight_changed(a: f32, b: f32) -> bool {
    (a - b).abs() > f32::EPSILON
}

/// Backend calls needed to turn `loaded` into `target`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayDiff {
    /// In `target` but not `loaded`.
    pub to_load: Vec<(String, f32)>,
    /// In `loaded` but not `target`.
    pub to_unload: Vec<String>,
    /// In both, with a different weight; carries the target weight.
    pub to_reweight: Vec<(String, f32)>,
}

impl OverlayDiff {
    pub fn compute(loaded: &OverlaySet, target: &OverlaySet) -> Self {
        let mut diff = Self::default();
        for (name, &weight) in target {
            match loaded.get(name) {
                None => diff.to_load.push((name.clone(), weight)),
                Some(&current) if weight_changed(current, weight) => {
                    diff.to_reweight.push((name.clone(), weight))
                }
                Some(_) => {}
            }
        }
        diff.to_unload = loaded
            .keys()
            .filter(|name| !target.contains_key(*name))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.to_load.is_empty() && self.to_unload.is_empty() && self.to_reweight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn set(entries: &[(&str, f32)]) -> OverlaySet {
        entries.iter().map(|(n, w)| (n.to_string(), *w)).collect()
    }

    #[test]
    fn target_set_strips_extension_and_last_wins() {
        let overlays = vec![
            Overlay::new("A.safetensors", 0.8),
            Overlay::new("B", 0.5),
            Overlay::new("A", 0.3),
        ];
        assert_eq!(target_set(&overlays), set(&[("A", 0.3), ("B", 0.5)]));
    }

    #[test]
    fn identical_sets_produce_empty_diff() {
        let s = set(&[("A", 0.8), ("B", 0.5)]);
        assert!(OverlayDiff::compute(&s, &s).is_empty());
    }

    #[test]
    fn mixed_diff() {
        let loaded = set(&[("A", 0.8), ("B", 0.5), ("C", 1.0)]);
        let target = set(&[("A", 0.8), ("B", 0.7), ("D", 0.2)]);
        let diff = OverlayDiff::compute(&loaded, &target);
        assert_eq!(diff.to_load, vec![("D".to_string(), 0.2)]);
        assert_eq!(diff.to_unload, vec!["C".to_string()]);
        assert_eq!(diff.to_reweight, vec![("B".to_string(), 0.7)]);
    }

    /// Apply a diff the way the cache does and check the result.
    fn apply(loaded: &OverlaySet, diff: &OverlayDiff) -> OverlaySet {
        let mut out = loaded.clone();
        for name in &diff.to_unload {
            out.remove(name);
        }
        for (name, weight) in diff.to_reweight.iter().chain(&diff.to_load) {
            out.insert(name.clone(), *weight);
        }
        out
    }

    fn random_set(rng: &mut StdRng) -> OverlaySet {
        const NAMES: [&str; 8] = ["A", "B", "C", "D", "E", "F", "G", "H"];
        const WEIGHTS: [f32; 4] = [0.25, 0.5, 0.8, 1.0];
        let mut out = OverlaySet::new();
        for name in NAMES {
            if rng.gen_bool(0.5) {
                out.insert(name.to_string(), WEIGHTS[rng.gen_range(0..WEIGHTS.len())]);
            }
        }
        out
    }

    #[test]
    fn randomized_diff_counts_match_set_algebra() {
        let mut rng = StdRng::seed_from_u64(0x6b696c6e);
        for _ in 0..500 {
            let loaded = random_set(&mut rng);
            let target = random_set(&mut rng);
            let diff = OverlayDiff::compute(&loaded, &target);

            let only_target = target.keys().filter(|k| !loaded.contains_key(*k)).count();
            let only_loaded = loaded.keys().filter(|k| !target.contains_key(*k)).count();
            let changed = target
                .iter()
                .filter(|(k, w)| loaded.get(*k).is_some_and(|l| l != *w))
                .count();

            assert_eq!(diff.to_load.len(), only_target);
            assert_eq!(diff.to_unload.len(), only_loaded);
            assert_eq!(diff.to_reweight.len(), changed);
            assert_eq!(apply(&loaded, &diff), target);
        }
    }
}
