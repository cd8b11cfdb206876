use super::diff::{weight_changed, OverlaySet};

/// What the backend currently holds.
///
/// At most one base is resident, and `loaded_overlays` is empty whenever
/// `loaded_base_id` is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResidentState {
    pub loaded_base_id: Option<String>,
    pub loaded_overlays: OverlaySet,
}

impl ResidentState {
    pub fn clear(&mut self) {
        self.loaded_base_id = None;
        self.loaded_overlays.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.loaded_base_id.is_none()
    }

    /// True if `base_id` is resident with exactly `target` attached.
    pub fn matches(&self, base_id: &str, target: &OverlaySet) -> bool {
        self.loaded_base_id.as_deref() == Some(base_id)
            && self.loaded_overlays.len() == target.len()
            && target.iter().all(|(name, weight)| {
                self.loaded_overlays
                    .get(name)
                    .is_some_and(|loaded| !weight_changed(*loaded, *weight))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(base: &str, overlays: &[(&str, f32)]) -> ResidentState {
        ResidentState {
            loaded_base_id: Some(base.to_string()),
            loaded_overlays: overlays.iter().map(|(n, w)| (n.to_string(), *w)).collect(),
        }
    }

    #[test]
    fn matches_requires_same_base_and_weights() {
        let s = state("m1", &[("A", 0.8)]);
        let target: OverlaySet = [("A".to_string(), 0.8)].into_iter().collect();
        assert!(s.matches("m1", &target));
        assert!(!s.matches("m2", &target));

        let reweighted: OverlaySet = [("A".to_string(), 0.5)].into_iter().collect();
        assert!(!s.matches("m1", &reweighted));
        assert!(!s.matches("m1", &OverlaySet::new()));
    }

    #[test]
    fn clear_empties_everything() {
        let mut s = state("m1", &[("A", 0.8)]);
        s.clear();
        assert!(s.is_empty());
        assert!(s.loaded_overlays.is_empty());
        assert!(!s.matches("m1", &OverlaySet::new()));
    }
}
