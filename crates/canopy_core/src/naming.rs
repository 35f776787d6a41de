//! Sibling-name collision resolver.
//!
//! # Responsibility
//! - Derive a free name among one parent's live children.
//!
//! # Invariants
//! - The returned name is not present in the provided sibling set.
//! - At most `siblings.len() + 1` numbered candidates are probed before the
//!   timestamped fallback kicks in.

use crate::model::now_ms;
use std::collections::HashSet;

/// Returns `base` when free, otherwise the smallest `"{base} (n)"` with
/// `n >= 2` that is free.
///
/// Sibling comparison is case-sensitive, matching the store's uniqueness
/// rule. Pathological sets that exhaust every probe get a timestamped name.
pub fn create_new_name(siblings: &HashSet<String>, base: &str) -> String {
    if !siblings.contains(base) {
        return base.to_string();
    }

    // n = 2 ..= len + 2 probes len + 1 candidates; a set of k names cannot
    // occupy all k + 1 of them unless it changes underneath us.
    let max_probe = siblings.len() as u64 + 2;
    for n in 2..=max_probe {
        let candidate = format!("{base} ({n})");
        if !siblings.contains(&candidate) {
            return candidate;
        }
    }

    format!("{base} ({})", now_ms())
}

#[cfg(test)]
mod tests {
    use super::create_new_name;
    use std::collections::HashSet;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn free_base_is_returned_unchanged() {
        assert_eq!(create_new_name(&set(&["Other"]), "Docs"), "Docs");
        assert_eq!(create_new_name(&HashSet::new(), "Docs"), "Docs");
    }

    #[test]
    fn numbering_starts_at_two() {
        assert_eq!(create_new_name(&set(&["Docs"]), "Docs"), "Docs (2)");
    }

    #[test]
    fn numbering_fills_the_smallest_gap() {
        let siblings = set(&["Docs", "Docs (2)", "Docs (4)"]);
        assert_eq!(create_new_name(&siblings, "Docs"), "Docs (3)");
    }

    #[test]
    fn comparison_is_case_sensitive() {
        assert_eq!(create_new_name(&set(&["docs"]), "Docs"), "Docs");
    }

    #[test]
    fn dense_sets_resolve_within_probe_bound() {
        let mut siblings = set(&["Docs"]);
        for n in 2..=200u32 {
            siblings.insert(format!("Docs ({n})"));
        }
        assert_eq!(create_new_name(&siblings, "Docs"), "Docs (201)");
    }
}
