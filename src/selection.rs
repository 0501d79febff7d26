//! Multi-select state for bulk actions.
//!
//! The set is never pruned when the filter changes; a record hidden by the
//! current view stays selected until the caller removes it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSet {
    ids: BTreeSet<String>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the id if absent, remove it if present. Returns the new membership.
    pub fn toggle(&mut self, id: &str) -> bool {
        if self.ids.remove(id) {
            false
        } else {
            self.ids.insert(id.to_string());
            true
        }
    }

    /// Toggle-all: clears when the selection already equals `visible_ids`,
    /// otherwise selects exactly `visible_ids`.
    pub fn select_all<I, S>(&mut self, visible_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let visible: BTreeSet<String> = visible_ids.into_iter().map(Into::into).collect();
        if !self.ids.is_empty() && self.ids == visible {
            self.ids.clear();
        } else {
            self.ids = visible;
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    /// Drop every selected id not in `visible_ids`. Returns how many were dropped.
    pub fn retain_visible<'a, I>(&mut self, visible_ids: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let visible: BTreeSet<&str> = visible_ids.into_iter().collect();
        let before = self.ids.len();
        self.ids.retain(|id| visible.contains(id.as_str()));
        before - self.ids.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &BTreeSet<String> {
        &self.ids
    }
}

impl<S: Into<String>> FromIterator<S> for SelectionSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_adds_then_removes() {
        let mut sel = SelectionSet::new();
        assert!(sel.toggle("a"));
        assert!(sel.contains("a"));
        assert!(!sel.toggle("a"));
        assert!(sel.is_empty());
    }

    #[test]
    fn test_select_all_twice_toggles_empty_full_empty() {
        let visible = vec!["a", "b", "c"];
        let mut sel = SelectionSet::new();
        sel.select_all(visible.clone());
        assert_eq!(sel.len(), 3);
        sel.select_all(visible);
        assert!(sel.is_empty());
    }

    #[test]
    fn test_select_all_with_partial_selection_selects_exactly_visible() {
        let mut sel: SelectionSet = ["a", "zz"].into_iter().collect();
        sel.select_all(["a", "b"]);
        let ids: Vec<&str> = sel.ids().iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_select_all_on_empty_view_stays_empty() {
        let mut sel = SelectionSet::new();
        sel.select_all(Vec::<String>::new());
        assert!(sel.is_empty());
    }

    #[test]
    fn test_selection_survives_until_explicitly_pruned() {
        let mut sel: SelectionSet = ["a", "b", "c"].into_iter().collect();
        // A re-filter that hides "c" does not touch the set.
        assert!(sel.contains("c"));
        let dropped = sel.retain_visible(["a", "b"]);
        assert_eq!(dropped, 1);
        assert!(!sel.contains("c"));
    }
}
