//! In-memory overlay merge
//!
//! Overlay-aware reads load baseline rows, overlay rows, and the overlay's
//! file states, then merge here rather than in SQL. The rules, per file:
//!
//! - state `deleted` → no rows (tombstone)
//! - state `added`/`modified`/`renamed` → overlay rows only
//! - state `unchanged` or no state → baseline rows
//!
//! Baseline rows for a file named by some `replaced_from_file_key` are
//! dropped as well, so a rename does not leave the old path visible.
//! Within one context, duplicate symbols resolve to the row with the
//! highest `extent_end_line` (definitions beat declarations); references
//! and call edges dedupe by their full tuple.

use ahash::{AHashMap, AHashSet};

use crate::paths::lookup_key;
use crate::schema::{CallEdge, ContextFileState, FileState, IncludeDep, Reference, Symbol, TrackedFile};

/// Index of overlay file states by case-folded file_key
pub struct StateIndex {
    states: AHashMap<String, FileState>,
    replaced: AHashSet<String>,
}

impl StateIndex {
    pub fn new(states: &[ContextFileState]) -> Self {
        let mut map = AHashMap::with_capacity(states.len());
        let mut replaced = AHashSet::new();
        for s in states {
            map.insert(lookup_key(&s.file_key), s.state);
            if let Some(ref from) = s.replaced_from_file_key {
                replaced.insert(lookup_key(from));
            }
        }
        Self {
            states: map,
            replaced,
        }
    }

    /// State recorded for a file, if any
    pub fn state_of(&self, file_key: &str) -> Option<FileState> {
        self.states.get(&lookup_key(file_key)).copied()
    }

    /// Whether baseline rows for this file are visible through the overlay
    pub fn baseline_visible(&self, file_key: &str) -> bool {
        if self.replaced.contains(&lookup_key(file_key)) {
            return false;
        }
        match self.state_of(file_key) {
            None | Some(FileState::Unchanged) => true,
            Some(FileState::Deleted)
            | Some(FileState::Added)
            | Some(FileState::Modified)
            | Some(FileState::Renamed) => false,
        }
    }

    /// Whether overlay rows for this file are visible
    pub fn overlay_visible(&self, file_key: &str) -> bool {
        self.state_of(file_key).map_or(false, |s| s.carries_overlay_rows())
    }
}

/// Generic merge over any fact type carrying a file_key
fn merge_rows<T, F: Fn(&T) -> &str>(
    baseline: Vec<T>,
    overlay: Vec<T>,
    states: &StateIndex,
    file_key_of: F,
) -> Vec<T> {
    let mut out = Vec::with_capacity(baseline.len() + overlay.len());
    for row in overlay {
        if states.overlay_visible(file_key_of(&row)) {
            out.push(row);
        }
    }
    for row in baseline {
        if states.baseline_visible(file_key_of(&row)) {
            out.push(row);
        }
    }
    out
}

/// Merge tracked-file rows; at most one row per file survives
pub fn merge_tracked(
    baseline: Vec<TrackedFile>,
    overlay: Vec<TrackedFile>,
    states: &StateIndex,
) -> Vec<TrackedFile> {
    let merged = merge_rows(baseline, overlay, states, |t| t.file_key.as_str());
    let mut seen = AHashSet::with_capacity(merged.len());
    merged
        .into_iter()
        .filter(|t| seen.insert(lookup_key(&t.file_key)))
        .collect()
}

/// Merge symbols with the extent tiebreak for in-context duplicates
pub fn merge_symbols(
    baseline: Vec<Symbol>,
    overlay: Vec<Symbol>,
    states: &StateIndex,
) -> Vec<Symbol> {
    let merged = merge_rows(baseline, overlay, states, |s| s.file_key.as_str());
    dedupe_symbols(merged)
}

/// Collapse duplicate symbols: same file, qualified name, kind, and start
/// line → keep the widest extent
pub fn dedupe_symbols(symbols: Vec<Symbol>) -> Vec<Symbol> {
    let mut best: AHashMap<(String, String, &'static str, u32), Symbol> =
        AHashMap::with_capacity(symbols.len());
    for sym in symbols {
        let key = (
            lookup_key(&sym.file_key),
            sym.qualified_name.clone(),
            sym.kind.as_str(),
            sym.line,
        );
        match best.get(&key) {
            Some(existing) if existing.extent_end_line >= sym.extent_end_line => {}
            _ => {
                best.insert(key, sym);
            }
        }
    }
    let mut out: Vec<Symbol> = best.into_values().collect();
    out.sort_by(|a, b| {
        (&a.file_key, a.line, a.col).cmp(&(&b.file_key, b.line, b.col))
    });
    out
}

/// Merge references, deduplicating by full tuple
pub fn merge_references(
    baseline: Vec<Reference>,
    overlay: Vec<Reference>,
    states: &StateIndex,
) -> Vec<Reference> {
    let merged = merge_rows(baseline, overlay, states, |r| r.file_key.as_str());
    let mut seen = AHashSet::with_capacity(merged.len());
    let mut out: Vec<Reference> = merged.into_iter().filter(|r| seen.insert(r.clone())).collect();
    out.sort_by(|a, b| (&a.file_key, a.line, a.col).cmp(&(&b.file_key, b.line, b.col)));
    out
}

/// Merge call edges, deduplicating by full tuple
pub fn merge_call_edges(
    baseline: Vec<CallEdge>,
    overlay: Vec<CallEdge>,
    states: &StateIndex,
) -> Vec<CallEdge> {
    let merged = merge_rows(baseline, overlay, states, |e| e.file_key.as_str());
    let mut seen = AHashSet::with_capacity(merged.len());
    let mut out: Vec<CallEdge> = merged.into_iter().filter(|e| seen.insert(e.clone())).collect();
    out.sort_by(|a, b| (&a.file_key, a.line).cmp(&(&b.file_key, b.line)));
    out
}

/// Merge include deps (no dedupe beyond overlay precedence; rows are
/// already unique per parse)
pub fn merge_include_deps(
    baseline: Vec<IncludeDep>,
    overlay: Vec<IncludeDep>,
    states: &StateIndex,
) -> Vec<IncludeDep> {
    merge_rows(baseline, overlay, states, |d| d.file_key.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RefKind, SymbolKind};

    fn sym(file_key: &str, qname: &str, line: u32, extent: u32) -> Symbol {
        Symbol {
            file_key: file_key.into(),
            name: qname.rsplit("::").next().unwrap_or(qname).into(),
            qualified_name: qname.into(),
            kind: SymbolKind::Function,
            line,
            col: 1,
            extent_end_line: extent,
        }
    }

    fn states(entries: &[(&str, FileState)]) -> StateIndex {
        let list: Vec<ContextFileState> = entries
            .iter()
            .map(|(key, state)| ContextFileState {
                file_key: key.to_string(),
                state: *state,
                replaced_from_file_key: None,
            })
            .collect();
        StateIndex::new(&list)
    }

    #[test]
    fn tombstone_suppresses_baseline() {
        let idx = states(&[("repoA:src/old.cpp", FileState::Deleted)]);
        let merged = merge_symbols(
            vec![sym("repoA:src/old.cpp", "ns::foo", 10, 20)],
            vec![],
            &idx,
        );
        assert!(merged.is_empty());
    }

    #[test]
    fn modified_file_reads_overlay_only() {
        let idx = states(&[("repoA:src/x.cpp", FileState::Modified)]);
        let merged = merge_symbols(
            vec![sym("repoA:src/x.cpp", "ns::old_version", 5, 9)],
            vec![sym("repoA:src/x.cpp", "ns::new_version", 7, 12)],
            &idx,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].qualified_name, "ns::new_version");
    }

    #[test]
    fn unchanged_falls_through_to_baseline() {
        let idx = states(&[("repoA:src/x.cpp", FileState::Unchanged)]);
        let merged = merge_symbols(
            vec![sym("repoA:src/x.cpp", "ns::base", 5, 9)],
            vec![],
            &idx,
        );
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn rename_drops_replaced_baseline_key() {
        let list = vec![ContextFileState {
            file_key: "repoA:src/new.cpp".into(),
            state: FileState::Renamed,
            replaced_from_file_key: Some("repoA:src/old.cpp".into()),
        }];
        let idx = StateIndex::new(&list);
        let merged = merge_symbols(
            vec![sym("repoA:src/old.cpp", "ns::foo", 1, 4)],
            vec![sym("repoA:src/new.cpp", "ns::foo", 1, 4)],
            &idx,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].file_key, "repoA:src/new.cpp");
    }

    #[test]
    fn widest_extent_wins_for_duplicates() {
        let idx = states(&[]);
        let merged = merge_symbols(
            vec![
                sym("repoA:src/x.cpp", "ns::foo", 10, 10),
                sym("repoA:src/x.cpp", "ns::foo", 10, 42),
            ],
            vec![],
            &idx,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].extent_end_line, 42);
    }

    #[test]
    fn references_dedupe_by_full_tuple() {
        let idx = states(&[]);
        let reference = Reference {
            file_key: "repoA:src/x.cpp".into(),
            symbol_qualified_name: "ns::foo".into(),
            line: 3,
            col: 7,
            ref_kind: RefKind::Call,
        };
        let merged = merge_references(vec![reference.clone()], vec![], &idx);
        assert_eq!(merged.len(), 1);
        let doubled = merge_references(vec![reference.clone(), reference], vec![], &idx);
        assert_eq!(doubled.len(), 1);
    }

}
