//! Hierarchy codes and spawn-tree queries
//!
//! A hierarchy code is a dot-separated list of non-negative integers such as
//! `0.1.2`. The queen sits at `0`; every spawned worker extends its parent's
//! code by one segment. All functions here are pure string arithmetic.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Code of the queen, the root of every tree
pub const ROOT_CODE: &str = "0";

/// Number of `.` separators in the code
pub fn depth(code: &str) -> usize {
    code.matches('.').count()
}

/// Code with its final segment removed
///
/// The root's parent is the empty string, meaning "no parent".
pub fn parent(code: &str) -> &str {
    match code.rfind('.') {
        Some(idx) => &code[..idx],
        None => "",
    }
}

/// Code of the `index`-th child spawned under `parent`
pub fn child_code(parent: &str, index: usize) -> String {
    if parent.is_empty() {
        index.to_string()
    } else {
        format!("{parent}.{index}")
    }
}

/// Whether every segment is a non-empty run of ASCII digits
pub fn is_valid_code(code: &str) -> bool {
    !code.is_empty()
        && code
            .split('.')
            .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
}

/// True iff `ancestor` is a strict, segment-aligned prefix of `code`
///
/// `0.10` is not a descendant of `0.1` even though the raw strings share a
/// prefix, so whole segments are compared.
pub fn is_descendant(code: &str, ancestor: &str) -> bool {
    if code == ancestor || ancestor.is_empty() {
        return false;
    }
    let mut segments = code.split('.');
    for expected in ancestor.split('.') {
        match segments.next() {
            Some(seg) if seg == expected => {}
            _ => return false,
        }
    }
    segments.next().is_some()
}

/// Segment-wise ordering so that `0.2` sorts before `0.10`
///
/// Numeric segments compare as numbers; anything else falls back to
/// lexical order. A code sorts before its own descendants.
pub fn compare_codes(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// A named position in the spawn tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HierarchyEntry {
    pub name: String,
    pub code: String,
}

impl HierarchyEntry {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
        }
    }
}

/// Spawn tree computed from a flat set of entries
///
/// Entries whose parent code has no entry of its own are kept as children
/// of that absent code and start their own branch of the traversal.
#[derive(Debug, Clone, Default)]
pub struct HierarchyTree {
    /// Direct children by parent code, sorted by code
    children: HashMap<String, Vec<HierarchyEntry>>,
    /// Pre-order traversal, parents before children
    order: Vec<HierarchyEntry>,
}

/// Build the children map and pre-order traversal for a set of entries
pub fn build_tree<I>(entries: I) -> HierarchyTree
where
    I: IntoIterator<Item = HierarchyEntry>,
{
    let entries: Vec<HierarchyEntry> = entries.into_iter().collect();
    let known: HashSet<&str> = entries.iter().map(|e| e.code.as_str()).collect();

    let mut children: HashMap<String, Vec<HierarchyEntry>> = HashMap::new();
    let mut tops: Vec<HierarchyEntry> = Vec::new();

    for entry in &entries {
        let parent_code = parent(&entry.code);
        if !parent_code.is_empty() {
            children
                .entry(parent_code.to_string())
                .or_default()
                .push(entry.clone());
        }
        if parent_code.is_empty() || !known.contains(parent_code) {
            tops.push(entry.clone());
        }
    }

    for list in children.values_mut() {
        list.sort_by(|a, b| compare_codes(&a.code, &b.code).then_with(|| a.name.cmp(&b.name)));
    }
    tops.sort_by(|a, b| compare_codes(&a.code, &b.code).then_with(|| a.name.cmp(&b.name)));

    let mut order = Vec::with_capacity(entries.len());
    let mut expanded: HashSet<String> = HashSet::new();
    for top in tops {
        visit(top, &children, &mut expanded, &mut order);
    }

    HierarchyTree { children, order }
}

fn visit(
    entry: HierarchyEntry,
    children: &HashMap<String, Vec<HierarchyEntry>>,
    expanded: &mut HashSet<String>,
    order: &mut Vec<HierarchyEntry>,
) {
    let code = entry.code.clone();
    order.push(entry);

    // Two entries sharing a code would otherwise list the subtree twice
    if !expanded.insert(code.clone()) {
        return;
    }
    if let Some(kids) = children.get(&code) {
        for kid in kids {
            visit(kid.clone(), children, expanded, order);
        }
    }
}

impl HierarchyTree {
    /// Direct children of `code`, sorted by code
    pub fn children(&self, code: &str) -> &[HierarchyEntry] {
        self.children.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every entry in pre-order
    pub fn pre_order(&self) -> &[HierarchyEntry] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Indented text rendering, one `name (code)` line per entry
    ///
    /// Indentation is relative to the shallowest entry in the tree.
    pub fn render(&self) -> String {
        let base = self.order.iter().map(|e| depth(&e.code)).min().unwrap_or(0);
        let mut out = String::new();
        for entry in &self.order {
            let indent = depth(&entry.code).saturating_sub(base);
            out.push_str(&"  ".repeat(indent));
            out.push_str(&entry.name);
            out.push_str(" (");
            out.push_str(&entry.code);
            out.push_str(")\n");
        }
        out
    }
}
