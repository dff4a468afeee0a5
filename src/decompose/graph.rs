//! Subtask dependency graph: title resolution, validation and ordering.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::model::Subtask;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$").unwrap()
});

/// Punctuation stripped by [`normalize_title`] in addition to ASCII punctuation.
const EXTRA_PUNCTUATION: &[char] = &[
    '，', '。', '、', '；', '：', '！', '？', '“', '”', '‘', '’', '（', '）', '【', '】', '《', '》', '「',
    '」', '—', '–', '…', '·', '•',
];

/// Canonical form used for fuzzy title lookup.
///
/// Removes whitespace, ASCII punctuation and the characters in
/// `EXTRA_PUNCTUATION`, then lowercases with Unicode case mapping.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation() && !EXTRA_PUNCTUATION.contains(c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether `s` is a hyphenated UUID.
pub fn looks_like_id(s: &str) -> bool {
    UUID_RE.is_match(s.trim())
}

/// Title to id lookup over one batch of subtasks.
pub struct TitleIndex {
    exact: HashMap<String, Vec<Uuid>>,
    normalized: HashMap<String, Vec<Uuid>>,
    /// (normalized title, id) in materialization order.
    ordered: Vec<(String, Uuid)>,
}

fn first_other(ids: Option<&Vec<Uuid>>, requester: Uuid) -> Option<Uuid> {
    ids?.iter().copied().find(|id| *id != requester)
}

impl TitleIndex {
    pub fn new<'a>(subtasks: impl IntoIterator<Item = &'a Subtask>) -> Self {
        let mut index = Self {
            exact: HashMap::new(),
            normalized: HashMap::new(),
            ordered: Vec::new(),
        };
        for subtask in subtasks {
            let norm = normalize_title(&subtask.title);
            index.exact.entry(subtask.title.clone()).or_default().push(subtask.id);
            let trimmed = subtask.title.trim();
            if trimmed != subtask.title {
                index.exact.entry(trimmed.to_string()).or_default().push(subtask.id);
            }
            if !norm.is_empty() {
                index.normalized.entry(norm.clone()).or_default().push(subtask.id);
            }
            index.ordered.push((norm, subtask.id));
        }
        index
    }

    /// Resolve one raw dependency reference made by `requester`.
    ///
    /// Tries, in order: id passthrough, exact title, normalized title, then
    /// normalized substring containment in either direction. Title tiers
    /// only consider subtasks other than `requester`.
    pub fn resolve(&self, raw: &str, requester: Uuid) -> Option<Uuid> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if looks_like_id(raw) {
            return Uuid::parse_str(raw).ok();
        }
        if let Some(id) = first_other(self.exact.get(raw), requester) {
            return Some(id);
        }

        let norm = normalize_title(raw);
        if norm.is_empty() {
            return None;
        }
        if let Some(id) = first_other(self.normalized.get(&norm), requester) {
            return Some(id);
        }

        self.ordered
            .iter()
            .filter(|(_, id)| *id != requester)
            .find(|(title, _)| !title.is_empty() && (title.contains(&norm) || norm.contains(title.as_str())))
            .map(|(_, id)| *id)
    }
}

/// Resolve raw dependency strings into sibling ids.
///
/// `raw[i]` holds the references of `subtasks[i]`. Unresolvable and
/// self references are dropped; duplicates collapse to one edge.
pub fn resolve_dependencies(subtasks: &mut [Subtask], raw: &[Vec<String>]) {
    let index = TitleIndex::new(subtasks.iter());

    for (subtask, refs) in subtasks.iter_mut().zip(raw) {
        let mut resolved = Vec::new();
        for reference in refs {
            match index.resolve(reference, subtask.id) {
                Some(id) if id == subtask.id => {
                    warn!(subtask = %subtask.title, dependency = %reference, "Dropping self dependency");
                }
                Some(id) => {
                    if !resolved.contains(&id) {
                        resolved.push(id);
                    }
                }
                None => {
                    warn!(subtask = %subtask.title, dependency = %reference, "Unresolved dependency dropped");
                }
            }
        }
        subtask.dependencies = resolved;
    }
}

/// Outcome of [`validate_dependencies`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Check that every edge targets a sibling and that the graph is acyclic.
pub fn validate_dependencies(subtasks: &[Subtask]) -> DependencyReport {
    let ids: HashSet<Uuid> = subtasks.iter().map(|s| s.id).collect();
    let mut errors = Vec::new();

    for subtask in subtasks {
        for dep in &subtask.dependencies {
            if *dep == subtask.id {
                errors.push(format!("Subtask \"{}\" depends on itself", subtask.title));
            } else if !ids.contains(dep) {
                errors.push(format!("Subtask \"{}\" depends on unknown subtask {dep}", subtask.title));
            }
        }
    }

    let titles: HashMap<Uuid, &str> = subtasks.iter().map(|s| (s.id, s.title.as_str())).collect();
    for cycle in find_cycles(subtasks) {
        let path: Vec<&str> = cycle.iter().map(|id| titles.get(id).copied().unwrap_or("?")).collect();
        errors.push(format!("Circular dependency: {}", path.join(" -> ")));
    }

    DependencyReport {
        valid: errors.is_empty(),
        errors,
    }
}

/// Drop edges that point outside the batch.
pub fn prune_missing(subtasks: &mut [Subtask]) {
    let ids: HashSet<Uuid> = subtasks.iter().map(|s| s.id).collect();
    for subtask in subtasks.iter_mut() {
        let own = subtask.id;
        let before = subtask.dependencies.len();
        subtask.dependencies.retain(|dep| *dep != own && ids.contains(dep));
        if subtask.dependencies.len() != before {
            warn!(subtask = %subtask.title, dropped = before - subtask.dependencies.len(), "Dropped dangling dependencies");
        }
    }
}

/// Every cycle reachable by DFS, each as a closed id path.
pub fn find_cycles(subtasks: &[Subtask]) -> Vec<Vec<Uuid>> {
    let edges: HashMap<Uuid, &[Uuid]> = subtasks.iter().map(|s| (s.id, s.dependencies.as_slice())).collect();
    let mut visited = HashSet::new();
    let mut visiting = Vec::new();
    let mut cycles = Vec::new();

    for subtask in subtasks {
        if !visited.contains(&subtask.id) {
            dfs(subtask.id, &edges, &mut visited, &mut visiting, &mut cycles);
        }
    }
    cycles
}

fn dfs(
    node: Uuid,
    edges: &HashMap<Uuid, &[Uuid]>,
    visited: &mut HashSet<Uuid>,
    visiting: &mut Vec<Uuid>,
    cycles: &mut Vec<Vec<Uuid>>,
) {
    visiting.push(node);
    if let Some(deps) = edges.get(&node) {
        for dep in deps.iter() {
            if let Some(pos) = visiting.iter().position(|n| n == dep) {
                let mut cycle = visiting[pos..].to_vec();
                cycle.push(*dep);
                cycles.push(cycle);
            } else if !visited.contains(dep) && edges.contains_key(dep) {
                dfs(*dep, edges, visited, visiting, cycles);
            }
        }
    }
    visiting.pop();
    visited.insert(node);
}

/// Kahn's algorithm, breaking ties by input position.
///
/// Returns `(ordered, omitted)`; `omitted` holds nodes on or behind a cycle.
pub fn topological_order(subtasks: Vec<Subtask>) -> (Vec<Subtask>, Vec<Subtask>) {
    let position: HashMap<Uuid, usize> = subtasks.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
    let mut in_degree = vec![0usize; subtasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); subtasks.len()];

    for (i, subtask) in subtasks.iter().enumerate() {
        for dep in &subtask.dependencies {
            if let Some(&j) = position.get(dep) {
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..subtasks.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(subtasks.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    let placed: HashSet<usize> = order.iter().copied().collect();
    let mut slots: Vec<Option<Subtask>> = subtasks.into_iter().map(Some).collect();
    let ordered: Vec<Subtask> = order.iter().filter_map(|&i| slots[i].take()).collect();
    let omitted: Vec<Subtask> = slots
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !placed.contains(i))
        .filter_map(|(_, s)| s)
        .collect();

    if !omitted.is_empty() {
        let titles: Vec<&str> = omitted.iter().map(|s| s.title.as_str()).collect();
        warn!(?titles, "Subtasks on a dependency cycle omitted from execution order");
    }
    (ordered, omitted)
}
