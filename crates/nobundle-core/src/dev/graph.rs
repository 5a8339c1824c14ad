//! Import graph for HMR propagation.
//!
//! Keys are clean public paths (`/src/app.js`). The importer and importee
//! views are two indexes over one edge set and are only ever updated
//! together, under one write lock.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug, Default)]
struct GraphInner {
    /// X → files X imports. Present for every file that has been rewritten.
    importees: HashMap<String, BTreeSet<String>>,
    /// X → files importing X. Entries are removed once empty.
    importers: HashMap<String, BTreeSet<String>>,
    /// Owner → dependency paths the owner accepts hot updates for.
    boundaries: HashMap<String, BTreeSet<String>>,
}

impl GraphInner {
    fn set_importees(&mut self, file: &str, mut next: BTreeSet<String>) {
        next.remove(file);
        let previous = self.importees.remove(file).unwrap_or_default();

        for dropped in previous.difference(&next) {
            if let Some(set) = self.importers.get_mut(dropped) {
                set.remove(file);
                if set.is_empty() {
                    self.importers.remove(dropped);
                }
            }
        }
        for added in next.difference(&previous) {
            self.importers
                .entry(added.clone())
                .or_default()
                .insert(file.to_string());
        }

        self.importees.insert(file.to_string(), next);
    }

    fn set_accepted_deps(&mut self, file: &str, deps: BTreeSet<String>) {
        if deps.is_empty() {
            self.boundaries.remove(file);
        } else {
            self.boundaries.insert(file.to_string(), deps);
        }
    }

    fn accepts(&self, owner: &str, dep: &str) -> bool {
        self.boundaries
            .get(owner)
            .is_some_and(|deps| deps.contains(dep))
    }

    fn importers(&self, file: &str) -> impl Iterator<Item = &String> {
        self.importers.get(file).into_iter().flatten()
    }

    fn has_importers(&self, file: &str) -> bool {
        self.importers.get(file).is_some_and(|s| !s.is_empty())
    }
}

/// Outcome of walking the graph upward from a changed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagation {
    /// The file was never served and nothing imports it.
    Untracked,
    /// Every branch was absorbed. Holds the accepting modules.
    Boundaries(BTreeSet<String>),
    /// Some branch reached a module with no importers.
    FullReload,
}

/// Bidirectional importer/importee graph plus the HMR boundary set.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    inner: RwLock<GraphInner>,
}

impl DependencyGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `file`'s outgoing edges, pruning stale reverse edges.
    /// Self-edges are dropped.
    pub fn set_importees(&self, file: &str, importees: BTreeSet<String>) {
        self.inner.write().set_importees(file, importees);
    }

    /// Replace the set of dependencies `file` accepts hot updates for.
    pub fn set_accepted_deps(&self, file: &str, deps: BTreeSet<String>) {
        self.inner.write().set_accepted_deps(file, deps);
    }

    /// Record the result of one rewrite of `file` atomically.
    pub fn commit(&self, file: &str, importees: BTreeSet<String>, accepted: BTreeSet<String>) {
        let mut inner = self.inner.write();
        inner.set_importees(file, importees);
        inner.set_accepted_deps(file, accepted);
    }

    #[must_use]
    pub fn importers_of(&self, file: &str) -> BTreeSet<String> {
        self.inner.read().importers(file).cloned().collect()
    }

    #[must_use]
    pub fn importees_of(&self, file: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .importees
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn accepted_deps(&self, file: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .boundaries
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `file` has been rewritten or is imported by something.
    #[must_use]
    pub fn contains(&self, file: &str) -> bool {
        let inner = self.inner.read();
        inner.importees.contains_key(file) || inner.has_importers(file)
    }

    /// Walk upward from `file` looking for accepting boundaries.
    ///
    /// Breadth-first over importers with a visited set, so cycles
    /// terminate. An edge `dep → node` is absorbed when `node` accepts
    /// `dep`. Reaching a node without importers forces a full reload.
    #[must_use]
    pub fn propagate(&self, file: &str) -> Propagation {
        let inner = self.inner.read();

        if !inner.importees.contains_key(file) && !inner.has_importers(file) {
            return Propagation::Untracked;
        }
        if inner.accepts(file, file) {
            return Propagation::Boundaries(BTreeSet::from([file.to_string()]));
        }
        if !inner.has_importers(file) {
            return Propagation::FullReload;
        }

        let mut boundaries = BTreeSet::new();
        let mut visited: HashSet<&str> = HashSet::from([file]);
        let mut queue: VecDeque<(&str, &str)> =
            inner.importers(file).map(|n| (file, n.as_str())).collect();

        while let Some((dep, node)) = queue.pop_front() {
            if inner.accepts(node, dep) {
                boundaries.insert(node.to_string());
                continue;
            }
            if !visited.insert(node) {
                continue;
            }
            if !inner.has_importers(node) {
                return Propagation::FullReload;
            }
            queue.extend(inner.importers(node).map(|up| (node, up.as_str())));
        }

        if boundaries.is_empty() {
            // Every branch looped back on itself.
            Propagation::FullReload
        } else {
            Propagation::Boundaries(boundaries)
        }
    }

    /// Check `F ∈ importers_of(G) ⇔ G ∈ importees_of(F)` over all edges.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let inner = self.inner.read();
        let forward = inner
            .importees
            .iter()
            .all(|(f, gs)| gs.iter().all(|g| inner.importers(g).any(|x| x == f)));
        let backward = inner.importers.iter().all(|(g, fs)| {
            fs.iter()
                .all(|f| inner.importees.get(f).is_some_and(|gs| gs.contains(g)))
        });
        forward && backward
    }
}
