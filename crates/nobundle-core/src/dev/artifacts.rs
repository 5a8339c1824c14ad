//! Compiled-artifact cache.
//!
//! Holds per-file derived outputs (component descriptor, generated script,
//! template module, style outputs). Every file has a generation counter
//! that is bumped on invalidation: a computation reads the generation
//! before touching disk and stores its result with [`ArtifactCache::put`],
//! which refuses results computed against an older generation.

use super::css::StyleOutput;
use super::sfc::SfcDescriptor;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Kind of cached artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Descriptor,
    Script,
    Template,
    Style(usize),
}

/// A cached artifact.
#[derive(Debug, Clone)]
pub enum Artifact {
    Descriptor(Arc<SfcDescriptor>),
    Script(Arc<str>),
    Template(Arc<str>),
    Style(usize, Arc<StyleOutput>),
}

/// All cached artifacts of one file. Absent means not yet computed.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub descriptor: Option<Arc<SfcDescriptor>>,
    pub script: Option<Arc<str>>,
    pub template: Option<Arc<str>>,
    pub styles: BTreeMap<usize, Arc<StyleOutput>>,
}

impl CacheEntry {
    fn get(&self, kind: ArtifactKind) -> Option<Artifact> {
        match kind {
            ArtifactKind::Descriptor => self.descriptor.clone().map(Artifact::Descriptor),
            ArtifactKind::Script => self.script.clone().map(Artifact::Script),
            ArtifactKind::Template => self.template.clone().map(Artifact::Template),
            ArtifactKind::Style(i) => self.styles.get(&i).cloned().map(|s| Artifact::Style(i, s)),
        }
    }

    fn set(&mut self, artifact: Artifact) {
        match artifact {
            Artifact::Descriptor(d) => self.descriptor = Some(d),
            Artifact::Script(s) => self.script = Some(s),
            Artifact::Template(t) => self.template = Some(t),
            Artifact::Style(i, s) => {
                self.styles.insert(i, s);
            }
        }
    }

    fn remove(&mut self, kind: ArtifactKind) {
        match kind {
            ArtifactKind::Descriptor => self.descriptor = None,
            ArtifactKind::Script => self.script = None,
            ArtifactKind::Template => self.template = None,
            ArtifactKind::Style(i) => {
                self.styles.remove(&i);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.descriptor.is_none()
            && self.script.is_none()
            && self.template.is_none()
            && self.styles.is_empty()
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    generations: HashMap<String, u64>,
}

/// Per-file artifact cache keyed by clean public path.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    inner: Mutex<CacheInner>,
}

impl ArtifactCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation of `file`. Read this before computing.
    #[must_use]
    pub fn generation(&self, file: &str) -> u64 {
        self.inner
            .lock()
            .generations
            .get(file)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn get(&self, file: &str, kind: ArtifactKind) -> Option<Artifact> {
        self.inner.lock().entries.get(file)?.get(kind)
    }

    /// Store `artifact` if `generation` is still current. Returns whether
    /// the value was stored.
    pub fn put(&self, file: &str, generation: u64, artifact: Artifact) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.generations.get(file).copied().unwrap_or(0);
        if generation != current {
            tracing::debug!(
                file,
                generation,
                current,
                "discarding artifact computed against stale file"
            );
            return false;
        }
        inner
            .entries
            .entry(file.to_string())
            .or_default()
            .set(artifact);
        true
    }

    /// Clear every artifact of `file` and bump its generation. Returns the
    /// removed entry.
    pub fn invalidate(&self, file: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        *inner.generations.entry(file.to_string()).or_insert(0) += 1;
        inner.entries.remove(file)
    }

    /// Clear one artifact of `file` and bump its generation.
    pub fn invalidate_kind(&self, file: &str, kind: ArtifactKind) {
        let mut inner = self.inner.lock();
        *inner.generations.entry(file.to_string()).or_insert(0) += 1;
        if let Some(entry) = inner.entries.get_mut(file) {
            entry.remove(kind);
            if entry.is_empty() {
                inner.entries.remove(file);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(s: &str) -> Artifact {
        Artifact::Script(Arc::from(s))
    }

    #[test]
    fn test_put_and_get_kinds_independently() {
        let cache = ArtifactCache::new();
        let gen = cache.generation("/App.vue");
        assert!(cache.put("/App.vue", gen, script("main")));
        assert!(cache.put(
            "/App.vue",
            gen,
            Artifact::Style(1, Arc::new(StyleOutput::default()))
        ));

        assert!(matches!(
            cache.get("/App.vue", ArtifactKind::Script),
            Some(Artifact::Script(s)) if &*s == "main"
        ));
        assert!(cache.get("/App.vue", ArtifactKind::Template).is_none());
        assert!(cache.get("/App.vue", ArtifactKind::Style(0)).is_none());
        assert!(cache.get("/App.vue", ArtifactKind::Style(1)).is_some());
    }

    #[test]
    fn test_invalidate_clears_all_and_returns_entry() {
        let cache = ArtifactCache::new();
        cache.put("/App.vue", 0, script("main"));
        cache.put(
            "/App.vue",
            0,
            Artifact::Descriptor(Arc::new(SfcDescriptor::default())),
        );

        let removed = cache.invalidate("/App.vue").unwrap();
        assert!(removed.descriptor.is_some());
        assert!(removed.script.is_some());
        assert!(cache.get("/App.vue", ArtifactKind::Script).is_none());
        assert_eq!(cache.generation("/App.vue"), 1);
        assert!(cache.invalidate("/App.vue").is_none());
    }

    #[test]
    fn test_stale_put_is_discarded() {
        let cache = ArtifactCache::new();
        let gen = cache.generation("/c.css");
        // The file changes while the artifact is being computed.
        cache.invalidate("/c.css");
        assert!(!cache.put("/c.css", gen, script("old")));
        assert!(cache.get("/c.css", ArtifactKind::Script).is_none());

        let gen = cache.generation("/c.css");
        assert!(cache.put("/c.css", gen, script("new")));
    }

    #[test]
    fn test_invalidate_kind_keeps_other_artifacts() {
        let cache = ArtifactCache::new();
        cache.put("/App.vue", 0, script("main"));
        cache.put(
            "/App.vue",
            0,
            Artifact::Style(0, Arc::new(StyleOutput::default())),
        );

        cache.invalidate_kind("/App.vue", ArtifactKind::Style(0));
        assert!(cache.get("/App.vue", ArtifactKind::Style(0)).is_none());
        assert!(cache.get("/App.vue", ArtifactKind::Script).is_some());
        assert_eq!(cache.generation("/App.vue"), 1);
    }
}
