//! HMR coordinator.
//!
//! Turns a batch of changed files into update messages:
//! - Plain stylesheets are swapped in place (`style-update`)
//! - Components are diffed block by block against their cached descriptor
//! - Everything else walks the dependency graph to the nearest accepting
//!   modules (`js-update`), or reloads the page when a branch reaches a
//!   module nothing imports
//!
//! Artifacts of a changed file are invalidated before any message for it
//! is sent, so a client refetch never sees stale output.

use super::artifacts::{Artifact, ArtifactCache, ArtifactKind};
use super::css::{is_plain_css, style_id};
use super::graph::{DependencyGraph, Propagation};
use super::sfc::{diff_descriptors, style_block_id, BlockCompiler, SfcChange};
use crate::paths::{file_to_request, request_to_file};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Number of messages buffered per client before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Message pushed to connected clients over the HMR socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpdateMessage {
    Connected,
    StyleUpdate {
        id: String,
        path: String,
        timestamp: u64,
    },
    JsUpdate {
        path: String,
        timestamp: u64,
    },
    ComponentReload {
        path: String,
        timestamp: u64,
    },
    ComponentRerender {
        path: String,
        timestamp: u64,
    },
    ComponentStyleUpdate {
        path: String,
        index: usize,
        id: String,
        timestamp: u64,
    },
    FullReload {
        path: String,
        timestamp: u64,
    },
}

impl UpdateMessage {
    /// Serialize for the wire.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Owns the update lifecycle of one dev server.
pub struct HmrCoordinator {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    graph: Arc<DependencyGraph>,
    artifacts: Arc<ArtifactCache>,
    compiler: Arc<dyn BlockCompiler>,
    /// Stylesheet path → component style blocks that load it via `src`.
    style_sources: RwLock<HashMap<String, BTreeSet<(String, usize)>>>,
    sender: broadcast::Sender<UpdateMessage>,
}

impl HmrCoordinator {
    #[must_use]
    pub fn new(
        root: PathBuf,
        graph: Arc<DependencyGraph>,
        artifacts: Arc<ArtifactCache>,
        compiler: Arc<dyn BlockCompiler>,
    ) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            canonical_root: std::fs::canonicalize(&root).ok(),
            root,
            graph,
            artifacts,
            compiler,
            style_sources: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Receive every message broadcast from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateMessage> {
        self.sender.subscribe()
    }

    /// Record that style block `index` of `owner` loads its content from
    /// the stylesheet at `source`.
    pub fn record_style_source(&self, source: &str, owner: &str, index: usize) {
        self.style_sources
            .write()
            .entry(source.to_string())
            .or_default()
            .insert((owner.to_string(), index));
    }

    /// Process one batch of changed files and broadcast the result.
    pub async fn handle_changes(&self, files: &[PathBuf]) -> Vec<UpdateMessage> {
        let mut paths: Vec<String> = Vec::new();
        for file in files {
            match self.public_path(file) {
                Some(path) if !paths.contains(&path) => paths.push(path),
                Some(_) => {}
                None => debug!(file = %file.display(), "ignoring change outside the root"),
            }
        }
        if paths.is_empty() {
            return Vec::new();
        }

        let messages = self.updates_for_batch(&paths, now_ms()).await;
        for message in &messages {
            info!(message = %message.to_json(), "hmr update");
            if self.sender.send(message.clone()).is_err() {
                debug!("no hmr clients connected");
            }
        }
        messages
    }

    /// Compute the messages for a batch of changed public paths without
    /// broadcasting them.
    pub async fn updates_for_batch(&self, paths: &[String], timestamp: u64) -> Vec<UpdateMessage> {
        let mut messages: Vec<UpdateMessage> = Vec::new();
        let mut reload: Option<String> = None;

        for path in paths {
            let removed = self.artifacts.invalidate(path);

            let style_owners = self.style_sources.read().get(path).cloned();
            if let Some(owners) = style_owners {
                for (owner, index) in owners {
                    self.artifacts
                        .invalidate_kind(&owner, ArtifactKind::Style(index));
                    push_unique(
                        &mut messages,
                        UpdateMessage::ComponentStyleUpdate {
                            id: style_block_id(&owner, index),
                            path: owner,
                            index,
                            timestamp,
                        },
                    );
                }
                continue;
            }

            if is_plain_css(path) {
                push_unique(
                    &mut messages,
                    UpdateMessage::StyleUpdate {
                        id: style_id(path),
                        path: path.clone(),
                        timestamp,
                    },
                );
                continue;
            }

            if path.ends_with(".vue") {
                let previous = removed.and_then(|entry| entry.descriptor);
                match previous {
                    Some(previous) => {
                        for message in self.component_updates(path, &previous, timestamp).await {
                            push_unique(&mut messages, message);
                        }
                    }
                    None => debug!(path = %path, "component was never served, nothing to update"),
                }
                continue;
            }

            if path == "/index.html" {
                reload.get_or_insert_with(|| path.clone());
                continue;
            }

            match self.graph.propagate(path) {
                Propagation::Untracked => debug!(path = %path, "change to a module nobody loaded"),
                Propagation::Boundaries(boundaries) => {
                    for boundary in boundaries {
                        push_unique(
                            &mut messages,
                            UpdateMessage::JsUpdate {
                                path: boundary,
                                timestamp,
                            },
                        );
                    }
                }
                Propagation::FullReload => {
                    debug!(path = %path, "no hmr boundary, reloading");
                    reload.get_or_insert_with(|| path.clone());
                }
            }
        }

        match reload {
            Some(path) => vec![UpdateMessage::FullReload { path, timestamp }],
            None => messages,
        }
    }

    /// Re-parse a changed component and diff it against `previous`.
    async fn component_updates(
        &self,
        path: &str,
        previous: &super::sfc::SfcDescriptor,
        timestamp: u64,
    ) -> Vec<UpdateMessage> {
        let reload = vec![UpdateMessage::ComponentReload {
            path: path.to_string(),
            timestamp,
        }];

        let Some(file) = request_to_file(&self.root, path) else {
            return reload;
        };
        let generation = self.artifacts.generation(path);
        let source = match tokio::fs::read_to_string(&file).await {
            Ok(source) => source,
            Err(err) => {
                warn!(path, error = %err, "failed to read changed component");
                return reload;
            }
        };

        let parsed = self.compiler.parse(&source, &file.to_string_lossy());
        for error in &parsed.errors {
            warn!(path, error = %error, "component parse diagnostic");
        }
        let next = Arc::new(parsed.descriptor);
        self.artifacts
            .put(path, generation, Artifact::Descriptor(Arc::clone(&next)));

        match diff_descriptors(previous, &next) {
            None => Vec::new(),
            Some(SfcChange::Reload) => reload,
            Some(SfcChange::Partial { rerender, styles }) => {
                let mut messages = Vec::new();
                if rerender {
                    messages.push(UpdateMessage::ComponentRerender {
                        path: path.to_string(),
                        timestamp,
                    });
                }
                messages.extend(styles.into_iter().map(|index| {
                    UpdateMessage::ComponentStyleUpdate {
                        path: path.to_string(),
                        index,
                        id: style_block_id(path, index),
                        timestamp,
                    }
                }));
                messages
            }
        }
    }

    fn public_path(&self, file: &Path) -> Option<String> {
        file_to_request(&self.root, file).or_else(|| {
            let root = self.canonical_root.as_deref()?;
            file_to_request(root, file)
                .or_else(|| file_to_request(root, &std::fs::canonicalize(file).ok()?))
        })
    }
}

impl std::fmt::Debug for HmrCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmrCoordinator")
            .field("root", &self.root)
            .field("clients", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

fn push_unique(messages: &mut Vec<UpdateMessage>, message: UpdateMessage) {
    if !messages.contains(&message) {
        messages.push(message);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::sfc::BuiltinCompiler;
    use std::fs;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn coordinator(root: &Path) -> HmrCoordinator {
        HmrCoordinator::new(
            root.to_path_buf(),
            Arc::new(DependencyGraph::new()),
            Arc::new(ArtifactCache::new()),
            Arc::new(BuiltinCompiler),
        )
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_message_wire_format() {
        let msg = UpdateMessage::StyleUpdate {
            id: "abc".into(),
            path: "/c.css".into(),
            timestamp: 7,
        };
        assert_eq!(
            msg.to_json(),
            r#"{"type":"style-update","id":"abc","path":"/c.css","timestamp":7}"#
        );
        assert_eq!(UpdateMessage::Connected.to_json(), r#"{"type":"connected"}"#);
        let parsed: UpdateMessage =
            serde_json::from_str(r#"{"type":"full-reload","path":"/a.js","timestamp":1}"#).unwrap();
        assert!(matches!(parsed, UpdateMessage::FullReload { .. }));
    }

    #[tokio::test]
    async fn test_boundary_absorbs_update() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        // a → b → c, b accepts c.
        hmr.graph.commit("/a.js", set(&["/b.js"]), BTreeSet::new());
        hmr.graph.commit("/b.js", set(&["/c.js"]), set(&["/c.js"]));

        let messages = hmr.updates_for_batch(&paths(&["/c.js"]), 1).await;
        assert_eq!(
            messages,
            vec![UpdateMessage::JsUpdate {
                path: "/b.js".into(),
                timestamp: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_dead_end_supersedes_partial_updates() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        hmr.graph.commit("/a.js", set(&["/b.js", "/d.js"]), BTreeSet::new());
        hmr.graph.commit("/b.js", set(&["/c.js"]), set(&["/c.js"]));

        // c is absorbed by b, d reaches a which nothing imports.
        let messages = hmr.updates_for_batch(&paths(&["/c.js", "/d.js"]), 2).await;
        assert_eq!(
            messages,
            vec![UpdateMessage::FullReload {
                path: "/d.js".into(),
                timestamp: 2
            }]
        );
    }

    #[tokio::test]
    async fn test_untracked_file_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        assert!(hmr.updates_for_batch(&paths(&["/never.js"]), 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_plain_css_vs_css_module() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        hmr.graph.commit(
            "/app.js",
            set(&["/c.css", "/m.module.css"]),
            set(&["/m.module.css"]),
        );
        hmr.graph.commit("/index.html", set(&["/app.js"]), BTreeSet::new());

        let messages = hmr.updates_for_batch(&paths(&["/c.css"]), 3).await;
        assert_eq!(
            messages,
            vec![UpdateMessage::StyleUpdate {
                id: style_id("/c.css"),
                path: "/c.css".into(),
                timestamp: 3
            }]
        );

        // CSS Modules go through the graph like any module.
        let messages = hmr.updates_for_batch(&paths(&["/m.module.css"]), 4).await;
        assert_eq!(
            messages,
            vec![UpdateMessage::JsUpdate {
                path: "/app.js".into(),
                timestamp: 4
            }]
        );
    }

    #[tokio::test]
    async fn test_index_html_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        let messages = hmr.updates_for_batch(&paths(&["/index.html"]), 5).await;
        assert!(matches!(
            messages.as_slice(),
            [UpdateMessage::FullReload { path, .. }] if path == "/index.html"
        ));
    }

    #[tokio::test]
    async fn test_invalidates_before_notifying() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        hmr.artifacts.put(
            "/c.css",
            0,
            Artifact::Style(0, Arc::new(Default::default())),
        );
        let _ = hmr.updates_for_batch(&paths(&["/c.css"]), 1).await;
        assert!(hmr.artifacts.get("/c.css", ArtifactKind::Style(0)).is_none());
        assert_eq!(hmr.artifacts.generation("/c.css"), 1);
    }

    #[tokio::test]
    async fn test_component_diff() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        let file = dir.path().join("App.vue");
        let original = "<template><p>hi</p></template>\n<script>export default {}</script>\n<style>p { color: red }</style>\n<style scoped>a { color: blue }</style>\n";
        let parse = |src: &str| {
            Arc::new(BuiltinCompiler.parse(src, &file.to_string_lossy()).descriptor)
        };

        // Template and second style change.
        hmr.artifacts
            .put("/App.vue", 0, Artifact::Descriptor(parse(original)));
        fs::write(
            &file,
            original
                .replace("<p>hi</p>", "<p>hello</p>")
                .replace("color: blue", "color: green"),
        )
        .unwrap();
        let messages = hmr.updates_for_batch(&paths(&["/App.vue"]), 1).await;
        assert_eq!(
            messages,
            vec![
                UpdateMessage::ComponentRerender {
                    path: "/App.vue".into(),
                    timestamp: 1
                },
                UpdateMessage::ComponentStyleUpdate {
                    path: "/App.vue".into(),
                    index: 1,
                    id: style_block_id("/App.vue", 1),
                    timestamp: 1
                },
            ]
        );
        // The fresh descriptor is cached for the next diff.
        assert!(hmr
            .artifacts
            .get("/App.vue", ArtifactKind::Descriptor)
            .is_some());

        // Script change reloads the component.
        fs::write(&file, original.replace("export default {}", "export default { a: 1 }")).unwrap();
        let messages = hmr.updates_for_batch(&paths(&["/App.vue"]), 2).await;
        assert_eq!(
            messages,
            vec![UpdateMessage::ComponentReload {
                path: "/App.vue".into(),
                timestamp: 2
            }]
        );

        // Without a cached descriptor nothing is sent.
        let messages = hmr.updates_for_batch(&paths(&["/Other.vue"]), 3).await;
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_style_src_change() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        hmr.record_style_source("/theme.css", "/App.vue", 0);
        hmr.artifacts.put(
            "/App.vue",
            0,
            Artifact::Style(0, Arc::new(Default::default())),
        );

        let messages = hmr.updates_for_batch(&paths(&["/theme.css"]), 9).await;
        assert_eq!(
            messages,
            vec![UpdateMessage::ComponentStyleUpdate {
                path: "/App.vue".into(),
                index: 0,
                id: style_block_id("/App.vue", 0),
                timestamp: 9
            }]
        );
        assert!(hmr.artifacts.get("/App.vue", ArtifactKind::Style(0)).is_none());
    }

    #[tokio::test]
    async fn test_handle_changes_broadcasts_deduplicated_batch() {
        let dir = tempfile::tempdir().unwrap();
        let hmr = coordinator(dir.path());
        let mut rx = hmr.subscribe();
        hmr.graph.commit("/app.js", set(&["/c.css"]), BTreeSet::new());

        let css = dir.path().join("c.css");
        let messages = hmr.handle_changes(&[css.clone(), css]).await;
        assert_eq!(messages.len(), 1);
        let received = rx.recv().await.unwrap();
        assert!(matches!(
            received,
            UpdateMessage::StyleUpdate { ref path, .. } if path == "/c.css"
        ));
        assert!(rx.try_recv().is_err());
    }
}
