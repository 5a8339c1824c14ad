//! Bare module resolution for `/@modules/{id}` requests.
//!
//! Resolution order, first match wins:
//!
//! 1. Runtime override (`vue` → installed browser build)
//! 2. Direct cache
//! 3. Redirect cache
//! 4. Import map / web modules directory
//! 5. Package manifest entry (cached as a redirect)
//! 6. Raw resolution inside `node_modules`
//!
//! A package name alone is answered with a redirect to its entry file, so
//! that the browser resolves the package's own relative imports against
//! the real entry location.

use crate::config::DevConfig;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Public prefix for resolved bare modules.
pub const MODULES_PREFIX: &str = "/@modules/";

/// Extensions tried during raw resolution.
const EXTENSIONS: &[&str] = &["js", "mjs", "json"];

/// Successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Serve this file.
    File(PathBuf),
    /// Re-issue the request at `/@modules/<id>/<suffix>`.
    Redirect(String),
}

/// Resolution failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("failed to resolve module \"{id}\"{}", importer_suffix(.importer))]
    NotFound { id: String, importer: Option<String> },
}

/// Resolver for bare specifiers with its caches.
///
/// Concurrent duplicate resolutions are tolerated; the last cache write
/// wins and every write for an id is identical.
#[derive(Debug)]
pub struct ModuleResolver {
    root: PathBuf,
    web_modules: PathBuf,
    overrides: BTreeMap<String, PathBuf>,
    /// id → file.
    direct: RwLock<HashMap<String, PathBuf>>,
    /// id → entry suffix.
    redirects: RwLock<HashMap<String, String>>,
    /// File basename → id, for source map requests.
    file_to_id: RwLock<HashMap<String, String>>,
    import_map: OnceLock<HashMap<String, PathBuf>>,
    probes: AtomicUsize,
}

impl ModuleResolver {
    /// Create a resolver for the config's root.
    #[must_use]
    pub fn new(config: &DevConfig) -> Self {
        let root = config.root.clone();
        Self {
            web_modules: root.join(&config.resolve.web_modules),
            overrides: config.resolve.effective_overrides(&root),
            root,
            direct: RwLock::new(HashMap::new()),
            redirects: RwLock::new(HashMap::new()),
            file_to_id: RwLock::new(HashMap::new()),
            import_map: OnceLock::new(),
            probes: AtomicUsize::new(0),
        }
    }

    /// Number of file system probes performed so far.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }

    /// Resolve a bare specifier.
    pub fn resolve(&self, id: &str, importer: Option<&str>) -> Result<Resolution, ResolveError> {
        if !is_package_id(id) {
            warn!(id, importer = importer.unwrap_or("<unknown>"), "rejected module id outside node_modules");
            return Err(ResolveError::NotFound {
                id: id.to_string(),
                importer: importer.map(str::to_string),
            });
        }

        if let Some(file) = self.overrides.get(id) {
            debug!(id, file = %file.display(), "resolved runtime override");
            return Ok(Resolution::File(file.clone()));
        }

        if let Some(file) = self.direct.read().get(id) {
            debug!(id, "resolved (cached)");
            return Ok(Resolution::File(file.clone()));
        }

        if let Some(suffix) = self.redirects.read().get(id) {
            debug!(id, suffix = %suffix, "resolved (cached redirect)");
            return Ok(Resolution::Redirect(suffix.clone()));
        }

        if let Some(file) = self.resolve_web_module(id) {
            debug!(id, file = %self.display(&file), "resolved from web modules");
            self.remember(id, &file);
            return Ok(Resolution::File(file));
        }

        if let Some(entry) = self.resolve_package_entry(id) {
            debug!(id, entry = %entry, "redirecting to package entry");
            self.redirects.write().insert(id.to_string(), entry.clone());
            return Ok(Resolution::Redirect(entry));
        }

        if let Some(file) = self.resolve_raw(id) {
            debug!(id, file = %self.display(&file), "resolved from node_modules");
            self.remember(id, &file);
            return Ok(Resolution::File(file));
        }

        warn!(id, importer = importer.unwrap_or("<unknown>"), "module not found");
        Err(ResolveError::NotFound {
            id: id.to_string(),
            importer: importer.map(str::to_string),
        })
    }

    /// Locate the source map for a `<id>.map` request.
    ///
    /// The module is inferred from the basename of the JS file the map
    /// belongs to; the map is expected next to it.
    #[must_use]
    pub fn resolve_source_map(&self, map_id: &str) -> Option<PathBuf> {
        let js_id = map_id.strip_suffix(".map")?;
        let js_base = basename(js_id);
        let map_base = basename(map_id);

        let module_id = self.file_to_id.read().get(js_base).cloned();
        let module_file = match module_id {
            Some(module_id) => match self.resolve(&module_id, None) {
                Ok(Resolution::File(file)) => Some(file),
                _ => None,
            },
            None => match self.resolve(js_id, None) {
                Ok(Resolution::File(file)) => Some(file),
                _ => None,
            },
        };

        let Some(module_file) = module_file else {
            warn!(map_id, "failed to infer the module of a source map request");
            return None;
        };
        let map_file = module_file.parent()?.join(map_base);
        self.probe_file(&map_file).then_some(map_file)
    }

    fn remember(&self, id: &str, file: &Path) {
        self.direct.write().insert(id.to_string(), file.to_path_buf());
        if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
            self.file_to_id
                .write()
                .insert(name.to_string(), id.to_string());
        }
    }

    fn import_map(&self) -> &HashMap<String, PathBuf> {
        self.import_map.get_or_init(|| {
            let path = self.web_modules.join("import-map.json");
            if !self.probe_file(&path) {
                return HashMap::new();
            }
            match load_import_map(&path) {
                Ok(map) => {
                    debug!(path = %path.display(), entries = map.len(), "loaded import map");
                    map
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring unreadable import map");
                    HashMap::new()
                }
            }
        })
    }

    fn resolve_web_module(&self, id: &str) -> Option<PathBuf> {
        if let Some(file) = self.import_map().get(id) {
            return Some(file.clone());
        }
        let file = self.web_modules.join(format!("{id}.js"));
        self.probe_file(&file).then_some(file)
    }

    /// Entry of the installed package named exactly `id`:
    /// `module` || `main` || `index.js`.
    fn resolve_package_entry(&self, id: &str) -> Option<String> {
        let manifest = self
            .node_modules_dirs()
            .map(|dir| dir.join(id).join("package.json"))
            .find(|path| self.probe_file(path))?;
        let entry = read_manifest_entry(&manifest).unwrap_or_else(|| "index.js".to_string());
        Some(entry.trim_start_matches("./").to_string())
    }

    /// `id` as a file or deep path inside `node_modules`.
    fn resolve_raw(&self, id: &str) -> Option<PathBuf> {
        let dirs: Vec<PathBuf> = self.node_modules_dirs().collect();
        dirs.into_iter()
            .find_map(|dir| self.resolve_file_or_dir(&dir.join(id)))
    }

    fn resolve_file_or_dir(&self, candidate: &Path) -> Option<PathBuf> {
        if self.probe_file(candidate) {
            return Some(candidate.to_path_buf());
        }
        for ext in EXTENSIONS {
            let mut with_ext = candidate.as_os_str().to_owned();
            with_ext.push(".");
            with_ext.push(ext);
            let with_ext = PathBuf::from(with_ext);
            if self.probe_file(&with_ext) {
                return Some(with_ext);
            }
        }

        let manifest = candidate.join("package.json");
        if self.probe_file(&manifest) {
            if let Some(entry) = read_manifest_entry(&manifest) {
                let file = candidate.join(entry);
                if self.probe_file(&file) {
                    return Some(file);
                }
            }
        }
        let index = candidate.join("index.js");
        self.probe_file(&index).then_some(index)
    }

    fn node_modules_dirs(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.root.ancestors().map(|dir| dir.join("node_modules"))
    }

    fn probe_file(&self, path: &Path) -> bool {
        self.probes.fetch_add(1, Ordering::Relaxed);
        path.is_file()
    }

    fn display(&self, file: &Path) -> String {
        file.strip_prefix(&self.root)
            .unwrap_or(file)
            .display()
            .to_string()
    }
}

fn importer_suffix(importer: &Option<String>) -> String {
    importer
        .as_ref()
        .map(|i| format!(" imported by {i}"))
        .unwrap_or_default()
}

/// Ids must stay below `node_modules`: no `..`, root or drive components.
fn is_package_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('/')
        && !id.starts_with('\\')
        && !id.split(['/', '\\']).any(|segment| segment == "..")
        && Path::new(id)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn basename(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

fn read_manifest_entry(manifest: &Path) -> Option<String> {
    let source = std::fs::read_to_string(manifest).ok()?;
    let pkg: serde_json::Value = serde_json::from_str(&source).ok()?;
    ["module", "main"]
        .iter()
        .find_map(|field| pkg.get(*field).and_then(|v| v.as_str()))
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
}

fn load_import_map(path: &Path) -> Result<HashMap<String, PathBuf>, crate::Error> {
    #[derive(serde::Deserialize)]
    struct ImportMap {
        #[serde(default)]
        imports: BTreeMap<String, String>,
    }

    let source = std::fs::read_to_string(path)?;
    let map: ImportMap = serde_json::from_str(&source).map_err(|source| {
        crate::Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let dir = path.parent().unwrap_or(path);
    Ok(map
        .imports
        .into_iter()
        .map(|(id, rel)| (id, dir.join(rel.trim_start_matches("./"))))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn resolver(root: &Path) -> ModuleResolver {
        ModuleResolver::new(&DevConfig::new(root.to_path_buf()))
    }

    #[test]
    fn test_package_name_redirects_to_entry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "node_modules/lodash/package.json", r#"{"main": "lodash.js"}"#);
        write(dir.path(), "node_modules/lodash/lodash.js", "export default {}");

        let r = resolver(dir.path());
        assert_eq!(
            r.resolve("lodash", None).unwrap(),
            Resolution::Redirect("lodash.js".to_string())
        );
        assert_eq!(
            r.resolve("lodash/lodash.js", None).unwrap(),
            Resolution::File(dir.path().join("node_modules/lodash/lodash.js"))
        );
    }

    #[test]
    fn test_module_field_preferred_and_default_index() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "node_modules/esm/package.json",
            r#"{"main": "cjs.js", "module": "./esm.js"}"#,
        );
        write(dir.path(), "node_modules/plain/package.json", r#"{"name": "plain"}"#);

        let r = resolver(dir.path());
        assert_eq!(
            r.resolve("esm", None).unwrap(),
            Resolution::Redirect("esm.js".to_string())
        );
        assert_eq!(
            r.resolve("plain", None).unwrap(),
            Resolution::Redirect("index.js".to_string())
        );
    }

    #[test]
    fn test_resolution_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "node_modules/pkg/dist/deep.js", "export {}");

        let r = resolver(dir.path());
        let first = r.resolve("pkg/dist/deep", None).unwrap();
        let probes = r.probe_count();
        assert!(probes > 0);

        let second = r.resolve("pkg/dist/deep", None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Resolution::File(dir.path().join("node_modules/pkg/dist/deep.js")));
        assert_eq!(r.probe_count(), probes);
    }

    #[test]
    fn test_redirect_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "node_modules/lodash/package.json", r#"{"main": "lodash.js"}"#);

        let r = resolver(dir.path());
        r.resolve("lodash", None).unwrap();
        let probes = r.probe_count();
        r.resolve("lodash", None).unwrap();
        assert_eq!(r.probe_count(), probes);
    }

    #[test]
    fn test_import_map_and_web_modules() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "web_modules/import-map.json",
            r#"{"imports": {"preact": "./preact.js"}}"#,
        );
        write(dir.path(), "web_modules/preact.js", "export {}");
        write(dir.path(), "web_modules/htm.js", "export {}");
        // A package of the same name loses to the import map.
        write(dir.path(), "node_modules/preact/package.json", r#"{"main": "x.js"}"#);

        let r = resolver(dir.path());
        assert_eq!(
            r.resolve("preact", None).unwrap(),
            Resolution::File(dir.path().join("web_modules/preact.js"))
        );
        assert_eq!(
            r.resolve("htm", None).unwrap(),
            Resolution::File(dir.path().join("web_modules/htm.js"))
        );
    }

    #[test]
    fn test_runtime_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "vendor/vue.js", "export {}");
        write(dir.path(), "node_modules/vue/package.json", r#"{"main": "index.js"}"#);

        let mut config = DevConfig::new(dir.path().to_path_buf());
        config
            .resolve
            .runtime_overrides
            .insert("vue".to_string(), PathBuf::from("vendor/vue.js"));
        let r = ModuleResolver::new(&config);
        assert_eq!(
            r.resolve("vue", None).unwrap(),
            Resolution::File(dir.path().join("vendor/vue.js"))
        );
    }

    #[test]
    fn test_not_found_carries_importer() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(dir.path());
        let err = r.resolve("missing", Some("/src/app.js")).unwrap_err();
        assert_eq!(
            err,
            ResolveError::NotFound {
                id: "missing".to_string(),
                importer: Some("/src/app.js".to_string()),
            }
        );
        assert!(err.to_string().contains("imported by /src/app.js"));
    }

    #[test]
    fn test_directory_with_manifest_main() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "node_modules/pkg/sub/package.json", r#"{"main": "lib.js"}"#);
        write(dir.path(), "node_modules/pkg/sub/lib.js", "export {}");
        write(dir.path(), "node_modules/pkg/other/index.js", "export {}");

        let r = resolver(dir.path());
        // `pkg/sub` has its own manifest, so it redirects like a package.
        assert_eq!(
            r.resolve("pkg/sub", None).unwrap(),
            Resolution::Redirect("lib.js".to_string())
        );
        assert_eq!(
            r.resolve("pkg/other", None).unwrap(),
            Resolution::File(dir.path().join("node_modules/pkg/other/index.js"))
        );
    }

    #[test]
    fn test_source_map_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "node_modules/lib/dist/lib.js", "export {}\n//# sourceMappingURL=lib.js.map");
        write(dir.path(), "node_modules/lib/dist/lib.js.map", "{}");

        let r = resolver(dir.path());
        r.resolve("lib/dist/lib.js", None).unwrap();
        assert_eq!(
            r.resolve_source_map("lib/dist/lib.js.map"),
            Some(dir.path().join("node_modules/lib/dist/lib.js.map"))
        );
        assert_eq!(r.resolve_source_map("unknown.js.map"), None);
    }

    #[test]
    fn test_ids_escaping_node_modules_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        write(dir.path(), "secret.js", "export const secret = 42\n");
        write(&root, "node_modules/.keep", "");

        let r = resolver(&root);
        for id in ["../../secret.js", "../../secret", "pkg/../../../secret.js", "/etc/passwd"] {
            let err = r.resolve(id, Some("/main.js")).unwrap_err();
            assert_eq!(
                err,
                ResolveError::NotFound {
                    id: id.to_string(),
                    importer: Some("/main.js".to_string()),
                }
            );
        }
        assert_eq!(r.probe_count(), 0);
    }
}
