//! Configuration file discovery and parsing for `nobundle dev`.
//!
//! Loads `nobundle.config.json` (or `.nobundlerc.json`) from the project root.
//!
//! ## Supported config format
//!
//! ```json
//! {
//!   "server": { "port": 3000, "host": "localhost", "open": false },
//!   "resolve": {
//!     "webModules": "web_modules",
//!     "runtimeOverrides": { "vue": "vendor/vue.runtime.esm-browser.js" }
//!   },
//!   "watch": { "ignore": ["dist"], "debounceMs": 50 }
//! }
//! ```

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Config file names in priority order.
const CONFIG_FILES: &[&str] = &["nobundle.config.json", ".nobundlerc.json"];

/// Default port for the dev server.
pub const DEFAULT_PORT: u16 = 3000;

/// Default bind host for the dev server.
pub const DEFAULT_HOST: &str = "localhost";

/// Installed builds probed for the reserved `vue` specifier when no
/// override is configured. The full build comes first because the builtin
/// template compiler compiles templates in the browser.
const VUE_RUNTIME_ENTRIES: &[&str] = &[
    "node_modules/vue/dist/vue.esm-browser.js",
    "node_modules/vue/dist/vue.runtime.esm-browser.js",
];

/// Complete dev server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevConfig {
    /// Project root. Never read from the file; set by the caller.
    #[serde(skip)]
    pub root: PathBuf,
    /// Server options.
    pub server: ServerConfig,
    /// Module resolution options.
    pub resolve: ResolveConfig,
    /// File watcher options.
    pub watch: WatchConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Host to bind to.
    pub host: String,
    /// Open browser automatically.
    pub open: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            open: false,
        }
    }
}

/// Resolve configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolveConfig {
    /// Directory (relative to root) holding pre-installed web modules and
    /// the optional `import-map.json`.
    pub web_modules: String,
    /// Reserved specifiers bound to a fixed runtime file (relative to root).
    pub runtime_overrides: BTreeMap<String, PathBuf>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            web_modules: "web_modules".to_string(),
            runtime_overrides: BTreeMap::new(),
        }
    }
}

impl ResolveConfig {
    /// Runtime overrides with paths made absolute against `root`.
    ///
    /// When no override for `vue` is configured and the project has the
    /// browser runtime installed, it is bound automatically.
    #[must_use]
    pub fn effective_overrides(&self, root: &Path) -> BTreeMap<String, PathBuf> {
        let mut overrides: BTreeMap<String, PathBuf> = self
            .runtime_overrides
            .iter()
            .map(|(id, path)| {
                let abs = if path.is_absolute() {
                    path.clone()
                } else {
                    root.join(path)
                };
                (id.clone(), abs)
            })
            .collect();

        if !overrides.contains_key("vue") {
            if let Some(runtime) = VUE_RUNTIME_ENTRIES
                .iter()
                .map(|entry| root.join(entry))
                .find(|path| path.is_file())
            {
                overrides.insert("vue".to_string(), runtime);
            }
        }

        overrides
    }
}

/// File watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchConfig {
    /// Extra directory names to ignore (dependency dirs are always ignored).
    pub ignore: Vec<String>,
    /// Coalescing window for change events in milliseconds.
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            debounce_ms: 50,
        }
    }
}

impl DevConfig {
    /// Create a default config for the given root.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ..Default::default()
        }
    }
}

/// Find a config file in the given root directory.
#[must_use]
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

/// Load configuration for `root`.
///
/// If `config_path` is `Some`, that file must exist. Otherwise the root is
/// searched and `Ok(None)` is returned when no config file is present.
pub fn load_config(
    root: &Path,
    config_path: Option<&Path>,
) -> Result<Option<(PathBuf, DevConfig)>, Error> {
    let path = match config_path {
        Some(p) => {
            let abs = if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            };
            if !abs.is_file() {
                return Err(Error::ConfigNotFound { path: abs });
            }
            abs
        }
        None => match find_config_file(root) {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    let source = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
        path: path.clone(),
        source,
    })?;

    let mut config: DevConfig =
        serde_json::from_str(&source).map_err(|source| Error::ConfigParse {
            path: path.clone(),
            source,
        })?;
    config.root = root.to_path_buf();

    Ok(Some((path, config)))
}
