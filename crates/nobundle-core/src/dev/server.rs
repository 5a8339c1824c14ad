//! Request handling for the dev server.
//!
//! [`DevServer`] owns every piece of per-server state (resolver caches,
//! dependency graph, artifact cache, HMR coordinator) and answers requests
//! independently of any HTTP framework. The CLI maps axum requests onto
//! [`Request`] and [`Response`].

use super::accept::HMR_CLIENT_PATH;
use super::artifacts::{Artifact, ArtifactCache, ArtifactKind};
use super::client::client_runtime;
use super::css::{
    compile_css, is_css_module, module_export, stylesheet_module, CssOptions, StyleOutput,
};
use super::graph::DependencyGraph;
use super::hmr::HmrCoordinator;
use super::resolve::{ModuleResolver, Resolution, ResolveError, MODULES_PREFIX};
use super::rewrite::ImportRewriter;
use super::sfc::{
    main_module, scope_id, BlockCompiler, BlockContext, BuiltinCompiler, SfcBlock, SfcDescriptor,
};
use crate::config::DevConfig;
use crate::error::Error;
use crate::paths::{
    clean_url, decode_request_path, join_public, request_to_file, split_query, strip_timestamp,
    Query,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const JS: &str = "application/javascript";
const CSS: &str = "text/css";
const HTML: &str = "text/html";
const JSON: &str = "application/json";

/// An incoming request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Path with query, e.g. `/App.vue?type=style&index=0`.
    pub url: String,
    /// The browser fetches this as a module script (not a stylesheet or
    /// a navigation).
    pub is_import: bool,
    /// Public path of the referring page or module, if known.
    pub referer: Option<String>,
}

impl Request {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Mark the request as a module import.
    #[must_use]
    pub fn import(mut self) -> Self {
        self.is_import = true;
        self
    }

    #[must_use]
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }
}

/// Outcome of handling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Content {
        content_type: &'static str,
        body: String,
    },
    /// `302` to `location`.
    Redirect { location: String },
    NotFound { message: String },
    /// Not handled here; serve the file as-is.
    Static,
}

impl Response {
    fn js(body: String) -> Self {
        Self::Content {
            content_type: JS,
            body,
        }
    }

    fn css(body: String) -> Self {
        Self::Content {
            content_type: CSS,
            body,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}

/// One dev server instance.
pub struct DevServer {
    config: DevConfig,
    resolver: Arc<ModuleResolver>,
    rewriter: ImportRewriter,
    graph: Arc<DependencyGraph>,
    artifacts: Arc<ArtifactCache>,
    compiler: Arc<dyn BlockCompiler>,
    hmr: HmrCoordinator,
}

impl DevServer {
    /// Create a server for `config.root` with the builtin component
    /// compiler.
    pub fn new(config: DevConfig) -> Result<Self, Error> {
        Self::with_compiler(config, Arc::new(BuiltinCompiler))
    }

    /// Create a server with a custom component compiler.
    pub fn with_compiler(config: DevConfig, compiler: Arc<dyn BlockCompiler>) -> Result<Self, Error> {
        if !config.root.is_dir() {
            return Err(Error::InvalidRoot {
                root: config.root.clone(),
            });
        }

        let graph = Arc::new(DependencyGraph::new());
        let artifacts = Arc::new(ArtifactCache::new());
        let hmr = HmrCoordinator::new(
            config.root.clone(),
            Arc::clone(&graph),
            Arc::clone(&artifacts),
            Arc::clone(&compiler),
        );

        Ok(Self {
            resolver: Arc::new(ModuleResolver::new(&config)),
            rewriter: ImportRewriter::new(Arc::clone(&graph)),
            graph,
            artifacts,
            compiler,
            hmr,
            config,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    #[must_use]
    pub fn hmr(&self) -> &HmrCoordinator {
        &self.hmr
    }

    /// Answer one request.
    pub async fn handle(&self, request: &Request) -> Response {
        let url = decode_request_path(&request.url);
        let (path, raw_query) = split_query(&url);
        let query = Query::parse(raw_query);
        let is_import = request.is_import || query.has("import");

        if path == HMR_CLIENT_PATH {
            return Response::js(client_runtime().to_string());
        }
        if let Some(id) = path.strip_prefix(MODULES_PREFIX) {
            return self.serve_bare_module(id, raw_query, request.referer.as_deref()).await;
        }
        if path == "/" || path == "/index.html" {
            return self.serve_index().await;
        }

        match extension(path) {
            "js" | "mjs" => self.serve_script(path, &url).await,
            "vue" => self.serve_component(path, &query, &url).await,
            "css" => self.serve_stylesheet(path, &query, is_import).await,
            "json" if is_import => self.serve_json(path).await,
            _ => Response::Static,
        }
    }

    async fn serve_bare_module(&self, id: &str, raw_query: Option<&str>, referer: Option<&str>) -> Response {
        if id.ends_with(".map") {
            let Some(map) = self.resolve_source_map(id).await else {
                return Response::not_found(format!("source map not found: {id}"));
            };
            return match tokio::fs::read_to_string(&map).await {
                Ok(body) => Response::Content {
                    content_type: JSON,
                    body,
                },
                Err(err) => {
                    warn!(file = %map.display(), error = %err, "failed to read source map");
                    Response::not_found(format!("source map not readable: {id}"))
                }
            };
        }

        match self.resolve_module(id, referer).await {
            Ok(Resolution::Redirect(suffix)) => {
                let mut location = format!("{MODULES_PREFIX}{id}/{suffix}");
                if let Some(query) = raw_query {
                    location.push('?');
                    location.push_str(query);
                }
                Response::Redirect { location }
            }
            Ok(Resolution::File(file)) => match tokio::fs::read_to_string(&file).await {
                // Package files only get their bare imports rewritten;
                // node_modules is never part of the HMR graph.
                Ok(source) => {
                    let public = format!("{MODULES_PREFIX}{id}");
                    match self.rewriter.analyze(&source, &public, None) {
                        Ok(out) => Response::js(out.code),
                        Err(err) => {
                            warn!(id, error = %err, "failed to rewrite module, serving as-is");
                            Response::js(source)
                        }
                    }
                }
                Err(err) => {
                    warn!(id, file = %file.display(), error = %err, "failed to read resolved module");
                    Response::not_found(format!("module not readable: {id}"))
                }
            },
            Err(err) => Response::not_found(err.to_string()),
        }
    }

    /// Resolver probes are synchronous file system checks; run them on the
    /// blocking pool.
    async fn resolve_module(&self, id: &str, referer: Option<&str>) -> Result<Resolution, ResolveError> {
        let resolver = Arc::clone(&self.resolver);
        let owned_id = id.to_string();
        let importer = referer.map(str::to_string);
        let task = tokio::task::spawn_blocking(move || resolver.resolve(&owned_id, importer.as_deref()));
        match task.await {
            Ok(result) => result,
            Err(err) => {
                warn!(id, error = %err, "module resolution task failed");
                Err(ResolveError::NotFound {
                    id: id.to_string(),
                    importer: referer.map(str::to_string),
                })
            }
        }
    }

    async fn resolve_source_map(&self, map_id: &str) -> Option<PathBuf> {
        let resolver = Arc::clone(&self.resolver);
        let owned_id = map_id.to_string();
        match tokio::task::spawn_blocking(move || resolver.resolve_source_map(&owned_id)).await {
            Ok(map) => map,
            Err(err) => {
                warn!(map_id, error = %err, "source map lookup task failed");
                None
            }
        }
    }

    async fn serve_index(&self) -> Response {
        let file = self.config.root.join("index.html");
        match tokio::fs::read_to_string(&file).await {
            Ok(html) => Response::Content {
                content_type: HTML,
                body: self.rewriter.rewrite_html(&html, "/index.html"),
            },
            Err(_) => Response::not_found("index.html not found"),
        }
    }

    async fn serve_script(&self, path: &str, url: &str) -> Response {
        let Some(source) = self.read_public(path).await else {
            return Response::not_found(format!("file not found: {path}"));
        };
        let (importer, timestamp) = strip_timestamp(url);
        Response::js(self.rewriter.rewrite(&source, &importer, timestamp.as_deref()))
    }

    async fn serve_json(&self, path: &str) -> Response {
        match self.read_public(path).await {
            Some(source) => Response::js(format!("export default {}\n", source.trim())),
            None => Response::not_found(format!("file not found: {path}")),
        }
    }

    async fn serve_stylesheet(&self, path: &str, query: &Query, is_import: bool) -> Response {
        let output = match self.artifacts.get(path, ArtifactKind::Style(0)) {
            Some(Artifact::Style(_, output)) => output,
            _ => {
                let generation = self.artifacts.generation(path);
                let Some(source) = self.read_public(path).await else {
                    return Response::not_found(format!("file not found: {path}"));
                };
                let output = Arc::new(compile_css(
                    &source,
                    &CssOptions {
                        filename: path.to_string(),
                        css_modules: is_css_module(path),
                        scope_id: None,
                    },
                ));
                log_diagnostics(path, &output.diagnostics);
                self.artifacts
                    .put(path, generation, Artifact::Style(0, Arc::clone(&output)));
                output
            }
        };

        if query.has("raw") || !is_import {
            Response::css(output.code.clone())
        } else {
            Response::js(stylesheet_module(path, output.modules.as_ref()))
        }
    }

    async fn serve_component(&self, path: &str, query: &Query, url: &str) -> Response {
        let Some((descriptor, file, generation)) = self.component_descriptor(path).await else {
            return Response::not_found(format!("file not found: {path}"));
        };

        match query.get("type") {
            None => {
                let code = match self.artifacts.get(path, ArtifactKind::Script) {
                    Some(Artifact::Script(code)) => code,
                    _ => {
                        let code: Arc<str> =
                            Arc::from(main_module(&descriptor, path, &file.to_string_lossy()));
                        self.artifacts
                            .put(path, generation, Artifact::Script(Arc::clone(&code)));
                        code
                    }
                };
                let (importer, timestamp) = strip_timestamp(url);
                Response::js(self.rewriter.rewrite(&code, &importer, timestamp.as_deref()))
            }
            Some("template") => {
                let Some(template) = &descriptor.template else {
                    return Response::not_found(format!("{path} has no <template>"));
                };
                if let Some(Artifact::Template(code)) = self.artifacts.get(path, ArtifactKind::Template) {
                    return Response::js(code.to_string());
                }
                let scope = scope_id(path);
                let compiled = self.compiler.compile_template(
                    template,
                    &BlockContext {
                        public_path: path,
                        scope_id: &scope,
                    },
                );
                log_diagnostics(path, &compiled.errors);
                let code: Arc<str> = Arc::from(compiled.code);
                self.artifacts
                    .put(path, generation, Artifact::Template(Arc::clone(&code)));
                Response::js(code.to_string())
            }
            Some("style") => {
                let Some(index) = query.get("index").and_then(|i| i.parse::<usize>().ok()) else {
                    return Response::not_found(format!("{path}: missing style index"));
                };
                let Some(block) = descriptor.styles.get(index) else {
                    return Response::not_found(format!("{path} has no style block {index}"));
                };
                if query.has("raw") && block.src().is_none() {
                    return Response::css(block.content.clone());
                }

                let output = match self.artifacts.get(path, ArtifactKind::Style(index)) {
                    Some(Artifact::Style(_, output)) => output,
                    _ => match self.compile_component_style(path, index, block, generation).await {
                        Some(output) => output,
                        None => {
                            return Response::not_found(format!(
                                "{path}: style source of block {index} not found"
                            ))
                        }
                    },
                };

                if query.has("module") {
                    let empty = BTreeMap::new();
                    Response::js(module_export(output.modules.as_ref().unwrap_or(&empty)))
                } else {
                    Response::css(output.code.clone())
                }
            }
            Some(other) => Response::not_found(format!("{path}: unknown block type \"{other}\"")),
        }
    }

    /// The component's descriptor and the generation it belongs to. Every
    /// artifact derived from the descriptor is stored under that generation.
    async fn component_descriptor(&self, path: &str) -> Option<(Arc<SfcDescriptor>, PathBuf, u64)> {
        let file = request_to_file(&self.config.root, path)?;
        let generation = self.artifacts.generation(path);
        if let Some(Artifact::Descriptor(descriptor)) = self.artifacts.get(path, ArtifactKind::Descriptor) {
            return Some((descriptor, file, generation));
        }

        let source = tokio::fs::read_to_string(&file).await.ok()?;
        let parsed = self.compiler.parse(&source, &file.to_string_lossy());
        log_diagnostics(path, &parsed.errors);
        let descriptor = Arc::new(parsed.descriptor);
        self.artifacts
            .put(path, generation, Artifact::Descriptor(Arc::clone(&descriptor)));
        Some((descriptor, file, generation))
    }

    async fn compile_component_style(
        &self,
        path: &str,
        index: usize,
        block: &SfcBlock,
        generation: u64,
    ) -> Option<Arc<StyleOutput>> {
        let loaded;
        let block = match block.src() {
            Some(src) => {
                let source_path = join_public(path, src);
                let content = self.read_public(&source_path).await?;
                self.hmr
                    .record_style_source(clean_url(&source_path), path, index);
                loaded = SfcBlock {
                    content,
                    attrs: block.attrs.clone(),
                };
                &loaded
            }
            None => block,
        };

        let scope = scope_id(path);
        let output = Arc::new(self.compiler.compile_style(
            block,
            &BlockContext {
                public_path: path,
                scope_id: &scope,
            },
        ));
        log_diagnostics(path, &output.diagnostics);
        self.artifacts
            .put(path, generation, Artifact::Style(index, Arc::clone(&output)));
        Some(output)
    }

    async fn read_public(&self, path: &str) -> Option<String> {
        let file = request_to_file(&self.config.root, path)?;
        match tokio::fs::read_to_string(&file).await {
            Ok(source) => Some(source),
            Err(err) => {
                debug!(path, error = %err, "failed to read file");
                None
            }
        }
    }
}

impl std::fmt::Debug for DevServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevServer")
            .field("root", &self.config.root)
            .finish_non_exhaustive()
    }
}

fn extension(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

fn log_diagnostics(path: &str, diagnostics: &[String]) {
    for diagnostic in diagnostics {
        warn!(path, diagnostic = %diagnostic, "compile diagnostic");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::css::style_id;
    use crate::dev::hmr::UpdateMessage;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn server(root: &Path) -> DevServer {
        DevServer::new(DevConfig::new(root.to_path_buf())).unwrap()
    }

    fn body(response: Response) -> String {
        match response {
            Response::Content { body, .. } => body,
            other => panic!("expected content, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            DevServer::new(DevConfig::new(missing)),
            Err(Error::InvalidRoot { .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_css_and_bare_module() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "app.js", "import './c.css'\nimport { chunk } from 'lodash'\nchunk([1])\n");
        write(root, "c.css", "body { margin: 3px }\n");
        write(root, "node_modules/lodash/package.json", r#"{"main": "lodash.js"}"#);
        write(root, "node_modules/lodash/lodash.js", "export function chunk(a) { return a }\n");
        let server = server(root);

        let app = body(server.handle(&Request::new("/app.js").import()).await);
        assert!(app.contains("from '/@modules/lodash'"));
        assert!(app.contains("import './c.css'"));
        assert!(server.graph().importers_of("/c.css").contains("/app.js"));

        let redirect = server.handle(&Request::new("/@modules/lodash").import()).await;
        assert_eq!(
            redirect,
            Response::Redirect {
                location: "/@modules/lodash/lodash.js".into()
            }
        );
        let lodash = server
            .handle(&Request::new("/@modules/lodash/lodash.js").import())
            .await;
        assert!(matches!(
            &lodash,
            Response::Content { content_type, body } if *content_type == JS && body.contains("chunk")
        ));

        let shim = body(server.handle(&Request::new("/c.css").import()).await);
        assert!(shim.contains(&format!("updateStyle(\"{}\", \"/c.css?raw\")", style_id("/c.css"))));
        let raw = body(server.handle(&Request::new("/c.css?raw")).await);
        assert!(raw.contains("3px"));

        let mut rx = server.hmr().subscribe();
        write(root, "c.css", "body { margin: 7px }\n");
        let messages = server.hmr().handle_changes(&[root.join("c.css")]).await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            UpdateMessage::StyleUpdate { path, .. } if path == "/c.css"
        ));
        let raw = body(server.handle(&Request::new("/c.css?raw")).await);
        assert!(raw.contains("7px"));
    }

    #[tokio::test]
    async fn test_redirect_preserves_query() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "node_modules/pkg/package.json", r#"{"module": "esm/index.js"}"#);
        write(dir.path(), "node_modules/pkg/esm/index.js", "export default 1\n");
        let server = server(dir.path());
        assert_eq!(
            server.handle(&Request::new("/@modules/pkg?import")).await,
            Response::Redirect {
                location: "/@modules/pkg/esm/index.js?import".into()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_module_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let response = server
            .handle(&Request::new("/@modules/nope").with_referer("/app.js"))
            .await;
        assert!(matches!(
            response,
            Response::NotFound { message } if message.contains("nope") && message.contains("/app.js")
        ));
    }

    #[tokio::test]
    async fn test_timestamped_request_busts_subtree() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.js", "import './c.js'\n");
        let server = server(dir.path());

        let code = body(server.handle(&Request::new("/b.js?t=42").import()).await);
        assert!(code.contains("'./c.js?t=42'"));
        assert!(server.graph().importees_of("/b.js").contains("/c.js"));
    }

    #[tokio::test]
    async fn test_index_html() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "index.html",
            "<html><head></head><body><script type=\"module\">import 'vue'\nimport './main.js'</script></body></html>",
        );
        let server = server(dir.path());
        let html = server.handle(&Request::new("/")).await;
        let Response::Content { content_type, body } = html else {
            panic!("expected html");
        };
        assert_eq!(content_type, HTML);
        assert!(body.contains("import '/@modules/vue'"));
        assert!(body.contains("import \"/@hmr\""));
        assert!(server.graph().importers_of("/main.js").contains("/index.html"));
    }

    #[tokio::test]
    async fn test_json_and_static() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "data.json", "{\"a\": 1}\n");
        write(dir.path(), "logo.svg", "<svg/>");
        let server = server(dir.path());
        assert_eq!(
            body(server.handle(&Request::new("/data.json").import()).await),
            "export default {\"a\": 1}\n"
        );
        assert_eq!(server.handle(&Request::new("/data.json")).await, Response::Static);
        assert_eq!(server.handle(&Request::new("/logo.svg")).await, Response::Static);
    }

    #[tokio::test]
    async fn test_css_module_import() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "m.module.css", ".title { color: red }\n");
        let server = server(dir.path());
        let shim = body(server.handle(&Request::new("/m.module.css").import()).await);
        assert!(shim.contains("updateStyle("));
        assert!(shim.contains("export default {\"title\":"));
    }

    #[tokio::test]
    async fn test_component_sub_resources() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "theme.css", "h1 { padding: 5px }\n");
        write(
            dir.path(),
            "App.vue",
            "<template><h1>{{ msg }}</h1></template>\n<script>\nimport { ref } from 'vue'\nexport default { data: () => ({ msg: 'hi' }) }\n</script>\n<style scoped>h1 { margin: 0 }</style>\n<style src=\"./theme.css\"></style>\n",
        );
        let server = server(dir.path());

        let main = body(server.handle(&Request::new("/App.vue").import()).await);
        assert!(main.contains("const __script ="));
        assert!(main.contains("from '/@modules/vue'"));
        assert!(main.contains("__script.__hmrId = \"/App.vue\""));
        assert!(main.contains("\"/App.vue?type=template\""));

        let template = body(server.handle(&Request::new("/App.vue?type=template").import()).await);
        assert!(template.contains("export const render"));

        let scoped = server.handle(&Request::new("/App.vue?type=style&index=0")).await;
        assert!(matches!(
            &scoped,
            Response::Content { content_type, body } if *content_type == CSS && body.contains("data-v-")
        ));
        let raw = body(server.handle(&Request::new("/App.vue?type=style&index=0&raw")).await);
        assert_eq!(raw, "h1 { margin: 0 }");

        let theme = body(server.handle(&Request::new("/App.vue?type=style&index=1")).await);
        assert!(theme.contains("5px"));
        let messages = server.hmr().handle_changes(&[dir.path().join("theme.css")]).await;
        assert!(matches!(
            messages.as_slice(),
            [UpdateMessage::ComponentStyleUpdate { path, index: 1, .. }] if path == "/App.vue"
        ));

        assert!(matches!(
            server.handle(&Request::new("/App.vue?type=style&index=5")).await,
            Response::NotFound { .. }
        ));
    }

    /// Rewrites the component and invalidates it while the first parse runs,
    /// as a watch event arriving mid-request would.
    struct EditDuringParse {
        file: PathBuf,
        artifacts: std::sync::OnceLock<Arc<ArtifactCache>>,
        fired: std::sync::atomic::AtomicBool,
    }

    impl BlockCompiler for EditDuringParse {
        fn parse(&self, source: &str, filename: &str) -> crate::dev::sfc::ParseOutput {
            if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                fs::write(&self.file, "<script>\nexport default { v: 2 }\n</script>\n").unwrap();
                self.artifacts.get().unwrap().invalidate("/App.vue");
            }
            BuiltinCompiler.parse(source, filename)
        }

        fn compile_template(
            &self,
            block: &SfcBlock,
            ctx: &BlockContext<'_>,
        ) -> crate::dev::sfc::CompileOutput {
            BuiltinCompiler.compile_template(block, ctx)
        }

        fn compile_style(&self, block: &SfcBlock, ctx: &BlockContext<'_>) -> StyleOutput {
            BuiltinCompiler.compile_style(block, ctx)
        }
    }

    #[tokio::test]
    async fn test_component_edited_during_parse_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "App.vue", "<script>\nexport default { v: 1 }\n</script>\n");
        let compiler = Arc::new(EditDuringParse {
            file: dir.path().join("App.vue"),
            artifacts: std::sync::OnceLock::new(),
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        let server =
            DevServer::with_compiler(DevConfig::new(dir.path().to_path_buf()), compiler.clone())
                .unwrap();
        compiler.artifacts.set(Arc::clone(&server.artifacts)).unwrap();

        let first = body(server.handle(&Request::new("/App.vue").import()).await);
        assert!(first.contains("{ v: 1 }"));
        assert!(server.artifacts.get("/App.vue", ArtifactKind::Script).is_none());
        assert!(server.artifacts.get("/App.vue", ArtifactKind::Descriptor).is_none());

        let second = body(server.handle(&Request::new("/App.vue").import()).await);
        assert!(second.contains("{ v: 2 }"));
        let third = body(server.handle(&Request::new("/App.vue").import()).await);
        assert!(third.contains("{ v: 2 }"));
    }

    #[tokio::test]
    async fn test_bare_module_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        write(dir.path(), "secret.js", "export const secret = 42\n");
        write(&root, "node_modules/.keep", "");
        let server = server(&root);

        for url in ["/@modules/../../secret.js", "/@modules/%2e%2e/%2e%2e/secret.js"] {
            let response = server.handle(&Request::new(url).import()).await;
            assert!(matches!(response, Response::NotFound { .. }), "{url}: {response:?}");
        }
    }

    #[tokio::test]
    async fn test_percent_encoded_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "my file.js", "import './caf\u{e9}.js'\n");
        let server = server(dir.path());

        let code = body(server.handle(&Request::new("/my%20file.js").import()).await);
        assert!(code.contains("import './caf\u{e9}.js'"));
        assert!(server.graph().importers_of("/caf\u{e9}.js").contains("/my file.js"));
    }
}
