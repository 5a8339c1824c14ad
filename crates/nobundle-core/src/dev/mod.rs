//! No-bundle development server.
//!
//! Serves source files to the browser as native ES modules, compiled and
//! rewritten per request. Each request goes resolve → load → compile →
//! rewrite, recording import edges in the dependency graph; each batch of
//! file changes goes invalidate → walk graph → push `UpdateMessage`s.

pub mod accept;
pub mod artifacts;
pub mod client;
pub mod css;
pub mod graph;
pub mod hmr;
pub mod resolve;
pub mod rewrite;
pub mod server;
pub mod sfc;

pub use artifacts::{Artifact, ArtifactCache, ArtifactKind};
pub use graph::{DependencyGraph, Propagation};
pub use hmr::{HmrCoordinator, UpdateMessage};
pub use resolve::{ModuleResolver, Resolution, ResolveError};
pub use rewrite::{ImportRewriter, RewriteOutput};
pub use server::{DevServer, Request, Response};
pub use sfc::{BlockCompiler, BuiltinCompiler, SfcBlock, SfcDescriptor};
