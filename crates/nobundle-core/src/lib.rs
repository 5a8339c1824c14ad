#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

pub mod config;
pub mod dev;
pub mod error;
pub mod imports;
pub mod paths;
pub mod version;

pub use config::{load_config, DevConfig};
pub use dev::{DevServer, Response, UpdateMessage};
pub use error::Error;
pub use imports::{lex_imports, ImportKind, ImportSpecifier, LexError};
pub use version::VERSION;
