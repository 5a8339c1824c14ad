//! Public path helpers.
//!
//! A public (served) path is root-relative and always uses `/` separators,
//! e.g. `/src/App.vue?type=style&index=0`. Graph keys are clean paths with
//! the query removed.

use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

/// Name of the cache-busting query parameter.
pub const TIMESTAMP_PARAM: &str = "t";

/// Strip the query string and hash from a URL.
#[must_use]
pub fn clean_url(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Split a URL into its path and optional raw query (without `?`).
#[must_use]
pub fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query.split('#').next().unwrap_or(query))),
        None => (url, None),
    }
}

/// Percent-decode the path part of a request URL. The query is left
/// encoded; paths that do not decode to UTF-8 are returned unchanged.
#[must_use]
pub fn decode_request_path(url: &str) -> Cow<'_, str> {
    let (path, query) = split_query(url);
    let Ok(decoded) = percent_decode_str(path).decode_utf8() else {
        return Cow::Borrowed(url);
    };
    match (decoded, query) {
        (Cow::Borrowed(_), _) => Cow::Borrowed(url),
        (Cow::Owned(mut path), Some(query)) => {
            path.push('?');
            path.push_str(query);
            Cow::Owned(path)
        }
        (Cow::Owned(path), None) => Cow::Owned(path),
    }
}

/// Parsed query string. Keys without `=` are flags (`?raw`, `&module`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, Option<String>)>,
}

impl Query {
    /// Parse a raw query string (without the leading `?`).
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        let pairs = raw
            .unwrap_or("")
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (part.to_string(), None),
            })
            .collect();
        Self { pairs }
    }

    /// Value of `key`, if present with a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Whether `key` is present at all (flag or value).
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// Remove every occurrence of `key`.
    pub fn remove(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| k != key);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            match v {
                Some(v) => write!(f, "{k}={v}")?,
                None => f.write_str(k)?,
            }
        }
        Ok(())
    }
}

/// Remove the `t=<timestamp>` parameter from a URL, keeping the rest of
/// the query intact. Returns the URL and the removed timestamp.
#[must_use]
pub fn strip_timestamp(url: &str) -> (String, Option<String>) {
    let (path, raw) = split_query(url);
    let mut query = Query::parse(raw);
    let timestamp = query.get(TIMESTAMP_PARAM).map(str::to_string);
    if timestamp.is_none() {
        return (url.to_string(), None);
    }
    query.remove(TIMESTAMP_PARAM);
    if query.is_empty() {
        (path.to_string(), timestamp)
    } else {
        (format!("{path}?{query}"), timestamp)
    }
}

/// Append a cache-busting timestamp to a specifier.
#[must_use]
pub fn append_timestamp(specifier: &str, timestamp: &str) -> String {
    let sep = if specifier.contains('?') { '&' } else { '?' };
    format!("{specifier}{sep}{TIMESTAMP_PARAM}={timestamp}")
}

/// Whether a specifier is an absolute URL with a scheme (`https://…`,
/// `data:…`). Protocol-relative `//cdn/...` also counts.
#[must_use]
pub fn is_external_url(specifier: &str) -> bool {
    specifier.starts_with("//") || url::Url::parse(specifier).is_ok()
}

/// Whether a specifier is bare: it names a package instead of a path.
#[must_use]
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.is_empty()
        && !specifier.starts_with('.')
        && !specifier.starts_with('/')
        && !is_external_url(specifier)
}

/// Resolve `specifier` against the directory of `importer`, producing a
/// normalized public path. The query of `specifier` is kept.
#[must_use]
pub fn join_public(importer: &str, specifier: &str) -> String {
    let (spec_path, query) = split_query(specifier);
    let base = if spec_path.starts_with('/') {
        String::new()
    } else {
        let importer = clean_url(importer);
        match importer.rfind('/') {
            Some(idx) => importer[..idx].to_string(),
            None => String::new(),
        }
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(spec_path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut out = format!("/{}", segments.join("/"));
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Map a public path to a file under `root`. Returns `None` if the path
/// escapes the root.
#[must_use]
pub fn request_to_file(root: &Path, public: &str) -> Option<PathBuf> {
    let clean = clean_url(public);
    let mut file = root.to_path_buf();
    for component in Path::new(clean.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => file.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(file)
}

/// Map a file under `root` to its public path. Returns `None` for files
/// outside the root.
#[must_use]
pub fn file_to_request(root: &Path, file: &Path) -> Option<String> {
    let rel = file.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Some(format!("/{}", parts.join("/")))
}

/// Short stable hash of a public path, used for style element ids.
#[must_use]
pub fn short_hash(input: &str) -> String {
    let hex = blake3::hash(input.as_bytes()).to_hex();
    hex.as_str()[..8].to_string()
}
