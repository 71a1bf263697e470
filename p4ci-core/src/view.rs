//! Client view construction and depot path pattern matching.
//!
//! Patterns use the server's wildcards: `...` matches any run of characters
//! including `/`, `*` matches within one path segment.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::{ClientName, ViewMapping};

// ---------------------------------------------------------------------------
// View construction
// ---------------------------------------------------------------------------

/// Pair a flat `depot client depot client ...` token list into mappings.
pub fn pair_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<ViewMapping>, ConfigError> {
    if tokens.len() % 2 != 0 {
        return Err(ConfigError::OddView {
            count: tokens.len(),
        });
    }
    Ok(tokens
        .chunks(2)
        .map(|pair| ViewMapping::new(pair[0].as_ref(), pair[1].as_ref()))
        .collect())
}

/// Split a whitespace-separated view string (`"//depot/... ..."`) into mappings.
pub fn parse_view_string(raw: &str) -> Result<Vec<ViewMapping>, ConfigError> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    pair_tokens(&tokens)
}

/// Root every client half of `mappings` under `//<client>/`.
pub fn localize(mappings: &[ViewMapping], client: &ClientName) -> Vec<ViewMapping> {
    mappings
        .iter()
        .map(|m| {
            let local = m.client.trim_start_matches('/');
            ViewMapping::new(m.depot.clone(), format!("//{client}/{local}"))
        })
        .collect()
}

/// The implicit view of a stream client.
pub fn stream_mapping(stream: &str, client: &ClientName) -> ViewMapping {
    ViewMapping::new(
        format!("{}/...", stream.trim_end_matches('/')),
        client.all_files(),
    )
}

/// `//<client>/a/b.txt` → `<root>/a/b.txt`.
pub fn client_path_to_local(client: &ClientName, root: &Path, client_path: &str) -> Option<PathBuf> {
    let prefix = format!("//{client}/");
    let relative = client_path.strip_prefix(&prefix)?;
    let mut local = root.to_path_buf();
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        local.push(part);
    }
    Some(local)
}

/// `<root>/a/b.txt` → `//<client>/a/b.txt`.
pub fn local_to_client_path(client: &ClientName, root: &Path, local: &Path) -> Option<String> {
    let relative = local.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!("//{client}/{}", parts.join("/")))
}

// ---------------------------------------------------------------------------
// View translation
// ---------------------------------------------------------------------------

/// A client view: ordered mappings where later lines override earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct View {
    pub mappings: Vec<ViewMapping>,
}

impl View {
    pub fn new(mappings: Vec<ViewMapping>) -> Self {
        Self { mappings }
    }

    /// Client-syntax path for a depot file, `None` when unmapped or excluded.
    pub fn depot_to_client(&self, depot_path: &str) -> Option<String> {
        let mapping = self
            .mappings
            .iter()
            .rev()
            .find(|m| matches(m.depot_pattern(), depot_path))?;
        if mapping.is_exclusion() {
            return None;
        }
        translate(mapping.depot_pattern(), &mapping.client, depot_path)
    }

    /// Depot path for a client-syntax path, `None` when unmapped or excluded.
    pub fn client_to_depot(&self, client_path: &str) -> Option<String> {
        let mapping = self
            .mappings
            .iter()
            .rev()
            .find(|m| matches(&m.client, client_path))?;
        if mapping.is_exclusion() {
            return None;
        }
        translate(&mapping.client, mapping.depot_pattern(), client_path)
    }
}

// ---------------------------------------------------------------------------
// Wildcards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Literal(&'a str),
    Ellipsis,
    Star,
}

fn tokenize(pattern: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = pattern;
    while !rest.is_empty() {
        let next_ellipsis = rest.find("...");
        let next_star = rest.find('*');
        let next = match (next_ellipsis, next_star) {
            (Some(e), Some(s)) => Some(e.min(s)),
            (e, s) => e.or(s),
        };
        match next {
            None => {
                tokens.push(Token::Literal(rest));
                break;
            }
            Some(pos) => {
                if pos > 0 {
                    tokens.push(Token::Literal(&rest[..pos]));
                }
                if rest[pos..].starts_with("...") {
                    tokens.push(Token::Ellipsis);
                    rest = &rest[pos + 3..];
                } else {
                    tokens.push(Token::Star);
                    rest = &rest[pos + 1..];
                }
            }
        }
    }
    tokens
}

fn capture_into<'p>(tokens: &[Token<'_>], path: &'p str, out: &mut Vec<&'p str>) -> bool {
    match tokens.split_first() {
        None => path.is_empty(),
        Some((Token::Literal(lit), rest)) => match path.strip_prefix(lit) {
            Some(tail) => capture_into(rest, tail, out),
            None => false,
        },
        Some((wild, rest)) => {
            let within_segment = matches!(wild, Token::Star);
            for end in (0..=path.len()).rev() {
                if !path.is_char_boundary(end) {
                    continue;
                }
                let (head, tail) = path.split_at(end);
                if within_segment && head.contains('/') {
                    continue;
                }
                out.push(head);
                if capture_into(rest, tail, out) {
                    return true;
                }
                out.pop();
            }
            false
        }
    }
}

/// Whether `path` matches the wildcard `pattern`.
pub fn matches(pattern: &str, path: &str) -> bool {
    let mut captures = Vec::new();
    capture_into(&tokenize(pattern), path, &mut captures)
}

/// Rewrite `path` matched by `from` into the shape of `to`, substituting
/// wildcards positionally.
pub fn translate(from: &str, to: &str, path: &str) -> Option<String> {
    let mut captures = Vec::new();
    if !capture_into(&tokenize(from), path, &mut captures) {
        return None;
    }
    let mut captures = captures.into_iter();
    let mut out = String::new();
    for token in tokenize(to) {
        match token {
            Token::Literal(lit) => out.push_str(lit),
            Token::Ellipsis | Token::Star => out.push_str(captures.next()?),
        }
    }
    Some(out)
}

/// Split a `//path/pattern@rev` argument into the pattern and its revision suffix.
pub fn split_revision(spec: &str) -> (&str, &str) {
    match spec.find(['@', '#']) {
        Some(pos) => spec.split_at(pos),
        None => (spec, ""),
    }
}
