//! Line-oriented source transformations for suites and implementations.
//!
//! Recognised directives, one per line:
//!
//! ```text
//! export      := "provide" ( SP "*" | "-types" SP "*" | SP "{" ... "end" | ... )
//! import      := ("include" | "import") SP locator [SP "as" SP NAME]
//! locator     := "file(" STRING ")"
//!              | "my-gdrive(" STRING ")"
//!              | "shared-gdrive(" STRING "," STRING ")"
//! ```
//!
//! `file` and `my-gdrive` locators name a single file and are the only ones
//! the import fixer rewrites; `shared-gdrive` locators name course-wide
//! libraries and are left in place.

use crate::store::{write_atomic, StoreError};
use crate::types::Role;
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

lazy_static! {
    static ref IMPORT_DIRECTIVE: Regex = Regex::new(
        r#"^(?P<indent>\s*)(?P<verb>include|import)\s+(?P<locator>file|my-gdrive)\(\s*"(?P<name>[^"]*)"\s*\)(?P<rest>.*)$"#
    )
    .unwrap();
    static ref SHARED_DRIVE_INCLUDE: Regex =
        Regex::new(r#"^\s*include\s+shared-gdrive\((?P<args>[^)]*)\)\s*$"#).unwrap();
    static ref IMAGE_ANNOTATION: Regex = Regex::new(r"->\s*Image\s*:").unwrap();
}

/// Header making a module export every value and type
pub const EXPORT_ALL: &str = "provide *\nprovide-types *\n";

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Write(#[from] StoreError),
    #[error("imports cannot be fixed for role '{0}'")]
    UnsupportedRole(Role),
}

/// Include directive for a file by path
pub fn include_directive(path: &str) -> String {
    format!("include file(\"{}\")", path)
}

fn is_export_declaration(trimmed: &str) -> bool {
    trimmed == "provide"
        || trimmed.starts_with("provide ")
        || trimmed.starts_with("provide-types")
        || trimmed.starts_with("provide:")
        || trimmed.starts_with("provide{")
}

/// Opens a multi-line `provide { ... } end` / `provide: ... end` block
fn opens_export_block(trimmed: &str) -> bool {
    let body = trimmed.trim_start_matches("provide").trim_start();
    (body.starts_with('{') || body.starts_with(':')) && !ends_block(trimmed)
}

fn ends_block(line: &str) -> bool {
    line.split_whitespace().any(|word| word == "end")
}

fn referenced_file(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Point a suite at exactly one implementation
///
/// The result exports everything, includes `include_path`, and no longer
/// carries the suite's own export declarations or imports of `excluded`
/// helper files. Applying it twice with the same arguments is a no-op.
pub fn retarget_suite(source: &str, include_path: &str, excluded: &[String]) -> String {
    let include = include_directive(include_path);
    let mut out = String::with_capacity(source.len() + EXPORT_ALL.len() + include.len() + 1);
    out.push_str(EXPORT_ALL);
    out.push_str(&include);
    out.push('\n');

    let mut in_export_block = false;
    for line in source.lines() {
        let trimmed = line.trim();
        if in_export_block {
            in_export_block = !ends_block(trimmed);
            continue;
        }
        if is_export_declaration(trimmed) {
            in_export_block = opens_export_block(trimmed);
            continue;
        }
        if trimmed == include {
            continue;
        }
        if let Some(caps) = IMPORT_DIRECTIVE.captures(line) {
            let file = referenced_file(&caps["name"]);
            if excluded.iter().any(|e| e == file) {
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Starter-file names that identify the code and common import targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stencil {
    pub code: Option<String>,
    pub common: Option<String>,
}

impl Stencil {
    pub fn new(code: Option<String>, common: Option<String>) -> Self {
        Self { code, common }
    }

    /// Read the stencil directory; a missing directory yields an empty stencil
    pub fn from_dir(dir: &Path, code_marker: &str, common_marker: &str) -> Result<Self, RewriteError> {
        let mut stencil = Stencil::default();
        if !dir.is_dir() {
            return Ok(stencil);
        }

        let entries = fs::read_dir(dir).map_err(|e| RewriteError::Read {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        for name in names {
            if name.contains(common_marker) {
                stencil.common.get_or_insert(name);
            } else if name.contains(code_marker) {
                stencil.code.get_or_insert(name);
            }
        }
        Ok(stencil)
    }

    fn name_for(&self, role: Role) -> Option<&str> {
        match role {
            Role::Code => self.code.as_deref(),
            Role::Common => self.common.as_deref(),
            Role::Tests => None,
        }
    }
}

/// Rewrites import directives in one file so it can be relocated
///
/// Calls to [`ImportResolver::fix_import`] only record intent; nothing
/// touches the file until [`ImportResolver::finalize`].
pub trait ImportResolver {
    fn fix_import(
        &mut self,
        role: Role,
        search_dir: &Path,
        explicit_name: Option<&str>,
    ) -> Result<(), RewriteError>;

    /// Commit every recorded rewrite in one pass; true when the file changed
    fn finalize(&mut self) -> Result<bool, RewriteError>;
}

#[derive(Debug)]
struct PendingImport {
    names: Vec<String>,
    replacement: PathBuf,
}

/// [`ImportResolver`] keyed on stencil file names
#[derive(Debug)]
pub struct ImportFixer<'a> {
    target: PathBuf,
    stencil: &'a Stencil,
    pending: Vec<PendingImport>,
}

impl<'a> ImportFixer<'a> {
    pub fn new(target: impl Into<PathBuf>, stencil: &'a Stencil) -> Self {
        Self {
            target: target.into(),
            stencil,
            pending: Vec::new(),
        }
    }

    fn rewrite_line(&self, line: &str) -> Option<String> {
        let caps = IMPORT_DIRECTIVE.captures(line)?;
        let file = referenced_file(&caps["name"]);
        let pending = self
            .pending
            .iter()
            .find(|p| p.names.iter().any(|n| n == file))?;
        Some(format!(
            "{}{} file(\"{}\"){}",
            &caps["indent"],
            &caps["verb"],
            pending.replacement.display(),
            &caps["rest"]
        ))
    }
}

impl ImportResolver for ImportFixer<'_> {
    fn fix_import(
        &mut self,
        role: Role,
        search_dir: &Path,
        explicit_name: Option<&str>,
    ) -> Result<(), RewriteError> {
        if role == Role::Tests {
            return Err(RewriteError::UnsupportedRole(role));
        }

        let stencil_name = self.stencil.name_for(role);
        let mut names: Vec<String> = Vec::new();
        names.extend(stencil_name.map(str::to_string));
        names.extend(explicit_name.map(str::to_string));
        names.dedup();

        let Some(file_name) = explicit_name.or(stencil_name) else {
            return Ok(());
        };
        self.pending.push(PendingImport {
            names,
            replacement: search_dir.join(file_name),
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<bool, RewriteError> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let original = fs::read_to_string(&self.target).map_err(|e| RewriteError::Read {
            path: self.target.clone(),
            source: e,
        })?;

        let mut changed = false;
        let mut rewritten = String::with_capacity(original.len());
        for line in original.split_inclusive('\n') {
            let (body, newline) = match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            };
            match self.rewrite_line(body) {
                Some(new_line) if new_line != body => {
                    changed = true;
                    rewritten.push_str(&new_line);
                }
                _ => rewritten.push_str(body),
            }
            rewritten.push_str(newline);
        }

        self.pending.clear();
        if changed {
            write_atomic(&self.target, rewritten.as_bytes())?;
        }
        Ok(changed)
    }
}

/// Remove comments and normalise a student source file
///
/// Nested `#| ... |#` blocks and `#` line comments outside string literals
/// are dropped (newlines are kept so locations stay stable),
/// `include image` becomes `include tables`, `-> Image` annotations are
/// removed, repeated `shared-gdrive` includes collapse to their last
/// occurrence, and export-all headers are added when missing.
pub fn strip_comments(source: &str) -> String {
    let uncommented = remove_comment_text(source);

    let mut lines: Vec<String> = uncommented
        .lines()
        .map(|line| {
            let line = if line.trim() == "include image" {
                line.replacen("include image", "include tables", 1)
            } else {
                line.to_string()
            };
            IMAGE_ANNOTATION.replace_all(&line, ":").into_owned()
        })
        .collect();
    collapse_shared_includes(&mut lines);

    let mut body = lines.join("\n");
    body.push('\n');

    let mut out = String::with_capacity(body.len() + EXPORT_ALL.len());
    if !body.contains("provide *") {
        out.push_str("provide *\n");
    }
    if !body.contains("provide-types *") {
        out.push_str("provide-types *\n");
    }
    out.push_str(&body);
    out
}

fn collapse_shared_includes(lines: &mut [String]) {
    let keys: Vec<Option<String>> = lines
        .iter()
        .map(|line| {
            SHARED_DRIVE_INCLUDE
                .captures(line)
                .map(|caps| caps["args"].split_whitespace().collect::<String>())
        })
        .collect();

    for (idx, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            let repeated_later = keys[idx + 1..].iter().any(|k| k.as_ref() == Some(key));
            if repeated_later {
                lines[idx].clear();
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Literal {
    Quote(char),
    Backticks,
}

fn remove_comment_text(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut depth = 0usize;
    let mut literal: Option<Literal> = None;
    let mut i = 0;

    let triple_backtick = |i: usize| chars.get(i..i + 3) == Some(&['`', '`', '`'][..]);

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if depth > 0 {
            if c == '#' && next == Some('|') {
                depth += 1;
                i += 2;
            } else if c == '|' && next == Some('#') {
                depth -= 1;
                i += 2;
            } else {
                if c == '\n' {
                    out.push('\n');
                }
                i += 1;
            }
            continue;
        }

        match literal {
            Some(Literal::Quote(q)) => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = next {
                        out.push(escaped);
                        i += 1;
                    }
                } else if c == q || c == '\n' {
                    literal = None;
                }
                i += 1;
            }
            Some(Literal::Backticks) => {
                if triple_backtick(i) {
                    out.push_str("```");
                    literal = None;
                    i += 3;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            None => {
                if triple_backtick(i) {
                    out.push_str("```");
                    literal = Some(Literal::Backticks);
                    i += 3;
                } else if c == '"' || c == '\'' {
                    out.push(c);
                    literal = Some(Literal::Quote(c));
                    i += 1;
                } else if c == '#' && next == Some('|') {
                    depth = 1;
                    i += 2;
                } else if c == '#' {
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                } else {
                    out.push(c);
                    i += 1;
                }
            }
        }
    }
    out
}

/// Path to `to` relative to the directory `from_dir`
///
/// Both paths are expected to be absolute (or relative to the same base).
pub fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from_dir.components().collect();
    let target: Vec<Component> = to.components().collect();
    let shared = from
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in shared..from.len() {
        rel.push("..");
    }
    for component in &target[shared..] {
        rel.push(component.as_os_str());
    }
    rel
}
