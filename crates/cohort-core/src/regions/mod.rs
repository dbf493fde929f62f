//! Source files as named, line-bounded regions usable as lock targets.
//!
//! Parsers form a chain: each one that claims a file gets a turn, and a
//! structural failure (usually a file caught mid-edit) hands the file to the
//! next parser. [`HeuristicParser`] is always last and never fails.

mod brace;
mod heuristic;
mod python;

pub use brace::BraceParser;
pub use heuristic::HeuristicParser;
pub use python::PythonParser;

use crate::checksum;
use crate::locks::LineSpan;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegionKind {
    File,
    Class,
    Function,
    Method,
    LineRange,
}

impl RegionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionKind::File => "FILE",
            RegionKind::Class => "CLASS",
            RegionKind::Function => "FUNCTION",
            RegionKind::Method => "METHOD",
            RegionKind::LineRange => "LINE_RANGE",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeRegion {
    pub file_path: String,
    pub kind: RegionKind,
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl CodeRegion {
    pub fn new(file_path: &str, kind: RegionKind, name: &str, start_line: u32, end_line: u32) -> Self {
        let span = LineSpan::new(start_line, end_line);
        Self {
            file_path: file_path.to_string(),
            kind,
            name: name.to_string(),
            start_line: span.start,
            end_line: span.end,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn region_id(&self) -> String {
        crate::locks::resource_id(&self.file_path, Some(&self.name))
    }

    pub fn span(&self) -> LineSpan {
        LineSpan::new(self.start_line, self.end_line)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated string starting on line {line}")]
    UnterminatedString { line: u32 },
    #[error("unbalanced '{found}' on line {line}")]
    UnbalancedDelimiter { line: u32, found: char },
    #[error("unclosed '{open}' opened on line {line}")]
    UnclosedDelimiter { line: u32, open: char },
    #[error("inconsistent indentation on line {line}")]
    Indentation { line: u32 },
}

/// One strategy for turning source text into regions.
pub trait RegionParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, path: &str) -> bool;

    fn parse(&self, path: &str, source: &str) -> Result<Vec<CodeRegion>, ParseError>;
}

pub(crate) fn extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default()
}

pub(crate) fn line_count(source: &str) -> u32 {
    if source.is_empty() {
        return 1;
    }
    let lines = source.lines().count().max(1);
    u32::try_from(lines).unwrap_or(u32::MAX)
}

pub struct ParserChain {
    parsers: Vec<Box<dyn RegionParser>>,
}

impl Default for ParserChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(PythonParser),
            Box::new(BraceParser::default()),
            Box::new(HeuristicParser::default()),
        ])
    }
}

impl ParserChain {
    pub fn new(parsers: Vec<Box<dyn RegionParser>>) -> Self {
        Self { parsers }
    }

    /// Whole-file region first, then whatever the first successful parser found.
    pub fn parse(&self, path: &str, source: &str) -> Vec<CodeRegion> {
        let mut regions = vec![CodeRegion::new(
            path,
            RegionKind::File,
            path,
            1,
            line_count(source),
        )];
        for parser in self.parsers.iter().filter(|p| p.supports(path)) {
            match parser.parse(path, source) {
                Ok(found) => {
                    debug!(
                        event = "regions_parsed",
                        path = path,
                        parser = parser.name(),
                        count = found.len()
                    );
                    regions.extend(found);
                    break;
                }
                Err(err) => {
                    debug!(
                        event = "region_parser_fallback",
                        path = path,
                        parser = parser.name(),
                        error = %err
                    );
                }
            }
        }
        link_children(dedup_by_name(regions))
    }
}

fn dedup_by_name(regions: Vec<CodeRegion>) -> Vec<CodeRegion> {
    let mut seen = std::collections::HashSet::new();
    regions
        .into_iter()
        .filter(|region| seen.insert(region.name.clone()))
        .collect()
}

fn link_children(mut regions: Vec<CodeRegion>) -> Vec<CodeRegion> {
    let pairs: Vec<(String, String)> = regions
        .iter()
        .filter_map(|r| r.parent.clone().map(|parent| (parent, r.name.clone())))
        .collect();
    for (parent, child) in pairs {
        if let Some(owner) = regions.iter_mut().find(|r| r.name == parent) {
            if !owner.children.contains(&child) {
                owner.children.push(child);
            }
        }
    }
    regions
}

/// Parses `lines:A-B` (or `line:A-B`) into an inclusive span.
pub fn parse_line_range(identifier: &str) -> Option<LineSpan> {
    let raw = identifier.trim();
    let rest = raw
        .strip_prefix("lines:")
        .or_else(|| raw.strip_prefix("line:"))?;
    let (start, end) = rest.split_once('-')?;
    let start: u32 = start.trim().parse().ok()?;
    let end: u32 = end.trim().parse().ok()?;
    if start == 0 || end == 0 {
        return None;
    }
    Some(LineSpan::new(start, end))
}

/// Name under which a region identifier is locked; line ranges become `lines:A-B`.
pub fn canonical_region_name(identifier: &str) -> String {
    parse_line_range(identifier)
        .map(|span| format!("lines:{}-{}", span.start, span.end))
        .unwrap_or_else(|| identifier.trim().to_string())
}

/// Resolves a structural name or a `lines:A-B` literal among parsed regions.
pub fn find_region(regions: &[CodeRegion], path: &str, identifier: &str) -> Option<CodeRegion> {
    if let Some(span) = parse_line_range(identifier) {
        let name = format!("lines:{}-{}", span.start, span.end);
        return Some(CodeRegion::new(
            path,
            RegionKind::LineRange,
            &name,
            span.start,
            span.end,
        ));
    }
    regions
        .iter()
        .find(|region| region.name == identifier.trim())
        .cloned()
}

/// Regions containing `line`, outermost first.
pub fn regions_at_line(regions: &[CodeRegion], line: u32) -> Vec<CodeRegion> {
    let mut hits: Vec<CodeRegion> = regions
        .iter()
        .filter(|region| region.span().contains(line))
        .cloned()
        .collect();
    hits.sort_by_key(|region| (region.start_line, std::cmp::Reverse(region.end_line)));
    hits
}

struct CachedParse {
    checksum: String,
    regions: Arc<Vec<CodeRegion>>,
}

/// Per-path parse cache; an entry is reused only while the content checksum matches.
#[derive(Default)]
pub struct RegionIndex {
    chain: ParserChain,
    cache: HashMap<String, CachedParse>,
}

impl RegionIndex {
    pub fn new(chain: ParserChain) -> Self {
        Self {
            chain,
            cache: HashMap::new(),
        }
    }

    pub fn regions_for_source(&mut self, path: &str, source: &str) -> Arc<Vec<CodeRegion>> {
        let sum = checksum(source.as_bytes());
        if let Some(cached) = self.cache.get(path) {
            if cached.checksum == sum {
                return cached.regions.clone();
            }
        }
        let regions = Arc::new(self.chain.parse(path, source));
        self.cache.insert(
            path.to_string(),
            CachedParse {
                checksum: sum,
                regions: regions.clone(),
            },
        );
        regions
    }

    /// Reads `root/path` and returns its regions, keyed by the relative `path`.
    pub fn regions_for_file(&mut self, root: &Path, path: &str) -> io::Result<Arc<Vec<CodeRegion>>> {
        let bytes = std::fs::read(root.join(path))?;
        let source = String::from_utf8_lossy(&bytes);
        Ok(self.regions_for_source(path, &source))
    }

    pub fn find(&mut self, root: &Path, path: &str, identifier: &str) -> io::Result<Option<CodeRegion>> {
        if let Some(span) = parse_line_range(identifier) {
            let name = format!("lines:{}-{}", span.start, span.end);
            return Ok(Some(CodeRegion::new(
                path,
                RegionKind::LineRange,
                &name,
                span.start,
                span.end,
            )));
        }
        let regions = self.regions_for_file(root, path)?;
        Ok(find_region(&regions, path, identifier))
    }

    pub fn invalidate(&mut self, path: &str) {
        self.cache.remove(path);
    }

    pub fn cached_paths(&self) -> usize {
        self.cache.len()
    }
}
