use super::{extension, line_count, CodeRegion, ParseError, RegionKind, RegionParser};
use regex::Regex;

/// Last-resort, line-oriented parser.
///
/// Indentation-structured files are scanned with the class/def patterns and
/// an indentation walk; everything else is scanned for class and function
/// headers with naive brace counting. It accepts every path and never fails,
/// so a file mid-edit still yields approximate regions.
pub struct HeuristicParser {
    indent_class: Option<Regex>,
    indent_def: Option<Regex>,
    brace_class: Option<Regex>,
    brace_fn: Option<Regex>,
    brace_method: Option<Regex>,
}

impl Default for HeuristicParser {
    fn default() -> Self {
        Self {
            indent_class: Regex::new(r"^(\s*)class\s+(\w+)").ok(),
            indent_def: Regex::new(r"^(\s*)(?:async\s+)?def\s+(\w+)").ok(),
            brace_class: Regex::new(
                r"^\s*(?:export\s+)?(?:default\s+)?(?:public\s+|private\s+)?(?:abstract\s+)?(?:class|interface)\s+(\w+)",
            )
            .ok(),
            brace_fn: Regex::new(
                r"^\s*(?:export\s+)?(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:function|fn|func)\s+(\w+)|^\s*(?:export\s+)?(?:const|let|var)\s+(\w+)\s*=\s*(?:async\s+)?(?:function|\()",
            )
            .ok(),
            brace_method: Regex::new(r"^\s+(?:async\s+)?(\w+)\s*\([^)]*\)\s*\{").ok(),
        }
    }
}

impl RegionParser for HeuristicParser {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn supports(&self, _path: &str) -> bool {
        true
    }

    fn parse(&self, path: &str, source: &str) -> Result<Vec<CodeRegion>, ParseError> {
        let lines: Vec<&str> = source.lines().collect();
        let indented = matches!(extension(path).as_str(), "py" | "pyi" | "pyw")
            || !source.contains('{');
        if indented {
            Ok(self.scan_indented(path, &lines))
        } else {
            Ok(self.scan_braced(path, source, &lines))
        }
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn significant(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

fn as_line(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

/// Last significant line indented deeper than `base`, trailing blanks excluded.
fn indented_block_end(lines: &[&str], start: usize, base: usize) -> usize {
    let mut end = start;
    for (idx, line) in lines.iter().enumerate().skip(start + 1) {
        if !significant(line) {
            continue;
        }
        if indent_of(line) <= base {
            break;
        }
        end = idx;
    }
    end
}

/// Line of the brace closing the first `{` at or after `from`; the last line
/// when the braces never balance, the `;` line when a declaration has no body.
fn braced_block_end(lines: &[&str], from: usize) -> usize {
    let mut depth = 0usize;
    let mut started = false;
    for (idx, line) in lines.iter().enumerate().skip(from) {
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    started = true;
                }
                '}' if started => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return idx;
                    }
                }
                ';' if !started => return idx,
                _ => {}
            }
        }
    }
    lines.len().saturating_sub(1)
}

impl HeuristicParser {
    fn scan_indented(&self, path: &str, lines: &[&str]) -> Vec<CodeRegion> {
        let (Some(class_re), Some(def_re)) = (&self.indent_class, &self.indent_def) else {
            return Vec::new();
        };
        let mut regions = Vec::new();
        // (indent, qualified class name or None for a function scope)
        let mut scopes: Vec<(usize, Option<String>)> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            let (is_class, indent, name) = if let Some(caps) = class_re.captures(line) {
                let indent = caps.get(1).map_or(0, |m| m.as_str().len());
                (true, indent, caps.get(2).map_or("", |m| m.as_str()))
            } else if let Some(caps) = def_re.captures(line) {
                let indent = caps.get(1).map_or(0, |m| m.as_str().len());
                (false, indent, caps.get(2).map_or("", |m| m.as_str()))
            } else {
                continue;
            };
            while scopes.last().is_some_and(|(open, _)| *open >= indent) {
                scopes.pop();
            }
            let start = as_line(idx);
            let end = as_line(indented_block_end(lines, idx, indent));
            let scope = match (is_class, scopes.last().map(|(_, s)| s.clone())) {
                (_, Some(None)) => None,
                (true, Some(Some(outer))) => {
                    let qualified = format!("{outer}.{name}");
                    regions.push(
                        CodeRegion::new(path, RegionKind::Class, &qualified, start, end)
                            .with_parent(&outer),
                    );
                    Some(qualified)
                }
                (true, None) => {
                    regions.push(CodeRegion::new(path, RegionKind::Class, name, start, end));
                    Some(name.to_string())
                }
                (false, Some(Some(owner))) => {
                    let qualified = format!("{owner}.{name}");
                    regions.push(
                        CodeRegion::new(path, RegionKind::Method, &qualified, start, end)
                            .with_parent(&owner),
                    );
                    None
                }
                (false, None) => {
                    regions.push(CodeRegion::new(path, RegionKind::Function, name, start, end));
                    None
                }
            };
            scopes.push((indent, scope));
        }
        regions
    }

    fn scan_braced(&self, path: &str, source: &str, lines: &[&str]) -> Vec<CodeRegion> {
        let mut regions = Vec::new();
        let mut classes: Vec<(usize, usize, String)> = Vec::new();

        if let Some(class_re) = &self.brace_class {
            for (idx, line) in lines.iter().enumerate() {
                if let Some(name) = class_re.captures(line).and_then(|c| c.get(1)) {
                    let end = braced_block_end(lines, idx);
                    regions.push(CodeRegion::new(
                        path,
                        RegionKind::Class,
                        name.as_str(),
                        as_line(idx),
                        as_line(end),
                    ));
                    classes.push((idx, end, name.as_str().to_string()));
                }
            }
        }

        let owner_of = |idx: usize| {
            classes
                .iter()
                .rev()
                .find(|(start, end, _)| *start < idx && idx < *end)
                .map(|(_, _, name)| name.clone())
        };

        for (idx, line) in lines.iter().enumerate() {
            let function = self.brace_fn.as_ref().and_then(|re| {
                re.captures(line)
                    .and_then(|c| c.get(1).or_else(|| c.get(2)))
                    .map(|m| m.as_str().to_string())
            });
            let method = || {
                self.brace_method.as_ref().and_then(|re| {
                    re.captures(line)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string())
                        .filter(|name| !matches!(name.as_str(), "if" | "for" | "while" | "switch" | "catch"))
                })
            };
            let owner = owner_of(idx);
            let name = match (function, &owner) {
                (Some(name), _) => name,
                (None, Some(_)) => match method() {
                    Some(name) => name,
                    None => continue,
                },
                (None, None) => continue,
            };
            let end = as_line(braced_block_end(lines, idx));
            let start = as_line(idx);
            regions.push(match owner {
                Some(owner) => CodeRegion::new(
                    path,
                    RegionKind::Method,
                    &format!("{owner}.{name}"),
                    start,
                    end,
                )
                .with_parent(&owner),
                None => CodeRegion::new(path, RegionKind::Function, &name, start, end),
            });
        }

        let last = line_count(source);
        for region in &mut regions {
            region.end_line = region.end_line.min(last);
        }
        regions.sort_by_key(|r| (r.start_line, std::cmp::Reverse(r.end_line)));
        regions
    }
}
