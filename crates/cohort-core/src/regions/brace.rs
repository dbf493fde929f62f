use super::{extension, CodeRegion, ParseError, RegionKind, RegionParser};
use regex::Regex;
use std::collections::HashMap;

const METHOD_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "function", "with", "else", "do", "new",
    "typeof", "await", "super",
];

/// Structural parser for JavaScript and TypeScript.
///
/// Strings, template literals, comments and regex literals are blanked out
/// before braces are matched, so a brace inside a literal never shifts a
/// block boundary. Any imbalance is reported as an error and the chain falls
/// through to the heuristic parser.
pub struct BraceParser {
    classes: Option<Regex>,
    methods: Option<Regex>,
    functions: Option<Regex>,
    bindings: Option<Regex>,
}

impl Default for BraceParser {
    fn default() -> Self {
        Self {
            classes: Regex::new(
                r"(?m)^[ \t]*(?:export[ \t]+)?(?:default[ \t]+)?(?:abstract[ \t]+)?class[ \t]+([A-Za-z_$][\w$]*)",
            )
            .ok(),
            methods: Regex::new(
                r"(?m)^[ \t]*(?:(?:public|private|protected|static|async|override|readonly|get|set)[ \t]+)*\*?[ \t]*(#?[A-Za-z_$][\w$]*)[ \t]*(?:<[^>{}\n]*>)?[ \t]*\([^)]*\)[ \t]*(?::[^{;]+)?\{",
            )
            .ok(),
            functions: Regex::new(
                r"(?m)^[ \t]*(?:export[ \t]+)?(?:default[ \t]+)?(?:async[ \t]+)?function[ \t]*\*?[ \t]*([A-Za-z_$][\w$]*)",
            )
            .ok(),
            bindings: Regex::new(
                r"(?m)^[ \t]*(?:export[ \t]+)?(?:const|let|var)[ \t]+([A-Za-z_$][\w$]*)[ \t]*(?::[^=\n]+)?=[ \t]*(?:async[ \t]+)?(?:function\b|\([^)]*\)[ \t]*(?::[^=\n]+)?=>|[A-Za-z_$][\w$]*[ \t]*=>)",
            )
            .ok(),
        }
    }
}

impl RegionParser for BraceParser {
    fn name(&self) -> &'static str {
        "brace"
    }

    fn supports(&self, path: &str) -> bool {
        matches!(
            extension(path).as_str(),
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" | "mts" | "cts"
        )
    }

    fn parse(&self, path: &str, source: &str) -> Result<Vec<CodeRegion>, ParseError> {
        let masked = mask_literals(source)?;
        let layout = BraceLayout::build(&masked)?;
        let mut regions = Vec::new();
        let mut class_bodies: Vec<(usize, usize, String)> = Vec::new();

        if let Some(classes) = &self.classes {
            for caps in classes.captures_iter(&masked) {
                let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                let Some(open) = masked[whole.end()..].find('{').map(|i| i + whole.end()) else {
                    continue;
                };
                let Some(close) = layout.matching(open) else {
                    continue;
                };
                let start = whole.start() + leading_ws(whole.as_str());
                let outer = class_bodies
                    .iter()
                    .rev()
                    .find(|(o, c, _)| *o < start && start < *c)
                    .map(|(_, _, outer)| outer.clone());
                let qualified = match &outer {
                    Some(outer) => format!("{outer}.{}", name.as_str()),
                    None => name.as_str().to_string(),
                };
                let region = CodeRegion::new(
                    path,
                    RegionKind::Class,
                    &qualified,
                    layout.line_of(start),
                    layout.line_of(close),
                );
                regions.push(match &outer {
                    Some(outer) => region.with_parent(outer),
                    None => region,
                });
                class_bodies.push((open, close, qualified));
            }
        }

        if let Some(methods) = &self.methods {
            for caps in methods.captures_iter(&masked) {
                let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                if METHOD_KEYWORDS.contains(&name.as_str()) {
                    continue;
                }
                let open = whole.end() - 1;
                let Some((_, _, owner)) = class_bodies.iter().find(|(o, c, _)| {
                    *o < open && open < *c && layout.depth_at(open) == layout.depth_at(*o) + 1
                }) else {
                    continue;
                };
                let Some(close) = layout.matching(open) else {
                    continue;
                };
                let qualified = format!("{owner}.{}", name.as_str());
                regions.push(
                    CodeRegion::new(
                        path,
                        RegionKind::Method,
                        &qualified,
                        layout.line_of(whole.start() + leading_ws(whole.as_str())),
                        layout.line_of(close),
                    )
                    .with_parent(owner),
                );
            }
        }

        for (pattern, arrow) in [(&self.functions, false), (&self.bindings, true)] {
            let Some(pattern) = pattern else { continue };
            for caps in pattern.captures_iter(&masked) {
                let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                let start = whole.start() + leading_ws(whole.as_str());
                if layout.depth_at(start) != 0 {
                    continue;
                }
                let end = if arrow && whole.as_str().trim_end().ends_with("=>") {
                    arrow_body_end(&masked, &layout, whole.end())
                } else {
                    masked[whole.end()..]
                        .find('{')
                        .map(|i| i + whole.end())
                        .and_then(|open| layout.matching(open))
                        .unwrap_or(masked.len().saturating_sub(1))
                };
                regions.push(CodeRegion::new(
                    path,
                    RegionKind::Function,
                    name.as_str(),
                    layout.line_of(start),
                    layout.line_of(end),
                ));
            }
        }

        regions.sort_by_key(|r| (r.start_line, std::cmp::Reverse(r.end_line)));
        Ok(regions)
    }
}

fn leading_ws(text: &str) -> usize {
    text.len() - text.trim_start().len()
}

/// Block body when the arrow is followed by `{`, otherwise the expression up
/// to the first `;` (or line break) outside any bracket.
fn arrow_body_end(masked: &str, layout: &BraceLayout, from: usize) -> usize {
    let rest = &masked[from..];
    let skipped = leading_ws(rest);
    if rest[skipped..].starts_with('{') {
        if let Some(close) = layout.matching(from + skipped) {
            return close;
        }
    }
    let mut depth = 0i32;
    let mut seen_content = false;
    for (offset, ch) in rest.char_indices() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return from + offset;
                }
            }
            ';' if depth == 0 => return from + offset,
            '\n' if depth == 0 && seen_content => return from + offset.saturating_sub(1),
            c if !c.is_whitespace() => seen_content = true,
            _ => {}
        }
    }
    masked.len().saturating_sub(1)
}

/// Byte offsets of brace pairs, brace depth and line starts for masked text.
struct BraceLayout {
    newlines: Vec<usize>,
    pairs: HashMap<usize, usize>,
    opens: Vec<usize>,
    closes: Vec<usize>,
}

impl BraceLayout {
    fn build(masked: &str) -> Result<Self, ParseError> {
        let mut newlines = Vec::new();
        let mut stack: Vec<(char, usize, u32)> = Vec::new();
        let mut pairs = HashMap::new();
        let mut opens = Vec::new();
        let mut closes = Vec::new();
        let mut line = 1u32;

        for (offset, ch) in masked.char_indices() {
            match ch {
                '\n' => {
                    newlines.push(offset);
                    line += 1;
                }
                '(' | '[' | '{' => {
                    stack.push((ch, offset, line));
                    if ch == '{' {
                        opens.push(offset);
                    }
                }
                ')' | ']' | '}' => {
                    let expected = match ch {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, at, _)) if open == expected => {
                            if ch == '}' {
                                pairs.insert(at, offset);
                                closes.push(offset);
                            }
                        }
                        _ => return Err(ParseError::UnbalancedDelimiter { line, found: ch }),
                    }
                }
                _ => {}
            }
        }
        if let Some((open, _, line)) = stack.pop() {
            return Err(ParseError::UnclosedDelimiter { line, open });
        }
        Ok(Self {
            newlines,
            pairs,
            opens,
            closes,
        })
    }

    fn line_of(&self, offset: usize) -> u32 {
        let line = self.newlines.partition_point(|nl| *nl < offset) + 1;
        u32::try_from(line).unwrap_or(u32::MAX)
    }

    fn matching(&self, open: usize) -> Option<usize> {
        self.pairs.get(&open).copied()
    }

    /// Number of `{` still open just before `offset`.
    fn depth_at(&self, offset: usize) -> usize {
        let opened = self.opens.partition_point(|o| *o < offset);
        let closed = self.closes.partition_point(|c| *c < offset);
        opened.saturating_sub(closed)
    }
}

fn regex_allowed_after(prev: Option<char>, word: &str) -> bool {
    match prev {
        None => true,
        Some(c) if "(,=:[!&|?{};+-*%<>~^".contains(c) => true,
        Some(_) => matches!(word, "return" | "typeof" | "case" | "in" | "of" | "yield"),
    }
}

/// Replaces literal and comment contents with spaces, keeping line breaks.
fn mask_literals(source: &str) -> Result<String, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut line = 1u32;
    let mut prev: Option<char> = None;
    let mut word = String::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        match ch {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(' ');
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                let start = line;
                out.push_str("  ");
                i += 2;
                loop {
                    match chars.get(i).copied() {
                        None => return Err(ParseError::UnterminatedString { line: start }),
                        Some('*') if chars.get(i + 1).copied() == Some('/') => {
                            out.push_str("  ");
                            i += 2;
                            break;
                        }
                        Some(c) => {
                            line += blank(c, &mut out);
                            i += 1;
                        }
                    }
                }
                continue;
            }
            '/' if regex_allowed_after(prev, &word) => {
                if let Some(len) = regex_literal_len(&chars[i..]) {
                    out.extend(std::iter::repeat(' ').take(len));
                    i += len;
                    prev = Some('/');
                    word.clear();
                    continue;
                }
            }
            '\'' | '"' | '`' => {
                let start = line;
                out.push(' ');
                i += 1;
                loop {
                    match chars.get(i).copied() {
                        None => return Err(ParseError::UnterminatedString { line: start }),
                        Some('\n') if ch != '`' => {
                            return Err(ParseError::UnterminatedString { line: start })
                        }
                        Some('\\') => {
                            out.push(' ');
                            i += 1;
                            if let Some(escaped) = chars.get(i).copied() {
                                line += blank(escaped, &mut out);
                                i += 1;
                            }
                        }
                        Some(c) if c == ch => {
                            out.push(' ');
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            line += blank(c, &mut out);
                            i += 1;
                        }
                    }
                }
                prev = Some(ch);
                word.clear();
                continue;
            }
            _ => {}
        }

        if ch == '\n' {
            line += 1;
        }
        if is_ident(ch) {
            if !(i > 0 && is_ident(chars[i - 1])) {
                word.clear();
            }
            word.push(ch);
        }
        if !ch.is_whitespace() {
            prev = Some(ch);
        }
        out.push(ch);
        i += 1;
    }
    Ok(out)
}

fn is_ident(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

/// Pushes a blank for `c`, keeping line breaks; returns the lines consumed.
fn blank(c: char, out: &mut String) -> u32 {
    if c == '\n' {
        out.push('\n');
        1
    } else {
        out.push(' ');
        0
    }
}

/// Length of a regex literal (including flags) starting at `/`, if the line
/// contains its closing delimiter.
fn regex_literal_len(chars: &[char]) -> Option<usize> {
    let mut i = 1;
    let mut in_class = false;
    while let Some(&c) = chars.get(i) {
        match c {
            '\n' => return None,
            '\\' => i += 1,
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => {
                i += 1;
                while chars.get(i).is_some_and(|f| f.is_ascii_alphabetic()) {
                    i += 1;
                }
                return Some(i);
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(regions: &[CodeRegion]) -> Vec<(String, RegionKind, u32, u32)> {
        regions
            .iter()
            .map(|r| (r.name.clone(), r.kind, r.start_line, r.end_line))
            .collect()
    }

    #[test]
    fn classes_methods_functions_and_arrows() {
        let source = r#"import { x } from "./x";

export class Store {
  constructor(items) {
    this.items = items;
  }

  async load(id: string): Promise<void> {
    if (id) {
      return fetch(`/api/${id}`);
    }
  }
}

function helper(a) {
  const label = "}{";
  return a + label;
}

export const double = (n) => n * 2;

const block = async (n) => {
  return n;
};
"#;
        let regions = BraceParser::default().parse("store.ts", source).expect("parse");
        assert_eq!(
            spans(&regions),
            vec![
                ("Store".to_string(), RegionKind::Class, 3, 13),
                ("Store.constructor".to_string(), RegionKind::Method, 4, 6),
                ("Store.load".to_string(), RegionKind::Method, 8, 12),
                ("helper".to_string(), RegionKind::Function, 15, 18),
                ("double".to_string(), RegionKind::Function, 20, 20),
                ("block".to_string(), RegionKind::Function, 22, 24),
            ]
        );
        assert_eq!(regions[1].parent.as_deref(), Some("Store"));
    }

    #[test]
    fn braces_inside_comments_and_regexes_are_ignored() {
        let source = "// }\nfunction a() {\n  /* { */\n  const re = /[{]/g;\n  return re;\n}\n";
        let regions = BraceParser::default().parse("a.js", source).expect("parse");
        assert_eq!(spans(&regions), vec![("a".to_string(), RegionKind::Function, 2, 6)]);
    }

    #[test]
    fn imbalance_is_an_error() {
        assert!(matches!(
            BraceParser::default().parse("a.js", "function a() {\n  return 1;\n"),
            Err(ParseError::UnclosedDelimiter { open: '{', line: 1 })
        ));
        assert!(matches!(
            BraceParser::default().parse("a.js", "function a() {\n}\n}\n"),
            Err(ParseError::UnbalancedDelimiter { found: '}', line: 3 })
        ));
        assert!(matches!(
            BraceParser::default().parse("a.js", "const s = 'open;\n"),
            Err(ParseError::UnterminatedString { line: 1 })
        ));
    }

    #[test]
    fn only_script_extensions_are_claimed() {
        let parser = BraceParser::default();
        assert!(parser.supports("src/App.TSX"));
        assert!(parser.supports("lib/index.mjs"));
        assert!(!parser.supports("main.py"));
        assert!(!parser.supports("Makefile"));
    }
}
