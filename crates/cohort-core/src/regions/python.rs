use super::{extension, CodeRegion, ParseError, RegionKind, RegionParser};

const TAB_WIDTH: usize = 8;

/// Structural parser for Python: tracks strings, comments, bracket
/// continuation and the indentation stack, so block ends are exact.
pub struct PythonParser;

impl RegionParser for PythonParser {
    fn name(&self) -> &'static str {
        "python"
    }

    fn supports(&self, path: &str) -> bool {
        matches!(extension(path).as_str(), "py" | "pyi" | "pyw")
    }

    fn parse(&self, path: &str, source: &str) -> Result<Vec<CodeRegion>, ParseError> {
        let lines = logical_lines(source)?;
        Ok(collect_regions(path, &lines))
    }
}

#[derive(Debug, Clone)]
struct LogicalLine {
    start: u32,
    end: u32,
    indent: usize,
    text: String,
}

#[derive(Clone, Copy)]
enum Quote {
    Single(char),
    Triple(char),
}

fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for ch in line.chars() {
        match ch {
            ' ' => width += 1,
            '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
            '\x0c' => width = 0,
            _ => break,
        }
    }
    width
}

/// Joins physical lines into logical statements and validates indentation.
fn logical_lines(source: &str) -> Result<Vec<LogicalLine>, ParseError> {
    let mut out: Vec<LogicalLine> = Vec::new();
    let mut brackets: Vec<(char, u32)> = Vec::new();
    let mut quote: Option<(Quote, u32)> = None;
    let mut continued = false;
    let mut current: Option<LogicalLine> = None;
    let mut last_significant = ' ';
    let mut indents: Vec<usize> = vec![0];
    let mut expect_indent = false;

    for (idx, raw) in source.lines().enumerate() {
        let line_no = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        let starts_logical = quote.is_none() && brackets.is_empty() && !continued;

        if starts_logical {
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indent = indent_width(raw);
            let top = indents.last().copied().unwrap_or(0);
            if indent > top {
                if !expect_indent {
                    return Err(ParseError::Indentation { line: line_no });
                }
                indents.push(indent);
            } else if indent < top {
                while indents.last().copied().unwrap_or(0) > indent {
                    indents.pop();
                }
                if indents.last().copied().unwrap_or(0) != indent {
                    return Err(ParseError::Indentation { line: line_no });
                }
            }
            if let Some(done) = current.take() {
                out.push(done);
            }
            current = Some(LogicalLine {
                start: line_no,
                end: line_no,
                indent,
                text: trimmed.to_string(),
            });
            last_significant = ' ';
        } else if let Some(line) = current.as_mut() {
            line.end = line_no;
            line.text.push('\n');
            line.text.push_str(raw);
        }

        continued = false;
        let mut chars = raw.chars().peekable();
        while let Some(ch) = chars.next() {
            match quote {
                Some((Quote::Single(q), _)) => {
                    if ch == '\\' {
                        chars.next();
                    } else if ch == q {
                        quote = None;
                    }
                }
                Some((Quote::Triple(q), _)) => {
                    if ch == '\\' {
                        chars.next();
                    } else if ch == q && chars.peek() == Some(&q) {
                        chars.next();
                        if chars.peek() == Some(&q) {
                            chars.next();
                            quote = None;
                        }
                    }
                }
                None => match ch {
                    '#' => break,
                    '\'' | '"' => {
                        if chars.peek() == Some(&ch) {
                            chars.next();
                            if chars.peek() == Some(&ch) {
                                chars.next();
                                quote = Some((Quote::Triple(ch), line_no));
                            }
                        } else {
                            quote = Some((Quote::Single(ch), line_no));
                        }
                        last_significant = ch;
                    }
                    '(' | '[' | '{' => {
                        brackets.push((ch, line_no));
                        last_significant = ch;
                    }
                    ')' | ']' | '}' => {
                        let expected = match ch {
                            ')' => '(',
                            ']' => '[',
                            _ => '{',
                        };
                        match brackets.pop() {
                            Some((open, _)) if open == expected => {}
                            _ => {
                                return Err(ParseError::UnbalancedDelimiter {
                                    line: line_no,
                                    found: ch,
                                })
                            }
                        }
                        last_significant = ch;
                    }
                    '\\' if chars.peek().is_none() => continued = true,
                    c if !c.is_whitespace() => last_significant = c,
                    _ => {}
                },
            }
        }
        if let Some((Quote::Single(_), start)) = quote {
            if !raw.ends_with('\\') {
                return Err(ParseError::UnterminatedString { line: start });
            }
        }
        if quote.is_none() && brackets.is_empty() && !continued {
            expect_indent = last_significant == ':';
        }
    }

    if let Some((_, start)) = quote {
        return Err(ParseError::UnterminatedString { line: start });
    }
    if let Some((open, line)) = brackets.pop() {
        return Err(ParseError::UnclosedDelimiter { line, open });
    }
    if let Some(done) = current.take() {
        out.push(done);
    }
    Ok(out)
}

enum Scope {
    Class(String),
    Function,
}

fn definition(text: &str) -> Option<(bool, String)> {
    let rest = text.strip_prefix("async ").map(str::trim_start).unwrap_or(text);
    let (is_class, rest) = if let Some(rest) = rest.strip_prefix("class ") {
        (true, rest)
    } else if let Some(rest) = rest.strip_prefix("def ") {
        (false, rest)
    } else {
        return None;
    };
    if is_class && text.starts_with("async ") {
        return None;
    }
    let name: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() {
        None
    } else {
        Some((is_class, name))
    }
}

fn collect_regions(path: &str, lines: &[LogicalLine]) -> Vec<CodeRegion> {
    let mut regions = Vec::new();
    let mut scopes: Vec<(usize, Scope)> = Vec::new();

    for (pos, line) in lines.iter().enumerate() {
        let Some((is_class, name)) = definition(&line.text) else {
            continue;
        };
        while scopes.last().is_some_and(|(indent, _)| *indent >= line.indent) {
            scopes.pop();
        }

        let start = decorated_start(lines, pos);
        let end = block_end(lines, pos);
        let parent = scopes.last().map(|(_, scope)| match scope {
            Scope::Class(qualified) => Some(qualified.clone()),
            Scope::Function => None,
        });

        let scope = match (is_class, parent) {
            (true, None) => {
                regions.push(CodeRegion::new(path, RegionKind::Class, &name, start, end));
                Scope::Class(name)
            }
            (true, Some(Some(outer))) => {
                let qualified = format!("{outer}.{name}");
                regions.push(
                    CodeRegion::new(path, RegionKind::Class, &qualified, start, end)
                        .with_parent(&outer),
                );
                Scope::Class(qualified)
            }
            (false, None) => {
                regions.push(CodeRegion::new(path, RegionKind::Function, &name, start, end));
                Scope::Function
            }
            (false, Some(Some(owner))) => {
                let qualified = format!("{owner}.{name}");
                regions.push(
                    CodeRegion::new(path, RegionKind::Method, &qualified, start, end)
                        .with_parent(&owner),
                );
                Scope::Function
            }
            // Definitions local to a function body are not lock targets.
            (_, Some(None)) => Scope::Function,
        };
        scopes.push((line.indent, scope));
    }
    regions
}

fn decorated_start(lines: &[LogicalLine], pos: usize) -> u32 {
    let indent = lines[pos].indent;
    let mut start = lines[pos].start;
    let mut idx = pos;
    while idx > 0 {
        let prev = &lines[idx - 1];
        if prev.indent == indent && prev.text.starts_with('@') {
            start = prev.start;
            idx -= 1;
        } else {
            break;
        }
    }
    start
}

fn block_end(lines: &[LogicalLine], pos: usize) -> u32 {
    let indent = lines[pos].indent;
    let mut end = lines[pos].end;
    for line in &lines[pos + 1..] {
        if line.indent <= indent {
            break;
        }
        end = line.end;
    }
    end
}
