//! Template lexer.
//!
//! Splits a source file into literal text and `{{...}}` action segments
//! using the configured delimiters, then tokenizes action contents. Trim
//! markers (`{{- `, ` -}}`) strip adjacent whitespace; comments
//! (`{{/* ... */}}`) produce no segment.

use super::error::ParseError;

/// A token inside an action.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Bare identifier: keywords and function names.
    Ident(String),
    /// Field chain `.A.B`; a lone `.` is an empty chain.
    Field(Vec<String>),
    /// Variable `$x` with optional trailing chain `$x.A.B`.
    Var(String, Vec<String>),
    /// Quoted or raw string literal.
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    Pipe,
    /// `:=`
    Declare,
    Comma,
}

/// One `{{...}}` action with its tokens and source line.
#[derive(Debug, Clone)]
pub struct Action {
    pub toks: Vec<Tok>,
    pub line: usize,
}

/// A lexed segment: literal text or an action.
#[derive(Debug, Clone)]
pub enum Seg {
    Text(String),
    Action(Action),
}

/// Lex a template source into segments.
pub fn lex(name: &str, src: &str, ldelim: &str, rdelim: &str) -> Result<Vec<Seg>, ParseError> {
    let mut segs = Vec::new();
    let mut rest = src;
    let mut line = 1usize;
    // set when the previous action carried a right trim marker
    let mut trim_next = false;

    while !rest.is_empty() {
        match rest.find(ldelim) {
            None => {
                push_text(&mut segs, rest, &mut trim_next);
                line += count_lines(rest);
                rest = "";
            }
            Some(at) => {
                let (text, after) = rest.split_at(at);
                let mut text = text;
                let mut action_src = &after[ldelim.len()..];

                // left trim marker strips trailing whitespace off the text
                if let Some(stripped) = strip_left_trim(action_src) {
                    action_src = stripped;
                    text = text.trim_end();
                }
                push_text(&mut segs, text, &mut trim_next);
                line += count_lines(rest.split_at(at).0);

                let close = action_src.find(rdelim).ok_or(ParseError::UnclosedAction {
                    name: name.to_string(),
                    line,
                })?;
                let (mut content, after_close) = action_src.split_at(close);
                rest = &after_close[rdelim.len()..];

                // right trim marker strips leading whitespace off what follows
                if let Some(stripped) = strip_right_trim(content) {
                    content = stripped;
                    trim_next = true;
                }

                let action_line = line;
                line += count_lines(content);

                let trimmed = content.trim();
                if trimmed.starts_with("/*") {
                    if !trimmed.ends_with("*/") {
                        return Err(ParseError::UnclosedComment {
                            name: name.to_string(),
                            line: action_line,
                        });
                    }
                    continue;
                }

                let toks = tokenize(name, content, action_line)?;
                if !toks.is_empty() {
                    segs.push(Seg::Action(Action {
                        toks,
                        line: action_line,
                    }));
                }
            }
        }
    }
    Ok(segs)
}

fn push_text(segs: &mut Vec<Seg>, text: &str, trim_next: &mut bool) {
    let text = if *trim_next {
        *trim_next = false;
        text.trim_start()
    } else {
        text
    };
    if !text.is_empty() {
        segs.push(Seg::Text(text.to_string()));
    }
}

fn count_lines(s: &str) -> usize {
    s.bytes().filter(|b| *b == b'\n').count()
}

/// `{{- ` requires whitespace after the dash, per the usual trim rule.
fn strip_left_trim(action_src: &str) -> Option<&str> {
    let rest = action_src.strip_prefix('-')?;
    if rest.starts_with(|c: char| c.is_whitespace()) {
        Some(rest)
    } else {
        None
    }
}

fn strip_right_trim(content: &str) -> Option<&str> {
    let rest = content.strip_suffix('-')?;
    if rest.ends_with(|c: char| c.is_whitespace()) {
        Some(rest)
    } else {
        None
    }
}

/// Tokenize the inside of one action.
fn tokenize(name: &str, content: &str, line: usize) -> Result<Vec<Tok>, ParseError> {
    let mut toks = Vec::new();
    let mut chars = content.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                toks.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                toks.push(Tok::RParen);
            }
            '|' => {
                chars.next();
                toks.push(Tok::Pipe);
            }
            ',' => {
                chars.next();
                toks.push(Tok::Comma);
            }
            ':' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '=')) => {
                        chars.next();
                        toks.push(Tok::Declare);
                    }
                    _ => {
                        return Err(ParseError::UnexpectedChar {
                            name: name.to_string(),
                            line,
                            ch: ':',
                        })
                    }
                }
            }
            '"' => {
                chars.next();
                toks.push(Tok::Str(scan_quoted(name, &mut chars, line)?));
            }
            '`' => {
                chars.next();
                toks.push(Tok::Str(scan_raw(name, &mut chars, line)?));
            }
            '.' => {
                chars.next();
                toks.push(Tok::Field(scan_chain(&mut chars)));
            }
            '$' => {
                chars.next();
                let var = scan_ident(&mut chars);
                let chain = match chars.peek() {
                    Some(&(_, '.')) => {
                        chars.next();
                        scan_chain(&mut chars)
                    }
                    _ => Vec::new(),
                };
                toks.push(Tok::Var(var, chain));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let lit = scan_number(content, i, &mut chars);
                toks.push(parse_number(name, &lit, line)?);
            }
            c if c.is_alphanumeric() || c == '_' => {
                toks.push(Tok::Ident(scan_ident(&mut chars)));
            }
            other => {
                return Err(ParseError::UnexpectedChar {
                    name: name.to_string(),
                    line,
                    ch: other,
                })
            }
        }
    }
    Ok(toks)
}

type Chars<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn scan_ident(chars: &mut Chars) -> String {
    let mut out = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
            chars.next();
        } else {
            break;
        }
    }
    out
}

/// Scan a field chain after a leading dot has been consumed: `A.B.C`.
/// Returns an empty chain for a lone `.`.
fn scan_chain(chars: &mut Chars) -> Vec<String> {
    let mut chain = Vec::new();
    loop {
        let part = scan_ident(chars);
        if part.is_empty() {
            break;
        }
        chain.push(part);
        match chars.peek() {
            Some(&(_, '.')) => {
                chars.next();
            }
            _ => break,
        }
    }
    chain
}

fn scan_quoted(name: &str, chars: &mut Chars, line: usize) -> Result<String, ParseError> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => {
                return Err(ParseError::UnclosedString {
                    name: name.to_string(),
                    line,
                })
            }
            Some((_, '"')) => return Ok(out),
            Some((_, '\\')) => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, c)) => out.push(c),
                None => {
                    return Err(ParseError::UnclosedString {
                        name: name.to_string(),
                        line,
                    })
                }
            },
            Some((_, c)) => out.push(c),
        }
    }
}

fn scan_raw(name: &str, chars: &mut Chars, line: usize) -> Result<String, ParseError> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => {
                return Err(ParseError::UnclosedString {
                    name: name.to_string(),
                    line,
                })
            }
            Some((_, '`')) => return Ok(out),
            Some((_, c)) => out.push(c),
        }
    }
}

fn scan_number(content: &str, start: usize, chars: &mut Chars) -> String {
    let mut end = start;
    // consume sign
    if let Some(&(i, c)) = chars.peek() {
        if c == '-' || c == '+' {
            end = i + c.len_utf8();
            chars.next();
        }
    }
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == 'x' || c == '_' {
            end = i + c.len_utf8();
            chars.next();
        } else {
            break;
        }
    }
    content[start..end].to_string()
}

fn parse_number(name: &str, lit: &str, line: usize) -> Result<Tok, ParseError> {
    let clean = lit.replace('_', "");
    if let Some(hex) = clean.strip_prefix("0x").or_else(|| clean.strip_prefix("-0x")) {
        let v = i64::from_str_radix(hex, 16).map_err(|_| ParseError::BadNumber {
            name: name.to_string(),
            line,
            lit: lit.to_string(),
        })?;
        let v = if clean.starts_with('-') { -v } else { v };
        return Ok(Tok::Int(v));
    }
    if clean.contains('.') || clean.contains('e') || clean.contains('E') {
        clean
            .parse::<f64>()
            .map(Tok::Float)
            .map_err(|_| ParseError::BadNumber {
                name: name.to_string(),
                line,
                lit: lit.to_string(),
            })
    } else {
        clean
            .parse::<i64>()
            .map(Tok::Int)
            .map_err(|_| ParseError::BadNumber {
                name: name.to_string(),
                line,
                lit: lit.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_default(src: &str) -> Vec<Seg> {
        lex("test", src, "{{", "}}").unwrap()
    }

    fn action_toks(seg: &Seg) -> &[Tok] {
        match seg {
            Seg::Action(a) => &a.toks,
            Seg::Text(t) => panic!("expected action, got text {t:?}"),
        }
    }

    #[test]
    fn test_plain_text() {
        let segs = lex_default("hello world");
        assert_eq!(segs.len(), 1);
        assert!(matches!(&segs[0], Seg::Text(t) if t == "hello world"));
    }

    #[test]
    fn test_action_tokens() {
        let segs = lex_default(r#"{{define "GET /x"}}"#);
        assert_eq!(
            action_toks(&segs[0]),
            &[
                Tok::Ident("define".to_string()),
                Tok::Str("GET /x".to_string())
            ]
        );
    }

    #[test]
    fn test_field_chain_and_dot() {
        let segs = lex_default("{{.Resp.SetStatus 204}}{{.}}");
        assert_eq!(
            action_toks(&segs[0]),
            &[
                Tok::Field(vec!["Resp".to_string(), "SetStatus".to_string()]),
                Tok::Int(204)
            ]
        );
        assert_eq!(action_toks(&segs[1]), &[Tok::Field(vec![])]);
    }

    #[test]
    fn test_variables() {
        let segs = lex_default("{{$x := .Items}}{{$x.Name}}");
        assert_eq!(
            action_toks(&segs[0]),
            &[
                Tok::Var("x".to_string(), vec![]),
                Tok::Declare,
                Tok::Field(vec!["Items".to_string()])
            ]
        );
        assert_eq!(
            action_toks(&segs[1]),
            &[Tok::Var("x".to_string(), vec!["Name".to_string()])]
        );
    }

    #[test]
    fn test_pipeline_and_parens() {
        let segs = lex_default("{{(len .Items) | printf \"%d\"}}");
        assert_eq!(
            action_toks(&segs[0]),
            &[
                Tok::LParen,
                Tok::Ident("len".to_string()),
                Tok::Field(vec!["Items".to_string()]),
                Tok::RParen,
                Tok::Pipe,
                Tok::Ident("printf".to_string()),
                Tok::Str("%d".to_string()),
            ]
        );
    }

    #[test]
    fn test_custom_delimiters() {
        let segs = lex("test", "a<% .X %>b", "<%", "%>").unwrap();
        assert_eq!(segs.len(), 3);
        assert!(matches!(&segs[1], Seg::Action(_)));
    }

    #[test]
    fn test_trim_markers() {
        let segs = lex_default("a   {{- .X -}}   b");
        assert!(matches!(&segs[0], Seg::Text(t) if t == "a"));
        assert!(matches!(&segs[1], Seg::Action(_)));
        assert!(matches!(&segs[2], Seg::Text(t) if t == "b"));
    }

    #[test]
    fn test_comment_skipped() {
        let segs = lex_default("a{{/* note */}}b");
        assert_eq!(segs.len(), 2);
        assert!(matches!(&segs[0], Seg::Text(t) if t == "a"));
        assert!(matches!(&segs[1], Seg::Text(t) if t == "b"));
    }

    #[test]
    fn test_unclosed_action() {
        assert!(matches!(
            lex("test", "{{.X", "{{", "}}"),
            Err(ParseError::UnclosedAction { .. })
        ));
    }

    #[test]
    fn test_numbers() {
        let segs = lex_default("{{f 1 -2 3.5 0x10}}");
        assert_eq!(
            action_toks(&segs[0]),
            &[
                Tok::Ident("f".to_string()),
                Tok::Int(1),
                Tok::Int(-2),
                Tok::Float(3.5),
                Tok::Int(16),
            ]
        );
    }

    #[test]
    fn test_line_numbers() {
        let segs = lex_default("line1\nline2\n{{.X}}");
        match &segs[1] {
            Seg::Action(a) => assert_eq!(a.line, 3),
            _ => panic!("expected action"),
        }
    }
}
