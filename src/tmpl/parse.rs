//! Template parser.
//!
//! Turns lexed segments into named [`Tree`]s: the file's own tree plus one
//! per `{{define "..."}}` block. Function names are resolved against the
//! known-function set at parse time so a template referencing an undefined
//! function fails the build, not the request.

use super::ast::{Branch, Command, Node, Pipeline, RangeNode, Term, Tree};
use super::error::ParseError;
use super::lexer::{lex, Action, Seg, Tok};
use rustc_hash::FxHashSet;

/// Parse a template source into one or more named trees.
///
/// The first tree is always named `name` (the source file's identity path);
/// `define` blocks follow in source order.
pub fn parse(
    name: &str,
    src: &str,
    ldelim: &str,
    rdelim: &str,
    funcs: &FxHashSet<String>,
) -> Result<Vec<Tree>, ParseError> {
    let segs = lex(name, src, ldelim, rdelim)?;
    let mut p = Parser {
        name,
        funcs,
        segs,
        pos: 0,
        defines: Vec::new(),
    };
    let (root, term) = p.parse_nodes(true)?;
    if let Some(t) = term {
        return Err(p.unexpected(&t.keyword, t.line, "outside any block"));
    }
    let mut trees = vec![Tree {
        name: name.to_string(),
        root,
    }];
    trees.append(&mut p.defines);
    Ok(trees)
}

/// A block terminator action: `{{end}}` or `{{else ...}}`.
struct Terminator {
    keyword: String,
    /// Tokens following `else` (non-empty for `else if`).
    rest: Vec<Tok>,
    line: usize,
}

struct Parser<'a> {
    name: &'a str,
    funcs: &'a FxHashSet<String>,
    segs: Vec<Seg>,
    pos: usize,
    defines: Vec<Tree>,
}

impl<'a> Parser<'a> {
    fn unexpected(&self, tok: &str, line: usize, ctx: &str) -> ParseError {
        ParseError::Unexpected {
            name: self.name.to_string(),
            line,
            tok: tok.to_string(),
            ctx: ctx.to_string(),
        }
    }

    fn eof(&self) -> ParseError {
        ParseError::UnexpectedEof {
            name: self.name.to_string(),
            line: 0,
        }
    }

    /// Parse nodes until a terminator (`end`/`else`) or end of input.
    /// `top_level` permits `define` blocks and end-of-input.
    fn parse_nodes(&mut self, top_level: bool) -> Result<(Vec<Node>, Option<Terminator>), ParseError> {
        let mut nodes = Vec::new();
        loop {
            let seg = match self.segs.get(self.pos) {
                Some(seg) => seg.clone(),
                None => {
                    if top_level {
                        return Ok((nodes, None));
                    }
                    return Err(self.eof());
                }
            };
            self.pos += 1;

            let action = match seg {
                Seg::Text(t) => {
                    nodes.push(Node::Text(t));
                    continue;
                }
                Seg::Action(a) => a,
            };

            match keyword(&action) {
                Some("end") => {
                    return Ok((
                        nodes,
                        Some(Terminator {
                            keyword: "end".to_string(),
                            rest: Vec::new(),
                            line: action.line,
                        }),
                    ));
                }
                Some("else") => {
                    return Ok((
                        nodes,
                        Some(Terminator {
                            keyword: "else".to_string(),
                            rest: action.toks[1..].to_vec(),
                            line: action.line,
                        }),
                    ));
                }
                Some("define") => {
                    if !top_level {
                        return Err(self.unexpected("define", action.line, "inside a block"));
                    }
                    self.parse_define(&action)?;
                }
                Some("if") => nodes.push(self.parse_if(action.toks[1..].to_vec(), action.line)?),
                Some("with") => {
                    nodes.push(self.parse_with(action.toks[1..].to_vec(), action.line)?)
                }
                Some("range") => {
                    nodes.push(self.parse_range(action.toks[1..].to_vec(), action.line)?)
                }
                Some("template") => nodes.push(self.parse_template(&action)?),
                _ => {
                    let pipe = self.parse_pipeline_toks(&action.toks, action.line)?;
                    nodes.push(Node::Action(pipe));
                }
            }
        }
    }

    fn parse_define(&mut self, action: &Action) -> Result<(), ParseError> {
        let name = match action.toks.get(1) {
            Some(Tok::Str(s)) => s.clone(),
            _ => return Err(self.unexpected("define", action.line, "missing template name")),
        };
        if action.toks.len() > 2 {
            return Err(self.unexpected("define", action.line, "unexpected tokens after name"));
        }
        let (body, term) = self.parse_nodes(false)?;
        match term {
            Some(t) if t.keyword == "end" => {}
            Some(t) => return Err(self.unexpected(&t.keyword, t.line, "expected {{end}}")),
            None => return Err(self.eof()),
        }
        self.defines.push(Tree { name, root: body });
        Ok(())
    }

    fn parse_if(&mut self, toks: Vec<Tok>, line: usize) -> Result<Node, ParseError> {
        let pipe = self.parse_pipeline_toks(&toks, line)?;
        let (then, term) = self.parse_nodes(false)?;
        let else_ = self.parse_else(term, |p, toks, line| p.parse_if(toks, line))?;
        Ok(Node::If(Branch {
            pipe,
            then,
            else_,
            line,
        }))
    }

    fn parse_with(&mut self, toks: Vec<Tok>, line: usize) -> Result<Node, ParseError> {
        let pipe = self.parse_pipeline_toks(&toks, line)?;
        let (then, term) = self.parse_nodes(false)?;
        let else_ = self.parse_else(term, |p, toks, line| p.parse_with(toks, line))?;
        Ok(Node::With(Branch {
            pipe,
            then,
            else_,
            line,
        }))
    }

    /// Handle the terminator after a then-branch: `end`, bare `else`, or
    /// `else if`/`else with` continuation built by `nest`.
    fn parse_else(
        &mut self,
        term: Option<Terminator>,
        nest: impl FnOnce(&mut Self, Vec<Tok>, usize) -> Result<Node, ParseError>,
    ) -> Result<Vec<Node>, ParseError> {
        let term = term.ok_or_else(|| self.eof())?;
        if term.keyword == "end" {
            return Ok(Vec::new());
        }
        // {{else}} or {{else if ...}}
        if term.rest.is_empty() {
            let (else_, end) = self.parse_nodes(false)?;
            match end {
                Some(t) if t.keyword == "end" => Ok(else_),
                Some(t) => Err(self.unexpected(&t.keyword, t.line, "expected {{end}}")),
                None => Err(self.eof()),
            }
        } else if term.rest.first() == Some(&Tok::Ident("if".to_string())) {
            let node = nest(self, term.rest[1..].to_vec(), term.line)?;
            Ok(vec![node])
        } else {
            Err(self.unexpected("else", term.line, "unexpected tokens after else"))
        }
    }

    fn parse_range(&mut self, mut toks: Vec<Tok>, line: usize) -> Result<Node, ParseError> {
        let mut decls = Vec::new();
        // {{range $v := ...}} or {{range $i, $v := ...}}
        if let Some(declare_at) = toks.iter().position(|t| *t == Tok::Declare) {
            let head = &toks[..declare_at];
            let mut ok = true;
            for (i, tok) in head.iter().enumerate() {
                match tok {
                    Tok::Var(name, chain) if chain.is_empty() && i % 2 == 0 => {
                        decls.push(name.clone())
                    }
                    Tok::Comma if i % 2 == 1 => {}
                    _ => ok = false,
                }
            }
            if !ok || decls.is_empty() || decls.len() > 2 {
                return Err(self.unexpected("range", line, "bad variable declaration"));
            }
            toks.drain(..=declare_at);
        }
        let pipe = self.parse_pipeline_toks(&toks, line)?;
        let (body, term) = self.parse_nodes(false)?;
        let term = term.ok_or_else(|| self.eof())?;
        let else_ = if term.keyword == "end" {
            Vec::new()
        } else if term.rest.is_empty() {
            let (else_, end) = self.parse_nodes(false)?;
            match end {
                Some(t) if t.keyword == "end" => else_,
                Some(t) => return Err(self.unexpected(&t.keyword, t.line, "expected {{end}}")),
                None => return Err(self.eof()),
            }
        } else {
            return Err(self.unexpected("else", term.line, "unexpected tokens after else"));
        };
        Ok(Node::Range(RangeNode {
            decls,
            pipe,
            body,
            else_,
            line,
        }))
    }

    fn parse_template(&mut self, action: &Action) -> Result<Node, ParseError> {
        let name = match action.toks.get(1) {
            Some(Tok::Str(s)) => s.clone(),
            _ => {
                return Err(self.unexpected("template", action.line, "missing template name"))
            }
        };
        let pipe = if action.toks.len() > 2 {
            Some(self.parse_pipeline_toks(&action.toks[2..], action.line)?)
        } else {
            None
        };
        Ok(Node::Template {
            name,
            pipe,
            line: action.line,
        })
    }

    /// Parse a pipeline from a token slice.
    fn parse_pipeline_toks(&self, toks: &[Tok], line: usize) -> Result<Pipeline, ParseError> {
        let mut cursor = Cursor { toks, pos: 0 };
        let pipe = self.parse_pipeline(&mut cursor, line)?;
        if cursor.pos != toks.len() {
            return Err(self.unexpected(")", line, "unbalanced parentheses"));
        }
        Ok(pipe)
    }

    /// Parse a pipeline until end of tokens or an unmatched `)`.
    fn parse_pipeline(&self, cursor: &mut Cursor, line: usize) -> Result<Pipeline, ParseError> {
        let mut decls = Vec::new();
        // leading `$x :=`
        if let (Some(Tok::Var(name, chain)), Some(Tok::Declare)) =
            (cursor.peek(0), cursor.peek(1))
        {
            if chain.is_empty() {
                decls.push(name.clone());
                cursor.pos += 2;
            }
        }

        let mut cmds = Vec::new();
        loop {
            let cmd = self.parse_command(cursor, line)?;
            if cmd.terms.is_empty() {
                return Err(self.unexpected("|", line, "empty command"));
            }
            cmds.push(cmd);
            match cursor.peek(0) {
                Some(Tok::Pipe) => {
                    cursor.pos += 1;
                }
                _ => break,
            }
        }
        Ok(Pipeline { decls, cmds, line })
    }

    /// Parse one command: terms until `|`, `)`, or end of tokens.
    fn parse_command(&self, cursor: &mut Cursor, line: usize) -> Result<Command, ParseError> {
        let mut terms = Vec::new();
        loop {
            match cursor.peek(0) {
                None | Some(Tok::Pipe) | Some(Tok::RParen) => break,
                Some(tok) => {
                    let tok = tok.clone();
                    cursor.pos += 1;
                    terms.push(self.parse_term(tok, cursor, line)?);
                }
            }
        }
        Ok(Command { terms, line })
    }

    fn parse_term(&self, tok: Tok, cursor: &mut Cursor, line: usize) -> Result<Term, ParseError> {
        Ok(match tok {
            Tok::Field(chain) if chain.is_empty() => Term::Dot,
            Tok::Field(chain) => Term::Field(chain),
            Tok::Var(name, chain) => Term::Var(name, chain),
            Tok::Str(s) => Term::Str(s),
            Tok::Int(n) => Term::Int(n),
            Tok::Float(f) => Term::Float(f),
            Tok::Ident(id) => match id.as_str() {
                "true" => Term::Bool(true),
                "false" => Term::Bool(false),
                "nil" => Term::Nil,
                _ => {
                    if !self.funcs.contains(&id) {
                        return Err(ParseError::UnknownFunction {
                            name: self.name.to_string(),
                            line,
                            func: id,
                        });
                    }
                    Term::Func(id)
                }
            },
            Tok::LParen => {
                let inner = self.parse_pipeline(cursor, line)?;
                match cursor.peek(0) {
                    Some(Tok::RParen) => cursor.pos += 1,
                    _ => return Err(self.unexpected("(", line, "missing closing parenthesis")),
                }
                Term::Paren(Box::new(inner))
            }
            Tok::RParen => return Err(self.unexpected(")", line, "unmatched parenthesis")),
            Tok::Pipe => return Err(self.unexpected("|", line, "unexpected pipe")),
            Tok::Declare => return Err(self.unexpected(":=", line, "unexpected declaration")),
            Tok::Comma => return Err(self.unexpected(",", line, "unexpected comma")),
        })
    }
}

struct Cursor<'a> {
    toks: &'a [Tok],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self, ahead: usize) -> Option<&Tok> {
        self.toks.get(self.pos + ahead)
    }
}

/// The leading keyword of an action, if its first token is an identifier.
fn keyword(action: &Action) -> Option<&str> {
    match action.toks.first() {
        Some(Tok::Ident(id)) => Some(id.as_str()),
        _ => None,
    }
}
