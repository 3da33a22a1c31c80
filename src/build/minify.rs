//! HTML minification for template sources.
//!
//! A conservative whitespace minifier that understands template delimiters:
//! action spans pass through untouched so minification can never corrupt
//! `{{...}}` syntax. Content inside `pre`, `textarea`, `script`, and
//! `style` elements is preserved verbatim; HTML comments are dropped.

/// Minify a template source, protecting action spans.
pub fn minify_html(src: &str, ldelim: &str, rdelim: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    // tag name whose content is currently preserved verbatim
    let mut preserve_until: Option<String> = None;

    while !rest.is_empty() {
        // template actions always pass through verbatim
        if rest.starts_with(ldelim) {
            match rest[ldelim.len()..].find(rdelim) {
                Some(close) => {
                    let end = ldelim.len() + close + rdelim.len();
                    out.push_str(&rest[..end]);
                    rest = &rest[end..];
                    continue;
                }
                None => {
                    // unterminated action; the parser will reject it
                    out.push_str(rest);
                    break;
                }
            }
        }

        if let Some(tag) = &preserve_until {
            let close = format!("</{tag}");
            match find_ci(rest, &close) {
                Some(at) => {
                    out.push_str(&rest[..at + close.len()]);
                    rest = &rest[at + close.len()..];
                    preserve_until = None;
                }
                None => {
                    out.push_str(rest);
                    break;
                }
            }
            continue;
        }

        if rest.starts_with("<!--") {
            match rest.find("-->") {
                Some(at) => {
                    rest = &rest[at + 3..];
                    continue;
                }
                None => break,
            }
        }

        if rest.starts_with('<') {
            if let Some(tag) = opens_preserved_element(rest) {
                preserve_until = Some(tag);
            }
            // copy the tag itself through unmodified
            match next_boundary(rest, ldelim) {
                Some(at) if at > 0 => {
                    out.push_str(&rest[..at]);
                    rest = &rest[at..];
                }
                _ => {
                    out.push_str(rest);
                    break;
                }
            }
            continue;
        }

        // plain text run: collapse whitespace
        let end = next_special(rest, ldelim);
        collapse_ws(&rest[..end], &mut out);
        rest = &rest[end..];
    }
    out
}

/// Does this `<` start one of the verbatim elements?
fn opens_preserved_element(rest: &str) -> Option<String> {
    for tag in ["pre", "textarea", "script", "style"] {
        let open = format!("<{tag}");
        if starts_with_ci(rest, &open) {
            let after = rest.as_bytes().get(open.len());
            if matches!(after, Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'>') | Some(b'/')) {
                return Some(tag.to_string());
            }
        }
    }
    None
}

/// Index of the next text boundary after a tag: past the closing `>` or at
/// the next action delimiter, whichever comes first.
fn next_boundary(rest: &str, ldelim: &str) -> Option<usize> {
    let gt = rest.find('>').map(|i| i + 1);
    let act = rest.find(ldelim);
    match (gt, act) {
        (Some(g), Some(a)) => Some(g.min(a.max(1))),
        (Some(g), None) => Some(g),
        (None, Some(a)) if a > 0 => Some(a),
        _ => None,
    }
}

/// Index of the next `<` or action delimiter in a text run.
fn next_special(rest: &str, ldelim: &str) -> usize {
    let lt = rest.find('<').unwrap_or(rest.len());
    let act = rest.find(ldelim).unwrap_or(rest.len());
    lt.min(act)
}

/// Collapse whitespace runs to a single space (newline if the run had one).
fn collapse_ws(text: &str, out: &mut String) {
    let mut in_ws = false;
    let mut ws_has_newline = false;
    for c in text.chars() {
        if c.is_whitespace() {
            in_ws = true;
            ws_has_newline |= c == '\n';
        } else {
            if in_ws {
                out.push(if ws_has_newline { '\n' } else { ' ' });
                in_ws = false;
                ws_has_newline = false;
            }
            out.push(c);
        }
    }
    if in_ws {
        out.push(if ws_has_newline { '\n' } else { ' ' });
    }
}

fn starts_with_ci(haystack: &str, needle: &str) -> bool {
    haystack.len() >= needle.len() && haystack[..needle.len()].eq_ignore_ascii_case(needle)
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    (0..=h.len().saturating_sub(n.len()))
        .find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}
