use super::{ProjectedColumn, QueryRewriter};
use crate::error::{Error, Result};
use crate::quote_ident;
use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

/// Best-effort rewriting for statements the parser rejects (templated SQL,
/// vendor syntax). Works on a depth map of the text: only characters outside
/// quotes, comments and brackets are treated as structure.
pub struct TextPatternRewriter;

const CLAUSE_KEYWORDS: &[&str] = &[
    "GROUP", "HAVING", "QUALIFY", "WINDOW", "ORDER", "LIMIT", "OFFSET", "FETCH",
];

const SET_OPERATORS: &[&str] = &["UNION", "EXCEPT", "INTERSECT"];

const NOT_AN_ALIAS: &[&str] = &[
    "END", "AND", "OR", "NOT", "NULL", "THEN", "ELSE", "WHEN", "DESC", "ASC", "TRUE", "FALSE",
    "IS", "IN", "LIKE", "BETWEEN",
];

/// `true` for every byte that sits at bracket depth 0 outside quotes and comments.
fn top_level_mask(sql: &str) -> Vec<bool> {
    let bytes = sql.as_bytes();
    let mut mask = vec![false; bytes.len()];
    let mut depth: usize = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // doubled quote is an escaped quote
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {
                if depth == 0 {
                    mask[i] = true;
                }
            }
        }
        i += 1;
    }
    mask
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Position of the first top-level `keyword` at or after `from`.
fn find_keyword(sql: &str, mask: &[bool], keyword: &str, from: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let kw = keyword.as_bytes();
    if bytes.len() < kw.len() {
        return None;
    }
    (from..=bytes.len() - kw.len()).find(|&i| {
        mask[i..i + kw.len()].iter().all(|m| *m)
            && bytes[i..i + kw.len()].eq_ignore_ascii_case(kw)
            && (i == 0 || !is_word_byte(bytes[i - 1]))
            && bytes.get(i + kw.len()).map_or(true, |b| !is_word_byte(*b))
    })
}

fn find_any_keyword(sql: &str, mask: &[bool], keywords: &[&str], from: usize) -> Option<usize> {
    keywords
        .iter()
        .filter_map(|kw| find_keyword(sql, mask, kw, from))
        .min()
}

fn find_last_keyword(sql: &str, mask: &[bool], keyword: &str) -> Option<usize> {
    let mut last = None;
    let mut from = 0;
    while let Some(pos) = find_keyword(sql, mask, keyword, from) {
        last = Some(pos);
        from = pos + 1;
    }
    last
}

/// Byte ranges of the main SELECT list items, split on top-level commas.
fn select_items(sql: &str, mask: &[bool]) -> Result<Vec<Range<usize>>> {
    let select = find_keyword(sql, mask, "SELECT", 0)
        .ok_or_else(|| Error::rewrite("no top-level SELECT found"))?;
    let mut start = select + "SELECT".len();
    for modifier in ["DISTINCT", "ALL"] {
        let rest = sql[start..].trim_start();
        let at = sql.len() - rest.len();
        if find_keyword(sql, mask, modifier, at) == Some(at) {
            start = at + modifier.len();
        }
    }
    let end = find_keyword(sql, mask, "FROM", start).unwrap_or(sql.len());

    let mut items = Vec::new();
    let mut item_start = start;
    for i in start..end {
        if mask[i] && sql.as_bytes()[i] == b',' {
            items.push(item_start..i);
            item_start = i + 1;
        }
    }
    items.push(item_start..end);

    Ok(items
        .into_iter()
        .filter_map(|r| {
            let text = &sql[r.clone()];
            let lead = text.len() - text.trim_start().len();
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(r.start + lead..r.start + lead + trimmed.len())
            }
        })
        .collect())
}

fn unquote(ident: &str) -> String {
    let s = ident.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\"\"", "\"")
    } else {
        s.to_string()
    }
}

fn alias_re() -> &'static Regex {
    static ALIAS_RE: OnceLock<Regex> = OnceLock::new();
    ALIAS_RE.get_or_init(|| {
        Regex::new(r#"^(?:"(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_$]*)$"#).expect("valid alias regex")
    })
}

fn parse_item(item: &str) -> ProjectedColumn {
    static COLUMN_RE: OnceLock<Regex> = OnceLock::new();
    static IMPLICIT_RE: OnceLock<Regex> = OnceLock::new();
    let column_re = COLUMN_RE.get_or_init(|| {
        Regex::new(r#"^(?:(?:"(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_$]*)\.)*("(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_$]*)$"#)
            .expect("valid column regex")
    });
    let implicit_re = IMPLICIT_RE.get_or_init(|| {
        Regex::new(r#"(?s)^(.*[^\s+\-*/%=<>|&,(.])\s+("(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_$]*)$"#)
            .expect("valid implicit alias regex")
    });

    if item == "*" || item.ends_with(".*") {
        return ProjectedColumn {
            name: None,
            expr: item.to_string(),
            is_wildcard: true,
        };
    }

    let mask = top_level_mask(item);
    if let Some(pos) = find_last_keyword(item, &mask, "AS") {
        let alias = item[pos + 2..].trim();
        if alias_re().is_match(alias) {
            return ProjectedColumn {
                name: Some(unquote(alias)),
                expr: item[..pos].trim().to_string(),
                is_wildcard: false,
            };
        }
    }

    if let Some(caps) = column_re.captures(item) {
        return ProjectedColumn {
            name: Some(unquote(&caps[1])),
            expr: item.to_string(),
            is_wildcard: false,
        };
    }

    if let Some(caps) = implicit_re.captures(item) {
        let alias = &caps[2];
        let is_keyword = NOT_AN_ALIAS.iter().any(|k| k.eq_ignore_ascii_case(alias));
        let at_top_level = mask.get(caps.get(2).map_or(0, |m| m.start().saturating_sub(1))) == Some(&true);
        if !is_keyword && at_top_level {
            return ProjectedColumn {
                name: Some(unquote(alias)),
                expr: caps[1].trim().to_string(),
                is_wildcard: false,
            };
        }
    }

    ProjectedColumn {
        name: None,
        expr: item.to_string(),
        is_wildcard: false,
    }
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

impl QueryRewriter for TextPatternRewriter {
    fn projected_columns(&self, sql: &str) -> Result<Vec<ProjectedColumn>> {
        let mask = top_level_mask(sql);
        Ok(select_items(sql, &mask)?
            .into_iter()
            .map(|r| parse_item(&sql[r]))
            .collect())
    }

    fn replace_projection(&self, sql: &str, alias: &str, replacement: &str) -> Result<String> {
        let mask = top_level_mask(sql);
        let target = select_items(sql, &mask)?
            .into_iter()
            .find(|r| parse_item(&sql[r.clone()]).matches(alias))
            .ok_or_else(|| Error::rewrite(format!("no projected column named '{alias}'")))?;
        Ok(format!(
            "{}{} AS {}{}",
            &sql[..target.start],
            replacement,
            quote_ident(alias),
            &sql[target.end..]
        ))
    }

    fn inject_where(&self, sql: &str, condition: &str) -> Result<String> {
        let body = strip_terminator(sql);
        let mask = top_level_mask(body);
        let select = find_keyword(body, &mask, "SELECT", 0)
            .ok_or_else(|| Error::rewrite("no top-level SELECT found"))?;

        if find_any_keyword(body, &mask, SET_OPERATORS, select).is_some() {
            return Ok(format!(
                "SELECT * FROM ({body}) AS __filtered__ WHERE {condition}"
            ));
        }

        if let Some(where_pos) = find_keyword(body, &mask, "WHERE", select) {
            let existing_start = where_pos + "WHERE".len();
            let end = find_any_keyword(body, &mask, CLAUSE_KEYWORDS, existing_start)
                .unwrap_or(body.len());
            let existing = body[existing_start..end].trim();
            let tail = body[end..].trim();
            let mut out = format!("{}WHERE ({existing}) AND ({condition})", &body[..where_pos]);
            if !tail.is_empty() {
                out.push(' ');
                out.push_str(tail);
            }
            return Ok(out);
        }

        let anchor = find_keyword(body, &mask, "FROM", select).unwrap_or(select);
        let end = find_any_keyword(body, &mask, CLAUSE_KEYWORDS, anchor).unwrap_or(body.len());
        let tail = body[end..].trim();
        let mut out = format!("{} WHERE {condition}", body[..end].trim_end());
        if !tail.is_empty() {
            out.push(' ');
            out.push_str(tail);
        }
        Ok(out)
    }
}
