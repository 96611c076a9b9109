//! Classifies a single SQL statement as a read or a write.
//!
//! This is a guard for the read-only query path, not a parser: it looks at the
//! statement keyword and refuses anything that carries more than one statement.
//! Reads still run inside a read-only transaction, so a statement that slips
//! past this check is refused by the server.

use crate::domain::model::StatementKind;
use crate::utils::error::{Result, StolonError};

const READ_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "WITH"];

/// Keywords that can follow a CTE list and read.
const CTE_READ_BODIES: &[&str] = &["SELECT", "TABLE", "VALUES"];

/// Keywords that can follow a CTE list, or an `EXPLAIN ANALYZE`, and modify data.
const DATA_CHANGES: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE"];

#[derive(Clone, Copy, PartialEq)]
enum State {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

pub fn classify(sql: &str) -> Result<StatementKind> {
    ensure_single_statement(sql)?;

    let body = skip_leading_noise(sql);
    let keyword: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    if keyword.is_empty() {
        return Err(StolonError::InvalidStatement {
            message: "statement is empty".to_string(),
        });
    }

    let kind = match keyword.as_str() {
        "WITH" => {
            // The statement keyword is the first top-level one after the CTE list.
            let words = top_level_words(sql);
            match words
                .iter()
                .skip(1)
                .find(|w| CTE_READ_BODIES.contains(&w.as_str()) || DATA_CHANGES.contains(&w.as_str()))
            {
                Some(body) if CTE_READ_BODIES.contains(&body.as_str()) => StatementKind::Read,
                _ => StatementKind::Write,
            }
        }
        "EXPLAIN" | "DESCRIBE" | "DESC" => {
            // EXPLAIN ANALYZE runs the statement it explains.
            let words = top_level_words(sql);
            let analyzes = words.iter().any(|w| w == "ANALYZE");
            if analyzes && words.iter().any(|w| DATA_CHANGES.contains(&w.as_str())) {
                StatementKind::Write
            } else {
                StatementKind::Read
            }
        }
        other if READ_KEYWORDS.contains(&other) => StatementKind::Read,
        _ => StatementKind::Write,
    };
    Ok(kind)
}

/// Upper-cased words at the nesting depth of the statement's first word,
/// skipping quoted text, comments and anything inside parentheses.
fn top_level_words(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut state = State::Code;
    let mut depth = 0usize;
    let mut base: Option<usize> = None;
    let mut words = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Code => match c {
                '\'' | '"' | '`' => state = State::Quoted(c),
                '#' => state = State::LineComment,
                '-' if next == Some('-') => state = State::LineComment,
                '/' if next == Some('*') => {
                    state = State::BlockComment;
                    i += 1;
                }
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                c if c.is_alphanumeric() || c == '_' || c == '$' => {
                    let start = i;
                    while i + 1 < chars.len()
                        && (chars[i + 1].is_alphanumeric() || chars[i + 1] == '_' || chars[i + 1] == '$')
                    {
                        i += 1;
                    }
                    let base = *base.get_or_insert(depth);
                    if depth == base {
                        let word: String = chars[start..=i].iter().collect();
                        words.push(word.to_ascii_uppercase());
                    }
                }
                _ => {}
            },
            State::Quoted(quote) => {
                if c == '\\' {
                    i += 1;
                } else if c == quote {
                    if next == Some(quote) {
                        i += 1;
                    } else {
                        state = State::Code;
                    }
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = State::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    words
}

/// Strips whitespace, comments and opening parentheses ahead of the first keyword.
fn skip_leading_noise(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = trimmed.strip_prefix("--").or_else(|| trimmed.strip_prefix('#')) {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return trimmed;
        }
    }
}

/// Rejects a `;` outside quotes and comments that is followed by anything but whitespace.
fn ensure_single_statement(sql: &str) -> Result<()> {
    let chars: Vec<char> = sql.chars().collect();
    let mut state = State::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Code => match c {
                '\'' | '"' | '`' => state = State::Quoted(c),
                '#' => state = State::LineComment,
                '-' if next == Some('-') => state = State::LineComment,
                '/' if next == Some('*') => {
                    state = State::BlockComment;
                    i += 1;
                }
                ';' => {
                    let remainder: String = chars[i + 1..].iter().collect();
                    if !skip_leading_noise(&remainder).trim().is_empty() {
                        return Err(StolonError::InvalidStatement {
                            message: "only one statement can be run at a time".to_string(),
                        });
                    }
                    return Ok(());
                }
                _ => {}
            },
            State::Quoted(quote) => {
                if c == '\\' {
                    i += 1;
                } else if c == quote {
                    if next == Some(quote) {
                        i += 1;
                    } else {
                        state = State::Code;
                    }
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = State::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_statements() {
        for sql in [
            "SELECT * FROM users",
            "  select 1;",
            "show tables",
            "DESCRIBE users",
            "desc users",
            "EXPLAIN SELECT 1",
            "WITH t AS (SELECT 1) SELECT * FROM t",
            "(SELECT 1) UNION (SELECT 2)",
            "-- who\nSELECT 1",
            "/* hint */ SELECT 1",
            "# mysql comment\nSELECT 1",
        ] {
            assert_eq!(classify(sql).unwrap(), StatementKind::Read, "{}", sql);
        }
    }

    #[test]
    fn test_write_statements() {
        for sql in [
            "UPDATE users SET name = 'x'",
            "delete from users",
            "INSERT INTO t VALUES (1)",
            "/* sneaky */ DROP TABLE users",
            "CALL refresh()",
            "WITH doomed AS (SELECT id FROM users WHERE banned) DELETE FROM users WHERE id IN (SELECT id FROM doomed)",
            "with stale as (select id from sessions) update sessions set expired = 1",
            "WITH RECURSIVE n (i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 5) INSERT INTO t SELECT i FROM n",
            "WITH a AS (SELECT 1), b AS (SELECT 2) REPLACE INTO t VALUES (1)",
            "EXPLAIN ANALYZE DELETE FROM users WHERE id = 1",
        ] {
            assert_eq!(classify(sql).unwrap(), StatementKind::Write, "{}", sql);
        }
    }

    #[test]
    fn test_statement_keyword_follows_the_cte_list() {
        for sql in [
            "WITH update_log AS (SELECT * FROM audit WHERE action = 'DELETE') SELECT * FROM update_log",
            "WITH `delete` AS (SELECT 1) SELECT * FROM `delete`",
            "WITH RECURSIVE n AS (SELECT 1 AS i UNION ALL SELECT i + 1 FROM n WHERE i < 3) SELECT * FROM n",
            "WITH t AS (SELECT 1) TABLE t",
            "EXPLAIN DELETE FROM users WHERE id = 1",
            "EXPLAIN ANALYZE SELECT * FROM users",
        ] {
            assert_eq!(classify(sql).unwrap(), StatementKind::Read, "{}", sql);
        }
        assert_eq!(
            classify("WITH t AS (SELECT 1)").unwrap(),
            StatementKind::Write
        );
    }

    #[test]
    fn test_empty_statement() {
        assert!(classify("").is_err());
        assert!(classify("   -- nothing\n").is_err());
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert!(classify("SELECT 1; DROP TABLE users").is_err());
        assert!(classify("SELECT 1; -- trailing comment").is_ok());
        assert!(classify("SELECT ';' AS semi").is_ok());
        assert!(classify("SELECT 'it''s; fine'").is_ok());
        assert!(classify("SELECT 1 /* ; */").is_ok());
    }
}
