//! Read-only admission filter for submitted queries.
//!
//! This is a textual filter, not a sandbox: callers of enqueue are trusted
//! and the executor runs under the worker's privileges. The filter exists to
//! catch obvious misuse before a job ever reaches a worker.
//!
//! The checks run against a *scan copy* of the query in which the contents
//! of single-quoted string literals are blanked out (delimiters preserved,
//! `''` treated as an escaped quote), so keywords hidden inside literals do
//! not trip the filter and keywords outside literals cannot hide in them.

use crate::error::Error;

/// Upper bound on the submitted query, in characters.
pub(crate) const MAX_QUERY_LEN: usize = 100_000;

/// Statement keywords that have no place in a read-only query, matched on
/// word boundaries against the scan copy.
const BLOCKED_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "truncate", "create", "alter", "drop", "grant",
    "revoke", "copy", "vacuum", "analyze", "cluster", "refresh", "reindex", "call", "do", "lock",
];

/// Verify that `query_sql` is a single read-only statement.
///
/// The caller passes the already-trimmed query; length and emptiness are
/// checked during enqueue normalization.
pub(crate) fn ensure_read_only(query_sql: &str) -> Result<(), Error> {
    let scan = scan_copy(query_sql);

    match words(&scan).next() {
        Some(first)
            if first.eq_ignore_ascii_case("select") || first.eq_ignore_ascii_case("with") => {}
        _ => {
            return Err(Error::invalid_argument(
                "query must start with SELECT or WITH",
            ));
        }
    }

    if scan.contains(';') {
        return Err(Error::invalid_argument(
            "statement separator ';' is not allowed",
        ));
    }
    if scan.contains("--") {
        return Err(Error::invalid_argument("line comments are not allowed"));
    }
    if scan.contains("/*") {
        return Err(Error::invalid_argument("block comments are not allowed"));
    }

    for word in words(&scan) {
        if word.eq_ignore_ascii_case("into") {
            return Err(Error::invalid_argument("SELECT INTO is not allowed"));
        }
        if let Some(blocked) = BLOCKED_KEYWORDS
            .iter()
            .find(|kw| word.eq_ignore_ascii_case(kw))
        {
            return Err(Error::invalid_argument(format!(
                "keyword '{blocked}' is not allowed in a read-only query",
            )));
        }
    }

    Ok(())
}

/// Blank the contents of single-quoted literals, preserving the delimiters
/// and the overall length. An unterminated literal blanks the rest of the
/// query; the executor will reject it anyway.
fn scan_copy(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if in_literal {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    // Escaped quote: both characters are literal content.
                    chars.next();
                    out.push_str("  ");
                } else {
                    in_literal = false;
                    out.push('\'');
                }
            } else {
                out.push(' ');
            }
        } else if c == '\'' {
            in_literal = true;
            out.push('\'');
        } else {
            out.push(c);
        }
    }

    out
}

/// Word-boundary tokens: maximal runs of `[A-Za-z0-9_]`.
fn words(scan: &str) -> impl Iterator<Item = &str> {
    scan.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn rejected(sql: &str) -> bool {
        match ensure_read_only(sql) {
            Ok(()) => false,
            Err(error) => {
                assert_eq!(error.kind(), ErrorKind::InvalidArgument);
                true
            }
        }
    }

    #[test]
    fn plain_select_is_accepted() {
        assert!(!rejected("SELECT 1 AS v"));
        assert!(!rejected("select col from t where x = 2"));
        assert!(!rejected("WITH x AS (SELECT 1) SELECT * FROM x"));
    }

    #[test]
    fn first_keyword_must_be_select_or_with() {
        assert!(rejected("EXPLAIN SELECT 1"));
        assert!(rejected("SHOW work_mem"));
        assert!(rejected(""));
        // A leading parenthesis is fine; the first *word* decides.
        assert!(!rejected("(SELECT 1)"));
    }

    #[test]
    fn statement_separator_is_rejected() {
        assert!(rejected("SELECT 1; DROP TABLE t"));
        assert!(rejected("SELECT 1;"));
    }

    #[test]
    fn comments_are_rejected() {
        assert!(rejected("SELECT 1 -- nothing to see"));
        assert!(rejected("SELECT /* hidden */ 1"));
    }

    #[test]
    fn write_keywords_are_rejected_on_word_boundaries() {
        assert!(rejected("SELECT * FROM t WHERE id IN (DELETE FROM u RETURNING id)"));
        assert!(rejected("WITH d AS (UPDATE t SET x = 1 RETURNING x) SELECT * FROM d"));
        assert!(rejected("SELECT 1 INTO tmp"));
        assert!(rejected("WITH c AS (SELECT 1) SELECT * FROM c, lock"));
    }

    #[test]
    fn keywords_inside_identifiers_do_not_trip() {
        // "updated_at" contains "update" but is a single word token.
        assert!(!rejected("SELECT updated_at FROM t"));
        assert!(!rejected("SELECT intolerance, created_by FROM t"));
        assert!(!rejected("SELECT dropped_rows FROM stats"));
        assert!(!rejected("SELECT do_something(x) FROM t"));
    }

    #[test]
    fn keywords_inside_literals_are_ignored() {
        assert!(!rejected("SELECT 'drop table users' AS note"));
        assert!(!rejected("WITH x AS (SELECT '--comment') SELECT * FROM x"));
        assert!(!rejected("SELECT 'a;b' AS pair"));
        assert!(!rejected("SELECT 'it''s; a trap -- really' FROM t"));
    }

    #[test]
    fn literal_delimiters_cannot_hide_trailing_statements() {
        // The literal ends, then a separator and a write statement follow.
        assert!(rejected("SELECT 'ok'; TRUNCATE t"));
        // Escaped quote keeps the literal open across the fake terminator.
        assert!(!rejected("SELECT 'she said ''drop it''' AS quote"));
    }

    #[test]
    fn unterminated_literal_blanks_the_tail() {
        // Everything after the opening quote is literal content.
        assert!(!rejected("SELECT 'unterminated drop table"));
    }

    #[test]
    fn case_is_ignored() {
        assert!(rejected("sElEcT 1 iNtO t"));
        assert!(rejected("WITH x AS (SELECT 1) SELECT * FROM x CROSS JOIN LATERAL VaCuUm"));
    }

    #[test]
    fn scan_copy_preserves_shape() {
        assert_eq!(scan_copy("SELECT 'abc' AS x"), "SELECT '   ' AS x");
        assert_eq!(scan_copy("'a''b'"), "'    '");
        assert_eq!(scan_copy("no literals"), "no literals");
    }
}
