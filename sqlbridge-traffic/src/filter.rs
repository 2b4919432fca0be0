//! Redaction of command streams before they reach disk, plus the read-only
//! classification used by `readonly` replays.

/// Statements whose leading keywords mean the payload must never be
/// captured: credential DDL carries passwords, BACKUP/RESTORE/IMPORT carry
/// cloud-storage URLs with embedded tokens, and LOAD DATA cannot be replayed.
const SENSITIVE_KEYWORDS: &[&[&str]] = &[
    &["CREATE", "USER"],
    &["ALTER", "USER"],
    &["SET", "PASSWORD"],
    &["GRANT"],
    &["BACKUP"],
    &["RESTORE"],
    &["IMPORT"],
    &["LOAD", "DATA"],
];

/// Leading keywords of statements a `readonly` replay is allowed to send.
const READ_ONLY_KEYWORDS: &[&str] = &[
    "SELECT", "SHOW", "EXPLAIN", "DESC", "DESCRIBE", "USE", "SET", "BEGIN", "COMMIT", "ROLLBACK",
];

/// A minimal SQL lexer: yields uppercased keywords, skipping whitespace,
/// `--`/`#` line comments, and `/* */` block comments (hint comments
/// included).
pub struct Lexer<'a> {
    rest: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(sql: &'a str) -> Self {
        Lexer { rest: sql }
    }

    pub fn next_token(&mut self) -> Option<String> {
        self.skip_ignored();
        let end = self
            .rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let (tok, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(tok.to_ascii_uppercase())
    }

    fn skip_ignored(&mut self) {
        loop {
            let trimmed = self.rest.trim_start();
            if let Some(rest) = trimmed.strip_prefix("--") {
                self.rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
            } else if let Some(rest) = trimmed.strip_prefix('#') {
                self.rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
            } else if let Some(rest) = trimmed.strip_prefix("/*") {
                self.rest = rest.split_once("*/").map(|(_, r)| r).unwrap_or("");
            } else {
                self.rest = trimmed;
                return;
            }
        }
    }
}

/// Whether the statement must be redacted from the capture stream.
pub fn is_sensitive_sql(sql: &str) -> bool {
    let mut lexer = Lexer::new(sql);
    let first = match lexer.next_token() {
        Some(t) => t,
        None => return false,
    };
    let mut second: Option<Option<String>> = None;
    for kw in SENSITIVE_KEYWORDS {
        if first != kw[0] {
            continue;
        }
        if kw.len() == 1 {
            return true;
        }
        let second = second.get_or_insert_with(|| lexer.next_token());
        if second.as_deref() == Some(kw[1]) {
            return true;
        }
    }
    false
}

/// Whether the statement is safe to send during a `readonly` replay.
pub fn is_read_only_sql(sql: &str) -> bool {
    match Lexer::new(sql).next_token() {
        Some(first) => READ_ONLY_KEYWORDS.iter().any(|kw| *kw == first),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_sensitive() {
        assert!(is_sensitive_sql("CREATE USER x IDENTIFIED BY 'p'"));
        assert!(is_sensitive_sql("alter user u identified by 'q'"));
        assert!(is_sensitive_sql("set password for u = 'x'"));
        assert!(is_sensitive_sql("GRANT ALL ON *.* TO u"));
    }

    #[test]
    fn bulk_io_is_sensitive() {
        assert!(is_sensitive_sql("BACKUP DATABASE d TO 's3://bucket?key=k'"));
        assert!(is_sensitive_sql("restore database d from 's3://bucket'"));
        assert!(is_sensitive_sql("IMPORT INTO t FROM 'gs://bucket'"));
        assert!(is_sensitive_sql("LOAD DATA INFILE '/tmp/x' INTO TABLE t"));
    }

    #[test]
    fn plain_statements_pass_through() {
        assert!(!is_sensitive_sql("SELECT 1"));
        assert!(!is_sensitive_sql("set session sql_mode = ''"));
        assert!(!is_sensitive_sql("CREATE TABLE grant_log (id int)"));
        assert!(!is_sensitive_sql("LOAD_FILE('/etc/hosts')"));
        assert!(!is_sensitive_sql(""));
        assert!(!is_sensitive_sql("   "));
    }

    #[test]
    fn comments_are_skipped() {
        assert!(is_sensitive_sql("/* audit */ GRANT SELECT ON d.* TO u"));
        assert!(is_sensitive_sql("-- note\nset PASSWORD for u = 'x'"));
        assert!(is_sensitive_sql("# note\nBACKUP DATABASE d TO 'local:///tmp'"));
        assert!(!is_sensitive_sql("/* GRANT */ SELECT 1"));
    }

    #[test]
    fn read_only_classification() {
        assert!(is_read_only_sql("SELECT * FROM t"));
        assert!(is_read_only_sql("show databases"));
        assert!(is_read_only_sql("EXPLAIN SELECT 1"));
        assert!(is_read_only_sql("use test"));
        assert!(!is_read_only_sql("INSERT INTO t VALUES (1)"));
        assert!(!is_read_only_sql("DELETE FROM t"));
        assert!(!is_read_only_sql(""));
    }
}
