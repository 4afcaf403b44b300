//! Destructive-SQL detection shared by the migration gate, the planner's
//! task reordering, and the worker's artifact scan.

use std::sync::LazyLock;

use regex::Regex;

static DESTRUCTIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bDROP\s+TABLE\b",
        r"(?i)\bDROP\s+VIEW\b",
        r"(?i)\bDROP\s+INDEX\b",
        r"(?i)\bALTER\s+TABLE\s+.*\bDROP\s+COLUMN\b",
        r"(?i)\bTRUNCATE\s+TABLE\b",
        // DELETE without a WHERE clause
        r"(?i)\bDELETE\s+FROM\s+\w+\s*;",
        r"(?i)\bDELETE\s+FROM\s+\w+\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

/// Whether the SQL text contains a destructive operation.
pub fn is_destructive_sql(sql: &str) -> bool {
    DESTRUCTIVE_PATTERNS.iter().any(|re| re.is_match(sql))
}

/// The destructive statements found in the text, one snippet per match.
pub fn destructive_findings(sql: &str) -> Vec<String> {
    let mut findings = Vec::new();
    for line in sql.lines() {
        if DESTRUCTIVE_PATTERNS.iter().any(|re| re.is_match(line)) {
            findings.push(line.trim().to_string());
        }
    }
    // Multi-line statements can slip past the per-line scan
    if findings.is_empty() && is_destructive_sql(sql) {
        findings.push("(destructive statement spanning multiple lines)".to_string());
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destructive_statements() {
        assert!(is_destructive_sql("DROP TABLE users"));
        assert!(is_destructive_sql("drop view v_orders"));
        assert!(is_destructive_sql("ALTER TABLE t DROP COLUMN legacy"));
        assert!(is_destructive_sql("TRUNCATE TABLE sessions"));
        assert!(is_destructive_sql("DELETE FROM logs;"));
        assert!(is_destructive_sql("DELETE FROM logs"));
    }

    #[test]
    fn test_safe_statements() {
        assert!(!is_destructive_sql("CREATE TABLE users (id TEXT)"));
        assert!(!is_destructive_sql("DELETE FROM logs WHERE age > 30;"));
        assert!(!is_destructive_sql("ALTER TABLE t ADD COLUMN extra TEXT"));
        assert!(!is_destructive_sql("SELECT * FROM drop_zones"));
    }

    #[test]
    fn test_findings_reports_lines() {
        let sql = "CREATE TABLE a (id TEXT);\nDROP TABLE b;\nSELECT 1;";
        let findings = destructive_findings(sql);
        assert_eq!(findings, vec!["DROP TABLE b;".to_string()]);
    }
}
