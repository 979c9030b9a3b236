//! Input gates applied before anything reaches a remote engine.
//!
//! The SQL gate is a textual denylist, not a parser. It over-blocks (a keyword
//! inside a string literal or a quoted identifier is still rejected) and
//! under-blocks (`EXECUTE`, `MERGE`, `sp_*` procedures pass). It keeps an agent
//! from casually mutating a warehouse; it is not a security boundary.

use regex::Regex;
use std::sync::OnceLock;

pub const FORBIDDEN_SQL_KEYWORDS: [&str; 8] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "EXEC",
];

fn forbidden_sql_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = FORBIDDEN_SQL_KEYWORDS.join("|");
        Regex::new(&format!(r"(?i)\b({alternation})\b")).expect("static keyword regex")
    })
}

/// Reject statements mentioning any forbidden keyword as a whole word.
pub fn check_sql(query: &str) -> Result<(), String> {
    if query.trim().is_empty() {
        return Err("query required".to_string());
    }
    match forbidden_sql_regex().find(query) {
        Some(m) => Err(format!(
            "Query contains forbidden keyword: {}",
            m.as_str().to_ascii_uppercase()
        )),
        None => Ok(()),
    }
}

/// DAX queries are never rewritten: anything not starting with EVALUATE is refused.
pub fn check_dax_query(query: &str) -> Result<(), String> {
    let trimmed = query.trim_start();
    let starts = trimmed
        .get(..8)
        .is_some_and(|head| head.eq_ignore_ascii_case("EVALUATE"));
    if starts {
        Ok(())
    } else {
        Err("DAX query must start with EVALUATE".to_string())
    }
}

/// Split `schema.table`. Exactly one dot, both halves non-empty.
pub fn split_schema_table(input: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = input.trim().split('.').collect();
    match parts.as_slice() {
        [schema, table] if !schema.trim().is_empty() && !table.trim().is_empty() => {
            Ok((schema.trim().to_string(), table.trim().to_string()))
        }
        _ => Err("Table must be in format schema.table".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_after_select_is_rejected() {
        let err = check_sql("SELECT * FROM t; DROP TABLE t;").unwrap_err();
        assert_eq!(err, "Query contains forbidden keyword: DROP");
        assert!(check_sql("SELECT * FROM t").is_ok());
    }

    #[test]
    fn keywords_match_case_insensitively_as_words() {
        assert!(check_sql("select 1; delete from t").is_err());
        assert!(check_sql("EXEC sp_who").is_err());
        // Column names that merely contain a keyword pass.
        assert!(check_sql("SELECT created_at, last_update FROM t").is_ok());
        // Known gap: EXECUTE is not on the list.
        assert!(check_sql("EXECUTE sp_who").is_ok());
        // Known over-block: keyword inside a string literal.
        assert!(check_sql("SELECT * FROM t WHERE note = 'drop'").is_err());
    }

    #[test]
    fn dax_must_start_with_evaluate() {
        assert!(check_dax_query("  evaluate Sales").is_ok());
        assert!(check_dax_query("EVALUATE\nROW(\"x\", 1)").is_ok());
        assert!(check_dax_query("SUMMARIZE(Sales)").is_err());
        assert!(check_dax_query("DEFINE MEASURE Sales[x] = 1 EVALUATE Sales").is_err());
        assert!(check_dax_query("EVAL").is_err());
        assert!(check_dax_query("").is_err());
    }

    #[test]
    fn schema_table_format() {
        assert_eq!(split_schema_table("dbo.Sales").unwrap(), ("dbo".into(), "Sales".into()));
        assert!(split_schema_table("Sales").is_err());
        assert!(split_schema_table("a.b.c").is_err());
        assert!(split_schema_table(".Sales").is_err());
    }
}
