use std::collections::HashSet;

/// Longest identifier kept, suffixes included
const MAX_IDENTIFIER_LEN: usize = 63;

/// SQLite keywords; a column may not be named after any of them
const RESERVED_WORDS: &[&str] = &[
    "abort", "action", "add", "after", "all", "alter", "always", "analyze", "and", "as", "asc",
    "attach", "autoincrement", "before", "begin", "between", "by", "cascade", "case", "cast",
    "check", "collate", "column", "commit", "conflict", "constraint", "create", "cross",
    "current", "current_date", "current_time", "current_timestamp", "database", "default",
    "deferrable", "deferred", "delete", "desc", "detach", "distinct", "do", "drop", "each",
    "else", "end", "escape", "except", "exclude", "exclusive", "exists", "explain", "fail",
    "filter", "first", "following", "for", "foreign", "from", "full", "generated", "glob",
    "group", "groups", "having", "if", "ignore", "immediate", "in", "index", "indexed",
    "initially", "inner", "insert", "instead", "intersect", "into", "is", "isnull", "join",
    "key", "last", "left", "like", "limit", "match", "materialized", "natural", "no", "not",
    "nothing", "notnull", "null", "nulls", "of", "offset", "on", "or", "order", "others",
    "outer", "over", "partition", "plan", "pragma", "preceding", "primary", "query", "raise",
    "range", "recursive", "references", "regexp", "reindex", "release", "rename", "replace",
    "restrict", "returning", "right", "rollback", "row", "rows", "savepoint", "select", "set",
    "table", "temp", "temporary", "then", "ties", "to", "transaction", "trigger", "truncate",
    "unbounded", "union", "unique", "update", "using", "vacuum", "values", "view", "virtual",
    "when", "where", "window", "with", "without",
];

/// Words the query parser reads as special expression syntax or literals
/// rather than identifiers, even though SQLite accepts them as column names
const PARSER_KEYWORDS: &[&str] = &[
    "ceil", "convert", "current_user", "extract", "false", "floor", "interval", "listagg",
    "localtime", "localtimestamp", "overlay", "position", "safe_cast", "session_user",
    "substring", "trim", "true", "try_cast",
];

pub fn is_reserved(word: &str) -> bool {
    let word = word.to_ascii_lowercase();
    RESERVED_WORDS.contains(&word.as_str()) || PARSER_KEYWORDS.contains(&word.as_str())
}

/// Turn one header cell into a safe column identifier. `position` is the
/// 1-based column position, used when nothing usable remains.
pub fn sanitize(raw: &str, position: usize) -> String {
    let mut name = String::with_capacity(raw.len());
    let mut pending_underscore = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_underscore && !name.is_empty() {
                name.push('_');
            }
            pending_underscore = false;
            name.push(ch.to_ascii_lowercase());
        } else {
            pending_underscore = true;
        }
    }

    if name.is_empty() {
        return format!("column_{}", position);
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "c_");
    }
    name.truncate(MAX_IDENTIFIER_LEN);
    if is_reserved(&name) {
        name.push_str("_col");
    }
    name
}

/// Sanitize a header row, disambiguating collisions with `_2`, `_3`, ...
/// in order of appearance
pub fn sanitize_all<'a, I>(headers: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut taken: HashSet<String> = HashSet::new();
    let mut names = Vec::new();

    for (idx, raw) in headers.into_iter().enumerate() {
        let base = sanitize(raw, idx + 1);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while taken.contains(&candidate) {
            let tail = format!("_{}", suffix);
            let mut stem = base.clone();
            stem.truncate(MAX_IDENTIFIER_LEN - tail.len());
            candidate = format!("{}{}", stem, tail);
            suffix += 1;
        }
        taken.insert(candidate.clone());
        names.push(candidate);
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize("First Name", 1), "first_name");
        assert_eq!(sanitize("  Amount ($) ", 2), "amount");
        assert_eq!(sanitize("e-mail__address", 3), "e_mail_address");
        assert_eq!(sanitize("id", 4), "id");
    }

    #[test]
    fn test_sanitize_fallbacks() {
        assert_eq!(sanitize("", 3), "column_3");
        assert_eq!(sanitize("???", 1), "column_1");
        assert_eq!(sanitize("名前", 2), "column_2");
        assert_eq!(sanitize("2024 sales", 1), "c_2024_sales");
    }

    #[test]
    fn test_reserved_words_get_suffix() {
        assert_eq!(sanitize("Select", 1), "select_col");
        assert_eq!(sanitize("order", 1), "order_col");
        assert_eq!(sanitize("delete", 1), "delete_col");
        assert_eq!(sanitize("ordered", 1), "ordered");
        assert_eq!(sanitize("Trim", 1), "trim_col");
        assert_eq!(sanitize("position", 1), "position_col");
        assert_eq!(sanitize("trimmed", 1), "trimmed");
    }

    #[test]
    fn test_sanitized_reserved_words_are_queryable() {
        for word in RESERVED_WORDS.iter().chain(PARSER_KEYWORDS) {
            let column = sanitize(word, 1);
            let sql = format!("SELECT {c} FROM t WHERE {c} IS NOT NULL ORDER BY {c}", c = column);
            assert!(
                crate::validation::SqlValidator::validate_and_prepare(&sql, "t", 10).is_ok(),
                "column {} is not usable in a query",
                column
            );
        }
    }

    #[test]
    fn test_long_names_truncated() {
        let name = sanitize(&"x".repeat(200), 1);
        assert_eq!(name.len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn test_duplicates_are_suffixed_in_order() {
        let names = sanitize_all(["Name", "name", "NAME", "name_2"]);
        assert_eq!(names, vec!["name", "name_2", "name_3", "name_2_2"]);
    }

    #[test]
    fn test_blank_duplicates() {
        let names = sanitize_all(["", "a", ""]);
        assert_eq!(names, vec!["column_1", "a", "column_3"]);
    }
}
