use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, LimitClause, ObjectName, ObjectNamePart, Query, Statement, TableFactor, UnaryOperator,
    Value, ValueWithSpan, Visit, Visitor,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer, Whitespace};
use thiserror::Error;

/// Words that may never appear as bare tokens in candidate SQL
const DISALLOWED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "ATTACH", "DETACH", "PRAGMA",
    "VACUUM", "REPLACE", "TRUNCATE", "REINDEX",
];

/// Reason a candidate statement was rejected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    EmptyQuery,
    ParseError,
    MultipleStatements,
    NotSelect,
    DisallowedKeyword,
    ForeignTable,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationCode::EmptyQuery => "EMPTY_QUERY",
            ViolationCode::ParseError => "PARSE_ERROR",
            ViolationCode::MultipleStatements => "MULTIPLE_STATEMENTS",
            ViolationCode::NotSelect => "NOT_SELECT",
            ViolationCode::DisallowedKeyword => "DISALLOWED_KEYWORD",
            ViolationCode::ForeignTable => "FOREIGN_TABLE",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct SafetyViolation {
    pub code: ViolationCode,
    pub message: String,
}

impl SafetyViolation {
    pub fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// SQL accepted for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql {
    pub sql: String,
    /// True when the LIMIT was injected or lowered to the row cap
    pub limit_applied: bool,
}

/// SQL validation service for ensuring candidate queries are safe to run
/// against a single dataset table
pub struct SqlValidator;

impl SqlValidator {
    /// Run the full policy and return the SQL to execute.
    ///
    /// Checks run in order and the first failure is returned: single
    /// statement, leading `SELECT`/`WITH`, no disallowed keyword tokens, only
    /// the session table (or CTEs) referenced. Accepted SQL gets a LIMIT no
    /// larger than `row_cap`.
    pub fn validate_and_prepare(
        sql: &str,
        table_name: &str,
        row_cap: u64,
    ) -> Result<ValidatedSql, SafetyViolation> {
        let result = Self::check_tokens(sql)
            .and_then(|statement_sql| {
                let statement = Self::validate_select_only(statement_sql)?;
                Self::check_relations(&statement, table_name)?;
                Self::ensure_limit(statement_sql, statement, row_cap)
            });

        match &result {
            Ok(validated) => {
                tracing::debug!(
                    limit_applied = validated.limit_applied,
                    "Candidate SQL accepted: {}",
                    validated.sql
                );
            }
            Err(violation) => {
                tracing::info!(code = %violation.code, sql_len = sql.len(), "Candidate SQL rejected");
                tracing::debug!("Rejected SQL preview: {}", preview(sql));
            }
        }

        result
    }

    /// Token-level checks. Returns the statement text with any trailing
    /// terminator removed.
    fn check_tokens(sql: &str) -> Result<&str, SafetyViolation> {
        let dialect = SQLiteDialect {};
        let tokens = Tokenizer::new(&dialect, sql)
            .tokenize_with_location()
            .map_err(|e| SafetyViolation::new(ViolationCode::ParseError, format!("SQL could not be tokenized: {}", e)))?;

        let significant: Vec<&TokenWithSpan> = tokens.iter().filter(|t| is_significant(&t.token)).collect();
        if significant.is_empty() {
            return Err(SafetyViolation::new(ViolationCode::EmptyQuery, "Empty SQL query"));
        }

        // A separator followed by anything significant starts a second statement
        let mut statement_end = sql.len();
        for (idx, token) in significant.iter().enumerate() {
            if token.token == Token::SemiColon {
                if idx + 1 < significant.len() {
                    return Err(SafetyViolation::new(
                        ViolationCode::MultipleStatements,
                        "Only a single SQL statement is allowed",
                    ));
                }
                statement_end = byte_offset(sql, token.span.start);
            }
        }

        match &significant[0].token {
            Token::Word(word)
                if word.quote_style.is_none()
                    && (word.value.eq_ignore_ascii_case("SELECT") || word.value.eq_ignore_ascii_case("WITH")) => {}
            _ => {
                return Err(SafetyViolation::new(
                    ViolationCode::NotSelect,
                    "Only SELECT queries are permitted",
                ))
            }
        }

        for (idx, token) in significant.iter().enumerate() {
            let Token::Word(word) = &token.token else {
                continue;
            };
            if word.quote_style.is_some() {
                continue;
            }
            let upper = word.value.to_ascii_uppercase();
            if !DISALLOWED_KEYWORDS.contains(&upper.as_str()) {
                continue;
            }
            // replace(x, y, z) is a scalar function, not the REPLACE statement
            let is_call = matches!(significant.get(idx + 1).map(|t| &t.token), Some(Token::LParen));
            if upper == "REPLACE" && is_call {
                continue;
            }
            return Err(SafetyViolation::new(
                ViolationCode::DisallowedKeyword,
                format!("{} is not allowed. Only SELECT queries are permitted.", upper),
            ));
        }

        Ok(sql[..statement_end].trim())
    }

    /// Parse SQL and ensure it is exactly one query statement
    pub fn validate_select_only(sql: &str) -> Result<Statement, SafetyViolation> {
        let dialect = SQLiteDialect {};
        let mut ast = Parser::parse_sql(&dialect, sql)
            .map_err(|e| SafetyViolation::new(ViolationCode::ParseError, format!("SQL parsing error: {}", e)))?;

        if ast.is_empty() {
            return Err(SafetyViolation::new(ViolationCode::EmptyQuery, "Empty SQL query"));
        }
        if ast.len() > 1 {
            return Err(SafetyViolation::new(
                ViolationCode::MultipleStatements,
                "Only a single SQL statement is allowed",
            ));
        }

        match ast.remove(0) {
            statement @ Statement::Query(_) => Ok(statement),
            _ => Err(SafetyViolation::new(
                ViolationCode::NotSelect,
                "Only SELECT queries are permitted",
            )),
        }
    }

    /// Reject references to anything other than the session table or CTEs
    /// visible at the point of reference
    fn check_relations(statement: &Statement, table_name: &str) -> Result<(), SafetyViolation> {
        let mut guard = RelationGuard::new(table_name);
        match statement.visit(&mut guard) {
            ControlFlow::Break(violation) => Err(violation),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    /// Ensure the query's LIMIT is present and no larger than `row_cap`.
    /// A literal LIMIT at or below the cap is left untouched.
    pub fn ensure_limit(
        sql: &str,
        mut statement: Statement,
        row_cap: u64,
    ) -> Result<ValidatedSql, SafetyViolation> {
        let Statement::Query(query) = &mut statement else {
            return Err(SafetyViolation::new(
                ViolationCode::NotSelect,
                "Only SELECT queries are permitted",
            ));
        };

        if Self::limit_within_cap(query, row_cap) {
            return Ok(ValidatedSql {
                sql: sql.to_string(),
                limit_applied: false,
            });
        }

        let cap = Expr::value(Value::Number(row_cap.to_string(), false));
        query.limit_clause = Some(match query.limit_clause.take() {
            Some(LimitClause::LimitOffset { offset, limit_by, .. }) => LimitClause::LimitOffset {
                limit: Some(cap),
                offset,
                limit_by,
            },
            Some(LimitClause::OffsetCommaLimit { offset, .. }) => LimitClause::OffsetCommaLimit { offset, limit: cap },
            None => LimitClause::LimitOffset {
                limit: Some(cap),
                offset: None,
                limit_by: vec![],
            },
        });

        Ok(ValidatedSql {
            sql: statement.to_string(),
            limit_applied: true,
        })
    }

    /// Check the top-level LIMIT using the AST, so identifiers or comments
    /// containing "limit" are never mistaken for a clause
    fn limit_within_cap(query: &Query, row_cap: u64) -> bool {
        let limit = match &query.limit_clause {
            Some(LimitClause::LimitOffset { limit: Some(limit), .. }) => limit,
            Some(LimitClause::OffsetCommaLimit { limit, .. }) => limit,
            _ => return false,
        };
        literal_limit(limit).is_some_and(|value| value <= row_cap)
    }
}

/// Literal non-negative LIMIT value, if the expression is one
fn literal_limit(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(ValueWithSpan {
            value: Value::Number(number, _),
            ..
        }) => number.parse::<u64>().ok(),
        Expr::Nested(inner) => literal_limit(inner),
        Expr::UnaryOp {
            op: UnaryOperator::Plus,
            expr,
        } => literal_limit(expr),
        _ => None,
    }
}

/// Walks a statement and stops at the first relation that is neither the
/// session table nor a CTE in scope. CTE names are pushed when their query is
/// entered and popped when it is left, so a name declared in a subquery does
/// not cover relations outside it.
struct RelationGuard {
    table: String,
    display_name: String,
    scopes: Vec<HashSet<String>>,
}

impl RelationGuard {
    fn new(table_name: &str) -> Self {
        Self {
            table: table_name.to_ascii_lowercase(),
            display_name: table_name.to_string(),
            scopes: Vec::new(),
        }
    }

    fn in_scope(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn is_allowed(&self, relation: &ObjectName) -> bool {
        match name_parts(relation).as_slice() {
            [name] => *name == self.table || self.in_scope(name),
            [schema, name] => schema == "main" && *name == self.table,
            _ => false,
        }
    }
}

impl Visitor for RelationGuard {
    type Break = SafetyViolation;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let names = query
            .with
            .iter()
            .flat_map(|with| with.cte_tables.iter())
            .map(|cte| cte.alias.name.value.to_ascii_lowercase())
            .collect();
        self.scopes.push(names);
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.scopes.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if self.is_allowed(relation) {
            return ControlFlow::Continue(());
        }
        ControlFlow::Break(SafetyViolation::new(
            ViolationCode::ForeignTable,
            format!("Only the table {} may be queried", self.display_name),
        ))
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        let function = match table_factor {
            TableFactor::Table { name, args: Some(_), .. } | TableFactor::Function { name, .. } => {
                name.to_string()
            }
            TableFactor::TableFunction { .. } => "TABLE(...)".to_string(),
            _ => return ControlFlow::Continue(()),
        };
        ControlFlow::Break(SafetyViolation::new(
            ViolationCode::ForeignTable,
            format!("Table-valued function {} is not allowed", function),
        ))
    }
}

fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(ident) => ident.value.to_ascii_lowercase(),
            #[allow(unreachable_patterns)]
            other => other.to_string().to_ascii_lowercase(),
        })
        .collect()
}

fn is_significant(token: &Token) -> bool {
    !matches!(
        token,
        Token::Whitespace(
            Whitespace::Space
                | Whitespace::Tab
                | Whitespace::Newline
                | Whitespace::SingleLineComment { .. }
                | Whitespace::MultiLineComment(_)
        ) | Token::EOF
    )
}

/// Byte offset of a 1-based tokenizer location
fn byte_offset(sql: &str, location: Location) -> usize {
    let (mut line, mut column) = (1u64, 1u64);
    for (idx, ch) in sql.char_indices() {
        if line == location.line && column == location.column {
            return idx;
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    sql.len()
}

fn preview(sql: &str) -> String {
    let mut preview: String = sql.chars().take(80).collect();
    if preview.len() < sql.len() {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: u64 = 1000;

    fn check(sql: &str) -> Result<ValidatedSql, SafetyViolation> {
        SqlValidator::validate_and_prepare(sql, "t", CAP)
    }

    fn code(sql: &str) -> ViolationCode {
        check(sql).unwrap_err().code
    }

    #[test]
    fn test_validate_select_only() {
        assert!(SqlValidator::validate_select_only("SELECT * FROM users").is_ok());
        assert!(SqlValidator::validate_select_only("INSERT INTO users VALUES (1)").is_err());
        assert!(SqlValidator::validate_select_only("UPDATE users SET name = 'test'").is_err());
        assert!(SqlValidator::validate_select_only("DELETE FROM users").is_err());
    }

    #[test]
    fn test_rejects_multiple_statements() {
        assert_eq!(code("SELECT * FROM t; DROP TABLE t;"), ViolationCode::MultipleStatements);
        assert_eq!(code("SELECT 1 FROM t;SELECT 2 FROM t"), ViolationCode::MultipleStatements);
    }

    #[test]
    fn test_trailing_terminator_is_stripped() {
        let validated = check("SELECT id FROM t LIMIT 5;  -- done").unwrap();
        assert_eq!(validated.sql, "SELECT id FROM t LIMIT 5");
        assert!(!validated.limit_applied);
    }

    #[test]
    fn test_semicolon_inside_literal_or_comment_is_fine() {
        assert!(check("SELECT name FROM t WHERE name = 'a;b'").is_ok());
        assert!(check("SELECT name /* x; y */ FROM t").is_ok());
    }

    #[test]
    fn test_must_start_with_select_or_with() {
        assert_eq!(code("EXPLAIN SELECT * FROM t"), ViolationCode::NotSelect);
        assert_eq!(code("VALUES (1)"), ViolationCode::NotSelect);
        assert!(check("  -- leading comment\n select * from t").is_ok());
        assert!(check("WITH x AS (SELECT id FROM t) SELECT * FROM x").is_ok());
    }

    #[test]
    fn test_disallowed_keywords_as_whole_tokens() {
        for keyword in ["DELETE", "drop", "Pragma", "ATTACH", "vacuum", "TRUNCATE"] {
            let sql = format!("SELECT * FROM t WHERE id IN (SELECT 1) {} x", keyword);
            assert_eq!(code(&sql), ViolationCode::DisallowedKeyword, "{}", keyword);
        }
        assert_eq!(
            code("WITH x AS (SELECT 1) DELETE FROM t"),
            ViolationCode::DisallowedKeyword
        );
    }

    #[test]
    fn test_keyword_substrings_do_not_trigger() {
        assert!(check("SELECT deleted_at, created_by, update_count FROM t").is_ok());
        assert!(check("SELECT \"delete\" FROM t").is_ok());
    }

    #[test]
    fn test_keyword_inside_string_literal_is_accepted() {
        let validated = check("SELECT name FROM t WHERE name = 'DELETE'").unwrap();
        assert!(validated.sql.contains("'DELETE'"));
        assert!(validated.sql.contains("LIMIT 1000"));
    }

    #[test]
    fn test_replace_function_is_allowed() {
        assert!(check("SELECT replace(name, 'a', 'b') FROM t").is_ok());
        assert_eq!(code("REPLACE INTO t VALUES (1)"), ViolationCode::NotSelect);
    }

    #[test]
    fn test_foreign_tables_rejected() {
        assert_eq!(code("SELECT * FROM other"), ViolationCode::ForeignTable);
        assert_eq!(code("SELECT * FROM sqlite_master"), ViolationCode::ForeignTable);
        assert_eq!(
            code("SELECT * FROM t JOIN ds_abc ON t.id = ds_abc.id"),
            ViolationCode::ForeignTable
        );
        assert_eq!(
            code("SELECT * FROM t WHERE id IN (SELECT id FROM secrets)"),
            ViolationCode::ForeignTable
        );
        assert_eq!(code("SELECT * FROM temp.t"), ViolationCode::ForeignTable);
    }

    #[test]
    fn test_own_table_and_ctes_accepted() {
        assert!(check("SELECT * FROM T").is_ok());
        assert!(check("SELECT * FROM main.t").is_ok());
        assert!(check("SELECT a.id FROM t AS a JOIN t AS b ON a.id = b.id").is_ok());
        assert!(check("WITH ranked AS (SELECT id FROM t ORDER BY id) SELECT * FROM ranked").is_ok());
        assert!(check(
            "WITH a AS (SELECT id FROM t), b AS (SELECT id FROM a) SELECT * FROM b WHERE id IN (SELECT id FROM a)"
        )
        .is_ok());
        assert!(check(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5) SELECT x FROM n"
        )
        .is_ok());
    }

    #[test]
    fn test_cte_in_subquery_does_not_cover_outer_relations() {
        assert_eq!(
            code(
                "SELECT sql FROM sqlite_master WHERE name IN \
                 (WITH sqlite_master AS (SELECT 1 AS name) SELECT name FROM sqlite_master)"
            ),
            ViolationCode::ForeignTable
        );
        assert_eq!(
            code(
                "SELECT * FROM other_table CROSS JOIN \
                 (WITH other_table AS (SELECT 1) SELECT * FROM other_table)"
            ),
            ViolationCode::ForeignTable
        );
        assert_eq!(
            code("SELECT * FROM (WITH x AS (SELECT id FROM t) SELECT * FROM x) JOIN x ON 1 = 1"),
            ViolationCode::ForeignTable
        );
    }

    #[test]
    fn test_limit_injected_when_missing() {
        let validated = check("SELECT * FROM t").unwrap();
        assert!(validated.sql.ends_with("LIMIT 1000"));
        assert!(validated.limit_applied);
    }

    #[test]
    fn test_limit_lowered_when_above_cap() {
        let validated = check("SELECT * FROM t LIMIT 50000 OFFSET 10").unwrap();
        assert!(validated.sql.contains("LIMIT 1000"));
        assert!(validated.sql.contains("OFFSET 10"));
        assert!(!validated.sql.contains("50000"));
        assert!(validated.limit_applied);
    }

    #[test]
    fn test_smaller_limit_is_never_raised() {
        let validated = check("SELECT * FROM t LIMIT 50").unwrap();
        assert_eq!(validated.sql, "SELECT * FROM t LIMIT 50");
        assert!(!validated.limit_applied);
    }

    #[test]
    fn test_limit_detection_with_ast() {
        // Identifier containing "limit" is not a LIMIT clause
        let validated = SqlValidator::validate_and_prepare("SELECT limit_value FROM table_limit", "table_limit", CAP).unwrap();
        assert!(validated.sql.contains("LIMIT 1000"));
        assert!(validated.limit_applied);

        // Comment containing LIMIT is not a clause either
        let validated = check("SELECT * FROM t /* LIMIT 5 */").unwrap();
        assert!(validated.sql.contains("LIMIT 1000"));
        assert!(validated.limit_applied);
    }

    #[test]
    fn test_negative_or_expression_limit_is_capped() {
        assert!(check("SELECT * FROM t LIMIT -1").unwrap().sql.contains("LIMIT 1000"));
        assert!(check("SELECT * FROM t LIMIT 10 * 10000").unwrap().sql.contains("LIMIT 1000"));
    }

    #[test]
    fn test_empty_and_unparseable() {
        assert_eq!(code("   "), ViolationCode::EmptyQuery);
        assert_eq!(code("-- nothing here"), ViolationCode::EmptyQuery);
        assert_eq!(code("SELECT * FROM t WHERE name = 'unterminated"), ViolationCode::ParseError);
        assert_eq!(code("SELECT * FROM t WHERE"), ViolationCode::ParseError);
    }

    #[test]
    fn test_table_valued_functions_rejected() {
        assert_eq!(code("SELECT * FROM pragma_table_info('t')"), ViolationCode::ForeignTable);
    }
}
