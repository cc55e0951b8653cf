//! Statement classification for event enrichment.
//!
//! Only the leading keyword and the primary table are looked at; statements
//! are never validated.

use once_cell::sync::Lazy;
use regex::Regex;

/// SQL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Drop,
    Alter,
    Truncate,
    Call,
    Begin,
    Commit,
    Rollback,
    Set,
    Other,
}

impl SqlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Merge => "MERGE",
            SqlOperation::Create => "CREATE",
            SqlOperation::Drop => "DROP",
            SqlOperation::Alter => "ALTER",
            SqlOperation::Truncate => "TRUNCATE",
            SqlOperation::Call => "CALL",
            SqlOperation::Begin => "BEGIN",
            SqlOperation::Commit => "COMMIT",
            SqlOperation::Rollback => "ROLLBACK",
            SqlOperation::Set => "SET",
            SqlOperation::Other => "QUERY",
        }
    }
}

impl std::fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const KEYWORDS: &[(&str, SqlOperation)] = &[
    ("SELECT", SqlOperation::Select),
    ("WITH", SqlOperation::Select),
    ("VALUES", SqlOperation::Select),
    ("INSERT", SqlOperation::Insert),
    ("REPLACE", SqlOperation::Insert),
    ("UPSERT", SqlOperation::Insert),
    ("UPDATE", SqlOperation::Update),
    ("DELETE", SqlOperation::Delete),
    ("MERGE", SqlOperation::Merge),
    ("CREATE", SqlOperation::Create),
    ("DROP", SqlOperation::Drop),
    ("ALTER", SqlOperation::Alter),
    ("TRUNCATE", SqlOperation::Truncate),
    ("CALL", SqlOperation::Call),
    ("EXEC", SqlOperation::Call),
    ("BEGIN", SqlOperation::Begin),
    ("START", SqlOperation::Begin),
    ("COMMIT", SqlOperation::Commit),
    ("END", SqlOperation::Commit),
    ("ROLLBACK", SqlOperation::Rollback),
    ("SET", SqlOperation::Set),
];

// One identifier, optionally quoted and schema-qualified; group 1 is the table.
const IDENT: &str = r#"(?:[`"\[]?\w+[`"\]]?\.)?[`"\[]?(\w+)[`"\]]?"#;

static TABLE_PATTERNS: Lazy<Vec<(SqlOperation, Regex)>> = Lazy::new(|| {
    [
        (SqlOperation::Select, r"\bFROM\s+"),
        (SqlOperation::Insert, r"\b(?:INSERT|REPLACE|UPSERT)\s+(?:OR\s+\w+\s+)?INTO\s+"),
        (SqlOperation::Update, r"\bUPDATE\s+(?:ONLY\s+)?"),
        (SqlOperation::Delete, r"\bDELETE\s+FROM\s+"),
        (SqlOperation::Merge, r"\bMERGE\s+INTO\s+"),
        (
            SqlOperation::Create,
            r"\bCREATE\s+(?:TEMP(?:ORARY)?\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?",
        ),
        (SqlOperation::Drop, r"\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?"),
        (SqlOperation::Alter, r"\bALTER\s+TABLE\s+"),
        (SqlOperation::Truncate, r"\bTRUNCATE\s+(?:TABLE\s+)?"),
    ]
    .into_iter()
    .map(|(op, prefix)| {
        let pattern = format!("(?i){prefix}{IDENT}");
        (op, Regex::new(&pattern).expect("table pattern is valid"))
    })
    .collect()
});

/// Strip leading whitespace, `--` line comments and `/* */` block comments.
fn skip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |i| &after[i + 1..]).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]).trim_start();
        } else {
            return rest;
        }
    }
}

/// Parse the SQL operation type from a query string.
pub fn parse_operation(sql: &str) -> SqlOperation {
    let body = skip_leading_comments(sql);
    let word: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    KEYWORDS
        .iter()
        .find(|(keyword, _)| *keyword == word)
        .map_or(SqlOperation::Other, |(_, op)| *op)
}

/// Extract the primary table name, lowercased.
pub fn extract_table(sql: &str) -> Option<String> {
    let operation = parse_operation(sql);
    let (_, regex) = TABLE_PATTERNS.iter().find(|(op, _)| *op == operation)?;

    regex
        .captures(skip_leading_comments(sql))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Operation and table of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    pub operation: SqlOperation,
    pub table: Option<String>,
}

impl ParsedSql {
    pub fn parse(sql: &str) -> Self {
        Self {
            operation: parse_operation(sql),
            table: extract_table(sql),
        }
    }

    /// Short label: `"{OPERATION} {table}"` or `"{OPERATION}"`.
    pub fn label(&self) -> String {
        match &self.table {
            Some(table) => format!("{} {}", self.operation.as_str(), table),
            None => self.operation.as_str().to_string(),
        }
    }
}
