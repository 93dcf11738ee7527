//! Query shapes understood by the file-system adapter.
//!
//! Three shapes are recognised: path expressions (`$[*]`, `$.*`, `$.x[*]`,
//! `$[?(@.field == 'v')]`), conditional selects (`SELECT * [WHERE f = :p]`)
//! and file globs. Anything a shape cannot evaluate yields no rows.

use std::sync::LazyLock;

use apex_data_core::{DataSourceError, Params, Record, Result, Value};
use regex::Regex;

use crate::adapters::substitute_braces;

static FILTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[\?\(@\.([\w.\-]+)\s*==\s*(?:'([^']*)'|"([^"]*)"|([^)\s]+))\s*\)\]"#)
        .expect("static regex compiles")
});

static FIELD_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\.([\w\-]+)\[\*\]$").expect("static regex compiles"));

static WHERE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWHERE\s+([\w.\-]+)\s*=\s*(?::(\w+)|'([^']*)'|(\S+))")
        .expect("static regex compiles")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FileQuery {
    PathExpression(String),
    Select(String),
    Glob(String),
}

impl FileQuery {
    pub(crate) fn parse(query: &str, params: &Params) -> Self {
        let query = query.trim();
        if query.starts_with("$.") || query.starts_with("$[") {
            return Self::PathExpression(substitute_braces(query, params));
        }
        if query
            .get(..6)
            .is_some_and(|head| head.eq_ignore_ascii_case("SELECT"))
        {
            return Self::Select(query.to_string());
        }
        Self::Glob(query.to_string())
    }
}

/// Evaluates a path expression against the records of one file.
pub(crate) fn path_expression(records: &[Record], expression: &str) -> Vec<Record> {
    if let Some(filter) = FILTER.captures(expression) {
        let field = &filter[1];
        let Some(expected) = filter.get(2).or(filter.get(3)).or(filter.get(4)) else {
            return Vec::new();
        };
        return records
            .iter()
            .filter(|r| r.get(field).is_some_and(|v| !v.is_null() && v.matches_text(expected.as_str())))
            .cloned()
            .collect();
    }
    if expression == "$[*]" || expression == "$.*" {
        return records.to_vec();
    }
    if let Some(field) = FIELD_ARRAY.captures(expression) {
        // A document wrapping the array under `field`, else the rows themselves.
        if let [single] = records {
            if let Some(Value::Array(items)) = single.get(&field[1]) {
                return items
                    .iter()
                    .filter_map(|item| item.as_map().cloned())
                    .collect();
            }
        }
        return records.to_vec();
    }
    Vec::new()
}

/// Evaluates `SELECT ... [WHERE field = :param | 'literal']`. A parameter
/// with no bound value matches nothing.
pub(crate) fn select(records: &[Record], sql: &str, params: &Params) -> Vec<Record> {
    let Some(condition) = WHERE.captures(sql) else {
        if sql.to_ascii_uppercase().contains("WHERE") {
            return Vec::new();
        }
        return records.to_vec();
    };
    let field = &condition[1];
    let expected = match (condition.get(2), condition.get(3), condition.get(4)) {
        (Some(name), _, _) => match params.get(name.as_str()) {
            Some(value) if !value.is_null() => value.to_plain_string(),
            _ => return Vec::new(),
        },
        (None, Some(literal), _) | (None, None, Some(literal)) => literal.as_str().to_string(),
        _ => return Vec::new(),
    };
    records
        .iter()
        .filter(|r| r.get(field).is_some_and(|v| !v.is_null() && v.matches_text(&expected)))
        .cloned()
        .collect()
}

/// Compiles a file-name glob (`*`, `?`, `[abc]`, `{a,b}`) into an anchored
/// regex.
pub(crate) fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    let mut in_alternation = false;
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '{' => {
                in_alternation = true;
                out.push_str("(?:");
            }
            '}' if in_alternation => {
                in_alternation = false;
                out.push(')');
            }
            ',' if in_alternation => out.push('|'),
            '[' => {
                out.push('[');
                for class in chars.by_ref() {
                    if class == ']' {
                        break;
                    }
                    if class == '\\' {
                        out.push('\\');
                    }
                    out.push(class);
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| {
        DataSourceError::configuration(format!("Invalid file pattern '{pattern}': {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Record> {
        vec![
            Record::from([("id".to_string(), Value::Int(1)), ("name".to_string(), Value::from("ada"))]),
            Record::from([("id".to_string(), Value::Int(2)), ("name".to_string(), Value::from("grace"))]),
        ]
    }

    #[test]
    fn classifies_query_shapes() {
        let mut params = Params::new();
        params.insert("id".into(), Value::Int(2));
        assert_eq!(
            FileQuery::parse("$[?(@.id == '{id}')]", &params),
            FileQuery::PathExpression("$[?(@.id == '2')]".into())
        );
        assert!(matches!(FileQuery::parse("select * where id = :id", &params), FileQuery::Select(_)));
        assert_eq!(FileQuery::parse("*.csv", &params), FileQuery::Glob("*.csv".into()));
    }

    #[test]
    fn path_expressions() {
        let data = rows();
        assert_eq!(path_expression(&data, "$[*]").len(), 2);
        assert_eq!(path_expression(&data, "$.*").len(), 2);
        let hit = path_expression(&data, "$[?(@.name == 'grace')]");
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0]["id"], Value::Int(2));
        assert_eq!(path_expression(&data, "$.users[?(@.id == 1)]").len(), 1);
        assert!(path_expression(&data, "$..name").is_empty());

        let wrapped = vec![Record::from([(
            "users".to_string(),
            Value::Array(data.iter().cloned().map(Value::Map).collect()),
        )])];
        assert_eq!(path_expression(&wrapped, "$.users[*]").len(), 2);
    }

    #[test]
    fn select_filters() {
        let data = rows();
        let mut params = Params::new();
        params.insert("name".into(), Value::from("ada"));
        assert_eq!(select(&data, "SELECT *", &params).len(), 2);
        assert_eq!(select(&data, "SELECT * WHERE name = :name", &params).len(), 1);
        assert_eq!(select(&data, "select * where id = '2'", &params).len(), 1);
        assert!(select(&data, "SELECT * WHERE name = :missing", &params).is_empty());
    }

    #[test]
    fn globs() {
        let re = glob_regex("orders-*.{csv,json}").unwrap();
        assert!(re.is_match("orders-2024.csv"));
        assert!(re.is_match("orders-.json"));
        assert!(!re.is_match("orders-2024.xml"));
        assert!(!re.is_match("xorders-1.csv"));
        assert!(glob_regex("file?.[ct]xt").unwrap().is_match("file1.txt"));
    }
}
