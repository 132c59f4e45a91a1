//! Expression compiler - user query strings to Elasticsearch filter trees
//!
//! The full query language is an external collaborator; this seam covers
//! the operator core (`==`, `!=`, `&&`, `||`, parentheses) plus `$name`
//! shortcut substitution, and composes the caller's clauses with a user's
//! forced expression and a lastPacket time range.
//!
//! Compile failures are validation errors: background engines treat them
//! as unrunnable/skip conditions, handlers surface them as 403s.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// Field aliases
// ─────────────────────────────────────────────────────────────────────────────

/// Map an expression field to the document fields it queries. Most fields
/// pass through; the fingerprint shorthands expand, and the bare `ip` /
/// `port` forms match either direction.
fn field_targets(field: &str) -> Vec<&str> {
    match field {
        "ip.src" => vec!["srcIp"],
        "ip.dst" => vec!["dstIp"],
        "port.src" => vec!["srcPort"],
        "port.dst" => vec!["dstPort"],
        "ip" => vec!["srcIp", "dstIp"],
        "port" => vec!["srcPort", "dstPort"],
        other => vec![other],
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokenizer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Eq,
    Ne,
    Word(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    bail!("Expected && in expression");
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    bail!("Expected || in expression");
                }
                tokens.push(Token::Or);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    bail!("Expected == in expression");
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    bail!("Expected != in expression");
                }
                tokens.push(Token::Ne);
            }
            '"' => {
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(ch) => word.push(ch),
                        None => bail!("Unterminated string in expression"),
                    }
                }
                tokens.push(Token::Word(word));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | '&' | '|' | '=' | '!') {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                if word.is_empty() {
                    bail!("Unexpected character '{}' in expression", c);
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    lookups: &'a HashMap<String, Vec<String>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    // or_expr := and_expr ('||' and_expr)*
    fn or_expr(&mut self) -> Result<Value> {
        let mut clauses = vec![self.and_expr()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            clauses.push(self.and_expr()?);
        }
        if clauses.len() == 1 {
            Ok(clauses.pop().unwrap())
        } else {
            Ok(json!({ "bool": { "should": clauses, "minimum_should_match": 1 } }))
        }
    }

    // and_expr := term ('&&' term)*
    fn and_expr(&mut self) -> Result<Value> {
        let mut clauses = vec![self.term()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            clauses.push(self.term()?);
        }
        if clauses.len() == 1 {
            Ok(clauses.pop().unwrap())
        } else {
            Ok(json!({ "bool": { "filter": clauses } }))
        }
    }

    // term := '(' or_expr ')' | field ('=='|'!=') value
    fn term(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                if self.next() != Some(Token::RParen) {
                    bail!("Missing ) in expression");
                }
                Ok(inner)
            }
            Some(Token::Word(field)) => {
                let negated = match self.next() {
                    Some(Token::Eq) => false,
                    Some(Token::Ne) => true,
                    _ => bail!("Expected == or != after field '{}'", field),
                };
                let value = match self.next() {
                    Some(Token::Word(v)) => v,
                    _ => bail!("Expected value after comparison on '{}'", field),
                };
                let clause = self.comparison(&field, &value)?;
                if negated {
                    Ok(json!({ "bool": { "must_not": [clause] } }))
                } else {
                    Ok(clause)
                }
            }
            other => bail!("Unexpected token in expression: {:?}", other),
        }
    }

    fn comparison(&self, field: &str, value: &str) -> Result<Value> {
        // $name substitutes a shortcut's value list as a terms query
        let values: Vec<Value> = if let Some(name) = value.strip_prefix('$') {
            match self.lookups.get(name) {
                Some(list) => list.iter().map(|v| typed_value(v)).collect(),
                None => bail!("Unknown shortcut ${}", name),
            }
        } else {
            vec![typed_value(value)]
        };

        let targets = field_targets(field);
        let mut clauses = Vec::with_capacity(targets.len());
        for target in targets {
            if values.len() == 1 {
                clauses.push(json!({ "term": { target: values[0] } }));
            } else {
                clauses.push(json!({ "terms": { target: values } }));
            }
        }
        if clauses.len() == 1 {
            Ok(clauses.pop().unwrap())
        } else {
            Ok(json!({ "bool": { "should": clauses, "minimum_should_match": 1 } }))
        }
    }
}

/// Numbers stay numbers so term queries hit numeric mappings.
fn typed_value(v: &str) -> Value {
    if let Ok(n) = v.parse::<i64>() {
        return json!(n);
    }
    json!(v)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Compile one expression string into an Elasticsearch filter clause.
pub fn compile(expression: &str, lookups: &HashMap<String, Vec<String>>) -> Result<Value> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        bail!("Empty expression");
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        lookups,
    };
    let tree = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        bail!("Trailing tokens in expression");
    }
    Ok(tree)
}

/// Compose the filter clauses for a session query: lastPacket range (ms),
/// the user's forced expression (if any), then the query expression.
pub fn compose_filters(
    range_ms: (u64, u64),
    forced: Option<&str>,
    expression: Option<&str>,
    lookups: &HashMap<String, Vec<String>>,
) -> Result<Vec<Value>> {
    let (gte, lte) = range_ms;
    let mut filters = vec![json!({
        "range": { "lastPacket": { "gte": gte, "lte": lte } }
    })];
    if let Some(forced) = forced {
        filters.push(compile(forced, lookups)?);
    }
    if let Some(expr) = expression {
        filters.push(compile(expr, lookups)?);
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_lookups() -> HashMap<String, Vec<String>> {
        HashMap::new()
    }

    #[test]
    fn test_compile_simple_term() {
        let tree = compile("ip.src == 10.0.0.1", &no_lookups()).unwrap();
        assert_eq!(tree, json!({"term": {"srcIp": "10.0.0.1"}}));
    }

    #[test]
    fn test_compile_numeric_value() {
        let tree = compile("port.dst == 80", &no_lookups()).unwrap();
        assert_eq!(tree, json!({"term": {"dstPort": 80}}));
    }

    #[test]
    fn test_compile_bare_port_matches_either_direction() {
        let tree = compile("port == 80", &no_lookups()).unwrap();
        assert_eq!(
            tree,
            json!({"bool": {"should": [
                {"term": {"srcPort": 80}},
                {"term": {"dstPort": 80}}
            ], "minimum_should_match": 1}})
        );
    }

    #[test]
    fn test_compile_negation() {
        let tree = compile("node != cap01", &no_lookups()).unwrap();
        assert_eq!(
            tree,
            json!({"bool": {"must_not": [{"term": {"node": "cap01"}}]}})
        );
    }

    #[test]
    fn test_compile_and_or_precedence() {
        // && binds tighter than ||
        let tree = compile("a == 1 || b == 2 && c == 3", &no_lookups()).unwrap();
        assert_eq!(
            tree,
            json!({"bool": {"should": [
                {"term": {"a": 1}},
                {"bool": {"filter": [{"term": {"b": 2}}, {"term": {"c": 3}}]}}
            ], "minimum_should_match": 1}})
        );
    }

    #[test]
    fn test_compile_parens_override_precedence() {
        let tree = compile("(a == 1 || b == 2) && c == 3", &no_lookups()).unwrap();
        assert_eq!(
            tree,
            json!({"bool": {"filter": [
                {"bool": {"should": [{"term": {"a": 1}}, {"term": {"b": 2}}],
                          "minimum_should_match": 1}},
                {"term": {"c": 3}}
            ]}})
        );
    }

    #[test]
    fn test_compile_quoted_values() {
        let tree = compile("tags == \"needs review\"", &no_lookups()).unwrap();
        assert_eq!(tree, json!({"term": {"tags": "needs review"}}));
    }

    #[test]
    fn test_compile_lookup_substitution() {
        let mut lookups = HashMap::new();
        lookups.insert(
            "bad-hosts".to_string(),
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        );
        let tree = compile("ip.src == $bad-hosts", &lookups).unwrap();
        assert_eq!(
            tree,
            json!({"terms": {"srcIp": ["10.0.0.1", "10.0.0.2"]}})
        );
    }

    #[test]
    fn test_compile_unknown_lookup_fails() {
        assert!(compile("ip.src == $nope", &no_lookups()).is_err());
    }

    #[test]
    fn test_compile_errors() {
        assert!(compile("", &no_lookups()).is_err());
        assert!(compile("ip.src ==", &no_lookups()).is_err());
        assert!(compile("ip.src = 1", &no_lookups()).is_err());
        assert!(compile("(a == 1", &no_lookups()).is_err());
        assert!(compile("a == 1 extra", &no_lookups()).is_err());
    }

    #[test]
    fn test_compose_filters_injects_range_first() {
        let filters = compose_filters(
            (1_000_000, 2_000_000),
            Some("node == cap01"),
            Some("port == 443"),
            &no_lookups(),
        )
        .unwrap();
        assert_eq!(filters.len(), 3);
        assert_eq!(
            filters[0],
            json!({"range": {"lastPacket": {"gte": 1_000_000, "lte": 2_000_000}}})
        );
        assert_eq!(filters[1], json!({"term": {"node": "cap01"}}));
    }
}
