//! Expression lexer, parser, and evaluator.
//!
//! Grammar (loosest binding first):
//!
//! ```text
//! expr       := and_expr ("or" and_expr)*
//! and_expr   := not_expr ("and" not_expr)*
//! not_expr   := "not" not_expr | comparison
//! comparison := pipeline (cmp_op pipeline)?
//! pipeline   := primary ("|" ident ("(" expr ("," expr)* ")")?)*
//! primary    := literal | path | "(" expr ")"
//! path       := ident ("." (ident | integer))*
//! ```
//!
//! Evaluation never fails: unresolvable paths yield `null`, malformed
//! expressions yield `null`, unknown filters pass their input through.

use serde_json::Value;

use crate::render::Scope;
use crate::toon;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    /// Raw digits, parsed at AST build so integers stay integers.
    Number(String),
    Str(String),
    Dot,
    Pipe,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

fn lex(src: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(match next {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => other,
                                });
                                i += 2;
                            } else {
                                return None;
                            }
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return None, // unterminated string
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A digit followed by `.` then a non-digit is a path
                    // segment boundary, not a decimal point.
                    if chars[i] == '.'
                        && !chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(raw));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return None, // unknown character
        }
    }

    Some(tokens)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AST + parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Filter {
        input: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Ident(w)) if w == "or") {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Some(lhs)
    }

    fn and_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.not_expr()?;
        while matches!(self.peek(), Some(Token::Ident(w)) if w == "and") {
            self.pos += 1;
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Some(lhs)
    }

    fn not_expr(&mut self) -> Option<Expr> {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == "not") {
            self.pos += 1;
            return Some(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Option<Expr> {
        let lhs = self.pipeline()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Le) => CmpOp::Le,
            _ => return Some(lhs),
        };
        self.pos += 1;
        let rhs = self.pipeline()?;
        Some(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn pipeline(&mut self) -> Option<Expr> {
        let mut expr = self.primary()?;
        while self.eat(&Token::Pipe) {
            let name = match self.bump() {
                Some(Token::Ident(name)) => name,
                _ => return None,
            };
            let mut args = Vec::new();
            if self.eat(&Token::LParen) {
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.or_expr()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        if !self.eat(&Token::Comma) {
                            return None;
                        }
                    }
                }
            }
            expr = Expr::Filter {
                input: Box::new(expr),
                name,
                args,
            };
        }
        Some(expr)
    }

    fn primary(&mut self) -> Option<Expr> {
        match self.bump()? {
            Token::Number(raw) => {
                let number = if raw.contains('.') {
                    serde_json::Number::from_f64(raw.parse().ok()?)?
                } else {
                    serde_json::Number::from(raw.parse::<i64>().ok()?)
                };
                Some(Expr::Literal(Value::Number(number)))
            }
            Token::Str(s) => Some(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.or_expr()?;
                if self.eat(&Token::RParen) {
                    Some(inner)
                } else {
                    None
                }
            }
            Token::Ident(first) => match first.as_str() {
                "true" => Some(Expr::Literal(Value::Bool(true))),
                "false" => Some(Expr::Literal(Value::Bool(false))),
                "null" | "none" => Some(Expr::Literal(Value::Null)),
                _ => {
                    let mut path = vec![first];
                    while self.eat(&Token::Dot) {
                        match self.bump() {
                            Some(Token::Ident(seg)) => path.push(seg),
                            Some(Token::Number(raw)) if !raw.contains('.') => path.push(raw),
                            _ => return None,
                        }
                    }
                    Some(Expr::Path(path))
                }
            },
            _ => None,
        }
    }
}

/// Parse one expression. `None` on malformed input — the renderer treats
/// that as a missing variable.
pub fn parse(src: &str) -> Option<Expr> {
    let tokens = lex(src)?;
    if tokens.is_empty() {
        return None;
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return None; // trailing tokens
    }
    Some(expr)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Evaluation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn eval(expr: &Expr, scope: &Scope) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(path) => scope.lookup(path),
        Expr::Filter { input, name, args } => {
            let input = eval(input, scope);
            let args: Vec<Value> = args.iter().map(|a| eval(a, scope)).collect();
            apply_filter(name, input, &args)
        }
        Expr::Compare { op, lhs, rhs } => {
            Value::Bool(compare(*op, &eval(lhs, scope), &eval(rhs, scope)))
        }
        Expr::And(lhs, rhs) => {
            let left = eval(lhs, scope);
            if crate::render::is_truthy(&left) {
                eval(rhs, scope)
            } else {
                left
            }
        }
        Expr::Or(lhs, rhs) => {
            let left = eval(lhs, scope);
            if crate::render::is_truthy(&left) {
                left
            } else {
                eval(rhs, scope)
            }
        }
        Expr::Not(inner) => Value::Bool(!crate::render::is_truthy(&eval(inner, scope))),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> bool {
    // Numeric equality crosses integer/float representations.
    if matches!(op, CmpOp::Eq | CmpOp::Ne) {
        if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
            let equal = a == b;
            return if op == CmpOp::Eq { equal } else { !equal };
        }
    }
    match op {
        CmpOp::Eq => lhs == rhs,
        CmpOp::Ne => lhs != rhs,
        _ => {
            if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                ordered(op, a.partial_cmp(&b))
            } else if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
                ordered(op, Some(a.cmp(b)))
            } else {
                false
            }
        }
    }
}

fn ordered(op: CmpOp, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ord) {
        (CmpOp::Gt, Some(Greater)) => true,
        (CmpOp::Lt, Some(Less)) => true,
        (CmpOp::Ge, Some(Greater) | Some(Equal)) => true,
        (CmpOp::Le, Some(Less) | Some(Equal)) => true,
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn apply_filter(name: &str, input: Value, args: &[Value]) -> Value {
    match name {
        "tojson" | "to_json" => {
            Value::String(serde_json::to_string(&input).unwrap_or_default())
        }
        "from_json" => match &input {
            Value::String(s) => serde_json::from_str(s).unwrap_or(input),
            _ => input,
        },
        "totoon" => match toon::encode_forced(&input) {
            Some(text) => Value::String(text),
            // Not uniform tabular data: fall back to JSON text.
            None => Value::String(serde_json::to_string(&input).unwrap_or_default()),
        },
        "structure_hash" => Value::String(casc_domain::hash::structure_hash(&input)),
        "length" => {
            let len = match &input {
                Value::Array(items) => Some(items.len()),
                Value::Object(map) => Some(map.len()),
                Value::String(s) => Some(s.chars().count()),
                _ => None,
            };
            match len {
                Some(n) => Value::Number(n.into()),
                None => Value::Null,
            }
        }
        "default" => {
            if crate::render::is_truthy(&input) {
                input
            } else {
                args.first().cloned().unwrap_or(Value::Null)
            }
        }
        // Unknown filters pass through rather than failing the render.
        _ => input,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        Scope::new()
            .with("input", json!({"msg": "hi", "n": 3}))
            .with("state", json!({"done": true, "items": [1, 2, 3]}))
            .with(
                "outputs",
                json!({"load": {"rows": [{"n": 1}]}, "previous": [10, 20]}),
            )
    }

    fn eval_str(src: &str) -> Value {
        eval(&parse(src).unwrap(), &scope())
    }

    #[test]
    fn path_lookup() {
        assert_eq!(eval_str("input.msg"), json!("hi"));
        assert_eq!(eval_str("state.items.1"), json!(2));
        assert_eq!(eval_str("outputs.load.rows"), json!([{"n": 1}]));
    }

    #[test]
    fn missing_path_is_null() {
        assert_eq!(eval_str("input.absent.deeper"), Value::Null);
    }

    #[test]
    fn literals_and_comparisons() {
        assert_eq!(eval_str("input.n == 3"), json!(true));
        assert_eq!(eval_str("input.n > 5"), json!(false));
        assert_eq!(eval_str("input.msg == 'hi'"), json!(true));
        assert_eq!(eval_str("input.msg != \"bye\""), json!(true));
    }

    #[test]
    fn boolean_operators() {
        assert_eq!(eval_str("state.done and input.n == 3"), json!(true));
        assert_eq!(eval_str("not state.done"), json!(false));
        assert_eq!(eval_str("state.missing or input.msg"), json!("hi"));
    }

    #[test]
    fn length_filter() {
        assert_eq!(eval_str("outputs.previous | length"), json!(2));
        assert_eq!(eval_str("input.msg | length"), json!(2));
        assert_eq!(eval_str("state.items | length"), json!(3));
    }

    #[test]
    fn tojson_and_from_json() {
        assert_eq!(eval_str("input.n | tojson"), json!("3"));
        let scope = Scope::new().with("state", json!({"raw": "{\"a\":1}"}));
        let value = eval(&parse("state.raw | from_json").unwrap(), &scope);
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn unknown_filter_passes_through() {
        assert_eq!(eval_str("input.msg | shout"), json!("hi"));
    }

    #[test]
    fn malformed_expressions_do_not_parse() {
        assert!(parse("input ..").is_none());
        assert!(parse("| length").is_none());
        assert!(parse("(input.msg").is_none());
        assert!(parse("").is_none());
    }
}
