//! 受限表达式求值：工作流步骤条件与完成钩子
//!
//! 只支持字面量、and/or/not、比较、in / not in、+ -、下标与属性访问，以及 len/str/int/float/bool 五个函数。
//! 名字只能解析到 variables、action_results、task 三个绑定，其它名字一律报错。

use serde_json::{Map, Value};

use crate::core::types::Context;
use crate::workflow::types::WorkflowError;

const BINDINGS: [&str; 3] = ["variables", "action_results", "task"];
const FUNCTIONS: [&str; 5] = ["len", "str", "int", "float", "bool"];

/// 表达式可见的绑定
#[derive(Debug, Clone)]
pub struct Bindings {
    pub variables: Map<String, Value>,
    pub action_results: Value,
    pub task: Value,
}

impl Bindings {
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            variables: ctx.variables.iter().cloned().collect(),
            action_results: serde_json::to_value(&ctx.action_results).unwrap_or_else(|_| Value::Array(Vec::new())),
            task: serde_json::to_value(&ctx.task).unwrap_or(Value::Null),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, WorkflowError> {
        match name {
            "variables" => Ok(Value::Object(self.variables.clone())),
            "action_results" => Ok(self.action_results.clone()),
            "task" => Ok(self.task.clone()),
            other => Err(err(format!("name '{other}' is not defined"))),
        }
    }
}

fn err(msg: impl Into<String>) -> WorkflowError {
    WorkflowError::Expression(msg.into())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<Token>, WorkflowError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Op("+"));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op("-"));
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string literal")),
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| err("unterminated string literal"))?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || (chars[i] == '.' && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit())))
                {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let n = literal
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid number '{literal}'")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '=' | '!' | '<' | '>' => {
                let op = match (c, next) {
                    ('=', Some('=')) => "==",
                    ('!', Some('=')) => "!=",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    ('!', _) => "!",
                    _ => return Err(err("assignment is not allowed in expressions")),
                };
                i += op.len();
                tokens.push(Token::Op(op));
            }
            '&' if next == Some('&') => {
                tokens.push(Token::Op("&&"));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Op("||"));
                i += 2;
            }
            other => return Err(err(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Name(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Attr(Box<Expr>, String),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn expect(&mut self, expected: Token) -> Result<(), WorkflowError> {
        match self.bump() {
            Some(t) if t == expected => Ok(()),
            other => Err(err(format!("expected {expected:?}, found {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_and()?;
        while self.is_word("or") || self.is_op("||") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_not()?;
        while self.is_word("and") || self.is_op("&&") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, WorkflowError> {
        if self.is_word("not") || self.is_op("!") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, WorkflowError> {
        let left = self.parse_sum()?;
        let (op, width) = match self.peek() {
            Some(Token::Op("==")) => (BinOp::Eq, 1),
            Some(Token::Op("!=")) => (BinOp::Ne, 1),
            Some(Token::Op("<")) => (BinOp::Lt, 1),
            Some(Token::Op("<=")) => (BinOp::Le, 1),
            Some(Token::Op(">")) => (BinOp::Gt, 1),
            Some(Token::Op(">=")) => (BinOp::Ge, 1),
            Some(Token::Ident(w)) if w == "in" => (BinOp::In, 1),
            Some(Token::Ident(w)) if w == "not" && matches!(self.peek_at(1), Some(Token::Ident(n)) if n == "in") => {
                (BinOp::NotIn, 2)
            }
            _ => return Ok(left),
        };
        self.pos += width;
        let right = self.parse_sum()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_sum(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.is_op("+") {
                BinOp::Add
            } else if self.is_op("-") {
                BinOp::Sub
            } else {
                return Ok(left);
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, WorkflowError> {
        if self.is_op("-") {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, WorkflowError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.bump() {
                        Some(Token::Ident(name)) => expr = Expr::Attr(Box::new(expr), name),
                        other => return Err(err(format!("expected attribute name, found {other:?}"))),
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_list(&mut self, close: Token) -> Result<Vec<Expr>, WorkflowError> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            match self.bump() {
                Some(Token::Comma) if self.peek() == Some(&close) => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(Token::Comma) => continue,
                Some(t) if t == close => return Ok(items),
                other => return Err(err(format!("expected ',' or {close:?}, found {other:?}"))),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, WorkflowError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Lit(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => Ok(Expr::List(self.parse_list(Token::RBracket)?)),
            Some(Token::Ident(word)) => {
                match word.as_str() {
                    "true" | "True" => return Ok(Expr::Lit(Value::Bool(true))),
                    "false" | "False" => return Ok(Expr::Lit(Value::Bool(false))),
                    "null" | "None" | "none" => return Ok(Expr::Lit(Value::Null)),
                    "and" | "or" | "not" | "in" => return Err(err(format!("unexpected keyword '{word}'"))),
                    _ => {}
                }
                if self.peek() == Some(&Token::LParen) {
                    if !FUNCTIONS.contains(&word.as_str()) {
                        return Err(err(format!("function '{word}' is not allowed")));
                    }
                    self.pos += 1;
                    let args = self.parse_list(Token::RParen)?;
                    Ok(Expr::Call(word, args))
                } else if BINDINGS.contains(&word.as_str()) {
                    Ok(Expr::Name(word))
                } else {
                    Err(err(format!("name '{word}' is not defined")))
                }
            }
            other => Err(err(format!("unexpected token {other:?}"))),
        }
    }
}

fn parse(src: &str) -> Result<Expr, WorkflowError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    if parser.tokens.is_empty() {
        return Err(err("empty expression"));
    }
    let expr = parser.parse_or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(t) => Err(err(format!("unexpected trailing token {t:?}"))),
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Python 风格真值
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, WorkflowError> {
    match (container, item) {
        (Value::Array(arr), _) => Ok(arr.iter().any(|v| loose_eq(v, item))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(obj), Value::String(key)) => Ok(obj.contains_key(key)),
        _ => Err(err("unsupported operand for 'in'")),
    }
}

fn order(op: BinOp, a: &Value, b: &Value) -> Result<bool, WorkflowError> {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
    .ok_or_else(|| err(format!("cannot compare {a} and {b}")))?;
    Ok(match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn arithmetic(op: BinOp, a: Value, b: Value) -> Result<Value, WorkflowError> {
    match (op, a, b) {
        (_, Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            Ok(number(if op == BinOp::Add { x + y } else { x - y }))
        }
        (BinOp::Add, Value::String(x), Value::String(y)) => Ok(Value::String(x + &y)),
        (BinOp::Add, Value::Array(mut x), Value::Array(y)) => {
            x.extend(y);
            Ok(Value::Array(x))
        }
        (_, a, b) => Err(err(format!("unsupported operands {a} and {b}"))),
    }
}

fn index(container: Value, key: Value) -> Result<Value, WorkflowError> {
    match (&container, &key) {
        (Value::Array(arr), Value::Number(n)) => {
            let i = n.as_i64().ok_or_else(|| err("list index must be an integer"))?;
            let idx = if i < 0 { arr.len() as i64 + i } else { i };
            usize::try_from(idx)
                .ok()
                .and_then(|i| arr.get(i))
                .cloned()
                .ok_or_else(|| err(format!("list index {i} out of range")))
        }
        (Value::String(s), Value::Number(n)) => {
            let i = n.as_i64().ok_or_else(|| err("string index must be an integer"))?;
            let chars: Vec<char> = s.chars().collect();
            let idx = if i < 0 { chars.len() as i64 + i } else { i };
            usize::try_from(idx)
                .ok()
                .and_then(|i| chars.get(i))
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| err(format!("string index {i} out of range")))
        }
        (Value::Object(obj), Value::String(k)) => obj.get(k).cloned().ok_or_else(|| err(format!("key '{k}' not found"))),
        _ => Err(err(format!("cannot index {container} with {key}"))),
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, WorkflowError> {
    let [arg] = <[Value; 1]>::try_from(args).map_err(|_| err(format!("{name}() takes exactly one argument")))?;
    match name {
        "len" => match &arg {
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Object(o) => Ok(Value::from(o.len())),
            other => Err(err(format!("object {other} has no len()"))),
        },
        "str" => Ok(Value::String(match arg {
            Value::String(s) => s,
            other => other.to_string(),
        })),
        "int" | "float" => {
            let f = match &arg {
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                Value::Bool(b) => f64::from(u8::from(*b)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid literal for {name}(): '{s}'")))?,
                other => return Err(err(format!("{name}() argument must be a string or a number, not {other}"))),
            };
            if name == "int" {
                Ok(Value::from(f.trunc() as i64))
            } else {
                Ok(serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
            }
        }
        _ => Ok(Value::Bool(truthy(&arg))),
    }
}

fn eval(expr: &Expr, bindings: &Bindings) -> Result<Value, WorkflowError> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Name(name) => bindings.lookup(name),
        Expr::List(items) => Ok(Value::Array(
            items.iter().map(|e| eval(e, bindings)).collect::<Result<_, _>>()?,
        )),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, bindings)?))),
        Expr::Neg(inner) => match eval(inner, bindings)? {
            Value::Number(n) => Ok(number(-n.as_f64().unwrap_or(0.0))),
            other => Err(err(format!("bad operand for unary -: {other}"))),
        },
        Expr::And(l, r) => {
            let left = eval(l, bindings)?;
            if truthy(&left) {
                eval(r, bindings)
            } else {
                Ok(left)
            }
        }
        Expr::Or(l, r) => {
            let left = eval(l, bindings)?;
            if truthy(&left) {
                Ok(left)
            } else {
                eval(r, bindings)
            }
        }
        Expr::Binary(op, l, r) => {
            let (a, b) = (eval(l, bindings)?, eval(r, bindings)?);
            match op {
                BinOp::Eq => Ok(Value::Bool(loose_eq(&a, &b))),
                BinOp::Ne => Ok(Value::Bool(!loose_eq(&a, &b))),
                BinOp::In => Ok(Value::Bool(contains(&b, &a)?)),
                BinOp::NotIn => Ok(Value::Bool(!contains(&b, &a)?)),
                BinOp::Add | BinOp::Sub => arithmetic(*op, a, b),
                _ => Ok(Value::Bool(order(*op, &a, &b)?)),
            }
        }
        Expr::Index(container, key) => index(eval(container, bindings)?, eval(key, bindings)?),
        Expr::Attr(target, name) => match eval(target, bindings)? {
            Value::Object(obj) => obj
                .get(name)
                .cloned()
                .ok_or_else(|| err(format!("no attribute '{name}'"))),
            other => Err(err(format!("{other} has no attribute '{name}'"))),
        },
        Expr::Call(name, args) => {
            let values = args.iter().map(|a| eval(a, bindings)).collect::<Result<Vec<_>, _>>()?;
            call(name, values)
        }
    }
}

/// 求值表达式
pub fn evaluate(expression: &str, bindings: &Bindings) -> Result<Value, WorkflowError> {
    eval(&parse(expression)?, bindings)
}

/// 条件表达式：按真值判定
pub fn evaluate_condition(expression: &str, bindings: &Bindings) -> Result<bool, WorkflowError> {
    evaluate(expression, bindings).map(|v| truthy(&v))
}

/// 按分号切分语句，引号内的分号保留
fn split_statements(script: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in script.char_indices() {
        match (quote, c) {
            (Some(_), _) if escaped => escaped = false,
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            (None, ';') => {
                parts.push(&script[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&script[start..]);
    parts
}

/// 执行完成钩子：`set <变量> = <表达式>`，以分号分隔；后面的语句能看到前面的赋值
pub fn run_assignments(script: &str, bindings: &mut Bindings) -> Result<Vec<(String, Value)>, WorkflowError> {
    let mut assigned = Vec::new();
    for statement in split_statements(script) {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        let rest = statement
            .strip_prefix("set")
            .filter(|r| r.starts_with(char::is_whitespace))
            .ok_or_else(|| err(format!("statement must start with 'set': {statement}")))?
            .trim_start();
        let name_len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(err(format!("invalid variable name in: {statement}")));
        }
        let value_src = rest[name_len..]
            .trim_start()
            .strip_prefix('=')
            .filter(|r| !r.starts_with('='))
            .ok_or_else(|| err(format!("expected '=' in: {statement}")))?;
        let value = evaluate(value_src, bindings)?;
        bindings.variables.insert(name.to_string(), value.clone());
        assigned.push((name.to_string(), value));
    }
    Ok(assigned)
}
