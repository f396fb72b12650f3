//! Minimal boolean expression language for readiness checks.
//!
//! Supports field paths over the object (`status.phase`), indexing,
//! literals (strings, numbers, booleans, null, lists), `== != < <= > >=`,
//! `in`, `&& || !`, `size(x)`, `has(a.b)` and the list macros
//! `filter`, `exists`, `all` and `map`, e.g.
//! `status.conditions.filter(c, c.type == 'Ready').all(c, c.status == 'True')`.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};

use rset_core::Json;

/// Compiles expressions once per reconcile.
pub trait ExprEngine: Send + Sync {
    fn compile(&self, expr: &str) -> Result<Box<dyn CompiledExpr>>;
}

pub trait CompiledExpr: Send + Sync {
    /// Evaluate against an object; non-boolean results are errors.
    fn evaluate_bool(&self, obj: &Json) -> Result<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CelLite;

impl ExprEngine for CelLite {
    fn compile(&self, expr: &str) -> Result<Box<dyn CompiledExpr>> {
        let tokens = lex(expr)?;
        let mut p = Parser { tokens, pos: 0 };
        let ast = p.expr()?;
        if p.pos != p.tokens.len() {
            bail!("unexpected {:?} at end of expression", p.tokens[p.pos]);
        }
        Ok(Box::new(Program { ast }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(&'static str),
}

const PUNCTS: &[&str] = &["&&", "||", "==", "!=", "<=", ">=", "<", ">", "!", "(", ")", "[", "]", ".", ","];

fn lex(src: &str) -> Result<Vec<Tok>> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => bail!("unterminated string literal"),
                    Some('\\') => {
                        let escaped = chars.get(i + 1).ok_or_else(|| anyhow!("unterminated escape"))?;
                        s.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(ch) if *ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            out.push(Tok::Str(s));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || (chars[i] == '.' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()))) {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            out.push(Tok::Num(text.parse().map_err(|_| anyhow!("invalid number {}", text))?));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            out.push(Tok::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match PUNCTS.iter().find(|p| rest.starts_with(**p)) {
            Some(p) => {
                out.push(Tok::Punct(*p));
                i += p.len();
            }
            None => bail!("unexpected character {:?}", c),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MacroKind {
    Filter,
    Exists,
    All,
    Map,
}

#[derive(Debug, Clone)]
enum Ast {
    Lit(Json),
    List(Vec<Ast>),
    Var(String),
    Field(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    Bin(Box<Ast>, BinOp, Box<Ast>),
    Size(Box<Ast>),
    Has(Box<Ast>, String),
    Macro { target: Box<Ast>, kind: MacroKind, var: String, body: Box<Ast> },
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Punct(q)) if *q == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, p: &str) -> Result<()> {
        if self.eat(p) {
            Ok(())
        } else {
            Err(anyhow!("expected {:?}, found {:?}", p, self.peek()))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.tokens.get(self.pos).cloned() {
            Some(Tok::Ident(s)) => {
                self.pos += 1;
                Ok(s)
            }
            other => Err(anyhow!("expected identifier, found {:?}", other)),
        }
    }

    fn expr(&mut self) -> Result<Ast> {
        let mut lhs = self.and()?;
        while self.eat("||") {
            lhs = Ast::Bin(Box::new(lhs), BinOp::Or, Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Ast> {
        let mut lhs = self.unary()?;
        while self.eat("&&") {
            lhs = Ast::Bin(Box::new(lhs), BinOp::And, Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Ast> {
        if self.eat("!") {
            return Ok(Ast::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Ast> {
        let lhs = self.postfix()?;
        let op = match self.peek() {
            Some(Tok::Punct("==")) => BinOp::Eq,
            Some(Tok::Punct("!=")) => BinOp::Ne,
            Some(Tok::Punct("<")) => BinOp::Lt,
            Some(Tok::Punct("<=")) => BinOp::Le,
            Some(Tok::Punct(">")) => BinOp::Gt,
            Some(Tok::Punct(">=")) => BinOp::Ge,
            Some(Tok::Ident(s)) if s == "in" => BinOp::In,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        Ok(Ast::Bin(Box::new(lhs), op, Box::new(self.postfix()?)))
    }

    fn postfix(&mut self) -> Result<Ast> {
        let mut node = self.primary()?;
        loop {
            if self.eat(".") {
                let name = self.ident()?;
                if self.eat("(") {
                    let kind = match name.as_str() {
                        "filter" => MacroKind::Filter,
                        "exists" => MacroKind::Exists,
                        "all" => MacroKind::All,
                        "map" => MacroKind::Map,
                        other => bail!("unknown method {}", other),
                    };
                    let var = self.ident()?;
                    self.expect(",")?;
                    let body = self.expr()?;
                    self.expect(")")?;
                    node = Ast::Macro { target: Box::new(node), kind, var, body: Box::new(body) };
                } else {
                    node = Ast::Field(Box::new(node), name);
                }
            } else if self.eat("[") {
                let idx = self.expr()?;
                self.expect("]")?;
                node = Ast::Index(Box::new(node), Box::new(idx));
            } else {
                return Ok(node);
            }
        }
    }

    fn primary(&mut self) -> Result<Ast> {
        match self.tokens.get(self.pos).cloned() {
            Some(Tok::Str(s)) => {
                self.pos += 1;
                Ok(Ast::Lit(Json::String(s)))
            }
            Some(Tok::Num(n)) => {
                self.pos += 1;
                let v = serde_json::Number::from_f64(n).map(Json::Number).ok_or_else(|| anyhow!("invalid number"))?;
                Ok(Ast::Lit(v))
            }
            Some(Tok::Punct("(")) => {
                self.pos += 1;
                let e = self.expr()?;
                self.expect(")")?;
                Ok(e)
            }
            Some(Tok::Punct("[")) => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.eat("]") {
                    loop {
                        items.push(self.expr()?);
                        if self.eat("]") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                Ok(Ast::List(items))
            }
            Some(Tok::Ident(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => Ok(Ast::Lit(Json::Bool(true))),
                    "false" => Ok(Ast::Lit(Json::Bool(false))),
                    "null" => Ok(Ast::Lit(Json::Null)),
                    "size" if self.eat("(") => {
                        let arg = self.expr()?;
                        self.expect(")")?;
                        Ok(Ast::Size(Box::new(arg)))
                    }
                    "has" if self.eat("(") => {
                        let arg = self.postfix()?;
                        self.expect(")")?;
                        match arg {
                            Ast::Field(target, field) => Ok(Ast::Has(target, field)),
                            _ => bail!("has() requires a field selection"),
                        }
                    }
                    _ => Ok(Ast::Var(name)),
                }
            }
            other => Err(anyhow!("unexpected token {:?}", other)),
        }
    }
}

struct Program {
    ast: Ast,
}

impl CompiledExpr for Program {
    fn evaluate_bool(&self, obj: &Json) -> Result<bool> {
        let scope = Scope { root: obj, vars: BTreeMap::new() };
        match eval(&self.ast, &scope)? {
            Json::Bool(b) => Ok(b),
            other => Err(anyhow!("expression evaluated to {} instead of a boolean", other)),
        }
    }
}

struct Scope<'a> {
    root: &'a Json,
    vars: BTreeMap<String, Json>,
}

fn truthy(v: &Json, what: &str) -> Result<bool> {
    v.as_bool().ok_or_else(|| anyhow!("{} operand is not a boolean: {}", what, v))
}

fn compare(a: &Json, b: &Json) -> Result<std::cmp::Ordering> {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).ok_or_else(|| anyhow!("cannot compare {} and {}", x, y))
        }
        (Json::String(x), Json::String(y)) => Ok(x.cmp(y)),
        _ => Err(anyhow!("cannot order {} and {}", a, b)),
    }
}

fn equal(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn eval(ast: &Ast, scope: &Scope<'_>) -> Result<Json> {
    Ok(match ast {
        Ast::Lit(v) => v.clone(),
        Ast::List(items) => Json::Array(items.iter().map(|i| eval(i, scope)).collect::<Result<_>>()?),
        Ast::Var(name) => match scope.vars.get(name) {
            Some(v) => v.clone(),
            None => scope.root.get(name).cloned().ok_or_else(|| anyhow!("no such key: {}", name))?,
        },
        Ast::Field(target, field) => {
            let t = eval(target, scope)?;
            t.get(field).cloned().ok_or_else(|| anyhow!("no such key: {}", field))?
        }
        Ast::Index(target, idx) => {
            let t = eval(target, scope)?;
            let i = eval(idx, scope)?;
            match (&t, &i) {
                (Json::Array(items), Json::Number(n)) => {
                    let n = n.as_f64().unwrap_or(-1.0);
                    if n < 0.0 || n.fract() != 0.0 {
                        bail!("invalid list index {}", n);
                    }
                    items.get(n as usize).cloned().ok_or_else(|| anyhow!("index {} out of range", n))?
                }
                (Json::Object(map), Json::String(k)) => map.get(k).cloned().ok_or_else(|| anyhow!("no such key: {}", k))?,
                _ => bail!("cannot index {} with {}", t, i),
            }
        }
        Ast::Not(inner) => Json::Bool(!truthy(&eval(inner, scope)?, "!")?),
        Ast::Bin(lhs, BinOp::And, rhs) => Json::Bool(truthy(&eval(lhs, scope)?, "&&")? && truthy(&eval(rhs, scope)?, "&&")?),
        Ast::Bin(lhs, BinOp::Or, rhs) => Json::Bool(truthy(&eval(lhs, scope)?, "||")? || truthy(&eval(rhs, scope)?, "||")?),
        Ast::Bin(lhs, op, rhs) => {
            let a = eval(lhs, scope)?;
            let b = eval(rhs, scope)?;
            use std::cmp::Ordering::*;
            Json::Bool(match op {
                BinOp::Eq => equal(&a, &b),
                BinOp::Ne => !equal(&a, &b),
                BinOp::Lt => compare(&a, &b)? == Less,
                BinOp::Le => compare(&a, &b)? != Greater,
                BinOp::Gt => compare(&a, &b)? == Greater,
                BinOp::Ge => compare(&a, &b)? != Less,
                BinOp::In => match &b {
                    Json::Array(items) => items.iter().any(|i| equal(i, &a)),
                    Json::Object(map) => a.as_str().map_or(false, |k| map.contains_key(k)),
                    _ => bail!("right side of 'in' must be a list or map"),
                },
                BinOp::And | BinOp::Or => unreachable!("handled above"),
            })
        }
        Ast::Size(arg) => {
            let n = match eval(arg, scope)? {
                Json::Array(a) => a.len(),
                Json::Object(m) => m.len(),
                Json::String(s) => s.chars().count(),
                other => bail!("size() of {}", other),
            };
            Json::from(n)
        }
        Ast::Has(target, field) => Json::Bool(eval(target, scope)?.get(field).is_some()),
        Ast::Macro { target, kind, var, body } => {
            let items = match eval(target, scope)? {
                Json::Array(items) => items,
                other => bail!("{:?} needs a list, got {}", kind, other),
            };
            let mut results = Vec::with_capacity(items.len());
            for item in &items {
                let mut vars = scope.vars.clone();
                vars.insert(var.clone(), item.clone());
                let inner = Scope { root: scope.root, vars };
                results.push(eval(body, &inner)?);
            }
            match kind {
                MacroKind::Map => Json::Array(results),
                MacroKind::Filter => {
                    let mut kept = Vec::new();
                    for (item, keep) in items.into_iter().zip(results.iter()) {
                        if truthy(keep, "filter")? {
                            kept.push(item);
                        }
                    }
                    Json::Array(kept)
                }
                MacroKind::Exists => {
                    let mut any = false;
                    for r in &results {
                        any |= truthy(r, "exists")?;
                    }
                    Json::Bool(any)
                }
                MacroKind::All => {
                    let mut all = true;
                    for r in &results {
                        all &= truthy(r, "all")?;
                    }
                    Json::Bool(all)
                }
            }
        }
    })
}
