use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::basetypes::{self, PValue, Unresolved};
use crate::errors::{ErrorKind, Result, StimelaError, formula_error, parser_error, subst_error, unset_error};
use crate::substitutions::{NsEntry, SubstContext, SubstitutionNs};

/// Formula AST. Parsed once per source string and cached process-wide.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(PValue),
    /// Dotted namespace reference, possibly with wildcard components.
    Lookup(String),
    /// {}-reference embedded in a formula; resolves through the
    /// substitution context and keeps the value's type.
    BraceRef(String),
    Unset,
    SelfValue,
    Empty,
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Subscript(Box<Expr>, Box<Expr>),
    Func(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Brace(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Debug, Clone)]
struct SpannedTok {
    tok: Tok,
    start: usize,
    end: usize,
}

const FUNCTIONS: &[&str] = &[
    "IF", "IFSET", "LIST", "GLOB", "EXISTS", "DIRNAME", "BASENAME", "EXTENSION", "STRIPEXT",
    "SORT", "RSORT", "GETITEM", "CASES", "ERROR",
];

/// Functions whose single argument may be an unquoted character sequence
/// (e.g. GLOB(*.txt)).
const ANYSEQ_FUNCTIONS: &[&str] = &["GLOB", "EXISTS", "ERROR"];

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '@' | '*' | '?')
}

fn tokenize(text: &str) -> Result<Vec<SpannedTok>> {
    let mut toks = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c == '{' {
            let mut s = String::new();
            i += 1;
            while i < chars.len() && chars[i] != '}' {
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(parser_error(format!("unbalanced braces in '{text}'")));
            }
            i += 1;
            toks.push(SpannedTok { tok: Tok::Brace(s), start, end: i });
        } else if c == '"' || c == '\'' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            while i < chars.len() && chars[i] != quote {
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(parser_error(format!("unterminated string in '{text}'")));
            }
            i += 1;
            toks.push(SpannedTok { tok: Tok::Str(s), start, end: i });
        } else if c.is_ascii_digit()
            || (c == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit())
        {
            let mut s = String::new();
            let mut is_float = false;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_digit() {
                    s.push(d);
                } else if d == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    s.push(d);
                } else if (d == 'e' || d == 'E')
                    && i + 1 < chars.len()
                    && (chars[i + 1].is_ascii_digit() || chars[i + 1] == '-' || chars[i + 1] == '+')
                {
                    is_float = true;
                    s.push(d);
                    i += 1;
                    s.push(chars[i]);
                } else {
                    break;
                }
                i += 1;
            }
            let tok = if is_float {
                Tok::Float(s.parse().map_err(|_| parser_error(format!("bad number '{s}'")))?)
            } else {
                Tok::Int(s.parse().map_err(|_| parser_error(format!("bad number '{s}'")))?)
            };
            toks.push(SpannedTok { tok, start, end: i });
        } else if is_name_start(c) {
            // dotted name: fieldname(.fieldname)*
            let mut s = String::new();
            while i < chars.len() && is_name_char(chars[i]) {
                s.push(chars[i]);
                i += 1;
            }
            while i < chars.len() && chars[i] == '.' && i + 1 < chars.len() && is_name_start(chars[i + 1])
            {
                s.push('.');
                i += 1;
                while i < chars.len() && is_name_char(chars[i]) {
                    s.push(chars[i]);
                    i += 1;
                }
            }
            toks.push(SpannedTok { tok: Tok::Name(s), start, end: i });
        } else {
            let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op2 = match two.as_str() {
                "**" | "//" | "<<" | ">>" | "==" | "!=" | "<=" | ">=" => Some(two.clone()),
                _ => None,
            };
            if let Some(op) = op2 {
                let op: &'static str = match op.as_str() {
                    "**" => "**",
                    "//" => "//",
                    "<<" => "<<",
                    ">>" => ">>",
                    "==" => "==",
                    "!=" => "!=",
                    "<=" => "<=",
                    ">=" => ">=",
                    _ => unreachable!(),
                };
                toks.push(SpannedTok { tok: Tok::Op(op), start, end: i + 2 });
                i += 2;
            } else {
                let tok = match c {
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    ',' => Tok::Comma,
                    '+' => Tok::Op("+"),
                    '-' => Tok::Op("-"),
                    '*' => Tok::Op("*"),
                    '/' => Tok::Op("/"),
                    '%' => Tok::Op("%"),
                    '~' => Tok::Op("~"),
                    '&' => Tok::Op("&"),
                    '^' => Tok::Op("^"),
                    '|' => Tok::Op("|"),
                    '<' => Tok::Op("<"),
                    '>' => Tok::Op(">"),
                    other => {
                        return Err(parser_error(format!("unexpected character '{other}' in '{text}'")));
                    }
                };
                toks.push(SpannedTok { tok, start, end: i + 1 });
                i += 1;
            }
        }
    }
    Ok(toks)
}

struct Parser<'a> {
    source: &'a str,
    toks: Vec<SpannedTok>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|t| t.tok.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Tok) -> Result<()> {
        match self.toks.get(self.pos) {
            Some(t) if &t.tok == tok => {
                self.pos += 1;
                Ok(())
            }
            other => Err(parser_error(format!(
                "expected {tok:?}, got {:?} in '{}'",
                other.map(|t| &t.tok),
                self.source
            ))),
        }
    }

    // precedence-climbing levels, lowest binding first
    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary("or", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::Binary("and", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek_keyword("not") {
            self.pos += 1;
            let arg = self.parse_not()?;
            return Ok(Expr::Unary("not", Box::new(arg)));
        }
        self.parse_membership()
    }

    fn parse_membership(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        loop {
            if self.peek_keyword("in") {
                self.pos += 1;
                let rhs = self.parse_comparison()?;
                lhs = Expr::Binary("in", Box::new(lhs), Box::new(rhs));
            } else if self.peek_keyword("not") && self.peek_keyword_at(1, "in") {
                self.pos += 2;
                let rhs = self.parse_comparison()?;
                lhs = Expr::Binary("not in", Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_bitor()?;
        while let Some(Tok::Op(op @ ("==" | "!=" | "<" | ">" | "<=" | ">="))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_bitor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_bitxor()?;
        while let Some(Tok::Op("|")) = self.peek() {
            self.pos += 1;
            let rhs = self.parse_bitxor()?;
            lhs = Expr::Binary("|", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bitxor(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_bitand()?;
        while let Some(Tok::Op("^")) = self.peek() {
            self.pos += 1;
            let rhs = self.parse_bitand()?;
            lhs = Expr::Binary("^", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_shift()?;
        while let Some(Tok::Op("&")) = self.peek() {
            self.pos += 1;
            let rhs = self.parse_shift()?;
            lhs = Expr::Binary("&", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        while let Some(Tok::Op(op @ ("<<" | ">>"))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        while let Some(Tok::Op(op @ ("+" | "-"))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some(Tok::Op(op @ ("*" | "/" | "//" | "%"))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Tok::Op(op @ ("+" | "-" | "~"))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let arg = self.parse_unary()?;
            return Ok(Expr::Unary(op, Box::new(arg)));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_postfix()?;
        while let Some(Tok::Op("**")) = self.peek() {
            self.pos += 1;
            let rhs = self.parse_postfix()?;
            lhs = Expr::Binary("**", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_atom()?;
        while let Some(Tok::LBracket) = self.peek() {
            self.pos += 1;
            let index = self.parse_or()?;
            self.expect(&Tok::RBracket)?;
            expr = Expr::Subscript(Box::new(expr), Box::new(index));
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::Int(i)) => Ok(Expr::Const(PValue::Int(i))),
            Some(Tok::Float(f)) => Ok(Expr::Const(PValue::Float(f))),
            Some(Tok::Str(s)) => Ok(Expr::Const(PValue::Str(s))),
            Some(Tok::Brace(path)) => Ok(Expr::BraceRef(path)),
            Some(Tok::LParen) => {
                let expr = self.parse_or()?;
                self.expect(&Tok::RParen)?;
                Ok(expr)
            }
            Some(Tok::Name(name)) => match name.as_str() {
                "True" | "true" => Ok(Expr::Const(PValue::Bool(true))),
                "False" | "false" => Ok(Expr::Const(PValue::Bool(false))),
                "UNSET" => Ok(Expr::Unset),
                "SELF" => Ok(Expr::SelfValue),
                "EMPTY" => Ok(Expr::Empty),
                _ => {
                    if FUNCTIONS.contains(&name.as_str()) && self.peek() == Some(&Tok::LParen) {
                        self.parse_function_call(&name)
                    } else {
                        Ok(Expr::Lookup(name))
                    }
                }
            },
            other => Err(parser_error(format!(
                "unexpected {other:?} in '{}'",
                self.source
            ))),
        }
    }

    fn parse_function_call(&mut self, name: &str) -> Result<Expr> {
        // token spans are char offsets; translate to a byte offset for the
        // raw-capture fallback
        let lparen_end = self
            .source
            .char_indices()
            .map(|(byte, _)| byte)
            .nth(self.toks[self.pos].end)
            .unwrap_or(self.source.len());
        self.pos += 1; // consume '('
        let saved = self.pos;

        // empty argument list
        if self.peek() == Some(&Tok::RParen) {
            self.pos += 1;
            return Ok(Expr::Func(name.to_string(), Vec::new()));
        }

        let parsed: Result<Vec<Expr>> = (|| {
            let mut args = vec![self.parse_or()?];
            loop {
                match self.peek() {
                    Some(Tok::Comma) => {
                        self.pos += 1;
                        args.push(self.parse_or()?);
                    }
                    Some(Tok::RParen) => {
                        self.pos += 1;
                        return Ok(args);
                    }
                    other => {
                        return Err(parser_error(format!(
                            "unexpected {other:?} in arguments of {name}()"
                        )));
                    }
                }
            }
        })();

        match parsed {
            Ok(args) => Ok(Expr::Func(name.to_string(), args)),
            Err(err) => {
                // single-argument functions accept an unquoted character
                // sequence, e.g. GLOB(*.txt)
                if ANYSEQ_FUNCTIONS.contains(&name) {
                    self.pos = saved;
                    if let Some(close) = self.source[lparen_end..].find(')') {
                        let raw = self.source[lparen_end..lparen_end + close].trim().to_string();
                        if !raw.contains(',') {
                            // skip tokens up to and including the ')'
                            while let Some(t) = self.toks.get(self.pos) {
                                let done = t.tok == Tok::RParen;
                                self.pos += 1;
                                if done {
                                    break;
                                }
                            }
                            return Ok(Expr::Func(
                                name.to_string(),
                                vec![Expr::Const(PValue::Str(raw))],
                            ));
                        }
                    }
                }
                Err(err)
            }
        }
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Name(n)) if n == kw)
    }

    fn peek_keyword_at(&self, offset: usize, kw: &str) -> bool {
        matches!(self.toks.get(self.pos + offset).map(|t| &t.tok), Some(Tok::Name(n)) if n == kw)
    }
}

static PARSE_CACHE: Lazy<Mutex<HashMap<String, std::result::Result<Arc<Expr>, String>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Parses a formula (the text after the leading '='), consulting the
/// process-wide parse cache. Parse errors are cached too.
pub fn parse_formula(text: &str) -> Result<Arc<Expr>> {
    if let Some(cached) = PARSE_CACHE.lock().unwrap().get(text) {
        return match cached {
            Ok(expr) => Ok(expr.clone()),
            Err(msg) => Err(parser_error(msg.clone())),
        };
    }
    let result = (|| {
        let toks = tokenize(text)?;
        if toks.is_empty() {
            return Err(parser_error("empty formula"));
        }
        let mut parser = Parser { source: text, toks, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.toks.len() {
            return Err(parser_error(format!("trailing content in formula '{text}'")));
        }
        Ok(Arc::new(expr))
    })();
    let cache_entry = match &result {
        Ok(expr) => Ok(expr.clone()),
        Err(err) => Err(err.message.clone()),
    };
    PARSE_CACHE.lock().unwrap().insert(text.to_string(), cache_entry);
    result
}

fn bare_unset() -> PValue {
    PValue::Unset(String::new())
}

fn is_bare_unset(value: &PValue) -> bool {
    matches!(value, PValue::Unset(name) if name.is_empty())
}

/// Evaluates '=formula' strings and applies {}-substitutions to plain
/// strings, against a namespace and substitution context.
pub struct Evaluator {
    pub location: Vec<String>,
    pub allow_unresolved: bool,
}

impl Evaluator {
    pub fn new(location: Vec<String>, allow_unresolved: bool) -> Self {
        Evaluator { location, allow_unresolved }
    }

    fn loc(&self, sublocation: &[String]) -> Vec<String> {
        let mut loc = self.location.clone();
        loc.extend(sublocation.iter().cloned());
        loc
    }

    /// Evaluates a single value: '=expr' triggers formula evaluation, '=='
    /// escapes to a literal '=', plain strings get {}-substitution.
    pub fn evaluate(
        &self,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        value: &PValue,
        sublocation: &[String],
    ) -> Result<PValue> {
        let PValue::Str(text) = value else {
            return Ok(value.clone());
        };
        let loc = self.loc(sublocation);
        if let Some(formula) = text.strip_prefix('=') {
            if let Some(escaped) = formula.strip_prefix('=') {
                // "==" escapes to a literal "=" followed by substituted text
                return self
                    .resolve(ns, ctx, &PValue::Str(format!("={escaped}")), &loc);
            }
            let expr = parse_formula(formula).map_err(|exc| {
                exc.wrap(
                    ErrorKind::Parser,
                    format!("{}: error parsing formula '{text}'", loc.join(".")),
                )
            })?;
            self.eval_expr(ns, ctx, &expr, true, None).map_err(|exc| {
                if exc.kind == ErrorKind::Substitution || exc.kind == ErrorKind::Unset {
                    exc
                } else {
                    exc.wrap(
                        ErrorKind::Formula,
                        format!("{}: evaluation of '{text}' failed", loc.join(".")),
                    )
                }
            })
        } else {
            self.resolve(ns, ctx, value, &loc)
        }
    }

    /// {}-substitution of a non-formula value.
    fn resolve(
        &self,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        value: &PValue,
        location: &[String],
    ) -> Result<PValue> {
        ctx.evaluate(ns, value, location)
    }

    fn eval_expr(
        &self,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        expr: &Expr,
        allow_unset: bool,
        self_value: Option<&PValue>,
    ) -> Result<PValue> {
        let allow_unset = allow_unset || self.allow_unresolved;
        match self.eval_expr_inner(ns, ctx, expr, allow_unset, self_value) {
            Ok(value) => Ok(value),
            // substitution failures inside a formula degrade to an
            // unresolved marker when unset values are allowed
            Err(exc)
                if allow_unset
                    && matches!(exc.kind, ErrorKind::Substitution | ErrorKind::CyclicSubstitution) =>
            {
                Ok(PValue::Unresolved(Unresolved::from_errors(vec![exc.message])))
            }
            Err(exc) => Err(exc),
        }
    }

    fn eval_expr_inner(
        &self,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        expr: &Expr,
        allow_unset: bool,
        self_value: Option<&PValue>,
    ) -> Result<PValue> {
        let value = match expr {
            Expr::Const(v) => self.resolve(ns, ctx, v, &self.location)?,
            Expr::Empty => PValue::Str(String::new()),
            Expr::Unset => bare_unset(),
            Expr::SelfValue => match self_value {
                Some(v) => v.clone(),
                None => {
                    return Err(formula_error(format!(
                        "{}: SELF is not valid here",
                        self.location.join(".")
                    )));
                }
            },
            Expr::Lookup(path) => self.lookup(ns, ctx, path)?,
            Expr::BraceRef(path) => ctx.lookup(ns, path, &self.location)?,
            Expr::Unary(op, arg) => {
                // 'not' treats UNSET as falsey, other unary ops propagate it
                let arg_allow = *op == "not";
                let value = self.eval_expr(ns, ctx, arg, arg_allow || allow_unset, self_value)?;
                if (value.is_unset() || value.is_unresolved()) && *op != "not" {
                    value
                } else {
                    apply_unary(op, &value)?
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval_expr(ns, ctx, lhs, allow_unset, self_value)?;
                if a.is_unset() || a.is_unresolved() {
                    a
                } else {
                    let b = self.eval_expr(ns, ctx, rhs, allow_unset, self_value)?;
                    if b.is_unset() || b.is_unresolved() {
                        b
                    } else {
                        apply_binary(op, &a, &b)?
                    }
                }
            }
            Expr::Subscript(target, index) => {
                let value = self.eval_expr(ns, ctx, target, allow_unset, self_value)?;
                let index = self.eval_expr(ns, ctx, index, allow_unset, self_value)?;
                if value.is_unset() || value.is_unresolved() {
                    value
                } else if index.is_unset() || index.is_unresolved() {
                    index
                } else {
                    getitem(&value, &index)?
                }
            }
            Expr::Func(name, args) => self.eval_function(ns, ctx, name, args, self_value)?,
        };
        if value.is_unset() && !allow_unset {
            return Err(unset_error(format!("'{value}' undefined")));
        }
        Ok(value)
    }

    /// Namespace lookup of a dotted path. A missing final component returns
    /// an UNSET carrying the path; missing intermediates raise.
    fn lookup(&self, ns: &SubstitutionNs, ctx: &SubstContext, path: &str) -> Result<PValue> {
        let mut current = ns;
        let parts: Vec<&str> = path.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            match current.entry(part) {
                Some(NsEntry::Ns(sub)) => {
                    if last {
                        return Ok(sub.to_pvalue());
                    }
                    current = sub;
                }
                Some(NsEntry::Value(value)) => {
                    if !last {
                        return Err(subst_error(format!(
                            "{}: '{path}' unresolved (at '{part}')",
                            self.location.join(".")
                        )));
                    }
                    if current.nosubst {
                        return Ok(value.clone());
                    }
                    return self.resolve(ns, ctx, value, &self.location);
                }
                None => {
                    if last {
                        return Ok(PValue::Unset(path.to_string()));
                    }
                    return Err(subst_error(format!(
                        "{}: '{part}' undefined (in '{path}')",
                        self.location.join(".")
                    )));
                }
            }
        }
        Ok(PValue::Unset(path.to_string()))
    }

    fn eval_function(
        &self,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        name: &str,
        args: &[Expr],
        self_value: Option<&PValue>,
    ) -> Result<PValue> {
        let locstr = || self.location.join(".");
        match name {
            "LIST" => {
                let mut out = Vec::new();
                for arg in args {
                    out.push(self.eval_expr(ns, ctx, arg, true, self_value)?);
                }
                Ok(PValue::List(out))
            }
            "IF" => {
                if args.len() < 3 || args.len() > 4 {
                    return Err(formula_error(format!(
                        "{}: IF() expects 3 or 4 arguments, got {}",
                        locstr(),
                        args.len()
                    )));
                }
                let cond = self.eval_expr(ns, ctx, &args[0], true, self_value)?;
                let chosen = if cond.is_unset() {
                    match args.get(3) {
                        Some(unset_arg) => unset_arg,
                        None => return Ok(PValue::Unset(String::from("IF"))),
                    }
                } else if cond.truthy() {
                    &args[1]
                } else {
                    &args[2]
                };
                self.eval_expr(ns, ctx, chosen, true, self_value)
            }
            "IFSET" => {
                if args.is_empty() || args.len() > 3 {
                    return Err(formula_error(format!(
                        "{}: IFSET() expects 1 to 3 arguments, got {}",
                        locstr(),
                        args.len()
                    )));
                }
                let value = self.eval_expr(ns, ctx, &args[0], true, self_value)?;
                if value.is_unset() {
                    match args.get(2) {
                        Some(if_unset) => self.eval_expr(ns, ctx, if_unset, true, self_value),
                        None => Ok(bare_unset()),
                    }
                } else {
                    match args.get(1) {
                        None => Ok(value),
                        Some(Expr::SelfValue) => Ok(value),
                        Some(if_set) => self.eval_expr(ns, ctx, if_set, true, Some(&value)),
                    }
                }
            }
            "CASES" => {
                let mut i = 0;
                while i + 1 < args.len() {
                    let cond = self.eval_expr(ns, ctx, &args[i], true, self_value)?;
                    if !cond.is_unset() && cond.truthy() {
                        return self.eval_expr(ns, ctx, &args[i + 1], true, self_value);
                    }
                    i += 2;
                }
                // odd trailing argument is the default case
                if i < args.len() {
                    self.eval_expr(ns, ctx, &args[i], true, self_value)
                } else {
                    Ok(PValue::Unset(String::from("CASES")))
                }
            }
            "GLOB" | "EXISTS" => {
                let pattern = self.single_arg(ns, ctx, name, args, self_value)?;
                if pattern.is_unset() {
                    return Ok(pattern);
                }
                let pattern = pattern.to_string();
                let mut matches: Vec<String> = glob::glob(&pattern)
                    .map_err(|exc| formula_error(format!("{}: bad glob pattern '{pattern}': {exc}", locstr())))?
                    .filter_map(|entry| entry.ok())
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect();
                matches.sort();
                if name == "EXISTS" {
                    Ok(PValue::Bool(!matches.is_empty()))
                } else {
                    Ok(PValue::List(matches.into_iter().map(PValue::Str).collect()))
                }
            }
            "DIRNAME" | "BASENAME" | "EXTENSION" | "STRIPEXT" => {
                let path = self.single_arg(ns, ctx, name, args, self_value)?;
                if path.is_unset() {
                    return Ok(path);
                }
                let path = path.to_string();
                let out = match name {
                    "DIRNAME" => basetypes::dirname(&path),
                    "BASENAME" => basetypes::basename(&path),
                    "EXTENSION" => basetypes::extension(&path),
                    _ => basetypes::strip_extension(&path),
                };
                Ok(PValue::Str(out))
            }
            "SORT" | "RSORT" => {
                let value = self.single_arg(ns, ctx, name, args, self_value)?;
                if value.is_unset() {
                    return Ok(value);
                }
                let PValue::List(mut items) = value else {
                    return Err(formula_error(format!("{}: {name}() expects a list", locstr())));
                };
                items.sort_by(|a, b| compare_values(a, b).unwrap_or(Ordering::Equal));
                if name == "RSORT" {
                    items.reverse();
                }
                Ok(PValue::List(items))
            }
            "GETITEM" => {
                if args.len() != 2 {
                    return Err(formula_error(format!(
                        "{}: GETITEM() expects 2 arguments, got {}",
                        locstr(),
                        args.len()
                    )));
                }
                let value = self.eval_expr(ns, ctx, &args[0], true, self_value)?;
                let index = self.eval_expr(ns, ctx, &args[1], true, self_value)?;
                if value.is_unset() {
                    return Ok(value);
                }
                if index.is_unset() {
                    return Ok(index);
                }
                getitem(&value, &index)
            }
            "ERROR" => {
                let message = self.single_arg(ns, ctx, name, args, self_value)?;
                Err(formula_error(format!("{}: {message}", locstr())))
            }
            other => Err(formula_error(format!("{}: unknown function {other}", locstr()))),
        }
    }

    fn single_arg(
        &self,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        name: &str,
        args: &[Expr],
        self_value: Option<&PValue>,
    ) -> Result<PValue> {
        if args.len() != 1 {
            return Err(formula_error(format!(
                "{}: {name}() expects 1 argument, got {}",
                self.location.join("."),
                args.len()
            )));
        }
        self.eval_expr(ns, ctx, &args[0], true, self_value)
    }

    /// Walks a parameter mapping, evaluating each value. An UNSET result
    /// reverts the key to its default (re-evaluated) or deletes it; errors
    /// become Unresolved markers unless raise_subst_errors. The namespace
    /// subtree at `ns_key` (if given) is kept in sync with updated values.
    pub fn evaluate_dict(
        &self,
        params: &IndexMap<String, PValue>,
        ns: &mut SubstitutionNs,
        ctx: &SubstContext,
        ns_key: Option<&str>,
        defaults: &IndexMap<String, PValue>,
        raise_subst_errors: bool,
    ) -> Result<IndexMap<String, PValue>> {
        let mut out = params.clone();
        let names: Vec<String> = out.keys().cloned().collect();
        for name in names {
            let mut value = out[&name].clone();
            if value.is_unresolved() {
                continue;
            }
            loop {
                let result = self.evaluate(&*ns, ctx, &value, std::slice::from_ref(&name));
                let new_value = match result {
                    Ok(v) => v,
                    Err(exc)
                        if matches!(
                            exc.kind,
                            ErrorKind::Substitution | ErrorKind::CyclicSubstitution | ErrorKind::Unset
                        ) =>
                    {
                        if raise_subst_errors {
                            return Err(exc);
                        }
                        PValue::Unresolved(Unresolved::from_errors(vec![exc.message]))
                    }
                    Err(exc) => return Err(exc),
                };
                if is_bare_unset(&new_value) {
                    // revert to default if one is defined, else drop the key
                    match defaults.get(&name) {
                        Some(default) if !default.is_unset() && &value != default => {
                            value = default.clone();
                            out.insert(name.clone(), default.clone());
                            if let Some(key) = ns_key {
                                if let Some(sub) = ns.get_ns_mut(key) {
                                    sub.add(&name, default.clone());
                                }
                            }
                            continue;
                        }
                        _ => {
                            out.shift_remove(&name);
                            if let Some(key) = ns_key {
                                if let Some(sub) = ns.get_ns_mut(key) {
                                    sub.remove(&name);
                                }
                            }
                        }
                    }
                } else if new_value != value {
                    out.insert(name.clone(), new_value.clone());
                    if let Some(key) = ns_key {
                        if let Some(sub) = ns.get_ns_mut(key) {
                            sub.add(&name, new_value);
                        }
                    }
                }
                break;
            }
        }
        Ok(out)
    }
}

fn apply_unary(op: &str, value: &PValue) -> Result<PValue> {
    match op {
        "not" => Ok(PValue::Bool(!value.truthy())),
        "-" => match value {
            PValue::Int(i) => Ok(PValue::Int(-i)),
            PValue::Float(f) => Ok(PValue::Float(-f)),
            other => Err(formula_error(format!("cannot negate {other}"))),
        },
        "+" => match value {
            PValue::Int(_) | PValue::Float(_) => Ok(value.clone()),
            other => Err(formula_error(format!("cannot apply unary + to {other}"))),
        },
        "~" => match value {
            PValue::Int(i) => Ok(PValue::Int(!i)),
            other => Err(formula_error(format!("cannot apply ~ to {other}"))),
        },
        other => Err(formula_error(format!("unknown unary operator '{other}'"))),
    }
}

fn numeric_pair(a: &PValue, b: &PValue) -> Option<(f64, f64, bool)> {
    match (a, b) {
        (PValue::Int(x), PValue::Int(y)) => Some((*x as f64, *y as f64, true)),
        (PValue::Int(x), PValue::Float(y)) => Some((*x as f64, *y, false)),
        (PValue::Float(x), PValue::Int(y)) => Some((*x, *y as f64, false)),
        (PValue::Float(x), PValue::Float(y)) => Some((*x, *y, false)),
        _ => None,
    }
}

pub fn value_eq(a: &PValue, b: &PValue) -> bool {
    if let Some((x, y, _)) = numeric_pair(a, b) {
        return x == y;
    }
    a == b
}

pub fn compare_values(a: &PValue, b: &PValue) -> Option<Ordering> {
    if let Some((x, y, _)) = numeric_pair(a, b) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (PValue::Str(x), PValue::Str(y)) => Some(x.cmp(y)),
        (PValue::Bool(x), PValue::Bool(y)) => Some(x.cmp(y)),
        (PValue::List(x), PValue::List(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match compare_values(xi, yi) {
                    Some(Ordering::Equal) => continue,
                    other => return other,
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        _ => None,
    }
}

fn apply_binary(op: &str, a: &PValue, b: &PValue) -> Result<PValue> {
    match op {
        "and" => Ok(if a.truthy() { b.clone() } else { a.clone() }),
        "or" => Ok(if a.truthy() { a.clone() } else { b.clone() }),
        "==" => Ok(PValue::Bool(value_eq(a, b))),
        "!=" => Ok(PValue::Bool(!value_eq(a, b))),
        "<" | ">" | "<=" | ">=" => {
            let ord = compare_values(a, b)
                .ok_or_else(|| formula_error(format!("cannot compare {a} and {b}")))?;
            let result = match op {
                "<" => ord == Ordering::Less,
                ">" => ord == Ordering::Greater,
                "<=" => ord != Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            Ok(PValue::Bool(result))
        }
        "in" | "not in" => {
            let contained = match b {
                PValue::Str(hay) => hay.contains(&a.to_string()),
                PValue::List(items) => items.iter().any(|item| value_eq(item, a)),
                PValue::Map(map) => map.contains_key(&a.to_string()),
                other => return Err(formula_error(format!("cannot test membership in {other}"))),
            };
            Ok(PValue::Bool(if op == "in" { contained } else { !contained }))
        }
        "+" => {
            if let Some((x, y, both_int)) = numeric_pair(a, b) {
                return Ok(if both_int {
                    PValue::Int(x as i64 + y as i64)
                } else {
                    PValue::Float(x + y)
                });
            }
            match (a, b) {
                (PValue::Str(x), PValue::Str(y)) => Ok(PValue::Str(format!("{x}{y}"))),
                (PValue::Str(x), y) => Ok(PValue::Str(format!("{x}{y}"))),
                (PValue::List(x), PValue::List(y)) => {
                    let mut out = x.clone();
                    out.extend(y.iter().cloned());
                    Ok(PValue::List(out))
                }
                _ => Err(formula_error(format!("cannot add {a} and {b}"))),
            }
        }
        "-" | "*" | "/" | "//" | "%" | "**" => {
            let (x, y, both_int) = numeric_pair(a, b)
                .ok_or_else(|| formula_error(format!("cannot apply '{op}' to {a} and {b}")))?;
            if (op == "/" || op == "//" || op == "%") && y == 0.0 {
                return Err(formula_error("division by zero"));
            }
            let result = match op {
                "-" => x - y,
                "*" => x * y,
                "/" => x / y,
                "//" => (x / y).floor(),
                "%" => x.rem_euclid(y),
                _ => x.powf(y),
            };
            if both_int && op != "/" {
                Ok(PValue::Int(result as i64))
            } else {
                Ok(PValue::Float(result))
            }
        }
        "<<" | ">>" | "&" | "^" | "|" => match (a, b) {
            (PValue::Int(x), PValue::Int(y)) => {
                let result = match op {
                    "<<" => x << y,
                    ">>" => x >> y,
                    "&" => x & y,
                    "^" => x ^ y,
                    _ => x | y,
                };
                Ok(PValue::Int(result))
            }
            _ => Err(formula_error(format!("cannot apply '{op}' to {a} and {b}"))),
        },
        other => Err(formula_error(format!("unknown operator '{other}'"))),
    }
}

fn getitem(value: &PValue, index: &PValue) -> Result<PValue> {
    match (value, index) {
        (PValue::List(items), PValue::Int(i)) => {
            let idx = if *i < 0 { items.len() as i64 + i } else { *i };
            items
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| formula_error(format!("list index {i} out of range")))
        }
        (PValue::Map(map), key) => map
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| formula_error(format!("key '{key}' not found"))),
        (other, index) => Err(formula_error(format!("cannot index {other} with {index}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ns() -> SubstitutionNs {
        let mut ns = SubstitutionNs::new();
        ns.add("previous.x", PValue::Int(1));
        ns.add("previous.x0", PValue::Int(0));
        ns.add("previous.y", PValue::Str("y".into()));
        ns.add("previous.z", PValue::Str("z".into()));
        ns.add("previous2.z", PValue::Str("zz".into()));
        ns
    }

    fn current_params() -> IndexMap<String, PValue> {
        let mut p = IndexMap::new();
        for (k, v) in [
            ("a", "a{previous.x}"),
            ("b", "==escaped"),
            ("c", "=previous.x"),
            ("d", "=IFSET(previous.x)"),
            ("e", "=IFSET(previous.x,\"z\",2)"),
            ("e1", "=IFSET(previous.x,SELF,2)"),
            ("f", "=IFSET(previous.xx)"),
            ("g", "=IFSET(previous.xx,SELF,2)"),
            ("h", "=IF(previous.x, True, 'False')"),
            ("i", "=IF(previous.x0, True, 'False')"),
            ("j", "=IF(previous.xx, True, 'False', UNSET)"),
            ("k", "=current.j"),
            ("m", "=IF((previous.x+1)*previous.x == 2, previous.x == 1, previous.y == 0)"),
            ("o", "=previous.z"),
            ("q", "=LIST(current.a, current.b, current.c + 1, 0)"),
            ("r", "=not IFSET(current.a)"),
            ("t", "=previous*.z"),
        ] {
            p.insert(k.to_string(), PValue::Str(v.to_string()));
        }
        p.insert(
            "u".to_string(),
            PValue::List(vec![PValue::Int(3), PValue::Int(1), PValue::Int(2)]),
        );
        p.insert("u1".to_string(), PValue::Str("=SORT(current.u)".into()));
        p.insert("u2".to_string(), PValue::Str("=RSORT(current.u)".into()));
        p.insert("u3".to_string(), PValue::Str("=GETITEM(current.u, 1)".into()));
        p.insert("u4".to_string(), PValue::Str("=current.u[previous.x]".into()));
        p.insert(
            "v1".to_string(),
            PValue::Str("=CASES(previous.x == 0, deliberately.unset.thats.ok, previous.x == 1, 1)".into()),
        );
        p.insert(
            "v2".to_string(),
            PValue::Str("=CASES(previous.x == 1, 2, previous.x == 2, 2)".into()),
        );
        p.insert(
            "v3".to_string(),
            PValue::Str("=CASES(previous.x == 0, 0, previous.x == 2, 2, 3)".into()),
        );
        p.insert(
            "v4".to_string(),
            PValue::Str("=CASES(previous.x == 0, 0, previous.x == 2, 2)".into()),
        );
        p
    }

    #[test]
    fn formula_dict_evaluation() {
        let mut ns = build_ns();
        let params = current_params();
        ns.add("current", PValue::Map(params.clone()));
        let ctx = SubstContext::new(true);
        let evaluator = Evaluator::new(vec!["top".to_string()], false);
        let r = evaluator
            .evaluate_dict(&params, &mut ns, &ctx, Some("current"), &IndexMap::new(), false)
            .unwrap();

        assert_eq!(r["a"], PValue::Str("a1".into()));
        assert_eq!(r["b"], PValue::Str("=escaped".into()));
        assert_eq!(r["c"], PValue::Int(1));
        assert_eq!(r["d"], PValue::Int(1));
        assert_eq!(r["e"], PValue::Str("z".into()));
        assert_eq!(r["e1"], PValue::Int(1));
        assert!(!r.contains_key("f"));
        assert_eq!(r["g"], PValue::Int(2));
        assert_eq!(r["h"], PValue::Bool(true));
        assert_eq!(r["i"], PValue::Str("False".into()));
        assert!(!r.contains_key("j"));
        assert!(r["k"].is_unset());
        assert_eq!(r["m"], PValue::Bool(true));
        assert_eq!(r["o"], PValue::Str("z".into()));
        assert_eq!(
            r["q"],
            PValue::List(vec![
                PValue::Str("a1".into()),
                PValue::Str("=escaped".into()),
                PValue::Int(2),
                PValue::Int(0)
            ])
        );
        assert_eq!(r["r"], PValue::Bool(false));
        assert_eq!(r["t"], PValue::Str("zz".into()));
        assert_eq!(
            r["u1"],
            PValue::List(vec![PValue::Int(1), PValue::Int(2), PValue::Int(3)])
        );
        assert_eq!(
            r["u2"],
            PValue::List(vec![PValue::Int(3), PValue::Int(2), PValue::Int(1)])
        );
        assert_eq!(r["u3"], PValue::Int(1));
        assert_eq!(r["u4"], PValue::Int(1));
        assert_eq!(r["v1"], PValue::Int(1));
        assert_eq!(r["v2"], PValue::Int(2));
        assert_eq!(r["v3"], PValue::Int(3));
        assert!(r["v4"].is_unset());
    }

    #[test]
    fn error_function_raises() {
        let mut ns = build_ns();
        let ctx = SubstContext::new(true);
        let evaluator = Evaluator::new(vec![], false);
        let mut params = IndexMap::new();
        params.insert("v5".to_string(), PValue::Str("=ERROR(boom!)".into()));
        let err = evaluator
            .evaluate_dict(&params, &mut ns, &ctx, None, &IndexMap::new(), false)
            .unwrap_err();
        assert!(err.to_string().contains("boom!"));
    }

    #[test]
    fn parse_cache_returns_same_ast() {
        let a = parse_formula("previous.x + 1").unwrap();
        let b = parse_formula("previous.x + 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(parse_formula("1 +").is_err());
        assert!(parse_formula("(a.b").is_err());
        // cached parse failures raise again
        assert!(parse_formula("1 +").is_err());
    }

    #[test]
    fn unset_propagates_through_operators() {
        let mut ns = SubstitutionNs::new();
        ns.add("a.x", PValue::Int(1));
        let ctx = SubstContext::new(true);
        let evaluator = Evaluator::new(vec![], false);
        let expr = parse_formula("a.missing + 1").unwrap();
        let v = evaluator.eval_expr(&ns, &ctx, &expr, true, None).unwrap();
        assert!(v.is_unset());
        // not treats UNSET as falsey
        let expr = parse_formula("not a.missing").unwrap();
        let v = evaluator.eval_expr(&ns, &ctx, &expr, true, None).unwrap();
        assert_eq!(v, PValue::Bool(true));
    }

    #[test]
    fn missing_intermediate_raises() {
        let ns = SubstitutionNs::new();
        let ctx = SubstContext::new(true);
        let evaluator = Evaluator::new(vec![], false);
        let expr = parse_formula("no.such.thing == 1").unwrap();
        let v = evaluator.eval_expr(&ns, &ctx, &expr, true, None).unwrap();
        // degrades to an unresolved marker carrying the lookup error
        assert!(v.is_unresolved());
    }

    #[test]
    fn glob_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        let pattern = format!("{}/*.txt", dir.path().display());

        let ns = SubstitutionNs::new();
        let ctx = SubstContext::new(true);
        let evaluator = Evaluator::new(vec![], false);

        let expr = parse_formula(&format!("GLOB('{pattern}')")).unwrap();
        let v = evaluator.eval_expr(&ns, &ctx, &expr, true, None).unwrap();
        match v {
            PValue::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }

        let expr = parse_formula(&format!("EXISTS('{pattern}')")).unwrap();
        assert_eq!(
            evaluator.eval_expr(&ns, &ctx, &expr, true, None).unwrap(),
            PValue::Bool(true)
        );

        let expr = parse_formula("EXISTS('/no/such/path/*.xyz')").unwrap();
        assert_eq!(
            evaluator.eval_expr(&ns, &ctx, &expr, true, None).unwrap(),
            PValue::Bool(false)
        );
    }

    #[test]
    fn anyseq_glob_argument() {
        let expr = parse_formula("EXISTS(/tmp/*.nonexistent-xyz)").unwrap();
        match &*expr {
            Expr::Func(name, args) => {
                assert_eq!(name, "EXISTS");
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn path_functions() {
        let ns = SubstitutionNs::new();
        let ctx = SubstContext::new(true);
        let evaluator = Evaluator::new(vec![], false);
        for (formula, expected) in [
            ("BASENAME('/a/b/c.txt')", "c.txt"),
            ("DIRNAME('/a/b/c.txt')", "/a/b"),
            ("EXTENSION('/a/b/c.txt')", ".txt"),
            ("STRIPEXT('/a/b/c.txt')", "/a/b/c"),
        ] {
            let expr = parse_formula(formula).unwrap();
            assert_eq!(
                evaluator.eval_expr(&ns, &ctx, &expr, true, None).unwrap(),
                PValue::Str(expected.into()),
                "{formula}"
            );
        }
    }

    #[test]
    fn defaults_are_reapplied_on_unset() {
        let mut ns = SubstitutionNs::new();
        let ctx = SubstContext::new(true);
        let evaluator = Evaluator::new(vec![], false);
        let mut params = IndexMap::new();
        params.insert("x".to_string(), PValue::Str("=IFSET(nothing.here)".into()));
        let mut defaults = IndexMap::new();
        defaults.insert("x".to_string(), PValue::Int(7));
        let r = evaluator
            .evaluate_dict(&params, &mut ns, &ctx, None, &defaults, false)
            .unwrap();
        assert_eq!(r["x"], PValue::Int(7));
    }
}
