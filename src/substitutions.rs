use indexmap::IndexMap;
use std::cell::RefCell;

use crate::basetypes::PValue;
use crate::errors::{ErrorKind, Result, StimelaError, subst_error};

/// One entry of a substitution namespace: either a leaf value or a nested
/// sub-namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum NsEntry {
    Value(PValue),
    Ns(SubstitutionNs),
}

/// An ordered, nested namespace over which {}-substitutions are resolved.
/// Sub-namespaces marked `nosubst` return their values verbatim (used for
/// config and structural subtrees). Keys containing `*`/`?` fall back to the
/// lexicographically largest matching key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubstitutionNs {
    entries: IndexMap<String, NsEntry>,
    pub nosubst: bool,
}

impl SubstitutionNs {
    pub fn new() -> Self {
        SubstitutionNs::default()
    }

    pub fn with_nosubst() -> Self {
        SubstitutionNs { entries: IndexMap::new(), nosubst: true }
    }

    /// Adds an item. Dotted names create intermediate sub-namespaces; Map
    /// values become sub-namespaces automatically, inheriting the nosubst
    /// property.
    pub fn add(&mut self, name: &str, value: PValue) {
        let nosubst = self.nosubst;
        self.add_inner(name, value, nosubst);
    }

    /// Adds an item whose whole subtree is exempt from substitution.
    pub fn add_nosubst(&mut self, name: &str, value: PValue) {
        self.add_inner(name, value, true);
    }

    fn add_inner(&mut self, name: &str, value: PValue, nosubst: bool) {
        if let Some((head, rest)) = name.split_once('.') {
            let sub = match self.entries.get_mut(head) {
                Some(NsEntry::Ns(ns)) => ns,
                _ => {
                    let mut ns = SubstitutionNs::new();
                    ns.nosubst = nosubst;
                    self.entries.insert(head.to_string(), NsEntry::Ns(ns));
                    match self.entries.get_mut(head) {
                        Some(NsEntry::Ns(ns)) => ns,
                        _ => unreachable!(),
                    }
                }
            };
            sub.add_inner(rest, value, nosubst);
        } else if let PValue::Map(map) = value {
            let mut ns = SubstitutionNs::new();
            ns.nosubst = nosubst;
            for (k, v) in map {
                ns.add_inner(&k, v, nosubst);
            }
            self.entries.insert(name.to_string(), NsEntry::Ns(ns));
        } else {
            self.entries.insert(name.to_string(), NsEntry::Value(value));
        }
    }

    pub fn add_ns(&mut self, name: &str, ns: SubstitutionNs) {
        self.entries.insert(name.to_string(), NsEntry::Ns(ns));
    }

    /// Deep-merges a map of parameter values into this namespace.
    pub fn merge(&mut self, values: &IndexMap<String, PValue>) {
        for (name, value) in values {
            match (self.entries.get_mut(name), value) {
                (Some(NsEntry::Ns(sub)), PValue::Map(map)) => {
                    sub.merge(map);
                }
                _ => self.add(name, value.clone()),
            }
        }
    }

    pub fn merge_ns(&mut self, other: &SubstitutionNs) {
        for (name, entry) in &other.entries {
            match (self.entries.get_mut(name), entry) {
                (Some(NsEntry::Ns(sub)), NsEntry::Ns(other_sub)) => sub.merge_ns(other_sub),
                (_, NsEntry::Ns(other_sub)) => {
                    self.entries.insert(name.clone(), NsEntry::Ns(other_sub.clone()));
                }
                (_, NsEntry::Value(v)) => {
                    self.entries.insert(name.clone(), NsEntry::Value(v.clone()));
                }
            }
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.shift_remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a single key, applying wildcard fallback: a key containing
    /// `*`/`?` that is not literally present matches the lexicographically
    /// largest existing key.
    pub fn entry(&self, key: &str) -> Option<&NsEntry> {
        if let Some(entry) = self.entries.get(key) {
            return Some(entry);
        }
        if key.contains('*') || key.contains('?') {
            let mut matches: Vec<&String> =
                self.entries.keys().filter(|k| wildcard_match(key, k)).collect();
            matches.sort();
            if let Some(last) = matches.pop() {
                return self.entries.get(last.as_str());
            }
        }
        None
    }

    pub fn get_ns(&self, key: &str) -> Option<&SubstitutionNs> {
        match self.entry(key) {
            Some(NsEntry::Ns(ns)) => Some(ns),
            _ => None,
        }
    }

    pub fn get_ns_mut(&mut self, key: &str) -> Option<&mut SubstitutionNs> {
        match self.entries.get_mut(key) {
            Some(NsEntry::Ns(ns)) => Some(ns),
            _ => None,
        }
    }

    /// Raw (non-substituting) lookup of a dotted path.
    pub fn lookup_path(&self, path: &str) -> Option<&NsEntry> {
        let mut ns = self;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let entry = ns.entry(part)?;
            if parts.peek().is_none() {
                return Some(entry);
            }
            match entry {
                NsEntry::Ns(sub) => ns = sub,
                NsEntry::Value(_) => return None,
            }
        }
        None
    }

    /// Renders the namespace as a map of PValues (sub-namespaces as maps).
    pub fn to_pvalue(&self) -> PValue {
        let mut map = IndexMap::new();
        for (k, entry) in &self.entries {
            match entry {
                NsEntry::Value(v) => {
                    map.insert(k.clone(), v.clone());
                }
                NsEntry::Ns(ns) => {
                    map.insert(k.clone(), ns.to_pvalue());
                }
            }
        }
        PValue::Map(map)
    }
}

/// fnmatch-style matching for wildcard namespace keys.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], n: &[u8]) -> bool {
        if p.is_empty() {
            return n.is_empty();
        }
        match p[0] {
            b'*' => matches(&p[1..], n) || (!n.is_empty() && matches(p, &n[1..])),
            b'?' => !n.is_empty() && matches(&p[1..], &n[1..]),
            c => !n.is_empty() && n[0] == c && matches(&p[1..], &n[1..]),
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

/// What to do when a {}-reference cannot be resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ForgivePolicy {
    /// Errors are recorded (and raised if raise_errors); value becomes "".
    #[default]
    None,
    /// The failed reference is replaced by an empty string.
    Empty,
    /// The failed reference is replaced by "(error message)".
    ErrorText,
    /// The failed reference is replaced by the template, which may use
    /// {name}, {target} and {exc}.
    Template(String),
}

const PROTECT_OPEN: char = '\u{00AB}';
const PROTECT_CLOSE: char = '\u{00BB}';

/// Scopes {}-substitution over a namespace, with a configurable error
/// policy. Collects errors and forgiven references; tracks in-flight nested
/// lookups to detect cyclic substitutions. Passed explicitly to every
/// evaluation call (no thread-local state), so scatter workers are safe by
/// construction.
#[derive(Debug, Default)]
pub struct SubstContext {
    pub raise_errors: bool,
    pub forgive: ForgivePolicy,
    pub errors: RefCell<Vec<StimelaError>>,
    pub forgivens: RefCell<Vec<String>>,
    active: RefCell<Vec<String>>,
}

impl SubstContext {
    pub fn new(raise_errors: bool) -> Self {
        SubstContext { raise_errors, ..Default::default() }
    }

    pub fn forgiving(forgive: ForgivePolicy) -> Self {
        SubstContext { raise_errors: false, forgive, ..Default::default() }
    }

    pub fn take_errors(&self) -> Vec<StimelaError> {
        self.errors.borrow_mut().drain(..).collect()
    }

    /// Evaluates {}-substitutions in a value against the namespace. Strings
    /// are formatted; lists and maps are recursed into; everything else is
    /// returned as is.
    pub fn evaluate(&self, ns: &SubstitutionNs, value: &PValue, location: &[String]) -> Result<PValue> {
        match value {
            PValue::Str(s) => {
                if !s.contains('{') {
                    return Ok(value.clone());
                }
                self.evaluate_str(ns, s, location, 0).map(PValue::Str)
            }
            PValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let mut loc = location.to_vec();
                    loc.push(i.to_string());
                    out.push(self.evaluate(ns, item, &loc)?);
                }
                Ok(PValue::List(out))
            }
            PValue::Map(map) => {
                let mut out = IndexMap::new();
                for (k, item) in map {
                    let mut loc = location.to_vec();
                    loc.push(k.clone());
                    out.insert(k.clone(), self.evaluate(ns, item, &loc)?);
                }
                Ok(PValue::Map(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Formats one string. `depth` > 0 means this is a nested pass (the value
    /// of a looked-up reference), in which `{{`/`}}` are protected so that
    /// only the outermost pass collapses them.
    fn evaluate_str(
        &self,
        ns: &SubstitutionNs,
        value: &str,
        location: &[String],
        depth: usize,
    ) -> Result<String> {
        let source: String = if depth > 0 {
            value.replace("{{", &PROTECT_OPEN.to_string()).replace("}}", &PROTECT_CLOSE.to_string())
        } else {
            value.to_string()
        };

        let mut out = String::with_capacity(source.len());
        let chars: Vec<char> = source.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let ch = chars[i];
            if ch == '{' {
                if i + 1 < chars.len() && chars[i + 1] == '{' {
                    out.push('{');
                    i += 2;
                    continue;
                }
                // find the closing brace
                let close = chars[i + 1..].iter().position(|&c| c == '}').map(|p| p + i + 1);
                let Some(close) = close else {
                    return self.handle_error(
                        value,
                        location,
                        "",
                        subst_error(format!("unbalanced braces in '{value}'")),
                    );
                };
                let token: String = chars[i + 1..close].iter().collect();
                let (path, spec) = match token.split_once(':') {
                    Some((p, s)) => (p.to_string(), Some(s.to_string())),
                    None => (token.clone(), None),
                };
                match self.lookup(ns, &path, location) {
                    Ok(val) => match format_with_spec(&val, spec.as_deref()) {
                        Ok(rendered) => out.push_str(&rendered),
                        Err(err) => return self.handle_error(value, location, &path, err),
                    },
                    Err(err) => match self.forgive_token(&path, location, &err) {
                        Some(replacement) => out.push_str(&replacement),
                        None => return self.handle_error(value, location, &path, err),
                    },
                }
                i = close + 1;
            } else if ch == '}' {
                if i + 1 < chars.len() && chars[i + 1] == '}' {
                    out.push('}');
                    i += 2;
                } else {
                    return self.handle_error(
                        value,
                        location,
                        "",
                        subst_error(format!("unbalanced braces in '{value}'")),
                    );
                }
            } else {
                out.push(ch);
                i += 1;
            }
        }

        if depth > 0 {
            out = out.replace(PROTECT_OPEN, "{{").replace(PROTECT_CLOSE, "}}");
        }
        Ok(out)
    }

    /// Resolves a dotted reference against the namespace, recursively
    /// substituting the result if it is itself a template. Detects cycles by
    /// tracking the set of in-flight reference paths.
    pub fn lookup(&self, ns: &SubstitutionNs, path: &str, location: &[String]) -> Result<PValue> {
        {
            let active = self.active.borrow();
            if active.iter().any(|p| p == path) {
                let from = active.last().cloned().unwrap_or_default();
                return Err(StimelaError::new(
                    ErrorKind::CyclicSubstitution,
                    format!("'{{{path}}}' is a cyclic substitution (via '{{{from}}}')"),
                ));
            }
        }

        let mut current = ns;
        let mut nosubst = ns.nosubst;
        let parts: Vec<&str> = path.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            match current.entry(part) {
                Some(NsEntry::Ns(sub)) => {
                    if last {
                        return Ok(sub.to_pvalue());
                    }
                    current = sub;
                    nosubst = sub.nosubst;
                }
                Some(NsEntry::Value(value)) => {
                    if !last {
                        return Err(subst_error(format!(
                            "'{path}': '{part}' is not a nested namespace"
                        )));
                    }
                    if self.raise_errors && value.is_unresolved() {
                        return Err(subst_error(format!("unresolved substitution for {path} ({value})")));
                    }
                    if nosubst {
                        return Ok(value.clone());
                    }
                    // nested substitution of the looked-up value
                    if let PValue::Str(s) = value {
                        if s.contains('{') {
                            // inner lookups resolve against the root namespace
                            self.active.borrow_mut().push(path.to_string());
                            let result = self.evaluate_str(ns, s, location, 1).map(PValue::Str);
                            self.active.borrow_mut().pop();
                            return result;
                        }
                    }
                    return Ok(value.clone());
                }
                None => {
                    return Err(subst_error(format!("'{{{path}}}' unresolved ('{part}' not found)")));
                }
            }
        }
        Err(subst_error(format!("'{{{path}}}' unresolved")))
    }

    fn forgive_token(&self, path: &str, location: &[String], err: &StimelaError) -> Option<String> {
        let replacement = match &self.forgive {
            ForgivePolicy::None => return None,
            ForgivePolicy::Empty => String::new(),
            ForgivePolicy::ErrorText => format!("({})", err.message),
            ForgivePolicy::Template(template) => template
                .replace("{name}", &location.join("."))
                .replace("{target}", path)
                .replace("{exc}", &err.message),
        };
        self.forgivens.borrow_mut().push(path.to_string());
        Some(replacement)
    }

    /// Records an unforgiven error; raises it in raise_errors mode, else the
    /// whole string value degrades to "".
    fn handle_error(
        &self,
        value: &str,
        location: &[String],
        target: &str,
        err: StimelaError,
    ) -> Result<String> {
        let name = location.join(".");
        let locstr = if name.is_empty() {
            format!("'{value}'")
        } else {
            format!("{name}='{value}'")
        };
        let wrapped = if err.kind == ErrorKind::CyclicSubstitution {
            StimelaError::new(err.kind, format!("{{{target}}}: {}, in {locstr}", err.message))
        } else {
            StimelaError::new(ErrorKind::Substitution, format!("'{{{target}}}' unresolved, in {locstr}"))
        };
        if self.raise_errors {
            return Err(wrapped);
        }
        self.errors.borrow_mut().push(wrapped);
        Ok(String::new())
    }
}

/// Applies a minimal format spec (integer width/zero-pad, float precision)
/// to a looked-up value.
fn format_with_spec(value: &PValue, spec: Option<&str>) -> Result<String> {
    let Some(spec) = spec else {
        return Ok(value.to_string());
    };
    if spec.is_empty() {
        return Ok(value.to_string());
    }
    if let Some(precision) = spec.strip_prefix('.').and_then(|s| s.strip_suffix('f')) {
        let prec: usize = precision
            .parse()
            .map_err(|_| subst_error(format!("invalid format spec ':{spec}'")))?;
        let num = match value {
            PValue::Float(f) => *f,
            PValue::Int(i) => *i as f64,
            other => return Err(subst_error(format!("cannot format {other} as float"))),
        };
        return Ok(format!("{num:.prec$}"));
    }
    if let Some(width) = spec.strip_suffix('d') {
        let (zero, width) = if let Some(w) = width.strip_prefix('0') { (true, w) } else { (false, width) };
        let w: usize = if width.is_empty() {
            0
        } else {
            width.parse().map_err(|_| subst_error(format!("invalid format spec ':{spec}'")))?
        };
        let num = match value {
            PValue::Int(i) => *i,
            other => return Err(subst_error(format!("cannot format {other} as integer"))),
        };
        return Ok(if zero { format!("{num:0w$}") } else { format!("{num:w$}") });
    }
    // unknown specs pass through to a plain rendering
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ns() -> SubstitutionNs {
        let mut ns = SubstitutionNs::new();
        let mut x = SubstitutionNs::with_nosubst();
        x.add("a", PValue::Int(1));
        x.add("b", PValue::Str("{foo.a} not substituted since x is nosubst".into()));
        x.add("c", PValue::Int(3));
        ns.add_ns("x", x);

        ns.add("foo.zero", PValue::Int(0));
        ns.add("foo.a", PValue::Str("{x.a}-{x.c}".into()));
        ns.add("foo.b", PValue::Str("{foo.a}{{}}".into()));
        ns.add("bar.a", PValue::Int(1));
        ns.add("bar.b", PValue::Str("{foo.b}".into()));
        ns.add("bar.b1", PValue::Str("{bar.b}".into()));
        ns.add("bar.c", PValue::Str("{foo.x} deliberately unresolved".into()));
        ns.add("bar.d", PValue::Str("{bar.d}".into()));
        ns.add("bar.e", PValue::Str("{bar.f}".into()));
        ns.add("bar.f", PValue::Str("{bar.e}".into()));
        ns
    }

    fn eval_str(ctx: &SubstContext, ns: &SubstitutionNs, s: &str) -> Result<PValue> {
        ctx.evaluate(ns, &PValue::Str(s.into()), &[])
    }

    #[test]
    fn basic_substitution() {
        let ns = build_ns();
        let ctx = SubstContext::new(true);
        assert_eq!(eval_str(&ctx, &ns, "{bar.a}").unwrap(), PValue::Str("1".into()));
        assert_eq!(eval_str(&ctx, &ns, "{bar.b}").unwrap(), PValue::Str("1-3{}".into()));
        assert_eq!(eval_str(&ctx, &ns, "{bar.b1}").unwrap(), PValue::Str("1-3{}".into()));
    }

    #[test]
    fn container_substitution() {
        let ns = build_ns();
        let ctx = SubstContext::new(true);
        let value = PValue::List(vec![
            PValue::Str("{x.a}-{x.c}".into()),
            PValue::Str("{foo.a}{{}}".into()),
        ]);
        let result = ctx.evaluate(&ns, &value, &[]).unwrap();
        assert_eq!(
            result,
            PValue::List(vec![PValue::Str("1-3".into()), PValue::Str("1-3{}".into())])
        );
    }

    #[test]
    fn nosubst_subtree_is_verbatim() {
        let ns = build_ns();
        let ctx = SubstContext::new(true);
        let v = eval_str(&ctx, &ns, "{x.b}").unwrap();
        assert_eq!(v, PValue::Str("{foo.a} not substituted since x is nosubst".into()));
    }

    #[test]
    fn unresolved_collects_error() {
        let ns = build_ns();
        let ctx = SubstContext::new(false);
        let v = eval_str(&ctx, &ns, "{bar.c}").unwrap();
        assert_eq!(v, PValue::Str(String::new()));
        assert_eq!(ctx.errors.borrow().len(), 1);
    }

    #[test]
    fn forgiving_modes() {
        let ns = build_ns();

        let ctx = SubstContext::forgiving(ForgivePolicy::Empty);
        assert_eq!(eval_str(&ctx, &ns, "{nothing}").unwrap(), PValue::Str(String::new()));
        assert!(ctx.errors.borrow().is_empty());

        let ctx = SubstContext::forgiving(ForgivePolicy::Template("XX".into()));
        assert_eq!(eval_str(&ctx, &ns, "{nothing}").unwrap(), PValue::Str("XX".into()));
        assert_eq!(
            eval_str(&ctx, &ns, "{bar.c}").unwrap(),
            PValue::Str("XX deliberately unresolved".into())
        );
        assert_eq!(eval_str(&ctx, &ns, "{bug.x} {bug.y}").unwrap(), PValue::Str("XX XX".into()));

        let ctx = SubstContext::forgiving(ForgivePolicy::ErrorText);
        let v = eval_str(&ctx, &ns, "{nothing}").unwrap();
        let text = match v {
            PValue::Str(s) => s,
            other => panic!("{other:?}"),
        };
        assert!(text.starts_with('(') && text.ends_with(')'));
    }

    #[test]
    fn cyclic_substitution_detected() {
        let ns = build_ns();
        let ctx = SubstContext::new(true);
        let err = eval_str(&ctx, &ns, "{bar.d}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CyclicSubstitution);
        let err = eval_str(&ctx, &ns, "{bar.e}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CyclicSubstitution);

        // non-raising mode records the errors instead
        let ctx = SubstContext::new(false);
        let _ = eval_str(&ctx, &ns, "{bar.d}");
        let _ = eval_str(&ctx, &ns, "{bar.e}");
        assert_eq!(ctx.errors.borrow().len(), 2);
    }

    #[test]
    fn idempotent_without_braces() {
        let ns = build_ns();
        let ctx = SubstContext::new(true);
        let v = eval_str(&ctx, &ns, "no tokens here").unwrap();
        assert_eq!(v, PValue::Str("no tokens here".into()));
    }

    #[test]
    fn wildcard_keys_match_largest() {
        let mut ns = SubstitutionNs::new();
        ns.add("previous.z", PValue::Str("z".into()));
        ns.add("previous2.z", PValue::Str("zz".into()));
        let ctx = SubstContext::new(true);
        let v = ctx.lookup(&ns, "previous*.z", &[]).unwrap();
        assert_eq!(v, PValue::Str("zz".into()));
    }

    #[test]
    fn format_specs() {
        let mut ns = SubstitutionNs::new();
        ns.add("foo.a", PValue::Int(7));
        ns.add("foo.f", PValue::Float(1.23456));
        let ctx = SubstContext::new(true);
        assert_eq!(eval_str(&ctx, &ns, "{foo.a:02d}").unwrap(), PValue::Str("07".into()));
        assert_eq!(eval_str(&ctx, &ns, "{foo.f:.2f}").unwrap(), PValue::Str("1.23".into()));
    }

    #[test]
    fn dotted_assignment_creates_subnamespaces() {
        let mut ns = SubstitutionNs::new();
        ns.add("a.b.c", PValue::Int(42));
        match ns.lookup_path("a.b.c") {
            Some(NsEntry::Value(PValue::Int(42))) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(ns.get_ns("a").is_some());
    }

    #[test]
    fn merge_is_deep() {
        let mut ns = SubstitutionNs::new();
        ns.add("a.x", PValue::Int(1));
        let mut update = IndexMap::new();
        let mut sub = IndexMap::new();
        sub.insert("y".to_string(), PValue::Int(2));
        update.insert("a".to_string(), PValue::Map(sub));
        ns.merge(&update);
        assert!(ns.lookup_path("a.x").is_some());
        assert!(ns.lookup_path("a.y").is_some());
    }
}
