use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value as YamlValue;
use std::fmt;
use std::path::Path;

/// Marker for a value that could not be resolved (failed substitution,
/// deferred lookup). Carries a displayable value and the error messages that
/// produced it. Braces in the rendered value are escaped so that a marker
/// can never itself trigger further {}-substitution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Unresolved {
    pub value: String,
    pub errors: Vec<String>,
}

impl Unresolved {
    pub fn new(value: impl Into<String>) -> Self {
        let value: String = value.into();
        let errors = vec![format!("'{value}' undefined")];
        Unresolved { value: escape_braces(&value), errors }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        let value = escape_braces(&errors.join("; "));
        Unresolved { value, errors }
    }
}

fn escape_braces(s: &str) -> String {
    s.replace('{', "{{").replace('}', "}}")
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unresolved({})", self.value)
    }
}

/// The value type flowing through namespaces, parameters and formulas.
/// Besides concrete scalars and containers it represents the sentinel states
/// a parameter can be in: Unset (no value supplied), Unresolved (substitution
/// failed), Placeholder (guaranteed to resolve later, e.g. a for-loop
/// iterant) and SkippedOutput (invalid output of a skipped step).
#[derive(Debug, Clone, PartialEq)]
pub enum PValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PValue>),
    Map(IndexMap<String, PValue>),
    Unset(String),
    Unresolved(Unresolved),
    Placeholder(String),
    SkippedOutput(String),
}

impl PValue {
    /// True for any of the sentinel marker states.
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            PValue::Unset(_) | PValue::Unresolved(_) | PValue::Placeholder(_) | PValue::SkippedOutput(_)
        )
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, PValue::Unset(_))
    }

    /// Unresolved in the strict sense: substitution failed and nothing
    /// promises the value will appear later.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, PValue::Unresolved(_) | PValue::SkippedOutput(_))
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, PValue::Placeholder(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            PValue::Null => false,
            PValue::Bool(b) => *b,
            PValue::Int(i) => *i != 0,
            PValue::Float(f) => *f != 0.0,
            PValue::Str(s) => !s.is_empty(),
            PValue::List(l) => !l.is_empty(),
            PValue::Map(m) => !m.is_empty(),
            PValue::Unset(_) => false,
            PValue::Unresolved(_) | PValue::Placeholder(_) | PValue::SkippedOutput(_) => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn from_yaml(value: &YamlValue) -> PValue {
        match value {
            YamlValue::Null => PValue::Null,
            YamlValue::Bool(b) => PValue::Bool(*b),
            YamlValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PValue::Int(i)
                } else {
                    PValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            YamlValue::String(s) => PValue::Str(s.clone()),
            YamlValue::Sequence(seq) => PValue::List(seq.iter().map(PValue::from_yaml).collect()),
            YamlValue::Mapping(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    out.insert(yaml_key_to_string(k), PValue::from_yaml(v));
                }
                PValue::Map(out)
            }
            YamlValue::Tagged(tagged) => PValue::from_yaml(&tagged.value),
        }
    }

    /// Converts back to YAML for dumping and yaml-mode parameter passing.
    /// Marker values render as their display strings.
    pub fn to_yaml(&self) -> YamlValue {
        match self {
            PValue::Null => YamlValue::Null,
            PValue::Bool(b) => YamlValue::Bool(*b),
            PValue::Int(i) => YamlValue::Number((*i).into()),
            PValue::Float(f) => YamlValue::Number(serde_yaml::Number::from(*f)),
            PValue::Str(s) => YamlValue::String(s.clone()),
            PValue::List(l) => YamlValue::Sequence(l.iter().map(|v| v.to_yaml()).collect()),
            PValue::Map(m) => {
                let mut map = serde_yaml::Mapping::new();
                for (k, v) in m {
                    map.insert(YamlValue::String(k.clone()), v.to_yaml());
                }
                YamlValue::Mapping(map)
            }
            other => YamlValue::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PValue::Null => serde_json::Value::Null,
            PValue::Bool(b) => serde_json::Value::Bool(*b),
            PValue::Int(i) => serde_json::Value::from(*i),
            PValue::Float(f) => serde_json::Value::from(*f),
            PValue::Str(s) => serde_json::Value::String(s.clone()),
            PValue::List(l) => serde_json::Value::Array(l.iter().map(|v| v.to_json()).collect()),
            PValue::Map(m) => {
                let mut map = serde_json::Map::new();
                for (k, v) in m {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
            other => serde_json::Value::String(other.to_string()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> PValue {
        match value {
            serde_json::Value::Null => PValue::Null,
            serde_json::Value::Bool(b) => PValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PValue::Int(i)
                } else {
                    PValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => PValue::Str(s.clone()),
            serde_json::Value::Array(a) => PValue::List(a.iter().map(PValue::from_json).collect()),
            serde_json::Value::Object(o) => {
                let mut out = IndexMap::new();
                for (k, v) in o {
                    out.insert(k.clone(), PValue::from_json(v));
                }
                PValue::Map(out)
            }
        }
    }
}

pub fn yaml_key_to_string(key: &YamlValue) -> String {
    match key {
        YamlValue::String(s) => s.clone(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

impl fmt::Display for PValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PValue::Null => write!(f, ""),
            PValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            PValue::Int(i) => write!(f, "{i}"),
            PValue::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            PValue::Str(s) => write!(f, "{s}"),
            PValue::List(l) => {
                let items: Vec<String> = l.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            PValue::Map(m) => {
                let items: Vec<String> = m.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
            PValue::Unset(name) => write!(f, "UNSET({name})"),
            PValue::Unresolved(u) => write!(f, "{u}"),
            PValue::Placeholder(name) => write!(f, "Placeholder({name})"),
            PValue::SkippedOutput(name) => write!(f, "Skipped({name})"),
        }
    }
}

static URI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)://(.*)$").unwrap());

/// Parsed form of a URI-valued parameter. A value without a "proto://"
/// prefix is a local file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    pub protocol: String,
    pub path: String,
    pub remote: bool,
}

/// Parses a URI string. `~` in local paths is expanded against $HOME.
pub fn parse_uri(value: &str, expand_user: bool) -> ParsedUri {
    if let Some(caps) = URI_RE.captures(value) {
        let protocol = caps[1].to_string();
        let remote = protocol != "file";
        let mut path = caps[2].to_string();
        if !remote && expand_user {
            path = expanduser(&path);
        }
        ParsedUri { protocol, path, remote }
    } else {
        ParsedUri {
            protocol: "file".to_string(),
            path: if expand_user { expanduser(value) } else { value.to_string() },
            remote: false,
        }
    }
}

pub fn expanduser(path: &str) -> String {
    if path == "~" {
        std::env::var("HOME").unwrap_or_else(|_| path.to_string())
    } else if let Some(rest) = path.strip_prefix("~/") {
        match std::env::var("HOME") {
            Ok(home) => format!("{home}/{rest}"),
            Err(_) => path.to_string(),
        }
    } else {
        path.to_string()
    }
}

pub fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn dirname(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Extension including the leading dot, or empty. Matches splitext behaviour:
/// a leading dot alone (hidden file) is not an extension.
pub fn extension(path: &str) -> String {
    let base = basename(path);
    match base.rfind('.') {
        Some(idx) if idx > 0 => base[idx..].to_string(),
        _ => String::new(),
    }
}

pub fn strip_extension(path: &str) -> String {
    let ext = extension(path);
    if ext.is_empty() {
        path.to_string()
    } else {
        path[..path.len() - ext.len()].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing() {
        let u = parse_uri("s3://bucket/key", true);
        assert_eq!(u.protocol, "s3");
        assert_eq!(u.path, "bucket/key");
        assert!(u.remote);

        let f = parse_uri("relative/path.ms", false);
        assert_eq!(f.protocol, "file");
        assert_eq!(f.path, "relative/path.ms");
        assert!(!f.remote);

        let f = parse_uri("file:///abs/path", true);
        assert!(!f.remote);
        assert_eq!(f.path, "/abs/path");
    }

    #[test]
    fn path_helpers() {
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(dirname("/a/b/c.txt"), "/a/b");
        assert_eq!(extension("/a/b/c.tar.gz"), ".gz");
        assert_eq!(strip_extension("/a/b/c.tar.gz"), "/a/b/c.tar");
        assert_eq!(extension("/a/b/.hidden"), "");
        assert_eq!(strip_extension("plain"), "plain");
    }

    #[test]
    fn unresolved_escapes_braces() {
        let u = Unresolved::new("{x.y}");
        assert_eq!(u.value, "{{x.y}}");
        assert_eq!(u.errors.len(), 1);
    }

    #[test]
    fn yaml_round_trip() {
        let yaml: YamlValue = serde_yaml::from_str("{a: 1, b: [x, 2.5], c: true}").unwrap();
        let v = PValue::from_yaml(&yaml);
        match &v {
            PValue::Map(m) => {
                assert_eq!(m["a"], PValue::Int(1));
                assert_eq!(
                    m["b"],
                    PValue::List(vec![PValue::Str("x".into()), PValue::Float(2.5)])
                );
                assert_eq!(m["c"], PValue::Bool(true));
            }
            other => panic!("expected map, got {other:?}"),
        }
        let back = v.to_yaml();
        assert_eq!(PValue::from_yaml(&back), v);
    }

    #[test]
    fn truthiness() {
        assert!(!PValue::Str(String::new()).truthy());
        assert!(PValue::Str("x".into()).truthy());
        assert!(!PValue::Int(0).truthy());
        assert!(!PValue::Unset("a.b".into()).truthy());
        assert!(PValue::List(vec![PValue::Null]).truthy());
    }
}
