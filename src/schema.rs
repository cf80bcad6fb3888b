use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;
use std::collections::HashSet;

use crate::basetypes::{PValue, yaml_key_to_string};
use crate::errors::{Result, schema_error};

/// Parsed form of a dtype expression string, e.g. "List[File]" or
/// "Union[int, str]".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DType {
    Str,
    Int,
    Float,
    Bool,
    File,
    Directory,
    MS,
    URI,
    Any,
    List(Box<DType>),
    Dict(Box<DType>, Box<DType>),
    Tuple(Vec<DType>),
    Optional(Box<DType>),
    Union(Vec<DType>),
}

impl DType {
    /// True for the semantic path types (File/Directory/MS/URI).
    pub fn is_file_like(&self) -> bool {
        matches!(self, DType::File | DType::Directory | DType::MS | DType::URI)
    }

    /// File-like types subject to filesystem existence checks.
    pub fn is_path_type(&self) -> bool {
        matches!(self, DType::File | DType::Directory | DType::MS)
    }

    pub fn is_path_list_type(&self) -> bool {
        match self {
            DType::List(inner) => inner.is_path_type(),
            _ => false,
        }
    }

    /// Directory-kind path (Directory and MS map to directories on disk).
    pub fn is_dir_kind(&self) -> bool {
        matches!(self, DType::Directory | DType::MS)
    }
}

/// Parses a dtype expression. The grammar mirrors the subset of type
/// annotations the configuration language accepts.
pub fn parse_dtype(text: &str) -> Result<DType> {
    let mut parser = DTypeParser { text: text.trim(), pos: 0 };
    let dtype = parser.parse()?;
    parser.skip_ws();
    if parser.pos != parser.text.len() {
        return Err(schema_error(format!("'{text}' is not a valid dtype")));
    }
    Ok(dtype)
}

struct DTypeParser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> DTypeParser<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.text.len() && self.text.as_bytes()[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn parse(&mut self) -> Result<DType> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.text.len() {
            let ch = self.text.as_bytes()[self.pos];
            if ch.is_ascii_alphanumeric() || ch == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word = &self.text[start..self.pos];
        if word.is_empty() {
            return Err(schema_error(format!("'{}' is not a valid dtype", self.text)));
        }
        self.skip_ws();
        let bracketed = self.pos < self.text.len() && self.text.as_bytes()[self.pos] == b'[';
        match word {
            "str" => Ok(DType::Str),
            "int" => Ok(DType::Int),
            "float" => Ok(DType::Float),
            "bool" => Ok(DType::Bool),
            "File" => Ok(DType::File),
            "Directory" => Ok(DType::Directory),
            "MS" => Ok(DType::MS),
            "URI" => Ok(DType::URI),
            "Any" => Ok(DType::Any),
            "List" => {
                let args = self.parse_args(bracketed, word)?;
                if args.len() != 1 {
                    return Err(schema_error("List[] takes one type argument"));
                }
                Ok(DType::List(Box::new(args.into_iter().next().unwrap())))
            }
            "Dict" => {
                let args = self.parse_args(bracketed, word)?;
                if args.len() != 2 {
                    return Err(schema_error("Dict[] takes two type arguments"));
                }
                let mut it = args.into_iter();
                Ok(DType::Dict(Box::new(it.next().unwrap()), Box::new(it.next().unwrap())))
            }
            "Tuple" => {
                let args = self.parse_args(bracketed, word)?;
                if args.is_empty() {
                    return Err(schema_error("Tuple[] takes at least one type argument"));
                }
                Ok(DType::Tuple(args))
            }
            "Optional" => {
                let args = self.parse_args(bracketed, word)?;
                if args.len() != 1 {
                    return Err(schema_error("Optional[] takes one type argument"));
                }
                Ok(DType::Optional(Box::new(args.into_iter().next().unwrap())))
            }
            "Union" => {
                let args = self.parse_args(bracketed, word)?;
                if args.len() < 2 {
                    return Err(schema_error("Union[] takes at least two type arguments"));
                }
                Ok(DType::Union(args))
            }
            other => Err(schema_error(format!("'{other}' is not a valid dtype"))),
        }
    }

    fn parse_args(&mut self, bracketed: bool, word: &str) -> Result<Vec<DType>> {
        if !bracketed {
            return Err(schema_error(format!("{word}[] requires type arguments")));
        }
        self.pos += 1; // '['
        let mut args = Vec::new();
        loop {
            args.push(self.parse()?);
            self.skip_ws();
            if self.pos >= self.text.len() {
                return Err(schema_error(format!("'{}' is not a valid dtype", self.text)));
            }
            match self.text.as_bytes()[self.pos] {
                b',' => {
                    self.pos += 1;
                }
                b']' => {
                    self.pos += 1;
                    return Ok(args);
                }
                _ => return Err(schema_error(format!("'{}' is not a valid dtype", self.text))),
            }
        }
    }
}

/// Recursively collects file-like leaf values from a composite-typed value.
pub fn get_filelikes(dtype: &DType, value: &PValue, out: &mut Vec<String>) {
    match dtype {
        DType::List(inner) => {
            if let PValue::List(items) = value {
                for item in items {
                    get_filelikes(inner, item, out);
                }
            }
        }
        DType::Tuple(inners) => {
            if let PValue::List(items) = value {
                for (i, item) in items.iter().enumerate() {
                    let dt = inners.get(i).or_else(|| inners.first());
                    if let Some(dt) = dt {
                        get_filelikes(dt, item, out);
                    }
                }
            }
        }
        DType::Dict(kt, vt) => {
            if let PValue::Map(map) = value {
                for (k, v) in map {
                    get_filelikes(kt, &PValue::Str(k.clone()), out);
                    get_filelikes(vt, v, out);
                }
            }
        }
        DType::Optional(inner) => {
            if !matches!(value, PValue::Null) {
                get_filelikes(inner, value, out);
            }
        }
        DType::Union(branches) => {
            for branch in branches {
                if shallow_matches(branch, value) {
                    get_filelikes(branch, value, out);
                }
            }
        }
        dt if dt.is_file_like() => {
            if let PValue::Str(s) = value {
                if !out.contains(s) {
                    out.push(s.clone());
                }
            }
        }
        _ => {}
    }
}

fn shallow_matches(dtype: &DType, value: &PValue) -> bool {
    match dtype {
        DType::List(_) | DType::Tuple(_) => matches!(value, PValue::List(_)),
        DType::Dict(_, _) => matches!(value, PValue::Map(_)),
        DType::Str | DType::File | DType::Directory | DType::MS | DType::URI => {
            matches!(value, PValue::Str(_))
        }
        DType::Int => matches!(value, PValue::Int(_)),
        DType::Float => matches!(value, PValue::Float(_) | PValue::Int(_)),
        DType::Bool => matches!(value, PValue::Bool(_)),
        DType::Optional(inner) => matches!(value, PValue::Null) || shallow_matches(inner, value),
        DType::Union(branches) => branches.iter().any(|b| shallow_matches(b, value)),
        DType::Any => true,
    }
}

/// Dictates how a parameter is rendered into command-line arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterPolicies {
    pub key_value: Option<bool>,
    pub positional: Option<bool>,
    pub positional_head: Option<bool>,
    // "list" | "repeat" | "[]" | any other string is used as a join separator
    pub repeat: Option<String>,
    pub prefix: Option<String>,
    pub skip: Option<bool>,
    pub skip_implicits: Option<bool>,
    pub disable_substitutions: Option<bool>,
    pub explicit_true: Option<String>,
    pub explicit_false: Option<String>,
    pub split: Option<String>,
    pub replace: Option<IndexMap<String, String>>,
    pub format: Option<String>,
    pub format_list: Option<Vec<String>>,
    pub format_list_scalar: Option<Vec<String>>,
    pub pass_missing_as_none: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathPolicies {
    pub mkdir_parent: bool,
    pub access_parent: bool,
    pub write_parent: bool,
    pub remove_if_exists: bool,
}

impl Default for PathPolicies {
    fn default() -> Self {
        PathPolicies {
            mkdir_parent: true,
            access_parent: false,
            write_parent: false,
            remove_if_exists: false,
        }
    }
}

/// Cosmetic classification of parameters, used for help and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParameterCategory {
    Required = 0,
    Optional = 1,
    Implicit = 2,
    Obscure = 3,
    Hidden = 4,
}

impl ParameterCategory {
    pub fn parse(name: &str) -> Option<ParameterCategory> {
        match name.to_ascii_lowercase().as_str() {
            "required" => Some(ParameterCategory::Required),
            "optional" => Some(ParameterCategory::Optional),
            "implicit" => Some(ParameterCategory::Implicit),
            "obscure" => Some(ParameterCategory::Obscure),
            "hidden" => Some(ParameterCategory::Hidden),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ParameterCategory::Required => "Required",
            ParameterCategory::Optional => "Optional",
            ParameterCategory::Implicit => "Implicit",
            ParameterCategory::Obscure => "Obscure",
            ParameterCategory::Hidden => "Hidden",
        }
    }
}

/// Schema of a single cab or recipe parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub info: String,
    pub dtype_str: String,
    pub dtype: DType,
    pub writable: bool,
    pub implicit: Option<PValue>,
    pub tags: Vec<String>,
    pub required: Option<bool>,
    pub choices: Vec<PValue>,
    pub element_choices: Vec<PValue>,
    pub default: PValue,
    pub aliases: Vec<String>,
    pub mkdir: bool,
    pub path_policies: PathPolicies,
    pub must_exist: Option<bool>,
    pub skip_freshness_checks: Option<bool>,
    pub nom_de_guerre: Option<String>,
    pub policies: ParameterPolicies,
    pub category: Option<ParameterCategory>,
    pub metavar: Option<String>,
    pub abbreviation: Option<String>,
    pub metadata: IndexMap<String, PValue>,
    pub suppress_cli_default: bool,
    pub is_input: bool,
}

impl Default for Parameter {
    fn default() -> Self {
        Parameter {
            info: String::new(),
            dtype_str: "str".to_string(),
            dtype: DType::Str,
            writable: false,
            implicit: None,
            tags: Vec::new(),
            required: None,
            choices: Vec::new(),
            element_choices: Vec::new(),
            default: PValue::Unset(String::new()),
            aliases: Vec::new(),
            mkdir: false,
            path_policies: PathPolicies::default(),
            must_exist: None,
            skip_freshness_checks: None,
            nom_de_guerre: None,
            policies: ParameterPolicies::default(),
            category: None,
            metavar: None,
            abbreviation: None,
            metadata: IndexMap::new(),
            suppress_cli_default: false,
            is_input: true,
        }
    }
}

impl Parameter {
    pub fn is_required(&self) -> bool {
        self.required == Some(true)
    }

    pub fn is_output(&self) -> bool {
        !self.is_input
    }

    /// A named output is an explicit (non-implicit) file-like output.
    pub fn is_named_output(&self) -> bool {
        self.is_output() && self.dtype.is_file_like() && self.implicit.is_none()
    }

    pub fn has_default(&self) -> bool {
        !self.default.is_unset()
    }

    /// Returns the category, deriving it from required/implicit when unset.
    pub fn get_category(&self) -> ParameterCategory {
        if let Some(cat) = self.category {
            return cat;
        }
        if self.is_required() {
            ParameterCategory::Required
        } else if self.implicit.is_some() {
            ParameterCategory::Implicit
        } else {
            ParameterCategory::Optional
        }
    }
}

const PARAMETER_FIELDS: &[&str] = &[
    "info",
    "writable",
    "dtype",
    "implicit",
    "tags",
    "required",
    "choices",
    "element_choices",
    "default",
    "aliases",
    "mkdir",
    "path_policies",
    "must_exist",
    "skip_freshness_checks",
    "nom_de_guerre",
    "policies",
    "category",
    "metavar",
    "abbreviation",
    "metadata",
    "suppress_cli_default",
];

fn yaml_to_bool(value: &YamlValue, field: &str) -> Result<bool> {
    match value {
        YamlValue::Bool(b) => Ok(*b),
        other => Err(schema_error(format!("{field}: boolean expected, got {other:?}"))),
    }
}

fn yaml_to_string(value: &YamlValue, field: &str) -> Result<String> {
    match value {
        YamlValue::String(s) => Ok(s.clone()),
        YamlValue::Bool(b) => Ok(b.to_string()),
        YamlValue::Number(n) => Ok(n.to_string()),
        other => Err(schema_error(format!("{field}: string expected, got {other:?}"))),
    }
}

fn yaml_to_string_list(value: &YamlValue, field: &str) -> Result<Vec<String>> {
    match value {
        YamlValue::String(s) => Ok(vec![s.clone()]),
        YamlValue::Sequence(seq) => seq.iter().map(|v| yaml_to_string(v, field)).collect(),
        other => Err(schema_error(format!(
            "{field}: string or list of strings expected, got {other:?}"
        ))),
    }
}

/// Parses a cab-level default policies block.
pub fn parse_cab_policies(value: &YamlValue, label: &str) -> Result<ParameterPolicies> {
    parse_policies(value)
        .map_err(|e| e.wrap(crate::errors::ErrorKind::Schema, format!("{label}: bad policies")))
}

fn parse_policies(value: &YamlValue) -> Result<ParameterPolicies> {
    let map = match value {
        YamlValue::Mapping(m) => m,
        YamlValue::Null => return Ok(ParameterPolicies::default()),
        other => return Err(schema_error(format!("policies: mapping expected, got {other:?}"))),
    };
    let mut p = ParameterPolicies::default();
    for (key, val) in map {
        let key = yaml_key_to_string(key);
        if matches!(val, YamlValue::Null) {
            continue;
        }
        match key.as_str() {
            "key_value" => p.key_value = Some(yaml_to_bool(val, "policies.key_value")?),
            "positional" => p.positional = Some(yaml_to_bool(val, "policies.positional")?),
            "positional_head" => p.positional_head = Some(yaml_to_bool(val, "policies.positional_head")?),
            "repeat" => p.repeat = Some(yaml_to_string(val, "policies.repeat")?),
            "prefix" => p.prefix = Some(yaml_to_string(val, "policies.prefix")?),
            "skip" => p.skip = Some(yaml_to_bool(val, "policies.skip")?),
            "skip_implicits" => p.skip_implicits = Some(yaml_to_bool(val, "policies.skip_implicits")?),
            "disable_substitutions" => {
                p.disable_substitutions = Some(yaml_to_bool(val, "policies.disable_substitutions")?)
            }
            "explicit_true" => p.explicit_true = Some(yaml_to_string(val, "policies.explicit_true")?),
            "explicit_false" => p.explicit_false = Some(yaml_to_string(val, "policies.explicit_false")?),
            "split" => p.split = Some(yaml_to_string(val, "policies.split")?),
            "replace" => {
                let m = val
                    .as_mapping()
                    .ok_or_else(|| schema_error("policies.replace: mapping expected"))?;
                let mut reps = IndexMap::new();
                for (k, v) in m {
                    reps.insert(yaml_key_to_string(k), yaml_to_string(v, "policies.replace")?);
                }
                p.replace = Some(reps);
            }
            "format" => p.format = Some(yaml_to_string(val, "policies.format")?),
            "format_list" => p.format_list = Some(yaml_to_string_list(val, "policies.format_list")?),
            "format_list_scalar" => {
                p.format_list_scalar = Some(yaml_to_string_list(val, "policies.format_list_scalar")?)
            }
            "pass_missing_as_none" => {
                p.pass_missing_as_none = Some(yaml_to_bool(val, "policies.pass_missing_as_none")?)
            }
            other => return Err(schema_error(format!("unknown policy '{other}'"))),
        }
    }
    Ok(p)
}

fn parse_path_policies(value: &YamlValue) -> Result<PathPolicies> {
    let map = match value {
        YamlValue::Mapping(m) => m,
        YamlValue::Null => return Ok(PathPolicies::default()),
        other => {
            return Err(schema_error(format!("path_policies: mapping expected, got {other:?}")));
        }
    };
    let mut p = PathPolicies::default();
    for (key, val) in map {
        let key = yaml_key_to_string(key);
        match key.as_str() {
            "mkdir_parent" => p.mkdir_parent = yaml_to_bool(val, "path_policies.mkdir_parent")?,
            "access_parent" => p.access_parent = yaml_to_bool(val, "path_policies.access_parent")?,
            "write_parent" => p.write_parent = yaml_to_bool(val, "path_policies.write_parent")?,
            "remove_if_exists" => {
                p.remove_if_exists = yaml_to_bool(val, "path_policies.remove_if_exists")?
            }
            other => return Err(schema_error(format!("unknown path policy '{other}'"))),
        }
    }
    Ok(p)
}

/// Builds a Parameter from a full mapping-form schema.
pub fn parameter_from_mapping(map: &serde_yaml::Mapping, label: &str) -> Result<Parameter> {
    let mut param = Parameter::default();
    for (key, val) in map {
        let key = yaml_key_to_string(key);
        match key.as_str() {
            "info" => param.info = yaml_to_string(val, "info")?,
            "writable" => param.writable = yaml_to_bool(val, "writable")?,
            "dtype" => param.dtype_str = yaml_to_string(val, "dtype")?,
            "implicit" => {
                if !matches!(val, YamlValue::Null) {
                    param.implicit = Some(PValue::from_yaml(val));
                }
            }
            "tags" => param.tags = yaml_to_string_list(val, "tags")?,
            "required" => {
                if !matches!(val, YamlValue::Null) {
                    param.required = Some(yaml_to_bool(val, "required")?);
                }
            }
            "choices" => {
                if let YamlValue::Sequence(seq) = val {
                    param.choices = seq.iter().map(PValue::from_yaml).collect();
                } else if !matches!(val, YamlValue::Null) {
                    return Err(schema_error(format!("{label}: choices must be a list")));
                }
            }
            "element_choices" => {
                if let YamlValue::Sequence(seq) = val {
                    param.element_choices = seq.iter().map(PValue::from_yaml).collect();
                } else if !matches!(val, YamlValue::Null) {
                    return Err(schema_error(format!("{label}: element_choices must be a list")));
                }
            }
            "default" => param.default = PValue::from_yaml(val),
            "aliases" => param.aliases = yaml_to_string_list(val, "aliases")?,
            "mkdir" => param.mkdir = yaml_to_bool(val, "mkdir")?,
            "path_policies" => param.path_policies = parse_path_policies(val)?,
            "must_exist" => {
                if !matches!(val, YamlValue::Null) {
                    param.must_exist = Some(yaml_to_bool(val, "must_exist")?);
                }
            }
            "skip_freshness_checks" => {
                if !matches!(val, YamlValue::Null) {
                    param.skip_freshness_checks = Some(yaml_to_bool(val, "skip_freshness_checks")?);
                }
            }
            "nom_de_guerre" => param.nom_de_guerre = Some(yaml_to_string(val, "nom_de_guerre")?),
            "policies" => param.policies = parse_policies(val)?,
            "category" => {
                let name = yaml_to_string(val, "category")?;
                param.category = Some(
                    ParameterCategory::parse(&name)
                        .ok_or_else(|| schema_error(format!("{label}: unknown category '{name}'")))?,
                );
            }
            "metavar" => param.metavar = Some(yaml_to_string(val, "metavar")?),
            "abbreviation" => param.abbreviation = Some(yaml_to_string(val, "abbreviation")?),
            "metadata" => {
                if let YamlValue::Mapping(m) = val {
                    for (k, v) in m {
                        param.metadata.insert(yaml_key_to_string(k), PValue::from_yaml(v));
                    }
                }
            }
            "suppress_cli_default" => {
                param.suppress_cli_default = yaml_to_bool(val, "suppress_cli_default")?
            }
            other => {
                return Err(schema_error(format!("{label}: unknown parameter field '{other}'")));
            }
        }
    }
    param.dtype = parse_dtype(&param.dtype_str)
        .map_err(|e| e.wrap(crate::errors::ErrorKind::Schema, format!("{label}: bad dtype")))?;
    // a string default of "UNSET" means unset
    if param.default.as_str() == Some("UNSET") {
        param.default = PValue::Unset(String::new());
    }
    Ok(param)
}

/// Parses the one-line shorthand form: `<dtype>[=<default>|*][ "<info>"]`.
pub fn parameter_from_shorthand(text: &str, label: &str) -> Result<Parameter> {
    let mut param = Parameter::default();
    let mut value = text.trim().to_string();

    // trailing double-quoted string is the info field
    if value.ends_with('"') {
        if let Some(open) = value[..value.len() - 1].rfind('"') {
            param.info = value[open + 1..value.len() - 1].to_string();
            value = value[..open].trim().to_string();
        }
    }
    if let Some((dtype, default)) = value.split_once('=') {
        let mut default = default.trim().to_string();
        if (default.starts_with('"') && default.ends_with('"') && default.len() >= 2)
            || (default.starts_with('\'') && default.ends_with('\'') && default.len() >= 2)
        {
            default = default[1..default.len() - 1].to_string();
        }
        param.default = PValue::Str(default);
        value = dtype.trim().to_string();
    } else if let Some(stripped) = value.strip_suffix('*') {
        param.required = Some(true);
        value = stripped.trim().to_string();
    }
    param.dtype_str = value;
    param.dtype = parse_dtype(&param.dtype_str)
        .map_err(|e| e.wrap(crate::errors::ErrorKind::Schema, format!("{label}: bad dtype")))?;
    Ok(param)
}

/// Flattens a (possibly nested) inputs/outputs section into a mapping of
/// dotted parameter name to Parameter. Nested mappings whose keys are not a
/// subset of the Parameter fields are treated as subsections.
pub fn flatten_schemas(
    dest: &mut IndexMap<String, Parameter>,
    io: &YamlValue,
    label: &str,
    prefix: &str,
) -> Result<()> {
    let map = match io {
        YamlValue::Mapping(m) => m,
        YamlValue::Null => return Ok(()),
        other => return Err(schema_error(format!("{label}: mapping expected, got {other:?}"))),
    };
    let fieldset: HashSet<&str> = PARAMETER_FIELDS.iter().copied().collect();
    for (key, value) in map {
        let key = yaml_key_to_string(key);
        if key == "subsection" {
            continue;
        }
        let name = format!("{prefix}{key}");
        match value {
            YamlValue::String(s) => {
                dest.insert(name.clone(), parameter_from_shorthand(s, &format!("{label}.{name}"))?);
            }
            YamlValue::Mapping(m) => {
                let all_param_fields = m
                    .iter()
                    .all(|(k, _)| fieldset.contains(yaml_key_to_string(k).as_str()));
                if all_param_fields {
                    dest.insert(name.clone(), parameter_from_mapping(m, &format!("{label}.{name}"))?);
                } else {
                    flatten_schemas(dest, value, label, &format!("{name}."))
                        .map_err(|e| {
                            e.wrap(
                                crate::errors::ErrorKind::Schema,
                                format!(
                                    "{label}.{name} was interpreted as a nested section, but contains errors"
                                ),
                            )
                        })?;
                }
            }
            other => {
                return Err(schema_error(format!("{label}.{name} is not a valid schema: {other:?}")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_parsing() {
        assert_eq!(parse_dtype("str").unwrap(), DType::Str);
        assert_eq!(parse_dtype("List[File]").unwrap(), DType::List(Box::new(DType::File)));
        assert_eq!(
            parse_dtype("Dict[str, int]").unwrap(),
            DType::Dict(Box::new(DType::Str), Box::new(DType::Int))
        );
        assert_eq!(
            parse_dtype("Union[int, str]").unwrap(),
            DType::Union(vec![DType::Int, DType::Str])
        );
        assert_eq!(
            parse_dtype("Optional[List[MS]]").unwrap(),
            DType::Optional(Box::new(DType::List(Box::new(DType::MS))))
        );
        assert!(parse_dtype("Frobnicator").is_err());
        assert!(parse_dtype("List[int,str]").is_err());
    }

    #[test]
    fn shorthand_parsing() {
        let p = parameter_from_shorthand("int=1", "x").unwrap();
        assert_eq!(p.dtype, DType::Int);
        assert_eq!(p.default, PValue::Str("1".into()));

        let p = parameter_from_shorthand("File*", "x").unwrap();
        assert_eq!(p.dtype, DType::File);
        assert_eq!(p.required, Some(true));

        let p = parameter_from_shorthand("str = 'abc' \"the abc parameter\"", "x").unwrap();
        assert_eq!(p.default, PValue::Str("abc".into()));
        assert_eq!(p.info, "the abc parameter");
    }

    #[test]
    fn flatten_nested_sections() {
        let yaml: YamlValue = serde_yaml::from_str(
            r#"
            ms: MS*
            selection:
              field: "int=0"
              ddid:
                dtype: int
                default: 0
            "#,
        )
        .unwrap();
        let mut dest = IndexMap::new();
        flatten_schemas(&mut dest, &yaml, "inputs", "").unwrap();
        let names: Vec<&String> = dest.keys().collect();
        assert_eq!(names, vec!["ms", "selection.field", "selection.ddid"]);
        assert_eq!(dest["selection.ddid"].dtype, DType::Int);
    }

    #[test]
    fn mapping_with_param_fields_is_a_parameter() {
        let yaml: YamlValue = serde_yaml::from_str(
            r#"
            x:
              dtype: List[File]
              required: true
              policies:
                repeat: "[]"
            "#,
        )
        .unwrap();
        let mut dest = IndexMap::new();
        flatten_schemas(&mut dest, &yaml, "inputs", "").unwrap();
        let p = &dest["x"];
        assert!(p.is_required());
        assert_eq!(p.policies.repeat.as_deref(), Some("[]"));
        assert!(p.dtype.is_path_list_type());
    }

    #[test]
    fn filelike_collection() {
        let dtype = parse_dtype("List[File]").unwrap();
        let value = PValue::List(vec![PValue::Str("a.txt".into()), PValue::Str("b.txt".into())]);
        let mut out = Vec::new();
        get_filelikes(&dtype, &value, &mut out);
        assert_eq!(out, vec!["a.txt".to_string(), "b.txt".to_string()]);

        let dtype = parse_dtype("Dict[str, File]").unwrap();
        let mut map = IndexMap::new();
        map.insert("k".to_string(), PValue::Str("c.txt".into()));
        let mut out = Vec::new();
        get_filelikes(&dtype, &PValue::Map(map), &mut out);
        assert_eq!(out, vec!["c.txt".to_string()]);

        let dtype = parse_dtype("Union[File, int]").unwrap();
        let mut out = Vec::new();
        get_filelikes(&dtype, &PValue::Str("d.txt".into()), &mut out);
        assert_eq!(out, vec!["d.txt".to_string()]);
        let mut out = Vec::new();
        get_filelikes(&dtype, &PValue::Int(5), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn category_auto_assignment() {
        let mut p = Parameter::default();
        assert_eq!(p.get_category(), ParameterCategory::Optional);
        p.required = Some(true);
        assert_eq!(p.get_category(), ParameterCategory::Required);
        p.required = None;
        p.implicit = Some(PValue::Str("x".into()));
        assert_eq!(p.get_category(), ParameterCategory::Implicit);
        p.category = Some(ParameterCategory::Hidden);
        assert_eq!(p.get_category(), ParameterCategory::Hidden);
    }
}
