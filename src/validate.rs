use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;
use std::path::Path;

use crate::basetypes::PValue;
use crate::errors::{ErrorKind, Result, StimelaError, join_quote, param_error};
use crate::evaluator::{Evaluator, value_eq};
use crate::schema::{DType, Parameter};
use crate::substitutions::{SubstContext, SubstitutionNs};

/// Flags controlling a validation pass.
#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    pub check_unknowns: bool,
    pub check_required: bool,
    pub check_exist: bool,
    pub create_dirs: bool,
    pub ignore_subst_errors: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        ValidateOptions {
            check_unknowns: true,
            check_required: true,
            check_exist: true,
            create_dirs: false,
            ignore_subst_errors: false,
        }
    }
}

/// Runs {}-substitution and formula evaluation over a parameter mapping.
/// Values that fail to resolve become Unresolved markers; unless
/// ignore_subst_errors is set, any such failure raises an aggregated
/// substitution error.
pub fn evaluate_and_substitute(
    inputs: &IndexMap<String, PValue>,
    ns: &mut SubstitutionNs,
    ns_key: Option<&str>,
    defaults: &IndexMap<String, PValue>,
    ignore_subst_errors: bool,
    location: &[String],
) -> Result<IndexMap<String, PValue>> {
    let ctx = SubstContext::new(true);
    let evaluator = Evaluator::new(location.to_vec(), true);
    let result = evaluator.evaluate_dict(inputs, ns, &ctx, ns_key, defaults, false)?;
    if !ignore_subst_errors {
        let mut errors = Vec::new();
        for value in result.values() {
            if let PValue::Unresolved(u) = value {
                for msg in &u.errors {
                    errors.push(StimelaError::new(ErrorKind::Substitution, msg.clone()));
                }
            }
        }
        if !errors.is_empty() {
            return Err(StimelaError::with_nested(
                ErrorKind::Substitution,
                "unresolved {}-substitutions",
                errors,
            ));
        }
    }
    Ok(result)
}

/// Validates a parameter mapping against a schema mapping: applies defaults,
/// performs substitutions, type-checks and coerces, checks file existence and
/// choices, and optionally creates output directories. Errors are collected
/// per parameter and raised together.
pub fn validate_parameters(
    params: &IndexMap<String, PValue>,
    schemas: &IndexMap<String, Parameter>,
    defaults: &IndexMap<String, PValue>,
    subst: Option<(&mut SubstitutionNs, Option<&str>)>,
    fqname: &str,
    options: &ValidateOptions,
) -> Result<IndexMap<String, PValue>> {
    let mkname = |name: &str| {
        if fqname.is_empty() {
            name.to_string()
        } else {
            format!("{fqname}.{name}")
        }
    };

    if options.check_unknowns {
        for name in params.keys() {
            if !schemas.contains_key(name) {
                return Err(param_error(format!("unknown parameter '{}'", mkname(name))));
            }
        }
    }

    // only process the subset for which we have schemas
    let mut inputs: IndexMap<String, PValue> = params
        .iter()
        .filter(|(name, _)| schemas.contains_key(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    // schema defaults, overridden by the supplied defaults
    let mut all_defaults: IndexMap<String, PValue> = schemas
        .iter()
        .filter(|(_, schema)| schema.has_default())
        .map(|(name, schema)| (name.clone(), schema.default.clone()))
        .collect();
    for (name, value) in defaults {
        if schemas.contains_key(name) {
            all_defaults.insert(name.clone(), value.clone());
        }
    }

    for (name, value) in &all_defaults {
        if !inputs.contains_key(name) {
            inputs.insert(name.clone(), value.clone());
        }
    }

    if let Some((ns, ns_key)) = subst {
        inputs = evaluate_and_substitute(
            &inputs,
            ns,
            ns_key,
            &all_defaults,
            options.ignore_subst_errors,
            &[fqname.to_string()],
        )?;
    }

    // separate unresolved markers from proper values
    let mut unresolved: IndexMap<String, PValue> = IndexMap::new();
    let mut proper: IndexMap<String, PValue> = IndexMap::new();
    for (name, value) in inputs {
        if value.is_marker() {
            unresolved.insert(name, value);
        } else {
            proper.insert(name, value);
        }
    }

    let mut errors: Vec<StimelaError> = Vec::new();

    if options.check_required {
        let missing: Vec<String> = schemas
            .iter()
            .filter(|(name, schema)| {
                schema.is_required() && !proper.contains_key(*name) && !unresolved.contains_key(*name)
            })
            .map(|(name, _)| mkname(name))
            .collect();
        if !missing.is_empty() {
            errors.push(param_error(format!(
                "missing required parameters: {}",
                join_quote(&missing)
            )));
        }
    }

    let mut validated: IndexMap<String, PValue> = IndexMap::new();

    for (name, value) in &proper {
        let schema = &schemas[name];
        let must_exist = schema.must_exist.unwrap_or(options.check_exist);

        let result = if schema.dtype.is_path_type() || schema.dtype.is_path_list_type() {
            validate_path_value(name, value, schema, must_exist, options, &mkname)
        } else {
            coerce(value, &schema.dtype)
                .map_err(|exc| exc.wrap(ErrorKind::ParameterValidation, format!("{} = {}", mkname(name), value)))
        };

        match result {
            Ok(coerced) => {
                validated.insert(name.clone(), coerced);
            }
            Err(exc) => errors.push(exc),
        }
    }

    // choice restrictions
    for (name, value) in &validated {
        let schema = &schemas[name];
        if !schema.choices.is_empty() && !schema.choices.iter().any(|c| choice_matches(c, value)) {
            errors.push(param_error(format!("{}: invalid value '{}'", mkname(name), value)));
        }
        if !schema.element_choices.is_empty() {
            if let PValue::List(items) = value {
                for item in items {
                    if !schema.element_choices.iter().any(|c| choice_matches(c, item)) {
                        errors.push(param_error(format!(
                            "{}: invalid element '{}'",
                            mkname(name),
                            item
                        )));
                    }
                }
            }
        }
    }

    if options.create_dirs {
        for (name, value) in &validated {
            let schema = &schemas[name];
            if !schema.dtype.is_path_type() && !schema.dtype.is_path_list_type() {
                continue;
            }
            let paths: Vec<String> = match value {
                PValue::Str(s) => vec![s.clone()],
                PValue::List(items) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
                _ => continue,
            };
            for path in paths {
                if path.is_empty() {
                    continue;
                }
                if schema.mkdir && !Path::new(&path).exists() {
                    if let Err(exc) = std::fs::create_dir_all(&path) {
                        errors.push(param_error(format!("{}: cannot create {path}: {exc}", mkname(name))));
                    }
                } else if schema.is_output() && schema.path_policies.mkdir_parent {
                    let parent = crate::basetypes::dirname(&path);
                    if !parent.is_empty() && !Path::new(&parent).exists() {
                        if let Err(exc) = std::fs::create_dir_all(&parent) {
                            errors.push(param_error(format!(
                                "{}: cannot create {parent}: {exc}",
                                mkname(name)
                            )));
                        }
                    }
                }
                if schema.is_output() && schema.path_policies.remove_if_exists {
                    let p = Path::new(&path);
                    if p.exists() {
                        let removed = if p.is_dir() {
                            std::fs::remove_dir_all(p)
                        } else {
                            std::fs::remove_file(p)
                        };
                        if let Err(exc) = removed {
                            errors.push(param_error(format!(
                                "{}: cannot remove {path}: {exc}",
                                mkname(name)
                            )));
                        }
                    }
                }
            }
        }
    }

    if !errors.is_empty() {
        if errors.len() == 1 {
            return Err(errors.pop().unwrap());
        }
        return Err(StimelaError::with_nested(
            ErrorKind::ParameterValidation,
            format!("{} parameter(s) failed validation", errors.len()),
            errors,
        ));
    }

    // put the unresolved markers back
    for (name, value) in unresolved {
        validated.insert(name, value);
    }

    Ok(validated)
}

/// Validates a file-like parameter: accepts a scalar, a list, or a scalar
/// string containing a YAML list literal; expands glob patterns in lists;
/// checks existence and file-vs-directory kind.
fn validate_path_value(
    name: &str,
    value: &PValue,
    schema: &Parameter,
    must_exist: bool,
    _options: &ValidateOptions,
    mkname: &dyn Fn(&str) -> String,
) -> Result<PValue> {
    let is_list = schema.dtype.is_path_list_type();

    let mut files: Vec<String> = match value {
        PValue::Str(s) => {
            // a substituted-in list renders like "[a, b]"
            let trimmed = s.trim();
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                match serde_yaml::from_str::<YamlValue>(trimmed) {
                    Ok(YamlValue::Sequence(seq)) => seq
                        .iter()
                        .map(|v| match v {
                            YamlValue::String(s) => s.clone(),
                            other => PValue::from_yaml(other).to_string(),
                        })
                        .collect(),
                    _ => vec![s.clone()],
                }
            } else {
                vec![s.clone()]
            }
        }
        PValue::List(items) => items.iter().map(|v| v.to_string()).collect(),
        other => {
            return Err(param_error(format!(
                "'{}={other}': invalid type for a file-like parameter",
                mkname(name)
            )));
        }
    };

    // expand glob patterns in file lists
    if is_list {
        let mut expanded = Vec::new();
        for path in files {
            if path.contains('*') || path.contains('?') || path.contains('[') {
                let mut matches: Vec<String> = glob::glob(&path)
                    .map(|paths| {
                        paths
                            .filter_map(|p| p.ok())
                            .map(|p| p.to_string_lossy().into_owned())
                            .collect()
                    })
                    .unwrap_or_default();
                matches.sort();
                if matches.is_empty() {
                    expanded.push(path);
                } else {
                    expanded.extend(matches);
                }
            } else {
                expanded.push(path);
            }
        }
        files = expanded;
    }

    if must_exist {
        if files.is_empty() {
            return Err(param_error(format!("'{}': file(s) don't exist", mkname(name))));
        }
        let not_exists: Vec<&String> =
            files.iter().filter(|f| !Path::new(f.as_str()).exists()).collect();
        if !not_exists.is_empty() {
            let names: Vec<String> = not_exists.iter().map(|s| s.to_string()).collect();
            return Err(param_error(format!(
                "'{}': {} doesn't exist",
                mkname(name),
                names.join(",")
            )));
        }
    }

    let check_kind = |path: &str| -> Result<()> {
        let p = Path::new(path);
        if p.exists() {
            if schema.dtype.is_dir_kind()
                || matches!(schema.dtype, DType::List(ref inner) if inner.is_dir_kind())
            {
                if !p.is_dir() {
                    return Err(param_error(format!(
                        "'{}': {path} is not a directory",
                        mkname(name)
                    )));
                }
            } else if !p.is_file() {
                return Err(param_error(format!(
                    "'{}': {path} is not a regular file",
                    mkname(name)
                )));
            }
        }
        Ok(())
    };

    if is_list {
        for f in &files {
            check_kind(f)?;
        }
        Ok(PValue::List(files.into_iter().map(PValue::Str).collect()))
    } else {
        if files.len() > 1 {
            return Err(param_error(format!(
                "'{}': multiple files given ({value})",
                mkname(name)
            )));
        }
        match files.into_iter().next() {
            None => Ok(PValue::Str(String::new())),
            Some(f) => {
                check_kind(&f)?;
                Ok(PValue::Str(f))
            }
        }
    }
}

fn choice_matches(choice: &PValue, value: &PValue) -> bool {
    if value_eq(choice, value) {
        return true;
    }
    // schema choices are often written as strings even for typed params
    choice.to_string() == value.to_string()
}

/// Type-checks and coerces a value against a dtype expression, with the
/// lossless conversions users expect from YAML-sourced values.
pub fn coerce(value: &PValue, dtype: &DType) -> Result<PValue> {
    match dtype {
        DType::Any => Ok(value.clone()),
        DType::Str | DType::URI => match value {
            PValue::Str(_) => Ok(value.clone()),
            PValue::Int(_) | PValue::Float(_) | PValue::Bool(_) => {
                Ok(PValue::Str(value.to_string()))
            }
            other => Err(param_error(format!("expected a string, got {other}"))),
        },
        DType::File | DType::Directory | DType::MS => match value {
            PValue::Str(_) => Ok(value.clone()),
            other => Err(param_error(format!("expected a path, got {other}"))),
        },
        DType::Int => match value {
            PValue::Int(_) => Ok(value.clone()),
            PValue::Bool(b) => Ok(PValue::Int(*b as i64)),
            PValue::Float(f) if f.fract() == 0.0 => Ok(PValue::Int(*f as i64)),
            PValue::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(PValue::Int)
                .map_err(|_| param_error(format!("expected an integer, got '{s}'"))),
            other => Err(param_error(format!("expected an integer, got {other}"))),
        },
        DType::Float => match value {
            PValue::Float(_) => Ok(value.clone()),
            PValue::Int(i) => Ok(PValue::Float(*i as f64)),
            PValue::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(PValue::Float)
                .map_err(|_| param_error(format!("expected a float, got '{s}'"))),
            other => Err(param_error(format!("expected a float, got {other}"))),
        },
        DType::Bool => match value {
            PValue::Bool(_) => Ok(value.clone()),
            PValue::Int(0) => Ok(PValue::Bool(false)),
            PValue::Int(1) => Ok(PValue::Bool(true)),
            PValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(PValue::Bool(true)),
                "false" | "no" | "0" => Ok(PValue::Bool(false)),
                other => Err(param_error(format!("expected a boolean, got '{other}'"))),
            },
            other => Err(param_error(format!("expected a boolean, got {other}"))),
        },
        DType::List(inner) => match value {
            PValue::List(items) => {
                let coerced: Result<Vec<PValue>> = items.iter().map(|v| coerce(v, inner)).collect();
                Ok(PValue::List(coerced?))
            }
            PValue::Str(s) if s.trim().starts_with('[') && s.trim().ends_with(']') => {
                match serde_yaml::from_str::<YamlValue>(s.trim()) {
                    Ok(yaml @ YamlValue::Sequence(_)) => coerce(&PValue::from_yaml(&yaml), dtype),
                    _ => Ok(PValue::List(vec![coerce(value, inner)?])),
                }
            }
            scalar => Ok(PValue::List(vec![coerce(scalar, inner)?])),
        },
        DType::Tuple(inners) => match value {
            PValue::List(items) => {
                if items.len() != inners.len() {
                    return Err(param_error(format!(
                        "expected a tuple of {} elements, got {}",
                        inners.len(),
                        items.len()
                    )));
                }
                let coerced: Result<Vec<PValue>> = items
                    .iter()
                    .zip(inners.iter())
                    .map(|(v, dt)| coerce(v, dt))
                    .collect();
                Ok(PValue::List(coerced?))
            }
            other => Err(param_error(format!("expected a tuple, got {other}"))),
        },
        DType::Dict(_, vt) => match value {
            PValue::Map(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), coerce(v, vt)?);
                }
                Ok(PValue::Map(out))
            }
            other => Err(param_error(format!("expected a mapping, got {other}"))),
        },
        DType::Optional(inner) => match value {
            PValue::Null => Ok(PValue::Null),
            other => coerce(other, inner),
        },
        DType::Union(branches) => {
            for branch in branches {
                if let Ok(coerced) = coerce(value, branch) {
                    return Ok(coerced);
                }
            }
            Err(param_error(format!(
                "{value} does not match any of the union alternatives"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_dtype;

    fn schema(dtype: &str) -> Parameter {
        Parameter {
            dtype_str: dtype.to_string(),
            dtype: parse_dtype(dtype).unwrap(),
            ..Parameter::default()
        }
    }

    fn required(dtype: &str) -> Parameter {
        Parameter { required: Some(true), ..schema(dtype) }
    }

    #[test]
    fn missing_required_parameter_is_named() {
        let mut schemas = IndexMap::new();
        schemas.insert("msname".to_string(), required("MS"));
        let err = validate_parameters(
            &IndexMap::new(),
            &schemas,
            &IndexMap::new(),
            None,
            "simms",
            &ValidateOptions { check_exist: false, ..ValidateOptions::default() },
        )
        .unwrap_err();
        assert!(err.to_string().contains("simms.msname"), "{err}");
    }

    #[test]
    fn defaults_fill_missing_values() {
        let mut schemas = IndexMap::new();
        let mut p = schema("int");
        p.default = PValue::Int(1);
        schemas.insert("synthesis".to_string(), p);
        let validated = validate_parameters(
            &IndexMap::new(),
            &schemas,
            &IndexMap::new(),
            None,
            "",
            &ValidateOptions { check_exist: false, ..ValidateOptions::default() },
        )
        .unwrap();
        assert_eq!(validated["synthesis"], PValue::Int(1));
    }

    #[test]
    fn coercion_rules() {
        assert_eq!(coerce(&PValue::Str("5".into()), &DType::Int).unwrap(), PValue::Int(5));
        assert_eq!(coerce(&PValue::Int(5), &DType::Float).unwrap(), PValue::Float(5.0));
        assert_eq!(
            coerce(&PValue::Str("true".into()), &DType::Bool).unwrap(),
            PValue::Bool(true)
        );
        assert_eq!(
            coerce(&PValue::Int(3), &DType::List(Box::new(DType::Int))).unwrap(),
            PValue::List(vec![PValue::Int(3)])
        );
        assert_eq!(
            coerce(&PValue::Str("[1, 2]".into()), &DType::List(Box::new(DType::Int))).unwrap(),
            PValue::List(vec![PValue::Int(1), PValue::Int(2)])
        );
        assert!(coerce(&PValue::Str("abc".into()), &DType::Int).is_err());
    }

    #[test]
    fn validate_is_idempotent() {
        let mut schemas = IndexMap::new();
        schemas.insert("n".to_string(), schema("int"));
        let mut params = IndexMap::new();
        params.insert("n".to_string(), PValue::Str("3".into()));
        let opts = ValidateOptions { check_exist: false, ..ValidateOptions::default() };
        let once =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap();
        let twice = validate_parameters(&once, &schemas, &IndexMap::new(), None, "", &opts).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn file_existence_checks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "x").unwrap();

        let mut schemas = IndexMap::new();
        schemas.insert("input".to_string(), required("File"));
        let mut params = IndexMap::new();
        params.insert("input".to_string(), PValue::Str(file.display().to_string()));
        let opts = ValidateOptions::default();
        let validated =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap();
        assert_eq!(validated["input"], PValue::Str(file.display().to_string()));

        // a directory fails the File kind check
        let mut params = IndexMap::new();
        params.insert("input".to_string(), PValue::Str(dir.path().display().to_string()));
        let err =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap_err();
        assert!(err.to_string().contains("not a regular file"));

        // missing file fails must_exist
        let mut params = IndexMap::new();
        params.insert("input".to_string(), PValue::Str("/no/such/file".into()));
        let err =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn directory_kind_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut schemas = IndexMap::new();
        schemas.insert("ms".to_string(), required("MS"));
        let mut params = IndexMap::new();
        params.insert("ms".to_string(), PValue::Str(dir.path().display().to_string()));
        let opts = ValidateOptions::default();
        assert!(validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).is_ok());
    }

    #[test]
    fn glob_expansion_in_file_lists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();

        let mut schemas = IndexMap::new();
        schemas.insert("files".to_string(), schema("List[File]"));
        let mut params = IndexMap::new();
        params.insert(
            "files".to_string(),
            PValue::Str(format!("{}/*.txt", dir.path().display())),
        );
        let opts = ValidateOptions::default();
        let validated =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap();
        match &validated["files"] {
            PValue::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn yaml_list_literal_accepted_for_file_list() {
        let mut schemas = IndexMap::new();
        schemas.insert("files".to_string(), schema("List[File]"));
        let mut params = IndexMap::new();
        params.insert("files".to_string(), PValue::Str("[a.txt, b.txt]".into()));
        let opts = ValidateOptions { check_exist: false, ..ValidateOptions::default() };
        let validated =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap();
        assert_eq!(
            validated["files"],
            PValue::List(vec![PValue::Str("a.txt".into()), PValue::Str("b.txt".into())])
        );
    }

    #[test]
    fn choices_are_enforced() {
        let mut p = schema("str");
        p.choices = vec![PValue::Str("a".into()), PValue::Str("b".into())];
        let mut schemas = IndexMap::new();
        schemas.insert("mode".to_string(), p);
        let mut params = IndexMap::new();
        params.insert("mode".to_string(), PValue::Str("c".into()));
        let opts = ValidateOptions { check_exist: false, ..ValidateOptions::default() };
        let err =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap_err();
        assert!(err.to_string().contains("invalid value"));
    }

    #[test]
    fn unknown_parameters_raise() {
        let schemas = IndexMap::new();
        let mut params = IndexMap::new();
        params.insert("bogus".to_string(), PValue::Int(1));
        let opts = ValidateOptions::default();
        let err =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap_err();
        assert!(err.to_string().contains("unknown parameter 'bogus'"));
    }

    #[test]
    fn unresolved_markers_pass_through() {
        let mut schemas = IndexMap::new();
        schemas.insert("x".to_string(), required("str"));
        let mut params = IndexMap::new();
        params.insert(
            "x".to_string(),
            PValue::Unresolved(crate::basetypes::Unresolved::new("{a.b}")),
        );
        let opts = ValidateOptions { check_exist: false, ..ValidateOptions::default() };
        let validated =
            validate_parameters(&params, &schemas, &IndexMap::new(), None, "", &opts).unwrap();
        assert!(validated["x"].is_unresolved());
    }

    #[test]
    fn substitution_during_validation() {
        let mut ns = SubstitutionNs::new();
        ns.add("recipe.base", PValue::Str("obs1".into()));
        let mut schemas = IndexMap::new();
        schemas.insert("out".to_string(), schema("str"));
        let mut params = IndexMap::new();
        params.insert("out".to_string(), PValue::Str("{recipe.base}-image".into()));
        let opts = ValidateOptions { check_exist: false, ..ValidateOptions::default() };
        let validated = validate_parameters(
            &params,
            &schemas,
            &IndexMap::new(),
            Some((&mut ns, None)),
            "",
            &opts,
        )
        .unwrap();
        assert_eq!(validated["out"], PValue::Str("obs1-image".into()));
    }
}
