use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde_yaml::Value as YamlValue;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::basetypes::{PValue, yaml_key_to_string};
use crate::errors::{Result, definition_error, param_error, schema_error};
use crate::runlog::RunLog;
use crate::schema::{Parameter, flatten_schemas};
use crate::substitutions::SubstitutionNs;
use crate::validate::{ValidateOptions, validate_parameters};

/// A dynamic-schema hook: given current parameter values and the original
/// inputs/outputs, returns updated inputs/outputs.
pub type DynSchemaFn = fn(
    &IndexMap<String, PValue>,
    &IndexMap<String, Parameter>,
    &IndexMap<String, Parameter>,
) -> (IndexMap<String, Parameter>, IndexMap<String, Parameter>);

static DYNAMIC_SCHEMAS: Lazy<Mutex<HashMap<String, DynSchemaFn>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a named dynamic-schema hook that cargo definitions can refer to
/// via their `dynamic_schema` field.
pub fn register_dynamic_schema(name: &str, hook: DynSchemaFn) {
    DYNAMIC_SCHEMAS.lock().unwrap().insert(name.to_string(), hook);
}

fn lookup_dynamic_schema(name: &str) -> Option<DynSchemaFn> {
    DYNAMIC_SCHEMAS.lock().unwrap().get(name).copied()
}

/// Common base of cabs and recipes: named parameter schemas, defaults, and
/// the validation entry points. Cab and Recipe own a Cargo and delegate to
/// it.
#[derive(Debug, Clone, Default)]
pub struct Cargo {
    pub name: String,
    pub fqname: String,
    pub info: String,
    pub extra_info: IndexMap<String, String>,
    pub inputs: IndexMap<String, Parameter>,
    pub outputs: IndexMap<String, Parameter>,
    pub defaults: IndexMap<String, PValue>,
    pub backend: Option<String>,
    pub dynamic_schema: Option<String>,
    original_io: Option<(IndexMap<String, Parameter>, IndexMap<String, Parameter>)>,
    implicit_params: Vec<String>,
    pub log: Option<RunLog>,
    finalized: bool,
}

impl Cargo {
    /// Parses the cargo-level fields out of a definition mapping. Unknown
    /// keys are left for the caller (cab/recipe specific fields).
    pub fn from_mapping(map: &serde_yaml::Mapping, label: &str) -> Result<Cargo> {
        let mut cargo = Cargo::default();
        for (key, value) in map {
            match yaml_key_to_string(key).as_str() {
                "name" => cargo.name = yaml_key_to_string(value),
                "info" => cargo.info = yaml_key_to_string(value),
                "extra_info" => {
                    if let YamlValue::Mapping(m) = value {
                        for (k, v) in m {
                            cargo
                                .extra_info
                                .insert(yaml_key_to_string(k), yaml_key_to_string(v));
                        }
                    }
                }
                "inputs" => {
                    flatten_schemas(&mut cargo.inputs, value, &format!("{label}.inputs"), "")?
                }
                "outputs" => {
                    flatten_schemas(&mut cargo.outputs, value, &format!("{label}.outputs"), "")?
                }
                "defaults" => {
                    if let YamlValue::Mapping(m) = value {
                        for (k, v) in m {
                            cargo.defaults.insert(yaml_key_to_string(k), PValue::from_yaml(v));
                        }
                    }
                }
                "backend" => {
                    if !matches!(value, YamlValue::Null) {
                        cargo.backend = Some(yaml_key_to_string(value));
                    }
                }
                "dynamic_schema" => {
                    if !matches!(value, YamlValue::Null) {
                        cargo.dynamic_schema = Some(yaml_key_to_string(value));
                    }
                }
                _ => {}
            }
        }
        cargo.post_init(label)?;
        Ok(cargo)
    }

    /// Marks outputs, checks name clashes, flattens defaults, verifies the
    /// dynamic-schema hook resolves.
    pub fn post_init(&mut self, label: &str) -> Result<()> {
        for schema in self.outputs.values_mut() {
            schema.is_input = false;
        }
        for name in self.inputs.keys() {
            if self.outputs.contains_key(name) {
                return Err(definition_error(format!(
                    "{label}: parameter '{name}' appears in both inputs and outputs"
                )));
            }
        }
        for (name, schema) in self.inputs.iter().chain(self.outputs.iter()) {
            if schema.implicit.is_some() && schema.has_default() {
                return Err(schema_error(format!(
                    "{label}: implicit parameter {name} also has a default value"
                )));
            }
        }
        self.defaults = flatten_pvalue_dict(&self.defaults, &self.all_names());
        if let Some(hook) = &self.dynamic_schema {
            if lookup_dynamic_schema(hook).is_none() {
                return Err(definition_error(format!(
                    "{label}: '{hook}' is not a registered dynamic schema"
                )));
            }
            self.original_io = Some((self.inputs.clone(), self.outputs.clone()));
        }
        Ok(())
    }

    fn all_names(&self) -> Vec<String> {
        self.inputs.keys().chain(self.outputs.keys()).cloned().collect()
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn finalize(&mut self, log: RunLog, fqname: Option<&str>) {
        if !self.finalized {
            if let Some(fqname) = fqname {
                self.fqname = fqname.to_string();
            }
            if self.fqname.is_empty() {
                self.fqname = self.name.clone();
            }
            self.log = Some(log);
            self.finalized = true;
        }
    }

    pub fn get_schema(&self, name: &str) -> Option<&Parameter> {
        self.inputs.get(name).or_else(|| self.outputs.get(name))
    }

    /// Combined inputs+outputs schema mapping, in declaration order.
    pub fn inputs_outputs(&self) -> IndexMap<String, Parameter> {
        let mut merged = self.inputs.clone();
        for (name, schema) in &self.outputs {
            merged.insert(name.clone(), schema.clone());
        }
        merged
    }

    pub fn has_dynamic_schema(&self) -> bool {
        self.dynamic_schema.is_some()
    }

    /// Reapplies the dynamic-schema hook with current parameter values.
    pub fn apply_dynamic_schema(&mut self, params: &mut IndexMap<String, PValue>) -> Result<()> {
        let Some(hook_name) = self.dynamic_schema.clone() else {
            return Ok(());
        };
        let hook = lookup_dynamic_schema(&hook_name)
            .ok_or_else(|| definition_error(format!("'{hook_name}' is not a registered dynamic schema")))?;
        self.delete_implicit_parameters(params);
        let concrete: IndexMap<String, PValue> = params
            .iter()
            .filter(|(_, v)| !v.is_marker())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let (orig_inputs, orig_outputs) = self.original_io.clone().unwrap();
        let (inputs, outputs) = hook(&concrete, &orig_inputs, &orig_outputs);
        self.inputs = inputs;
        self.outputs = outputs;
        for schema in self.outputs.values_mut() {
            schema.is_input = false;
        }
        self.resolve_implicit_parameters(params, None)?;
        Ok(())
    }

    fn delete_implicit_parameters(&mut self, params: &mut IndexMap<String, PValue>) {
        for name in &self.implicit_params {
            params.shift_remove(name);
        }
        self.implicit_params.clear();
    }

    /// Sets implicit parameter values into the mapping. An implicit
    /// parameter supplied explicitly is an error.
    pub fn resolve_implicit_parameters(
        &mut self,
        params: &mut IndexMap<String, PValue>,
        current_ns: Option<&mut SubstitutionNs>,
    ) -> Result<()> {
        let mut updates = Vec::new();
        for (name, schema) in self.inputs.iter().chain(self.outputs.iter()) {
            if let Some(implicit) = &schema.implicit {
                if implicit.is_unresolved() {
                    continue;
                }
                if params.contains_key(name)
                    && !self.implicit_params.contains(name)
                    && params[name] != *implicit
                {
                    return Err(param_error(format!(
                        "implicit parameter {name} was supplied explicitly"
                    )));
                }
                updates.push((name.clone(), implicit.clone()));
            }
        }
        if let Some(ns) = current_ns {
            for (name, value) in &updates {
                ns.add(name, value.clone());
            }
        }
        for (name, value) in updates {
            params.insert(name.clone(), value);
            if !self.implicit_params.contains(&name) {
                self.implicit_params.push(name);
            }
        }
        Ok(())
    }

    pub fn implicit_params(&self) -> &[String] {
        &self.implicit_params
    }

    /// Pre-validation: fills defaults and performs tolerant substitution,
    /// without required/existence checks. Idempotent.
    pub fn prevalidate(
        &mut self,
        params: &IndexMap<String, PValue>,
        subst: Option<(&mut SubstitutionNs, Option<&str>)>,
    ) -> Result<IndexMap<String, PValue>> {
        let mut params = params.clone();
        self.resolve_implicit_parameters(&mut params, None)?;
        if self.has_dynamic_schema() {
            self.apply_dynamic_schema(&mut params)?;
        }
        let schemas = self.inputs_outputs();
        validate_parameters(
            &params,
            &schemas,
            &self.defaults,
            subst,
            &self.fqname,
            &ValidateOptions {
                check_unknowns: true,
                check_required: false,
                check_exist: false,
                create_dirs: false,
                ignore_subst_errors: true,
            },
        )
    }

    /// Validates inputs (and loosely, outputs) ahead of running. `loosely`
    /// (used for skipped steps) drops required/existence checks.
    pub fn validate_inputs(
        &mut self,
        params: &IndexMap<String, PValue>,
        mut subst: Option<(&mut SubstitutionNs, Option<&str>)>,
        loosely: bool,
    ) -> Result<IndexMap<String, PValue>> {
        let mut params = params.clone();
        self.resolve_implicit_parameters(&mut params, None)?;
        let mut validated = validate_parameters(
            &params,
            &self.inputs,
            &self.defaults,
            match subst.as_mut() {
                Some((ns, key)) => Some((&mut **ns, *key)),
                None => None,
            },
            &self.fqname,
            &ValidateOptions {
                check_unknowns: false,
                check_required: !loosely,
                check_exist: !loosely,
                create_dirs: !loosely,
                ignore_subst_errors: false,
            },
        )?;
        let out_validated = validate_parameters(
            &params,
            &self.outputs,
            &self.defaults,
            match subst.as_mut() {
                Some((ns, key)) => Some((&mut **ns, *key)),
                None => None,
            },
            &self.fqname,
            &ValidateOptions {
                check_unknowns: false,
                check_required: false,
                check_exist: false,
                create_dirs: !loosely,
                ignore_subst_errors: false,
            },
        )?;
        for (name, value) in out_validated {
            validated.insert(name, value);
        }
        Ok(validated)
    }

    /// Validates outputs after a run.
    pub fn validate_outputs(
        &mut self,
        params: &IndexMap<String, PValue>,
        subst: Option<(&mut SubstitutionNs, Option<&str>)>,
        loosely: bool,
    ) -> Result<IndexMap<String, PValue>> {
        let mut params = params.clone();
        // refresh implicit values that resolved during the run
        for name in self.implicit_params.clone() {
            if let Some(schema) = self.get_schema(&name) {
                if let Some(implicit) = &schema.implicit {
                    if !implicit.is_unresolved() {
                        params.insert(name.clone(), implicit.clone());
                    }
                }
            }
        }
        validate_parameters(
            &params,
            &self.outputs,
            &self.defaults,
            subst,
            &self.fqname,
            &ValidateOptions {
                check_unknowns: false,
                check_required: !loosely,
                check_exist: !loosely,
                create_dirs: false,
                ignore_subst_errors: false,
            },
        )
    }

    /// Names of parameters whose values are unresolved markers (excluding
    /// placeholders, which are promised to resolve).
    pub fn unresolved_params(&self, params: &IndexMap<String, PValue>) -> Vec<String> {
        params
            .iter()
            .filter(|(_, value)| value.is_unresolved())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Flattens nested parameter mappings into dotted keys, when the dotted
    /// prefix corresponds to known schema names.
    pub fn flatten_param_dict(&self, params: &IndexMap<String, PValue>) -> IndexMap<String, PValue> {
        flatten_pvalue_dict(params, &self.all_names())
    }

    pub fn summary(&self, params: &IndexMap<String, PValue>, ignore_missing: bool) -> Vec<String> {
        let mut lines = vec![format!("{} '{}':", if self.fqname.is_empty() { &self.name } else { &self.fqname }, self.name)];
        for (name, value) in params {
            lines.push(format!("  {name} = {value}"));
        }
        if !ignore_missing {
            for (name, schema) in self.inputs.iter().chain(self.outputs.iter()) {
                if !params.contains_key(name) && schema.is_required() {
                    lines.push(format!("  {name} = ???"));
                }
            }
        }
        lines
    }
}

/// Flattens nested map values into dotted keys where the dotted form names a
/// known parameter.
fn flatten_pvalue_dict(
    params: &IndexMap<String, PValue>,
    known_names: &[String],
) -> IndexMap<String, PValue> {
    fn recurse(
        out: &mut IndexMap<String, PValue>,
        params: &IndexMap<String, PValue>,
        prefix: &str,
        known: &[String],
    ) {
        for (name, value) in params {
            let name = format!("{prefix}{name}");
            if let PValue::Map(map) = value {
                let dotted = format!("{name}.");
                if known.iter().any(|k| k.starts_with(&dotted)) {
                    recurse(out, map, &dotted, known);
                    continue;
                }
            }
            out.insert(name, value.clone());
        }
    }
    let mut out = IndexMap::new();
    recurse(&mut out, params, "", known_names);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cargo_from(yaml: &str) -> Cargo {
        let value: YamlValue = serde_yaml::from_str(yaml).unwrap();
        Cargo::from_mapping(value.as_mapping().unwrap(), "test").unwrap()
    }

    #[test]
    fn input_output_clash_rejected() {
        let value: YamlValue = serde_yaml::from_str(
            "name: x\ninputs:\n  a: int\noutputs:\n  a: int\n",
        )
        .unwrap();
        let err = Cargo::from_mapping(value.as_mapping().unwrap(), "test").unwrap_err();
        assert!(err.to_string().contains("both inputs and outputs"));
    }

    #[test]
    fn implicit_with_default_rejected() {
        let value: YamlValue = serde_yaml::from_str(
            "name: x\ninputs:\n  a:\n    dtype: str\n    implicit: foo\n    default: bar\n",
        )
        .unwrap();
        let err = Cargo::from_mapping(value.as_mapping().unwrap(), "test").unwrap_err();
        assert!(err.to_string().contains("also has a default"));
    }

    #[test]
    fn implicit_supplied_explicitly_rejected() {
        let mut cargo = cargo_from("name: x\noutputs:\n  out:\n    dtype: str\n    implicit: fixed.txt\n");
        let mut params = IndexMap::new();
        params.insert("out".to_string(), PValue::Str("other.txt".into()));
        let err = cargo.resolve_implicit_parameters(&mut params, None).unwrap_err();
        assert!(err.to_string().contains("supplied explicitly"));

        let mut params = IndexMap::new();
        cargo.resolve_implicit_parameters(&mut params, None).unwrap();
        assert_eq!(params["out"], PValue::Str("fixed.txt".into()));
        assert_eq!(cargo.implicit_params(), &["out".to_string()]);
    }

    #[test]
    fn prevalidate_fills_defaults_tolerantly() {
        let mut cargo = cargo_from(
            "name: x\ninputs:\n  n: int=3\n  m: int*\n",
        );
        cargo.finalize(RunLog::new("test"), None);
        let params = cargo.prevalidate(&IndexMap::new(), None).unwrap();
        // default present, missing required tolerated at this stage
        assert_eq!(params["n"], PValue::Int(3));
        assert!(!params.contains_key("m"));
    }

    #[test]
    fn prevalidate_is_idempotent() {
        let mut cargo = cargo_from("name: x\ninputs:\n  n: int=3\n");
        cargo.finalize(RunLog::new("test"), None);
        let once = cargo.prevalidate(&IndexMap::new(), None).unwrap();
        let twice = cargo.prevalidate(&once, None).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn flatten_param_dict_uses_schema_names() {
        let cargo = cargo_from("name: x\ninputs:\n  sel:\n    field: int=0\n");
        let mut inner = IndexMap::new();
        inner.insert("field".to_string(), PValue::Int(2));
        let mut params = IndexMap::new();
        params.insert("sel".to_string(), PValue::Map(inner));
        let flat = cargo.flatten_param_dict(&params);
        assert_eq!(flat["sel.field"], PValue::Int(2));
    }

    #[test]
    fn dynamic_schema_hook_applies() {
        fn add_extra_output(
            params: &IndexMap<String, PValue>,
            inputs: &IndexMap<String, Parameter>,
            outputs: &IndexMap<String, Parameter>,
        ) -> (IndexMap<String, Parameter>, IndexMap<String, Parameter>) {
            let mut outputs = outputs.clone();
            if params.contains_key("want_extra") {
                outputs.insert("extra".to_string(), Parameter::default());
            }
            (inputs.clone(), outputs)
        }
        register_dynamic_schema("tests.add_extra_output", add_extra_output);

        let mut cargo = cargo_from(
            "name: x\ndynamic_schema: tests.add_extra_output\ninputs:\n  want_extra: bool=true\n",
        );
        cargo.finalize(RunLog::new("test"), None);
        let mut params = IndexMap::new();
        params.insert("want_extra".to_string(), PValue::Bool(true));
        cargo.apply_dynamic_schema(&mut params).unwrap();
        assert!(cargo.outputs.contains_key("extra"));
    }

    #[test]
    fn unregistered_dynamic_schema_rejected() {
        let value: YamlValue =
            serde_yaml::from_str("name: x\ndynamic_schema: no.such.hook\n").unwrap();
        assert!(Cargo::from_mapping(value.as_mapping().unwrap(), "test").is_err());
    }
}
