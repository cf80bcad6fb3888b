use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;
use std::path::Path;

use crate::basetypes::{PValue, yaml_key_to_string};
use crate::cab::Cab;
use crate::errors::{
    ErrorKind, Result, StimelaError, definition_error, join_quote, schema_error,
};
use crate::recipe::Recipe;
use crate::runlog::{RunLog, Severity};
use crate::settings::StimelaConfig;
use crate::substitutions::SubstitutionNs;
use crate::task_stats;
use crate::validate::evaluate_and_substitute;

/// What a step wraps, before and after finalisation.
#[derive(Debug, Clone)]
pub enum StepCargo {
    /// unresolved reference: cab by name or inline definition
    CabRef(YamlValue),
    /// unresolved reference: recipe by name or inline definition
    RecipeRef(YamlValue),
    Cab(Box<Cab>),
    Recipe(Box<Recipe>),
}

/// Output-based skip mode: skip the step when its file outputs all exist
/// (or are fresher than its inputs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipIfOutputs {
    Exist,
    Fresh,
}

/// One occurrence of a cab or nested recipe inside a recipe.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    /// name of the referenced cab/recipe, when given by name (used by
    /// "(name)" alias group specifiers)
    pub cargo_name: Option<String>,
    pub fqname: String,
    pub info: String,
    pub params: IndexMap<String, PValue>,
    /// raw skip setting; may be a dynamic "=..." / "{...}" conditional
    pub skip: Option<String>,
    /// parsed constant form of skip; None means evaluate at runtime
    pub skip_static: Option<bool>,
    pub skip_if_outputs: Option<SkipIfOutputs>,
    pub tags: Vec<String>,
    pub backend: Option<String>,
    pub assign: IndexMap<String, PValue>,
    pub assign_based_on: IndexMap<String, IndexMap<String, IndexMap<String, PValue>>>,
    pub cargo: StepCargo,
    pub validated_params: Option<IndexMap<String, PValue>>,
    pub log: Option<RunLog>,
}

pub fn parse_assign_section(value: &YamlValue) -> IndexMap<String, PValue> {
    let mut out = IndexMap::new();
    if let YamlValue::Mapping(map) = value {
        for (k, v) in map {
            out.insert(yaml_key_to_string(k), PValue::from_yaml(v));
        }
    }
    out
}

pub fn parse_assign_based_on(
    value: &YamlValue,
    label: &str,
) -> Result<IndexMap<String, IndexMap<String, IndexMap<String, PValue>>>> {
    let mut out = IndexMap::new();
    let YamlValue::Mapping(map) = value else {
        return Ok(out);
    };
    for (basevar, cases) in map {
        let basevar = yaml_key_to_string(basevar);
        let YamlValue::Mapping(cases) = cases else {
            return Err(schema_error(format!(
                "{label}.assign_based_on.{basevar}: mapping expected"
            )));
        };
        let mut case_map = IndexMap::new();
        for (case, assignments) in cases {
            let case = yaml_key_to_string(case);
            match assignments {
                YamlValue::Null => {
                    case_map.insert(case, IndexMap::new());
                }
                YamlValue::Mapping(_) => {
                    case_map.insert(case, parse_assign_section(assignments));
                }
                other => {
                    return Err(schema_error(format!(
                        "{label}.assign_based_on.{basevar}.{case}: mapping expected, got {other:?}"
                    )));
                }
            }
        }
        out.insert(basevar, case_map);
    }
    Ok(out)
}

impl Step {
    pub fn from_yaml(label: &str, value: &YamlValue) -> Result<Step> {
        let YamlValue::Mapping(map) = value else {
            return Err(schema_error(format!("step '{label}': mapping expected")));
        };
        let get = |key: &str| map.get(YamlValue::String(key.to_string()));

        let cab = get("cab").filter(|v| !matches!(v, YamlValue::Null));
        let recipe = get("recipe").filter(|v| !matches!(v, YamlValue::Null));
        let cargo = match (cab, recipe) {
            (Some(cab), None) => StepCargo::CabRef(cab.clone()),
            (None, Some(recipe)) => StepCargo::RecipeRef(recipe.clone()),
            (Some(_), Some(_)) => {
                return Err(definition_error(format!(
                    "step '{label}': step can't specify both a cab and a nested recipe"
                )));
            }
            (None, None) => {
                return Err(definition_error(format!(
                    "step '{label}': step must specify either a cab or a nested recipe"
                )));
            }
        };

        let mut params = IndexMap::new();
        if let Some(YamlValue::Mapping(m)) = get("params") {
            for (k, v) in m {
                params.insert(yaml_key_to_string(k), PValue::from_yaml(v));
            }
        }

        let (skip, skip_static) = match get("skip") {
            None | Some(YamlValue::Null) => (None, Some(false)),
            Some(YamlValue::Bool(b)) => (Some(b.to_string()), Some(*b)),
            Some(YamlValue::String(s)) => match s.as_str() {
                "True" | "true" | "1" => (Some(s.clone()), Some(true)),
                "False" | "false" | "0" | "" => (Some(s.clone()), Some(false)),
                _ => (Some(s.clone()), None),
            },
            Some(other) => {
                return Err(schema_error(format!("step '{label}': invalid skip setting {other:?}")));
            }
        };

        let skip_if_outputs = match get("skip_if_outputs") {
            None | Some(YamlValue::Null) => None,
            Some(YamlValue::String(s)) => match s.as_str() {
                "exist" => Some(SkipIfOutputs::Exist),
                "fresh" => Some(SkipIfOutputs::Fresh),
                other => {
                    return Err(schema_error(format!(
                        "step '{label}': skip_if_outputs must be 'exist' or 'fresh', got '{other}'"
                    )));
                }
            },
            Some(other) => {
                return Err(schema_error(format!(
                    "step '{label}': invalid skip_if_outputs setting {other:?}"
                )));
            }
        };

        let tags = match get("tags") {
            Some(YamlValue::String(s)) => vec![s.clone()],
            Some(YamlValue::Sequence(seq)) => seq.iter().map(yaml_key_to_string).collect(),
            _ => Vec::new(),
        };

        let cargo_name = match &cargo {
            StepCargo::CabRef(YamlValue::String(name))
            | StepCargo::RecipeRef(YamlValue::String(name)) => Some(name.clone()),
            _ => None,
        };

        Ok(Step {
            name: label.to_string(),
            cargo_name,
            fqname: label.to_string(),
            info: get("info").map(yaml_key_to_string).unwrap_or_default(),
            params,
            skip,
            skip_static,
            skip_if_outputs,
            tags,
            backend: get("backend")
                .filter(|v| !matches!(v, YamlValue::Null))
                .map(yaml_key_to_string),
            assign: get("assign").map(parse_assign_section).unwrap_or_default(),
            assign_based_on: get("assign_based_on")
                .map(|v| parse_assign_based_on(v, label))
                .transpose()?
                .unwrap_or_default(),
            cargo,
            validated_params: None,
            log: None,
        })
    }

    pub fn finalized(&self) -> bool {
        matches!(self.cargo, StepCargo::Cab(_) | StepCargo::Recipe(_))
    }

    /// Resolves the cab/recipe reference against the config, finalises the
    /// cargo, and layers schema defaults under the step's own parameters.
    pub fn finalize(
        &mut self,
        config: &StimelaConfig,
        log: RunLog,
        fqname: &str,
        nesting: usize,
        resolution_stack: &mut Vec<String>,
    ) -> Result<()> {
        if self.finalized() {
            return Ok(());
        }
        self.fqname = fqname.to_string();

        let cargo = std::mem::replace(&mut self.cargo, StepCargo::CabRef(YamlValue::Null));
        self.cargo = match cargo {
            StepCargo::CabRef(value) => {
                let definition = match &value {
                    YamlValue::String(name) => config
                        .get_cab(name)
                        .ok_or_else(|| definition_error(format!("unknown cab '{name}'")))?
                        .clone(),
                    other => other.clone(),
                };
                let mut cab = Cab::from_yaml(&definition, &self.fqname).map_err(|exc| {
                    exc.wrap(ErrorKind::StepValidation, format!("error in cab for step '{}'", self.name))
                })?;
                if cab.cargo.name.is_empty() {
                    cab.cargo.name = self.name.clone();
                }
                cab.cargo.finalize(log.clone(), Some(&self.fqname));
                StepCargo::Cab(Box::new(cab))
            }
            StepCargo::RecipeRef(value) => {
                let (definition, ref_name) = match &value {
                    YamlValue::String(name) => {
                        // cyclic library references are detected by marking
                        // in-progress resolutions
                        if resolution_stack.contains(name) {
                            return Err(definition_error(format!(
                                "cyclic recipe reference: '{name}' is already being resolved"
                            )));
                        }
                        let definition = config
                            .get_recipe(name)
                            .ok_or_else(|| {
                                definition_error(format!("recipe '{name}' not found in lib.recipes"))
                            })?
                            .clone();
                        (definition, Some(name.clone()))
                    }
                    other => (other.clone(), None),
                };
                if let Some(name) = &ref_name {
                    resolution_stack.push(name.clone());
                }
                let result = (|| -> Result<Recipe> {
                    let mut recipe = Recipe::from_yaml(&definition, &self.fqname)?;
                    recipe.finalize(config, log.clone(), &self.fqname, nesting + 1, resolution_stack)?;
                    Ok(recipe)
                })();
                if ref_name.is_some() {
                    resolution_stack.pop();
                }
                let mut recipe = result.map_err(|exc| {
                    exc.wrap(
                        ErrorKind::StepValidation,
                        format!("error in nested recipe for step '{}'", self.name),
                    )
                })?;
                if recipe.cargo.name.is_empty() {
                    recipe.cargo.name = self.name.clone();
                }
                StepCargo::Recipe(Box::new(recipe))
            }
            resolved => resolved,
        };

        self.params = self.cargo_ref().flatten_param_dict(&self.params);
        self.log = Some(log);

        // set missing parameters from cargo defaults and schema defaults
        let mut defaults: IndexMap<String, PValue> = IndexMap::new();
        for (name, schema) in self.cargo_ref().inputs_outputs() {
            if schema.has_default() && !schema.default.is_unresolved() {
                defaults.insert(name.clone(), schema.default.clone());
            }
        }
        for (name, value) in &self.cargo_ref().defaults {
            defaults.insert(name.clone(), value.clone());
        }
        for (name, value) in defaults {
            if !self.params.contains_key(&name) {
                self.params.insert(name, value);
            }
        }
        Ok(())
    }

    pub fn cargo_ref(&self) -> &crate::cargo::Cargo {
        match &self.cargo {
            StepCargo::Cab(cab) => &cab.cargo,
            StepCargo::Recipe(recipe) => &recipe.cargo,
            _ => panic!("step '{}' is not finalized", self.name),
        }
    }

    fn cargo_mut(&mut self) -> &mut crate::cargo::Cargo {
        match &mut self.cargo {
            StepCargo::Cab(cab) => &mut cab.cargo,
            StepCargo::Recipe(recipe) => &mut recipe.cargo,
            _ => panic!("step is not finalized"),
        }
    }

    pub fn as_recipe(&self) -> Option<&Recipe> {
        match &self.cargo {
            StepCargo::Recipe(recipe) => Some(recipe),
            _ => None,
        }
    }

    pub fn as_recipe_mut(&mut self) -> Option<&mut Recipe> {
        match &mut self.cargo {
            StepCargo::Recipe(recipe) => Some(recipe),
            _ => None,
        }
    }

    pub fn as_cab(&self) -> Option<&Cab> {
        match &self.cargo {
            StepCargo::Cab(cab) => Some(cab),
            _ => None,
        }
    }

    pub fn log(&self) -> RunLog {
        self.log.clone().unwrap_or_else(|| RunLog::new(self.fqname.clone()))
    }

    pub fn update_parameter(&mut self, name: &str, value: PValue) {
        self.params.insert(name.to_string(), value);
    }

    pub fn unset_parameter(&mut self, name: &str) {
        self.params.shift_remove(name);
    }

    /// Is this parameter defined in any way (set, defaulted, or implicit)?
    pub fn has_param_value(&self, name: &str) -> bool {
        if self.params.contains_key(name) || self.cargo_ref().defaults.contains_key(name) {
            return true;
        }
        self.cargo_ref()
            .get_schema(name)
            .map(|schema| schema.has_default() || schema.implicit.is_some())
            .unwrap_or(false)
    }

    /// Pre-validates the step's parameters; missing outputs get UNSET
    /// markers so downstream aliases can track them. A nested recipe is
    /// pre-validated in depth (aliases, assignments, its own steps).
    pub fn prevalidate(
        &mut self,
        config: &mut StimelaConfig,
        subst: Option<(&mut SubstitutionNs, Option<&str>)>,
    ) -> Result<IndexMap<String, PValue>> {
        let params = self.params.clone();
        let mut validated = if matches!(self.cargo, StepCargo::Recipe(_)) {
            let outer = subst.as_ref().map(|(ns, _)| &**ns);
            let StepCargo::Recipe(recipe) = &mut self.cargo else {
                unreachable!()
            };
            recipe.prevalidate(&params, config, outer)?
        } else {
            self.cargo_mut().prevalidate(&params, subst)?
        };
        let output_names: Vec<String> = self.cargo_ref().outputs.keys().cloned().collect();
        for name in output_names {
            if !validated.contains_key(&name) {
                validated.insert(name.clone(), PValue::Unset(name));
            }
        }
        self.validated_params = Some(validated.clone());
        Ok(validated)
    }

    pub fn unresolved_params(&self) -> Vec<String> {
        match &self.validated_params {
            Some(params) => params
                .iter()
                .filter(|(_, value)| value.is_unresolved())
                .map(|(name, _)| name.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Evaluates the skip condition for this invocation.
    fn evaluate_skip(
        &self,
        config: &StimelaConfig,
        subst: &mut SubstitutionNs,
        params: &IndexMap<String, PValue>,
    ) -> Result<bool> {
        let mut skip = match self.skip_static {
            Some(value) => value,
            None => {
                let raw = self.skip.clone().unwrap_or_default();
                let mut skips = IndexMap::new();
                skips.insert("skip".to_string(), PValue::Str(raw.clone()));
                let evaluated = evaluate_and_substitute(
                    &skips,
                    subst,
                    None,
                    &IndexMap::new(),
                    false,
                    &[self.fqname.clone()],
                )
                .map_err(|exc| {
                    exc.wrap(
                        ErrorKind::StepValidation,
                        format!("{}.skip: error evaluating '{raw}'", self.fqname),
                    )
                })?;
                match evaluated.get("skip") {
                    None => false,
                    Some(value) if value.is_marker() => {
                        return Err(StimelaError::new(
                            ErrorKind::StepValidation,
                            format!("{}.skip: error evaluating '{raw}' ({value})", self.fqname),
                        ));
                    }
                    Some(value) => value.truthy(),
                }
            }
        };

        // output-freshness skips
        if !skip {
            if let Some(mode) = self.skip_if_outputs {
                let disabled = match mode {
                    SkipIfOutputs::Exist => config.opts.disable_skips.exist,
                    SkipIfOutputs::Fresh => config.opts.disable_skips.fresh,
                };
                if !disabled && self.outputs_up_to_date(params, mode) {
                    self.log().info(format!(
                        "skipping step '{}': outputs are {}",
                        self.name,
                        match mode {
                            SkipIfOutputs::Exist => "present",
                            SkipIfOutputs::Fresh => "fresh",
                        }
                    ));
                    skip = true;
                }
            }
        }
        Ok(skip)
    }

    /// True if every file-like output exists (and, for Fresh, is at least as
    /// new as the newest input).
    fn outputs_up_to_date(&self, params: &IndexMap<String, PValue>, mode: SkipIfOutputs) -> bool {
        let cargo = self.cargo_ref();
        let mut have_outputs = false;
        let mut newest_input: Option<std::time::SystemTime> = None;
        let mut oldest_output: Option<std::time::SystemTime> = None;

        for (name, schema) in cargo.inputs.iter().chain(cargo.outputs.iter()) {
            if !schema.dtype.is_path_type() || schema.skip_freshness_checks == Some(true) {
                continue;
            }
            let Some(PValue::Str(path)) = params.get(name) else {
                if schema.is_output() {
                    return false;
                }
                continue;
            };
            let mtime = std::fs::metadata(Path::new(path)).and_then(|m| m.modified()).ok();
            if schema.is_output() {
                have_outputs = true;
                match mtime {
                    None => return false,
                    Some(t) => {
                        oldest_output =
                            Some(oldest_output.map_or(t, |prev: std::time::SystemTime| prev.min(t)))
                    }
                }
            } else if let Some(t) = mtime {
                newest_input = Some(newest_input.map_or(t, |prev: std::time::SystemTime| prev.max(t)));
            }
        }

        if !have_outputs {
            return false;
        }
        match mode {
            SkipIfOutputs::Exist => true,
            SkipIfOutputs::Fresh => match (newest_input, oldest_output) {
                (Some(input), Some(output)) => output >= input,
                _ => true,
            },
        }
    }

    /// Runs the step: skip evaluation, input validation (loose when
    /// skipping), cab or nested-recipe invocation, output validation.
    pub fn run(
        &mut self,
        config: &mut StimelaConfig,
        subst: &mut SubstitutionNs,
        parent_log: &RunLog,
    ) -> Result<IndexMap<String, PValue>> {
        if self.validated_params.is_none() {
            self.prevalidate(config, Some((&mut *subst, Some("current"))))?;
        }
        let log = self.log();
        let _task = task_stats::declare_subtask(&self.name);

        let mut params = self.validated_params.clone().unwrap_or_default();
        for (name, value) in &self.params {
            params.insert(name.clone(), value.clone());
        }

        let skip = self.evaluate_skip(config, subst, &params)?;
        let mut skip_warned = false;

        match self.cargo_mut().validate_inputs(&params, Some((&mut *subst, Some("current"))), skip) {
            Ok(validated) => {
                params = validated;
            }
            Err(exc) => {
                let severity = if skip { Severity::Warning } else { Severity::Error };
                let wrapped = exc.wrap(
                    ErrorKind::StepValidation,
                    format!("step '{}': error validating inputs", self.name),
                );
                log.log_exception(&wrapped, severity);
                if skip {
                    parent_log.warning("since the step is being skipped, this is not fatal");
                    skip_warned = true;
                } else {
                    return Err(wrapped);
                }
            }
        }

        if let Some(validated) = &mut self.validated_params {
            for (name, value) in &params {
                validated.insert(name.clone(), value.clone());
            }
        }
        if let Some(current) = subst.get_ns_mut("current") {
            current.merge(&params);
        }

        // unresolved inputs and named outputs are fatal unless skipping
        let cargo = self.cargo_ref();
        let invalid: Vec<String> = params
            .iter()
            .filter(|(name, value)| {
                value.is_unresolved()
                    && cargo
                        .get_schema(name)
                        .map(|schema| schema.is_input || schema.is_named_output())
                        .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();
        if !invalid.is_empty() {
            if skip {
                log.warning(format!("invalid inputs: {}", join_quote(&invalid)));
                if !skip_warned {
                    parent_log.warning("since the step was skipped, this is not fatal");
                    skip_warned = true;
                }
            } else {
                return Err(StimelaError::new(
                    ErrorKind::StepValidation,
                    format!("step '{}': invalid inputs: {}", self.name, join_quote(&invalid)),
                ));
            }
        }

        if !skip {
            match &mut self.cargo {
                StepCargo::Recipe(recipe) => {
                    let outputs = recipe.run(&params, config, subst, &log)?;
                    for (name, value) in outputs {
                        params.insert(name, value);
                    }
                }
                StepCargo::Cab(cab) => {
                    let mut backend_opts = config.opts.backend.clone();
                    let effective = match (&self.backend, &cab.cargo.backend) {
                        (Some(step_backend), Some(cab_backend)) => {
                            if step_backend != cab_backend {
                                log.info(format!(
                                    "step backend '{step_backend}' overrides cab backend '{cab_backend}'"
                                ));
                            }
                            Some(step_backend.clone())
                        }
                        (Some(step_backend), None) => Some(step_backend.clone()),
                        (None, Some(cab_backend)) => Some(cab_backend.clone()),
                        (None, None) => None,
                    };
                    if let Some(name) = effective {
                        backend_opts.select = vec![name];
                    }
                    let runner =
                        crate::backends::validate_backend_settings(&backend_opts, &log, cab)?;
                    let ctx = crate::substitutions::SubstContext::new(true);
                    let mut cabstat = runner.run(
                        cab,
                        &params,
                        &self.fqname,
                        &backend_opts,
                        &log,
                        subst,
                        &ctx,
                    )?;
                    for message in cabstat.warnings() {
                        log.warning(format!("cab '{}': {message}", cab.name()));
                    }
                    if cabstat.success() == Some(false) {
                        return Err(StimelaError::with_nested(
                            ErrorKind::CabRuntime,
                            format!("error running cab '{}'", cab.name()),
                            cabstat.take_errors(),
                        ));
                    }
                    for (name, value) in cabstat.outputs() {
                        params.insert(name.clone(), value.clone());
                    }
                }
                _ => {
                    return Err(StimelaError::new(
                        ErrorKind::StepExecution,
                        format!("step '{}' is not finalized", self.name),
                    ));
                }
            }
        } else if self.skip_static.is_none() {
            parent_log.info(format!(
                "skipping step based on setting of '{}'",
                self.skip.as_deref().unwrap_or("")
            ));
        } else {
            parent_log.info("skipping step based on explicit setting");
        }

        match self.cargo_mut().validate_outputs(&params, Some((&mut *subst, Some("current"))), skip) {
            Ok(validated) => {
                for (name, value) in validated {
                    params.insert(name, value);
                }
                if let Some(current) = subst.get_ns_mut("current") {
                    current.merge(&params);
                }
            }
            Err(exc) => {
                let severity = if skip { Severity::Warning } else { Severity::Error };
                let wrapped = exc.wrap(
                    ErrorKind::StepValidation,
                    format!("step '{}': error validating outputs", self.name),
                );
                log.log_exception(&wrapped, severity);
                if skip {
                    log.warning("since the step was skipped, this is not fatal");
                } else {
                    return Err(wrapped);
                }
            }
        }

        if let Some(validated) = &mut self.validated_params {
            for (name, value) in &params {
                validated.insert(name.clone(), value.clone());
            }
        }

        // invalid outputs abort unless skipped
        let cargo = self.cargo_ref();
        let invalid: Vec<String> = params
            .iter()
            .filter(|(name, value)| value.is_unresolved() && cargo.outputs.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect();
        if !invalid.is_empty() {
            if skip {
                parent_log.warning(format!("invalid outputs: {}", join_quote(&invalid)));
                parent_log.warning("since the step was skipped, this is not fatal");
            } else {
                return Err(StimelaError::new(
                    ErrorKind::StepValidation,
                    format!("step '{}': invalid outputs: {}", self.name, join_quote(&invalid)),
                ));
            }
        }

        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_from(yaml: &str) -> Result<Step> {
        let value: YamlValue = serde_yaml::from_str(yaml).unwrap();
        Step::from_yaml("s1", &value)
    }

    #[test]
    fn step_requires_cab_or_recipe() {
        assert!(step_from("params: {}\n").is_err());
        assert!(step_from("cab: echo\nrecipe: demo\n").is_err());
        assert!(step_from("cab: echo\n").is_ok());
    }

    #[test]
    fn static_and_dynamic_skip_parsing() {
        assert_eq!(step_from("cab: x\n").unwrap().skip_static, Some(false));
        assert_eq!(step_from("cab: x\nskip: true\n").unwrap().skip_static, Some(true));
        assert_eq!(step_from("cab: x\nskip: \"false\"\n").unwrap().skip_static, Some(false));
        let dynamic = step_from("cab: x\nskip: \"={recipe.a} == 'skip'\"\n").unwrap();
        assert_eq!(dynamic.skip_static, None);
        assert!(dynamic.skip.is_some());
    }

    #[test]
    fn skip_if_outputs_modes() {
        assert_eq!(
            step_from("cab: x\nskip_if_outputs: exist\n").unwrap().skip_if_outputs,
            Some(SkipIfOutputs::Exist)
        );
        assert_eq!(
            step_from("cab: x\nskip_if_outputs: fresh\n").unwrap().skip_if_outputs,
            Some(SkipIfOutputs::Fresh)
        );
        assert!(step_from("cab: x\nskip_if_outputs: maybe\n").is_err());
    }

    #[test]
    fn finalize_resolves_cab_by_name() {
        let tree: YamlValue = serde_yaml::from_str(
            "cabs:\n  echo:\n    command: /bin/echo\n    inputs:\n      message: str=hi\n",
        )
        .unwrap();
        let config = StimelaConfig::from_tree(tree).unwrap();
        let mut step = step_from("cab: echo\n").unwrap();
        let mut stack = Vec::new();
        step.finalize(&config, RunLog::new("test"), "recipe.s1", 0, &mut stack)
            .unwrap();
        assert!(step.finalized());
        // schema default layered into step params
        assert_eq!(step.params["message"], PValue::Str("hi".into()));
    }

    #[test]
    fn finalize_unknown_cab_fails() {
        let config = StimelaConfig::from_tree(serde_yaml::from_str("cabs: {}\n").unwrap()).unwrap();
        let mut step = step_from("cab: nope\n").unwrap();
        let mut stack = Vec::new();
        let err = step
            .finalize(&config, RunLog::new("test"), "recipe.s1", 0, &mut stack)
            .unwrap_err();
        assert!(err.to_string().contains("unknown cab"));
    }

    #[test]
    fn prevalidate_marks_missing_outputs() {
        let tree: YamlValue = serde_yaml::from_str(
            "cabs:\n  tool:\n    command: /bin/true\n    outputs:\n      result: File\n",
        )
        .unwrap();
        let config = StimelaConfig::from_tree(tree).unwrap();
        let mut step = step_from("cab: tool\n").unwrap();
        let mut stack = Vec::new();
        step.finalize(&config, RunLog::new("test"), "r.s1", 0, &mut stack).unwrap();
        let mut config = config;
        let validated = step.prevalidate(&mut config, None).unwrap();
        assert!(validated["result"].is_unset());
    }
}
