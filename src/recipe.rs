use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;
use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;

use crate::basetypes::{PValue, Unresolved, yaml_key_to_string};
use crate::cargo::Cargo;
use crate::errors::{
    ErrorKind, Result, StimelaError, assignment_error, definition_error, param_error,
    schema_error,
};
use crate::progress::{cancellation_requested, log_progress};
use crate::runlog::RunLog;
use crate::schema::{Parameter, ParameterCategory};
use crate::settings::{LogOptions, StimelaConfig};
use crate::step::{Step, StepCargo, parse_assign_based_on, parse_assign_section};
use crate::substitutions::{NsEntry, SubstitutionNs, wildcard_match};
use crate::task_stats;
use crate::validate::evaluate_and_substitute;

/// For-loop iteration source: a named input, or a literal value list.
#[derive(Debug, Clone)]
pub enum OverSpec {
    Input(String),
    Values(Vec<PValue>),
}

/// Recipe-level for-loop/scatter clause.
#[derive(Debug, Clone)]
pub struct ForLoopClause {
    pub var: String,
    pub over: Option<OverSpec>,
    /// 0 = serial, -1 = one worker per iterant, N = bounded pool of N
    pub scatter: i64,
    pub display_status: Option<String>,
}

/// Where an alias value propagates.
#[derive(Debug, Clone)]
pub struct AliasInfo {
    pub step_label: String,
    pub param: String,
    pub is_output: bool,
    pub from_recipe: bool,
    pub from_step: bool,
}

/// A named composition of steps, with parameter aliasing between recipe and
/// steps, variable assignment sections, and optional for-loop semantics.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub cargo: Cargo,
    pub steps: IndexMap<String, Step>,
    pub assign: IndexMap<String, PValue>,
    pub assign_based_on: IndexMap<String, IndexMap<String, IndexMap<String, PValue>>>,
    pub aliases: IndexMap<String, Vec<String>>,
    pub for_loop: Option<ForLoopClause>,
    pub logopts: LogOptions,

    alias_map: IndexMap<(String, String), String>,
    alias_list: IndexMap<String, Vec<AliasInfo>>,
    orig_alias_schema: IndexMap<String, Option<Parameter>>,
    for_loop_values: Option<Vec<PValue>>,
    protected_from_assign: HashSet<String>,
    finalized: bool,
}

fn parse_for_loop(value: &YamlValue, label: &str) -> Result<ForLoopClause> {
    let YamlValue::Mapping(map) = value else {
        return Err(schema_error(format!("{label}.for_loop: mapping expected")));
    };
    let get = |key: &str| map.get(YamlValue::String(key.to_string()));
    let var = get("var")
        .map(yaml_key_to_string)
        .ok_or_else(|| schema_error(format!("{label}.for_loop: var is required")))?;
    let over = match get("over") {
        None | Some(YamlValue::Null) => None,
        Some(YamlValue::String(name)) => Some(OverSpec::Input(name.clone())),
        Some(YamlValue::Sequence(seq)) => {
            Some(OverSpec::Values(seq.iter().map(PValue::from_yaml).collect()))
        }
        Some(other) => {
            return Err(schema_error(format!(
                "{label}.for_loop.over is of invalid type {other:?}"
            )));
        }
    };
    let scatter = match get("scatter") {
        None | Some(YamlValue::Null) => 0,
        Some(YamlValue::Bool(true)) => -1,
        Some(YamlValue::Bool(false)) => 0,
        Some(YamlValue::Number(n)) => n.as_i64().unwrap_or(0),
        Some(other) => {
            return Err(param_error(format!(
                "{label}.for_loop.scatter={other:?}: bool or int expected"
            )));
        }
    };
    Ok(ForLoopClause {
        var,
        over,
        scatter,
        display_status: get("display_status")
            .filter(|v| !matches!(v, YamlValue::Null))
            .map(yaml_key_to_string),
    })
}

impl Recipe {
    pub fn from_yaml(value: &YamlValue, label: &str) -> Result<Recipe> {
        let YamlValue::Mapping(map) = value else {
            return Err(schema_error(format!("{label}: recipe definition must be a mapping")));
        };
        let cargo = Cargo::from_mapping(map, label)?;
        let get = |key: &str| map.get(YamlValue::String(key.to_string()));

        let mut steps = IndexMap::new();
        if let Some(YamlValue::Mapping(step_map)) = get("steps") {
            for (step_label, step_value) in step_map {
                let step_label = yaml_key_to_string(step_label);
                let step = Step::from_yaml(&step_label, step_value).map_err(|exc| {
                    exc.wrap(
                        ErrorKind::StepValidation,
                        format!("{label}: error in definition of step '{step_label}'"),
                    )
                })?;
                steps.insert(step_label, step);
            }
        }

        let mut aliases = IndexMap::new();
        if let Some(YamlValue::Mapping(alias_map)) = get("aliases") {
            for (name, targets) in alias_map {
                let name = yaml_key_to_string(name);
                let targets = match targets {
                    YamlValue::String(s) => vec![s.clone()],
                    YamlValue::Sequence(seq) => seq.iter().map(yaml_key_to_string).collect(),
                    other => {
                        return Err(schema_error(format!(
                            "{label}: alias '{name}': name or list of names expected, got {other:?}"
                        )));
                    }
                };
                for target in &targets {
                    if !target.contains('.') {
                        return Err(schema_error(format!(
                            "{label}: alias '{name}': invalid target '{target}' (missing dot)"
                        )));
                    }
                }
                aliases.insert(name, targets);
            }
        }

        let for_loop = match get("for_loop") {
            None | Some(YamlValue::Null) => None,
            Some(value) => Some(parse_for_loop(value, label)?),
        };

        let recipe = Recipe {
            cargo,
            steps,
            assign: get("assign").map(parse_assign_section).unwrap_or_default(),
            assign_based_on: get("assign_based_on")
                .map(|v| parse_assign_based_on(v, label))
                .transpose()?
                .unwrap_or_default(),
            aliases,
            for_loop,
            logopts: LogOptions::default(),
            alias_map: IndexMap::new(),
            alias_list: IndexMap::new(),
            orig_alias_schema: IndexMap::new(),
            for_loop_values: None,
            protected_from_assign: HashSet::new(),
            finalized: false,
        };

        // alias names must not clash with inputs/outputs
        for name in recipe.aliases.keys() {
            if recipe.cargo.get_schema(name).is_some() {
                return Err(definition_error(format!(
                    "{label}: alias '{name}' also appears under inputs or outputs"
                )));
            }
        }
        // the loop variable must not clash either
        if let Some(for_loop) = &recipe.for_loop {
            if recipe.cargo.inputs.contains_key(&for_loop.var)
                || recipe.cargo.outputs.contains_key(&for_loop.var)
            {
                return Err(definition_error(format!(
                    "{label}: for_loop.var={} clashes with an input or output",
                    for_loop.var
                )));
            }
        }
        Ok(recipe)
    }

    pub fn name(&self) -> &str {
        &self.cargo.name
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    fn log(&self) -> RunLog {
        self.cargo
            .log
            .clone()
            .unwrap_or_else(|| RunLog::new(self.cargo.name.clone()))
    }

    /// Finalises the recipe: resolves and finalises steps, derives alias
    /// schemas (explicit and auto), checks the for-loop clause.
    pub fn finalize(
        &mut self,
        config: &StimelaConfig,
        log: RunLog,
        fqname: &str,
        nesting: usize,
        resolution_stack: &mut Vec<String>,
    ) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.logopts = config.opts.log.clone();
        self.cargo.finalize(log.clone(), Some(fqname));

        let labels: Vec<String> = self.steps.keys().cloned().collect();
        for label in &labels {
            let step_log = log.child(label);
            let step_fqname = format!("{fqname}.{label}");
            let step = self.steps.get_mut(label).unwrap();
            step.finalize(config, step_log, &step_fqname, nesting, resolution_stack)
                .map_err(|exc| {
                    exc.wrap(ErrorKind::StepValidation, format!("error validating step '{label}'"))
                })?;
        }

        // aliases declared inside input/output schemas
        let mut declared: Vec<(String, String)> = Vec::new();
        for (name, schema) in self.cargo.inputs.iter().chain(self.cargo.outputs.iter()) {
            for target in &schema.aliases {
                declared.push((name.clone(), target.clone()));
            }
        }
        for (name, target) in declared {
            self.add_alias(&name, &target, None)?;
        }
        // aliases section
        let alias_entries: Vec<(String, Vec<String>)> = self
            .aliases
            .iter()
            .map(|(name, targets)| (name.clone(), targets.clone()))
            .collect();
        for (name, targets) in alias_entries {
            for target in targets {
                self.add_alias(&name, &target, None)?;
            }
        }

        // auto-aliases for unset, non-implicit, non-defaulted step parameters
        for label in &labels {
            let schemas = self.steps[label].cargo_ref().inputs_outputs();
            for (name, schema) in schemas {
                let has_value = self.steps[label].has_param_value(&name);
                if self.alias_map.contains_key(&(label.clone(), name.clone()))
                    || schema.implicit.is_some()
                    || has_value
                {
                    continue;
                }
                let auto_name = format!("{label}.{name}");
                if self.cargo.get_schema(&auto_name).is_some() {
                    return Err(definition_error(format!(
                        "recipe '{}': auto-generated parameter name '{auto_name}' conflicts with another name; define an explicit alias",
                        self.cargo.name
                    )));
                }
                let category = if schema.is_required() {
                    ParameterCategory::Required
                } else {
                    ParameterCategory::Obscure
                };
                self.add_alias(&auto_name, &format!("{label}.{name}"), Some(category))?;
            }
        }

        // for-loop over a named input makes that input required
        if let Some(for_loop) = self.for_loop.clone() {
            match &for_loop.over {
                Some(OverSpec::Input(name)) => {
                    if let Some(schema) = self.cargo.inputs.get_mut(name) {
                        schema.required = Some(true);
                    } else {
                        return Err(definition_error(format!(
                            "recipe '{}': for_loop.over={name} is not a defined input",
                            self.cargo.name
                        )));
                    }
                }
                Some(OverSpec::Values(values)) => {
                    self.for_loop_values = Some(values.clone());
                }
                None => {}
            }
        }

        self.finalized = true;
        Ok(())
    }

    /// Derives (or merges into) a recipe-level schema for an alias target
    /// `step.param`, and records the propagation record.
    fn add_alias(
        &mut self,
        alias_name: &str,
        alias_target: &str,
        category: Option<ParameterCategory>,
    ) -> Result<()> {
        let recipe_name = self.cargo.name.clone();
        // $$ maps to the full alias name, $ to its last component
        let target = alias_target
            .replace("$$", alias_name)
            .replace('$', alias_name.rsplit('.').next().unwrap_or(alias_name));
        let Some((step_spec, param)) = target.split_once('.') else {
            return Err(schema_error(format!(
                "recipe '{recipe_name}': alias '{alias_name}': invalid target '{target}'"
            )));
        };

        // resolve the step specifier: exact label, (cargo-name) group, or
        // wildcard pattern
        let mut wildcards = false;
        let labels: Vec<String> = if step_spec.starts_with('(') && step_spec.ends_with(')') {
            wildcards = true;
            let cargo_name = &step_spec[1..step_spec.len() - 1];
            self.steps
                .iter()
                .filter(|(_, step)| step.cargo_name.as_deref() == Some(cargo_name))
                .map(|(label, _)| label.clone())
                .collect()
        } else if step_spec.contains('*') || step_spec.contains('?') {
            wildcards = true;
            self.steps
                .keys()
                .filter(|label| wildcard_match(step_spec, label))
                .cloned()
                .collect()
        } else {
            vec![step_spec.to_string()]
        };

        for label in labels {
            let Some(step) = self.steps.get(&label) else {
                return Err(definition_error(format!(
                    "recipe '{recipe_name}': alias '{alias_name}' refers to unknown step '{label}'"
                )));
            };
            let input_schema = step.cargo_ref().inputs.get(param).cloned();
            let output_schema = step.cargo_ref().outputs.get(param).cloned();
            let schema = input_schema.clone().or(output_schema.clone());

            if wildcards && (schema.is_none() || step.params.contains_key(param)) {
                continue;
            }
            let Some(schema) = schema else {
                return Err(definition_error(format!(
                    "recipe '{recipe_name}': alias '{alias_name}' refers to unknown step parameter '{label}.{param}'"
                )));
            };
            if input_schema.as_ref().is_some_and(|s| s.implicit.is_some()) {
                return Err(definition_error(format!(
                    "recipe '{recipe_name}': alias '{alias_name}' refers to implicit input '{label}.{param}'"
                )));
            }

            let is_output = output_schema.is_some();
            let existing = self.alias_list.get(alias_name).and_then(|l| l.first()).cloned();

            let orig_schema = if let Some(existing) = &existing {
                if existing.is_output {
                    return Err(definition_error(format!(
                        "recipe '{recipe_name}': output alias '{alias_name}' is defined more than once"
                    )));
                }
                if is_output {
                    return Err(definition_error(format!(
                        "recipe '{recipe_name}': alias '{alias_name}' refers to both an input and an output"
                    )));
                }
                let alias_schema = self.cargo.inputs.get(alias_name).unwrap();
                if alias_schema.dtype_str != schema.dtype_str {
                    return Err(definition_error(format!(
                        "recipe '{recipe_name}': alias '{alias_name}': dtype {} of '{label}.{param}' doesn't match previous dtype {}",
                        schema.dtype_str, alias_schema.dtype_str
                    )));
                }
                self.orig_alias_schema.get(alias_name).cloned().flatten()
            } else {
                // first definition: derive the alias schema from the target
                let orig_schema = self.cargo.get_schema(alias_name).cloned();
                self.orig_alias_schema.insert(alias_name.to_string(), orig_schema.clone());
                let mut alias_schema = schema.clone();
                alias_schema.aliases = Vec::new();
                alias_schema.is_input = !is_output;

                if let Some(orig) = &orig_schema {
                    if orig.has_default() {
                        // a recipe-level default overrides step settings
                        alias_schema.default = orig.default.clone();
                        if let Some(step) = self.steps.get_mut(&label) {
                            step.unset_parameter(param);
                        }
                    }
                    if !orig.info.is_empty() {
                        alias_schema.info = orig.info.clone();
                    }
                    if orig.required.is_some() {
                        alias_schema.required = orig.required;
                    }
                    if orig.category.is_some() {
                        alias_schema.category = orig.category;
                    }
                }
                if !alias_schema.has_default() {
                    // inherit a value or default set at step level
                    let step = &self.steps[&label];
                    let defval = step
                        .params
                        .get(param)
                        .cloned()
                        .or_else(|| step.cargo_ref().defaults.get(param).cloned())
                        .or_else(|| schema.has_default().then(|| schema.default.clone()));
                    if let Some(defval) = defval {
                        if !defval.is_marker() {
                            alias_schema.required = Some(false);
                            alias_schema.default = defval;
                        }
                    }
                }
                if category.is_some() {
                    alias_schema.category = category;
                } else if let Some(orig) = &orig_schema {
                    if orig.category.is_some() {
                        alias_schema.category = orig.category;
                    }
                }

                // implicit step outputs propagate up as implicit recipe
                // outputs, resolved when the step runs
                if schema.implicit.is_some() {
                    alias_schema.implicit = Some(PValue::Unresolved(Unresolved::new(format!(
                        "{label}.{param}"
                    ))));
                }

                // step parameter defined in any way makes the alias
                // effectively defaulted
                let have_step_param = self.steps[&label].has_param_value(param)
                    || alias_schema.has_default()
                    || alias_schema.implicit.is_some();
                if have_step_param && !alias_schema.has_default() {
                    alias_schema.default = PValue::Placeholder(format!("{label}.{param}"));
                }
                if schema.is_required()
                    && !have_step_param
                    && orig_schema.as_ref().map(|o| o.required.is_none()).unwrap_or(true)
                {
                    alias_schema.required = Some(true);
                }

                if is_output {
                    self.cargo.outputs.insert(alias_name.to_string(), alias_schema);
                } else {
                    self.cargo.inputs.insert(alias_name.to_string(), alias_schema);
                }
                orig_schema
            };
            let _ = orig_schema;

            self.alias_map
                .insert((label.clone(), param.to_string()), alias_name.to_string());
            self.alias_list
                .entry(alias_name.to_string())
                .or_default()
                .push(AliasInfo {
                    step_label: label,
                    param: param.to_string(),
                    is_output,
                    from_recipe: false,
                    from_step: false,
                });
        }
        Ok(())
    }

    /// Splits supplied parameters into the recipe's own and per-step dotted
    /// assignments.
    fn preprocess_parameters(
        &mut self,
        params: &IndexMap<String, PValue>,
    ) -> Result<IndexMap<String, PValue>> {
        let mut own = IndexMap::new();
        for (name, value) in params {
            if self.cargo.get_schema(name).is_some() {
                if !value.is_unset() {
                    own.insert(name.clone(), value.clone());
                }
            } else if let Some((label, subname)) = name.split_once('.') {
                match self.steps.get_mut(label) {
                    Some(step) => step.update_parameter(subname, value.clone()),
                    None => {
                        return Err(param_error(format!(
                            "'{name}' does not refer to a known parameter or a step"
                        )));
                    }
                }
            } else {
                return Err(param_error(format!("'{name}' does not refer to a known parameter")));
            }
        }
        Ok(own)
    }

    /// Builds the recipe-local substitution namespace.
    fn build_subst(
        &self,
        params: &IndexMap<String, PValue>,
        config: &StimelaConfig,
        outer: Option<&SubstitutionNs>,
    ) -> SubstitutionNs {
        let mut subst = SubstitutionNs::new();
        let mut info = SubstitutionNs::with_nosubst();
        info.add("fqname", PValue::Str(self.cargo.fqname.clone()));
        info.add("taskname", PValue::Str(self.cargo.fqname.clone()));
        info.add("label", PValue::Str(String::new()));
        info.add("suffix", PValue::Str(String::new()));
        subst.add_ns("info", info.clone());
        subst.add_ns("self", info);
        subst.add_nosubst("config", PValue::from_yaml(&config.tree));
        subst.add_ns("steps", SubstitutionNs::with_nosubst());
        subst.add_ns("previous", SubstitutionNs::with_nosubst());
        subst.add_ns("current", SubstitutionNs::with_nosubst());

        let mut recipe_ns = SubstitutionNs::new();
        for (name, value) in params {
            recipe_ns.add(name, value.clone());
        }
        for (name, value) in &self.assign {
            if !recipe_ns.contains(name) {
                recipe_ns.add(name, value.clone());
            }
        }
        subst.add_ns("recipe", recipe_ns);

        if let Some(outer) = outer {
            if let Some(root) = outer.get_ns("root") {
                subst.add_ns("root", root.clone());
            }
            if let Some(parent) = outer.get_ns("recipe") {
                subst.add_ns("parent", parent.clone());
            }
        } else if let Some(recipe_ns) = subst.get_ns("recipe") {
            let root = recipe_ns.clone();
            subst.add_ns("root", root);
        }
        subst
    }

    /// Prepares the namespace for one step: info fields and the
    /// current/steps subtrees.
    fn prep_step(&self, label: &str, subst: &mut SubstitutionNs) {
        let step = &self.steps[label];
        let parts: Vec<&str> = label.split('-').collect();
        let suffix = if parts.len() > 1 { parts[parts.len() - 1] } else { "" };
        for key in ["info", "self"] {
            if let Some(info) = subst.get_ns_mut(key) {
                info.add("fqname", PValue::Str(step.fqname.clone()));
                info.add("label", PValue::Str(label.to_string()));
                info.add(
                    "label_parts",
                    PValue::List(parts.iter().map(|p| PValue::Str(p.to_string())).collect()),
                );
                info.add("suffix", PValue::Str(suffix.to_string()));
            }
        }
        let mut current = SubstitutionNs::with_nosubst();
        for (name, value) in &step.params {
            current.add(name, value.clone());
        }
        subst.add_ns("current", current.clone());
        if let Some(steps) = subst.get_ns_mut("steps") {
            steps.add_ns(label, current);
        }
    }

    /// Applies the recipe's (or one step's) assign/assign_based_on sections:
    /// tolerant evaluation while accumulating, one strict pass at the end,
    /// then dispatch of each key=value.
    pub fn update_assignments(
        &mut self,
        subst: &mut SubstitutionNs,
        config: &mut StimelaConfig,
        whose_step: Option<&str>,
        ignore_subst_errors: bool,
    ) -> Result<()> {
        let (assign, assign_based_on, location) = match whose_step {
            None => (self.assign.clone(), self.assign_based_on.clone(), self.cargo.fqname.clone()),
            Some(label) => {
                let step = &self.steps[label];
                (step.assign.clone(), step.assign_based_on.clone(), step.fqname.clone())
            }
        };
        if assign.is_empty() && assign_based_on.is_empty() {
            return Ok(());
        }

        let mut pending: IndexMap<String, PValue> = IndexMap::new();

        let mut do_assign = |assignments: &IndexMap<String, PValue>,
                             subst: &mut SubstitutionNs,
                             pending: &mut IndexMap<String, PValue>|
         -> Result<()> {
            let filtered: IndexMap<String, PValue> = assignments
                .iter()
                .filter(|(name, _)| !self.protected_from_assign.contains(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            if let Some(recipe_ns) = subst.get_ns_mut("recipe") {
                recipe_ns.merge(&filtered);
            }
            let evaluated = evaluate_and_substitute(
                &filtered,
                subst,
                Some("recipe"),
                &IndexMap::new(),
                true,
                &[location.clone()],
            )
            .map_err(|exc| {
                exc.wrap(ErrorKind::Assignment, format!("{location}: error evaluating assignments"))
            })?;
            for (name, value) in evaluated {
                pending.insert(name, value);
            }
            Ok(())
        };

        do_assign(&assign, &mut *subst, &mut pending)?;

        for (basevar, cases) in &assign_based_on {
            // resolve the base variable's current value
            let value: Option<String> = if let Some(entry) =
                subst.get_ns("recipe").and_then(|ns| ns.entry(basevar))
            {
                match entry {
                    NsEntry::Value(v) => Some(v.to_string()),
                    NsEntry::Ns(_) => None,
                }
            } else if self
                .for_loop
                .as_ref()
                .map(|f| &f.var == basevar)
                .unwrap_or(false)
            {
                // loop index not assigned yet
                continue;
            } else if let Some(schema) = self.cargo.get_schema(basevar) {
                schema.has_default().then(|| schema.default.to_string())
            } else if let Some(rest) = basevar.strip_prefix("config.") {
                crate::config::lookup_name(rest, std::slice::from_ref(&config.tree))
                    .ok()
                    .map(|v| PValue::from_yaml(&v).to_string())
            } else {
                None
            };

            let Some(value) = value else {
                if self.cargo.get_schema(basevar).is_some() {
                    return Err(assignment_error(format!(
                        "{location}.assign_based_on: a value for '{basevar}' was not supplied"
                    )));
                }
                return Err(assignment_error(format!(
                    "{location}.assign_based_on: '{basevar}' is not a known variable"
                )));
            };

            let assignments = match cases.get(&value).or_else(|| cases.get("DEFAULT")) {
                Some(assignments) => assignments,
                None => {
                    return Err(assignment_error(format!(
                        "{location}.assign_based_on: neither the '{basevar}={value}' case nor a DEFAULT case is defined"
                    )));
                }
            };
            if !assignments.is_empty() {
                do_assign(assignments, &mut *subst, &mut pending)?;
            }
        }

        // final strict round, since tolerated errors may have resolved
        let finalised = evaluate_and_substitute(
            &pending,
            subst,
            Some("recipe"),
            &IndexMap::new(),
            ignore_subst_errors,
            &[location.clone()],
        )
        .map_err(|exc| {
            exc.wrap(ErrorKind::Assignment, format!("{location}: error evaluating assignments"))
        })?;

        for (key, value) in finalised {
            self.assign_value(&key, value, false, subst, config)?;
        }
        Ok(())
    }

    /// Dispatches one assignment: input/output defaults, substep parameters,
    /// config tree writes, or log options.
    pub fn assign_value(
        &mut self,
        key: &str,
        value: PValue,
        override_protect: bool,
        subst: &mut SubstitutionNs,
        config: &mut StimelaConfig,
    ) -> Result<()> {
        if self.protected_from_assign.contains(key) && !override_protect {
            return Ok(());
        }
        let (nesting, subkey) = match key.split_once('.') {
            Some((head, rest)) => (Some(head), rest),
            None => (None, key),
        };

        if self.cargo.get_schema(key).is_some() {
            if value.is_unset() {
                self.cargo.defaults.shift_remove(key);
            } else {
                self.cargo.defaults.insert(key.to_string(), value.clone());
            }
        } else if let Some(label) = nesting.filter(|label| self.steps.contains_key(*label)) {
            let label = label.to_string();
            let step = self.steps.get_mut(&label).unwrap();
            if subkey.contains('.') {
                if let Some(subrecipe) = step.as_recipe_mut() {
                    subrecipe.assign_value(subkey, value.clone(), override_protect, subst, config)?;
                } else {
                    step.update_parameter(subkey, value.clone());
                }
            } else {
                step.update_parameter(subkey, value.clone());
            }
        } else if nesting == Some("config") {
            if !value.is_marker() {
                config.set_dotted(subkey, value.to_yaml())?;
                if let Some(config_ns) = subst.get_ns_mut("config") {
                    config_ns.add(subkey, value.clone());
                }
            }
        } else if nesting == Some("log") {
            if !value.is_marker() {
                self.update_log_option(subkey, &value)?;
            }
        } else if nesting.is_none() {
            // plain variable assignment lands in the recipe namespace
            if let Some(recipe_ns) = subst.get_ns_mut("recipe") {
                recipe_ns.add(key, value.clone());
            }
        }

        if override_protect {
            if !value.is_unset() {
                self.assign.insert(key.to_string(), value);
            }
            self.protected_from_assign.insert(key.to_string());
        }
        Ok(())
    }

    fn update_log_option(&mut self, key: &str, value: &PValue) -> Result<()> {
        match key {
            "enable" => self.logopts.enable = value.truthy(),
            "name" => self.logopts.name = value.to_string(),
            "ext" => self.logopts.ext = value.to_string(),
            "dir" => self.logopts.dir = value.to_string(),
            "nest" => {
                if let PValue::Int(n) = value {
                    self.logopts.nest = *n;
                }
            }
            "level" => {
                self.logopts.level = crate::runlog::Severity::parse(&value.to_string())
                    .ok_or_else(|| assignment_error(format!("invalid log.level setting '{value}'")))?;
            }
            other => {
                return Err(assignment_error(format!(
                    "invalid {}.log.{other} setting",
                    self.cargo.fqname
                )));
            }
        }
        Ok(())
    }

    /// Pre-validation: fills defaults, propagates alias values down to steps
    /// and back up, pre-validates every step, and reports missing required
    /// parameters. Iterated to a stable point (bounded at two passes each
    /// way).
    pub fn prevalidate(
        &mut self,
        params: &IndexMap<String, PValue>,
        config: &mut StimelaConfig,
        outer: Option<&SubstitutionNs>,
    ) -> Result<IndexMap<String, PValue>> {
        let log = self.log();
        log.debug("prevalidating recipe");
        let mut errors: Vec<StimelaError> = Vec::new();

        let mut params = self.preprocess_parameters(params)?;
        let mut subst = self.build_subst(&params, config, outer);

        self.update_assignments(&mut subst, config, None, true)?;

        // the iterant is a placeholder until the loop actually runs
        if let Some(for_loop) = &self.for_loop {
            if self.cargo.inputs.contains_key(&for_loop.var) {
                params.insert(for_loop.var.clone(), PValue::Placeholder(for_loop.var.clone()));
            }
        }

        let mut prevalidate_self =
            |this: &mut Recipe, params: IndexMap<String, PValue>, subst: &mut SubstitutionNs, errors: &mut Vec<StimelaError>| {
                let result = this.cargo.prevalidate(&params, Some((&mut *subst, Some("recipe"))));
                match result {
                    Ok(validated) => {
                        if let Some(recipe_ns) = subst.get_ns_mut("recipe") {
                            recipe_ns.merge(&validated);
                        }
                        validated
                    }
                    Err(exc) => {
                        errors.push(exc.wrap(
                            ErrorKind::StepValidation,
                            "recipe failed prevalidation",
                        ));
                        params
                    }
                }
            };

        params = prevalidate_self(self, params, &mut subst, &mut errors);

        // propagate set alias values down to steps (implicit ones only ever
        // propagate up)
        let alias_names: Vec<String> = self.alias_list.keys().cloned().collect();
        for name in &alias_names {
            let value = params.get(name).cloned();
            match value {
                Some(value) if !value.is_placeholder() => {
                    let infos = self.alias_list.get_mut(name).unwrap();
                    let mut updates = Vec::new();
                    for info in infos.iter_mut() {
                        info.from_recipe = true;
                        updates.push((info.step_label.clone(), info.param.clone()));
                    }
                    for (label, param) in updates {
                        if let Some(step) = self.steps.get_mut(&label) {
                            step.update_parameter(&param, value.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        let labels: Vec<String> = self.steps.keys().cloned().collect();
        let mut prevalidate_steps = |this: &mut Recipe,
                                     subst: &mut SubstitutionNs,
                                     config: &mut StimelaConfig,
                                     errors: &mut Vec<StimelaError>|
         -> Result<()> {
            for label in &labels {
                this.prep_step(label, subst);
                this.update_assignments(subst, config, None, true)?;
                this.update_assignments(subst, config, Some(label), true)?;

                let step = this.steps.get_mut(label).unwrap();
                match step.prevalidate(config, Some((&mut *subst, Some("current")))) {
                    Ok(step_params) => {
                        if let Some(current) = subst.get_ns_mut("current") {
                            current.merge(&step_params);
                        }
                        let current = subst.get_ns("current").cloned().unwrap_or_default();
                        subst.add_ns("previous", current.clone());
                        if let Some(steps_ns) = subst.get_ns_mut("steps") {
                            steps_ns.add_ns(label, current);
                        }
                    }
                    Err(exc) => {
                        errors.push(exc.wrap(
                            ErrorKind::StepValidation,
                            format!("step '{label}' failed prevalidation"),
                        ));
                    }
                }
                this.update_assignments(subst, config, None, true)?;
            }
            Ok(())
        };

        prevalidate_steps(self, &mut subst, config, &mut errors)?;

        // propagate values up from steps into unset aliases, then back down
        // to sibling steps; bounded revalidation
        if errors.is_empty() {
            let mut revalidate_self = false;
            let mut revalidate_steps = false;
            for name in &alias_names {
                let needs_up = match params.get(name) {
                    None => true,
                    Some(value) => value.is_placeholder(),
                };
                if !needs_up {
                    continue;
                }
                let infos = self.alias_list[name].clone();
                let mut found: Option<PValue> = None;
                let mut found_label: Option<String> = None;
                for info in &infos {
                    let step = &self.steps[&info.step_label];
                    if let Some(validated) = &step.validated_params {
                        if let Some(value) = validated.get(&info.param) {
                            if !value.is_marker() {
                                // first matching step wins, deterministically
                                found = Some(value.clone());
                                found_label = Some(info.step_label.clone());
                                break;
                            }
                        }
                    }
                }
                if let Some(value) = found {
                    params.insert(name.clone(), value.clone());
                    revalidate_self = true;
                    let infos = self.alias_list.get_mut(name).unwrap();
                    let mut updates = Vec::new();
                    for info in infos.iter_mut() {
                        if Some(&info.step_label) == found_label.as_ref() {
                            info.from_step = true;
                        } else {
                            info.from_recipe = true;
                            revalidate_steps = true;
                            updates.push((info.step_label.clone(), info.param.clone()));
                        }
                    }
                    for (label, param) in updates {
                        if let Some(step) = self.steps.get_mut(&label) {
                            step.update_parameter(&param, value.clone());
                        }
                    }
                }
            }
            if revalidate_self {
                params = prevalidate_self(self, params, &mut subst, &mut errors);
            }
            if revalidate_steps {
                prevalidate_steps(self, &mut subst, config, &mut errors)?;
            }
        }

        // missing required parameters
        let missing: Vec<String> = self
            .cargo
            .inputs_outputs()
            .iter()
            .filter(|(name, schema)| schema.is_required() && !params.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect();
        if !missing.is_empty() {
            errors.push(StimelaError::with_nested(
                ErrorKind::StepValidation,
                format!("recipe is missing {} required parameter(s): {}", missing.len(), missing.join(", ")),
                Vec::new(),
            ));
        }

        if !errors.is_empty() {
            if errors.len() == 1 {
                return Err(errors.pop().unwrap());
            }
            let count = errors.len();
            return Err(StimelaError::with_nested(
                ErrorKind::StepValidation,
                format!("recipe '{}': {count} errors", self.cargo.name),
                errors,
            ));
        }

        log.debug("recipe pre-validated");
        Ok(params)
    }

    /// Resolves the for-loop iterant list from the clause, the assign
    /// section, or a named input.
    pub fn validate_for_loop(
        &mut self,
        params: &IndexMap<String, PValue>,
        strict: bool,
    ) -> Result<()> {
        let Some(for_loop) = self.for_loop.clone() else {
            self.for_loop_values = Some(vec![PValue::Null]);
            return Ok(());
        };
        let values = match &for_loop.over {
            Some(OverSpec::Input(name)) => {
                let value = self
                    .assign
                    .get(name)
                    .or_else(|| params.get(name))
                    .cloned()
                    .ok_or_else(|| {
                        param_error(format!(
                            "recipe '{}': for_loop.over={name} is unset",
                            self.cargo.name
                        ))
                    })?;
                if strict && value.is_unresolved() {
                    return Err(param_error(format!(
                        "recipe '{}': for_loop.over={name} is unresolved",
                        self.cargo.name
                    )));
                }
                value
            }
            Some(OverSpec::Values(values)) => PValue::List(values.clone()),
            None => match &self.for_loop_values {
                Some(values) => PValue::List(values.clone()),
                None => {
                    return Err(param_error(format!(
                        "recipe '{}': for_loop.over is unset",
                        self.cargo.name
                    )));
                }
            },
        };
        let values = match values {
            PValue::List(values) => values,
            scalar => vec![scalar],
        };
        self.log().debug(format!(
            "recipe is a for-loop with '{}' iterating over {} values",
            for_loop.var,
            values.len()
        ));
        self.for_loop_values = Some(values);
        Ok(())
    }

    /// Restricts the run set: tag selection, step ranges, skips and
    /// force-enables, recursing into sub-recipes by dotted prefix.
    pub fn restrict_steps(
        &mut self,
        tags: &[String],
        skip_tags: &[String],
        step_ranges: &[String],
        skip_ranges: &[String],
        enable_steps: &[String],
    ) -> Result<usize> {
        let log = self.log();

        // partition specifiers by sub-recipe prefix
        type Entry = (Vec<String>, Vec<String>, Vec<String>, Vec<String>, Vec<String>);
        let mut sub_entries: IndexMap<Option<String>, Entry> = IndexMap::new();
        let option_lists = [tags, skip_tags, step_ranges, skip_ranges, enable_steps];
        for (num, options) in option_lists.iter().enumerate() {
            for spec in options.iter() {
                let (target, spec_rest) = match spec.split_once('.') {
                    Some((prefix, rest)) => {
                        let valid = self
                            .steps
                            .get(prefix)
                            .map(|step| step.as_recipe().is_some())
                            .unwrap_or(false);
                        if !valid {
                            return Err(StimelaError::new(
                                ErrorKind::StepSelection,
                                format!("'{prefix}' (in '{spec}') does not refer to a valid subrecipe"),
                            ));
                        }
                        (Some(prefix.to_string()), rest.to_string())
                    }
                    None => (None, spec.clone()),
                };
                let entry = sub_entries.entry(target).or_default();
                match num {
                    0 => entry.0.push(spec_rest),
                    1 => entry.1.push(spec_rest),
                    2 => entry.2.push(spec_rest),
                    3 => entry.3.push(spec_rest),
                    _ => entry.4.push(spec_rest),
                }
            }
        }
        let own = sub_entries.shift_remove(&None).unwrap_or_default();
        let (tags, skip_tags, step_ranges, skip_ranges, mut enable_steps) = own;

        // all referenced tags must exist
        let known_tags: HashSet<&String> =
            self.steps.values().flat_map(|step| step.tags.iter()).collect();
        let unknown: Vec<String> = tags
            .iter()
            .chain(skip_tags.iter())
            .filter(|tag| !known_tags.contains(tag))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(StimelaError::new(
                ErrorKind::StepSelection,
                format!("unknown tag(s) '{}'", unknown.join("', '")),
            ));
        }

        let step_set = |tag: &str| -> HashSet<String> {
            self.steps
                .iter()
                .filter(|(_, step)| step.tags.iter().any(|t| t == tag))
                .map(|(label, _)| label.clone())
                .collect()
        };
        let always_steps = step_set("always");
        let never_steps = step_set("never");
        let tag_selected: HashSet<String> =
            tags.iter().flat_map(|tag| step_set(tag)).collect();
        let tag_skipped: HashSet<String> =
            skip_tags.iter().flat_map(|tag| step_set(tag)).collect();

        let mut selected: HashSet<String> = HashSet::new();
        let mut cherry_picked: HashSet<String> = HashSet::new();
        for range in &step_ranges {
            let keys = self.keys_from_range(range)?;
            // singled-out steps are cherry-picked: force-enabled
            if keys.len() == 1 {
                cherry_picked.extend(keys.iter().cloned());
            }
            selected.extend(keys);
        }
        let mut skipped: HashSet<String> = HashSet::new();
        for range in &skip_ranges {
            skipped.extend(self.keys_from_range(range)?);
        }
        enable_steps.extend(cherry_picked.iter().cloned());

        let mut active: HashSet<String> = if tag_selected.is_empty() && selected.is_empty() {
            self.steps.keys().cloned().collect()
        } else {
            tag_selected.union(&selected).cloned().collect()
        };
        active.extend(always_steps.iter().cloned());
        for label in &tag_skipped {
            active.remove(label);
        }
        for label in never_steps.difference(&tag_selected) {
            active.remove(label);
        }
        for label in &skipped {
            active.remove(label);
        }
        active.extend(cherry_picked.iter().cloned());

        for name in &enable_steps {
            if !self.steps.contains_key(name) {
                return Err(StimelaError::new(
                    ErrorKind::StepSelection,
                    format!("'{name}' does not refer to a valid step"),
                ));
            }
            self.enable_step(name, true)?;
        }

        if active.is_empty() {
            log.info("no steps have been selected for execution");
            return Ok(0);
        }

        if active.len() != self.steps.len() {
            let labels: Vec<String> = self.steps.keys().cloned().collect();
            for label in labels {
                if !active.contains(&label) {
                    let step = self.steps.get_mut(&label).unwrap();
                    step.skip_static = Some(true);
                    step.skip = Some("true".to_string());
                }
            }
        }

        let scheduled: Vec<String> = self
            .steps
            .iter()
            .filter(|(_, step)| step.skip_static != Some(true))
            .map(|(label, _)| label.clone())
            .collect();
        if scheduled.len() != self.steps.len() {
            log.info(format!(
                "the following recipe steps have been selected for execution: {}",
                scheduled.join(" ")
            ));
        }

        // recurse into sub-recipes (even unreferenced ones, so they apply
        // their own tag defaults)
        let labels: Vec<String> = self.steps.keys().cloned().collect();
        for label in labels {
            if !active.contains(&label) {
                continue;
            }
            let entry = sub_entries.get(&Some(label.clone())).cloned().unwrap_or_default();
            let step = self.steps.get_mut(&label).unwrap();
            if let Some(subrecipe) = step.as_recipe_mut() {
                subrecipe.restrict_steps(&entry.0, &entry.1, &entry.2, &entry.3, &entry.4)?;
            }
        }

        Ok(scheduled.len())
    }

    /// Expands a step specifier: a plain name, or a `[begin]:[end]`
    /// range over declaration order (inclusive at both ends).
    fn keys_from_range(&self, spec: &str) -> Result<Vec<String>> {
        let labels: Vec<String> = self.steps.keys().cloned().collect();
        if let Some((begin, end)) = spec.split_once(':') {
            let begin_idx = if begin.is_empty() {
                0
            } else {
                labels
                    .iter()
                    .position(|l| l == begin)
                    .ok_or_else(|| {
                        StimelaError::new(
                            ErrorKind::StepSelection,
                            format!("'{begin}' does not refer to a valid step"),
                        )
                    })?
            };
            let end_idx = if end.is_empty() {
                labels.len().saturating_sub(1)
            } else {
                labels
                    .iter()
                    .position(|l| l == end)
                    .ok_or_else(|| {
                        StimelaError::new(
                            ErrorKind::StepSelection,
                            format!("'{end}' does not refer to a valid step"),
                        )
                    })?
            };
            Ok(labels
                .into_iter()
                .enumerate()
                .filter(|(i, _)| *i >= begin_idx && *i <= end_idx)
                .map(|(_, l)| l)
                .collect())
        } else {
            if !self.steps.contains_key(spec) {
                return Err(StimelaError::new(
                    ErrorKind::StepSelection,
                    format!("'{spec}' does not refer to a valid step"),
                ));
            }
            Ok(vec![spec.to_string()])
        }
    }

    pub fn enable_step(&mut self, label: &str, enable: bool) -> Result<()> {
        let log = self.log();
        let step = self.steps.get_mut(label).ok_or_else(|| {
            StimelaError::new(
                ErrorKind::StepSelection,
                format!("recipe '{}': unknown step {label}", self.cargo.name),
            )
        })?;
        if enable {
            match step.skip_static {
                Some(true) => log.warning(format!("enabling step '{label}' which is normally skipped")),
                None => log.warning(format!(
                    "enabling step '{label}' which is normally conditionally skipped ('{}')",
                    step.skip.as_deref().unwrap_or("")
                )),
                Some(false) => {}
            }
            step.skip = Some("false".to_string());
            step.skip_static = Some(false);
            step.skip_if_outputs = None;
        } else {
            log.warning(format!("will skip step '{label}'"));
            step.skip = Some("true".to_string());
            step.skip_static = Some(true);
        }
        Ok(())
    }

    /// Pushes a recipe-level value down through its alias records.
    fn update_aliases(&mut self, name: &str, value: &PValue) {
        let Some(infos) = self.alias_list.get(name) else {
            return;
        };
        let updates: Vec<(String, String)> = infos
            .iter()
            .filter(|info| info.from_recipe)
            .map(|info| (info.step_label.clone(), info.param.clone()))
            .collect();
        for (label, param) in updates {
            if let Some(step) = self.steps.get_mut(&label) {
                step.update_parameter(&param, value.clone());
            }
        }
    }

    /// Runs one loop iteration: assigns the iterant, then runs each enabled
    /// step in declaration order, threading outputs through the namespace.
    fn iterate_loop_worker(
        &mut self,
        params: &mut IndexMap<String, PValue>,
        subst: &mut SubstitutionNs,
        config: &mut StimelaConfig,
        count: usize,
        iter_var: &PValue,
        total: usize,
    ) -> Result<IndexMap<String, PValue>> {
        let log = self.log();
        let mut outputs = IndexMap::new();

        let _loop_task = if let Some(for_loop) = self.for_loop.clone() {
            log.info(format!("for loop iteration {count}: {} = {iter_var}", for_loop.var));
            if self.cargo.get_schema(&for_loop.var).is_some() {
                params.insert(for_loop.var.clone(), iter_var.clone());
            } else {
                self.assign.insert(for_loop.var.clone(), iter_var.clone());
            }
            self.assign
                .insert(format!("{}@index", for_loop.var), PValue::Int(count as i64));
            if let Some(recipe_ns) = subst.get_ns_mut("recipe") {
                recipe_ns.add(&for_loop.var, iter_var.clone());
                recipe_ns.add(&format!("{}@index", for_loop.var), PValue::Int(count as i64));
            }
            self.update_aliases(&for_loop.var, iter_var);

            let status = for_loop
                .display_status
                .as_ref()
                .map(|fmt| {
                    fmt.replace("{index0}", &count.to_string())
                        .replace("{index1}", &(count + 1).to_string())
                        .replace("{total}", &total.to_string())
                        .replace("{var}", &for_loop.var)
                        .replace("{value}", &iter_var.to_string())
                })
                .unwrap_or_else(|| format!("{}/{total}", count + 1));
            task_stats::declare_subtask_status(&status);
            Some(task_stats::declare_subtask(&format!("({count})")))
        } else {
            None
        };

        let labels: Vec<String> = self.steps.keys().cloned().collect();
        for label in &labels {
            if cancellation_requested() {
                return Err(StimelaError::new(
                    ErrorKind::Runtime,
                    format!("recipe cancelled ({})", crate::progress::cancellation_reason()),
                ));
            }
            self.prep_step(label, subst);
            self.update_assignments(subst, config, None, false)?;
            self.update_assignments(subst, config, Some(label), false)?;

            let step = self.steps.get_mut(label).unwrap();
            let step_fqname = step.fqname.clone();
            if step.skip_static == Some(true) {
                log.debug(format!("step '{label}' will be explicitly skipped"));
            } else {
                log.info(format!("processing step '{label}'"));
                if !step.info.is_empty() {
                    log.info(format!("  ({})", step.info));
                }
            }

            let step_params = match step.run(config, subst, &log) {
                Ok(step_params) => step_params,
                Err(exc) => {
                    let wrapped = exc.wrap(
                        ErrorKind::StepExecution,
                        format!("step '{step_fqname}' has failed, aborting the recipe"),
                    );
                    log.log_exception(&wrapped, crate::runlog::Severity::Error);
                    return Err(wrapped);
                }
            };

            // step outputs become visible as previous/steps.<label>
            let mut step_ns = SubstitutionNs::with_nosubst();
            for (name, value) in &step_params {
                step_ns.add(name, value.clone());
            }
            subst.add_ns("previous", step_ns.clone());
            if let Some(steps_ns) = subst.get_ns_mut("steps") {
                steps_ns.add_ns(label, step_ns);
            }

            self.update_assignments(subst, config, None, false)?;

            // propagate aliased outputs up from the step
            for (name, infos) in self.alias_list.clone() {
                for info in infos {
                    if info.from_step && &info.step_label == label {
                        if self.steps[label].skip_static == Some(true) {
                            if let Some(schema) = self.cargo.outputs.get_mut(&name) {
                                schema.required = Some(false);
                            }
                        }
                        if let Some(value) = step_params.get(&info.param) {
                            outputs.insert(name.clone(), value.clone());
                        }
                    }
                }
            }
        }

        Ok(outputs)
    }

    /// Runs the recipe. Serial when scatter is 0; otherwise a bounded worker
    /// pool runs iterations concurrently, each on an immutable snapshot,
    /// with results merged by iterant index and failures aggregated.
    pub fn run(
        &mut self,
        params: &IndexMap<String, PValue>,
        config: &mut StimelaConfig,
        outer: &mut SubstitutionNs,
        _parent_log: &RunLog,
    ) -> Result<IndexMap<String, PValue>> {
        let log = self.log();
        let mut params = params.clone();
        let mut subst = self.build_subst(&params, config, Some(&*outer));
        self.update_assignments(&mut subst, config, None, true)?;

        log.info(format!("running recipe '{}'", self.cargo.name));

        // propagate validated inputs through aliases; unresolved inputs are
        // fatal at this point
        let input_names: Vec<String> = self.cargo.inputs.keys().cloned().collect();
        for name in input_names {
            match params.get(&name) {
                Some(value) => {
                    if value.is_unresolved() {
                        return Err(StimelaError::new(
                            ErrorKind::StepValidation,
                            format!("recipe '{}' has unresolved input '{name}'", self.cargo.name),
                        ));
                    }
                    if !value.is_placeholder() {
                        let value = value.clone();
                        self.update_aliases(&name, &value);
                    }
                }
                None => {
                    let schema = &self.cargo.inputs[&name];
                    let is_loop_var = self
                        .for_loop
                        .as_ref()
                        .map(|f| f.var == name)
                        .unwrap_or(false);
                    if schema.is_required() && !is_loop_var {
                        return Err(StimelaError::new(
                            ErrorKind::StepValidation,
                            format!(
                                "recipe '{}' is missing required input '{name}'",
                                self.cargo.name
                            ),
                        ));
                    }
                }
            }
        }

        self.validate_for_loop(&params, true)?;
        let values = self.for_loop_values.clone().unwrap_or_else(|| vec![PValue::Null]);
        let total = values.len();
        let scatter = self.for_loop.as_ref().map(|f| f.scatter).unwrap_or(0);

        let mut outputs = IndexMap::new();

        if scatter == 0 || total <= 1 {
            for (count, iter_var) in values.iter().enumerate() {
                outputs = self.iterate_loop_worker(
                    &mut params,
                    &mut subst,
                    config,
                    count,
                    iter_var,
                    total,
                )?;
            }
        } else {
            let num_workers = if scatter < 0 { total } else { (scatter as usize).min(total) };
            task_stats::declare_subtask_status(&format!("0/{total} complete, {num_workers} workers"));

            let (tx, rx) = mpsc::channel::<(usize, Result<IndexMap<String, PValue>>)>();
            let mut next = 0usize;
            let mut running = 0usize;
            let mut ncomplete = 0usize;
            let mut nfail = 0usize;
            let mut results: Vec<Option<IndexMap<String, PValue>>> = vec![None; total];
            let mut errors: Vec<StimelaError> = Vec::new();

            while ncomplete + nfail < total {
                while running < num_workers && next < total && !cancellation_requested() {
                    let count = next;
                    next += 1;
                    running += 1;
                    // each worker gets an immutable snapshot of the recipe,
                    // namespace and config
                    let mut recipe = self.clone();
                    let mut worker_subst = subst.clone();
                    let mut worker_config = config.clone();
                    let mut worker_params = params.clone();
                    let iter_var = values[count].clone();
                    let txc = tx.clone();
                    log_progress(format!(
                        "phase=scatter status=dispatch recipe={} iteration={count} running={running} total={total}",
                        self.cargo.name
                    ));
                    thread::spawn(move || {
                        let result = recipe.iterate_loop_worker(
                            &mut worker_params,
                            &mut worker_subst,
                            &mut worker_config,
                            count,
                            &iter_var,
                            total,
                        );
                        let _ = txc.send((count, result));
                    });
                }
                if running == 0 {
                    // cancellation drained the queue before all iterations
                    // were dispatched
                    errors.push(StimelaError::new(
                        ErrorKind::Runtime,
                        format!("recipe cancelled ({})", crate::progress::cancellation_reason()),
                    ));
                    break;
                }
                let (count, result) = match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                };
                running -= 1;
                match result {
                    Ok(iteration_outputs) => {
                        ncomplete += 1;
                        results[count] = Some(iteration_outputs);
                    }
                    Err(exc) => {
                        nfail += 1;
                        errors.push(exc);
                    }
                }
                let mut status = format!("{ncomplete}/{total} complete");
                if nfail > 0 {
                    status = format!("{status}, {nfail} failed");
                }
                status = format!("{status}, {num_workers} workers");
                task_stats::declare_subtask_status(&status);
            }

            if !errors.is_empty() {
                return Err(StimelaError::with_nested(
                    ErrorKind::Runtime,
                    format!("{nfail}/{total} jobs have failed"),
                    errors,
                ));
            }
            // keyed by iterant index, so the final outputs are deterministic
            for result in results.into_iter().flatten() {
                outputs = result;
            }
        }

        for (name, value) in &outputs {
            params.insert(name.clone(), value.clone());
        }

        log.info(format!("recipe '{}' executed successfully", self.cargo.name));
        Ok(params
            .into_iter()
            .filter(|(name, _)| self.cargo.outputs.contains_key(name))
            .collect())
    }

    /// Builds container images for all steps, recursively.
    pub fn build(
        &mut self,
        config: &StimelaConfig,
        rebuild: bool,
        log: &RunLog,
    ) -> Result<()> {
        log.info(format!("building image(s) for recipe '{}'", self.cargo.fqname));
        let labels: Vec<String> = self.steps.keys().cloned().collect();
        for label in labels {
            let step = self.steps.get_mut(&label).unwrap();
            match &mut step.cargo {
                StepCargo::Recipe(recipe) => recipe.build(config, rebuild, log)?,
                StepCargo::Cab(cab) => {
                    if cab.image.is_none() {
                        continue;
                    }
                    let runner =
                        crate::backends::validate_backend_settings(&config.opts.backend, log, cab)?;
                    runner.build(cab, &config.opts.backend, log, rebuild)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlog::RunLog;

    fn make_config(yaml: &str) -> StimelaConfig {
        let tree: YamlValue = serde_yaml::from_str(yaml).unwrap();
        StimelaConfig::from_tree(tree).unwrap()
    }

    fn make_recipe(config: &StimelaConfig, name: &str) -> Recipe {
        let definition = config.get_recipe(name).unwrap().clone();
        let mut recipe = Recipe::from_yaml(&definition, name).unwrap();
        let mut stack = Vec::new();
        recipe
            .finalize(config, RunLog::new(name), name, 0, &mut stack)
            .unwrap();
        recipe
    }

    const ECHO_CONFIG: &str = r#"
opts:
  backend:
    select: [native]
cabs:
  echo:
    command: /bin/echo
    inputs:
      message:
        dtype: str
        policies:
          positional: true
  check:
    command: sh -c
    inputs:
      script:
        dtype: str
        policies:
          positional: true
"#;

    fn loop_recipe_yaml(scatter: i64) -> String {
        format!(
            r#"
lib:
  recipes:
    loop_demo:
      name: loop_demo
      for_loop:
        var: x
        over: [a, b, c]
        scatter: {scatter}
      steps:
        say:
          cab: echo
          params:
            message: "value is {{recipe.x}}"
"#
        )
    }

    #[test]
    fn serial_for_loop_runs_all_iterations_in_order() {
        let config_yaml = format!("{ECHO_CONFIG}{}", loop_recipe_yaml(0));
        let mut config = make_config(&config_yaml);
        let mut recipe = make_recipe(&config, "loop_demo");
        recipe.prevalidate(&IndexMap::new(), &mut config, None).unwrap();

        let mut outer = SubstitutionNs::new();
        let log = RunLog::new("test");
        recipe.run(&IndexMap::new(), &mut config, &mut outer, &log).unwrap();

        // iterant and index assignments reflect the final iteration
        assert_eq!(recipe.assign["x"], PValue::Str("c".into()));
        assert_eq!(recipe.assign["x@index"], PValue::Int(2));
    }

    #[test]
    fn scatter_for_loop_completes_all_iterations() {
        let config_yaml = format!("{ECHO_CONFIG}{}", loop_recipe_yaml(2));
        let mut config = make_config(&config_yaml);
        let mut recipe = make_recipe(&config, "loop_demo");
        recipe.prevalidate(&IndexMap::new(), &mut config, None).unwrap();

        let mut outer = SubstitutionNs::new();
        let log = RunLog::new("test");
        recipe.run(&IndexMap::new(), &mut config, &mut outer, &log).unwrap();
    }

    #[test]
    fn scatter_failure_aggregates_nested_errors() {
        let config_yaml = format!(
            "{ECHO_CONFIG}{}",
            r#"
lib:
  recipes:
    loop_fail:
      name: loop_fail
      for_loop:
        var: x
        over: [a, b, c]
        scatter: 2
      steps:
        check:
          cab: check
          params:
            script: "test {recipe.x} != b"
"#
        );
        let mut config = make_config(&config_yaml);
        let mut recipe = make_recipe(&config, "loop_fail");
        recipe.prevalidate(&IndexMap::new(), &mut config, None).unwrap();

        let mut outer = SubstitutionNs::new();
        let log = RunLog::new("test");
        let err = recipe
            .run(&IndexMap::new(), &mut config, &mut outer, &log)
            .unwrap_err();
        assert!(err.to_string().contains("1/3 jobs have failed"), "{err}");
        assert_eq!(err.nested.len(), 1);
    }

    #[test]
    fn empty_for_loop_runs_zero_iterations() {
        let config_yaml = format!(
            "{ECHO_CONFIG}{}",
            r#"
lib:
  recipes:
    loop_empty:
      name: loop_empty
      inputs:
        items: List[str]
      for_loop:
        var: x
        over: items
      steps:
        say:
          cab: echo
          params:
            message: "{recipe.x}"
"#
        );
        let mut config = make_config(&config_yaml);
        let mut recipe = make_recipe(&config, "loop_empty");

        let mut params = IndexMap::new();
        params.insert("items".to_string(), PValue::List(Vec::new()));
        recipe.prevalidate(&params, &mut config, None).unwrap();

        let mut outer = SubstitutionNs::new();
        let log = RunLog::new("test");
        recipe.run(&params, &mut config, &mut outer, &log).unwrap();
    }

    const ALIAS_CONFIG: &str = r#"
opts:
  backend:
    select: [native]
cabs:
  consumer:
    command: /bin/echo
    inputs:
      msname:
        dtype: str
        policies:
          positional: true
lib:
  recipes:
    two_steps:
      name: two_steps
      inputs:
        msname:
          dtype: str
          aliases: [a.msname, b.msname]
      steps:
        a:
          cab: consumer
        b:
          cab: consumer
"#;

    #[test]
    fn alias_value_propagates_down_to_steps() {
        let mut config = make_config(ALIAS_CONFIG);
        let mut recipe = make_recipe(&config, "two_steps");
        let mut params = IndexMap::new();
        params.insert("msname".to_string(), PValue::Str("foo.ms".into()));
        recipe.prevalidate(&params, &mut config, None).unwrap();
        assert_eq!(recipe.steps["a"].params["msname"], PValue::Str("foo.ms".into()));
        assert_eq!(recipe.steps["b"].params["msname"], PValue::Str("foo.ms".into()));
    }

    #[test]
    fn step_value_propagates_up_and_across() {
        // the first step sets a value; with the recipe unset, it becomes the
        // recipe default and reaches the sibling step
        let config_yaml = ALIAS_CONFIG.replace(
            "        a:\n          cab: consumer\n",
            "        a:\n          cab: consumer\n          params:\n            msname: bar.ms\n",
        );
        let mut config = make_config(&config_yaml);
        let mut recipe = make_recipe(&config, "two_steps");
        let params = recipe.prevalidate(&IndexMap::new(), &mut config, None).unwrap();
        assert_eq!(params["msname"], PValue::Str("bar.ms".into()));
        assert_eq!(recipe.steps["b"].params["msname"], PValue::Str("bar.ms".into()));
    }

    #[test]
    fn auto_aliases_are_created_for_unset_step_params() {
        let config_yaml = r#"
cabs:
  consumer:
    command: /bin/echo
    inputs:
      msname:
        dtype: str
        required: true
lib:
  recipes:
    bare:
      name: bare
      steps:
        a:
          cab: consumer
"#;
        let config = make_config(config_yaml);
        let recipe = make_recipe(&config, "bare");
        let schema = recipe.cargo.inputs.get("a.msname").expect("auto-alias created");
        assert_eq!(schema.get_category(), ParameterCategory::Required);
        assert!(schema.is_required());
    }

    const SKIP_CONFIG: &str = r#"
opts:
  backend:
    select: [native]
cabs:
  needy:
    command: /bin/echo
    inputs:
      inp:
        dtype: str
        required: true
        policies:
          positional: true
lib:
  recipes:
    maybe_skip:
      name: maybe_skip
      inputs:
        a: str
      steps:
        s1:
          cab: needy
          skip: "={recipe.a} == 'skip'"
          params:
            inp: "{recipe.nothing}"
"#;

    #[test]
    fn unresolved_input_is_warning_when_skipped_error_when_not() {
        let mut config = make_config(SKIP_CONFIG);

        // with a=skip, the unresolved input degrades to a warning
        let mut recipe = make_recipe(&config, "maybe_skip");
        let mut params = IndexMap::new();
        params.insert("a".to_string(), PValue::Str("skip".into()));
        recipe.prevalidate(&params, &mut config, None).unwrap();
        let mut outer = SubstitutionNs::new();
        let log = RunLog::new("test");
        recipe.run(&params, &mut config, &mut outer, &log).unwrap();

        // with a=run, it is a hard validation error
        let mut recipe = make_recipe(&config, "maybe_skip");
        let mut params = IndexMap::new();
        params.insert("a".to_string(), PValue::Str("run".into()));
        recipe.prevalidate(&params, &mut config, None).unwrap();
        let mut outer = SubstitutionNs::new();
        let err = recipe.run(&params, &mut config, &mut outer, &log).unwrap_err();
        assert!(err.to_string().contains("s1"), "{err}");
    }

    const SELECT_CONFIG: &str = r#"
cabs:
  echo:
    command: /bin/echo
    inputs:
      message: str=hi
lib:
  recipes:
    pipeline:
      name: pipeline
      steps:
        a:
          cab: echo
          tags: [prep]
        b:
          cab: echo
          tags: [cal]
        c:
          cab: echo
          skip: true
          tags: [cal, never]
        d:
          cab: echo
          tags: [always]
"#;

    fn scheduled(recipe: &Recipe) -> Vec<String> {
        recipe
            .steps
            .iter()
            .filter(|(_, step)| step.skip_static != Some(true))
            .map(|(label, _)| label.clone())
            .collect()
    }

    #[test]
    fn tag_selection_with_always_and_never() {
        let config = make_config(SELECT_CONFIG);
        let mut recipe = make_recipe(&config, "pipeline");
        recipe
            .restrict_steps(&["prep".to_string()], &[], &[], &[], &[])
            .unwrap();
        // prep selects a; d is always; b deselected; c stays never/skipped
        assert_eq!(scheduled(&recipe), vec!["a", "d"]);
    }

    #[test]
    fn step_ranges_and_cherry_picking() {
        let config = make_config(SELECT_CONFIG);
        let mut recipe = make_recipe(&config, "pipeline");
        recipe
            .restrict_steps(&[], &[], &["a:b".to_string()], &[], &[])
            .unwrap();
        assert_eq!(scheduled(&recipe), vec!["a", "b", "d"]);

        // cherry-picking a normally-skipped step force-enables it
        let mut recipe = make_recipe(&config, "pipeline");
        recipe
            .restrict_steps(&[], &[], &["c".to_string()], &[], &[])
            .unwrap();
        assert!(scheduled(&recipe).contains(&"c".to_string()));
    }

    #[test]
    fn skip_ranges_remove_steps_monotonically() {
        let config = make_config(SELECT_CONFIG);
        let mut recipe = make_recipe(&config, "pipeline");
        recipe
            .restrict_steps(&[], &[], &[], &["b".to_string()], &[])
            .unwrap();
        let without_b = scheduled(&recipe);
        assert!(!without_b.contains(&"b".to_string()));

        // adding another skip can only shrink the run set
        let mut recipe = make_recipe(&config, "pipeline");
        recipe
            .restrict_steps(
                &[],
                &[],
                &[],
                &["b".to_string(), "a".to_string()],
                &[],
            )
            .unwrap();
        let without_ab = scheduled(&recipe);
        assert!(without_ab.len() < without_b.len());
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let config = make_config(SELECT_CONFIG);
        let mut recipe = make_recipe(&config, "pipeline");
        let err = recipe
            .restrict_steps(&["bogus".to_string()], &[], &[], &[], &[])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepSelection);
    }

    #[test]
    fn assign_based_on_selects_case() {
        let config_yaml = r#"
cabs:
  echo:
    command: /bin/echo
    inputs:
      message: str=hi
lib:
  recipes:
    banded:
      name: banded
      inputs:
        band: str=L
      assign_based_on:
        band:
          L:
            nchan: 4096
          UHF:
            nchan: 2048
          DEFAULT:
            nchan: 1024
      steps:
        say:
          cab: echo
"#;
        let mut config = make_config(config_yaml);
        let mut recipe = make_recipe(&config, "banded");
        let mut params = IndexMap::new();
        params.insert("band".to_string(), PValue::Str("UHF".into()));
        let mut subst = recipe.build_subst(&params, &config, None);
        recipe.update_assignments(&mut subst, &mut config, None, true).unwrap();
        match subst.get_ns("recipe").unwrap().entry("nchan") {
            Some(NsEntry::Value(PValue::Int(2048))) => {}
            other => panic!("unexpected {other:?}"),
        }

        // unknown case falls back to DEFAULT
        let mut params = IndexMap::new();
        params.insert("band".to_string(), PValue::Str("S".into()));
        let mut subst = recipe.build_subst(&params, &config, None);
        recipe.update_assignments(&mut subst, &mut config, None, true).unwrap();
        match subst.get_ns("recipe").unwrap().entry("nchan") {
            Some(NsEntry::Value(PValue::Int(1024))) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn assign_to_config_updates_tree() {
        let config_yaml = r#"
vars: {}
cabs:
  echo:
    command: /bin/echo
lib:
  recipes:
    writer:
      name: writer
      assign:
        config.vars.marker: 42
      steps:
        say:
          cab: echo
"#;
        let mut config = make_config(config_yaml);
        let mut recipe = make_recipe(&config, "writer");
        let mut subst = recipe.build_subst(&IndexMap::new(), &config, None);
        recipe.update_assignments(&mut subst, &mut config, None, true).unwrap();
        assert_eq!(config.tree["vars"]["marker"], YamlValue::from(42));
    }

    #[test]
    fn cyclic_recipe_reference_is_detected() {
        let config_yaml = r#"
lib:
  recipes:
    outer_loop:
      name: outer_loop
      steps:
        inner:
          recipe: inner_loop
    inner_loop:
      name: inner_loop
      steps:
        outer:
          recipe: outer_loop
"#;
        let config = make_config(config_yaml);
        let definition = config.get_recipe("outer_loop").unwrap().clone();
        let mut recipe = Recipe::from_yaml(&definition, "outer_loop").unwrap();
        let mut stack = vec!["outer_loop".to_string()];
        let err = recipe
            .finalize(&config, RunLog::new("outer_loop"), "outer_loop", 0, &mut stack)
            .unwrap_err();
        assert!(err.to_string().contains("cyclic"), "{err}");
    }

    #[test]
    fn loop_over_input_becomes_required() {
        let config_yaml = r#"
cabs:
  echo:
    command: /bin/echo
lib:
  recipes:
    looper:
      name: looper
      inputs:
        items: List[str]
      for_loop:
        var: x
        over: items
      steps:
        say:
          cab: echo
"#;
        let config = make_config(config_yaml);
        let recipe = make_recipe(&config, "looper");
        assert!(recipe.cargo.inputs["items"].is_required());
    }
}
