use indexmap::IndexMap;
use regex::Regex;
use serde_yaml::Value as YamlValue;
use std::path::{Path, PathBuf};

use crate::basetypes::{PValue, expanduser, yaml_key_to_string};
use crate::cargo::Cargo;
use crate::errors::{ErrorKind, Result, StimelaError, cab_runtime_error, schema_error};
use crate::runlog::Severity;
use crate::schema::{DType, Parameter, ParameterPolicies};
use crate::substitutions::{SubstContext, SubstitutionNs};
use crate::wranglers::{self, Wrangler};

/// Sentinel prefix under which cabs yield structured outputs on stdout.
pub const CAB_OUTPUT_PREFIX: &str = "### YIELDING CAB OUTPUT ## ";

/// How parameters are passed to the underlying tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterPassing {
    #[default]
    Args,
    Yaml,
}

/// Execution model of a cab.
#[derive(Debug, Clone, PartialEq)]
pub enum Flavour {
    /// command is a binary resolved against the venv/PATH
    Binary,
    /// command is a pkg.module.function path invoked via the interpreter
    Python,
    /// command is inline python source; params arrive as JSON in argv[1]
    PythonCode {
        input_dict: Option<String>,
        input_vars: bool,
        output_vars: bool,
        subst: bool,
    },
    /// command is a CASA task name
    CasaTask,
}

impl Flavour {
    pub fn kind(&self) -> &'static str {
        match self {
            Flavour::Binary => "binary",
            Flavour::Python => "python",
            Flavour::PythonCode { .. } => "python-code",
            Flavour::CasaTask => "casa-task",
        }
    }
}

/// Cab management block: environment, cleanup globs, output wranglers.
#[derive(Debug, Clone, Default)]
pub struct CabManagement {
    pub environment: IndexMap<String, String>,
    pub cleanup: IndexMap<String, Vec<String>>,
    pub wranglers: IndexMap<String, Vec<String>>,
}

/// Runtime status of one in-flight cab invocation. Wranglers write to it as
/// output lines stream through; the backend driver checks it after the
/// process exits.
#[derive(Debug, Default)]
pub struct RuntimeStatus {
    wranglers: Vec<Wrangler>,
    success: Option<bool>,
    errors: Vec<StimelaError>,
    warnings: Vec<String>,
    outputs: IndexMap<String, PValue>,
}

impl RuntimeStatus {
    pub fn new(wranglers: Vec<Wrangler>) -> Self {
        RuntimeStatus { wranglers, ..RuntimeStatus::default() }
    }

    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn errors(&self) -> &[StimelaError] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn outputs(&self) -> &IndexMap<String, PValue> {
        &self.outputs
    }

    pub fn take_errors(&mut self) -> Vec<StimelaError> {
        std::mem::take(&mut self.errors)
    }

    /// First declared failure wins: success cannot be declared after a
    /// failure.
    pub fn declare_success(&mut self) {
        if self.success.is_none() {
            self.success = Some(true);
        }
    }

    pub fn declare_failure(&mut self, error: StimelaError) {
        self.success = Some(false);
        self.errors.push(error);
    }

    pub fn declare_warning(&mut self, message: String) {
        self.warnings.push(message);
    }

    pub fn declare_output(&mut self, name: String, value: PValue) {
        self.outputs.insert(name, value);
    }

    /// Runs a line of output through the wrangler chain, in declaration
    /// order. Returns the possibly-modified line (None if suppressed) and
    /// the escalated severity.
    pub fn apply_wranglers_to_line(
        &mut self,
        line: &str,
        severity: Severity,
    ) -> (Option<String>, Severity) {
        let wranglers = std::mem::take(&mut self.wranglers);
        let result = self.apply_wranglers(&wranglers, line, severity);
        self.wranglers = wranglers;
        result
    }

    /// Same, against an explicit wrangler list.
    pub fn apply_wranglers(
        &mut self,
        wranglers: &[Wrangler],
        line: &str,
        severity: Severity,
    ) -> (Option<String>, Severity) {
        let mut output = line.to_string();
        let mut severity = severity;
        let mut suppress = false;
        for wrangler in wranglers {
            let snapshot = output.clone();
            let Some(caps) = wrangler.regex.captures(&snapshot) else {
                continue;
            };
            for action in &wrangler.actions {
                let current = output.clone();
                let (mod_output, mod_severity) =
                    action.apply(self, &wrangler.regex, &current, &caps);
                match mod_output {
                    None => suppress = true,
                    Some(new_output) => output = new_output,
                }
                if let Some(new_severity) = mod_severity {
                    severity = severity.max(new_severity);
                }
            }
        }
        if suppress {
            (None, severity)
        } else {
            (Some(output), severity)
        }
    }
}

/// An atomic task definition: a command (binary or callable) plus typed
/// parameters and the policies for rendering them into an invocation.
#[derive(Debug, Clone)]
pub struct Cab {
    pub cargo: Cargo,
    pub image: Option<String>,
    pub command: String,
    pub virtual_env: Option<String>,
    pub flavour: Flavour,
    pub parameter_passing: ParameterPassing,
    pub management: CabManagement,
    pub policies: ParameterPolicies,
    /// None to ignore callable return values, "{}" to treat them as a dict
    /// of outputs, else the name of a single output
    pub return_outputs: Option<String>,
    pub wranglers: Vec<Wrangler>,
}

static LEGACY_PYTHON_RE: once_cell::sync::Lazy<Regex> =
    once_cell::sync::Lazy::new(|| Regex::new(r"^\((.+)\)(.+)$").unwrap());

fn parse_flavour(value: &YamlValue, label: &str) -> Result<Flavour> {
    match value {
        YamlValue::String(kind) => match kind.to_ascii_lowercase().as_str() {
            "binary" => Ok(Flavour::Binary),
            "python" => Ok(Flavour::Python),
            "python-code" => Ok(Flavour::PythonCode {
                input_dict: None,
                input_vars: true,
                output_vars: true,
                subst: false,
            }),
            "casa-task" => Ok(Flavour::CasaTask),
            other => Err(schema_error(format!("{label}: unknown cab flavour '{other}'"))),
        },
        YamlValue::Mapping(map) => {
            let kind = map
                .get(YamlValue::String("kind".to_string()))
                .map(yaml_key_to_string)
                .ok_or_else(|| schema_error(format!("{label}: flavour.kind not specified")))?;
            match kind.as_str() {
                "binary" => Ok(Flavour::Binary),
                "python" => Ok(Flavour::Python),
                "casa-task" => Ok(Flavour::CasaTask),
                "python-code" => {
                    let get_bool = |key: &str, default: bool| {
                        map.get(YamlValue::String(key.to_string()))
                            .and_then(|v| v.as_bool())
                            .unwrap_or(default)
                    };
                    Ok(Flavour::PythonCode {
                        input_dict: map
                            .get(YamlValue::String("input_dict".to_string()))
                            .filter(|v| !matches!(v, YamlValue::Null))
                            .map(yaml_key_to_string),
                        input_vars: get_bool("input_vars", true),
                        output_vars: get_bool("output_vars", true),
                        subst: get_bool("subst", false),
                    })
                }
                other => Err(schema_error(format!("{label}: unknown flavour.kind '{other}'"))),
            }
        }
        other => Err(schema_error(format!(
            "{label}: flavour must be a string or a mapping, got {other:?}"
        ))),
    }
}

fn parse_management(value: &YamlValue, label: &str) -> Result<CabManagement> {
    let mut management = CabManagement::default();
    let YamlValue::Mapping(map) = value else {
        return Ok(management);
    };
    for (key, val) in map {
        match yaml_key_to_string(key).as_str() {
            "environment" => {
                if let YamlValue::Mapping(m) = val {
                    for (k, v) in m {
                        management
                            .environment
                            .insert(yaml_key_to_string(k), yaml_key_to_string(v));
                    }
                }
            }
            "cleanup" => {
                if let YamlValue::Mapping(m) = val {
                    for (k, v) in m {
                        management
                            .cleanup
                            .insert(yaml_key_to_string(k), string_or_list(v));
                    }
                }
            }
            "wranglers" => {
                if let YamlValue::Mapping(m) = val {
                    for (k, v) in m {
                        management
                            .wranglers
                            .insert(yaml_key_to_string(k), string_or_list(v));
                    }
                }
            }
            other => {
                return Err(schema_error(format!("{label}: unknown management field '{other}'")));
            }
        }
    }
    Ok(management)
}

fn string_or_list(value: &YamlValue) -> Vec<String> {
    match value {
        YamlValue::String(s) => vec![s.clone()],
        YamlValue::Sequence(seq) => seq.iter().map(yaml_key_to_string).collect(),
        _ => Vec::new(),
    }
}

impl Cab {
    /// Builds a cab from its definition mapping.
    pub fn from_yaml(value: &YamlValue, label: &str) -> Result<Cab> {
        let YamlValue::Mapping(map) = value else {
            return Err(schema_error(format!("{label}: cab definition must be a mapping")));
        };
        let mut cargo = Cargo::from_mapping(map, label)?;

        let mut image = None;
        let mut command = None;
        let mut virtual_env = None;
        let mut flavour_value = None;
        let mut parameter_passing = ParameterPassing::Args;
        let mut management = CabManagement::default();
        let mut policies = ParameterPolicies::default();
        let mut return_outputs = Some("{}".to_string());

        for (key, val) in map {
            match yaml_key_to_string(key).as_str() {
                "image" => {
                    if !matches!(val, YamlValue::Null) {
                        image = Some(yaml_key_to_string(val));
                    }
                }
                "command" => command = Some(yaml_key_to_string(val)),
                "virtual_env" => {
                    if !matches!(val, YamlValue::Null) {
                        virtual_env = Some(yaml_key_to_string(val));
                    }
                }
                "flavour" => flavour_value = Some(val.clone()),
                "parameter_passing" => {
                    parameter_passing = match yaml_key_to_string(val).as_str() {
                        "args" => ParameterPassing::Args,
                        "yaml" => ParameterPassing::Yaml,
                        other => {
                            return Err(schema_error(format!(
                                "{label}: unknown parameter_passing mode '{other}'"
                            )));
                        }
                    }
                }
                "management" => management = parse_management(val, label)?,
                "policies" => {
                    policies = crate::schema::parse_cab_policies(val, label)?;
                }
                "return_outputs" => {
                    return_outputs = match val {
                        YamlValue::Null => None,
                        other => Some(yaml_key_to_string(other)),
                    };
                }
                _ => {}
            }
        }

        let mut command = command
            .ok_or_else(|| schema_error(format!("{label}: cab must define a command")))?;

        // legacy "(module)function" command form implies python flavour
        let mut flavour = match flavour_value {
            Some(value) => parse_flavour(&value, label)?,
            None => Flavour::Binary,
        };
        let legacy = LEGACY_PYTHON_RE
            .captures(&command)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()));
        if let Some((module, func)) = legacy {
            if !matches!(flavour, Flavour::Binary | Flavour::Python) {
                return Err(schema_error(format!(
                    "{label}: '(module)function' implies python flavour, but '{}' is specified",
                    flavour.kind()
                )));
            }
            command = format!("{module}.{func}");
            flavour = Flavour::Python;
        }
        if matches!(flavour, Flavour::Python) && !command.contains('.') {
            return Err(schema_error(format!(
                "{label}: 'python' flavour requires a command of the form module.function"
            )));
        }

        if cargo.name.is_empty() {
            cargo.name = image.clone().unwrap_or_else(|| {
                command.split_whitespace().next().unwrap_or_default().to_string()
            });
        }

        if matches!(flavour, Flavour::Python) {
            if let Some(selector) = &return_outputs {
                if selector != "{}" && !cargo.outputs.contains_key(selector) {
                    return Err(schema_error(format!(
                        "{label}: return_outputs setting '{selector}' is not an output"
                    )));
                }
            }
        }

        let mut compiled = Vec::new();
        for (pattern, specs) in &management.wranglers {
            compiled.push(wranglers::create_list(pattern, specs)?);
        }

        let mut cab = Cab {
            cargo,
            image,
            command,
            virtual_env,
            flavour,
            parameter_passing,
            management,
            policies,
            return_outputs,
            wranglers: compiled,
        };
        cab.attach_flavour_wranglers()?;
        Ok(cab)
    }

    /// Python-family flavours capture the output sentinel line back into
    /// outputs (and suppress it from the log).
    fn attach_flavour_wranglers(&mut self) -> Result<()> {
        let pattern = format!("^{}(.*)$", regex::escape(CAB_OUTPUT_PREFIX));
        match &self.flavour {
            Flavour::Python => {
                if let Some(selector) = self.return_outputs.clone() {
                    let spec = if selector == "{}" {
                        "PARSE_JSON_OUTPUT_DICT".to_string()
                    } else {
                        format!("PARSE_OUTPUT:{selector}:1:json")
                    };
                    self.wranglers
                        .push(wranglers::create_list(&pattern, &[spec, "SUPPRESS".to_string()])?);
                }
            }
            Flavour::PythonCode { .. } | Flavour::CasaTask => {
                self.wranglers.push(wranglers::create_list(
                    &pattern,
                    &["PARSE_JSON_OUTPUT_DICT".to_string(), "SUPPRESS".to_string()],
                )?);
            }
            Flavour::Binary => {}
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.cargo.name
    }

    /// First whitespace-delimited token of the command (for display).
    pub fn command_name(&self) -> &str {
        self.command.split_whitespace().next().unwrap_or(&self.command)
    }

    pub fn reset_status(&self, extra_wranglers: Vec<Wrangler>) -> RuntimeStatus {
        let mut all = self.wranglers.clone();
        all.extend(extra_wranglers);
        RuntimeStatus::new(all)
    }

    /// Resolves a policy setting: the schema's own setting wins, then the
    /// cab-wide policy block.
    fn policy<T, F>(&self, schema: &Parameter, get: F) -> Option<T>
    where
        F: Fn(&ParameterPolicies) -> Option<T>,
    {
        get(&schema.policies).or_else(|| get(&self.policies))
    }

    /// Builds the full command line for a binary-flavour invocation:
    /// (argv, venv).
    pub fn build_command_line(
        &self,
        params: &IndexMap<String, PValue>,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        check_executable: bool,
    ) -> Result<(Vec<String>, Option<String>)> {
        let command = self.substitute_command(ns, ctx)?;
        let venv = self.resolve_virtual_env(ns, ctx)?;

        let mut tokens = command.split_whitespace().map(String::from);
        let mut executable = expanduser(&tokens.next().unwrap_or_default());
        let leading_args: Vec<String> = tokens.collect();

        if check_executable {
            if !executable.contains('/') {
                let extra: Vec<PathBuf> = venv
                    .as_ref()
                    .map(|v| vec![Path::new(v).join("bin")])
                    .unwrap_or_default();
                executable = which(&executable, &extra).ok_or_else(|| {
                    cab_runtime_error(format!("{executable}: not found"))
                })?;
            } else if !is_executable_file(Path::new(&executable)) {
                return Err(cab_runtime_error(format!(
                    "{executable} doesn't exist or is not executable"
                )));
            }
        }

        let mut args = vec![executable];
        args.extend(leading_args);
        args.extend(self.build_argument_list(params)?);
        Ok((args, venv))
    }

    fn substitute_command(&self, ns: &SubstitutionNs, ctx: &SubstContext) -> Result<String> {
        let value = ctx
            .evaluate(ns, &PValue::Str(self.command.clone()), &["command".to_string()])
            .map_err(|exc| exc.wrap(ErrorKind::CabRuntime, "error constructing cab command"))?;
        Ok(value.to_string())
    }

    pub fn resolve_virtual_env(
        &self,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
    ) -> Result<Option<String>> {
        let Some(venv) = &self.virtual_env else {
            return Ok(None);
        };
        let venv = ctx
            .evaluate(ns, &PValue::Str(venv.clone()), &["virtual_env".to_string()])
            .map_err(|exc| exc.wrap(ErrorKind::CabRuntime, "error resolving virtual_env"))?
            .to_string();
        if venv.is_empty() {
            return Ok(None);
        }
        let venv = expanduser(&venv);
        if !Path::new(&venv).join("bin/activate").is_file() {
            return Err(cab_runtime_error(format!("virtual environment {venv} doesn't exist")));
        }
        Ok(Some(venv))
    }

    /// Renders validated parameters into command-line arguments according to
    /// each parameter's policies.
    pub fn build_argument_list(&self, params: &IndexMap<String, PValue>) -> Result<Vec<String>> {
        if self.parameter_passing == ParameterPassing::Yaml {
            let mut map = serde_yaml::Mapping::new();
            for (name, value) in params {
                if !value.is_marker() {
                    map.insert(YamlValue::String(name.clone()), value.to_yaml());
                }
            }
            let doc = serde_yaml::to_string(&YamlValue::Mapping(map))
                .map_err(|exc| cab_runtime_error(format!("error encoding yaml parameters: {exc}")))?;
            return Ok(vec![doc]);
        }

        let mut value_dict: IndexMap<String, PValue> = params
            .iter()
            .filter(|(_, value)| !value.is_marker())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let schemas = self.cargo.inputs_outputs();

        let mut pos_head: Vec<String> = Vec::new();
        let mut pos_tail: Vec<String> = Vec::new();

        // positional parameters go by schema order
        for (name, schema) in &schemas {
            if schema.is_required() && !value_dict.contains_key(name) {
                return Err(cab_runtime_error(format!("required parameter '{name}' is missing")));
            }
            let Some(value) = value_dict.get(name) else { continue };
            let positional_head = self.policy(schema, |p| p.positional_head).unwrap_or(false);
            let positional =
                self.policy(schema, |p| p.positional).unwrap_or(false) || positional_head;
            if !positional {
                continue;
            }
            let skip = self.policy(schema, |p| p.skip).unwrap_or(false)
                || (schema.implicit.is_some()
                    && self.policy(schema, |p| p.skip_implicits).unwrap_or(true));
            if !skip {
                if let Some(rendered) =
                    self.stringify_argument(name, value, schema, None, &value_dict)?
                {
                    let target = if positional_head { &mut pos_head } else { &mut pos_tail };
                    target.extend(rendered);
                }
            }
            value_dict.shift_remove(name);
        }

        let mut args: Vec<String> = Vec::new();

        for (name, value) in &value_dict {
            let Some(schema) = schemas.get(name) else {
                return Err(cab_runtime_error(format!("unknown parameter '{name}'")));
            };
            let skip_implicits = self.policy(schema, |p| p.skip_implicits).unwrap_or(true);
            if self.policy(schema, |p| p.skip).unwrap_or(false)
                || (schema.implicit.is_some() && skip_implicits)
            {
                continue;
            }

            let key_value = self.policy(schema, |p| p.key_value).unwrap_or(false);

            let mut option_name = schema.nom_de_guerre.clone().unwrap_or_else(|| name.clone());
            if let Some(replacements) = self.policy(schema, |p| p.replace.clone()) {
                for (from, to) in &replacements {
                    option_name = option_name.replace(from.as_str(), to.as_str());
                }
            }
            let prefix = self.policy(schema, |p| p.prefix.clone()).unwrap_or_else(|| "--".to_string());
            let option = format!("{prefix}{option_name}");

            if schema.dtype == DType::Bool && !key_value {
                let truthy = value.truthy();
                let explicit = if truthy {
                    self.policy(schema, |p| p.explicit_true.clone())
                } else {
                    self.policy(schema, |p| p.explicit_false.clone())
                };
                match explicit {
                    Some(token) => {
                        args.push(option);
                        args.push(token);
                    }
                    None => {
                        if truthy {
                            args.push(option);
                        }
                    }
                }
                continue;
            }

            if let Some(rendered) =
                self.stringify_argument(name, value, schema, Some(&option), &value_dict)?
            {
                args.extend(rendered);
            }
        }

        let mut out = pos_head;
        out.extend(args);
        out.extend(pos_tail);
        Ok(out)
    }

    /// Converts one parameter value into its argument token(s), applying
    /// key_value, split, format and repeat policies. Returns None when the
    /// value renders to nothing (e.g. a false flag).
    fn stringify_argument(
        &self,
        name: &str,
        value: &PValue,
        schema: &Parameter,
        option: Option<&str>,
        value_dict: &IndexMap<String, PValue>,
    ) -> Result<Option<Vec<String>>> {
        if self.policy(schema, |p| p.key_value).unwrap_or(false) {
            return Ok(Some(vec![format!("{name}={value}")]));
        }
        if matches!(value, PValue::Null) {
            return Ok(None);
        }
        if schema.dtype == DType::Bool
            && !value.truthy()
            && self.policy(schema, |p| p.explicit_false.clone()).is_none()
        {
            return Ok(None);
        }

        let mut value = value.clone();
        let mut is_list = matches!(value, PValue::List(_));

        if let (PValue::Str(s), Some(sep)) = (&value, self.policy(schema, |p| p.split.clone())) {
            let parts: Vec<PValue> = if sep.is_empty() {
                s.split_whitespace().map(|p| PValue::Str(p.to_string())).collect()
            } else {
                s.split(sep.as_str()).map(|p| PValue::Str(p.to_string())).collect()
            };
            value = PValue::List(parts);
            is_list = true;
        }

        let format_policy = self.policy(schema, |p| p.format.clone());
        let format_list_policy = self.policy(schema, |p| p.format_list.clone());
        let format_scalar_policy = self.policy(schema, |p| p.format_list_scalar.clone());

        let rendered: Vec<String>;
        if is_list {
            let PValue::List(items) = &value else { unreachable!() };
            let item_strings: Vec<String> = items.iter().map(|v| v.to_string()).collect();
            if let Some(formats) = format_list_policy {
                if formats.len() != items.len() {
                    return Err(cab_runtime_error(format!(
                        "length of format_list does not match length of '{name}'"
                    )));
                }
                rendered = formats
                    .iter()
                    .map(|fmt| format_args(fmt, &item_strings, value_dict))
                    .collect();
            } else if let Some(fmt) = format_policy {
                rendered = item_strings
                    .iter()
                    .map(|item| format_args(&fmt, std::slice::from_ref(item), value_dict))
                    .collect();
            } else {
                rendered = item_strings;
            }
        } else if let Some(formats) = format_scalar_policy {
            let scalar = value.to_string();
            rendered = formats
                .iter()
                .map(|fmt| format_args(fmt, std::slice::from_ref(&scalar), value_dict))
                .collect();
            is_list = true;
        } else if let Some(fmt) = format_policy {
            let scalar = value.to_string();
            rendered = vec![format_args(&fmt, std::slice::from_ref(&scalar), value_dict)];
        } else {
            rendered = vec![value.to_string()];
        }

        if is_list {
            let repeat = self.policy(schema, |p| p.repeat.clone());
            let out = match repeat.as_deref() {
                Some("list") => {
                    let mut out = Vec::new();
                    if let Some(option) = option {
                        out.push(option.to_string());
                    }
                    out.extend(rendered);
                    out
                }
                Some("[]") => {
                    let joined = format!("[{}]", rendered.join(","));
                    let mut out = Vec::new();
                    if let Some(option) = option {
                        out.push(option.to_string());
                    }
                    out.push(joined);
                    out
                }
                Some("repeat") => {
                    let mut out = Vec::new();
                    for item in rendered {
                        if let Some(option) = option {
                            out.push(option.to_string());
                        }
                        out.push(item);
                    }
                    out
                }
                Some(sep) => {
                    let mut out = Vec::new();
                    if let Some(option) = option {
                        out.push(option.to_string());
                    }
                    out.push(rendered.join(sep));
                    out
                }
                None => {
                    return Err(cab_runtime_error(format!(
                        "list-type parameter '{name}' does not have a repeat policy set"
                    )));
                }
            };
            Ok(Some(out))
        } else {
            let mut out = Vec::new();
            if let Some(option) = option {
                out.push(option.to_string());
            }
            out.extend(rendered);
            Ok(Some(out))
        }
    }

    /// Arguments to run this cab, per its flavour: (argv, loggable argv).
    pub fn get_arguments(
        &self,
        params: &IndexMap<String, PValue>,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        check_executable: bool,
    ) -> Result<(Vec<String>, Vec<String>)> {
        match &self.flavour {
            Flavour::Binary => {
                let (args, venv) = self.build_command_line(params, ns, ctx, check_executable)?;
                if let Some(venv) = venv {
                    let joined: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
                    let script = format!(". {venv}/bin/activate && {}", joined.join(" "));
                    let wrapped = vec!["/bin/bash".to_string(), "-c".to_string(), script];
                    Ok((wrapped.clone(), wrapped))
                } else {
                    Ok((args.clone(), args))
                }
            }
            Flavour::Python => {
                let code = self.form_python_callable_code(params, ns, ctx)?;
                let mut args = self.python_interpreter(ns, ctx)?;
                args.push("-c".to_string());
                let logged = args.iter().cloned().chain(["...".to_string()]).collect();
                args.push(code);
                Ok((args, logged))
            }
            Flavour::PythonCode { input_dict, input_vars, output_vars, subst } => {
                let command = if *subst {
                    self.substitute_command(ns, ctx)?
                } else {
                    self.command.clone()
                };
                let code = self.form_python_code_driver(
                    &command,
                    params,
                    input_dict.as_deref(),
                    *input_vars,
                    *output_vars,
                );
                let params_json = self.params_json(params);
                let mut args = self.python_interpreter(ns, ctx)?;
                args.push("-c".to_string());
                let logged = args.iter().cloned().chain(["...".to_string()]).collect();
                args.push(code);
                args.push(params_json);
                Ok((args, logged))
            }
            Flavour::CasaTask => {
                let command = self.substitute_command(ns, ctx)?;
                let task = command.split_whitespace().next().unwrap_or(&command).to_string();
                // the task call is built from a structured JSON argument
                // dump, never by pasting values into code
                let code = format!(
                    "import sys, json\n\
                     _args = json.loads(sys.argv[-1])\n\
                     from casatasks import {task}\n\
                     {task}(**_args)\n"
                );
                let params_json = self.params_json(params);
                let mut args = vec![
                    "casa".to_string(),
                    "--nologger".to_string(),
                    "--log2term".to_string(),
                    "-c".to_string(),
                ];
                let logged: Vec<String> =
                    args.iter().cloned().chain(["...".to_string()]).collect();
                args.push(code);
                args.push(params_json);
                Ok((args, logged))
            }
        }
    }

    fn python_interpreter(&self, ns: &SubstitutionNs, ctx: &SubstContext) -> Result<Vec<String>> {
        match self.resolve_virtual_env(ns, ctx)? {
            Some(venv) => {
                let interpreter = format!("{venv}/bin/python");
                if !Path::new(&interpreter).is_file() {
                    return Err(cab_runtime_error(format!(
                        "virtual environment {venv} doesn't exist"
                    )));
                }
                Ok(vec![interpreter])
            }
            None => Ok(vec!["python".to_string()]),
        }
    }

    /// Parameters that are actually passed into a callable: inputs and named
    /// outputs, minus skipped ones.
    fn passed_params(&self, params: &IndexMap<String, PValue>) -> IndexMap<String, PValue> {
        let schemas = self.cargo.inputs_outputs();
        params
            .iter()
            .filter(|(name, value)| {
                if value.is_marker() {
                    return false;
                }
                match schemas.get(*name) {
                    Some(schema) => {
                        !self.policy(schema, |p| p.skip).unwrap_or(false)
                            && (schema.is_input || schema.is_named_output())
                    }
                    None => false,
                }
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn params_json(&self, params: &IndexMap<String, PValue>) -> String {
        let passed = self.passed_params(params);
        let mut map = serde_json::Map::new();
        for (name, value) in &passed {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map).to_string()
    }

    /// Renders the python driver source for a callable-flavour cab.
    fn form_python_callable_code(
        &self,
        params: &IndexMap<String, PValue>,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
    ) -> Result<String> {
        let command = self.substitute_command(ns, ctx)?;
        let Some((py_module, py_function)) = command.rsplit_once('.') else {
            return Err(schema_error(format!(
                "cab {}: python flavour requires a command of the form module.function",
                self.name()
            )));
        };

        let mut call_args = Vec::new();
        let schemas = self.cargo.inputs_outputs();
        for (name, schema) in &schemas {
            if self.policy(schema, |p| p.skip).unwrap_or(false)
                || !(schema.is_input || schema.is_named_output())
            {
                continue;
            }
            if let Some(value) = params.get(name).filter(|v| !v.is_marker()) {
                call_args.push(format!("{}={}", sanitize_var_name(name), py_repr(value)));
            } else if self.policy(schema, |p| p.pass_missing_as_none).unwrap_or(false) {
                call_args.push(format!("{}=None", sanitize_var_name(name)));
            }
        }
        let func_call = format!("{py_function}({})", call_args.join(", "));

        let yield_output = if self.return_outputs.is_some() {
            format!("print(f'{CAB_OUTPUT_PREFIX}{{json.dumps(_result)}}')")
        } else {
            String::new()
        };

        Ok(format!(
            "import sys, json\n\
             sys.path.append('.')\n\
             from {py_module} import {py_function}\n\
             try:\n\
             {i}from click import Command\n\
             except ImportError:\n\
             {i}Command = None\n\
             if Command is not None and isinstance({py_function}, Command):\n\
             {i}print(\"invoking callable {command}() (as click command) using external interpreter\")\n\
             {i}{py_function} = {py_function}.callback\n\
             else:\n\
             {i}print(\"invoking callable {command}() using external interpreter\")\n\
             _result = {func_call}\n\
             {yield_output}\n",
            i = "    "
        ))
    }

    /// Renders the driver for inline python code: parameters arrive as a
    /// JSON document in argv[1], outputs go back via the sentinel line.
    fn form_python_code_driver(
        &self,
        command: &str,
        _params: &IndexMap<String, PValue>,
        input_dict: Option<&str>,
        input_vars: bool,
        output_vars: bool,
    ) -> String {
        let inp_dict = input_dict.unwrap_or("_params");
        let mut pre = format!("import sys, json\n{inp_dict} = json.loads(sys.argv[1])\n");
        if input_vars {
            let schemas = self.cargo.inputs_outputs();
            for (name, schema) in &schemas {
                if schema.is_input || schema.is_named_output() {
                    pre.push_str(&format!(
                        "{} = {inp_dict}.get(\"{name}\")\n",
                        sanitize_var_name(name)
                    ));
                }
            }
        }
        let mut post = String::new();
        if output_vars {
            let yields: Vec<String> = self
                .cargo
                .outputs
                .iter()
                .filter(|(_, schema)| !schema.is_named_output() && schema.implicit.is_none())
                .map(|(name, _)| format!("'{name}': {}", sanitize_var_name(name)))
                .collect();
            if !yields.is_empty() {
                post = format!(
                    "\nprint('{CAB_OUTPUT_PREFIX}' + json.dumps({{{}}}))\n",
                    yields.join(", ")
                );
            }
        }
        format!("{pre}{command}{post}")
    }
}

/// Searches for an executable on PATH (prepended by any extra directories).
pub fn which(name: &str, extra_paths: &[PathBuf]) -> Option<String> {
    let path_var = std::env::var("PATH").unwrap_or_default();
    let dirs = extra_paths
        .iter()
        .cloned()
        .chain(std::env::split_paths(&path_var));
    for dir in dirs {
        let candidate = dir.join(name);
        if is_executable_file(&candidate) {
            return Some(candidate.display().to_string());
        }
    }
    None
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':' | ','))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

fn sanitize_var_name(name: &str) -> String {
    name.replace('-', "_").replace('.', "__")
}

/// Renders a value as a python literal.
fn py_repr(value: &PValue) -> String {
    match value {
        PValue::Null => "None".to_string(),
        PValue::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        PValue::Int(i) => i.to_string(),
        PValue::Float(f) => f.to_string(),
        PValue::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        PValue::List(items) => {
            let rendered: Vec<String> = items.iter().map(py_repr).collect();
            format!("[{}]", rendered.join(", "))
        }
        PValue::Map(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("'{k}': {}", py_repr(v)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
        other => format!("'{other}'"),
    }
}

/// Minimal {}-format over positional values and named parameters, for the
/// format/format_list policies.
fn format_args(fmt: &str, positional: &[String], named: &IndexMap<String, PValue>) -> String {
    let mut out = fmt.to_string();
    for (i, value) in positional.iter().enumerate() {
        out = out.replace(&format!("{{{i}}}"), value);
    }
    for (name, value) in named {
        out = out.replace(&format!("{{{name}}}"), &value.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cab(yaml: &str) -> Cab {
        let value: YamlValue = serde_yaml::from_str(yaml).unwrap();
        Cab::from_yaml(&value, "test").unwrap()
    }

    fn params(pairs: &[(&str, PValue)]) -> IndexMap<String, PValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn simple_cab_command_line() {
        let cab = make_cab(
            r#"
command: simms
inputs:
  msname:
    dtype: MS
    required: true
    policies:
      positional: true
  synthesis: int=1
  dtime: int=1
"#,
        );
        let args = cab
            .build_argument_list(&params(&[
                ("msname", PValue::Str("example.ms".into())),
                ("synthesis", PValue::Int(1)),
                ("dtime", PValue::Int(1)),
            ]))
            .unwrap();
        assert_eq!(
            args,
            vec!["--synthesis", "1", "--dtime", "1", "example.ms"]
        );
    }

    #[test]
    fn repeat_policy_token_counts() {
        let base = r#"
command: tool
inputs:
  xs:
    dtype: List[int]
    policies:
      repeat: "%REPEAT%"
"#;
        let value = PValue::List(vec![PValue::Int(1), PValue::Int(2), PValue::Int(3)]);

        // "list" yields len(value) extra tokens after the option
        let cab = make_cab(&base.replace("%REPEAT%", "list"));
        let args = cab.build_argument_list(&params(&[("xs", value.clone())])).unwrap();
        assert_eq!(args, vec!["--xs", "1", "2", "3"]);

        // "[]" yields exactly one extra token
        let cab = make_cab(&base.replace("%REPEAT%", "[]"));
        let args = cab.build_argument_list(&params(&[("xs", value.clone())])).unwrap();
        assert_eq!(args, vec!["--xs", "[1,2,3]"]);

        // "repeat" yields 2*len(value) tokens
        let cab = make_cab(&base.replace("%REPEAT%", "repeat"));
        let args = cab.build_argument_list(&params(&[("xs", value.clone())])).unwrap();
        assert_eq!(args, vec!["--xs", "1", "--xs", "2", "--xs", "3"]);

        // any other string is a join separator
        let cab = make_cab(&base.replace("%REPEAT%", ","));
        let args = cab.build_argument_list(&params(&[("xs", value)])).unwrap();
        assert_eq!(args, vec!["--xs", "1,2,3"]);
    }

    #[test]
    fn boolean_policies() {
        let cab = make_cab(
            r#"
command: tool
inputs:
  verbose: bool
  force:
    dtype: bool
    policies:
      explicit_true: "1"
      explicit_false: "0"
"#,
        );
        let args = cab
            .build_argument_list(&params(&[
                ("verbose", PValue::Bool(true)),
                ("force", PValue::Bool(false)),
            ]))
            .unwrap();
        assert_eq!(args, vec!["--verbose", "--force", "0"]);

        let args = cab
            .build_argument_list(&params(&[("verbose", PValue::Bool(false))]))
            .unwrap();
        assert!(args.is_empty());
    }

    #[test]
    fn key_value_and_prefix_and_nom_de_guerre() {
        let cab = make_cab(
            r#"
command: tool
inputs:
  mode:
    dtype: str
    policies:
      key_value: true
  column:
    dtype: str
    nom_de_guerre: col
    policies:
      prefix: "-"
"#,
        );
        let args = cab
            .build_argument_list(&params(&[
                ("mode", PValue::Str("fast".into())),
                ("column", PValue::Str("DATA".into())),
            ]))
            .unwrap();
        assert_eq!(args, vec!["mode=fast", "-col", "DATA"]);
    }

    #[test]
    fn replace_policy_rewrites_option_name() {
        let cab = make_cab(
            r#"
command: tool
inputs:
  data-column:
    dtype: str
    policies:
      replace:
        "-": "_"
"#,
        );
        let args = cab
            .build_argument_list(&params(&[("data-column", PValue::Str("DATA".into()))]))
            .unwrap();
        assert_eq!(args, vec!["--data_column", "DATA"]);
    }

    #[test]
    fn skip_and_implicit_policies() {
        let cab = make_cab(
            r#"
command: tool
inputs:
  internal:
    dtype: str
    policies:
      skip: true
outputs:
  table:
    dtype: File
    implicit: out.tab
"#,
        );
        let args = cab
            .build_argument_list(&params(&[
                ("internal", PValue::Str("x".into())),
                ("table", PValue::Str("out.tab".into())),
            ]))
            .unwrap();
        assert!(args.is_empty());
    }

    #[test]
    fn yaml_parameter_passing() {
        let cab = make_cab(
            "command: tool\nparameter_passing: yaml\ninputs:\n  a: int\n  b: str\n",
        );
        let args = cab
            .build_argument_list(&params(&[
                ("a", PValue::Int(1)),
                ("b", PValue::Str("x".into())),
            ]))
            .unwrap();
        assert_eq!(args.len(), 1);
        let doc: YamlValue = serde_yaml::from_str(&args[0]).unwrap();
        assert_eq!(doc["a"], YamlValue::from(1));
        assert_eq!(doc["b"], YamlValue::from("x"));
    }

    #[test]
    fn cab_name_defaults_to_command() {
        let cab = make_cab("command: wsclean -j 4\n");
        assert_eq!(cab.name(), "wsclean");
        assert_eq!(cab.command_name(), "wsclean");
    }

    #[test]
    fn legacy_python_command_form() {
        let cab = make_cab("command: (mypkg.mymod)myfunc\noutputs:\n  result: str\n");
        assert_eq!(cab.flavour.kind(), "python");
        assert_eq!(cab.command, "mypkg.mymod.myfunc");
        // sentinel-capture wrangler attached
        assert!(!cab.wranglers.is_empty());
    }

    #[test]
    fn bad_return_outputs_rejected() {
        let value: YamlValue = serde_yaml::from_str(
            "command: mypkg.func\nflavour: python\nreturn_outputs: nope\n",
        )
        .unwrap();
        assert!(Cab::from_yaml(&value, "test").is_err());
    }

    #[test]
    fn python_code_driver_round_trip() {
        let cab = make_cab(
            "command: \"x = a + 1\"\nflavour: python-code\ninputs:\n  a: int\noutputs:\n  x: int\n",
        );
        let ns = SubstitutionNs::new();
        let ctx = SubstContext::new(true);
        let (args, _) = cab
            .get_arguments(&params(&[("a", PValue::Int(2))]), &ns, &ctx, false)
            .unwrap();
        assert_eq!(args[0], "python");
        assert_eq!(args[1], "-c");
        assert!(args[2].contains("a = _params.get(\"a\")"));
        assert!(args[2].contains("x = a + 1"));
        assert!(args[2].contains(CAB_OUTPUT_PREFIX));
        let parsed: serde_json::Value = serde_json::from_str(&args[3]).unwrap();
        assert_eq!(parsed["a"], serde_json::Value::from(2));
    }

    #[test]
    fn format_policies() {
        let cab = make_cab(
            r#"
command: tool
inputs:
  scale:
    dtype: float
    policies:
      format: "{0}asec"
"#,
        );
        let args = cab
            .build_argument_list(&params(&[("scale", PValue::Float(1.5))]))
            .unwrap();
        assert_eq!(args, vec!["--scale", "1.5asec"]);
    }

    #[test]
    fn split_policy() {
        let cab = make_cab(
            r#"
command: tool
inputs:
  fields:
    dtype: str
    policies:
      split: ","
      repeat: list
"#,
        );
        let args = cab
            .build_argument_list(&params(&[("fields", PValue::Str("a,b,c".into()))]))
            .unwrap();
        assert_eq!(args, vec!["--fields", "a", "b", "c"]);
    }

    #[test]
    fn missing_required_param_fails_build() {
        let cab = make_cab("command: tool\ninputs:\n  x: int*\n");
        assert!(cab.build_argument_list(&IndexMap::new()).is_err());
    }

    #[test]
    fn list_without_repeat_policy_fails() {
        let cab = make_cab("command: tool\ninputs:\n  xs: List[int]\n");
        let err = cab
            .build_argument_list(&params(&[(
                "xs",
                PValue::List(vec![PValue::Int(1)]),
            )]))
            .unwrap_err();
        assert!(err.to_string().contains("repeat policy"));
    }
}
