use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::basetypes::PValue;
use crate::cab::RuntimeStatus;
use crate::errors::{Result, StimelaError, cab_runtime_error, schema_error};
use crate::runlog::Severity;

/// How a PARSE_OUTPUT action addresses a ()-group of its regex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRef {
    Name(String),
    Index(usize),
}

/// Value parser applied by PARSE_OUTPUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDType {
    Str,
    Bool,
    Int,
    Float,
    Complex,
    Json,
    Yaml,
}

impl OutputDType {
    fn parse(name: &str) -> Option<OutputDType> {
        match name {
            "str" => Some(OutputDType::Str),
            "bool" => Some(OutputDType::Bool),
            "int" => Some(OutputDType::Int),
            "float" => Some(OutputDType::Float),
            "complex" => Some(OutputDType::Complex),
            "json" | "JSON" => Some(OutputDType::Json),
            "yaml" | "YAML" => Some(OutputDType::Yaml),
            _ => None,
        }
    }

    fn load(self, text: &str) -> Result<PValue> {
        match self {
            OutputDType::Str | OutputDType::Complex => Ok(PValue::Str(text.to_string())),
            OutputDType::Bool => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(PValue::Bool(true)),
                "false" | "0" | "no" | "" => Ok(PValue::Bool(false)),
                other => Err(cab_runtime_error(format!("'{other}' is not a boolean"))),
            },
            OutputDType::Int => text
                .trim()
                .parse::<i64>()
                .map(PValue::Int)
                .map_err(|exc| cab_runtime_error(format!("'{text}': {exc}"))),
            OutputDType::Float => text
                .trim()
                .parse::<f64>()
                .map(PValue::Float)
                .map_err(|exc| cab_runtime_error(format!("'{text}': {exc}"))),
            OutputDType::Json => serde_json::from_str::<serde_json::Value>(text)
                .map(|v| PValue::from_json(&v))
                .map_err(|exc| cab_runtime_error(format!("'{text}': {exc}"))),
            OutputDType::Yaml => serde_yaml::from_str::<serde_yaml::Value>(text)
                .map(|v| PValue::from_yaml(&v))
                .map_err(|exc| cab_runtime_error(format!("'{text}': {exc}"))),
        }
    }
}

/// One declarative action triggered when a wrangler regex matches an output
/// line. Actions are a closed set, parsed from the short DSL strings in a
/// cab's management.wranglers section.
#[derive(Debug, Clone, PartialEq)]
pub enum WranglerAction {
    Replace { replacement: String },
    Highlight { style: String },
    ChangeSeverity { severity: Severity },
    Suppress,
    DeclareWarning { message: String },
    DeclareError { message: Option<String> },
    DeclareSuccess,
    ParseOutput { name: String, group: GroupRef, dtype: OutputDType },
    ParseJsonOutputs { names: Vec<String> },
    ParseJsonOutputDict,
}

static SPEC_REPLACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^REPLACE:(?s)(.*)$").unwrap());
static SPEC_HIGHLIGHT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^HIGHLIGHT:(.*)$").unwrap());
static SPEC_SEVERITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^SEVERITY:(ERROR|WARNING|INFO|DEBUG|CRITICAL|FATAL)$").unwrap());
static SPEC_WARNING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^WARNING:(.*)$").unwrap());
static SPEC_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ERROR(?::(.*))?$").unwrap());
static SPEC_PARSE_OUTPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PARSE_OUTPUT:(?:(.*):)?([^:]*):(str|bool|int|float|complex|json|JSON|yaml|YAML)$")
        .unwrap()
});

/// Creates a wrangler action from a specifier string, validating it against
/// the regex it will be attached to.
pub fn create(regex: &Regex, spec: &str) -> Result<WranglerAction> {
    if spec == "SUPPRESS" {
        return Ok(WranglerAction::Suppress);
    }
    if spec == "DECLARE_SUCCESS" {
        return Ok(WranglerAction::DeclareSuccess);
    }
    if spec == "PARSE_JSON_OUTPUTS" {
        let names: Vec<String> = regex
            .capture_names()
            .flatten()
            .map(|n| n.to_string())
            .collect();
        if names.is_empty() {
            return Err(schema_error(format!(
                "wrangler action '{spec}' for '{}': no ()-groups",
                regex.as_str()
            )));
        }
        return Ok(WranglerAction::ParseJsonOutputs { names });
    }
    if spec == "PARSE_JSON_OUTPUT_DICT" {
        if regex.captures_len() < 2 {
            return Err(schema_error(format!(
                "wrangler action '{spec}' for '{}': no ()-groups",
                regex.as_str()
            )));
        }
        return Ok(WranglerAction::ParseJsonOutputDict);
    }
    if let Some(caps) = SPEC_PARSE_OUTPUT.captures(spec) {
        let name = caps.get(1).map(|m| m.as_str().to_string());
        let group = caps[2].to_string();
        let dtype = OutputDType::parse(&caps[3]).unwrap();
        let group_ref = if regex.capture_names().flatten().any(|n| n == group) {
            GroupRef::Name(group.clone())
        } else if let Ok(index) = group.parse::<usize>() {
            if index >= regex.captures_len() {
                return Err(schema_error(format!(
                    "wrangler action '{spec}' for '{}': {index} is not a valid ()-group",
                    regex.as_str()
                )));
            }
            GroupRef::Index(index)
        } else {
            return Err(schema_error(format!(
                "wrangler action '{spec}' for '{}': {group} is not a valid ()-group",
                regex.as_str()
            )));
        };
        return Ok(WranglerAction::ParseOutput {
            name: name.unwrap_or_else(|| group.clone()),
            group: group_ref,
            dtype,
        });
    }
    if let Some(caps) = SPEC_SEVERITY.captures(spec) {
        return Ok(WranglerAction::ChangeSeverity {
            severity: Severity::parse(&caps[1]).unwrap(),
        });
    }
    if let Some(caps) = SPEC_REPLACE.captures(spec) {
        return Ok(WranglerAction::Replace { replacement: caps[1].to_string() });
    }
    if let Some(caps) = SPEC_HIGHLIGHT.captures(spec) {
        return Ok(WranglerAction::Highlight { style: caps[1].to_string() });
    }
    if let Some(caps) = SPEC_WARNING.captures(spec) {
        return Ok(WranglerAction::DeclareWarning { message: caps[1].to_string() });
    }
    if let Some(caps) = SPEC_ERROR.captures(spec) {
        return Ok(WranglerAction::DeclareError {
            message: caps.get(1).map(|m| m.as_str().to_string()),
        });
    }
    Err(schema_error(format!(
        "'{}': '{spec}' is not a valid wrangler specifier",
        regex.as_str()
    )))
}

/// A compiled wrangler: a regex plus the ordered actions applied on match.
#[derive(Debug, Clone)]
pub struct Wrangler {
    pub regex: Regex,
    pub actions: Vec<WranglerAction>,
}

/// Compiles a (pattern, spec-list) pair from a cab definition.
pub fn create_list(pattern: &str, specs: &[String]) -> Result<Wrangler> {
    let regex = Regex::new(pattern).map_err(|exc| {
        schema_error(format!("wrangler pattern '{pattern}' is not a valid regular expression: {exc}"))
    })?;
    let actions: Result<Vec<WranglerAction>> =
        specs.iter().map(|spec| create(&regex, spec)).collect();
    Ok(Wrangler { regex, actions: actions? })
}

/// Substitutes {group} references in a message template with the captures of
/// a match.
fn format_with_groups(template: &str, regex: &Regex, caps: &Captures) -> String {
    let mut out = template.to_string();
    for name in regex.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            out = out.replace(&format!("{{{name}}}"), m.as_str());
        }
    }
    out
}

impl WranglerAction {
    /// Applies the action to a matched output line. Returns the (possibly
    /// modified) line, or None to suppress it, plus a severity override.
    pub fn apply(
        &self,
        status: &mut RuntimeStatus,
        regex: &Regex,
        line: &str,
        caps: &Captures,
    ) -> (Option<String>, Option<Severity>) {
        match self {
            WranglerAction::Replace { replacement } => {
                (Some(regex.replace_all(line, replacement.as_str()).into_owned()), None)
            }
            WranglerAction::Highlight { style } => (
                Some(
                    regex
                        .replace_all(line, format!("[{style}]$0[/{style}]").as_str())
                        .into_owned(),
                ),
                None,
            ),
            WranglerAction::ChangeSeverity { severity } => (Some(line.to_string()), Some(*severity)),
            WranglerAction::Suppress => (None, None),
            WranglerAction::DeclareWarning { message } => {
                status.declare_warning(message.clone());
                (Some(line.to_string()), Some(Severity::Warning))
            }
            WranglerAction::DeclareError { message } => {
                let message = match message {
                    Some(template) => format_with_groups(template, regex, caps),
                    None => format!(
                        "cab marked as failed based on encountering '{}' in output",
                        regex.as_str()
                    ),
                };
                status.declare_failure(cab_runtime_error(message));
                (Some(line.to_string()), Some(Severity::Error))
            }
            WranglerAction::DeclareSuccess => {
                status.declare_success();
                (Some(line.to_string()), None)
            }
            WranglerAction::ParseOutput { name, group, dtype } => {
                let text = match group {
                    GroupRef::Name(g) => caps.name(g).map(|m| m.as_str().to_string()),
                    GroupRef::Index(i) => caps.get(*i).map(|m| m.as_str().to_string()),
                };
                if let Some(text) = text {
                    match dtype.load(&text) {
                        Ok(value) => status.declare_output(name.clone(), value),
                        Err(exc) => status.declare_failure(StimelaError::wrap(
                            exc,
                            crate::errors::ErrorKind::CabOutput,
                            format!("error parsing output '{name}'"),
                        )),
                    }
                }
                (Some(line.to_string()), None)
            }
            WranglerAction::ParseJsonOutputs { names } => {
                for name in names {
                    if let Some(m) = caps.name(name) {
                        match serde_json::from_str::<serde_json::Value>(m.as_str()) {
                            Ok(value) => status.declare_output(name.clone(), PValue::from_json(&value)),
                            Err(exc) => status.declare_failure(cab_runtime_error(format!(
                                "error parsing string \"{}\" for output '{name}': {exc}",
                                m.as_str()
                            ))),
                        }
                    }
                }
                (Some(line.to_string()), None)
            }
            WranglerAction::ParseJsonOutputDict => {
                if let Some(m) = caps.get(1) {
                    match serde_json::from_str::<serde_json::Value>(m.as_str()) {
                        Ok(serde_json::Value::Object(map)) => {
                            for (name, value) in &map {
                                status.declare_output(name.clone(), PValue::from_json(value));
                            }
                        }
                        Ok(other) => status.declare_failure(cab_runtime_error(format!(
                            "output dict expected, got {other}"
                        ))),
                        Err(exc) => status.declare_failure(cab_runtime_error(format!(
                            "error parsing output dict: {exc}"
                        ))),
                    }
                }
                (Some(line.to_string()), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> RuntimeStatus {
        RuntimeStatus::new(Vec::new())
    }

    #[test]
    fn spec_parsing() {
        let regex = Regex::new(r"(?P<n>\d+) done").unwrap();
        assert_eq!(
            create(&regex, "SEVERITY:WARNING").unwrap(),
            WranglerAction::ChangeSeverity { severity: Severity::Warning }
        );
        assert_eq!(create(&regex, "SUPPRESS").unwrap(), WranglerAction::Suppress);
        assert_eq!(
            create(&regex, "REPLACE:gone").unwrap(),
            WranglerAction::Replace { replacement: "gone".into() }
        );
        match create(&regex, "PARSE_OUTPUT:n:int").unwrap() {
            WranglerAction::ParseOutput { name, group, dtype } => {
                assert_eq!(name, "n");
                assert_eq!(group, GroupRef::Name("n".into()));
                assert_eq!(dtype, OutputDType::Int);
            }
            other => panic!("{other:?}"),
        }
        match create(&regex, "PARSE_OUTPUT:count:1:float").unwrap() {
            WranglerAction::ParseOutput { name, group, .. } => {
                assert_eq!(name, "count");
                assert_eq!(group, GroupRef::Index(1));
            }
            other => panic!("{other:?}"),
        }
        assert!(create(&regex, "BOGUS:x").is_err());
        assert!(create(&regex, "PARSE_OUTPUT:n:5:int").is_err());
    }

    #[test]
    fn parse_json_outputs_requires_named_groups() {
        let plain = Regex::new(r"\d+").unwrap();
        assert!(create(&plain, "PARSE_JSON_OUTPUTS").is_err());
        let named = Regex::new(r"(?P<x>\d+)").unwrap();
        assert!(create(&named, "PARSE_JSON_OUTPUTS").is_ok());
    }

    #[test]
    fn actions_apply_in_order() {
        let mut st = status();
        let wrangler = create_list(
            "warning: (?P<msg>.*)",
            &["REPLACE:NOTE: $msg".to_string(), "SEVERITY:WARNING".to_string()],
        )
        .unwrap();
        let (line, severity) =
            st.apply_wranglers(std::slice::from_ref(&wrangler), "warning: disk is slow", Severity::Info);
        assert_eq!(line.as_deref(), Some("NOTE: disk is slow"));
        assert_eq!(severity, Severity::Warning);
    }

    #[test]
    fn severity_only_escalates() {
        let mut st = status();
        let wrangler =
            create_list("quiet", &["SEVERITY:DEBUG".to_string()]).unwrap();
        let (_, severity) =
            st.apply_wranglers(std::slice::from_ref(&wrangler), "quiet please", Severity::Info);
        // the line's severity never drops below its original level
        assert_eq!(severity, Severity::Info);
    }

    #[test]
    fn suppress_drops_line() {
        let mut st = status();
        let wrangler = create_list("^#", &["SUPPRESS".to_string()]).unwrap();
        let (line, _) =
            st.apply_wranglers(std::slice::from_ref(&wrangler), "# comment", Severity::Info);
        assert!(line.is_none());
    }

    #[test]
    fn declare_error_fails_the_cab() {
        let mut st = status();
        let wrangler = create_list(
            "FATAL: (?P<why>.*)",
            &["ERROR:crashed because {why}".to_string()],
        )
        .unwrap();
        let (_, severity) = st.apply_wranglers(
            std::slice::from_ref(&wrangler),
            "FATAL: no memory",
            Severity::Info,
        );
        assert_eq!(severity, Severity::Error);
        assert_eq!(st.success(), Some(false));
        assert!(st.errors()[0].to_string().contains("no memory"));
    }

    #[test]
    fn first_declared_failure_wins() {
        let mut st = status();
        st.declare_failure(cab_runtime_error("boom"));
        st.declare_success();
        assert_eq!(st.success(), Some(false));
    }

    #[test]
    fn parse_output_and_dict() {
        let mut st = status();
        let wrangler = create_list(
            r"^### YIELDING CAB OUTPUT ## (.*)$",
            &["PARSE_JSON_OUTPUT_DICT".to_string()],
        )
        .unwrap();
        st.apply_wranglers(
            std::slice::from_ref(&wrangler),
            r#"### YIELDING CAB OUTPUT ## {"n": 3}"#,
            Severity::Info,
        );
        assert_eq!(st.outputs()["n"], PValue::Int(3));

        let mut st = status();
        let wrangler = create_list(
            r"wrote (?P<count>\d+) rows",
            &["PARSE_OUTPUT:count:int".to_string()],
        )
        .unwrap();
        st.apply_wranglers(std::slice::from_ref(&wrangler), "wrote 42 rows", Severity::Info);
        assert_eq!(st.outputs()["count"], PValue::Int(42));
    }
}
