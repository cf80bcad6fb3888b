use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;

use crate::basetypes::{PValue, yaml_key_to_string};
use crate::errors::{Result, config_error};
use crate::runlog::Severity;

/// Log-file options (opts.log).
#[derive(Debug, Clone, PartialEq)]
pub struct LogOptions {
    pub enable: bool,
    /// filename pattern; {fqname} is substituted
    pub name: String,
    pub ext: String,
    pub dir: String,
    /// how deep to nest individual log files: 0 = one per recipe, 1 = one
    /// per step, etc.
    pub nest: i64,
    pub level: Severity,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            enable: true,
            name: "log-{fqname}".to_string(),
            ext: ".txt".to_string(),
            dir: ".".to_string(),
            nest: 999,
            level: Severity::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileOptions {
    pub print_depth: usize,
    pub unroll_loops: bool,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        ProfileOptions { print_depth: 2, unroll_loops: false }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisableSkipOptions {
    pub fresh: bool,
    pub exist: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NativeOptions {
    pub enable: bool,
}

impl Default for NativeOptions {
    fn default() -> Self {
        NativeOptions { enable: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingularityOptions {
    pub enable: bool,
    pub executable: Option<String>,
    /// directory of local .sif images, searched before remote specifiers
    pub image_dir: Option<String>,
    /// extra bind specs always added to container invocations
    pub bind: Vec<String>,
}

impl Default for SingularityOptions {
    fn default() -> Self {
        SingularityOptions { enable: true, executable: None, image_dir: None, bind: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlurmOptions {
    pub enable: bool,
    pub srun_path: Option<String>,
    /// extra srun options; "--" is prepended and "_" becomes "-"
    pub srun_opts: IndexMap<String, String>,
    /// build images on the head node even when slurm is enabled
    pub build_local: bool,
    pub required_mem_opts: Vec<String>,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        SlurmOptions {
            enable: false,
            srun_path: None,
            srun_opts: IndexMap::new(),
            build_local: true,
            required_mem_opts: vec![
                "mem".to_string(),
                "mem-per-cpu".to_string(),
                "mem-per-gpu".to_string(),
            ],
        }
    }
}

/// Backend dispatch options (opts.backend).
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOptions {
    pub select: Vec<String>,
    pub native: NativeOptions,
    pub singularity: SingularityOptions,
    pub slurm: SlurmOptions,
    pub rlimits: IndexMap<String, u64>,
    pub verbose: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            select: vec!["singularity".to_string(), "native".to_string()],
            native: NativeOptions::default(),
            singularity: SingularityOptions::default(),
            slurm: SlurmOptions::default(),
            rlimits: IndexMap::new(),
            verbose: false,
        }
    }
}

/// The opts.* runtime options tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StimelaOptions {
    pub backend: BackendOptions,
    pub log: LogOptions,
    pub include: Vec<String>,
    pub runtime: IndexMap<String, PValue>,
    pub profile: ProfileOptions,
    pub disable_skips: DisableSkipOptions,
}

fn get<'a>(map: &'a YamlValue, key: &str) -> Option<&'a YamlValue> {
    match map {
        YamlValue::Mapping(m) => m.get(YamlValue::String(key.to_string())),
        _ => None,
    }
}

fn get_bool(map: &YamlValue, key: &str, default: bool) -> bool {
    get(map, key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn get_str(map: &YamlValue, key: &str) -> Option<String> {
    get(map, key)
        .filter(|v| !matches!(v, YamlValue::Null))
        .map(yaml_key_to_string)
}

fn get_str_list(map: &YamlValue, key: &str) -> Option<Vec<String>> {
    match get(map, key)? {
        YamlValue::String(s) => Some(vec![s.clone()]),
        YamlValue::Sequence(seq) => Some(seq.iter().map(yaml_key_to_string).collect()),
        _ => None,
    }
}

impl StimelaOptions {
    /// Parses the options tree out of the full config's "opts" section.
    pub fn from_config(tree: &YamlValue) -> Result<StimelaOptions> {
        let mut options = StimelaOptions::default();
        let Some(opts) = get(tree, "opts") else {
            return Ok(options);
        };

        if let Some(log) = get(opts, "log") {
            options.log.enable = get_bool(log, "enable", options.log.enable);
            if let Some(name) = get_str(log, "name") {
                options.log.name = name;
            }
            if let Some(ext) = get_str(log, "ext") {
                options.log.ext = ext;
            }
            if let Some(dir) = get_str(log, "dir") {
                options.log.dir = dir;
            }
            if let Some(nest) = get(log, "nest").and_then(|v| v.as_i64()) {
                options.log.nest = nest;
            }
            if let Some(level) = get_str(log, "level") {
                options.log.level = Severity::parse(&level)
                    .ok_or_else(|| config_error(format!("opts.log.level: unknown level '{level}'")))?;
            }
        }

        if let Some(backend) = get(opts, "backend") {
            if let Some(select) = get_str_list(backend, "select") {
                options.backend.select = select;
            }
            options.backend.verbose = get_bool(backend, "verbose", false);
            if let Some(native) = get(backend, "native") {
                options.backend.native.enable = get_bool(native, "enable", true);
            }
            if let Some(singularity) = get(backend, "singularity") {
                options.backend.singularity.enable = get_bool(singularity, "enable", true);
                options.backend.singularity.executable = get_str(singularity, "executable");
                options.backend.singularity.image_dir = get_str(singularity, "image_dir");
                if let Some(bind) = get_str_list(singularity, "bind") {
                    options.backend.singularity.bind = bind;
                }
            }
            if let Some(slurm) = get(backend, "slurm") {
                options.backend.slurm.enable = get_bool(slurm, "enable", false);
                options.backend.slurm.srun_path = get_str(slurm, "srun_path");
                options.backend.slurm.build_local = get_bool(slurm, "build_local", true);
                if let Some(YamlValue::Mapping(m)) = get(slurm, "srun_opts") {
                    for (k, v) in m {
                        options
                            .backend
                            .slurm
                            .srun_opts
                            .insert(yaml_key_to_string(k), yaml_key_to_string(v));
                    }
                }
                if let Some(required) = get_str_list(slurm, "required_mem_opts") {
                    options.backend.slurm.required_mem_opts = required;
                }
            }
            if let Some(YamlValue::Mapping(m)) = get(backend, "rlimits") {
                for (k, v) in m {
                    if let Some(value) = v.as_u64() {
                        options.backend.rlimits.insert(yaml_key_to_string(k), value);
                    }
                }
            }
        }

        if let Some(include) = get_str_list(opts, "include") {
            options.include = include;
        }
        if let Some(YamlValue::Mapping(m)) = get(opts, "runtime") {
            for (k, v) in m {
                options.runtime.insert(yaml_key_to_string(k), PValue::from_yaml(v));
            }
        }
        if let Some(profile) = get(opts, "profile") {
            if let Some(depth) = get(profile, "print_depth").and_then(|v| v.as_u64()) {
                options.profile.print_depth = depth as usize;
            }
            options.profile.unroll_loops = get_bool(profile, "unroll_loops", false);
        }
        if let Some(skips) = get(opts, "disable_skips") {
            options.disable_skips.fresh = get_bool(skips, "fresh", false);
            options.disable_skips.exist = get_bool(skips, "exist", false);
        }
        Ok(options)
    }
}

/// The fully-merged configuration: the raw tree (cabs, lib.recipes, opts,
/// vars) plus the parsed options.
#[derive(Debug, Clone, Default)]
pub struct StimelaConfig {
    pub tree: YamlValue,
    pub opts: StimelaOptions,
}

impl StimelaConfig {
    pub fn from_tree(tree: YamlValue) -> Result<StimelaConfig> {
        let opts = StimelaOptions::from_config(&tree)?;
        Ok(StimelaConfig { tree, opts })
    }

    pub fn get_cab(&self, name: &str) -> Option<&YamlValue> {
        get(&self.tree, "cabs").and_then(|cabs| get(cabs, name))
    }

    pub fn cab_names(&self) -> Vec<String> {
        match get(&self.tree, "cabs") {
            Some(YamlValue::Mapping(m)) => m.keys().map(yaml_key_to_string).collect(),
            _ => Vec::new(),
        }
    }

    pub fn get_recipe(&self, name: &str) -> Option<&YamlValue> {
        if let Some(found) = get(&self.tree, "lib")
            .and_then(|lib| get(lib, "recipes"))
            .and_then(|recipes| get(recipes, name))
        {
            return Some(found);
        }
        // dotted names address arbitrary config sections
        let mut current = &self.tree;
        for part in name.split('.') {
            current = get(current, part)?;
        }
        Some(current)
    }

    /// Applies a SECTION.VAR=VALUE dot-list assignment to the tree,
    /// re-parsing the options if they are affected.
    pub fn set_dotted(&mut self, key: &str, value: YamlValue) -> Result<()> {
        set_dotted_value(&mut self.tree, key, value)?;
        if key == "opts" || key.starts_with("opts.") {
            self.opts = StimelaOptions::from_config(&self.tree)?;
        }
        Ok(())
    }
}

/// Writes a value into a YAML tree at a dotted path, creating intermediate
/// mappings.
pub fn set_dotted_value(tree: &mut YamlValue, key: &str, value: YamlValue) -> Result<()> {
    let mut current = tree;
    let parts: Vec<&str> = key.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        let last = i + 1 == parts.len();
        let YamlValue::Mapping(map) = current else {
            return Err(config_error(format!("invalid assignment target '{key}'")));
        };
        let part_key = YamlValue::String(part.to_string());
        if last {
            map.insert(part_key, value);
            return Ok(());
        }
        if !map.contains_key(&part_key) {
            map.insert(part_key.clone(), YamlValue::Mapping(serde_yaml::Mapping::new()));
        }
        current = map.get_mut(&part_key).unwrap();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_opts_section() {
        let tree: YamlValue = serde_yaml::from_str("cabs: {}\n").unwrap();
        let opts = StimelaOptions::from_config(&tree).unwrap();
        assert_eq!(opts.backend.select, vec!["singularity", "native"]);
        assert!(opts.log.enable);
        assert_eq!(opts.log.name, "log-{fqname}");
    }

    #[test]
    fn parse_backend_options() {
        let tree: YamlValue = serde_yaml::from_str(
            r#"
opts:
  backend:
    select: [native]
    slurm:
      enable: true
      srun_opts:
        mem: 4G
    rlimits:
      nofile: 10000
  log:
    dir: logs
    level: DEBUG
"#,
        )
        .unwrap();
        let opts = StimelaOptions::from_config(&tree).unwrap();
        assert_eq!(opts.backend.select, vec!["native"]);
        assert!(opts.backend.slurm.enable);
        assert_eq!(opts.backend.slurm.srun_opts["mem"], "4G");
        assert_eq!(opts.backend.rlimits["nofile"], 10000);
        assert_eq!(opts.log.dir, "logs");
        assert_eq!(opts.log.level, Severity::Debug);
    }

    #[test]
    fn dotted_assignment_updates_opts() {
        let tree: YamlValue = serde_yaml::from_str("opts:\n  log:\n    dir: a\n").unwrap();
        let mut config = StimelaConfig::from_tree(tree).unwrap();
        assert_eq!(config.opts.log.dir, "a");
        config
            .set_dotted("opts.log.dir", YamlValue::String("b".to_string()))
            .unwrap();
        assert_eq!(config.opts.log.dir, "b");
        config.set_dotted("vars.x", YamlValue::from(1)).unwrap();
        assert_eq!(config.tree["vars"]["x"], YamlValue::from(1));
    }

    #[test]
    fn cab_and_recipe_lookup() {
        let tree: YamlValue = serde_yaml::from_str(
            "cabs:\n  echo:\n    command: echo\nlib:\n  recipes:\n    demo:\n      steps: {}\n",
        )
        .unwrap();
        let config = StimelaConfig::from_tree(tree).unwrap();
        assert!(config.get_cab("echo").is_some());
        assert!(config.get_cab("nope").is_none());
        assert!(config.get_recipe("demo").is_some());
        assert!(config.get_recipe("lib.recipes.demo").is_some());
        assert_eq!(config.cab_names(), vec!["echo"]);
    }
}
