mod backends;
mod basetypes;
mod cab;
mod cargo;
mod cli;
mod config;
mod errors;
mod evaluator;
mod progress;
mod recipe;
mod runlog;
mod schema;
mod settings;
mod step;
mod substitutions;
mod task_stats;
mod ui;
mod validate;
mod wranglers;
mod xrun;

use clap::Parser;
use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;
use std::path::PathBuf;
use std::process::ExitCode;

use basetypes::PValue;
use cli::UiMode;
use config::cache::ConfigCache;
use config::{ConfigLoader, check_requirements, merge_yaml};
use errors::StimelaError;
use runlog::RunLog;
use settings::StimelaConfig;
use step::{Step, StepCargo};
use substitutions::SubstitutionNs;

/// Exit code for an error: 2 before execution begins (config phase), 1
/// after.
fn exit_code_for(err: &StimelaError, execution_started: bool) -> ExitCode {
    if !execution_started || err.kind.is_config_phase() {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn last_recipe_file() -> PathBuf {
    ConfigCache::default_dir().join("last-recipe")
}

fn save_last_recipe(files: &[PathBuf], name: Option<&str>) {
    let mut lines: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
    if let Some(name) = name {
        lines.push(format!("name={name}"));
    }
    let path = last_recipe_file();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, lines.join("\n"));
}

fn load_last_recipe() -> Option<(Vec<PathBuf>, Option<String>)> {
    let content = std::fs::read_to_string(last_recipe_file()).ok()?;
    let mut files = Vec::new();
    let mut name = None;
    for line in content.lines() {
        if let Some(recipe_name) = line.strip_prefix("name=") {
            name = Some(recipe_name.to_string());
        } else if !line.is_empty() {
            files.push(PathBuf::from(line));
        }
    }
    Some((files, name))
}

/// Loads and merges the given config files into one tree, resolving
/// directives and checking requirements.
fn load_config_tree(
    files: &[PathBuf],
    use_cache: bool,
) -> Result<StimelaConfig, StimelaError> {
    let mut loader = ConfigLoader::new();
    if use_cache {
        loader = loader.with_cache();
    }
    let mut tree = YamlValue::Mapping(serde_yaml::Mapping::new());
    let mut all_deps = config::deps::ConfigDeps::new();
    for file in files {
        let (conf, deps) = loader.load(file, Some(&[]), None, None, true, true, &[])?;
        merge_yaml(&mut tree, &conf);
        all_deps.update(deps);
    }
    let unmet = check_requirements(&mut tree, true)?;
    for (location, requirement, _) in unmet {
        progress::log_progress(format!(
            "phase=config status=warning unmet-requirement={requirement} section={location}"
        ));
    }
    let config = StimelaConfig::from_tree(tree)?;
    Ok(config)
}

/// Parses a command-line value: YAML-typed when it parses, else a plain
/// string.
fn parse_cli_value(value: &str) -> YamlValue {
    serde_yaml::from_str(value).unwrap_or_else(|_| YamlValue::String(value.to_string()))
}

fn apply_config_overrides(config: &mut StimelaConfig, overrides: &[String]) -> Result<(), StimelaError> {
    for entry in overrides {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(errors::config_error(format!(
                "invalid config override '{entry}' (expected SECTION.VAR=VALUE)"
            )));
        };
        config.set_dotted(key, parse_cli_value(value))?;
    }
    Ok(())
}

/// Resolves the run target: the named recipe/cab, or the sole top-level
/// recipe section.
fn resolve_target(config: &StimelaConfig, name: Option<&str>) -> Result<String, StimelaError> {
    if let Some(name) = name {
        if config.get_recipe(name).is_some() || config.get_cab(name).is_some() {
            return Ok(name.to_string());
        }
        return Err(errors::config_error(format!(
            "'{name}' does not refer to a known recipe or cab"
        )));
    }
    let YamlValue::Mapping(map) = &config.tree else {
        return Err(errors::config_error("no recipes defined"));
    };
    let candidates: Vec<String> = map
        .iter()
        .filter(|(_, value)| {
            matches!(value, YamlValue::Mapping(m)
                if m.contains_key(YamlValue::String("steps".to_string())))
        })
        .map(|(key, _)| basetypes::yaml_key_to_string(key))
        .collect();
    match candidates.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(errors::config_error("no recipe name given and no recipes defined")),
        many => Err(errors::config_error(format!(
            "no recipe name given; candidates are: {}",
            many.join(", ")
        ))),
    }
}

/// Builds the outer step wrapping the target recipe or cab.
fn make_outer_step(config: &StimelaConfig, target: &str) -> Result<Step, StimelaError> {
    let definition = if config
        .get_recipe(target)
        .map(|def| {
            matches!(def, YamlValue::Mapping(m)
                if m.contains_key(YamlValue::String("steps".to_string())))
        })
        .unwrap_or(false)
    {
        serde_yaml::from_str(&format!("recipe: {target}\n")).unwrap()
    } else if config.get_cab(target).is_some() {
        serde_yaml::from_str(&format!("cab: {target}\n")).unwrap()
    } else {
        return Err(errors::config_error(format!(
            "'{target}' does not refer to a known recipe or cab"
        )));
    };
    Step::from_yaml(target, &definition)
}

fn make_root_log(config: &StimelaConfig, target: &str) -> RunLog {
    let logopts = &config.opts.log;
    if logopts.enable {
        let pattern = format!("{}{}", logopts.name, logopts.ext);
        match RunLog::with_file(target, std::path::Path::new(&logopts.dir), &pattern, logopts.level)
        {
            Ok(log) => return log,
            Err(exc) => eprintln!("cannot open log file in {}: {exc}", logopts.dir),
        }
    }
    RunLog::new(target)
}

/// The root substitution namespace for the outer step.
fn make_root_subst(config: &StimelaConfig) -> SubstitutionNs {
    let mut subst = SubstitutionNs::new();
    let mut info = SubstitutionNs::with_nosubst();
    info.add("fqname", PValue::Str(String::new()));
    info.add("taskname", PValue::Str(String::new()));
    subst.add_ns("info", info.clone());
    subst.add_ns("self", info);
    subst.add_nosubst("config", PValue::from_yaml(&config.tree));
    subst.add_ns("current", SubstitutionNs::with_nosubst());
    subst.add_ns("recipe", SubstitutionNs::new());
    subst
}

fn run_command(args: cli::RunArgs) -> ExitCode {
    let mut split = match cli::split_what(&args.what) {
        Ok(split) => split,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    if args.last_recipe {
        match load_last_recipe() {
            Some((files, name)) => {
                if split.files.is_empty() {
                    split.files = files;
                }
                if split.name.is_none() {
                    split.name = name;
                }
            }
            None => {
                eprintln!("--last-recipe: no previous recipe recorded");
                return ExitCode::from(2);
            }
        }
    }
    if split.files.is_empty() {
        eprintln!("no configuration files given");
        return ExitCode::from(2);
    }

    progress::reset_cancellation();
    let _ = ctrlc::set_handler(|| {
        progress::request_cancellation("Ctrl+C");
    });

    let mut progress_ui = if args.effective_ui_mode() == UiMode::Fancy {
        let ui = ui::ProgressUi::start(format!(
            "stimela run ({})",
            split.name.as_deref().unwrap_or("recipe")
        ));
        progress::install_progress_sink(ui.sink());
        Some(ui)
    } else {
        None
    };

    let finish = |ui: Option<ui::ProgressUi>, summary: String| {
        progress::clear_progress_sink();
        if let Some(ui) = ui {
            ui.finish(summary);
        }
    };

    // configuration phase: errors here exit with code 2
    let outcome = (|| -> Result<(StimelaConfig, Step, String, IndexMap<String, PValue>), StimelaError> {
        let mut config = load_config_tree(&split.files, !args.no_cache)?;
        apply_config_overrides(&mut config, &args.config)?;
        let target = resolve_target(&config, split.name.as_deref())?;
        let mut outer = make_outer_step(&config, &target)?;

        let log = make_root_log(&config, &target);
        let mut resolution_stack = Vec::new();
        outer.finalize(&config, log, &target, 0, &mut resolution_stack)?;

        // command-line parameter assignments
        let mut params: IndexMap<String, PValue> = IndexMap::new();
        for (name, value) in &split.assignments {
            if let Some(rest) = name.strip_prefix("config.") {
                config.set_dotted(rest, parse_cli_value(value))?;
            } else {
                params.insert(name.clone(), PValue::from_yaml(&parse_cli_value(value)));
            }
        }
        for (name, value) in &params {
            outer.update_parameter(name, value.clone());
        }

        // step selection
        if let Some(recipe) = outer.as_recipe_mut() {
            recipe.restrict_steps(
                &args.tags,
                &args.skip_tags,
                &args.step,
                &args.skip_step,
                &args.enable_step,
            )?;
        } else if !args.tags.is_empty() || !args.step.is_empty() {
            return Err(StimelaError::new(
                errors::ErrorKind::StepSelection,
                "step selection options only apply to recipes",
            ));
        }

        let mut subst = make_root_subst(&config);
        outer.prevalidate(&mut config, Some((&mut subst, Some("current"))))?;
        Ok((config, outer, target, params))
    })();

    let (mut config, mut outer, target, _params) = match outcome {
        Ok(result) => result,
        Err(err) => {
            finish(progress_ui.take(), format!("run failed: {err}"));
            eprintln!("configuration error: {err}");
            for line in err.cause_lines() {
                eprintln!("  {line}");
            }
            return ExitCode::from(2);
        }
    };

    save_last_recipe(&split.files, Some(&target));

    if args.dry_run {
        finish(progress_ui.take(), format!("dry run of '{target}' validated"));
        println!("dry run: '{target}' validated, nothing executed");
        return ExitCode::SUCCESS;
    }

    let sampler = task_stats::Sampler::start();
    let mut subst = make_root_subst(&config);
    let log = outer.log();
    let result = outer.run(&mut config, &mut subst, &log);
    sampler.stop();

    let mut profile_opts = config.opts.profile.clone();
    if let Some(depth) = args.profile_depth {
        profile_opts.print_depth = depth;
    }
    if let Err(exc) = task_stats::save_stats(&log, &profile_opts) {
        log.warning(format!("could not save stats: {exc}"));
    }

    match result {
        Ok(_) => {
            finish(progress_ui.take(), format!("'{target}' finished successfully"));
            println!("'{target}' finished successfully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            finish(progress_ui.take(), format!("run failed: {err}"));
            eprintln!("run failed: {err}");
            for line in err.cause_lines() {
                eprintln!("  {line}");
            }
            exit_code_for(&err, true)
        }
    }
}

fn build_command(args: cli::BuildArgs) -> ExitCode {
    let split = match cli::split_what(&args.what) {
        Ok(split) => split,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    let outcome = (|| -> Result<(), StimelaError> {
        let mut config = load_config_tree(&split.files, true)?;
        apply_config_overrides(&mut config, &args.config)?;
        let target = resolve_target(&config, split.name.as_deref())?;
        let mut outer = make_outer_step(&config, &target)?;
        let log = make_root_log(&config, &target);
        let mut resolution_stack = Vec::new();
        outer.finalize(&config, log.clone(), &target, 0, &mut resolution_stack)?;
        match &mut outer.cargo {
            StepCargo::Recipe(recipe) => recipe.build(&config, args.rebuild, &log),
            StepCargo::Cab(cab) => {
                let runner =
                    backends::validate_backend_settings(&config.opts.backend, &log, cab)?;
                runner.build(cab, &config.opts.backend, &log, args.rebuild)
            }
            _ => Ok(()),
        }
    })();
    match outcome {
        Ok(()) => {
            println!("build completed");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("build failed: {err}");
            exit_code_for(&err, false)
        }
    }
}

fn cabs_command(args: cli::CabsArgs) -> ExitCode {
    let split = match cli::split_what(&args.what) {
        Ok(split) => split,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    match load_config_tree(&split.files, true) {
        Ok(config) => {
            for name in config.cab_names() {
                let info = config
                    .get_cab(&name)
                    .and_then(|def| def.get("info"))
                    .map(basetypes::yaml_key_to_string)
                    .unwrap_or_default();
                println!("{name:<30} {info}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error loading configuration: {err}");
            ExitCode::from(2)
        }
    }
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Run(args) => run_command(args),
        cli::Command::Build(args) => build_command(args),
        cli::Command::Cabs(args) => cabs_command(args),
        cli::Command::CleanCache => {
            let cache = ConfigCache::new(ConfigCache::default_dir());
            match cache.clear() {
                Ok(count) => {
                    println!("cleared {count} cached config(s)");
                    ExitCode::SUCCESS
                }
                Err(exc) => {
                    eprintln!("failed to clear cache: {exc}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
