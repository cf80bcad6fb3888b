use clap::{Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "stimela",
    version,
    about = "Run workflow recipes built from cabs (atomic typed tasks)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a recipe or cab from the given YAML file(s).
    Run(RunArgs),
    /// Build container images required by a recipe or cab.
    Build(BuildArgs),
    /// List cabs defined by the given YAML file(s).
    Cabs(CabsArgs),
    /// Clear the configuration cache.
    CleanCache,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum UiMode {
    /// plain progress lines on stderr
    Plain,
    /// full-screen progress pane
    Fancy,
    /// pick fancy when stderr is a terminal
    Auto,
}

#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
    /// YAML file(s) to load, a recipe/cab name, and PARAM=VALUE assignments,
    /// in any order
    pub what: Vec<String>,

    /// config overrides, as SECTION.VAR=VALUE dot-lists
    #[arg(short = 'C', long = "config", value_name = "SECTION.VAR=VALUE")]
    pub config: Vec<String>,

    /// run only these steps (name or begin:end range; prefix with
    /// subrecipe.)
    #[arg(short = 's', long = "step")]
    pub step: Vec<String>,

    /// skip these steps (name or begin:end range)
    #[arg(long = "skip-step")]
    pub skip_step: Vec<String>,

    /// run only steps with these tags
    #[arg(short = 't', long = "tags")]
    pub tags: Vec<String>,

    /// skip steps with these tags
    #[arg(long = "skip-tags")]
    pub skip_tags: Vec<String>,

    /// force-enable steps that are skipped by default
    #[arg(short = 'e', long = "enable-step")]
    pub enable_step: Vec<String>,

    /// validate and report, but don't execute anything
    #[arg(long)]
    pub dry_run: bool,

    /// rerun the recipe used by the previous invocation
    #[arg(long)]
    pub last_recipe: bool,

    /// disable the configuration cache
    #[arg(long)]
    pub no_cache: bool,

    /// progress display mode
    #[arg(long, value_enum, default_value = "auto")]
    pub ui: UiMode,

    /// depth of the profiling summary printed at the end (0 disables)
    #[arg(long)]
    pub profile_depth: Option<usize>,
}

#[derive(Debug, Clone, Parser)]
pub struct BuildArgs {
    /// YAML file(s) to load, and optionally a recipe/cab name
    pub what: Vec<String>,

    /// config overrides, as SECTION.VAR=VALUE dot-lists
    #[arg(short = 'C', long = "config", value_name = "SECTION.VAR=VALUE")]
    pub config: Vec<String>,

    /// rebuild images even if they exist
    #[arg(long)]
    pub rebuild: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct CabsArgs {
    /// YAML file(s) to load
    pub what: Vec<String>,
}

/// How the positional arguments split into files, a target name, and
/// parameter assignments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhatSplit {
    pub files: Vec<PathBuf>,
    pub name: Option<String>,
    pub assignments: Vec<(String, String)>,
}

/// Splits the mixed positional list: FILE.yml entries are config files,
/// PARAM=VALUE entries are assignments, the remaining entry (at most one) is
/// the recipe/cab name.
pub fn split_what(what: &[String]) -> Result<WhatSplit, String> {
    let mut split = WhatSplit::default();
    for entry in what {
        if entry.ends_with(".yml") || entry.ends_with(".yaml") {
            split.files.push(PathBuf::from(entry));
        } else if let Some((name, value)) = entry.split_once('=') {
            if name.is_empty() {
                return Err(format!("invalid assignment '{entry}'"));
            }
            split.assignments.push((name.to_string(), value.to_string()));
        } else if std::path::Path::new(entry).is_file() {
            split.files.push(PathBuf::from(entry));
        } else if split.name.is_none() {
            split.name = Some(entry.clone());
        } else {
            return Err(format!(
                "'{entry}': a recipe name ('{}') was already given",
                split.name.as_deref().unwrap_or("")
            ));
        }
    }
    Ok(split)
}

impl RunArgs {
    pub fn effective_ui_mode(&self) -> UiMode {
        match self.ui {
            UiMode::Auto => {
                if std::io::stderr().is_terminal() {
                    UiMode::Fancy
                } else {
                    UiMode::Plain
                }
            }
            mode => mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_options() {
        let cli = Cli::parse_from([
            "stimela", "run", "recipe.yml", "demo", "ms=foo.ms", "-s", "a:b", "--skip-step", "c",
            "-t", "cal", "--enable-step", "d", "-C", "opts.log.dir=logs", "--dry-run",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.what, vec!["recipe.yml", "demo", "ms=foo.ms"]);
        assert_eq!(args.step, vec!["a:b"]);
        assert_eq!(args.skip_step, vec!["c"]);
        assert_eq!(args.tags, vec!["cal"]);
        assert_eq!(args.enable_step, vec!["d"]);
        assert_eq!(args.config, vec!["opts.log.dir=logs"]);
        assert!(args.dry_run);
    }

    #[test]
    fn what_splits_files_names_and_assignments() {
        let split = split_what(&[
            "recipe.yml".to_string(),
            "demo".to_string(),
            "ms=foo.ms".to_string(),
            "selfcal.gain=0.1".to_string(),
        ])
        .unwrap();
        assert_eq!(split.files, vec![PathBuf::from("recipe.yml")]);
        assert_eq!(split.name.as_deref(), Some("demo"));
        assert_eq!(
            split.assignments,
            vec![
                ("ms".to_string(), "foo.ms".to_string()),
                ("selfcal.gain".to_string(), "0.1".to_string())
            ]
        );
    }

    #[test]
    fn two_names_is_an_error() {
        assert!(split_what(&["one".to_string(), "two".to_string()]).is_err());
    }

    #[test]
    fn build_parses_rebuild_flag() {
        let cli = Cli::parse_from(["stimela", "build", "recipe.yml", "--rebuild"]);
        let Command::Build(args) = cli.command else {
            panic!("expected build command");
        };
        assert!(args.rebuild);
    }
}
