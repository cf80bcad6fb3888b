use indexmap::IndexMap;

use super::{Backend, BackendWrapper};
use crate::basetypes::PValue;
use crate::cab::{Cab, RuntimeStatus};
use crate::errors::{Result, cab_runtime_error};
use crate::runlog::RunLog;
use crate::settings::BackendOptions;
use crate::substitutions::{SubstContext, SubstitutionNs};
use crate::xrun::xrun;

/// Runs cabs as native subprocesses.
pub struct NativeBackend;

impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn get_status(&self) -> String {
        "OK".to_string()
    }

    fn run(
        &self,
        cab: &Cab,
        params: &IndexMap<String, PValue>,
        fqname: &str,
        options: &BackendOptions,
        log: &RunLog,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
        wrapper: &dyn BackendWrapper,
    ) -> Result<RuntimeStatus> {
        let (args, log_args) = cab.get_arguments(params, ns, ctx, true)?;
        let (args, _log_args) = wrapper.wrap_run_command(args, log_args, fqname, log)?;

        let mut status = cab.reset_status(Vec::new());
        let command_name = cab.command_name().to_string();

        let retcode = xrun(
            &args,
            &command_name,
            log,
            &mut status,
            &cab.management.environment,
            &options.rlimits,
            true,
        )?;

        // non-zero exit fails the cab unless a wrangler declared success;
        // a wrangler-declared failure stands regardless of the exit code
        if retcode != 0 && status.success() != Some(true) {
            status.declare_failure(cab_runtime_error(format!(
                "{command_name} returned non-zero exit status {retcode}"
            )));
        }

        run_cleanup(cab, log);
        Ok(status)
    }
}

/// Removes the cab's declared cleanup globs after a run.
pub fn run_cleanup(cab: &Cab, log: &RunLog) {
    for (label, patterns) in &cab.management.cleanup {
        for pattern in patterns {
            let Ok(paths) = glob::glob(pattern) else {
                continue;
            };
            for path in paths.filter_map(|p| p.ok()) {
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match result {
                    Ok(()) => log.debug(format!("cleanup {label}: removed {}", path.display())),
                    Err(exc) => {
                        log.warning(format!("cleanup {label}: cannot remove {}: {exc}", path.display()))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::EmptyWrapper;
    use serde_yaml::Value as YamlValue;

    fn make_cab(yaml: &str) -> Cab {
        let value: YamlValue = serde_yaml::from_str(yaml).unwrap();
        Cab::from_yaml(&value, "test").unwrap()
    }

    #[test]
    fn echo_cab_runs_and_succeeds() {
        let cab = make_cab(
            r#"
command: /bin/echo
inputs:
  message:
    dtype: str
    policies:
      positional: true
"#,
        );
        let mut params = IndexMap::new();
        params.insert("message".to_string(), PValue::Str("hello".into()));
        let ns = SubstitutionNs::new();
        let ctx = SubstContext::new(true);
        let log = RunLog::new("test");
        let status = NativeBackend
            .run(
                &cab,
                &params,
                "test.echo",
                &BackendOptions::default(),
                &log,
                &ns,
                &ctx,
                &EmptyWrapper,
            )
            .unwrap();
        assert_ne!(status.success(), Some(false));
    }

    #[test]
    fn nonzero_exit_fails_the_cab() {
        let cab = make_cab("command: /bin/false\n");
        let ns = SubstitutionNs::new();
        let ctx = SubstContext::new(true);
        let log = RunLog::new("test");
        let status = NativeBackend
            .run(
                &cab,
                &IndexMap::new(),
                "test.false",
                &BackendOptions::default(),
                &log,
                &ns,
                &ctx,
                &EmptyWrapper,
            )
            .unwrap();
        assert_eq!(status.success(), Some(false));
    }

    #[test]
    fn missing_executable_is_an_error() {
        let cab = make_cab("command: no-such-binary-xyzzy\n");
        let ns = SubstitutionNs::new();
        let ctx = SubstContext::new(true);
        let log = RunLog::new("test");
        let err = NativeBackend.run(
            &cab,
            &IndexMap::new(),
            "test.missing",
            &BackendOptions::default(),
            &log,
            &ns,
            &ctx,
            &EmptyWrapper,
        );
        assert!(err.is_err());
    }
}
