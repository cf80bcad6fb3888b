use super::BackendWrapper;
use crate::cab::which;
use crate::errors::{Result, backend_error};
use crate::runlog::RunLog;
use crate::settings::SlurmOptions;

/// Wraps another backend's invocation in an srun submission.
pub struct SlurmWrapper {
    options: SlurmOptions,
}

impl SlurmWrapper {
    pub fn new(options: SlurmOptions) -> Self {
        SlurmWrapper { options }
    }

    fn executable(&self) -> Result<String> {
        match &self.options.srun_path {
            Some(path) => {
                if std::path::Path::new(path).is_file() {
                    Ok(path.clone())
                } else {
                    Err(backend_error(format!("slurm.srun_path '{path}' is not an executable")))
                }
            }
            None => which("srun", &[]).ok_or_else(|| backend_error("slurm 'srun' binary not found")),
        }
    }

    fn prepend_srun(&self, args: Vec<String>, fqname: &str) -> Result<Vec<String>> {
        let mut out = vec![self.executable()?];
        if !fqname.is_empty() {
            out.push("-J".to_string());
            out.push(fqname.to_string());
        }
        for (name, value) in &self.options.srun_opts {
            out.push(format!("--{}", name.replace('_', "-")));
            out.push(value.clone());
        }
        out.extend(args);
        Ok(out)
    }
}

/// One of the memory options must be set, or slurm jobs inherit the
/// cluster's (usually tiny) default allocation.
pub fn validate(options: &SlurmOptions, _log: &RunLog) -> Result<()> {
    if !options.required_mem_opts.is_empty()
        && !options
            .srun_opts
            .keys()
            .any(|key| options.required_mem_opts.contains(key))
    {
        return Err(backend_error(format!(
            "slurm.srun_opts must set one of the following: {}",
            options.required_mem_opts.join(", ")
        )));
    }
    Ok(())
}

impl BackendWrapper for SlurmWrapper {
    fn wrap_run_command(
        &self,
        args: Vec<String>,
        log_args: Vec<String>,
        fqname: &str,
        _log: &RunLog,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let wrapped = self.prepend_srun(args, fqname)?;
        let wrapped_log = self.prepend_srun(log_args, fqname)?;
        Ok((wrapped, wrapped_log))
    }

    fn wrap_build_command(
        &self,
        args: Vec<String>,
        fqname: &str,
        log: &RunLog,
    ) -> Result<(Vec<String>, Vec<String>)> {
        if self.options.build_local {
            return Ok((args.clone(), args));
        }
        self.wrap_run_command(args.clone(), args, fqname, log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn options_with_mem() -> SlurmOptions {
        let mut srun_opts = IndexMap::new();
        srun_opts.insert("mem".to_string(), "4G".to_string());
        srun_opts.insert("cpus_per_task".to_string(), "8".to_string());
        SlurmOptions { enable: true, srun_opts, ..SlurmOptions::default() }
    }

    #[test]
    fn validation_requires_mem_opt() {
        let log = RunLog::new("test");
        assert!(validate(&SlurmOptions::default(), &log).is_err());
        assert!(validate(&options_with_mem(), &log).is_ok());
    }

    #[test]
    fn wrapping_prepends_srun_options() {
        let dir = tempfile::tempdir().unwrap();
        let srun = dir.path().join("srun");
        std::fs::write(&srun, "#!/bin/sh\n").unwrap();
        let mut options = options_with_mem();
        options.srun_path = Some(srun.display().to_string());

        let wrapper = SlurmWrapper::new(options);
        let log = RunLog::new("test");
        let (args, _) = wrapper
            .wrap_run_command(
                vec!["payload".to_string(), "--x".to_string()],
                vec!["payload".to_string(), "--x".to_string()],
                "recipe.step",
                &log,
            )
            .unwrap();
        assert_eq!(args[0], srun.display().to_string());
        assert_eq!(&args[1..3], &["-J".to_string(), "recipe.step".to_string()]);
        // underscores in option names become dashes
        assert!(args.contains(&"--cpus-per-task".to_string()));
        assert_eq!(&args[args.len() - 2..], &["payload".to_string(), "--x".to_string()]);
    }

    #[test]
    fn build_local_leaves_build_commands_alone() {
        let wrapper = SlurmWrapper::new(options_with_mem());
        let log = RunLog::new("test");
        let (args, _) = wrapper
            .wrap_build_command(vec!["build".to_string()], "x", &log)
            .unwrap();
        assert_eq!(args, vec!["build".to_string()]);
    }
}
