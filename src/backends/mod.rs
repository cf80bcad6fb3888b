pub mod mounts;
pub mod native;
pub mod singularity;
pub mod slurm;

use indexmap::IndexMap;

use crate::basetypes::PValue;
use crate::cab::{Cab, RuntimeStatus};
use crate::errors::{Result, backend_error};
use crate::runlog::RunLog;
use crate::settings::BackendOptions;
use crate::substitutions::{SubstContext, SubstitutionNs};

/// A wrapper backend modifies the command line of another backend's
/// invocation (e.g. slurm submission). The empty wrapper is the identity.
pub trait BackendWrapper: Send + Sync {
    fn wrap_run_command(
        &self,
        args: Vec<String>,
        log_args: Vec<String>,
        fqname: &str,
        log: &RunLog,
    ) -> Result<(Vec<String>, Vec<String>)>;

    fn wrap_build_command(&self, args: Vec<String>, fqname: &str, log: &RunLog)
    -> Result<(Vec<String>, Vec<String>)>;
}

pub struct EmptyWrapper;

impl BackendWrapper for EmptyWrapper {
    fn wrap_run_command(
        &self,
        args: Vec<String>,
        log_args: Vec<String>,
        _fqname: &str,
        _log: &RunLog,
    ) -> Result<(Vec<String>, Vec<String>)> {
        Ok((args, log_args))
    }

    fn wrap_build_command(
        &self,
        args: Vec<String>,
        _fqname: &str,
        _log: &RunLog,
    ) -> Result<(Vec<String>, Vec<String>)> {
        Ok((args.clone(), args))
    }
}

/// Contract every executor backend satisfies.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    fn get_status(&self) -> String;

    fn is_remote(&self) -> bool {
        false
    }

    fn requires_container_image(&self) -> bool {
        false
    }

    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<RuntimeStatus>;

    fn build(
        &self,
        _cab: &Cab,
        _options: &BackendOptions,
        log: &RunLog,
        _rebuild: bool,
        _wrapper: &dyn BackendWrapper,
    ) -> Result<()> {
        log.warning(format!(
            "the {} backend does not support or require image builds",
            self.name()
        ));
        Ok(())
    }
}

/// Instantiates a backend by name, respecting its enable flag. Returns None
/// for disabled or unavailable backends.
pub fn get_backend(name: &str, options: &BackendOptions) -> Option<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match name {
        "native" => {
            if !options.native.enable {
                return None;
            }
            Box::new(native::NativeBackend)
        }
        "singularity" => {
            if !options.singularity.enable {
                return None;
            }
            Box::new(singularity::SingularityBackend::new(options.singularity.clone()))
        }
        _ => return None,
    };
    backend.is_available().then_some(backend)
}

fn backend_status(name: &str, options: &BackendOptions) -> String {
    match name {
        "native" => {
            if options.native.enable {
                native::NativeBackend.get_status()
            } else {
                "disabled".to_string()
            }
        }
        "singularity" => {
            if options.singularity.enable {
                singularity::SingularityBackend::new(options.singularity.clone()).get_status()
            } else {
                "disabled".to_string()
            }
        }
        _ => "unknown backend".to_string(),
    }
}

/// A selected backend plus its (possibly empty) wrapper.
pub struct BackendRunner {
    pub backend: Box<dyn Backend>,
    pub backend_name: String,
    pub is_remote: bool,
    pub wrapper: Box<dyn BackendWrapper>,
}

impl std::fmt::Debug for BackendRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRunner")
            .field("backend_name", &self.backend_name)
            .field("is_remote", &self.is_remote)
            .finish()
    }
}

impl BackendRunner {
    pub fn run(
        &self,
        cab: &Cab,
        params: &IndexMap<String, PValue>,
        fqname: &str,
        options: &BackendOptions,
        log: &RunLog,
        ns: &SubstitutionNs,
        ctx: &SubstContext,
    ) -> Result<RuntimeStatus> {
        self.backend
            .run(cab, params, fqname, options, log, ns, ctx, self.wrapper.as_ref())
    }

    pub fn build(
        &self,
        cab: &Cab,
        options: &BackendOptions,
        log: &RunLog,
        rebuild: bool,
    ) -> Result<()> {
        self.backend.build(cab, options, log, rebuild, self.wrapper.as_ref())
    }
}

/// Selects a backend for a cab from the priority list: the first available,
/// enabled backend whose requirements the cab meets. Backends that require a
/// container image are passed over for image-less cabs. Optionally wraps the
/// selection with slurm.
pub fn validate_backend_settings(
    options: &BackendOptions,
    log: &RunLog,
    cab: &Cab,
) -> Result<BackendRunner> {
    let mut selected = None;
    for name in &options.select {
        let Some(backend) = get_backend(name, options) else {
            continue;
        };
        if backend.requires_container_image() && cab.image.is_none() {
            log.debug(format!(
                "backend '{name}' requires a container image, but cab '{}' has none; trying next",
                cab.name()
            ));
            continue;
        }
        selected = Some((name.clone(), backend));
        break;
    }
    let Some((backend_name, backend)) = selected else {
        let statuses: Vec<String> = options
            .select
            .iter()
            .map(|name| format!("{name}: {}", backend_status(name, options)))
            .collect();
        return Err(backend_error(format!(
            "selected backends ({}) not available",
            statuses.join(", ")
        )));
    };

    let mut is_remote = backend.is_remote();
    let wrapper: Box<dyn BackendWrapper> = if options.slurm.enable {
        if is_remote {
            return Err(backend_error(format!(
                "can't combine slurm with {backend_name} backend"
            )));
        }
        is_remote = true;
        slurm::validate(&options.slurm, log)?;
        Box::new(slurm::SlurmWrapper::new(options.slurm.clone()))
    } else {
        Box::new(EmptyWrapper)
    };

    Ok(BackendRunner { backend, backend_name, is_remote, wrapper })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SlurmOptions;
    use serde_yaml::Value as YamlValue;

    fn make_cab(yaml: &str) -> Cab {
        let value: YamlValue = serde_yaml::from_str(yaml).unwrap();
        Cab::from_yaml(&value, "test").unwrap()
    }

    #[test]
    fn native_fallback_when_no_image() {
        let cab = make_cab("command: /bin/echo\n");
        let options = BackendOptions::default();
        let log = RunLog::new("test");
        let runner = validate_backend_settings(&options, &log, &cab).unwrap();
        // singularity requires an image the cab doesn't have (or the binary
        // isn't installed), so selection falls through to native
        assert_eq!(runner.backend_name, "native");
        assert!(!runner.is_remote);
    }

    #[test]
    fn no_backend_available_is_an_error() {
        let cab = make_cab("command: /bin/echo\n");
        let mut options = BackendOptions::default();
        options.native.enable = false;
        options.singularity.enable = false;
        let log = RunLog::new("test");
        let err = validate_backend_settings(&options, &log, &cab).unwrap_err();
        assert!(err.to_string().contains("not available"));
    }

    #[test]
    fn slurm_requires_mem_option() {
        let cab = make_cab("command: /bin/echo\n");
        let mut options = BackendOptions::default();
        options.slurm = SlurmOptions { enable: true, ..SlurmOptions::default() };
        let log = RunLog::new("test");
        assert!(validate_backend_settings(&options, &log, &cab).is_err());

        options.slurm.srun_opts.insert("mem".to_string(), "4G".to_string());
        // selection itself now passes the wrapper validation (srun may still
        // be missing, which is only checked when the command is wrapped)
        let runner = validate_backend_settings(&options, &log, &cab).unwrap();
        assert!(runner.is_remote);
    }
}
