use indexmap::IndexMap;
use std::path::Path;

use super::{Backend, BackendWrapper, mounts};
use crate::basetypes::PValue;
use crate::cab::{Cab, RuntimeStatus, which};
use crate::errors::{Result, backend_error};
use crate::runlog::RunLog;
use crate::settings::{BackendOptions, SingularityOptions};
use crate::substitutions::{SubstContext, SubstitutionNs};
use crate::xrun::xrun;

/// Runs cabs inside singularity/apptainer containers.
pub struct SingularityBackend {
    options: SingularityOptions,
}

impl SingularityBackend {
    pub fn new(options: SingularityOptions) -> Self {
        SingularityBackend { options }
    }

    fn executable(&self) -> Option<String> {
        if let Some(path) = &self.options.executable {
            return Path::new(path).is_file().then(|| path.clone());
        }
        which("singularity", &[]).or_else(|| which("apptainer", &[]))
    }

    /// Resolves the image specifier: a matching .sif under image_dir wins,
    /// else the image string is passed through (e.g. docker:// specifiers).
    fn resolve_image(&self, image: &str) -> String {
        if let Some(image_dir) = &self.options.image_dir {
            let name = image.replace([':', '/'], "-");
            let local = Path::new(image_dir).join(format!("{name}.sif"));
            if local.is_file() {
                return local.display().to_string();
            }
        }
        image.to_string()
    }
}

impl Backend for SingularityBackend {
    fn name(&self) -> &'static str {
        "singularity"
    }

    fn is_available(&self) -> bool {
        self.executable().is_some()
    }

    fn get_status(&self) -> String {
        match self.executable() {
            Some(path) => format!("OK ({path})"),
            None => "singularity/apptainer binary not found".to_string(),
        }
    }

    fn requires_container_image(&self) -> bool {
        true
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
        let executable = self
            .executable()
            .ok_or_else(|| backend_error("singularity/apptainer binary not found"))?;
        let image = cab
            .image
            .as_ref()
            .ok_or_else(|| backend_error(format!("cab '{}' has no image defined", cab.name())))?;

        let prior: IndexMap<String, bool> = IndexMap::new();
        let required =
            mounts::resolve_required_mounts(params, &cab.cargo.inputs, &cab.cargo.outputs, &prior)?;

        let mut args = vec![executable, "exec".to_string(), "--containall".to_string()];
        for bind in &self.options.bind {
            args.push("--bind".to_string());
            args.push(bind.clone());
        }
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        args.push("--bind".to_string());
        args.push(format!("{cwd}:{cwd}:rw"));
        args.push("--pwd".to_string());
        args.push(cwd);
        for (path, readwrite) in &required {
            args.push("--bind".to_string());
            args.push(format!("{path}:{path}:{}", if *readwrite { "rw" } else { "ro" }));
        }
        args.push(self.resolve_image(image));

        // the payload command is not searched on the host PATH
        let (payload, payload_logged) = cab.get_arguments(params, ns, ctx, false)?;
        let mut log_args = args.clone();
        log_args.extend(payload_logged);
        args.extend(payload);

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

        if retcode != 0 && status.success() != Some(true) {
            status.declare_failure(crate::errors::cab_runtime_error(format!(
                "{command_name} returned non-zero exit status {retcode}"
            )));
        }
        super::native::run_cleanup(cab, log);
        Ok(status)
    }

    fn build(
        &self,
        cab: &Cab,
        _options: &BackendOptions,
        log: &RunLog,
        rebuild: bool,
        wrapper: &dyn BackendWrapper,
    ) -> Result<()> {
        let executable = self
            .executable()
            .ok_or_else(|| backend_error("singularity/apptainer binary not found"))?;
        let image = cab
            .image
            .as_ref()
            .ok_or_else(|| backend_error(format!("cab '{}' has no image defined", cab.name())))?;
        let image_dir = self
            .options
            .image_dir
            .as_ref()
            .ok_or_else(|| backend_error("singularity.image_dir is not set, can't build images"))?;
        std::fs::create_dir_all(image_dir)
            .map_err(|exc| backend_error(format!("cannot create {image_dir}: {exc}")))?;

        let name = image.replace([':', '/'], "-");
        let target = Path::new(image_dir).join(format!("{name}.sif"));
        if target.is_file() && !rebuild {
            log.info(format!("image {} already built", target.display()));
            return Ok(());
        }
        let source = if image.contains("://") {
            image.clone()
        } else {
            format!("docker://{image}")
        };
        let args = vec![
            executable,
            "build".to_string(),
            "--force".to_string(),
            target.display().to_string(),
            source,
        ];
        let (args, _) = wrapper.wrap_build_command(args, &cab.cargo.fqname, log)?;

        let mut status = RuntimeStatus::new(Vec::new());
        let retcode = xrun(
            &args,
            "singularity build",
            log,
            &mut status,
            &IndexMap::new(),
            &IndexMap::new(),
            true,
        )?;
        if retcode != 0 {
            return Err(backend_error(format!(
                "image build for '{image}' failed with exit status {retcode}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_resolution_prefers_local_sif() {
        let dir = tempfile::tempdir().unwrap();
        let sif = dir.path().join("repo-tool-1.0.sif");
        std::fs::write(&sif, "").unwrap();
        let backend = SingularityBackend::new(SingularityOptions {
            image_dir: Some(dir.path().display().to_string()),
            ..SingularityOptions::default()
        });
        assert_eq!(backend.resolve_image("repo/tool:1.0"), sif.display().to_string());
        assert_eq!(backend.resolve_image("other/tool:2.0"), "other/tool:2.0");
    }

    #[test]
    fn requires_image_flag() {
        let backend = SingularityBackend::new(SingularityOptions::default());
        assert!(backend.requires_container_image());
    }
}
