use indexmap::IndexMap;
use std::path::{Path, PathBuf};

use crate::basetypes::PValue;
use crate::errors::{Result, schema_error};
use crate::schema::{Parameter, get_filelikes};

/// Resolves the set of host paths a containerised cab invocation must have
/// mounted, mapping path -> read-write flag. Follows symlinks (both the
/// target and the link's parent directory get mounted), mounts the parent of
/// paths that do not exist yet (outputs to be created), and eliminates
/// mounts already covered by an equally-writable parent mount.
pub fn resolve_required_mounts(
    params: &IndexMap<String, PValue>,
    inputs: &IndexMap<String, Parameter>,
    outputs: &IndexMap<String, Parameter>,
    prior_mounts: &IndexMap<String, bool>,
) -> Result<IndexMap<String, bool>> {
    let mut targets: IndexMap<String, bool> = IndexMap::new();

    for (name, value) in params {
        if value.is_marker() {
            continue;
        }
        let Some(schema) = inputs.get(name).or_else(|| outputs.get(name)) else {
            return Err(schema_error(format!(
                "parameter {name} not in defined inputs or outputs for this cab"
            )));
        };
        if !schema.dtype.is_path_type() && !schema.dtype.is_path_list_type() {
            continue;
        }
        let mut files = Vec::new();
        get_filelikes(&schema.dtype, value, &mut files);
        if files.is_empty() {
            if let PValue::Str(s) = value {
                files.push(s.clone());
            }
        }

        let must_exist = schema.must_exist.unwrap_or(schema.is_input);
        let readwrite = schema.writable || schema.is_output();

        for path in files {
            if path.is_empty() {
                continue;
            }
            add_target(&mut targets, Path::new(&path), must_exist, readwrite)?;
        }
    }

    // drop targets covered by an at-least-as-writable parent mount
    let mut skip: Vec<String> = Vec::new();
    for (path, readwrite) in &targets {
        let mut parent = Path::new(path).parent();
        while let Some(dir) = parent {
            if dir == Path::new("/") || dir.as_os_str().is_empty() {
                break;
            }
            let key = dir.display().to_string();
            let covered = targets.get(&key).copied().unwrap_or(false)
                || prior_mounts.get(&key).copied().unwrap_or(false);
            let present =
                targets.contains_key(&key) || prior_mounts.contains_key(&key);
            if present && (covered || !readwrite) {
                skip.push(path.clone());
                break;
            }
            parent = dir.parent();
        }
    }
    for path in skip {
        targets.shift_remove(&path);
    }

    Ok(targets)
}

fn add_target(
    targets: &mut IndexMap<String, bool>,
    path: &Path,
    must_exist: bool,
    readwrite: bool,
) -> Result<()> {
    if must_exist && !path.exists() {
        return Err(schema_error(format!("{} does not exist", path.display())));
    }
    let abs = absolute(path);

    if abs.symlink_metadata().is_err() {
        // path doesn't exist yet: mount the parent read-write so the file
        // can be created in it
        if let Some(parent) = abs.parent() {
            add_target(targets, parent, true, true)?;
        }
        return Ok(());
    }

    let key = abs.display().to_string();
    if let Some(existing) = targets.get_mut(&key) {
        *existing = *existing || readwrite;
        return Ok(());
    }

    if abs.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
        // the link target must be mounted, and the parent dir read-only so
        // the link itself resolves
        if let Ok(real) = abs.canonicalize() {
            add_target(targets, &real, must_exist, readwrite)?;
        }
        if let Some(parent) = abs.parent() {
            add_target(targets, parent, true, false)?;
        }
    } else {
        targets.insert(key, readwrite);
    }
    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_dtype;

    fn file_param(required: bool, is_input: bool) -> Parameter {
        Parameter {
            dtype: parse_dtype("File").unwrap(),
            dtype_str: "File".to_string(),
            required: Some(required),
            is_input,
            ..Parameter::default()
        }
    }

    #[test]
    fn inputs_mount_readonly_outputs_readwrite() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "x").unwrap();
        let outdir = dir.path().join("out");
        std::fs::create_dir(&outdir).unwrap();
        let output = outdir.join("result.txt");

        let mut inputs = IndexMap::new();
        inputs.insert("src".to_string(), file_param(true, true));
        let mut outputs = IndexMap::new();
        outputs.insert("dest".to_string(), file_param(false, false));

        let mut params = IndexMap::new();
        params.insert("src".to_string(), PValue::Str(input.display().to_string()));
        params.insert("dest".to_string(), PValue::Str(output.display().to_string()));

        let mounts =
            resolve_required_mounts(&params, &inputs, &outputs, &IndexMap::new()).unwrap();
        let canon_input = input.canonicalize().unwrap().display().to_string();
        let canon_outdir = outdir.canonicalize().unwrap().display().to_string();
        // tmpdir may itself be behind a symlink; compare canonicalised
        let mounts: IndexMap<String, bool> = mounts
            .into_iter()
            .map(|(k, v)| {
                (PathBuf::from(k).canonicalize().unwrap().display().to_string(), v)
            })
            .collect();
        assert_eq!(mounts.get(&canon_input), Some(&false));
        // the output file doesn't exist, so its parent is mounted writable
        assert_eq!(mounts.get(&canon_outdir), Some(&true));
    }

    #[test]
    fn missing_required_input_raises() {
        let mut inputs = IndexMap::new();
        inputs.insert("src".to_string(), file_param(true, true));
        let mut params = IndexMap::new();
        params.insert("src".to_string(), PValue::Str("/no/such/file.txt".into()));
        assert!(
            resolve_required_mounts(&params, &inputs, &IndexMap::new(), &IndexMap::new()).is_err()
        );
    }

    #[test]
    fn redundant_child_mounts_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = sub.join("x.txt");
        std::fs::write(&file, "x").unwrap();

        let mut inputs = IndexMap::new();
        let mut dir_param = Parameter {
            dtype: parse_dtype("Directory").unwrap(),
            dtype_str: "Directory".to_string(),
            is_input: true,
            ..Parameter::default()
        };
        dir_param.writable = true;
        inputs.insert("workdir".to_string(), dir_param);
        inputs.insert("src".to_string(), file_param(true, true));

        let mut params = IndexMap::new();
        params.insert("workdir".to_string(), PValue::Str(sub.display().to_string()));
        params.insert("src".to_string(), PValue::Str(file.display().to_string()));

        let mounts =
            resolve_required_mounts(&params, &inputs, &IndexMap::new(), &IndexMap::new()).unwrap();
        // the file is covered by the writable parent mount
        assert_eq!(mounts.len(), 1);
        assert!(mounts.values().next().unwrap());
    }

    #[test]
    fn symlinks_mount_target_and_link_parent() {
        let dir = tempfile::tempdir().unwrap();
        let real_dir = dir.path().join("real");
        std::fs::create_dir(&real_dir).unwrap();
        let real = real_dir.join("data.txt");
        std::fs::write(&real, "x").unwrap();
        let link_dir = dir.path().join("links");
        std::fs::create_dir(&link_dir).unwrap();
        let link = link_dir.join("data.txt");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut inputs = IndexMap::new();
        inputs.insert("src".to_string(), file_param(true, true));
        let mut params = IndexMap::new();
        params.insert("src".to_string(), PValue::Str(link.display().to_string()));

        let mounts =
            resolve_required_mounts(&params, &inputs, &IndexMap::new(), &IndexMap::new()).unwrap();
        let keys: Vec<PathBuf> = mounts.keys().map(PathBuf::from).collect();
        assert!(keys.iter().any(|k| k.ends_with("real/data.txt") || k == &real.canonicalize().unwrap()));
        assert!(keys.iter().any(|k| k.ends_with("links")));
    }
}
