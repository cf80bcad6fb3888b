use chrono::{DateTime, Local};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

/// Git state of the directory a dependency lives in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitInfo {
    pub branch: Option<String>,
    pub describe: Option<String>,
}

/// Record of one file (or directory) a loaded configuration depends on.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DepInfo {
    pub mtime: f64,
    pub mtime_str: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
}

/// Record of an optional include that could not be resolved. Kept so the
/// cache is invalidated if the file appears later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRecord {
    pub filename: String,
    pub origin: String,
    #[serde(default)]
    pub warn: bool,
}

// git lookups are slow enough to be worth caching per directory
static GIT_CACHE: Lazy<Mutex<HashMap<PathBuf, Option<GitInfo>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn git_info_for(dirname: &Path) -> Option<GitInfo> {
    let mut cache = GIT_CACHE.lock().unwrap();
    if let Some(info) = cache.get(dirname) {
        return info.clone();
    }
    let info = (|| {
        let repo = git2::Repository::discover(dirname).ok()?;
        let head = repo.head().ok()?;
        let branch = if head.is_branch() {
            head.shorthand().map(|s| s.to_string())
        } else {
            Some("detached".to_string())
        };
        let describe = head.peel_to_commit().ok().map(|commit| {
            let oid = commit.id().to_string();
            format!("{}@{}", branch.as_deref().unwrap_or("unknown"), &oid[..12.min(oid.len())])
        });
        Some(GitInfo { branch, describe })
    })();
    cache.insert(dirname.to_path_buf(), info.clone());
    info
}

fn file_mtime(path: &Path) -> Option<f64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(secs.as_secs_f64())
}

fn mtime_string(path: &Path) -> String {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| DateTime::<Local>::from(t).format("%c").to_string())
        .unwrap_or_else(|_| "n/a".to_string())
}

/// The set of files a merged configuration was built from, with enough
/// fingerprint information to decide whether a cached merge is still valid.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigDeps {
    pub deps: IndexMap<String, DepInfo>,
    pub fails: IndexMap<String, FailRecord>,
}

impl ConfigDeps {
    pub fn new() -> Self {
        ConfigDeps::default()
    }

    pub fn add(&mut self, filename: &Path) {
        self.add_with_version(filename, None);
    }

    pub fn add_with_version(&mut self, filename: &Path, version: Option<String>) {
        let abs = filename
            .canonicalize()
            .unwrap_or_else(|_| filename.to_path_buf());
        let key = abs.display().to_string();
        if self.deps.contains_key(&key) {
            return;
        }
        let mut info = DepInfo { version, ..DepInfo::default() };
        if !abs.exists() {
            info.mtime = 0.0;
            info.mtime_str = "n/a".to_string();
            self.deps.insert(key, info);
            return;
        }
        info.mtime = file_mtime(&abs).unwrap_or(0.0);
        info.mtime_str = mtime_string(&abs);
        if abs.is_file() {
            if let Ok(content) = std::fs::read(&abs) {
                let mut hasher = Sha256::new();
                hasher.update(&content);
                info.hash = Some(format!("{:x}", hasher.finalize()));
            }
        }
        let dirname = if abs.is_dir() { abs.clone() } else { abs.parent().map(Path::to_path_buf).unwrap_or(abs.clone()) };
        info.git = git_info_for(&dirname);
        self.deps.insert(key, info);
    }

    pub fn add_fail(&mut self, filename: String, origin: String, warn: bool) {
        self.fails
            .insert(filename.clone(), FailRecord { filename, origin, warn });
    }

    pub fn update(&mut self, other: ConfigDeps) {
        for (name, info) in other.deps {
            self.deps.entry(name).or_insert(info);
        }
        for (name, fail) in other.fails {
            self.fails.entry(name).or_insert(fail);
        }
    }

    /// True if any dependency is missing or newer than the given cache
    /// mtime, or if a previously-failing include would now resolve.
    pub fn have_deps_changed(&self, cache_mtime: f64) -> bool {
        for name in self.deps.keys() {
            let path = Path::new(name);
            if !path.exists() {
                return true;
            }
            if file_mtime(path).unwrap_or(f64::MAX) > cache_mtime {
                return true;
            }
        }
        for fail in self.fails.values() {
            if Path::new(&fail.filename).exists() {
                return true;
            }
        }
        false
    }

    /// Writes the dependency list in YAML form (the per-run deps file).
    pub fn save(&self, filename: &Path) -> std::io::Result<()> {
        let text = serde_yaml::to_string(&self.deps).unwrap_or_default();
        std::fs::write(filename, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_records_mtime_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conf.yml");
        std::fs::write(&file, "a: 1\n").unwrap();
        let mut deps = ConfigDeps::new();
        deps.add(&file);
        let info = deps.deps.values().next().unwrap();
        assert!(info.mtime > 0.0);
        assert!(info.hash.is_some());
    }

    #[test]
    fn changed_mtime_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conf.yml");
        std::fs::write(&file, "a: 1\n").unwrap();
        let mut deps = ConfigDeps::new();
        deps.add(&file);
        // a cache stamped far in the future is valid, one in the past is not
        assert!(!deps.have_deps_changed(f64::MAX));
        assert!(deps.have_deps_changed(0.0));
    }

    #[test]
    fn resolved_failure_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("optional.yml");
        let mut deps = ConfigDeps::new();
        deps.add_fail(missing.display().to_string(), "parent.yml".to_string(), false);
        assert!(!deps.have_deps_changed(f64::MAX));
        std::fs::write(&missing, "x: 1\n").unwrap();
        assert!(deps.have_deps_changed(f64::MAX));
    }
}
