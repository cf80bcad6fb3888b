use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::deps::ConfigDeps;

/// Content-addressed cache of merged configurations, keyed by the file set
/// plus extra keys (package version). Writes take an advisory lock and are
/// atomic-by-rename, so concurrent runs can share the cache directory.
#[derive(Debug, Clone)]
pub struct ConfigCache {
    pub dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    conf: YamlValue,
    deps: ConfigDeps,
}

fn compute_hash(filelist: &[&Path], extra_keys: &[String]) -> String {
    let mut parts: Vec<String> = filelist.iter().map(|p| p.display().to_string()).collect();
    parts.extend(extra_keys.iter().cloned());
    let mut hasher = Sha256::new();
    hasher.update(parts.join(" ").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn file_mtime(path: &Path) -> Option<f64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs_f64())
}

impl ConfigCache {
    /// Resolves the cache directory: $CONFIGURATT_CACHE_DIR, else
    /// ~/.cache/stimela-configs.
    pub fn default_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("CONFIGURATT_CACHE_DIR") {
            return PathBuf::from(dir);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Path::new(&home).join(".cache").join("stimela-configs")
    }

    pub fn new(dir: PathBuf) -> Self {
        ConfigCache { dir }
    }

    pub fn load(
        &self,
        filelist: &[&Path],
        extra_keys: &[String],
    ) -> Option<(YamlValue, ConfigDeps)> {
        let filename = self.dir.join(compute_hash(filelist, extra_keys));
        if !filename.exists() {
            return None;
        }
        let cache_mtime = file_mtime(&filename)?;
        // all source files must be older than the cache
        for f in filelist {
            if file_mtime(f).unwrap_or(f64::MAX) > cache_mtime {
                return None;
            }
        }
        let content = std::fs::read_to_string(&filename).ok()?;
        let record: CacheRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(_) => {
                // unreadable cache entries are dropped
                let _ = std::fs::remove_file(&filename);
                return None;
            }
        };
        if record.deps.have_deps_changed(cache_mtime) {
            return None;
        }
        Some((record.conf, record.deps))
    }

    pub fn save(
        &self,
        filelist: &[&Path],
        extra_keys: &[String],
        conf: &YamlValue,
        deps: &ConfigDeps,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let filename = self.dir.join(compute_hash(filelist, extra_keys));
        let record = CacheRecord { conf: conf.clone(), deps: deps.clone() };
        let content = serde_json::to_string(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let lock_path = self.dir.join(".lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;
        let result = (|| {
            let tmp = filename.with_extension(format!("tmp.{}", std::process::id()));
            std::fs::write(&tmp, &content)?;
            std::fs::rename(&tmp, &filename)
        })();
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    pub fn clear(&self) -> std::io::Result<usize> {
        if !self.dir.is_dir() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name() == ".lock" {
                continue;
            }
            std::fs::remove_file(entry.path())?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("conf.yml");
        std::fs::write(&source, "a: 1\n").unwrap();

        let cache = ConfigCache::new(dir.path().join("cache"));
        let conf: YamlValue = serde_yaml::from_str("a: 1").unwrap();
        let mut deps = ConfigDeps::new();
        deps.add(&source);

        cache.save(&[&source], &[], &conf, &deps).unwrap();
        let (loaded, _) = cache.load(&[&source], &[]).unwrap();
        assert_eq!(loaded, conf);
    }

    #[test]
    fn touching_dependency_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("conf.yml");
        std::fs::write(&source, "a: 1\n").unwrap();

        let cache = ConfigCache::new(dir.path().join("cache"));
        let conf: YamlValue = serde_yaml::from_str("a: 1").unwrap();
        let mut deps = ConfigDeps::new();
        deps.add(&source);
        cache.save(&[&source], &[], &conf, &deps).unwrap();
        assert!(cache.load(&[&source], &[]).is_some());

        // push the source mtime past the cache file's
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let file = std::fs::OpenOptions::new().write(true).open(&source).unwrap();
        file.set_times(std::fs::FileTimes::new().set_modified(future)).unwrap();
        assert!(cache.load(&[&source], &[]).is_none());
    }

    #[test]
    fn extra_keys_partition_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("conf.yml");
        std::fs::write(&source, "a: 1\n").unwrap();

        let cache = ConfigCache::new(dir.path().join("cache"));
        let conf: YamlValue = serde_yaml::from_str("a: 1").unwrap();
        let deps = ConfigDeps::new();
        cache.save(&[&source], &["v1".to_string()], &conf, &deps).unwrap();
        assert!(cache.load(&[&source], &["v1".to_string()]).is_some());
        assert!(cache.load(&[&source], &["v2".to_string()]).is_none());
    }
}
