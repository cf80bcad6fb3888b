pub mod cache;
pub mod deps;

use indexmap::IndexMap;
use rayon::prelude::*;
use regex::Regex;
use serde_yaml::{Mapping, Value as YamlValue};
use std::path::{Path, PathBuf};

use crate::basetypes::yaml_key_to_string;
use crate::errors::{ErrorKind, Result, StimelaError, config_error};
use crate::substitutions::wildcard_match;
use cache::ConfigCache;
use deps::ConfigDeps;

pub const IMPLICIT_EXTENSIONS: &[&str] = &[".yml", ".yaml"];

/// Removes a key from a mapping, returning its value.
pub fn pop_conf(map: &mut Mapping, key: &str) -> Option<YamlValue> {
    map.remove(YamlValue::String(key.to_string()))
}

/// Deep merge: mappings merge key-by-key with the overlay winning, anything
/// else is replaced by the overlay.
pub fn merge_yaml(base: &mut YamlValue, overlay: &YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Looks up a dotted name in an ordered list of sources; first full match
/// wins.
pub fn lookup_name(name: &str, sources: &[YamlValue]) -> Result<YamlValue> {
    for source in sources {
        let mut current = source;
        let mut found = true;
        for part in name.split('.') {
            match current {
                YamlValue::Mapping(map) => match map.get(YamlValue::String(part.to_string())) {
                    Some(value) => current = value,
                    None => {
                        found = false;
                        break;
                    }
                },
                _ => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            return Ok(current.clone());
        }
    }
    Err(config_error(format!("unknown key {name}")))
}

/// Removes named subsections (dotted, `*`/`?` patterns allowed) from a
/// config.
pub fn scrub_subsections(conf: &mut YamlValue, scrubs: &[String]) -> Result<()> {
    let YamlValue::Mapping(map) = conf else {
        return Ok(());
    };
    for scrub in scrubs {
        let (name, remainder) = match scrub.split_once('.') {
            Some((n, r)) => (n.to_string(), Some(r.to_string())),
            None => (scrub.clone(), None),
        };
        let is_pattern = name.contains('*') || name.contains('?');
        let matches: Vec<YamlValue> = map
            .keys()
            .filter(|k| wildcard_match(&name, &yaml_key_to_string(k)))
            .cloned()
            .collect();
        if matches.is_empty() {
            if is_pattern {
                continue;
            }
            return Err(config_error(format!("no entry matching '{name}'")));
        }
        for key in matches {
            match &remainder {
                Some(rest) => {
                    if let Some(sub) = map.get_mut(&key) {
                        if matches!(sub, YamlValue::Mapping(_)) {
                            scrub_subsections(sub, &[rest.clone()])?;
                        } else if !is_pattern {
                            return Err(config_error(format!(
                                "'{name}' does not refer to a subsection"
                            )));
                        }
                    }
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }
    Ok(())
}

/// Layered YAML loader: resolves `_include`/`_use` directives (and their
/// `_post` and `_scrub` companions), tracks file dependencies, and caches
/// merged results.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// search path for relative _include specifiers (after "." and the
    /// including file's directory)
    pub include_paths: Vec<PathBuf>,
    /// resolution table for "(module)/file.yaml" includes
    pub module_paths: IndexMap<String, PathBuf>,
    pub cache: Option<ConfigCache>,
    /// stored with cache records so upgrades invalidate them
    pub package_version: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        let mut include_paths = Vec::new();
        if let Ok(env_paths) = std::env::var("STIMELA_INCLUDE") {
            for p in env_paths.split(':').filter(|p| !p.is_empty()) {
                include_paths.push(PathBuf::from(crate::basetypes::expanduser(p)));
            }
        }
        ConfigLoader {
            include_paths,
            module_paths: IndexMap::new(),
            cache: None,
            package_version: format!("stimela=={}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_cache(mut self) -> Self {
        self.cache = Some(ConfigCache::new(ConfigCache::default_dir()));
        self
    }

    /// Loads a config file, resolving its directives. `use_sources` are
    /// previously-loaded configs consulted by `_use` references (the file
    /// itself is consulted first when `selfrefs`).
    pub fn load(
        &self,
        path: &Path,
        use_sources: Option<&[YamlValue]>,
        name: Option<&str>,
        location: Option<&str>,
        includes: bool,
        selfrefs: bool,
        include_stack: &[PathBuf],
    ) -> Result<(YamlValue, ConfigDeps)> {
        let use_cache = include_stack.is_empty();
        if use_cache {
            if let Some(cache) = &self.cache {
                if let Some((conf, deps)) =
                    cache.load(&[path], &[self.package_version.clone()])
                {
                    return Ok((conf, deps));
                }
            }
        }

        let text = std::fs::read_to_string(path)
            .map_err(|exc| config_error(format!("can't read {}: {exc}", path.display())))?;
        let text = apply_self_resolver(&text, path);
        let subconf: YamlValue = serde_yaml::from_str(&text)
            .map_err(|exc| config_error(format!("error parsing {}: {exc}", path.display())))?;

        let name = name
            .map(|n| n.to_string())
            .unwrap_or_else(|| crate::basetypes::basename(&path.display().to_string()));
        let mut dependencies = ConfigDeps::new();
        dependencies.add(path);

        let mut sources: Option<Vec<YamlValue>> = match use_sources {
            None => None,
            Some(existing) => {
                let mut srcs = Vec::new();
                if selfrefs {
                    srcs.push(subconf.clone());
                }
                srcs.extend(existing.iter().cloned());
                Some(srcs)
            }
        };

        let mut stack = include_stack.to_vec();
        stack.push(path.to_path_buf());

        let mut resolver = RefResolver { loader: self, deps: ConfigDeps::new() };
        let conf = resolver.resolve(
            subconf,
            path,
            location.unwrap_or(""),
            &name,
            includes,
            sources.as_mut(),
            selfrefs,
            &stack,
            0,
        )?;
        dependencies.update(resolver.deps);

        if use_cache {
            if let Some(cache) = &self.cache {
                let _ = cache.save(&[path], &[self.package_version.clone()], &conf, &dependencies);
            }
        }

        Ok((conf, dependencies))
    }

    /// Loads many files as named sections of a larger mapping. Section names
    /// come from the file basename, or from the named field of each file's
    /// content. Files are parsed in parallel.
    pub fn load_nested(
        &self,
        filelist: &[PathBuf],
        location: Option<&str>,
        nameattr: Option<&str>,
    ) -> Result<(YamlValue, ConfigDeps)> {
        let loaded: Vec<Result<(String, YamlValue, ConfigDeps)>> = filelist
            .par_iter()
            .map(|path| {
                let (conf, deps) = self.load(path, Some(&[]), None, location, true, true, &[])?;
                let name = match nameattr {
                    None => {
                        let base = crate::basetypes::basename(&path.display().to_string());
                        crate::basetypes::strip_extension(&base)
                    }
                    Some(attr) => match &conf {
                        YamlValue::Mapping(map) => map
                            .get(YamlValue::String(attr.to_string()))
                            .map(yaml_key_to_string)
                            .ok_or_else(|| {
                                config_error(format!(
                                    "{} does not contain a '{attr}' field",
                                    path.display()
                                ))
                            })?,
                        _ => {
                            return Err(config_error(format!(
                                "{} is not a mapping",
                                path.display()
                            )));
                        }
                    },
                };
                Ok((name, conf, deps))
            })
            .collect();

        let mut sections = Mapping::new();
        let mut dependencies = ConfigDeps::new();
        for item in loaded {
            let (name, conf, deps) = item?;
            sections.insert(YamlValue::String(name), conf);
            dependencies.update(deps);
        }
        Ok((YamlValue::Mapping(sections), dependencies))
    }
}

/// Walks a config tree for `_requires`/`_contingent` keys. Contingent
/// sections whose requirements are unmet are deleted; unmet hard
/// requirements are returned as (location, requirement, error) records and
/// raised together in strict mode.
pub fn check_requirements(
    conf: &mut YamlValue,
    strict: bool,
) -> Result<Vec<(String, String, StimelaError)>> {
    let snapshot = conf.clone();
    let mut unmet = Vec::new();
    walk_requirements(conf, &snapshot, "", &mut unmet);
    if strict && !unmet.is_empty() {
        let nested: Vec<StimelaError> = unmet.iter().map(|(_, _, e)| e.clone()).collect();
        return Err(StimelaError::with_nested(
            ErrorKind::Config,
            "configuration has missing requirements",
            nested,
        ));
    }
    Ok(unmet)
}

fn requirement_names(value: YamlValue) -> Vec<String> {
    match value {
        YamlValue::String(s) => vec![s],
        YamlValue::Sequence(seq) => seq.iter().map(yaml_key_to_string).collect(),
        _ => Vec::new(),
    }
}

/// Returns true if the section should be deleted (unmet contingency).
fn walk_requirements(
    conf: &mut YamlValue,
    root: &YamlValue,
    location: &str,
    unmet: &mut Vec<(String, String, StimelaError)>,
) -> bool {
    let YamlValue::Mapping(map) = conf else {
        return false;
    };
    if let Some(reqs) = pop_conf(map, "_requires") {
        for req in requirement_names(reqs) {
            if lookup_name(&req, std::slice::from_ref(root)).is_err() {
                unmet.push((
                    location.to_string(),
                    req.clone(),
                    config_error(format!(
                        "requirement '{req}' not met for section '{location}'"
                    )),
                ));
            }
        }
    }
    if let Some(reqs) = pop_conf(map, "_contingent") {
        for req in requirement_names(reqs) {
            if lookup_name(&req, std::slice::from_ref(root)).is_err() {
                return true;
            }
        }
    }
    let keys: Vec<YamlValue> = map.keys().cloned().collect();
    for key in keys {
        let child_loc = if location.is_empty() {
            yaml_key_to_string(&key)
        } else {
            format!("{location}.{}", yaml_key_to_string(&key))
        };
        let delete = match map.get_mut(&key) {
            Some(child) => walk_requirements(child, root, &child_loc, unmet),
            None => false,
        };
        if delete {
            map.remove(&key);
        }
    }
    false
}

/// Replaces ${self:...} interpolations with properties of the file being
/// loaded.
fn apply_self_resolver(text: &str, path: &Path) -> String {
    let pathstr = path.display().to_string();
    text.replace("${self:path}", &pathstr)
        .replace("${self:dirname}", &crate::basetypes::dirname(&pathstr))
        .replace("${self:basename}", &crate::basetypes::basename(&pathstr))
}

struct RefResolver<'a> {
    loader: &'a ConfigLoader,
    deps: ConfigDeps,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct IncludeFlags {
    warn: bool,
    optional: bool,
}

impl<'a> RefResolver<'a> {
    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &mut self,
        conf: YamlValue,
        pathname: &Path,
        location: &str,
        name: &str,
        includes: bool,
        mut sources: Option<&mut Vec<YamlValue>>,
        selfrefs: bool,
        include_stack: &[PathBuf],
        depth: usize,
    ) -> Result<YamlValue> {
        let errloc = format!(
            "config error at {} in {name}",
            if location.is_empty() { "top level" } else { location }
        );
        if depth > 20 {
            return Err(config_error(format!(
                "{errloc}: recursion limit exceeded, check your _use and _include statements"
            )));
        }

        let mut conf = conf;

        if let YamlValue::Mapping(_) = conf {
            let mut rounds = 0;
            loop {
                let mut updated = false;
                rounds += 1;
                if rounds > 20 {
                    return Err(config_error(format!(
                        "{errloc}: recursion limit exceeded, check your _use and _include statements"
                    )));
                }

                if includes {
                    let accum_pre = self.load_include_files(
                        &mut conf,
                        "_include",
                        pathname,
                        location,
                        name,
                        &errloc,
                        include_stack,
                    )?;
                    let accum_post = self.load_include_files(
                        &mut conf,
                        "_include_post",
                        pathname,
                        location,
                        name,
                        &errloc,
                        include_stack,
                    )?;
                    if accum_pre.is_some() || accum_post.is_some() {
                        // our own keys override pre-includes, post-includes
                        // override our keys
                        let mut merged = accum_pre.unwrap_or(YamlValue::Mapping(Mapping::new()));
                        merge_yaml(&mut merged, &conf);
                        if let Some(post) = accum_post {
                            merge_yaml(&mut merged, &post);
                        }
                        conf = merged;
                        updated = true;
                    }
                    if selfrefs {
                        if let Some(srcs) = sources.as_deref_mut() {
                            if let Some(first) = srcs.first_mut() {
                                *first = conf.clone();
                            }
                        }
                    }
                }

                if let Some(srcs) = sources.as_deref_mut() {
                    if let Some(mut base) = self.load_use_sections(
                        &mut conf,
                        "_use",
                        pathname,
                        location,
                        name,
                        &errloc,
                        srcs,
                        include_stack,
                        depth,
                    )? {
                        merge_yaml(&mut base, &conf);
                        conf = base;
                    }
                    if let Some(post) = self.load_use_sections(
                        &mut conf,
                        "_use_post",
                        pathname,
                        location,
                        name,
                        &errloc,
                        srcs,
                        include_stack,
                        depth,
                    )? {
                        merge_yaml(&mut conf, &post);
                    }
                    if selfrefs {
                        if let Some(first) = srcs.first_mut() {
                            *first = conf.clone();
                        }
                    }
                }

                if !updated {
                    break;
                }
            }

            // recurse into subsections
            let YamlValue::Mapping(map) = &mut conf else { unreachable!() };
            let keys: Vec<YamlValue> = map.keys().cloned().collect();
            for key in keys {
                let child = map.get(&key).cloned().unwrap();
                if matches!(child, YamlValue::Mapping(_) | YamlValue::Sequence(_)) {
                    let child_loc = if location.is_empty() {
                        yaml_key_to_string(&key)
                    } else {
                        format!("{location}.{}", yaml_key_to_string(&key))
                    };
                    let resolved = self.resolve(
                        child,
                        pathname,
                        &child_loc,
                        name,
                        includes,
                        sources.as_deref_mut(),
                        false,
                        include_stack,
                        depth + 1,
                    )?;
                    map.insert(key, resolved);
                }
            }
        } else if let YamlValue::Sequence(seq) = conf {
            let mut out = Vec::with_capacity(seq.len());
            for (i, child) in seq.into_iter().enumerate() {
                if matches!(child, YamlValue::Mapping(_) | YamlValue::Sequence(_)) {
                    out.push(self.resolve(
                        child,
                        pathname,
                        &format!("{location}[{i}]"),
                        name,
                        includes,
                        sources.as_deref_mut(),
                        false,
                        include_stack,
                        depth + 1,
                    )?);
                } else {
                    out.push(child);
                }
            }
            conf = YamlValue::Sequence(out);
        }

        Ok(conf)
    }

    /// Pops and processes one _include/_include_post directive, returning the
    /// accumulated merged content of all included files (later includes
    /// override earlier ones), scrubbed per the matching _scrub directive.
    #[allow(clippy::too_many_arguments)]
    fn load_include_files(
        &mut self,
        conf: &mut YamlValue,
        keyword: &str,
        pathname: &Path,
        location: &str,
        name: &str,
        errloc: &str,
        include_stack: &[PathBuf],
    ) -> Result<Option<YamlValue>> {
        let YamlValue::Mapping(map) = conf else {
            return Ok(None);
        };
        let Some(directive) = pop_conf(map, keyword) else {
            return Ok(None);
        };
        let scrub_key = keyword.replace("include", "scrub");
        let scrub = pop_conf(map, &scrub_key).map(requirement_names);

        let mut include_files = Vec::new();
        collect_include_directive(&mut include_files, keyword, &directive, None, errloc)?;

        let mut accum = YamlValue::Mapping(Mapping::new());
        let mut any = false;

        for incl in include_files {
            if incl.is_empty() {
                return Err(config_error(format!("{errloc}: empty {keyword} specifier")));
            }
            let (incl, flags) = parse_include_flags(&incl);

            let Some(filename) = self.find_include(&incl, pathname, flags, errloc, keyword)? else {
                continue;
            };

            // recursive include check
            for prior in include_stack {
                if same_file(prior, &filename) {
                    return Err(config_error(format!(
                        "{errloc}: {} is included recursively",
                        filename.display()
                    )));
                }
            }

            let (incl_conf, deps) = self.loader.load(
                &filename,
                None, // _use statements in included files resolve later
                Some(&format!("{}, included from {name}", filename.display())),
                Some(location),
                true,
                false,
                include_stack,
            )?;
            self.deps.update(deps);
            self.deps.add(&filename);
            merge_yaml(&mut accum, &incl_conf);
            any = true;
        }

        if let Some(scrubs) = scrub {
            scrub_subsections(&mut accum, &scrubs)
                .map_err(|exc| exc.wrap(ErrorKind::Config, format!("{errloc}: error scrubbing")))?;
        }

        Ok(if any { Some(accum) } else { None })
    }

    /// Resolves one _include specifier to a file, honouring module-relative
    /// forms, absolute paths and the search path, with implicit .yml/.yaml
    /// extensions.
    fn find_include(
        &mut self,
        incl: &str,
        pathname: &Path,
        flags: IncludeFlags,
        errloc: &str,
        keyword: &str,
    ) -> Result<Option<PathBuf>> {
        static MODULE_RE: once_cell::sync::Lazy<Regex> =
            once_cell::sync::Lazy::new(|| Regex::new(r"^\((.+)\)/?(.+)$").unwrap());

        let try_with_extensions = |path: &Path| -> Option<PathBuf> {
            if path.extension().is_some() {
                return path.is_file().then(|| path.to_path_buf());
            }
            if path.is_file() {
                return Some(path.to_path_buf());
            }
            for ext in IMPLICIT_EXTENSIONS {
                let candidate = PathBuf::from(format!("{}{ext}", path.display()));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
            None
        };

        let mut fail = |filename: String, this: &mut Self| -> Result<Option<PathBuf>> {
            if flags.optional {
                this.deps.add_fail(filename.clone(), pathname.display().to_string(), flags.warn);
                if flags.warn {
                    crate::progress::log_progress(format!(
                        "phase=config status=warning optional-include-missing={filename}"
                    ));
                }
                Ok(None)
            } else {
                Err(config_error(format!("{errloc}: {keyword} {filename} does not exist")))
            }
        };

        if let Some(caps) = MODULE_RE.captures(incl) {
            let modulename = caps[1].to_string();
            let filename = caps[2].to_string();
            let base = if modulename.starts_with('.') {
                pathname
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join(&modulename)
            } else {
                match self.loader.module_paths.get(&modulename) {
                    Some(path) => path.clone(),
                    None => {
                        if flags.optional {
                            self.deps.add_fail(
                                incl.to_string(),
                                pathname.display().to_string(),
                                flags.warn,
                            );
                            return Ok(None);
                        }
                        return Err(config_error(format!(
                            "{errloc}: {keyword} {incl}: unknown module '{modulename}'"
                        )));
                    }
                }
            };
            return match try_with_extensions(&base.join(&filename)) {
                Some(found) => Ok(Some(found)),
                None => fail(base.join(&filename).display().to_string(), self),
            };
        }

        let path = Path::new(incl);
        if path.is_absolute() {
            return match try_with_extensions(path) {
                Some(found) => Ok(Some(found)),
                None => fail(incl.to_string(), self),
            };
        }

        let mut search: Vec<PathBuf> = vec![PathBuf::from(".")];
        if let Some(parent) = pathname.parent() {
            search.push(parent.to_path_buf());
        }
        search.extend(self.loader.include_paths.iter().cloned());
        for dir in &search {
            if let Some(found) = try_with_extensions(&dir.join(incl)) {
                return Ok(Some(found));
            }
        }
        fail(incl.to_string(), self)
    }

    /// Pops and processes one _use/_use_post directive: looks up the named
    /// sections in the sources, merges them, resolves their own references,
    /// and applies the matching _scrub.
    #[allow(clippy::too_many_arguments)]
    fn load_use_sections(
        &mut self,
        conf: &mut YamlValue,
        keyword: &str,
        pathname: &Path,
        location: &str,
        name: &str,
        errloc: &str,
        sources: &mut Vec<YamlValue>,
        include_stack: &[PathBuf],
        depth: usize,
    ) -> Result<Option<YamlValue>> {
        let YamlValue::Mapping(map) = conf else {
            return Ok(None);
        };
        let Some(directive) = pop_conf(map, keyword) else {
            return Ok(None);
        };
        let scrub_key = keyword.replace("use", "scrub");
        let scrub = pop_conf(map, &scrub_key).map(requirement_names);

        let section_names = match directive {
            YamlValue::String(s) => vec![s],
            YamlValue::Sequence(seq) => seq.iter().map(yaml_key_to_string).collect(),
            other => {
                return Err(config_error(format!(
                    "invalid {name}.{keyword} directive of type {other:?}"
                )));
            }
        };
        if section_names.is_empty() {
            return Ok(None);
        }

        let mut base: Option<YamlValue> = None;
        for section_name in &section_names {
            let section = lookup_name(section_name, sources)
                .map_err(|exc| exc.wrap(ErrorKind::Config, errloc.to_string()))?;
            match &mut base {
                None => base = Some(section),
                Some(existing) => merge_yaml(existing, &section),
            }
        }
        let base = base.unwrap();
        let sub_location = if location.is_empty() {
            keyword.to_string()
        } else {
            format!("{location}.{keyword}")
        };
        let mut resolved = self.resolve(
            base,
            pathname,
            &sub_location,
            name,
            true,
            Some(sources),
            false,
            include_stack,
            depth + 1,
        )?;
        if let Some(scrubs) = scrub {
            scrub_subsections(&mut resolved, &scrubs)
                .map_err(|exc| exc.wrap(ErrorKind::Config, format!("{errloc}: error scrubbing")))?;
        }
        Ok(Some(resolved))
    }
}

fn parse_include_flags(incl: &str) -> (String, IncludeFlags) {
    static FLAGS_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^(.*)\[(.*)\]$").unwrap());
    if let Some(caps) = FLAGS_RE.captures(incl) {
        let flags: Vec<String> = caps[2]
            .split(',')
            .map(|f| f.trim().to_ascii_lowercase())
            .collect();
        (
            caps[1].to_string(),
            IncludeFlags {
                warn: flags.iter().any(|f| f == "warn"),
                optional: flags.iter().any(|f| f == "optional"),
            },
        )
    } else {
        (incl.to_string(), IncludeFlags { warn: false, optional: false })
    }
}

/// Builds the list of include paths from a directive, which may be a string,
/// a list, or a nested mapping contributing path components.
fn collect_include_directive(
    out: &mut Vec<String>,
    keyword: &str,
    directive: &YamlValue,
    subpath: Option<&str>,
    errloc: &str,
) -> Result<()> {
    match directive {
        YamlValue::String(s) => {
            out.push(match subpath {
                Some(prefix) => format!("{prefix}/{s}"),
                None => s.clone(),
            });
            Ok(())
        }
        YamlValue::Sequence(seq) => {
            for item in seq {
                collect_include_directive(out, keyword, item, subpath, errloc)?;
            }
            Ok(())
        }
        YamlValue::Mapping(map) => {
            for (key, value) in map {
                let key = yaml_key_to_string(key);
                let nested = match subpath {
                    Some(prefix) => format!("{prefix}/{key}"),
                    None => key,
                };
                collect_include_directive(out, keyword, value, Some(&nested), errloc)?;
            }
            Ok(())
        }
        other => Err(config_error(format!(
            "{errloc}: {keyword} contains invalid entry of type {other:?}"
        ))),
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn get<'a>(conf: &'a YamlValue, path: &str) -> &'a YamlValue {
        let mut current = conf;
        for part in path.split('.') {
            current = &current[part];
        }
        current
    }

    #[test]
    fn include_merge_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.yml", "a: 1\nb: 2\n");
        let main = write(
            dir.path(),
            "main.yml",
            "_include: base.yml\nb: 3\nc: 4\n",
        );
        let loader = ConfigLoader::default();
        let (conf, deps) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        // enclosing file's keys override included keys
        assert_eq!(get(&conf, "a"), &YamlValue::from(1));
        assert_eq!(get(&conf, "b"), &YamlValue::from(3));
        assert_eq!(get(&conf, "c"), &YamlValue::from(4));
        assert_eq!(deps.deps.len(), 2);
    }

    #[test]
    fn include_post_overrides_enclosing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "override.yml", "b: 99\n");
        let main = write(dir.path(), "main.yml", "_include_post: override.yml\nb: 3\n");
        let loader = ConfigLoader::default();
        let (conf, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(get(&conf, "b"), &YamlValue::from(99));
    }

    #[test]
    fn implicit_extension_and_nested_directive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        write(&dir.path().join("sub"), "inner.yaml", "x: 1\n");
        let main = write(dir.path(), "main.yml", "_include:\n  sub: inner\n");
        let loader = ConfigLoader::default();
        let (conf, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(get(&conf, "x"), &YamlValue::from(1));
    }

    #[test]
    fn optional_include_records_failure() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(dir.path(), "main.yml", "_include: missing.yml [optional]\na: 1\n");
        let loader = ConfigLoader::default();
        let (conf, deps) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(get(&conf, "a"), &YamlValue::from(1));
        assert_eq!(deps.fails.len(), 1);
    }

    #[test]
    fn missing_include_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(dir.path(), "main.yml", "_include: missing.yml\n");
        let loader = ConfigLoader::default();
        assert!(loader.load(&main, Some(&[]), None, None, true, true, &[]).is_err());
    }

    #[test]
    fn recursive_include_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.yml", "_include: b.yml\n");
        write(dir.path(), "b.yml", "_include: a.yml\n");
        let loader = ConfigLoader::default();
        let err = loader
            .load(&dir.path().join("a.yml"), Some(&[]), None, None, true, true, &[])
            .unwrap_err();
        assert!(err.to_string().contains("recursive"), "{err}");
    }

    #[test]
    fn use_merges_base_under_section() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(
            dir.path(),
            "main.yml",
            r#"
base:
  image: generic
  mem: 4
job:
  _use: base
  mem: 8
"#,
        );
        let loader = ConfigLoader::default();
        let (conf, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(get(&conf, "job.image"), &YamlValue::from("generic"));
        assert_eq!(get(&conf, "job.mem"), &YamlValue::from(8));
    }

    #[test]
    fn use_post_overrides_section() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(
            dir.path(),
            "main.yml",
            r#"
base:
  mem: 4
job:
  _use_post: base
  mem: 8
"#,
        );
        let loader = ConfigLoader::default();
        let (conf, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(get(&conf, "job.mem"), &YamlValue::from(4));
    }

    #[test]
    fn use_with_scrub() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(
            dir.path(),
            "main.yml",
            r#"
base:
  keep: 1
  drop: 2
job:
  _use: base
  _scrub: drop
"#,
        );
        let loader = ConfigLoader::default();
        let (conf, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(get(&conf, "job.keep"), &YamlValue::from(1));
        assert!(get(&conf, "job").get("drop").is_none());
    }

    #[test]
    fn cyclic_use_terminates_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(
            dir.path(),
            "main.yml",
            r#"
a:
  _use: b
b:
  _use: a
"#,
        );
        let loader = ConfigLoader::default();
        let err = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap_err();
        assert!(err.to_string().contains("recursion limit"), "{err}");
    }

    #[test]
    fn self_resolver_substitutes_file_properties() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(dir.path(), "main.yml", "where: ${self:dirname}\n");
        let loader = ConfigLoader::default();
        let (conf, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(
            get(&conf, "where"),
            &YamlValue::from(dir.path().display().to_string())
        );
    }

    #[test]
    fn cached_load_is_equal_and_invalidated_by_touch() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.yml", "a: 1\n");
        let main = write(dir.path(), "main.yml", "_include: base.yml\nb: 2\n");

        let mut loader = ConfigLoader::default();
        loader.cache = Some(ConfigCache::new(dir.path().join("cache")));

        let (first, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        let (second, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(first, second);

        // touching the include forces a reload with the new content
        let base = dir.path().join("base.yml");
        std::fs::write(&base, "a: 42\n").unwrap();
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let f = std::fs::OpenOptions::new().write(true).open(&base).unwrap();
        f.set_times(std::fs::FileTimes::new().set_modified(future)).unwrap();
        let (third, _) = loader.load(&main, Some(&[]), None, None, true, true, &[]).unwrap();
        assert_eq!(get(&third, "a"), &YamlValue::from(42));
    }

    #[test]
    fn requirements_and_contingencies() {
        let mut conf: YamlValue = serde_yaml::from_str(
            r#"
provided:
  x: 1
hard:
  _requires: provided
  y: 2
broken:
  _requires: no.such.section
  z: 3
soft:
  _contingent: no.such.section
  w: 4
"#,
        )
        .unwrap();
        let unmet = check_requirements(&mut conf, false).unwrap();
        assert_eq!(unmet.len(), 1);
        assert_eq!(unmet[0].1, "no.such.section");
        // contingent section silently dropped
        assert!(conf.get("soft").is_none());
        assert!(conf.get("hard").is_some());

        let mut conf2: YamlValue = serde_yaml::from_str("a:\n  _requires: nothing\n").unwrap();
        assert!(check_requirements(&mut conf2, true).is_err());
    }

    #[test]
    fn load_nested_sections() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.yml", "x: 1\n");
        write(dir.path(), "beta.yml", "x: 2\n");
        let loader = ConfigLoader::default();
        let (conf, _) = loader
            .load_nested(
                &[dir.path().join("alpha.yml"), dir.path().join("beta.yml")],
                None,
                None,
            )
            .unwrap();
        assert_eq!(get(&conf, "alpha.x"), &YamlValue::from(1));
        assert_eq!(get(&conf, "beta.x"), &YamlValue::from(2));
    }

    #[test]
    fn scrub_patterns() {
        let mut conf: YamlValue =
            serde_yaml::from_str("aa: 1\nab: 2\nb:\n  c: 3\n  d: 4\n").unwrap();
        scrub_subsections(&mut conf, &["a*".to_string(), "b.c".to_string()]).unwrap();
        assert!(conf.get("aa").is_none());
        assert!(conf.get("ab").is_none());
        assert!(get(&conf, "b").get("c").is_none());
        assert_eq!(get(&conf, "b.d"), &YamlValue::from(4));
        assert!(scrub_subsections(&mut conf, &["nope".to_string()]).is_err());
    }
}
