//! Run configuration: built-in defaults, `LD_LIBRARY_PATH`, and the
//! recognized configuration-file keys.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::warn;
use regex::Regex;

use crate::ini;
use crate::paths;
use crate::Error;
use crate::Name;
use crate::SearchPath;
use crate::StringPool;
use crate::WorkerPool;

/// Default executable roots. On Arch, `/bin`, `/sbin` and `/usr/sbin` are
/// symlinks to `/usr/bin`, and canonicalization merges them anyway.
pub const DEFAULT_BIN_DIRS: &[&str] = &["/usr/bin"];

/// Default library roots, exactly the list from `man 8 ld.so`. Order is
/// search priority.
pub const DEFAULT_LIB_DIRS: &[&str] = &["/usr/lib", "/usr/lib32"];

/// Where pacman keeps downloaded package archives.
pub const DEFAULT_ARCHIVE_CACHE_DIR: &str = "/var/cache/pacman/pkg/";

/// A search directory attached to files through `addLibPath`.
#[derive(Debug, Clone, Copy)]
pub struct AddLibPath {
    /// Configuration line, for messages.
    pub line: usize,
    /// Directory path without the leading separator.
    pub path: Name,
    /// Directory inode, or 0 when the directory does not exist yet.
    pub inode: u64,
}

/// Parsed configuration.
#[derive(Debug)]
pub struct Config {
    /// Executable roots to crawl: defaults plus `scanMoreBins`.
    pub scan_bins: Vec<SearchPath>,
    /// Default library roots; lowest search priority.
    pub default_libs: Vec<SearchPath>,
    /// Extra library roots from `LD_LIBRARY_PATH` and `scanMoreLibs`;
    /// higher priority than the defaults, ignored for secure files.
    pub more_libs: Vec<SearchPath>,
    /// `addLibPath` entries keyed by package name.
    pub add_lib_paths_by_package: HashMap<Name, Vec<AddLibPath>>,
    /// `addLibPath` entries keyed by canonical file path, or by canonical
    /// directory path with a trailing separator (prefix match).
    pub add_lib_paths_by_prefix: Vec<(Name, Vec<AddLibPath>)>,
    /// `addOptDepend` edges: package name to injected dependency names with
    /// their configuration lines.
    pub extra_opt_depends: HashMap<Name, Vec<(usize, Name)>>,
    /// `ignoreFile` patterns, matched against canonical paths without the
    /// leading separator.
    pub ignore: Vec<Regex>,
    /// Pass `--color=always` to pacman and colorize the report.
    pub colorize: bool,
    /// Where to look for downloaded package archives.
    pub archive_cache_dir: PathBuf,
}

impl Config {
    /// Build the configuration from defaults and the environment.
    ///
    /// `ld_library_path` is the raw value of `LD_LIBRARY_PATH`; it is read
    /// before any configuration file because it has priority over
    /// `scanMoreLibs`.
    pub fn new(
        names: &StringPool,
        ld_library_path: Option<&OsStr>,
        colorize: bool,
    ) -> Result<Self, Error> {
        let mut config = Self {
            scan_bins: Vec::new(),
            default_libs: Vec::new(),
            more_libs: Vec::new(),
            add_lib_paths_by_package: HashMap::new(),
            add_lib_paths_by_prefix: Vec::new(),
            extra_opt_depends: HashMap::new(),
            ignore: Vec::new(),
            colorize,
            archive_cache_dir: PathBuf::from(DEFAULT_ARCHIVE_CACHE_DIR),
        };
        for dir in DEFAULT_BIN_DIRS {
            append_search_dir(names, "scanDefaultBins", dir, &mut config.scan_bins)?;
        }
        for dir in DEFAULT_LIB_DIRS {
            append_search_dir(names, "scanDefaultLibs", dir, &mut config.default_libs)?;
        }
        if let Some(value) = ld_library_path {
            let Some(value) = value.to_str() else {
                return Err(Error::Config("LD_LIBRARY_PATH is not UTF-8".into()));
            };
            // Spaces and escaping are not allowed in this variable for
            // legacy reasons, so a plain colon split is enough.
            for dir in value.split(':').filter(|s| !s.is_empty()) {
                append_search_dir(names, "LD_LIBRARY_PATH", dir, &mut config.more_libs)?;
            }
        }
        Ok(config)
    }

    /// Apply a configuration file on top of the defaults.
    pub fn apply(&mut self, names: &StringPool, contents: &str) -> Result<(), Error> {
        ini::parse(contents, |line| {
            match line.key {
                "scanMoreBins" => {
                    for dir in line.value.split_whitespace() {
                        append_search_dir(names, line.key, dir, &mut self.scan_bins)?;
                    }
                }
                "scanMoreLibs" => {
                    for dir in line.value.split_whitespace() {
                        append_search_dir(names, line.key, dir, &mut self.more_libs)?;
                    }
                }
                "addLibPath" => self.parse_add_lib_path(names, line)?,
                "addOptDepend" => self.parse_add_opt_depend(names, line)?,
                "ignoreFile" => {
                    let regex = Regex::new(line.value).map_err(|e| {
                        Error::Config(format!(
                            "line {}: bad ignoreFile pattern: {e}",
                            line.number
                        ))
                    })?;
                    self.ignore.push(regex);
                }
                _ => return Ok(false),
            }
            Ok(true)
        })
    }

    fn parse_add_lib_path(&mut self, names: &StringPool, line: &ini::Line<'_>) -> Result<(), Error> {
        let tokens: Vec<&str> = line.value.split_whitespace().collect();
        let &[target, what] = tokens.as_slice() else {
            return Err(Error::Config(format!(
                "line {}: bad addLibPath: expected `<where> <dir>`",
                line.number
            )));
        };
        if !what.starts_with('/') {
            return Err(Error::Config(format!(
                "line {}: bad addLibPath: `{what}` must be an absolute path",
                line.number
            )));
        }
        let add = match paths::canonicalize(Path::new(what))? {
            Some(canonical) => {
                let meta = fs_err::metadata(&canonical)?;
                if !meta.is_dir() {
                    return Err(Error::Config(format!(
                        "line {}: bad addLibPath: `{}` is not a directory",
                        line.number,
                        canonical.display()
                    )));
                }
                let Some(path1) = paths::path1(&canonical) else {
                    return Err(Error::Config(format!(
                        "line {}: bad addLibPath: `{what}` is not UTF-8",
                        line.number
                    )));
                };
                AddLibPath {
                    line: line.number,
                    path: names.intern(path1),
                    inode: meta.ino(),
                }
            }
            None => {
                warn!(
                    "Config line {}: suspicious addLibPath: `{what}` does not exist; optional dependency?",
                    line.number
                );
                // Kept with inode 0: the directory may materialize once the
                // optional dependency is installed.
                AddLibPath {
                    line: line.number,
                    path: names.intern(&what[1..]),
                    inode: 0,
                }
            }
        };

        if !target.contains('/') {
            debug!(
                "Config line {}: addLibPath `/{}` ---> to all files in package `{target}`",
                line.number, add.path
            );
            self.add_lib_paths_by_package
                .entry(names.intern(target))
                .or_default()
                .push(add);
            return Ok(());
        }
        if !target.starts_with('/') {
            return Err(Error::Config(format!(
                "line {}: bad addLibPath: `{target}` is neither a package name nor an absolute path",
                line.number
            )));
        }
        if target.ends_with('/') || target.ends_with("/*") {
            return Err(Error::Config(format!(
                "line {}: bad addLibPath: `{target}` ends with `/` or `/*`, did you mean `/**`?",
                line.number
            )));
        }

        let target_is_dir = target.ends_with("/**");
        let target_base = if target_is_dir {
            &target[..target.len() - 3]
        } else {
            target
        };
        let Some(canonical) = paths::canonicalize(Path::new(target_base))? else {
            warn!(
                "Config line {}: ignore addLibPath: `{target_base}` does not exist",
                line.number
            );
            return Ok(());
        };
        let meta = fs_err::metadata(&canonical)?;
        if target_is_dir != meta.is_dir() {
            return Err(Error::Config(format!(
                "line {}: bad addLibPath: `{target_base}` is not a {}",
                line.number,
                if target_is_dir { "directory" } else { "regular file" }
            )));
        }
        let Some(path1) = paths::path1(&canonical) else {
            return Err(Error::Config(format!(
                "line {}: bad addLibPath: `{target_base}` is not UTF-8",
                line.number
            )));
        };
        // Directory targets get a trailing separator so a plain prefix match
        // on canonical paths cannot cross a component boundary.
        let key = if target_is_dir {
            names.intern(&format!("{path1}/"))
        } else {
            names.intern(path1)
        };
        debug!(
            "Config line {}: addLibPath `/{}` ---> to {} `{key}`",
            line.number,
            add.path,
            if target_is_dir { "all files in directory" } else { "file" }
        );
        match self.add_lib_paths_by_prefix.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => list.push(add),
            None => self.add_lib_paths_by_prefix.push((key, vec![add])),
        }
        Ok(())
    }

    fn parse_add_opt_depend(
        &mut self,
        names: &StringPool,
        line: &ini::Line<'_>,
    ) -> Result<(), Error> {
        let tokens: Vec<&str> = line.value.split_whitespace().collect();
        let &[package, dep] = tokens.as_slice() else {
            return Err(Error::Config(format!(
                "line {}: bad addOptDepend: expected `<package> <name>`",
                line.number
            )));
        };
        if package.contains('/') {
            return Err(Error::Config(format!(
                "line {}: bad addOptDepend: package name `{package}` contains '/'",
                line.number
            )));
        }
        if dep.contains('/') {
            return Err(Error::Config(format!(
                "line {}: bad addOptDepend: optional dependency `{dep}` contains '/'",
                line.number
            )));
        }
        debug!(
            "Config line {}: add optional dependency `{dep}` to package `{package}`",
            line.number
        );
        self.extra_opt_depends
            .entry(names.intern(package))
            .or_default()
            .push((line.number, names.intern(dep)));
        Ok(())
    }

    /// Should the crawler skip this canonical path?
    pub fn is_ignored(&self, path1: &str) -> bool {
        self.ignore.iter().any(|regex| regex.is_match(path1))
    }
}

/// Validate, canonicalize, deduplicate and append one search directory.
fn append_search_dir(
    names: &StringPool,
    source: &str,
    path: &str,
    target: &mut Vec<SearchPath>,
) -> Result<(), Error> {
    if path.is_empty() {
        return Err(Error::Config(format!("invalid {source} entry: path is empty")));
    }
    if !path.starts_with('/') {
        return Err(Error::Config(format!(
            "invalid {source} entry `{path}`: path must be absolute"
        )));
    }
    let Some(canonical) = paths::canonicalize(Path::new(path))? else {
        warn!("Config: skipping {source} entry `{path}`: directory does not exist");
        return Ok(());
    };
    if canonical != Path::new(path) {
        debug!(
            "Config: rewritten {source} entry `{path}` ---> `{}`",
            canonical.display()
        );
    }
    let meta = fs_err::metadata(&canonical)?;
    if !meta.is_dir() {
        warn!("Config: skipping {source} entry `{path}`: not a directory");
        return Ok(());
    }
    if target.iter().any(|sp| sp.inode == meta.ino()) {
        debug!("Config: skipping {source} entry `{path}`: duplicate");
        return Ok(());
    }
    let Some(path1) = paths::path1(&canonical) else {
        warn!("Config: skipping {source} entry `{path}`: not UTF-8");
        return Ok(());
    };
    target.push(SearchPath {
        path: names.intern(path1),
        inode: meta.ino(),
    });
    Ok(())
}

/// Everything the run's components share: the string pool, the worker pool
/// and the parsed configuration.
#[derive(Debug)]
pub struct Context {
    /// Interned strings; lives for the whole run.
    pub names: StringPool,
    /// Worker threads for the batch phases.
    pub pool: WorkerPool,
    /// Parsed configuration.
    pub config: Config,
}
