//! Filesystem crawler that discovers candidate binaries and fills the
//! library and loader-cache indexes.
//!
//! What the collector skips is invisible to all further processing: it will
//! not be inspected and will not participate in dependency resolution.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;

use log::debug;
use log::info;
use log::warn;
use regex::Regex;

use crate::lock;
use crate::paths;
use crate::pool::Task;
use crate::AddLibPath;
use crate::Context;
use crate::Data;
use crate::Error;
use crate::File;
use crate::Inspector;
use crate::Name;
use crate::SearchPath;

/// The loader-cache dump tool.
pub const LDCONFIG: &str = "/usr/bin/ldconfig";

/// Crawls the search roots, drives ELF inspection and absorbs the dynamic
/// loader's cache.
pub struct Collector<'a> {
    ctx: &'a Context,
    /// `man ldconfig` only looks at `lib*.so*`; we cast a wider net.
    lib_name: Regex,
    /// Search paths still to crawl. Inspectors append to this from parallel
    /// tasks when they find RPATH/RUNPATH directories.
    queue: Mutex<VecDeque<SearchPath>>,
    /// Directory inodes already crawled. Symlinked trees and repeated
    /// RPATH entries alias the same inode and are walked once.
    visited_dirs: HashSet<u64>,
    /// Canonical *and* symlink paths of every discovered candidate.
    /// Multiple keys may reference the same file.
    all_files: HashMap<Name, Arc<File>>,
    /// Files found since the last inspection round.
    new_files: Vec<Arc<File>>,
}

/// Loader-cache entries parsed but not yet inserted: bitness is only known
/// after the files have been inspected.
struct LdCachePending {
    declared: usize,
    skipped: usize,
    entries: Vec<(Name, Arc<File>)>,
}

impl<'a> Collector<'a> {
    /// Create a collector over the shared context.
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            lib_name: Regex::new(r"^.+\.so(\..*)?$").expect("valid regex"),
            queue: Mutex::new(VecDeque::new()),
            visited_dirs: HashSet::new(),
            all_files: HashMap::new(),
            new_files: Vec::new(),
        }
    }

    /// Populate `data.files`, `data.libs` and `data.ld_cache`.
    ///
    /// Must be called once, after the installed packages are parsed.
    pub fn execute(&mut self, data: &mut Data) -> Result<(), Error> {
        info!("Scanning filesystem for bins & libs...");
        {
            let config = &self.ctx.config;
            let mut queue = lock(&self.queue);
            for search_path in config
                .scan_bins
                .iter()
                .chain(config.default_libs.iter())
                .chain(config.more_libs.iter())
            {
                queue.push_back(*search_path);
            }
        }
        self.process_queue(data)?;

        let output = run_ldconfig()?;
        let pending = self.parse_ld_cache(data, &output)?;
        // Inspect the files the cache added; their RPATH/RUNPATH entries may
        // have queued new directories, which this drains as well.
        self.process_queue(data)?;
        self.finish_ld_cache(data, pending)?;

        for (path, file) in &self.all_files {
            let (lib, class) = {
                let info = file.info();
                (info.lib, info.class)
            };
            if !lib {
                continue;
            }
            let Some(class) = class else {
                continue;
            };
            if data.libs.insert(*path, class, file.clone()).is_some() {
                return Err(Error::Invariant(format!(
                    "duplicate lib key `{path}` ---> `/{}`",
                    file.path
                )));
            }
            debug!("add lib `{path}` ---> `/{}`", file.path);
        }

        debug!("stats: visited dirs = {}", self.visited_dirs.len());
        debug!("stats: all files = {}", self.all_files.len());
        debug!("stats: unique files = {}", data.files.len());
        debug!("stats: libs = {}", data.libs.len());
        debug!("stats: ld cache = {}", data.ld_cache.len());
        Ok(())
    }

    /// Crawl until a full iteration adds no new files.
    fn process_queue(&mut self, data: &mut Data) -> Result<(), Error> {
        loop {
            loop {
                let Some(search_path) = lock(&self.queue).pop_front() else {
                    break;
                };
                let path1 = search_path.path;
                self.walk_dir(data, path1.as_str(), search_path.inode)?;
            }

            debug!("stats: files added by current iteration = {}", self.new_files.len());
            if self.new_files.is_empty() {
                return Ok(());
            }
            let batch = std::mem::take(&mut self.new_files);
            let shared: &Data = data;
            let tasks: Vec<InspectTask<'_>> = batch
                .iter()
                .map(|file| InspectTask {
                    ctx: self.ctx,
                    data: shared,
                    queue: &self.queue,
                    file: file.clone(),
                })
                .collect();
            self.ctx.pool.run(tasks)?;
        }
    }

    fn walk_dir(&mut self, data: &mut Data, path1: &str, inode: u64) -> Result<(), Error> {
        if !self.visited_dirs.insert(inode) {
            debug!("skip `/{path1}`: already scanned");
            return Ok(());
        }
        debug!("scan `/{path1}`");
        let dir = match fs_err::read_dir(format!("/{path1}")) {
            Ok(dir) => dir,
            // Configured paths may legitimately not exist.
            Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("skip non-UTF-8 entry in `/{path1}`");
                continue;
            };
            let child = format!("{path1}/{name}");
            if self.ctx.config.is_ignored(&child) {
                debug!("ignore `/{child}`: by config");
                continue;
            }
            let file_type = entry.file_type().map_err(|e| {
                Error::Unsupported(format!("could not read entry type of `/{child}`: {e}"))
            })?;
            if file_type.is_symlink() {
                self.process_symlink(data, &child)?;
            } else if file_type.is_dir() {
                let meta = entry.metadata()?;
                self.walk_dir(data, &child, meta.ino())?;
            } else if file_type.is_file() {
                let meta = entry.metadata()?;
                self.process_regular(data, &child, meta.mode(), None)?;
            }
        }
        Ok(())
    }

    fn process_symlink(&mut self, data: &mut Data, link_path1: &str) -> Result<(), Error> {
        let Some(resolved) = paths::canonicalize(Path::new(&format!("/{link_path1}")))? else {
            debug!("skip `/{link_path1}`: orphan symlink");
            return Ok(());
        };
        let Some(resolved1) = paths::path1(&resolved) else {
            warn!("skip `/{link_path1}`: target is not UTF-8");
            return Ok(());
        };
        let meta = fs_err::metadata(&resolved)?;
        if meta.is_file() {
            let resolved1 = resolved1.to_owned();
            match self.process_regular(data, &resolved1, meta.mode(), None)? {
                Some(file) => {
                    let alias = self.ctx.names.intern(link_path1);
                    match self.all_files.entry(alias) {
                        Entry::Occupied(_) => {
                            return Err(Error::Invariant(format!(
                                "duplicate alias key `{link_path1}`"
                            )));
                        }
                        Entry::Vacant(vacant) => {
                            vacant.insert(file);
                        }
                    }
                    debug!("add `/{link_path1}`: symlink to `/{resolved1}`");
                }
                None => debug!("skip `/{link_path1}`: symlink to skipped `/{resolved1}`"),
            }
        } else if meta.is_dir() {
            debug!("follow `/{link_path1}`: symlink to dir `/{resolved1}`");
            let resolved1 = resolved1.to_owned();
            self.walk_dir(data, &resolved1, meta.ino())?;
        }
        Ok(())
    }

    /// Register a regular file if it qualifies as a candidate.
    ///
    /// `path1` must already be canonical. With `reason` given the file is
    /// added unconditionally, otherwise its execute bit and name decide.
    fn process_regular(
        &mut self,
        data: &mut Data,
        path1: &str,
        mode: u32,
        reason: Option<&str>,
    ) -> Result<Option<Arc<File>>, Error> {
        let reason = match reason {
            Some(reason) => reason,
            None if paths::is_executable(mode) => "has x-permission",
            None => {
                let base = path1.rsplit('/').next().unwrap_or(path1);
                if !self.lib_name.is_match(base) {
                    return Ok(None);
                }
                "matches .so pattern"
            }
        };
        if let Some(existing) = data.files.get(path1) {
            // Same file can be found while crawling and through a symlink.
            debug!("skip `/{path1}`: already added");
            return Ok(Some(existing.clone()));
        }
        let name = self.ctx.names.intern(path1);
        let file = File::new(name, paths::is_secure(mode));
        data.files.insert(name, file.clone());
        if self.all_files.insert(name, file.clone()).is_some() {
            return Err(Error::Invariant(format!("duplicate file key `{path1}`")));
        }
        debug!("add `/{path1}`: {reason}");
        self.new_files.push(file.clone());
        Ok(Some(file))
    }

    /// Parse `ldconfig -p` output, creating candidate files for cache
    /// targets we have not seen yet.
    fn parse_ld_cache(&mut self, data: &mut Data, output: &str) -> Result<LdCachePending, Error> {
        // Both the first and the last line are localized; require only the
        // leading count and the tool name.
        let r_first = Regex::new(r"^(\d{1,9}) .*$").expect("valid regex");
        let r_entry = Regex::new(r"^\t(\S+) \([^)]+\) => /(\S+)$").expect("valid regex");
        let r_last = Regex::new(r"^\S.* ldconfig .*$").expect("valid regex");

        let mut lines = output.lines().enumerate();
        let Some((_, first)) = lines.next() else {
            return Err(Error::Command("output of `ldconfig -p` is empty".into()));
        };
        let Some(captures) = r_first.captures(first) else {
            return Err(Error::Command(
                "`ldconfig -p` line 1: could not parse".into(),
            ));
        };
        let declared: usize = captures[1]
            .parse()
            .map_err(|_| Error::Command("`ldconfig -p` line 1: bad count".into()))?;

        let mut pending = LdCachePending {
            declared,
            skipped: 0,
            entries: Vec::with_capacity(declared),
        };
        let mut saw_footer = false;
        for (i, line) in lines {
            let line_no = i + 1;
            if saw_footer {
                return Err(Error::Command(format!(
                    "`ldconfig -p` line {line_no}: unexpected line after the footer"
                )));
            }
            let Some(captures) = r_entry.captures(line) else {
                if r_last.is_match(line) {
                    saw_footer = true;
                    continue;
                }
                return Err(Error::Command(format!(
                    "`ldconfig -p` line {line_no}: could not parse"
                )));
            };
            let soname = &captures[1];
            let mut path1 = captures[2].to_owned();

            let mut file = self.all_files.get(path1.as_str()).cloned();
            if file.is_none() {
                // Maybe the cache entry is not a realpath.
                let Some(canonical) = paths::canonicalize(Path::new(&format!("/{path1}")))?
                else {
                    warn!("`ldconfig -p` line {line_no}: skip `/{path1}`: orphan symlink");
                    pending.skipped += 1;
                    continue;
                };
                let Some(canonical1) = paths::path1(&canonical) else {
                    warn!("`ldconfig -p` line {line_no}: skip `/{path1}`: not UTF-8");
                    pending.skipped += 1;
                    continue;
                };
                if canonical1 != path1 {
                    // The cache maps names to both libs and lib symlinks.
                    debug!(
                        "`ldconfig -p` line {line_no}: rewritten `/{path1}` ---> `/{canonical1}`"
                    );
                    path1 = canonical1.to_owned();
                    file = self.all_files.get(path1.as_str()).cloned();
                }
            }
            let file = match file {
                Some(file) => file,
                None => {
                    let meta = fs_err::metadata(format!("/{path1}"))?;
                    if !meta.is_file() {
                        warn!(
                            "`ldconfig -p` line {line_no}: skip `/{path1}`: not a regular file"
                        );
                        pending.skipped += 1;
                        continue;
                    }
                    match self.process_regular(
                        data,
                        &path1,
                        meta.mode(),
                        Some("found in `ldconfig -p`"),
                    )? {
                        Some(file) => file,
                        None => {
                            pending.skipped += 1;
                            continue;
                        }
                    }
                }
            };
            pending.entries.push((self.ctx.names.intern(soname), file));
        }
        Ok(pending)
    }

    /// Insert the parsed cache entries now that bitness is known, and
    /// cross-check the tally against the declared count.
    fn finish_ld_cache(&self, data: &mut Data, pending: LdCachePending) -> Result<(), Error> {
        let mut added = 0_usize;
        let mut skipped = pending.skipped;
        for (soname, file) in pending.entries {
            let Some(class) = file.info().class else {
                warn!("ld cache: skip `{soname}` ---> `/{}`: not an ELF", file.path);
                skipped += 1;
                continue;
            };
            match data.ld_cache.insert(soname, class, file.clone()) {
                None => {
                    added += 1;
                    debug!("ld cache: add `{soname}` ---> `/{}`", file.path);
                }
                Some(existing) if Arc::ptr_eq(existing, &file) => {
                    // Both /lib/ld-linux.so.2 and /lib32/ld-linux.so.2 may be
                    // symlinks to the same loader; key and value both match.
                    debug!("ld cache: skip `{soname}`: duplicate key and value");
                    skipped += 1;
                }
                Some(existing) => {
                    // `ldd` takes the first cache row for a duplicated name,
                    // so do we.
                    warn!(
                        "ld cache: skip `{soname}` ---> `/{}`: duplicate key, keeping `/{}`",
                        file.path, existing.path
                    );
                    skipped += 1;
                }
            }
        }
        if added + skipped != pending.declared {
            return Err(Error::Command(format!(
                "`ldconfig -p` declared {} entries, ended up with {added} added + {skipped} skipped",
                pending.declared
            )));
        }
        Ok(())
    }
}

fn run_ldconfig() -> Result<String, Error> {
    debug!("exec: {LDCONFIG} -p");
    let output = Command::new(LDCONFIG)
        .arg("-p")
        .stdin(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(Error::Command(format!(
            "`{LDCONFIG} -p` exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Per-file inspection plus package attribution and configured search paths.
struct InspectTask<'a> {
    ctx: &'a Context,
    data: &'a Data,
    queue: &'a Mutex<VecDeque<SearchPath>>,
    file: Arc<File>,
}

impl InspectTask<'_> {
    fn add_config_paths(&self, adds: &[AddLibPath]) {
        for add in adds {
            let search_path = SearchPath {
                path: add.path,
                inode: add.inode,
            };
            self.file.info().config_paths.push(search_path);
            if add.inode != 0 {
                // Inode 0 means the directory does not exist and was kept
                // only for optional-dependency lookups.
                lock(self.queue).push_back(search_path);
            }
            debug!(
                "`/{}`: add search path from config line {}: `{}`",
                self.file.path, add.line, add.path
            );
        }
    }
}

impl Task for InspectTask<'_> {
    fn compute(&mut self) -> Result<(), Error> {
        let inspector = Inspector::new(self.ctx);
        inspector.inspect_file(&self.file, |search_path| {
            lock(self.queue).push_back(search_path);
        })?;
        if !self.file.info().dynamic {
            return Ok(());
        }

        if let Some(package) = self.data.packages_by_file.get(self.file.path.as_str()) {
            debug!(
                "`/{}`: assign package `{} {}`",
                self.file.path, package.name, package.version
            );
            self.file.info().package = Some(package.clone());
            if let Some(adds) = self
                .ctx
                .config
                .add_lib_paths_by_package
                .get(package.name.as_str())
            {
                self.add_config_paths(adds);
            }
        }
        for (prefix, adds) in &self.ctx.config.add_lib_paths_by_prefix {
            if self.file.path == *prefix || self.file.path.starts_with(prefix.as_str()) {
                self.add_config_paths(adds);
            }
        }
        Ok(())
    }
}
