//! Pacman integration: installed-package inventory, file ownership, and
//! mining downloaded archives of optional dependencies for libraries that
//! would satisfy still-unresolved needed names.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;

use elb::Class;
use log::debug;
use log::error;
use log::info;
use log::warn;
use regex::Regex;
use tar::EntryType;

use crate::archive::ArchiveReader;
use crate::lock;
use crate::paths;
use crate::pool::Task;
use crate::Context;
use crate::Data;
use crate::Error;
use crate::File;
use crate::Inspector;
use crate::LibIndex;
use crate::Name;
use crate::Package;

/// The package tool.
pub const PACMAN: &str = "/usr/bin/pacman";

/// Per-package metadata directories of the installed-package database.
pub const LOCAL_DB_DIR: &str = "/var/lib/pacman/local";

/// Adapter around the distribution's package manager.
#[derive(Debug)]
pub struct Pacman<'a> {
    ctx: &'a Context,
}

/// Shared mutable target of the parse-installed merge phase.
#[derive(Default)]
struct PackageMaps {
    by_name: HashMap<Name, Arc<Package>>,
    by_provides: HashMap<Name, Arc<Package>>,
    by_file: HashMap<Name, Arc<Package>>,
}

impl<'a> Pacman<'a> {
    /// Create an adapter over the shared context.
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn color_flag(&self) -> &'static str {
        if self.ctx.config.colorize {
            "--color=always"
        } else {
            "--color=never"
        }
    }

    /// Enumerate the installed packages and fill the three package indexes.
    ///
    /// Metadata files are parsed in parallel; a malformed database entry is
    /// fatal, there is no point in proceeding with bogus ownership data.
    pub fn parse_installed(&self, data: &mut Data) -> Result<(), Error> {
        info!("Analyzing installed packages...");
        let db_root = Path::new(LOCAL_DB_DIR);
        let maps = Mutex::new(PackageMaps::default());
        let mut tasks = Vec::new();
        let dir = match fs_err::read_dir(db_root) {
            Ok(dir) => Some(dir),
            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                warn!("`{LOCAL_DB_DIR}` does not exist; files will not be attributed to packages");
                None
            }
            Err(e) => return Err(e.into()),
        };
        for entry in dir.into_iter().flatten() {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
                warn!("skip non-UTF-8 entry in `{LOCAL_DB_DIR}`");
                continue;
            };
            tasks.push(ParsePackageTask {
                ctx: self.ctx,
                db_root,
                id,
                maps: &maps,
                parsed: None,
            });
        }
        let result = self.ctx.pool.run(tasks);
        let maps = match maps.into_inner() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        data.packages_by_name = maps.by_name;
        data.packages_by_provides = maps.by_provides;
        data.packages_by_file = maps.by_file;
        result?;
        debug!("stats: packages by name = {}", data.packages_by_name.len());
        debug!("stats: packages by provides = {}", data.packages_by_provides.len());
        debug!("stats: packages by file = {}", data.packages_by_file.len());
        Ok(())
    }

    /// Warn about configuration entries that reference packages which are
    /// not installed.
    pub fn check_config_references(&self, data: &Data) {
        let config = &self.ctx.config;
        for name in config
            .add_lib_paths_by_package
            .keys()
            .chain(config.extra_opt_depends.keys())
        {
            if !data.packages_by_name.contains_key(name) {
                warn!("Config file references non-installed package `{name}`.");
            }
        }
    }

    /// Collect optional dependencies of the packages owning problematic
    /// files, minus everything some installed package already provides.
    pub fn calculate_optional_deps(&self, data: &mut Data) {
        let Data {
            files,
            packages_by_provides,
            archives_by_opt_dep,
            ..
        } = data;
        for file in files.values() {
            let package = file.info().package.clone();
            let Some(package) = package else {
                continue;
            };
            let extras = self
                .ctx
                .config
                .extra_opt_depends
                .get(package.name.as_str())
                .into_iter()
                .flatten()
                .map(|(_, name)| *name);
            for opt_dep in package.opt_depends.iter().copied().chain(extras) {
                if packages_by_provides.contains_key(opt_dep.as_str()) {
                    // Already installed, under whatever provider.
                    continue;
                }
                if let std::collections::btree_map::Entry::Vacant(vacant) =
                    archives_by_opt_dep.entry(opt_dep)
                {
                    vacant.insert(None);
                    debug!(
                        "add optional dependency `{opt_dep}` of package `{} {}`",
                        package.name, package.version
                    );
                }
            }
        }
    }

    /// Fetch the archives of all pending optional dependencies without
    /// installing them, then locate each archive file in the cache.
    ///
    /// With `no_network` the download is skipped and the archives are only
    /// located; everything else proceeds as usual.
    pub fn download_optional_deps(&self, data: &mut Data, no_network: bool) -> Result<(), Error> {
        info!(
            "{} optional dependencies of problematic packages...",
            if no_network { "Locating" } else { "Downloading" }
        );
        if !no_network {
            self.download_batch(data)?;
        }

        let found = Mutex::new(Vec::new());
        let tasks: Vec<FindArchiveTask<'_>> = data
            .archives_by_opt_dep
            .keys()
            .map(|dep| FindArchiveTask {
                ctx: self.ctx,
                color_flag: self.color_flag(),
                dep: *dep,
                found: &found,
                archive: None,
            })
            .collect();
        self.ctx.pool.run(tasks)?;
        let found = match found.into_inner() {
            Ok(found) => found,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (dep, archive) in found {
            data.archives_by_opt_dep.insert(dep, Some(archive));
        }
        Ok(())
    }

    /// Run `pacman -Sw` over all pending names, chunked to respect the
    /// kernel's argument-length limit.
    fn download_batch(&self, data: &Data) -> Result<(), Error> {
        // SAFETY: sysconf is a thread-safe libc call; _SC_ARG_MAX is a valid
        // name and no pointers are involved.
        let arg_max = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
        if arg_max < 0 {
            return Err(Error::Unsupported("sysconf(_SC_ARG_MAX) failed".into()));
        }
        // POSIX suggests sparing some room so the process may still modify
        // its environment.
        let arg_max = (arg_max as usize).saturating_sub(2048);

        let mut pending = data.archives_by_opt_dep.keys().copied().peekable();
        while pending.peek().is_some() {
            let mut args: Vec<&str> = vec!["-Sw", self.color_flag(), "--noconfirm"];
            let mut length: usize = PACMAN.len() + 1 + args.iter().map(|a| a.len() + 1).sum::<usize>();
            while let Some(dep) = pending.peek() {
                if length + dep.len() + 1 > arg_max {
                    break;
                }
                length += dep.len() + 1;
                args.push(dep.as_str());
                let _ = pending.next();
            }
            debug!("exec: {PACMAN} {}", args.join(" "));
            let mut command = Command::new(PACMAN);
            command.args(&args).stdin(Stdio::null());
            if !log::log_enabled!(log::Level::Debug) {
                command.stdout(Stdio::null());
            }
            let status = command.status()?;
            if !status.success() {
                // Likely IgnorePkg, or the user pressed Ctrl+C. Do not try
                // the remaining chunks: partial downloads may be damaged.
                return Err(Error::Command(format!(
                    "`{PACMAN} -Sw` exited with {status}\n      \
                     Check IgnorePkg in /etc/pacman.conf.\n      \
                     Aborting: downloaded archives can be damaged."
                )));
            }
        }
        Ok(())
    }

    /// Scan each located archive for libraries matching the unresolved
    /// needed set and fold the finds into the global library index.
    pub fn process_optional_deps(&self, data: &mut Data) -> Result<(), Error> {
        info!("Analyzing optional dependencies of problematic packages...");
        let Data {
            unresolved,
            libs,
            archives_by_opt_dep,
            ..
        } = data;
        let unresolved: &BTreeSet<Name> = unresolved;
        let shared_libs = Mutex::new(std::mem::take(libs));
        let tasks: Vec<ParseArchiveTask<'_>> = archives_by_opt_dep
            .iter()
            .filter_map(|(dep, archive)| {
                let archive = archive.as_ref()?;
                Some(ParseArchiveTask {
                    ctx: self.ctx,
                    unresolved,
                    global_libs: &shared_libs,
                    dep: *dep,
                    archive_name: archive.clone(),
                    package: None,
                    libs: LibIndex::default(),
                })
            })
            .collect();
        let result = self.ctx.pool.run(tasks);
        *libs = match shared_libs.into_inner() {
            Ok(libs) => libs,
            Err(poisoned) => poisoned.into_inner(),
        };
        result
    }
}

/// Name, version, provides and owned files of one installed package.
#[derive(Debug, Default)]
struct RawPackage {
    name: String,
    version: String,
    provides: Vec<String>,
    opt_depends: Vec<String>,
    files: Vec<String>,
}

/// Parse one file of the `%SECTION%`-structured installed-package database.
fn parse_db_file(label: &str, contents: &str, raw: &mut RawPackage) -> Result<(), Error> {
    let mut lines = contents.lines().peekable();
    let mut take_values = |lines: &mut std::iter::Peekable<std::str::Lines<'_>>| {
        let mut values = Vec::new();
        while let Some(line) = lines.next_if(|line| !line.is_empty()) {
            values.push(line.to_owned());
        }
        values
    };
    while let Some(line) = lines.next() {
        if line.is_empty() {
            // Leading and repeated empty lines.
            continue;
        }
        if !line.starts_with('%') || !line.ends_with('%') {
            return Err(Error::Malformed(format!(
                "read `{label}`: expected %SECTION_NAME%, got `{line}`"
            )));
        }
        match line {
            "%NAME%" => {
                raw.name = take_single(label, line, &mut lines)?;
            }
            "%VERSION%" => {
                raw.version = take_single(label, line, &mut lines)?;
            }
            "%PROVIDES%" => raw.provides = take_values(&mut lines),
            "%OPTDEPENDS%" => {
                // Entries carry `name: description` suffixes.
                raw.opt_depends = take_values(&mut lines)
                    .into_iter()
                    .map(|entry| match entry.find(':') {
                        Some(i) => entry[..i].to_owned(),
                        None => entry,
                    })
                    .collect();
            }
            "%FILES%" => {
                // The database stores real paths without the leading
                // separator; directories end with one and are dropped.
                raw.files = take_values(&mut lines)
                    .into_iter()
                    .filter(|entry| !entry.ends_with('/'))
                    .collect();
            }
            _ => {
                let _ = take_values(&mut lines);
            }
        }
    }
    Ok(())
}

fn take_single(
    label: &str,
    section: &str,
    lines: &mut std::iter::Peekable<std::str::Lines<'_>>,
) -> Result<String, Error> {
    let Some(value) = lines.next().filter(|line| !line.is_empty()) else {
        return Err(Error::Malformed(format!(
            "read `{label}`: missing {section} value"
        )));
    };
    if let Some(extra) = lines.next_if(|line| !line.is_empty()) {
        return Err(Error::Malformed(format!(
            "read `{label}`: unexpected line `{extra}` after {section} value"
        )));
    }
    Ok(value.to_owned())
}

/// Parsed result shuttled from `compute` to `merge`.
struct ParsedPackage {
    package: Package,
    files: Vec<Name>,
}

struct ParsePackageTask<'a> {
    ctx: &'a Context,
    db_root: &'a Path,
    id: String,
    maps: &'a Mutex<PackageMaps>,
    parsed: Option<ParsedPackage>,
}

impl Task for ParsePackageTask<'_> {
    fn compute(&mut self) -> Result<(), Error> {
        let dir = self.db_root.join(&self.id);
        let mut raw = RawPackage::default();
        for file_name in ["desc", "files"] {
            let path = dir.join(file_name);
            let contents = fs_err::read_to_string(&path)?;
            parse_db_file(&path.to_string_lossy(), &contents, &mut raw)?;
        }
        if format!("{}-{}", raw.name, raw.version) != self.id {
            return Err(Error::Malformed(format!(
                "read `{}`: package name + `-` + version does not match the directory name",
                dir.display()
            )));
        }
        let names = &self.ctx.names;
        let name = names.intern(&raw.name);
        let mut provides: HashSet<Name> = raw.provides.iter().map(|s| names.intern(s)).collect();
        provides.insert(name);
        self.parsed = Some(ParsedPackage {
            package: Package {
                name,
                version: names.intern(&raw.version),
                provides,
                opt_depends: raw.opt_depends.iter().map(|s| names.intern(s)).collect(),
            },
            files: raw.files.iter().map(|s| names.intern(s)).collect(),
        });
        Ok(())
    }

    fn merge(&mut self) -> Result<(), Error> {
        let Some(parsed) = self.parsed.take() else {
            return Ok(());
        };
        if parsed.package.name.is_empty() {
            return Err(Error::Malformed(format!(
                "read `{}`: empty package name",
                self.id
            )));
        }
        if parsed.package.version.is_empty() {
            return Err(Error::Malformed(format!(
                "read `{}`: empty package version",
                self.id
            )));
        }
        debug!(
            "read `{}`: package `{} {}`",
            self.id, parsed.package.name, parsed.package.version
        );
        let package = Arc::new(parsed.package);
        let mut maps = lock(self.maps);
        if let Some(existing) = maps.by_name.insert(package.name, package.clone()) {
            return Err(Error::Invariant(format!(
                "read `{}`: another installed package has the same name: `{} {}`",
                self.id, existing.name, existing.version
            )));
        }
        for provided in package.provides.iter() {
            if let Some(existing) = maps.by_provides.get(provided) {
                // Legal: several packages may provide the same virtual
                // capability. Only dependencies provided by nobody matter.
                debug!(
                    "read `{}`: `{provided}` already provided by `{} {}`",
                    self.id, existing.name, existing.version
                );
                continue;
            }
            maps.by_provides.insert(*provided, package.clone());
        }
        for file in parsed.files {
            if let Some(existing) = maps.by_file.insert(file, package.clone()) {
                // Pacman treats shared file ownership as an error, and so
                // does the resolver's attribution.
                return Err(Error::Invariant(format!(
                    "read `{}`: file `{file}` already owned by `{} {}`",
                    self.id, existing.name, existing.version
                )));
            }
            debug!("read `{}`: owns file `{file}`", self.id);
        }
        Ok(())
    }
}

/// Asks pacman for the package name and archive URL of one dependency.
struct FindArchiveTask<'a> {
    ctx: &'a Context,
    color_flag: &'static str,
    dep: Name,
    found: &'a Mutex<Vec<(Name, String)>>,
    archive: Option<String>,
}

impl Task for FindArchiveTask<'_> {
    fn compute(&mut self) -> Result<(), Error> {
        debug!(
            "exec: {PACMAN} -Sw {} --print-format '%n %l' {}",
            self.color_flag, self.dep
        );
        let output = Command::new(PACMAN)
            .args(["-Sw", self.color_flag, "--print-format", "%n %l"])
            .arg(self.dep.as_str())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()?;
        if !output.status.success() {
            error!(
                "skipping optional dependency `{}`: pacman exited with {}",
                self.dep, output.status
            );
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let expected_prefix = format!(
            "file://{}",
            self.ctx.config.archive_cache_dir.display()
        );
        self.archive = parse_print_format(self.dep, &stdout, &expected_prefix);
        Ok(())
    }

    fn merge(&mut self) -> Result<(), Error> {
        if let Some(archive) = self.archive.take() {
            lock(self.found).push((self.dep, archive));
        }
        Ok(())
    }
}

/// Pick the archive file name out of `pacman -Sw --print-format '%n %l'`
/// output for `dep`.
///
/// The output has one line per package of the transaction; the line whose
/// name matches `dep` wins, otherwise the last line is taken (pacman
/// translates dependency names like `libasound.so=2-64` to package names we
/// cannot guess).
fn parse_print_format(dep: Name, stdout: &str, expected_prefix: &str) -> Option<String> {
    let r_line = Regex::new(r"^(\S+) (\S+)$").expect("valid regex");
    let mut rows = Vec::new();
    for (i, line) in stdout.lines().enumerate() {
        let Some(captures) = r_line.captures(line) else {
            error!(
                "skipped optional dependency `{dep}`: could not parse pacman output line {}",
                i + 1
            );
            return None;
        };
        rows.push((
            captures.get(1).map(|m| m.as_str().to_owned())?,
            captures.get(2).map(|m| m.as_str().to_owned())?,
        ));
    }
    if rows.is_empty() {
        error!("skipped optional dependency `{dep}`: pacman output is empty");
        return None;
    }
    let (_, url) = match rows.iter().find(|(name, _)| *name == *dep) {
        Some(row) => row,
        None => {
            let last = &rows[rows.len() - 1];
            if rows.len() > 1 {
                // Fine until the archive scan notices the mismatch.
                warn!(
                    "rewritten optional dependency `{dep}` ---> `{}`: no exact match in pacman output, took the last line",
                    last.0
                );
            }
            last
        }
    };
    // Outdated sub-dependencies may report `http://...` URLs; only the
    // requested dependency itself must point into the local cache.
    let Some(archive) = url.strip_prefix(expected_prefix).filter(|s| !s.is_empty()) else {
        error!("skipped optional dependency `{dep}`: could not parse URL `{url}`: expected `file:///...`");
        return None;
    };
    Some(archive.to_owned())
}

/// Scans one downloaded archive for needed libraries.
struct ParseArchiveTask<'a> {
    ctx: &'a Context,
    unresolved: &'a BTreeSet<Name>,
    global_libs: &'a Mutex<LibIndex>,
    dep: Name,
    archive_name: String,
    package: Option<Package>,
    libs: LibIndex,
}

impl ParseArchiveTask<'_> {
    fn scan_archive(&mut self) -> Result<(), Error> {
        let reader = ArchiveReader::new(self.ctx.config.archive_cache_dir.join(&self.archive_name));

        // Pass 1: symlinks. Targets are resolved purely textually against
        // the entry's own directory; the chains are followed only after all
        // of them are known.
        let mut resolved_by_symlink: HashMap<Name, Name> = HashMap::new();
        let mut needed_symlinks: HashSet<Name> = HashSet::new();
        reader.scan(|entry| {
            if entry.header().entry_type() != EntryType::Symlink {
                return Ok(());
            }
            let Some(path1) = entry_path1(entry) else {
                return Ok(());
            };
            let target = entry
                .link_name()
                .ok()
                .flatten()
                .and_then(|t| t.to_str().map(str::to_owned))
                .unwrap_or_default();
            self.record_symlink(
                &mut resolved_by_symlink,
                &mut needed_symlinks,
                &path1,
                &target,
            );
            Ok(())
        })?;
        let aliases_by_target = resolve_symlink_chains(&resolved_by_symlink, &needed_symlinks);
        for (target, links) in aliases_by_target.iter() {
            for link in links {
                debug!(
                    "read `{}`: needed symlink `/{link}` ---> `/{target}`",
                    self.archive_name
                );
            }
        }

        // Pass 2: regular files.
        let mut raw = RawPackage::default();
        reader.scan(|entry| {
            if entry.header().entry_type() != EntryType::Regular {
                return Ok(());
            }
            let Some(path1) = entry_path1(entry) else {
                return Ok(());
            };
            if path1 == ".PKGINFO" {
                let bytes = reader.read_entry_data(entry)?;
                let contents = String::from_utf8_lossy(&bytes);
                parse_pkginfo(&self.archive_name, &contents, &mut raw)?;
                return Ok(());
            }
            if !self.is_needed(&path1, &aliases_by_target) {
                return Ok(());
            }
            debug!("read `{}`: inspect `/{path1}`", self.archive_name);
            let bytes = reader.read_entry_data(entry)?;
            let file = File::new(self.ctx.names.intern(&path1), false);
            Inspector::new(self.ctx).inspect_buffer(&file, &bytes)?;
            let (lib, class) = {
                let info = file.info();
                (info.lib, info.class)
            };
            if !lib {
                warn!(
                    "read `{}`: `/{path1}` matches a needed name but is not a library",
                    self.archive_name
                );
                return Ok(());
            }
            let Some(class) = class else {
                return Ok(());
            };
            self.add_lib(file.path, class, file.clone());
            if let Some(links) = aliases_by_target.get(file.path.as_str()) {
                for link in links {
                    self.add_lib(*link, class, file.clone());
                }
            }
            Ok(())
        })?;

        let names = &self.ctx.names;
        let name = names.intern(&raw.name);
        let mut provides: HashSet<Name> = raw.provides.iter().map(|s| names.intern(s)).collect();
        provides.insert(name);
        self.package = Some(Package {
            name,
            version: names.intern(&raw.version),
            provides,
            opt_depends: BTreeSet::new(),
        });
        Ok(())
    }

    fn record_symlink(
        &self,
        resolved_by_symlink: &mut HashMap<Name, Name>,
        needed_symlinks: &mut HashSet<Name>,
        link_path1: &str,
        target: &str,
    ) {
        if target.is_empty() {
            return;
        }
        if is_needed_name(self.unresolved, link_path1) {
            needed_symlinks.insert(self.ctx.names.intern(link_path1));
            debug!(
                "read `{}`: needed symlink `/{link_path1}`",
                self.archive_name
            );
        }
        let resolved1 = match target.strip_prefix('/') {
            Some(absolute) => absolute.to_owned(),
            None => format!("{link_path1}/../{target}"),
        };
        match paths::normalize(&resolved1) {
            Ok(normalized) => {
                // Stored even when not needed itself: a needed symlink may
                // resolve through it.
                resolved_by_symlink.insert(
                    self.ctx.names.intern(link_path1),
                    self.ctx.names.intern(&normalized),
                );
            }
            Err(e) => warn!(
                "read `{}`: skip symlink `/{link_path1}` ---> `{target}`: {e}",
                self.archive_name
            ),
        }
    }

    fn is_needed(&self, path1: &str, aliases_by_target: &HashMap<Name, Vec<Name>>) -> bool {
        aliases_by_target.contains_key(path1) || is_needed_name(self.unresolved, path1)
    }

    fn add_lib(&mut self, path: Name, class: Class, file: Arc<File>) {
        if self.libs.insert(path, class, file).is_some() {
            warn!(
                "read `{}`: lib `{path}`: duplicate key, ignoring",
                self.archive_name
            );
        } else {
            debug!("read `{}`: add lib `{path}`", self.archive_name);
        }
    }
}

impl Task for ParseArchiveTask<'_> {
    fn compute(&mut self) -> Result<(), Error> {
        match self.scan_archive() {
            Ok(()) => {}
            Err(e) => {
                // One unreadable archive must not fail the run.
                warn!("ignore `{}`: {e}", self.archive_name);
                self.package = None;
                self.libs = LibIndex::default();
                return Ok(());
            }
        }
        let Some(package) = &self.package else {
            return Ok(());
        };
        if package.name.is_empty() || package.version.is_empty() {
            warn!(
                "ignore `{}`: empty package name or version",
                self.archive_name
            );
            self.package = None;
            self.libs = LibIndex::default();
            return Ok(());
        }
        if package.name != self.dep && !package.provides.contains(self.dep.as_str()) {
            // Happens with constrained entries: `optdepend=java-runtime`
            // vs `provides=java-runtime=17`.
            debug!(
                "read `{}`: neither the package name nor its provides match `{}`",
                self.archive_name, self.dep
            );
        }
        debug!(
            "read `{}`: package `{} {}`",
            self.archive_name, package.name, package.version
        );
        Ok(())
    }

    fn merge(&mut self) -> Result<(), Error> {
        if self.package.is_none() {
            return Ok(());
        }
        let mut global = lock(self.global_libs);
        for (path, class, file) in self.libs.iter() {
            if global.insert(path, class, file.clone()).is_some() {
                warn!(
                    "read `{}`: lib `{path}`: duplicate key, ignoring",
                    self.archive_name
                );
            }
        }
        Ok(())
    }
}

/// True iff the path's basename or its absolute form is in the unresolved
/// needed set. The set is exhaustive, so no `*.so*` pattern check is needed.
fn is_needed_name(unresolved: &BTreeSet<Name>, path1: &str) -> bool {
    let base = path1.rsplit('/').next().unwrap_or(path1);
    if unresolved.contains(base) {
        return true;
    }
    unresolved.contains(format!("/{path1}").as_str())
}

/// Follow each needed symlink through the archive's symlink map until a
/// non-symlink path is reached.
fn resolve_symlink_chains(
    resolved_by_symlink: &HashMap<Name, Name>,
    needed_symlinks: &HashSet<Name>,
) -> HashMap<Name, Vec<Name>> {
    let mut aliases_by_target: HashMap<Name, Vec<Name>> = HashMap::new();
    for link in needed_symlinks {
        let mut current = *link;
        // Chains inside one archive are short; the bound only guards
        // against cyclic symlink entries.
        for _ in 0..40 {
            match resolved_by_symlink.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        aliases_by_target.entry(current).or_default().push(*link);
    }
    aliases_by_target
}

/// Extract the tar entry path in canonical `path1` form.
fn entry_path1<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> Option<String> {
    let path = entry.path().ok()?;
    let path = path.to_str()?;
    let path = path.strip_prefix("./").unwrap_or(path);
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    Some(path.to_owned())
}

/// Parse `.PKGINFO` key-value lines.
fn parse_pkginfo(label: &str, contents: &str, raw: &mut RawPackage) -> Result<(), Error> {
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::Malformed(format!(
                "read `{label}` / `.PKGINFO` line {}: failed to parse",
                i + 1
            )));
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "pkgname" => raw.name = value.to_owned(),
            "pkgver" => raw.version = value.to_owned(),
            "provides" => raw.provides.push(value.to_owned()),
            _ => {}
        }
    }
    Ok(())
}
