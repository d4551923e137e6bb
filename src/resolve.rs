//! Emulation of the dynamic loader's library search order, applied to every
//! collected dynamic ELF.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use elb::Class;
use log::debug;
use log::error;
use log::info;

use crate::pool::Task;
use crate::Config;
use crate::Context;
use crate::Data;
use crate::Error;
use crate::File;
use crate::LibIndex;
use crate::Name;
use crate::SearchPath;

/// Resolves needed libraries against the collected indexes.
#[derive(Debug)]
pub struct Resolver<'a> {
    ctx: &'a Context,
}

impl<'a> Resolver<'a> {
    /// Create a resolver over the shared context.
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Resolve all files in the working set.
    ///
    /// Resolved names are erased from each file's needed set; files left with
    /// an empty set are removed from the working set, and the union of the
    /// surviving names becomes `data.unresolved`. Returns `true` iff nothing
    /// is left unresolved.
    ///
    /// The library and loader-cache indexes are immutable during the pass,
    /// so resolution is trivially parallel across files.
    pub fn execute(&self, data: &mut Data) -> Result<bool, Error> {
        info!("Resolving libs...");
        // A file may have a filled needed set even though its inspection
        // failed half-way; `dynamic` is the authoritative flag.
        data.files.retain(|_, file| {
            let info = file.info();
            info.dynamic && !info.needed.is_empty()
        });

        let Data {
            files,
            libs,
            ld_cache,
            unresolved,
            ..
        } = data;
        unresolved.clear();
        let libs: &LibIndex = libs;
        let ld_cache: &LibIndex = ld_cache;
        let tasks: Vec<ResolveTask<'_>> = files
            .values()
            .map(|file| ResolveTask {
                config: &self.ctx.config,
                libs,
                ld_cache,
                file: file.clone(),
            })
            .collect();
        self.ctx.pool.run(tasks)?;

        files.retain(|_, file| {
            let info = file.info();
            if info.needed.is_empty() {
                false
            } else {
                unresolved.extend(info.needed.iter().copied());
                true
            }
        });
        debug!("stats: problematic files = {}", files.len());
        debug!("stats: unresolved needed names = {}", unresolved.len());
        Ok(files.is_empty())
    }

    /// Group what is left for reporting: packages sorted by name with the
    /// unassigned bucket last, files sorted by path, needed names sorted.
    pub fn report(&self, data: &Data) -> Report {
        let mut by_package: HashMap<Option<(Name, Name)>, Vec<ReportFile>> = HashMap::new();
        let mut num_unassigned = 0;
        for file in data.files.values() {
            let info = file.info();
            let package = info.package.as_ref().map(|p| (p.name, p.version));
            if package.is_none() {
                num_unassigned += 1;
            }
            by_package.entry(package).or_default().push(ReportFile {
                path: file.path,
                needed: info.needed.iter().copied().collect(),
            });
        }
        let mut groups: Vec<ReportGroup> = by_package
            .into_iter()
            .map(|(package, mut files)| {
                files.sort_by_key(|file| file.path);
                ReportGroup { package, files }
            })
            .collect();
        groups.sort_by(|a, b| match (&a.package, &b.package) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        });
        Report {
            groups,
            num_files: data.files.len(),
            num_unassigned,
        }
    }
}

/// Report input: unresolved needed names grouped by package and file.
#[derive(Debug)]
pub struct Report {
    /// Groups sorted by package name; the unassigned bucket comes last.
    pub groups: Vec<ReportGroup>,
    /// Total number of problematic files.
    pub num_files: usize,
    /// How many of them no package owns.
    pub num_unassigned: usize,
}

/// One package's worth of problematic files.
#[derive(Debug)]
pub struct ReportGroup {
    /// Package name and version, or `None` for the unassigned bucket.
    pub package: Option<(Name, Name)>,
    /// Files sorted by path.
    pub files: Vec<ReportFile>,
}

/// One problematic file and its leftover needed names, sorted.
#[derive(Debug)]
pub struct ReportFile {
    /// Canonical path without the leading separator.
    pub path: Name,
    /// Unresolved needed names.
    pub needed: Vec<Name>,
}

struct ResolveTask<'a> {
    config: &'a Config,
    libs: &'a LibIndex,
    ld_cache: &'a LibIndex,
    file: Arc<File>,
}

impl ResolveTask<'_> {
    /// Look `key` up in `index`; `true` means the entry is settled, either
    /// resolved or written off with an error record.
    fn probe(&self, index: &LibIndex, key: &str, class: Class, name: Name, what: &str) -> bool {
        let Some(target) = index.get(key, class) else {
            return false;
        };
        if Arc::ptr_eq(target, &self.file) {
            error!(
                "`/{}`: ignored needed lib `{name}` ---> resolved to itself",
                self.file.path
            );
            return true;
        }
        let (dynamic, lib) = {
            let info = target.info();
            (info.dynamic, info.lib)
        };
        if !dynamic || !lib {
            error!(
                "`/{}`: ignored needed lib `{name}` ---> `/{}` ({what}): not a {}",
                self.file.path,
                target.path,
                if dynamic { "library" } else { "dynamic ELF" }
            );
            return true;
        }
        debug!(
            "`/{}`: resolved needed lib `{name}` ---> `/{}` ({what})",
            self.file.path, target.path
        );
        true
    }

    fn search(&self, dirs: &[SearchPath], name: Name, class: Class, what: &str) -> bool {
        dirs.iter()
            .any(|dir| self.probe(self.libs, &format!("{}/{name}", dir.path), class, name, what))
    }
}

impl Task for ResolveTask<'_> {
    fn compute(&mut self) -> Result<(), Error> {
        // Snapshot the per-file inputs up front: probing locks the target
        // file, and holding our own lock at that point could deadlock with
        // a task resolving in the opposite direction.
        let (class, needed, config_paths, rpaths, runpaths) = {
            let info = self.file.info();
            let Some(class) = info.class else {
                return Ok(());
            };
            (
                class,
                info.needed.iter().copied().collect::<Vec<Name>>(),
                info.config_paths.clone(),
                info.rpaths.clone(),
                info.runpaths.clone(),
            )
        };

        let mut settled = Vec::new();
        for name in needed {
            // See `man 8 ld.so` on the search order. RPATH is consulted
            // only when there is no RUNPATH, and the extra library roots
            // are skipped for secure (setuid/setgid) files.
            let done = if name.starts_with('/') {
                self.probe(self.libs, &name.as_str()[1..], class, name, "absPath")
            } else {
                self.search(&config_paths, name, class, "configPaths")
                    || (runpaths.is_empty() && self.search(&rpaths, name, class, "RPATH"))
                    || (!self.file.secure
                        && self.search(&self.config.more_libs, name, class, "scanMoreLibs"))
                    || self.search(&runpaths, name, class, "RUNPATH")
                    || self.probe(self.ld_cache, name.as_str(), class, name, "ldCache")
                    || self.search(&self.config.default_libs, name, class, "scanDefaultLibs")
            };
            if done {
                settled.push(name);
            } else {
                debug!("`/{}`: needed lib not found: `{name}`", self.file.path);
            }
        }

        let mut info = self.file.info();
        for name in settled {
            info.needed.remove(&name);
        }
        Ok(())
    }
}
