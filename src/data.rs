//! Shared data model of the run: files, packages and the lookup indexes the
//! resolver searches.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use elb::Class;

use crate::lock;
use crate::Error;
use crate::Name;

/// A directory the loader may search, deduplicated by inode so aliased trees
/// (symlinked directories, repeated RPATH entries) are visited once.
#[derive(Debug, Clone, Copy)]
pub struct SearchPath {
    /// Canonical directory path without the leading separator.
    pub path: Name,
    /// Directory inode; 0 marks a configured directory that does not exist
    /// yet (it may appear after optional dependencies are installed).
    pub inode: u64,
}

impl PartialEq for SearchPath {
    fn eq(&self, other: &Self) -> bool {
        self.inode == other.inode
    }
}

impl Eq for SearchPath {}

/// One candidate binary.
///
/// Created by the collector on first discovery and shared by reference from
/// every index afterwards; identity is the canonical path.
#[derive(Debug)]
pub struct File {
    /// Canonical path without the leading separator, matching the form used
    /// by installed-package file lists.
    pub path: Name,
    /// Has the setuid or setgid bit; the loader ignores some search paths
    /// for such files.
    pub secure: bool,
    inspected: AtomicBool,
    info: Mutex<FileInfo>,
}

/// The mutable part of a [`File`], filled in by the inspector and consumed
/// by the resolver.
#[derive(Debug, Default)]
pub struct FileInfo {
    /// Bitness; `None` until the file parses as an ELF object.
    pub class: Option<Class>,
    /// Is this a dynamic ELF worth resolving at all?
    pub dynamic: bool,
    /// True iff the ELF type is `DYN`. `EXEC` binaries can still export
    /// symbols to their plugins, but only `DYN` objects act as libraries.
    pub lib: bool,
    /// Still-unresolved `DT_NEEDED` entries: bare sonames, or absolute paths.
    pub needed: BTreeSet<Name>,
    /// Directories from `DT_RPATH`, canonicalized and existing.
    pub rpaths: Vec<SearchPath>,
    /// Directories from `DT_RUNPATH`, canonicalized and existing.
    pub runpaths: Vec<SearchPath>,
    /// Extra search directories attached through configuration.
    pub config_paths: Vec<SearchPath>,
    /// Owning package, if any file list claims this path.
    pub package: Option<Arc<Package>>,
}

impl File {
    /// Create a file record for the given canonical path.
    pub fn new(path: Name, secure: bool) -> Arc<Self> {
        Arc::new(Self {
            path,
            secure,
            inspected: AtomicBool::new(false),
            info: Mutex::new(FileInfo::default()),
        })
    }

    /// Lock the mutable part.
    pub fn info(&self) -> MutexGuard<'_, FileInfo> {
        lock(&self.info)
    }

    /// Mark the file as inspected.
    ///
    /// Exactly one inspection per file is allowed; a second attempt is a
    /// programming error and fails the run.
    pub fn begin_inspection(&self) -> Result<(), Error> {
        if self.inspected.swap(true, Ordering::SeqCst) {
            return Err(Error::Invariant(format!(
                "`/{}`: already inspected",
                self.path
            )));
        }
        Ok(())
    }
}

/// An installed (or downloaded) package.
#[derive(Debug)]
pub struct Package {
    /// Package name, e.g. `gcc`.
    pub name: Name,
    /// Package version, e.g. `11.1.0-1`.
    pub version: Name,
    /// Provided capabilities: the package's own name plus every `provides`
    /// entry (e.g. `libudev.so=1-64`).
    pub provides: HashSet<Name>,
    /// Declared optional dependencies, by name.
    pub opt_depends: BTreeSet<Name>,
}

/// Path-and-bitness index over library files.
///
/// A given path maps to one file and therefore one bitness, but a bare
/// soname (in the loader-cache index) can map to both a 32-bit and a 64-bit
/// file, so each key holds a short per-class list.
#[derive(Debug, Default)]
pub struct LibIndex {
    entries: HashMap<Name, Vec<(Class, Arc<File>)>>,
}

impl LibIndex {
    /// Look up by path (or soname) and bitness.
    pub fn get(&self, path: &str, class: Class) -> Option<&Arc<File>> {
        self.entries
            .get(path)?
            .iter()
            .find_map(|(c, file)| (*c == class).then_some(file))
    }

    /// Insert a mapping; on a duplicate key the index is left unchanged and
    /// the previously stored file is returned.
    pub fn insert(&mut self, path: Name, class: Class, file: Arc<File>) -> Option<&Arc<File>> {
        let slot = self.entries.entry(path).or_default();
        match slot.iter().position(|(c, _)| *c == class) {
            Some(i) => Some(&slot[i].1),
            None => {
                slot.push((class, file));
                None
            }
        }
    }

    /// Number of `(path, bitness)` mappings.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all `(path, bitness, file)` mappings.
    pub fn iter(&self) -> impl Iterator<Item = (Name, Class, &Arc<File>)> + '_ {
        self.entries
            .iter()
            .flat_map(|(path, slot)| slot.iter().map(|(c, file)| (*path, *c, file)))
    }
}

/// Everything the phases of the run share.
#[derive(Debug, Default)]
pub struct Data {
    /// Installed packages by name.
    pub packages_by_name: HashMap<Name, Arc<Package>>,
    /// Installed packages by provided capability; first provider wins.
    pub packages_by_provides: HashMap<Name, Arc<Package>>,
    /// Owning package by canonical file path; a file belongs to exactly one
    /// package.
    pub packages_by_file: HashMap<Name, Arc<Package>>,
    /// Files still to be analyzed, by canonical path. The collector fills
    /// this, the resolver removes entries as they resolve; what remains at
    /// the end is the report.
    pub files: HashMap<Name, Arc<File>>,
    /// Library lookup index keyed by canonical and symlink paths.
    pub libs: LibIndex,
    /// Loader-cache index keyed by bare soname, from `ldconfig -p`.
    pub ld_cache: LibIndex,
    /// Union of needed names the first resolver pass could not satisfy;
    /// drives the archive-mining phase.
    pub unresolved: BTreeSet<Name>,
    /// Pending non-installed optional dependencies and, once located, their
    /// archive file names. Sorted by name for deterministic command lines.
    pub archives_by_opt_dep: BTreeMap<Name, Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(pool: &crate::StringPool, s: &str) -> Name {
        pool.intern(s)
    }

    #[test]
    fn double_inspection_is_an_invariant_violation() {
        let pool = crate::StringPool::new();
        let file = File::new(name(&pool, "usr/bin/app"), false);
        file.begin_inspection().unwrap();
        assert!(matches!(
            file.begin_inspection(),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn search_path_equality_is_by_inode() {
        let pool = crate::StringPool::new();
        let a = SearchPath { path: name(&pool, "usr/lib"), inode: 7 };
        let b = SearchPath { path: name(&pool, "lib"), inode: 7 };
        let c = SearchPath { path: name(&pool, "usr/lib"), inode: 8 };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn lib_index_keeps_first_mapping() {
        let pool = crate::StringPool::new();
        let first = File::new(name(&pool, "usr/lib/liba.so.1"), false);
        let second = File::new(name(&pool, "usr/lib32/liba.so.1"), false);
        let mut index = LibIndex::default();
        let soname = name(&pool, "liba.so.1");
        assert!(index.insert(soname, Class::Elf64, first.clone()).is_none());
        // Same soname, other bitness: fine.
        assert!(index.insert(soname, Class::Elf32, second.clone()).is_none());
        // Duplicate key: first mapping wins.
        let existing = index.insert(soname, Class::Elf64, second).map(|f| f.path);
        assert_eq!(existing, Some(first.path));
        assert_eq!(index.get("liba.so.1", Class::Elf64).map(|f| f.path), Some(first.path));
        assert_eq!(index.len(), 2);
    }
}
