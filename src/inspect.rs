//! Extraction of `DT_NEEDED`, `DT_RPATH` and `DT_RUNPATH` from ELF images,
//! on disk or decompressed from a package archive.

use std::io::Cursor;
use std::io::Read;
use std::io::Seek;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use elb::DynamicTag;
use elb::Elf;
use elb::FileKind;
use elb::SectionKind;
use log::debug;
use log::error;
use log::warn;

use crate::paths;
use crate::Context;
use crate::Error;
use crate::File;
use crate::SearchPath;

/// Page size assumed when reading ELF images; only used by `elb` validation.
const PAGE_SIZE: u64 = 4096;

/// Reads the dynamic section of candidate files.
///
/// Parse failures are per-file: they are logged and leave the file with
/// `dynamic = false`, which the resolver later filters out. The only hard
/// error is a second inspection of the same file.
#[derive(Debug)]
pub struct Inspector<'a> {
    ctx: &'a Context,
}

impl<'a> Inspector<'a> {
    /// Create an inspector over the shared context.
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Inspect a file on disk.
    ///
    /// `on_dir` receives every existing directory found in `DT_RPATH` or
    /// `DT_RUNPATH`, so the collector can queue it for crawling.
    pub fn inspect_file<F>(&self, file: &File, on_dir: F) -> Result<(), Error>
    where
        F: FnMut(SearchPath),
    {
        file.begin_inspection()?;
        let mut reader = match fs_err::File::open(format!("/{}", file.path)) {
            Ok(reader) => reader,
            Err(e) => {
                // A few broken files must not break the whole run.
                error!("`/{}`: open failed: {e}", file.path);
                return Ok(());
            }
        };
        self.inspect_reader(file, &mut reader, on_dir);
        Ok(())
    }

    /// Inspect an image decompressed into memory from a package archive.
    pub fn inspect_buffer(&self, file: &File, bytes: &[u8]) -> Result<(), Error> {
        file.begin_inspection()?;
        let mut reader = Cursor::new(bytes);
        self.inspect_reader(file, &mut reader, |_| {});
        Ok(())
    }

    fn inspect_reader<R, F>(&self, file: &File, reader: &mut R, on_dir: F)
    where
        R: Read + Seek,
        F: FnMut(SearchPath),
    {
        match self.parse(file, reader, on_dir) {
            Ok(()) => {}
            Err(Error::Elf(elb::Error::NotElf)) => {
                debug!("`/{}`: skip: not ELF", file.path);
            }
            Err(e) => error!("`/{}`: skip: {e}", file.path),
        }
    }

    fn parse<R, F>(&self, file: &File, reader: &mut R, mut on_dir: F) -> Result<(), Error>
    where
        R: Read + Seek,
        F: FnMut(SearchPath),
    {
        let elf = Elf::read_unchecked(reader, PAGE_SIZE)?;
        file.info().class = Some(elf.header.class);
        match elf.header.kind {
            FileKind::Executable | FileKind::Shared => {}
            _ => {
                debug!("`/{}`: skip: neither executable nor shared", file.path);
                return Ok(());
            }
        }
        let num_dynamic = elf
            .sections
            .iter()
            .filter(|section| section.kind == SectionKind::Dynamic)
            .count();
        if num_dynamic > 1 {
            return Err(Error::Malformed(format!(
                "`/{}`: found {num_dynamic} DYNAMIC sections",
                file.path
            )));
        }
        let Some(dynamic_table) = elf.read_dynamic_table(reader)? else {
            debug!("`/{}`: skip: not a dynamic ELF", file.path);
            return Ok(());
        };
        let strings = elf.read_dynamic_string_table(reader)?.unwrap_or_default();

        for (tag, label) in [(DynamicTag::Rpath, "RPATH"), (DynamicTag::Runpath, "RUNPATH")] {
            let Some(offset) = dynamic_table.get(tag) else {
                continue;
            };
            let Some(value) = strings.get_string(offset as usize) else {
                warn!("`/{}`: skip {label}: no string table entry", file.path);
                continue;
            };
            let Ok(value) = std::str::from_utf8(value.to_bytes()) else {
                warn!("`/{}`: skip {label}: not UTF-8", file.path);
                continue;
            };
            let dirs = self.parse_run_paths(file, label, value, &mut on_dir)?;
            let mut info = file.info();
            match tag {
                DynamicTag::Rpath => info.rpaths = dirs,
                _ => info.runpaths = dirs,
            }
        }

        for (tag, value) in dynamic_table.iter() {
            if *tag != DynamicTag::Needed {
                continue;
            }
            let Some(name) = strings.get_string(*value as usize) else {
                warn!("`/{}`: skip needed lib: no string table entry", file.path);
                continue;
            };
            let Ok(name) = std::str::from_utf8(name.to_bytes()) else {
                warn!("`/{}`: skip needed lib: not UTF-8", file.path);
                continue;
            };
            if !name.starts_with('/') && name.contains('/') {
                // Relative like `./subdir/x.so`: there is no defined base
                // directory to search against.
                warn!(
                    "`/{}`: skip needed lib `{name}`: non-absolute but contains '/'",
                    file.path
                );
                continue;
            }
            if file.info().needed.insert(self.ctx.names.intern(name)) {
                debug!("`/{}`: add needed lib `{name}`", file.path);
            } else {
                debug!("`/{}`: skip needed lib `{name}`: already added", file.path);
            }
        }

        let mut info = file.info();
        info.lib = elf.header.kind == FileKind::Shared;
        info.dynamic = true;
        debug!(
            "`/{}`: is {}-bit {}{}",
            file.path,
            match elf.header.class {
                elb::Class::Elf32 => "32",
                elb::Class::Elf64 => "64",
            },
            if info.lib { "library" } else { "executable" },
            if file.secure { ", secure" } else { "" }
        );
        Ok(())
    }

    /// Parse one colon-separated RPATH/RUNPATH value into existing,
    /// canonical directories.
    fn parse_run_paths<F>(
        &self,
        file: &File,
        label: &str,
        value: &str,
        on_dir: &mut F,
    ) -> Result<Vec<SearchPath>, Error>
    where
        F: FnMut(SearchPath),
    {
        let mut dirs = Vec::new();
        for entry in value.split(':').filter(|s| !s.is_empty()) {
            let effective = match substitute_origin(entry, &file.path) {
                Some(effective) => effective,
                None if entry.starts_with('/') => entry.to_owned(),
                None => {
                    warn!("`/{}`: skip {label} `{entry}`: non-absolute path", file.path);
                    continue;
                }
            };
            let Some(canonical) = paths::canonicalize(Path::new(&effective))? else {
                warn!("`/{}`: skip {label} `{entry}`: missing path", file.path);
                continue;
            };
            if canonical != Path::new(&effective) {
                debug!(
                    "`/{}`: rewrite {label} `{entry}` ---> `{}`",
                    file.path,
                    canonical.display()
                );
            }
            let meta = fs_err::metadata(&canonical)?;
            if !meta.is_dir() {
                warn!("`/{}`: skip {label} `{entry}`: not a directory", file.path);
                continue;
            }
            let Some(path1) = paths::path1(&canonical) else {
                warn!("`/{}`: skip {label} `{entry}`: not UTF-8", file.path);
                continue;
            };
            let search_path = SearchPath {
                path: self.ctx.names.intern(path1),
                inode: meta.ino(),
            };
            // The collector does not scan the same directory twice, so no
            // deduplication is needed here.
            on_dir(search_path);
            dirs.push(search_path);
            debug!("`/{}`: add {label} `{entry}`", file.path);
        }
        Ok(dirs)
    }
}

/// Substitute a leading `$ORIGIN` with the directory containing the object
/// itself.
///
/// `man 8 ld.so` documents `$ORIGIN` as the directory of the *executable*,
/// but in practice shared libraries use it relative to themselves and `ldd`
/// resolves it that way (Qt plugins being the classic example), so that is
/// what we emulate. Returns `None` if the entry does not start with
/// `$ORIGIN`.
fn substitute_origin(entry: &str, path1: &str) -> Option<String> {
    let rest = if entry == "$ORIGIN" {
        ""
    } else {
        entry.strip_prefix("$ORIGIN/")?
    };
    let parent = match path1.rfind('/') {
        Some(i) => &path1[..i],
        None => "",
    };
    if rest.is_empty() {
        Some(format!("/{parent}"))
    } else {
        Some(format!("/{parent}/{rest}"))
    }
}

#[cfg(test)]
mod tests {
    use elb::Class;

    use super::*;
    use crate::testelf;
    use crate::Config;
    use crate::StringPool;
    use crate::WorkerPool;

    fn context() -> Context {
        let names = StringPool::new();
        let config = Config::new(&names, None, false).unwrap();
        Context {
            names,
            pool: WorkerPool::new(0),
            config,
        }
    }

    #[test]
    fn inspects_a_shared_object_from_disk() {
        let ctx = context();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("foo/lib")).unwrap();
        std::fs::create_dir_all(root.join("foo/plugins")).unwrap();
        let image = testelf::build(&testelf::ElfSpec {
            kind: testelf::ET_DYN,
            needed: &["libbar.so"],
            rpath: Some("$ORIGIN/../plugins:relative:/missing/dir"),
            ..Default::default()
        });
        let lib_path = root.join("foo/lib/libfoo.so");
        std::fs::write(&lib_path, image).unwrap();

        let file = File::new(ctx.names.intern(paths::path1(&lib_path).unwrap()), false);
        let mut dirs = Vec::new();
        Inspector::new(&ctx)
            .inspect_file(&file, |search_path| dirs.push(search_path))
            .unwrap();

        let info = file.info();
        assert!(info.dynamic);
        assert!(info.lib);
        assert_eq!(info.class, Some(Class::Elf64));
        assert!(info.needed.contains("libbar.so"));
        // $ORIGIN resolved against the library's own directory; the
        // relative and the missing entries were dropped.
        let plugins = paths::path1(&root.join("foo/plugins")).unwrap().to_owned();
        assert_eq!(info.rpaths.len(), 1);
        assert_eq!(info.rpaths[0].path.as_str(), plugins);
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].path.as_str(), plugins);
        assert!(info.runpaths.is_empty());
    }

    #[test]
    fn executables_are_dynamic_but_not_libraries() {
        let ctx = context();
        let image = testelf::build(&testelf::ElfSpec {
            kind: testelf::ET_EXEC,
            needed: &["libm.so.6"],
            ..Default::default()
        });
        let file = File::new(ctx.names.intern("usr/bin/app"), false);
        Inspector::new(&ctx).inspect_buffer(&file, &image).unwrap();
        let info = file.info();
        assert!(info.dynamic);
        assert!(!info.lib);
    }

    #[test]
    fn needed_entry_classification() {
        let ctx = context();
        let image = testelf::build(&testelf::ElfSpec {
            kind: testelf::ET_DYN,
            needed: &["/usr/lib/libabs.so", "./weird/x.so", "libok.so", "libok.so"],
            ..Default::default()
        });
        let file = File::new(ctx.names.intern("usr/lib/libclassify.so"), false);
        Inspector::new(&ctx).inspect_buffer(&file, &image).unwrap();
        let info = file.info();
        // Absolute kept, bare soname kept once, ambiguous relative dropped.
        let needed: Vec<&str> = info.needed.iter().map(|n| n.as_str()).collect();
        assert_eq!(needed, vec!["/usr/lib/libabs.so", "libok.so"]);
    }

    #[test]
    fn second_inspection_fails() {
        let ctx = context();
        let image = testelf::build(&testelf::ElfSpec::default());
        let file = File::new(ctx.names.intern("usr/lib/libonce.so"), false);
        let inspector = Inspector::new(&ctx);
        inspector.inspect_buffer(&file, &image).unwrap();
        assert!(matches!(
            inspector.inspect_buffer(&file, &image),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn non_elf_input_is_tolerated() {
        let ctx = context();
        let file = File::new(ctx.names.intern("usr/bin/script"), false);
        Inspector::new(&ctx)
            .inspect_buffer(&file, b"#!/bin/sh\necho hello\n")
            .unwrap();
        let info = file.info();
        assert!(!info.dynamic);
        assert!(info.needed.is_empty());
    }

    #[test]
    fn origin_resolves_against_the_object_itself() {
        assert_eq!(
            substitute_origin("$ORIGIN", "opt/foo/lib/libfoo.so"),
            Some("/opt/foo/lib".to_owned())
        );
        assert_eq!(
            substitute_origin("$ORIGIN/../plugins", "opt/foo/lib/libfoo.so"),
            Some("/opt/foo/lib/../plugins".to_owned())
        );
        // Not an $ORIGIN entry at all.
        assert_eq!(substitute_origin("/usr/lib", "opt/foo/lib/libfoo.so"), None);
        assert_eq!(substitute_origin("plugins", "opt/foo/lib/libfoo.so"), None);
        // `$ORIGINX` is a plain (relative) directory name, not a variable.
        assert_eq!(substitute_origin("$ORIGINX", "opt/foo/lib/libfoo.so"), None);
    }
}
