#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

//! Resolver scenarios over synthetic data: the indexes are built by hand so
//! every search-order rule can be pinned down without touching the real
//! system.

use std::collections::BTreeSet;
use std::sync::Arc;

use elb::Class;

use ldcheck::Config;
use ldcheck::Context;
use ldcheck::Data;
use ldcheck::File;
use ldcheck::Name;
use ldcheck::Resolver;
use ldcheck::SearchPath;
use ldcheck::StringPool;
use ldcheck::WorkerPool;

fn context() -> Context {
    let names = StringPool::new();
    let mut config = Config::new(&names, None, false).unwrap();
    // The scenarios bring their own directories.
    config.default_libs.clear();
    config.more_libs.clear();
    Context {
        names,
        pool: WorkerPool::new(0),
        config,
    }
}

fn search_path(ctx: &Context, path: &str, inode: u64) -> SearchPath {
    SearchPath {
        path: ctx.names.intern(path),
        inode,
    }
}

/// A dynamic library at `path` registered in the library index.
fn add_lib(ctx: &Context, data: &mut Data, path: &str, class: Class) -> Arc<File> {
    let file = File::new(ctx.names.intern(path), false);
    {
        let mut info = file.info();
        info.class = Some(class);
        info.dynamic = true;
        info.lib = true;
    }
    assert!(data.libs.insert(file.path, class, file.clone()).is_none());
    file
}

/// A dynamic executable at `path` in the working set.
fn add_exe(ctx: &Context, data: &mut Data, path: &str, secure: bool, needed: &[&str]) -> Arc<File> {
    let file = File::new(ctx.names.intern(path), secure);
    {
        let mut info = file.info();
        info.class = Some(Class::Elf64);
        info.dynamic = true;
        info.needed = needed.iter().map(|n| ctx.names.intern(n)).collect();
    }
    data.files.insert(file.path, file.clone());
    file
}

fn unresolved_names(data: &Data) -> Vec<&str> {
    data.unresolved.iter().map(Name::as_str).collect()
}

#[test]
fn happy_path_resolves_through_the_loader_cache() {
    let ctx = context();
    let mut data = Data::default();
    let libm = File::new(ctx.names.intern("usr/lib/libm.so.6"), false);
    {
        let mut info = libm.info();
        info.class = Some(Class::Elf64);
        info.dynamic = true;
        info.lib = true;
    }
    data.ld_cache
        .insert(ctx.names.intern("libm.so.6"), Class::Elf64, libm);
    add_exe(&ctx, &mut data, "usr/bin/app", false, &["libm.so.6"]);

    assert!(Resolver::new(&ctx).execute(&mut data).unwrap());
    assert!(data.files.is_empty());
    assert!(data.unresolved.is_empty());
}

#[test]
fn absolute_needed_entries_hit_the_library_index() {
    let ctx = context();
    let mut data = Data::default();
    add_lib(&ctx, &mut data, "opt/vendor/lib/libz.so", Class::Elf64);
    add_exe(&ctx, &mut data, "usr/bin/app", false, &["/opt/vendor/lib/libz.so"]);

    assert!(Resolver::new(&ctx).execute(&mut data).unwrap());
}

#[test]
fn bitness_must_match() {
    let ctx = context();
    let mut data = Data::default();
    // Only a 32-bit build of the library exists.
    add_lib(&ctx, &mut data, "usr/lib32/libq.so", Class::Elf32);
    let exe = add_exe(&ctx, &mut data, "usr/bin/app", false, &["libq.so"]);
    exe.info().runpaths = vec![search_path(&ctx, "usr/lib32", 1)];

    assert!(!Resolver::new(&ctx).execute(&mut data).unwrap());
    assert_eq!(unresolved_names(&data), vec!["libq.so"]);
}

#[test]
fn runpath_supersedes_rpath() {
    let ctx = context();
    let mut data = Data::default();
    add_lib(&ctx, &mut data, "r1/libq.so", Class::Elf64);
    let exe = add_exe(&ctx, &mut data, "a/x", false, &["libq.so"]);
    {
        let mut info = exe.info();
        info.rpaths = vec![search_path(&ctx, "r1", 1)];
        info.runpaths = vec![search_path(&ctx, "r2", 2)];
    }

    // The library exists only under the RPATH directory, which RUNPATH
    // presence disables: unresolved.
    assert!(!Resolver::new(&ctx).execute(&mut data).unwrap());
    assert_eq!(unresolved_names(&data), vec!["libq.so"]);

    // Without a RUNPATH the very same RPATH directory works.
    let mut data = Data::default();
    add_lib(&ctx, &mut data, "r1/libq.so", Class::Elf64);
    let exe = add_exe(&ctx, &mut data, "a/x", false, &["libq.so"]);
    exe.info().rpaths = vec![search_path(&ctx, "r1", 1)];
    assert!(Resolver::new(&ctx).execute(&mut data).unwrap());
}

#[test]
fn secure_files_ignore_extra_library_roots() {
    let mut ctx = context();
    let extra = search_path(&ctx, "home/user/libs", 7);
    ctx.config.more_libs = vec![extra];

    let mut data = Data::default();
    add_lib(&ctx, &mut data, "home/user/libs/libmagic.so", Class::Elf64);
    add_exe(&ctx, &mut data, "usr/bin/su", true, &["libmagic.so"]);
    add_exe(&ctx, &mut data, "usr/bin/file", false, &["libmagic.so"]);

    // The plain binary resolves through the extra root; the setuid one
    // must not.
    assert!(!Resolver::new(&ctx).execute(&mut data).unwrap());
    assert_eq!(data.files.len(), 1);
    assert!(data.files.contains_key("usr/bin/su"));
    assert_eq!(unresolved_names(&data), vec!["libmagic.so"]);
}

#[test]
fn configured_paths_have_highest_priority() {
    let ctx = context();
    let mut data = Data::default();
    add_lib(&ctx, &mut data, "opt/foo/plugins/libbar.so", Class::Elf64);
    let exe = add_exe(&ctx, &mut data, "opt/foo/bin/tool", false, &["libbar.so"]);
    exe.info().config_paths = vec![search_path(&ctx, "opt/foo/plugins", 3)];

    assert!(Resolver::new(&ctx).execute(&mut data).unwrap());
}

#[test]
fn default_roots_are_searched_last_but_searched() {
    let mut ctx = context();
    ctx.config.default_libs = vec![search_path(&ctx, "usr/lib", 1)];
    let mut data = Data::default();
    add_lib(&ctx, &mut data, "usr/lib/libdl.so.2", Class::Elf64);
    add_exe(&ctx, &mut data, "usr/bin/app", false, &["libdl.so.2"]);

    assert!(Resolver::new(&ctx).execute(&mut data).unwrap());
}

#[test]
fn hits_on_non_libraries_are_recorded_and_settled() {
    let ctx = context();
    let mut data = Data::default();
    // The index target is a dynamic executable, not a library.
    let not_a_lib = File::new(ctx.names.intern("usr/lib/helper"), false);
    {
        let mut info = not_a_lib.info();
        info.class = Some(Class::Elf64);
        info.dynamic = true;
    }
    data.libs
        .insert(not_a_lib.path, Class::Elf64, not_a_lib.clone());
    let exe = add_exe(&ctx, &mut data, "usr/bin/app", false, &["helper"]);
    exe.info().runpaths = vec![search_path(&ctx, "usr/lib", 1)];

    // The entry is written off with an error record instead of being
    // reported as unresolved over and over.
    assert!(Resolver::new(&ctx).execute(&mut data).unwrap());
    assert!(data.unresolved.is_empty());
}

#[test]
fn self_resolution_is_an_error_record() {
    let ctx = context();
    let mut data = Data::default();
    let lib = add_lib(&ctx, &mut data, "usr/lib/libself.so", Class::Elf64);
    {
        let mut info = lib.info();
        info.needed = BTreeSet::from([ctx.names.intern("/usr/lib/libself.so")]);
    }
    data.files.insert(lib.path, lib.clone());

    assert!(Resolver::new(&ctx).execute(&mut data).unwrap());
}

/// Optional-dependency completion: the first pass leaves a name unresolved,
/// archive mining adds the library to the index, the second pass succeeds.
#[test]
fn second_pass_after_archive_mining() {
    let ctx = context();
    let mut data = Data::default();
    let exe = add_exe(&ctx, &mut data, "usr/bin/some-app", false, &["libopencl.so.1"]);
    exe.info().runpaths = vec![search_path(&ctx, "usr/lib", 1)];

    assert!(!Resolver::new(&ctx).execute(&mut data).unwrap());
    assert_eq!(unresolved_names(&data), vec!["libopencl.so.1"]);

    // What the ocl-icd archive scan would contribute.
    add_lib(&ctx, &mut data, "usr/lib/libopencl.so.1", Class::Elf64);
    assert!(Resolver::new(&ctx).execute(&mut data).unwrap());
    assert!(data.files.is_empty());
    assert!(data.unresolved.is_empty());
}

#[test]
fn report_groups_and_sorts() {
    let ctx = context();
    let mut data = Data::default();
    let packaged = add_exe(&ctx, &mut data, "usr/bin/zz", false, &["libz.so", "liba.so"]);
    packaged.info().package = Some(Arc::new(ldcheck::Package {
        name: ctx.names.intern("zeta"),
        version: ctx.names.intern("1.0-1"),
        provides: Default::default(),
        opt_depends: Default::default(),
    }));
    add_exe(&ctx, &mut data, "usr/bin/aa", false, &["libq.so"]);

    let resolver = Resolver::new(&ctx);
    assert!(!resolver.execute(&mut data).unwrap());
    let report = resolver.report(&data);
    assert_eq!(report.num_files, 2);
    assert_eq!(report.num_unassigned, 1);
    assert_eq!(report.groups.len(), 2);
    // Packages first (sorted by name), the unassigned bucket last.
    assert_eq!(
        report.groups[0].package.map(|(name, _)| name.as_str().to_owned()),
        Some("zeta".to_owned())
    );
    assert!(report.groups[1].package.is_none());
    // Needed names are sorted within a file.
    assert_eq!(
        report.groups[0].files[0]
            .needed
            .iter()
            .map(|n| n.as_str())
            .collect::<Vec<_>>(),
        vec!["liba.so", "libz.so"]
    );
}
