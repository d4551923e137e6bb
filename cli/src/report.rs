use std::io::BufWriter;
use std::io::Write;

use colored::Colorize;
use ldcheck::Report;

const TITLE_PACKAGE: &str = "Package";
const TITLE_FILE: &str = "Problematic File";
const TITLE_LIBS: &str = "Unresolved Needed Libs";
const UNASSIGNED: &str = "(unassigned)";

/// Print the grouped report to stderr, either as a three-column table or as
/// a nested block.
pub fn render(report: &Report, wide: bool) -> Result<(), std::io::Error> {
    let mut writer = BufWriter::new(std::io::stderr());
    if wide {
        render_wide(&mut writer, report)?;
    } else {
        render_narrow(&mut writer, report)?;
    }
    let packages = report
        .groups
        .iter()
        .filter(|group| group.package.is_some())
        .count();
    writeln!(
        writer,
        "Total {} problematic file(s): {} in {} package(s) + {} unassigned.",
        report.num_files,
        report.num_files - report.num_unassigned,
        packages,
        report.num_unassigned
    )?;
    if wide {
        let width = table_widths(report);
        writeln!(writer, "{}", "-".repeat(width.0 + 3 + width.1 + 3 + width.2))?;
    }
    writer.flush()
}

fn package_cell(package: &Option<(ldcheck::Name, ldcheck::Name)>) -> String {
    match package {
        Some((name, version)) => format!("{name} {version}"),
        None => UNASSIGNED.to_owned(),
    }
}

fn table_widths(report: &Report) -> (usize, usize, usize) {
    let mut package_width = TITLE_PACKAGE.len().max(UNASSIGNED.len());
    let mut file_width = TITLE_FILE.len();
    let mut libs_width = TITLE_LIBS.len();
    for group in &report.groups {
        package_width = package_width.max(package_cell(&group.package).len());
        for file in &group.files {
            file_width = file_width.max(file.path.len() + 1);
            for name in &file.needed {
                libs_width = libs_width.max(name.len());
            }
        }
    }
    (package_width, file_width, libs_width)
}

fn render_wide<W: Write>(writer: &mut W, report: &Report) -> Result<(), std::io::Error> {
    let (package_width, file_width, libs_width) = table_widths(report);
    let separator = |writer: &mut W| {
        writeln!(
            writer,
            "{}   {}   {}",
            "-".repeat(package_width),
            "-".repeat(file_width),
            "-".repeat(libs_width)
        )
    };
    separator(writer)?;
    writeln!(
        writer,
        "{TITLE_PACKAGE:<package_width$}   {TITLE_FILE:<file_width$}   {TITLE_LIBS:<libs_width$}"
    )?;
    separator(writer)?;
    for group in &report.groups {
        let mut first_of_package = true;
        for file in &group.files {
            let mut first_of_file = true;
            for name in &file.needed {
                // Repeating the package and file cells on every row keeps
                // the output grep-friendly; emphasis marks the first row.
                let package = format!("{:<package_width$}", package_cell(&group.package));
                let package = if first_of_package {
                    package.bold().to_string()
                } else {
                    package
                };
                let path = format!("{:<file_width$}", format!("/{}", file.path));
                let path = if first_of_file {
                    path.bold().to_string()
                } else {
                    path
                };
                writeln!(writer, "{package}   {path}   {name:<libs_width$}")?;
                first_of_package = false;
                first_of_file = false;
            }
        }
    }
    writeln!(
        writer,
        "{}",
        "-".repeat(package_width + 3 + file_width + 3 + libs_width)
    )?;
    Ok(())
}

fn render_narrow<W: Write>(writer: &mut W, report: &Report) -> Result<(), std::io::Error> {
    for group in &report.groups {
        match &group.package {
            Some((name, version)) => writeln!(writer, "Package: {name} {version}")?,
            None => writeln!(writer, "{UNASSIGNED}")?,
        }
        for file in &group.files {
            writeln!(writer, "    File: /{}", file.path)?;
            for name in &file.needed {
                writeln!(writer, "        Lib: {name}")?;
            }
        }
    }
    Ok(())
}
