//! Minimal INI-style configuration reader.
//!
//! The grammar is deliberately thin: trimmed `key = value` lines with `#`
//! comments and no sections. Anything more would be overkill for the handful
//! of recognized keys.

use crate::Error;

/// One recognized `key = value` line.
#[derive(Debug)]
pub struct Line<'a> {
    /// Trimmed key.
    pub key: &'a str,
    /// Trimmed value; may contain inner whitespace.
    pub value: &'a str,
    /// 1-based line number, for error messages.
    pub number: usize,
}

/// Parse `contents`, calling `on_line` for every non-comment line.
///
/// `on_line` returns `Ok(false)` for a key it does not recognize, which turns
/// into a configuration error here.
pub fn parse<F>(contents: &str, mut on_line: F) -> Result<(), Error>
where
    F: FnMut(&Line<'_>) -> Result<bool, Error>,
{
    for (i, raw) in contents.lines().enumerate() {
        let number = i + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::Config(format!(
                "line {number}: expected `key = value`"
            )));
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(Error::Config(format!(
                "line {number}: expected `key = value`"
            )));
        }
        if !on_line(&Line { key, value, number })? {
            return Err(Error::Config(format!("line {number}: unknown key `{key}`")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(contents: &str) -> Result<Vec<(String, String, usize)>, Error> {
        let mut lines = Vec::new();
        parse(contents, |line| {
            lines.push((line.key.to_owned(), line.value.to_owned(), line.number));
            Ok(true)
        })?;
        Ok(lines)
    }

    #[test]
    fn parses_trimmed_lines_and_comments() {
        let lines = collect(
            "# comment\n\
             \n\
             scanMoreBins = /opt/bin /srv/bin\n\
             \t ignoreFile =  ^usr/lib/modules/.*  \n",
        )
        .unwrap();
        assert_eq!(
            lines,
            vec![
                ("scanMoreBins".into(), "/opt/bin /srv/bin".into(), 3),
                ("ignoreFile".into(), "^usr/lib/modules/.*".into(), 4),
            ]
        );
    }

    #[test]
    fn rejects_lines_without_key() {
        assert!(collect("no equals sign").is_err());
        assert!(collect("= value").is_err());
    }

    #[test]
    fn unknown_key_is_an_error() {
        let result = parse("bogusKey = 1\n", |_| Ok(false));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
