//! Make-format dependency file parsing.
//!
//! Compilers write the inputs they actually read as Makefile rules:
//!
//! ```make
//! target1 target2: dep1 \
//!   dep2 dep3 \
//!   dep4
//! ```
//!
//! With escaping rules:
//! - `\ ` (backslash space) = literal space in filename
//! - `\\` = literal backslash
//! - `\#` = literal hash
//! - `\` at end of line = line continuation

use camino::{Utf8Path, Utf8PathBuf};

use crate::LogError;

/// Parse a depfile on disk and return its dependency paths.
pub fn parse_deps_file(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, LogError> {
    let content = std::fs::read(path).map_err(|source| LogError::io("read", path, source))?;
    let content = std::str::from_utf8(&content).map_err(|_| LogError::Invalid {
        path: path.to_owned(),
        reason: "depfile is not utf-8".to_string(),
    })?;
    Ok(parse_deps(content))
}

/// Parse depfile content. Target names (before the colon) are ignored;
/// only the dependency list is extracted, deduplicated preserving order.
pub fn parse_deps(content: &str) -> Vec<Utf8PathBuf> {
    let mut deps = Vec::new();
    let mut in_deps = false; // false = reading targets, true = reading deps
    let mut current_token = String::new();
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            ':' if !in_deps => {
                in_deps = true;
                current_token.clear();
            }
            '\\' => match chars.peek() {
                Some('\n') => {
                    // Line continuation; swallow leading whitespace on
                    // the next line too.
                    chars.next();
                    while chars.peek() == Some(&' ') || chars.peek() == Some(&'\t') {
                        chars.next();
                    }
                }
                Some(' ') => {
                    chars.next();
                    current_token.push(' ');
                }
                Some('\\') => {
                    chars.next();
                    current_token.push('\\');
                }
                Some('#') => {
                    chars.next();
                    current_token.push('#');
                }
                _ => current_token.push('\\'),
            },
            ' ' | '\t' | '\n' => {
                if in_deps && !current_token.is_empty() {
                    deps.push(Utf8PathBuf::from(current_token.clone()));
                    current_token.clear();
                }
                // A newline resets to target-reading, in case the file
                // holds multiple rules.
                if ch == '\n' {
                    in_deps = false;
                    current_token.clear();
                }
            }
            _ => current_token.push(ch),
        }
    }
    if in_deps && !current_token.is_empty() {
        deps.push(Utf8PathBuf::from(current_token));
    }

    let mut seen = std::collections::HashSet::new();
    deps.retain(|dep| seen.insert(dep.clone()));
    deps
}

/// Extract dependencies from MSVC `/showIncludes` output. Non-include
/// lines pass through as the command's real stdout; the caller splits
/// with [`filter_show_includes`].
pub fn parse_show_includes(stdout: &str) -> Vec<Utf8PathBuf> {
    let mut deps = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Note: including file:") {
            let p = Utf8PathBuf::from(rest.trim_start());
            if seen.insert(p.clone()) {
                deps.push(p);
            }
        }
    }
    deps
}

/// Stdout with the `/showIncludes` note lines removed.
pub fn filter_show_includes(stdout: &str) -> String {
    stdout
        .lines()
        .filter(|l| !l.starts_with("Note: including file:"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_depfile() {
        let deps = parse_deps("obj/apps.o: apps/apps.cc apps/apps.h");
        assert_eq!(
            deps,
            vec![
                Utf8PathBuf::from("apps/apps.cc"),
                Utf8PathBuf::from("apps/apps.h")
            ]
        );
    }

    #[test]
    fn line_continuation() {
        let deps = parse_deps("obj/a.o: a.cc \\\n  a.h \\\n  b.h");
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[2], Utf8PathBuf::from("b.h"));
    }

    #[test]
    fn escaped_space_in_filename() {
        let deps = parse_deps(r"a.o: src/my\ file.cc src/other.cc");
        assert_eq!(deps[0], Utf8PathBuf::from("src/my file.cc"));
        assert_eq!(deps[1], Utf8PathBuf::from("src/other.cc"));
    }

    #[test]
    fn escaped_backslash_and_hash() {
        let deps = parse_deps(r"a.o: weird\\name.h has\#hash.h");
        assert_eq!(deps[0], Utf8PathBuf::from(r"weird\name.h"));
        assert_eq!(deps[1], Utf8PathBuf::from("has#hash.h"));
    }

    #[test]
    fn multiple_targets() {
        let deps = parse_deps("a.o a.o.d: a.cc a.h");
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn deduplicates_preserving_order() {
        let deps = parse_deps("a.o: x.h y.h x.h");
        assert_eq!(
            deps,
            vec![Utf8PathBuf::from("x.h"), Utf8PathBuf::from("y.h")]
        );
    }

    #[test]
    fn empty_and_targets_only() {
        assert!(parse_deps("").is_empty());
        assert!(parse_deps("a.o:").is_empty());
    }

    #[test]
    fn show_includes_parsing() {
        let stdout = "Note: including file: base\\base.h\nfoo.cc\nNote: including file:   base\\deep.h\n";
        let deps = parse_show_includes(stdout);
        assert_eq!(
            deps,
            vec![
                Utf8PathBuf::from("base\\base.h"),
                Utf8PathBuf::from("base\\deep.h")
            ]
        );
        assert_eq!(filter_show_includes(stdout), "foo.cc");
    }
}
