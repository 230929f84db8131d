//! Preprocessor-subset lexer.
//!
//! Extracts the directives the scanner cares about: `#include` /
//! `#import` (quoted, angled, or macro-valued), `#define`, and `#undef`.
//! Comments and line continuations are handled; conditionals are not
//! evaluated (both branches are scanned).

/// One include directive as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Include {
    /// `#include "path"` — quote form, current directory searched first.
    Quote(String),
    /// `#include <path>` — angle form, current directory skipped.
    Angle(String),
    /// `#include MACRO` — value looked up in the macro table.
    Macro(String),
}

/// A directive relevant to dependency scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Include(Include),
    /// `#define NAME "value"` or `#define NAME <value>`; only
    /// include-shaped values are tracked.
    Define { name: String, value: String },
    Undef(String),
}

/// Scan source text for directives.
pub fn scan_directives(src: &str) -> Vec<Directive> {
    let mut out = Vec::new();
    let mut in_block_comment = false;
    for line in logical_lines(src) {
        let line = strip_comments(&line, &mut in_block_comment);
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix('#') else {
            continue;
        };
        let rest = rest.trim_start();
        if let Some(arg) = strip_directive(rest, "include")
            .or_else(|| strip_directive(rest, "import"))
        {
            if let Some(inc) = parse_include(arg) {
                out.push(Directive::Include(inc));
            }
        } else if let Some(arg) = strip_directive(rest, "define") {
            if let Some((name, value)) = parse_define(arg) {
                out.push(Directive::Define { name, value });
            }
        } else if let Some(arg) = strip_directive(rest, "undef") {
            let name = arg.split_whitespace().next().unwrap_or("");
            if !name.is_empty() {
                out.push(Directive::Undef(name.to_string()));
            }
        }
    }
    out
}

/// Split into lines, joining `\`-continued lines first (the
/// preprocessor does this before anything else).
fn logical_lines(src: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut cur = String::new();
    for raw in src.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(stripped) = raw.strip_suffix('\\') {
            cur.push_str(stripped);
            continue;
        }
        cur.push_str(raw);
        lines.push(std::mem::take(&mut cur));
    }
    if !cur.is_empty() {
        lines.push(cur);
    }
    lines
}

/// Remove `/* ... */` and `// ...` comment text, carrying block-comment
/// state across lines. String literals are left alone; a directive line
/// never has a bare `//` inside its include token.
fn strip_comments(line: &str, in_block: &mut bool) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < bytes.len() {
        if *in_block {
            if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                *in_block = false;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        if bytes[i] == b'/' && i + 1 < bytes.len() {
            match bytes[i + 1] {
                b'/' => break,
                b'*' => {
                    *in_block = true;
                    i += 2;
                    // Comment reads as a single space.
                    out.push(' ');
                    continue;
                }
                _ => {}
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn strip_directive<'a>(rest: &'a str, name: &str) -> Option<&'a str> {
    let after = rest.strip_prefix(name)?;
    // Require a delimiter so `#include_next` is not mistaken for
    // `#include`.
    match after.chars().next() {
        Some(c) if c.is_whitespace() || c == '"' || c == '<' => Some(after.trim_start()),
        None => Some(""),
        _ => None,
    }
}

pub(crate) fn parse_include(arg: &str) -> Option<Include> {
    let arg = arg.trim();
    if let Some(rest) = arg.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some(Include::Quote(rest[..end].to_string()));
    }
    if let Some(rest) = arg.strip_prefix('<') {
        let end = rest.find('>')?;
        return Some(Include::Angle(rest[..end].to_string()));
    }
    let name: String = arg
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() {
        return None;
    }
    Some(Include::Macro(name))
}

/// Parse `#define NAME value`, keeping only object-like macros whose
/// value is include-shaped (`"..."` or `<...>`).
fn parse_define(arg: &str) -> Option<(String, String)> {
    let mut chars = arg.char_indices();
    let mut name_end = arg.len();
    for (i, c) in chars.by_ref() {
        if !(c.is_ascii_alphanumeric() || c == '_') {
            name_end = i;
            break;
        }
    }
    let name = &arg[..name_end];
    if name.is_empty() {
        return None;
    }
    let rest = &arg[name_end..];
    if rest.starts_with('(') {
        // Function-like macro; never an include value.
        return None;
    }
    let value = rest.trim();
    if value.starts_with('"') {
        let end = value[1..].find('"')? + 1;
        return Some((name.to_string(), value[..=end].to_string()));
    }
    if value.starts_with('<') {
        let end = value.find('>')?;
        return Some((name.to_string(), value[..=end].to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_quote_and_angle_includes() {
        let got = scan_directives(
            r#"
#include <unistd.h>

#include <string>
#include "apps/apps.h"
#include "glog/logging.h"
"#,
        );
        assert_eq!(
            got,
            vec![
                Directive::Include(Include::Angle("unistd.h".into())),
                Directive::Include(Include::Angle("string".into())),
                Directive::Include(Include::Quote("apps/apps.h".into())),
                Directive::Include(Include::Quote("glog/logging.h".into())),
            ]
        );
    }

    #[test]
    fn import_is_an_include() {
        let got = scan_directives("#import <Foo/Bar.h>\n#import \"Baz.h\"\n");
        assert_eq!(
            got,
            vec![
                Directive::Include(Include::Angle("Foo/Bar.h".into())),
                Directive::Include(Include::Quote("Baz.h".into())),
            ]
        );
    }

    #[test]
    fn include_inside_block_comment_is_ignored() {
        let got = scan_directives(
            r#"
/*
    #include "vk_mem_alloc.h"
*/
#include <mutex>
"#,
        );
        assert_eq!(
            got,
            vec![Directive::Include(Include::Angle("mutex".into()))]
        );
    }

    #[test]
    fn line_comment_is_ignored() {
        let got = scan_directives("// #include \"a.h\"\n#include \"b.h\" // trailing\n");
        assert_eq!(got, vec![Directive::Include(Include::Quote("b.h".into()))]);
    }

    #[test]
    fn macro_include_and_defines() {
        let got = scan_directives(
            r#"
#define HB_STRING_ARRAY_NAME format1_names
#define HB_STRING_ARRAY_LIST "hb-ot-post-macroman.hh"
#include HB_STRING_ARRAY_LIST
#undef HB_STRING_ARRAY_LIST
"#,
        );
        assert_eq!(
            got,
            vec![
                Directive::Define {
                    name: "HB_STRING_ARRAY_LIST".into(),
                    value: "\"hb-ot-post-macroman.hh\"".into(),
                },
                Directive::Include(Include::Macro("HB_STRING_ARRAY_LIST".into())),
                Directive::Undef("HB_STRING_ARRAY_LIST".into()),
            ]
        );
    }

    #[test]
    fn continuation_lines_are_joined() {
        let got = scan_directives("#include \\\n\"split.h\"\n");
        assert_eq!(
            got,
            vec![Directive::Include(Include::Quote("split.h".into()))]
        );
    }

    #[test]
    fn include_next_is_not_an_include() {
        let got = scan_directives("#include_next <stdlib.h>\n");
        assert!(got.is_empty());
    }

    #[test]
    fn whitespace_after_hash() {
        let got = scan_directives("  #  include <a.h>\n");
        assert_eq!(got, vec![Directive::Include(Include::Angle("a.h".into()))]);
    }

    #[test]
    fn angle_define_value() {
        let got = scan_directives("#define CONF_H <config/site.h>\n#define N 3\n");
        assert_eq!(
            got,
            vec![Directive::Define {
                name: "CONF_H".into(),
                value: "<config/site.h>".into(),
            }]
        );
    }
}
