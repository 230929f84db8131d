//! Compile-command flag extraction.
//!
//! Parses a C/C++ compile command line into the include configuration
//! the scanner needs. Only the major flags used by Chromium and Android
//! builds are understood; response files (`@rspfile`) are expanded
//! in place.

use std::collections::HashMap;

use tracing::debug;

use crate::Request;

/// Parameters extracted from a compile command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanDepsParams {
    /// Source files.
    pub sources: Vec<String>,
    /// Forced includes (`-include`, `--include=`).
    pub includes: Vec<String>,
    /// Input files that are not sources (response files, sanitizer
    /// ignore lists, profile data, module maps).
    pub files: Vec<String>,
    /// Include directories (`-I`, `-iquote`, `-isystem`,
    /// `--include-directory`).
    pub dirs: Vec<String>,
    /// Framework directories (`-F`, `-iframework`).
    pub frameworks: Vec<String>,
    /// Sysroot and toolchain root directories.
    pub sysroots: Vec<String>,
    /// Include-shaped macro definitions (`-DX="path.h"`).
    pub defines: HashMap<String, String>,
}

impl ScanDepsParams {
    /// The scanner request for these parameters.
    pub fn into_request(self) -> Request {
        Request {
            sources: self.sources,
            includes: self.includes,
            dirs: self.dirs,
            frameworks: self.frameworks,
            sysroots: self.sysroots,
            defines: self.defines,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    #[error("failed to read response file @{path}: {reason}")]
    Rspfile { path: String, reason: String },

    #[error("unbalanced quote in command line: {0}")]
    UnbalancedQuote(String),

    #[error("unsupported shell command line")]
    UnsupportedShell,
}

/// Extract scan parameters from a compile command line.
///
/// `read_file` loads response files, relative to the exec root.
pub fn extract_scan_deps_params(
    args: &[String],
    read_file: impl Fn(&str) -> Result<String, String>,
) -> Result<ScanDepsParams, FlagError> {
    let mut res = ScanDepsParams::default();
    let mut args = normalize_args(args)?;

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].clone();
        if !arg.starts_with('-') {
            let cmdname = arg.rsplit('/').next().unwrap_or(&arg);
            if cmdname.ends_with("clang")
                || cmdname.ends_with("clang++")
                || cmdname.ends_with("gcc")
                || cmdname.ends_with("g++")
            {
                // The toolchain's own headers live two levels above the
                // compiler binary.
                if let Some(dir) = parent_dir(parent_dir(&arg).unwrap_or("")) {
                    res.sysroots.push(dir.to_string());
                }
            }
        }
        match arg.as_str() {
            "-I" | "--include-directory" | "-isystem" | "-iquote" => {
                i += 1;
                if let Some(v) = args.get(i) {
                    res.dirs.push(v.clone());
                }
                i += 1;
                continue;
            }
            "-F" | "-iframework" => {
                i += 1;
                if let Some(v) = args.get(i) {
                    res.frameworks.push(v.clone());
                }
                i += 1;
                continue;
            }
            "-include" => {
                i += 1;
                if let Some(v) = args.get(i) {
                    res.includes.push(v.clone());
                }
                i += 1;
                continue;
            }
            "-isysroot" | "--sysroot" => {
                i += 1;
                if let Some(v) = args.get(i) {
                    res.sysroots.push(v.clone());
                }
                i += 1;
                continue;
            }
            "-D" => {
                i += 1;
                if let Some(v) = args.get(i) {
                    define_macro(&mut res.defines, v);
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        if let Some(rspfile) = arg.strip_prefix('@') {
            // https://llvm.org/docs/CommandLine.html#response-files
            res.files.push(rspfile.to_string());
            let buf = read_file(rspfile).map_err(|reason| FlagError::Rspfile {
                path: rspfile.to_string(),
                reason,
            })?;
            let rsp_args = split_shell(&buf)?;
            let tail = args.split_off(i + 1);
            args.extend(rsp_args);
            args.extend(tail);
        } else if let Some(v) = arg.strip_prefix("-I") {
            res.dirs.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("--include=") {
            res.includes.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("--include-directory=") {
            res.dirs.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-iquote") {
            res.dirs.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-isystem") {
            res.dirs.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-iframework") {
            res.frameworks.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-fmodule-file=") {
            // -fmodule-file=[name=]path
            let path = v.split_once('=').map(|(_, p)| p).unwrap_or(v);
            res.files.push(path.to_string());
        } else if let Some(v) = arg.strip_prefix("-fmodule-map-file=") {
            res.files.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-fprofile-list=") {
            res.files.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-fprofile-use=") {
            res.files.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-fprofile-sample-use=") {
            res.files.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-fsanitize-ignorelist=") {
            res.files.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("--gcc-toolchain=") {
            res.sysroots.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("--sysroot=") {
            res.sysroots.push(v.to_string());
        } else if let Some(v) = arg.strip_prefix("-D") {
            define_macro(&mut res.defines, v);
        } else if !arg.starts_with('-') {
            let ext = arg.rsplit('.').next().unwrap_or("");
            if matches!(ext, "c" | "cc" | "cxx" | "cpp" | "m" | "mm" | "S") {
                res.sources.push(arg.clone());
            }
        }
        i += 1;
    }
    debug!(
        sources = res.sources.len(),
        dirs = res.dirs.len(),
        "extracted scandeps params"
    );
    Ok(res)
}

/// Android's ninja files wrap commands as `/bin/sh -c "PWD=/proc/self/cwd
/// <command>"`; unwrap that form before parsing.
fn normalize_args(args: &[String]) -> Result<Vec<String>, FlagError> {
    if args.len() == 3 && args[0] == "/bin/sh" && args[1] == "-c" {
        let cmd = args[2]
            .strip_prefix("PWD=/proc/self/cwd ")
            .ok_or(FlagError::UnsupportedShell)?;
        return split_shell(cmd);
    }
    Ok(args.to_vec())
}

fn define_macro(defines: &mut HashMap<String, String>, arg: &str) {
    // arg: MACRO=value; only include-shaped values are useful.
    let Some((macro_name, value)) = arg.split_once('=') else {
        return;
    };
    if value.starts_with('<') || value.starts_with('"') {
        defines.insert(macro_name.to_string(), value.to_string());
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rfind('/').map(|i| &path[..i])
}

/// Minimal POSIX-ish shell word splitting: whitespace separation with
/// single quotes, double quotes, and backslash escapes.
pub fn split_shell(s: &str) -> Result<Vec<String>, FlagError> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut has_word = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                if has_word {
                    out.push(std::mem::take(&mut cur));
                    has_word = false;
                }
            }
            '\'' => {
                has_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => cur.push(c),
                        None => return Err(FlagError::UnbalancedQuote(s.to_string())),
                    }
                }
            }
            '"' => {
                has_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\' | '$' | '`')) => cur.push(e),
                            Some(e) => {
                                cur.push('\\');
                                cur.push(e);
                            }
                            None => return Err(FlagError::UnbalancedQuote(s.to_string())),
                        },
                        Some(c) => cur.push(c),
                        None => return Err(FlagError::UnbalancedQuote(s.to_string())),
                    }
                }
            }
            '\\' => {
                has_word = true;
                match chars.next() {
                    Some(e) => cur.push(e),
                    None => cur.push('\\'),
                }
            }
            c => {
                has_word = true;
                cur.push(c);
            }
        }
    }
    if has_word {
        out.push(cur);
    }
    Ok(out)
}
