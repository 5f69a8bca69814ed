//! Turns program names, argument lists and environment maps into the forms
//! the OS process-creation calls accept.
//!
//! Windows takes one flat command line and a NUL-separated environment
//! block; Unix takes argument and environment vectors of C strings. Both
//! encodings live here so they can be tested on any host.

use std::{
    collections::BTreeMap,
    env,
    ffi::{CString, OsStr},
    path::{Path, PathBuf},
};

use crate::{Error, Result};

fn check_nul(what: &str, s: &str) -> Result<()> {
    if s.contains('\0') {
        Err(Error::Encoding(format!("{}: contains NUL byte", what)))
    } else {
        Ok(())
    }
}

/// Appends `arg` to `out`, quoted the way `CommandLineToArgvW` reads it back.
pub fn quote_arg(arg: &str, out: &mut String) {
    let needs_quotes = arg.is_empty() || arg.chars().any(|c| matches!(c, ' ' | '\t' | '"'));
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                push_backslashes(out, backslashes * 2 + 1);
                out.push('"');
                backslashes = 0;
            }
            _ => {
                push_backslashes(out, backslashes);
                out.push(c);
                backslashes = 0;
            }
        }
    }
    // keep the closing quote from being escaped
    push_backslashes(out, backslashes * 2);
    out.push('"');
}

fn push_backslashes(out: &mut String, n: usize) {
    out.extend(std::iter::repeat('\\').take(n));
}

/// Builds the single command-line string: program followed by its arguments,
/// each quoted by [`quote_arg`] and separated by one space.
pub fn command_line<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String> {
    check_nul("program name", program)?;
    let mut line = String::new();
    quote_arg(program, &mut line);
    for arg in args {
        let arg = arg.as_ref();
        check_nul("argument", arg)?;
        line.push(' ');
        quote_arg(arg, &mut line);
    }
    Ok(line)
}

/// Builds a native environment block: `key=value\0` per entry plus a final `\0`.
///
/// Entries with an empty key are skipped.
pub fn env_block(env: &BTreeMap<String, String>) -> Result<String> {
    let mut block = String::new();
    for (key, value) in env.iter().filter(|(k, _)| !k.is_empty()) {
        check_env_entry(key, value)?;
        block.push_str(key);
        block.push('=');
        block.push_str(value);
        block.push('\0');
    }
    if block.is_empty() {
        // an empty block still needs its own terminator
        block.push('\0');
    }
    block.push('\0');
    Ok(block)
}

fn check_env_entry(key: &str, value: &str) -> Result<()> {
    check_nul("environment key", key)?;
    check_nul("environment value", value)?;
    if key.contains('=') {
        return Err(Error::Encoding(format!("environment key '{}': contains '='", key)));
    }
    Ok(())
}

pub fn to_cstring(what: &str, s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::Encoding(format!("{}: contains NUL byte", what)))
}

/// Argument vector for `exec*`: the program name duplicated as `argv[0]`.
pub fn argv<S: AsRef<str>>(program: &str, args: &[S]) -> Result<Vec<CString>> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(to_cstring("program name", program)?);
    for arg in args {
        argv.push(to_cstring("argument", arg.as_ref())?);
    }
    Ok(argv)
}

/// `key=value` C strings for `execve`. Entries with an empty key are skipped.
pub fn envp(env: &BTreeMap<String, String>) -> Result<Vec<CString>> {
    env.iter()
        .filter(|(k, _)| !k.is_empty())
        .map(|(key, value)| {
            check_env_entry(key, value)?;
            to_cstring("environment entry", &format!("{}={}", key, value))
        })
        .collect()
}

/// Resolves `program` against the parent's `PATH`.
///
/// Names containing a path separator are returned unchanged. Needed when the
/// child gets an explicit environment, since `execve` does no path search.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    resolve_in(program, env::var_os("PATH").as_deref())
}

fn resolve_in(program: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    if program.contains('/') || (cfg!(windows) && program.contains('\\')) {
        return Some(PathBuf::from(program));
    }
    env::split_paths(search_path?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod test {
    use super::*;

    fn quoted(arg: &str) -> String {
        let mut out = String::new();
        quote_arg(arg, &mut out);
        out
    }

    #[test]
    fn plain_args_are_untouched() {
        assert_eq!("hello", quoted("hello"));
        assert_eq!(r"C:\dir\file.txt", quoted(r"C:\dir\file.txt"));
        assert_eq!(r"a\\b", quoted(r"a\\b"));
    }

    #[test]
    fn empty_and_spaced_args_are_quoted() {
        assert_eq!(r#""""#, quoted(""));
        assert_eq!(r#""hello world""#, quoted("hello world"));
        assert_eq!("\"a\tb\"", quoted("a\tb"));
    }

    #[test]
    fn embedded_quotes_are_escaped() {
        assert_eq!(r#""say \"hi\"""#, quoted(r#"say "hi""#));
        // one backslash before a quote becomes three
        assert_eq!(r#""a\\\"b""#, quoted(r#"a\"b"#));
    }

    #[test]
    fn trailing_backslashes_are_doubled_when_quoted() {
        assert_eq!(r#""C:\my dir\\""#, quoted(r"C:\my dir\"));
        assert_eq!(r#""x y\\\\""#, quoted(r"x y\\"));
        // interior runs stay as they are
        assert_eq!(r#""a\\b c""#, quoted(r"a\\b c"));
    }

    #[test]
    fn command_line_joins_with_single_space() {
        let line = command_line("prog", &["one", "two words", ""]).unwrap();
        assert_eq!(r#"prog one "two words" """#, line);
        let line = command_line(r"C:\Program Files\app.exe", &[] as &[&str]).unwrap();
        assert_eq!(r#""C:\Program Files\app.exe""#, line);
    }

    #[test]
    fn command_line_rejects_nul() {
        assert!(matches!(
            command_line("prog", &["bad\0arg"]),
            Err(Error::Encoding(_))
        ));
        assert!(command_line("pr\0g", &[] as &[&str]).is_err());
    }

    #[test]
    fn env_block_layout() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "1".to_string());
        env.insert("".to_string(), "skipped".to_string());
        env.insert("PATH".to_string(), "/bin".to_string());
        assert_eq!("A=1\0PATH=/bin\0\0", env_block(&env).unwrap());
    }

    #[test]
    fn env_block_each_key_once() {
        let mut env = BTreeMap::new();
        env.insert("K".to_string(), "first".to_string());
        env.insert("K".to_string(), "second".to_string());
        let block = env_block(&env).unwrap();
        assert_eq!(1, block.matches("K=").count());
        assert!(block.contains("K=second\0"));
    }

    #[test]
    fn env_rejects_bad_entries() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "x\0y".to_string());
        assert!(env_block(&env).is_err());
        assert!(envp(&env).is_err());

        let mut env = BTreeMap::new();
        env.insert("A=B".to_string(), "x".to_string());
        assert!(env_block(&env).is_err());
    }

    #[test]
    fn argv_duplicates_program_name() {
        let argv = argv("ls", &["-l", "/tmp"]).unwrap();
        let argv: Vec<&str> = argv.iter().map(|s| s.to_str().unwrap()).collect();
        assert_eq!(vec!["ls", "-l", "/tmp"], argv);
    }

    #[test]
    fn envp_pairs() {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/root".to_string());
        env.insert("".to_string(), "nope".to_string());
        let envp = envp(&env).unwrap();
        assert_eq!(1, envp.len());
        assert_eq!("HOME=/root", envp[0].to_str().unwrap());
    }

    #[test]
    fn resolve_keeps_explicit_paths() {
        assert_eq!(
            Some(PathBuf::from("./run.sh")),
            resolve_in("./run.sh", None)
        );
        assert_eq!(None, resolve_in("anything", None));
        assert_eq!(None, resolve_in("", Some(OsStr::new("/bin"))));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_searches_path() {
        let found = resolve_in("sh", Some(OsStr::new("/nonexistent:/bin:/usr/bin"))).unwrap();
        assert!(found.ends_with("sh"));
        assert!(found.is_absolute());
        assert_eq!(
            None,
            resolve_in("definitely-not-a-program-xyz", Some(OsStr::new("/bin")))
        );
    }
}
