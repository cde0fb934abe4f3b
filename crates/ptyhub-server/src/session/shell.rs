//! Shell resolution and safe command-line construction.

use std::ffi::OsString;

/// Environment variables removed from every child so a nested agent CLI
/// does not believe it is already running inside an agent session.
pub const STRIPPED_ENV: &[&str] = &["CLAUDECODE"];

/// Resolve the shell to run: explicit override, then `$SHELL`, then the
/// platform default.
pub fn resolve_shell(override_shell: Option<&str>) -> String {
    if let Some(shell) = override_shell.filter(|s| !s.is_empty()) {
        return shell.to_string();
    }
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_shell().to_string())
}

#[cfg(unix)]
fn default_shell() -> &'static str {
    "/bin/sh"
}

#[cfg(not(unix))]
fn default_shell() -> &'static str {
    "cmd.exe"
}

/// Quote one argument for a POSIX shell line.
///
/// Tokens made only of `[A-Za-z0-9_\-./=:@]` pass through untouched;
/// everything else is single-quoted with embedded quotes written `'\''`.
pub fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if arg.chars().all(is_safe_char) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':' | '@')
}

/// Build the argv for the child process.
///
/// Without a command this is a bare login shell. With one, the shell runs
/// it as a login shell and then `exec`s a fresh login shell so the
/// terminal stays usable after the command exits.
pub fn build_argv(shell: &str, command: Option<&[String]>) -> Vec<OsString> {
    match command.filter(|c| !c.is_empty()) {
        None => vec![shell.into(), "-l".into()],
        Some(argv) => {
            let joined = argv
                .iter()
                .map(|a| shell_escape(a))
                .collect::<Vec<_>>()
                .join(" ");
            let line = format!("{joined}; exec {} -l", shell_escape(shell));
            vec![shell.into(), "-l".into(), "-c".into(), line.into()]
        }
    }
}
