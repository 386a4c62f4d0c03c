//! Long-lived user shell attached to a pseudo-terminal.

mod pty;

pub use pty::PtyShell;
pub use pty::ShellError;

/// Environment variable that overrides shell detection entirely. The value
/// is split shell-style, so `TETHER_SHELL="/bin/zsh -i"` works.
pub const SHELL_OVERRIDE_ENV_VAR: &str = "TETHER_SHELL";

const SHELL_CANDIDATES: &[&str] = &["/bin/zsh", "/bin/bash", "/bin/sh"];

/// Returns the user shell binary and default args.
///
/// Precedence: the `TETHER_SHELL` override, the user's login `$SHELL`, then
/// a candidate list of common shell paths.
pub fn detect_user_shell() -> (String, Vec<String>) {
    if let Ok(raw) = std::env::var(SHELL_OVERRIDE_ENV_VAR)
        && !raw.trim().is_empty()
        && let Some(parts) = shlex::split(raw.trim())
        && !parts.is_empty()
    {
        let mut parts = parts.into_iter();
        let bin = parts.next().unwrap_or_default();
        return (bin, parts.collect());
    }

    if let Ok(shell) = std::env::var("SHELL") {
        let shell = shell.trim();
        if !shell.is_empty() {
            return (
                shell.to_string(),
                vec!["-i".to_string(), "-l".to_string()],
            );
        }
    }

    for candidate in SHELL_CANDIDATES {
        if std::path::Path::new(candidate).is_file() {
            return (
                (*candidate).to_string(),
                vec!["-i".to_string(), "-l".to_string()],
            );
        }
    }

    ("/bin/sh".to_string(), vec!["-i".to_string()])
}
