//! Shell-style variable substitution for config values.
//!
//! Values may embed `$VAR` references, resolved against the process
//! environment, and `$(command)` substitutions, evaluated through `sh -c`
//! with trailing newlines trimmed. Used for provider API keys and MCP
//! headers/env so secrets never have to live in the config file itself.

use std::process::Command;

use anyhow::Result;
use anyhow::anyhow;

#[derive(Debug, Default, Clone)]
pub struct ShellVariableResolver;

impl ShellVariableResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve_value(&self, value: &str) -> Result<String> {
        let mut out: Vec<u8> = Vec::with_capacity(value.len());
        let bytes = value.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'$' {
                out.push(bytes[i]);
                i += 1;
                continue;
            }

            // `$(command)` with nesting support.
            if i + 1 < bytes.len() && bytes[i + 1] == b'(' {
                let start = i + 2;
                let mut depth = 1usize;
                let mut j = start;
                while j < bytes.len() && depth > 0 {
                    match bytes[j] {
                        b'(' => depth += 1,
                        b')' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                if depth != 0 {
                    return Err(anyhow!("unterminated command substitution in `{value}`"));
                }
                let command = &value[start..j - 1];
                out.extend_from_slice(run_command(command)?.as_bytes());
                i = j;
                continue;
            }

            // `$VAR`.
            let start = i + 1;
            let mut j = start;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if j == start {
                // A lone `$` passes through untouched.
                out.push(b'$');
                i += 1;
                continue;
            }
            let name = &value[start..j];
            let resolved = std::env::var(name)
                .map_err(|_| anyhow!("environment variable `{name}` is not set"))?;
            out.extend_from_slice(resolved.as_bytes());
            i = j;
        }

        String::from_utf8(out).map_err(|e| anyhow!("resolved value is not valid UTF-8: {e}"))
    }
}

fn run_command(command: &str) -> Result<String> {
    let output = Command::new("sh").arg("-c").arg(command).output()?;
    if !output.status.success() {
        return Err(anyhow!(
            "command substitution `{command}` failed with status {}",
            output.status
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim_end_matches('\n').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolves_environment_variables() {
        // SAFETY: test-local variable, no concurrent reader depends on it.
        unsafe { std::env::set_var("TETHER_RESOLVER_TEST", "sk-123") };
        let resolver = ShellVariableResolver::new();
        assert_eq!(
            resolver
                .resolve_value("Bearer $TETHER_RESOLVER_TEST")
                .expect("resolve"),
            "Bearer sk-123"
        );
    }

    #[test]
    fn unset_variable_is_an_error() {
        let resolver = ShellVariableResolver::new();
        assert!(resolver.resolve_value("$TETHER_DEFINITELY_UNSET_VAR").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolves_command_substitution() {
        let resolver = ShellVariableResolver::new();
        assert_eq!(
            resolver.resolve_value("v=$(echo hello)").expect("resolve"),
            "v=hello"
        );
    }

    #[test]
    fn plain_values_pass_through() {
        let resolver = ShellVariableResolver::new();
        assert_eq!(
            resolver.resolve_value("plain-value").expect("resolve"),
            "plain-value"
        );
        assert_eq!(resolver.resolve_value("100$").expect("resolve"), "100$");
    }
}
