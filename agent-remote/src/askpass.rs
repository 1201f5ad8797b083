//! `SSH_ASKPASS` helper for password authentication. `ssh` refuses to read a
//! password from stdin in non-interactive (`BatchMode`-less, no-tty) mode
//! unless pointed at an askpass program, so password auth writes one out,
//! points `ssh` at it via the environment, and removes it immediately after
//! the connection attempt completes.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Escapes a password for embedding in a single-quoted POSIX shell string.
fn shell_single_quote_escape(s: &str) -> String {
    s.replace('\'', r"'\''")
}

/// Writes a mode-0700 shell script at `dir/askpass-<random>.sh` that echoes
/// `password` to stdout, the contract `SSH_ASKPASS` programs must follow.
/// Caller owns the returned path and must call [`remove`] once `ssh` has
/// used it.
pub fn write_askpass_script(dir: &Path, password: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("askpass-{}.sh", uuid::Uuid::new_v4()));
    let escaped = shell_single_quote_escape(password);
    let script = format!("#!/bin/sh\nprintf '%s\\n' '{escaped}'\n");

    let mut file = std::fs::File::create(&path)?;
    file.write_all(script.as_bytes())?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(path)
}

/// Removes an askpass script written by [`write_askpass_script`]. Errors are
/// swallowed: a leftover temp file is a cleanliness issue, not a correctness
/// one, and the caller is already past the point where the password mattered.
pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_is_mode_0700_and_contains_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_askpass_script(dir.path(), "hunter2").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("hunter2"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }

        remove(&path);
        assert!(!path.exists());
    }

    #[test]
    fn password_with_single_quotes_is_escaped_safely() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_askpass_script(dir.path(), "it's a secret").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        // The escaped form must close, escape, and reopen the quote.
        assert!(content.contains(r"it'\''s a secret"));
        remove(&path);
    }

    #[test]
    fn remove_is_idempotent_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never-created.sh");
        remove(&missing); // must not panic
    }
}
