//! Small helpers shared across modules.

use std::borrow::Cow;
use std::path::PathBuf;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Directory holding `ondevice.toml`, `auth.json`, the pid file and the
/// user-scoped control socket.
///
/// `$ONDEVICE_CONFIG_DIR` wins; otherwise `~/.config/ondevice`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ONDEVICE_CONFIG_DIR") {
        return PathBuf::from(expand_tilde(&dir).as_ref());
    }
    PathBuf::from(expand_tilde("~/.config/ondevice").as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths_pass_through() {
        assert_eq!(expand_tilde("/etc/ondevice"), "/etc/ondevice");
        assert_eq!(expand_tilde("~user/x"), "~user/x");
    }

    #[test]
    fn tilde_prefix_is_expanded() {
        let Ok(home) = std::env::var("HOME") else {
            return;
        };
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/a/b"), format!("{home}/a/b"));
    }
}
