pub mod parse;
pub mod types;

use std::path::{Path, PathBuf};

pub use parse::{load_config, parse_config, ConfigError};
pub use types::Config;

const USER_CONFIG: &str = ".config/replay-cache/config.yml";
const SYSTEM_CONFIG: &str = "/etc/replay-cache/config.yml";

/// Replace a leading `~` with the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) if rest.as_os_str().is_empty() => home,
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Resolves the config file path.
/// Returns the first match of:
/// 1. Explicit path (with tilde expansion)
/// 2. ~/.config/replay-cache/config.yml
/// 3. /etc/replay-cache/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(USER_CONFIG);
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from(SYSTEM_CONFIG);
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Where `config init` writes when not printing to stdout
pub fn default_user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(USER_CONFIG))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_with_path() {
        let expanded = expand_tilde(Path::new("~/cache/raw"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("cache/raw"));
        }
    }

    #[test]
    fn test_expand_tilde_alone() {
        let expanded = expand_tilde(Path::new("~"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home);
        }
    }

    #[test]
    fn test_expand_tilde_untouched() {
        assert_eq!(expand_tilde(Path::new("/var/cache")), Path::new("/var/cache"));
        assert_eq!(expand_tilde(Path::new("relative/~")), Path::new("relative/~"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let resolved = resolve_config_path(Some(Path::new("/srv/job.yml")));
        assert_eq!(resolved, Some(PathBuf::from("/srv/job.yml")));
    }
}
