//! Glob and prefix matching for permission rules
//!
//! Path globs keep `*` and `?` within a single path segment while `**`
//! spans segments. Command sub-patterns are plain single-string globs.
//! Command allow/deny lists use whole-token prefix matching.

use glob::{MatchOptions, Pattern};

/// Match a path glob against a path. `*`/`?` stay within one segment,
/// `**` matches zero or more segments. Invalid patterns never match.
pub fn path_glob_match(pattern: &str, path: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(path, options),
        Err(_) => false,
    }
}

/// Match a command sub-pattern against the full command string
pub fn command_glob_match(pattern: &str, command: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(command),
        Err(_) => false,
    }
}

/// Whole-token prefix match: the command equals the pattern, or begins
/// with the pattern followed by a space.
pub fn command_prefix_match(pattern: &str, command: &str) -> bool {
    command == pattern || command.starts_with(&format!("{} ", pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_star_matches_everything() {
        assert!(path_glob_match("**", "a"));
        assert!(path_glob_match("**", "a/b/c"));
        assert!(path_glob_match("**", ".env"));
    }

    #[test]
    fn test_double_star_suffix() {
        assert!(path_glob_match("**/main.rs", "main.rs"));
        assert!(path_glob_match("**/main.rs", "src/main.rs"));
        assert!(path_glob_match("**/main.rs", "a/b/src/main.rs"));
        assert!(!path_glob_match("**/main.rs", "src/main.rs.bak"));
    }

    #[test]
    fn test_recursive_dir_glob() {
        assert!(path_glob_match("src/**", "src/main.rs"));
        assert!(path_glob_match("src/**", "src/a/b/c.rs"));
        assert!(!path_glob_match("src/**", "lib/main.rs"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        assert!(path_glob_match("src/*.rs", "src/main.rs"));
        assert!(!path_glob_match("src/*.rs", "src/a/main.rs"));
    }

    #[test]
    fn test_question_mark() {
        assert!(path_glob_match("file?.txt", "file1.txt"));
        assert!(!path_glob_match("file?.txt", "file10.txt"));
    }

    #[test]
    fn test_exact_path() {
        assert!(path_glob_match(".env", ".env"));
        assert!(!path_glob_match(".env", "src/.env"));
        assert!(!path_glob_match(".env", ".env.local"));
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        assert!(!path_glob_match("[", "anything"));
    }

    #[test]
    fn test_command_glob() {
        assert!(command_glob_match("git *", "git push origin main"));
        assert!(command_glob_match("*", "anything at all"));
        assert!(!command_glob_match("git *", "cargo build"));
    }

    #[test]
    fn test_command_prefix_whole_token() {
        assert!(command_prefix_match("git push", "git push"));
        assert!(command_prefix_match("git push", "git push origin main"));
        // "git pushx" must not match "git push"
        assert!(!command_prefix_match("git push", "git pushx origin"));
        assert!(!command_prefix_match("git push", "git"));
    }
}
