//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` and `$VAR` / `${VAR}` environment references in a
/// configured path (PID file, MT drop, log directory). Unset variables
/// expand to the empty string; a `$` not followed by a name passes
/// through.
///
/// - `"~/run/fieldnode.pid"` → `"/home/user/run/fieldnode.pid"`
/// - `"$DATA_DIR/messages"` → `"/data/fieldnode/messages"`
/// - `"/var/run/fieldnode.pid"` passes through unchanged.
pub fn expand_path(path: &str) -> Cow<'_, str> {
    let tilde = path == "~" || path.starts_with("~/");
    if !tilde && !path.contains('$') {
        return Cow::Borrowed(path);
    }

    let mut out = String::with_capacity(path.len() + 16);
    let mut rest = path;
    if tilde {
        if let Ok(home) = std::env::var("HOME") {
            out.push_str(&home);
            rest = &path[1..];
        }
    }

    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let mut name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            while let Some(inner) = chars.next() {
                if inner == '}' {
                    break;
                }
                name.push(inner);
            }
        } else {
            while let Some(&inner) = chars.peek() {
                if inner.is_ascii_alphanumeric() || inner == '_' {
                    name.push(inner);
                    chars.next();
                } else {
                    break;
                }
            }
        }

        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_path_borrows_unchanged() {
        assert!(matches!(
            expand_path("/tmp/fieldnode.pid"),
            Cow::Borrowed("/tmp/fieldnode.pid")
        ));
    }

    #[test]
    fn test_mid_path_tilde_unchanged() {
        assert_eq!(expand_path("/data/~backup"), "/data/~backup");
    }

    #[test]
    fn test_home_expansion() {
        std::env::set_var("HOME", "/home/bas");
        assert_eq!(expand_path("~"), "/home/bas");
        assert_eq!(
            expand_path("~/run/fieldnode.pid"),
            "/home/bas/run/fieldnode.pid"
        );
    }

    #[test]
    fn test_env_reference_expansion() {
        std::env::set_var("FIELDNODE_TEST_DATA", "/data/site");
        assert_eq!(
            expand_path("$FIELDNODE_TEST_DATA/messages"),
            "/data/site/messages"
        );
        assert_eq!(
            expand_path("${FIELDNODE_TEST_DATA}/logs"),
            "/data/site/logs"
        );
    }

    #[test]
    fn test_unset_variable_expands_empty() {
        std::env::remove_var("FIELDNODE_TEST_UNSET");
        assert_eq!(expand_path("/a/$FIELDNODE_TEST_UNSET/b"), "/a//b");
    }

    #[test]
    fn test_bare_dollar_passes_through() {
        assert_eq!(expand_path("/a/$/b"), "/a/$/b");
    }
}
