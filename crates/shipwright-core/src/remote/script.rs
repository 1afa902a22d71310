//! Wrapper script generation.
//!
//! Every command runs inside a generated bash script that announces a start
//! marker before the command and a stop marker after it, so the collectors
//! can tell transport noise from real output and detect completion.

use std::collections::BTreeMap;

/// Unique start/stop lines for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub start: String,
    pub stop: String,
}

impl Markers {
    pub fn new() -> Self {
        Self {
            start: format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple()),
            stop: format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple()),
        }
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self::new()
    }
}

/// Quote `s` for a POSIX shell using single quotes.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Exit code of the wrapper when the working directory is missing.
pub const EXIT_BAD_CWD: i32 = 15;

/// Build the wrapper script for `command`.
///
/// The command is piped through `cat -` to force line buffering; `pipefail`
/// keeps its exit code. Its stdin is detached since the script itself
/// arrives on stdin. The trailing `echo`s guarantee the stop marker
/// starts on its own line even if the command output lacks a newline.
pub fn build_script(
    cwd: &str,
    env: &BTreeMap<String, String>,
    markers: &Markers,
    command: &str,
    hush_login: bool,
) -> String {
    let mut script = String::from("#!/bin/bash\nset -o pipefail\n");
    script.push_str(&format!(
        "cd {} || exit {}\n",
        shell_quote(cwd),
        EXIT_BAD_CWD
    ));
    for (key, value) in env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script.push_str(&format!("echo '{}'\n", markers.start));
    if hush_login {
        script.push_str("touch ~/.hushlogin\n");
    }
    script.push_str("set -e\n");
    script.push_str(&format!("{{ {}\n}} < /dev/null | cat -\n", command));
    script.push_str("echo\n");
    script.push_str("echo 1>&2\n");
    script.push_str(&format!("echo '{}'\n", markers.stop));
    script
}

/// Strip the padding line the wrapper's trailing `echo` adds.
pub fn strip_padding(mut lines: Vec<String>) -> String {
    if lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_unique_and_long() {
        let a = Markers::new();
        let b = Markers::new();
        assert_ne!(a.start, a.stop);
        assert_ne!(a.start, b.start);
        assert_eq!(a.start.len(), 64);
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain/path-1.txt"), "plain/path-1.txt");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn script_orders_cd_env_markers() {
        let markers = Markers {
            start: "START".into(),
            stop: "STOP".into(),
        };
        let mut env = BTreeMap::new();
        env.insert("PROJECT_NAME".to_string(), "shop x".to_string());
        let script = build_script("/srv/app", &env, &markers, "ls -l", true);

        let pos = |needle: &str| script.find(needle).unwrap();
        assert!(pos("cd /srv/app || exit 15") < pos("export PROJECT_NAME='shop x'"));
        assert!(pos("export PROJECT_NAME") < pos("echo 'START'"));
        assert!(pos("echo 'START'") < pos("set -e"));
        assert!(pos("{ ls -l\n} < /dev/null | cat -") < pos("echo 'STOP'"));
        assert!(script.contains("touch ~/.hushlogin"));

        let local = build_script("/srv/app", &env, &markers, "ls", false);
        assert!(!local.contains("hushlogin"));
    }

    #[test]
    fn padding_is_removed_once() {
        assert_eq!(strip_padding(vec!["hi".into(), "".into()]), "hi");
        assert_eq!(strip_padding(vec!["hi".into()]), "hi");
        assert_eq!(strip_padding(vec![]), "");
        assert_eq!(strip_padding(vec!["a".into(), "".into(), "".into()]), "a\n");
    }
}
