//! Discovering and invoking the external programs transports shell out to.
//!
//! A [`ToolRegistry`] maps a symbolic tool name (`"rsync"`, `"ssh"`, `"scp"`,
//! `"curl"`) to a configured path and a default flag string, resolves the
//! path against `$PATH` the first time it's needed (and caches the result,
//! since re-walking `$PATH` on every transport call would be wasteful), and
//! tokenizes the configured flag string into an argv the way a shell would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::error::{Error, TOOL_MISSING};

/// A single tool's configuration: where to find it, and what flags to pass
/// by default on every invocation.
#[derive(Debug, Clone)]
struct ToolDef {
    /// An explicit path (from config), or `None` to resolve via `$PATH`.
    path: Option<PathBuf>,
    /// The raw, unparsed default flag string (e.g. `"-a --delete"`).
    flags: String,
}

/// A registry of known external tools, keyed by symbolic name.
///
/// Cheap to share: lookups take `&self` and the `$PATH`-resolution cache is
/// a [`DashMap`], so one `ToolRegistry` can be held behind an `Arc` and
/// consulted concurrently by every in-flight transport operation without a
/// single coarse lock serializing unrelated tool lookups.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDef>,
    resolved: DashMap<String, PathBuf>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with an explicit path and default flags. Overwrites
    /// any existing registration for `name`.
    pub fn add(&mut self, name: impl Into<String>, path: Option<PathBuf>, flags: impl Into<String>) {
        let name = name.into();
        self.resolved.remove(&name);
        self.tools.insert(
            name,
            ToolDef {
                path,
                flags: flags.into(),
            },
        );
    }

    /// Override just the default flags for an already-registered tool.
    ///
    /// No-op if `name` isn't registered: a config override for a tool this
    /// build doesn't know about is silently ignored, mirroring the general
    /// policy of allowing configuration to name servers or tools not every
    /// deployment exercises.
    pub fn set_flags(&mut self, name: &str, flags: impl Into<String>) {
        if let Some(def) = self.tools.get_mut(name) {
            def.flags = flags.into();
            self.resolved.remove(name);
        }
    }

    /// The tool's resolved, executable path.
    ///
    /// If the tool was registered with an explicit path, that path is
    /// returned as-is (not re-checked against `$PATH`; an explicit path is
    /// trusted). Otherwise `$PATH` is searched for an executable file named
    /// `name`, and the result is cached for subsequent calls.
    pub fn get_tool_path(&self, name: &str) -> Result<PathBuf, Error> {
        let def = self
            .tools
            .get(name)
            .ok_or_else(|| Error::new(format!("unknown tool: {name}")).with_code(TOOL_MISSING))?;

        if let Some(path) = &def.path {
            return Ok(path.clone());
        }

        if let Some(cached) = self.resolved.get(name) {
            return Ok(cached.clone());
        }

        let found = find_on_path(name)
            .ok_or_else(|| Error::new(format!("tool not found on PATH: {name}")).with_code(TOOL_MISSING))?;

        self.resolved.insert(name.to_owned(), found.clone());
        Ok(found)
    }

    /// Resolve every registered tool's path, logging which ones are missing.
    ///
    /// `required` lists tool names that must resolve; any other missing
    /// tool is logged as an unavailable optional tool and otherwise
    /// ignored. Fails with [`TOOL_MISSING`] on the first missing required
    /// tool.
    #[tracing::instrument(skip(self, required))]
    pub fn init(&self, required: &[&str]) -> Result<(), Error> {
        for name in self.tools.keys() {
            match self.get_tool_path(name) {
                Ok(path) => tracing::debug!(tool = %name, path = %path.display(), "resolved tool"),
                Err(err) if required.contains(&name.as_str()) => return Err(err),
                Err(_) => tracing::warn!(tool = %name, "optional tool not available"),
            }
        }
        Ok(())
    }

    /// The tool's raw, unparsed default flag string.
    pub fn get_tool_flags(&self, name: &str) -> Result<&str, Error> {
        self.tools
            .get(name)
            .map(|def| def.flags.as_str())
            .ok_or_else(|| Error::new(format!("unknown tool: {name}")).with_code(TOOL_MISSING))
    }

    /// The tool's default flags, tokenized into an argv.
    pub fn get_tool_flags_argv(&self, name: &str) -> Result<Vec<String>, Error> {
        tokenize(self.get_tool_flags(name)?)
    }
}

/// Search `$PATH` for an executable file named `name`.
fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(name);
        is_executable::is_executable(&candidate).then_some(candidate)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenizeState {
    Default,
    DoubleQuoted,
    SingleQuoted,
}

/// Split a shell-like flag string into an argv.
///
/// Supports single and double quoting and whitespace-separated words.
/// Outside single quotes, a backslash escapes the next character: `\\`,
/// `\"`, and `\'` unescape to a bare backslash or quote, and any other
/// `\X` still collapses to the bare `X` (this lets `\ ` embed a literal
/// space in an otherwise unquoted word without starting a new one).
/// Inside single quotes a backslash is an ordinary character with no
/// escaping effect. An unterminated quote or a trailing, unterminated
/// escape is a [`CONFIG_ERROR`][1].
///
/// [1]: crate::error::CONFIG_ERROR
pub fn tokenize(input: &str) -> Result<Vec<String>, Error> {
    use crate::error::CONFIG_ERROR;

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut state = TokenizeState::Default;
    let mut escaped = false;

    for ch in input.chars() {
        if escaped {
            current.push(ch);
            in_word = true;
            escaped = false;
            continue;
        }

        match state {
            TokenizeState::Default => match ch {
                '\\' => {
                    escaped = true;
                    in_word = true;
                }
                '"' => {
                    state = TokenizeState::DoubleQuoted;
                    in_word = true;
                }
                '\'' => {
                    state = TokenizeState::SingleQuoted;
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
            TokenizeState::DoubleQuoted => match ch {
                '\\' => escaped = true,
                '"' => state = TokenizeState::Default,
                c => current.push(c),
            },
            TokenizeState::SingleQuoted => match ch {
                '\'' => state = TokenizeState::Default,
                c => current.push(c),
            },
        }
    }

    if escaped {
        return Err(Error::new(format!("trailing unterminated escape in flag string: {input}")).with_code(CONFIG_ERROR));
    }

    if state != TokenizeState::Default {
        return Err(Error::new(format!("unterminated quote in flag string: {input}")).with_code(CONFIG_ERROR));
    }

    if in_word {
        words.push(current);
    }

    Ok(words)
}

/// Whether `path` points at an executable regular file.
pub fn is_executable(path: &Path) -> bool {
    is_executable::is_executable(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    #[test]
    fn explicit_path_is_trusted_without_path_search() {
        let mut reg = ToolRegistry::new();
        reg.add("rsync", Some(PathBuf::from("/opt/tools/rsync")), "-a");
        pretty_assert_eq!(reg.get_tool_path("rsync").unwrap(), PathBuf::from("/opt/tools/rsync"));
    }

    #[test]
    fn unregistered_tool_is_tool_missing() {
        let reg = ToolRegistry::new();
        let err = reg.get_tool_path("nope").unwrap_err();
        assert_eq!(err.code(), Some(TOOL_MISSING));
    }

    #[test]
    fn flag_override_replaces_default() {
        let mut reg = ToolRegistry::new();
        reg.add("ssh", Some(PathBuf::from("/usr/bin/ssh")), "-o BatchMode=yes");
        reg.set_flags("ssh", "-v");
        pretty_assert_eq!(reg.get_tool_flags("ssh").unwrap(), "-v");
    }

    #[test]
    fn flag_override_on_unknown_tool_is_ignored() {
        let mut reg = ToolRegistry::new();
        reg.set_flags("ghost", "-x");
        assert!(reg.get_tool_flags("ghost").is_err());
    }

    #[test_case("-a --delete", &["-a", "--delete"]; "simple_words")]
    #[test_case(r#"-o "ProxyCommand=ssh -W %h:%p jump""#, &["-o", "ProxyCommand=ssh -W %h:%p jump"]; "double_quoted_run")]
    #[test_case("-e 'ssh -p 2222'", &["-e", "ssh -p 2222"]; "single_quoted_run")]
    #[test_case("  -a   -b  ", &["-a", "-b"]; "collapses_whitespace")]
    #[test_case("", &[]; "empty_is_no_args")]
    #[test_case(r"-e ssh\ -p", &["-e", "ssh -p"]; "escaped_space_stays_in_one_word")]
    #[test_case(r#"say \"hi\""#, &["say", "\"hi\""]; "escaped_quote_is_literal")]
    #[test_case(r"one\\two", &[r"one\two"]; "escaped_backslash_is_literal")]
    #[test_case(r"a\qb", &["aqb"]; "escape_of_ordinary_char_still_collapses")]
    #[test_case(r"'a\qb'", &[r"a\qb"]; "backslash_is_literal_inside_single_quotes")]
    fn tokenizes(input: &str, expected: &[&str]) {
        let got = tokenize(input).unwrap();
        pretty_assert_eq!(got, expected.to_vec());
    }

    #[test]
    fn unterminated_quote_is_config_error() {
        let err = tokenize(r#"-o "unterminated"#).unwrap_err();
        assert_eq!(err.code(), Some(crate::error::CONFIG_ERROR));
    }

    #[test]
    fn trailing_backslash_is_config_error() {
        let err = tokenize(r"-o ssh\").unwrap_err();
        assert_eq!(err.code(), Some(crate::error::CONFIG_ERROR));
    }

    #[test]
    fn init_fails_on_missing_required_tool() {
        let mut reg = ToolRegistry::new();
        reg.add("definitely-not-a-real-binary", None, "");
        let err = reg.init(&["definitely-not-a-real-binary"]).unwrap_err();
        assert_eq!(err.code(), Some(TOOL_MISSING));
    }

    #[test]
    fn init_tolerates_missing_optional_tool() {
        let mut reg = ToolRegistry::new();
        reg.add("definitely-not-a-real-binary", None, "");
        reg.init(&[]).unwrap();
    }
}
