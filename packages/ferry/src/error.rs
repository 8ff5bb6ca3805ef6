//! Structured, chainable errors with registered machine-matchable codes.
//!
//! Every fallible operation in this crate returns `Result<T, Error>` rather
//! than panicking or relying on string matching. `Error` values nest: a
//! caller can wrap a lower-level failure (a failed `rsync` invocation) inside
//! a higher-level one (fetching a file failed) without losing either
//! message, and without mutating the wrapped value.
//!
//! Codes are a lightweight substitute for a full error-kind enum: they let
//! callers ask "is this an `ENOENT`-class failure?" without pattern matching
//! on message text, while still allowing each layer to add its own
//! free-text context.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Once, OnceLock, RwLock};

use derive_more::Display;

/// A registered, symbolic error kind (e.g. `ENOENT`, `ToolFail`).
///
/// Codes are registered once via [`ecreg`]; registering the same code twice
/// is a programmer error and aborts the process (see [`crate::bomb`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct ErrorCode(&'static str);

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

pub const ENOENT: ErrorCode = ErrorCode("ENOENT");
pub const EEXIST: ErrorCode = ErrorCode("EEXIST");
pub const CONFIG_ERROR: ErrorCode = ErrorCode("CONFIG_ERROR");
pub const TOOL_MISSING: ErrorCode = ErrorCode("TOOL_MISSING");
pub const TOOL_FAIL: ErrorCode = ErrorCode("TOOL_FAIL");
pub const INTERRUPT: ErrorCode = ErrorCode("INTERRUPT");
pub const INTERNAL: ErrorCode = ErrorCode("INTERNAL");

fn registry() -> &'static RwLock<HashMap<&'static str, Option<String>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Option<String>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Register an error code in the process-wide registry.
///
/// ## Panics
///
/// Aborts the process via [`crate::bomb`] if `code` is already registered:
/// this indicates two modules picked the same symbolic name, which is a
/// programmer error, not a runtime condition.
pub fn ecreg(code: ErrorCode, data: Option<impl Into<String>>) {
    let mut reg = registry().write().expect("error code registry poisoned");
    if reg.contains_key(code.0) {
        crate::bomb(&format!("error code already registered: {code}"));
    }
    reg.insert(code.0, data.map(Into::into));
}

/// Look up the data associated with a registered code, if any.
pub fn ecdata(code: ErrorCode) -> Option<String> {
    registry()
        .read()
        .expect("error code registry poisoned")
        .get(code.0)
        .cloned()
        .flatten()
}

static KNOWN_CODES: Once = Once::new();

/// Register the codes this crate itself defines.
///
/// Idempotent: safe to call from every entry point (`Cache::new`,
/// `ToolRegistry::new`, the CLI's `main`) since only the first call has an
/// effect.
pub fn register_known_codes() {
    KNOWN_CODES.call_once(|| {
        ecreg(ENOENT, Some("requested server, entry, or cache file is missing"));
        ecreg(EEXIST, Some("directory already locked or duplicate server name"));
        ecreg(CONFIG_ERROR, Some("malformed URL, flag, or unknown transport"));
        ecreg(TOOL_MISSING, Some("a required external tool could not be found"));
        ecreg(TOOL_FAIL, Some("an external tool exited with a nonzero status"));
        ecreg(INTERRUPT, Some("a termination signal was observed"));
        ecreg(INTERNAL, Some("an invariant the implementation relies on was violated"));
    });
}

#[derive(Debug, Clone)]
enum Part {
    Message(String),
    Nested(Box<Error>),
}

/// A structured, chainable error value.
///
/// `Error` is cheap to clone and is never mutated through a shared
/// reference; [`Error::append`] and [`Error::cat`] consume `self` and return
/// a new value, so a child attached via `cat` can never be observed to
/// change out from under whoever is still holding it.
#[derive(Debug, Clone)]
pub struct Error {
    parts: Vec<Part>,
    count: usize,
    code: Option<ErrorCode>,
}

impl Error {
    /// Construct a new error with an initial message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::Message(message.into())],
            count: 1,
            code: None,
        }
    }

    /// Append a peer message at the same nesting level.
    #[must_use]
    pub fn append(mut self, message: impl Into<String>) -> Self {
        self.parts.push(Part::Message(message.into()));
        self.count += 1;
        self
    }

    /// Nest a child error (or a bare string, wrapped as a leaf) under this one.
    #[must_use]
    pub fn cat(mut self, child: impl Into<Error>) -> Self {
        let child = child.into();
        self.count += 1;
        self.parts.push(Part::Nested(Box::new(child)));
        self
    }

    /// Tag this error with a registered code.
    #[must_use]
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// The code this error (not its children) was tagged with, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        self.code
    }

    /// Whether this error, or any of its nested children, carries `code`.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        if self.code == Some(code) {
            return true;
        }
        self.parts.iter().any(|part| match part {
            Part::Nested(child) => child.has_code(code),
            Part::Message(_) => false,
        })
    }

    /// The total number of messages and nested errors contained, recursively.
    pub fn count(&self) -> usize {
        self.count
    }

    /// The last `n` rendered lines, used to embed tool output tails in a
    /// [`crate::error::TOOL_FAIL`]-coded error without unbounded growth.
    pub fn last_lines(&self, n: usize) -> Vec<String> {
        let mut lines = Vec::new();
        self.collect_lines(0, &mut lines);
        let start = lines.len().saturating_sub(n);
        lines.split_off(start)
    }

    fn collect_lines(&self, depth: usize, out: &mut Vec<String>) {
        for part in &self.parts {
            match part {
                Part::Message(m) => out.push(format!("[{depth}] {m}")),
                Part::Nested(child) => child.collect_lines(depth + 1, out),
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.collect_lines_pub() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl Error {
    fn collect_lines_pub(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.collect_lines(0, &mut lines);
        lines
    }
}

impl std::error::Error for Error {}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::new(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::new(message.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn append_increments_count() {
        let err = Error::new("first").append("second");
        pretty_assert_eq!(err.count(), 2);
    }

    #[test]
    fn cat_nests_without_mutating_child() {
        let child = Error::new("inner").with_code(ENOENT);
        let child_rendered = child.to_string();
        let parent = Error::new("outer").cat(child.clone());

        pretty_assert_eq!(child.to_string(), child_rendered);
        assert!(parent.has_code(ENOENT));
        assert!(parent.code().is_none());
    }

    #[test]
    fn render_indents_by_depth() {
        let inner = Error::new("disk full");
        let outer = Error::new("write failed").cat(inner);
        let rendered = outer.to_string();
        assert!(rendered.contains("[0] write failed"));
        assert!(rendered.contains("[1] disk full"));
    }

    #[test]
    fn duplicate_code_registration_is_fatal() {
        // `register_known_codes` is idempotent and must not abort when called
        // repeatedly (every constructor in the crate calls it).
        register_known_codes();
        register_known_codes();
        assert!(ecdata(ENOENT).is_some());
    }

    #[test]
    fn last_lines_truncates_from_the_end() {
        let mut err = Error::new("line0");
        for i in 1..10 {
            err = err.append(format!("line{i}"));
        }
        let tail = err.last_lines(4);
        pretty_assert_eq!(tail.len(), 4);
        assert!(tail.last().unwrap().ends_with("line9"));
    }
}
