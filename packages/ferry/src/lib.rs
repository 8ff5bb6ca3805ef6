//! The server-aware caching and transport subsystem for `ferry`.
//!
//! This crate owns the correctness-critical core of an embedded-build
//! toolchain's artifact distribution layer: a [`cache::Cache`] registry that
//! maps symbolic server names to transports and local cache policy, a
//! [`transport`] dispatcher that moves bytes over `file`/`http(s)`/`ssh`/
//! `scp`/`rsync+ssh`, a [`tools`] registry for discovering and invoking the
//! external programs that actually move those bytes, and the [`exec`]
//! substrate all of the above is built on.
//!
//! Project orchestration, CLI parsing, and SCM-specific drivers are
//! deliberately not part of this crate; see `packages/ferry/src/bin/ferry`
//! for a minimal smoke-test harness that wires the pieces together.

pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod perm;
pub mod tempreg;
pub mod tools;
pub mod transport;
pub mod url;

pub use error::Error;

/// Abort the process for a programmer-invariant violation.
///
/// This is reserved for conditions that indicate a bug in `ferry` itself
/// (e.g. registering the same error code twice) rather than a runtime
/// failure a caller could reasonably recover from. Prints a message and a
/// captured backtrace to stderr, then exits with status 32.
pub fn bomb(message: &str) -> ! {
    let backtrace = std::backtrace::Backtrace::force_capture();
    eprintln!("ferry: internal invariant violated: {message}");
    eprintln!("{backtrace}");
    std::process::exit(32);
}
