//! Moving bytes between a [`Url`] and the local filesystem, one transport
//! at a time.
//!
//! Every function here shells out to an external tool via [`crate::exec`]
//! rather than re-implementing any wire protocol — this crate's job is
//! argv construction, atomic commit, and turning a tool's exit status into
//! a structured [`Error`], not speaking rsync's or SSH's protocol itself.

mod file;
mod http;
mod rsync_mkdir;
mod ssh;

use std::path::{Path, PathBuf};

use tap::TapFallible;
use tracing::{instrument, trace};

use crate::error::{CONFIG_ERROR, Error};
use crate::tools::ToolRegistry;
use crate::url::{Transport, Url};

pub use rsync_mkdir::rsync_only_mkdir;

/// Fetch `location` under `source` into `dest_dir/dest_name` (or
/// `dest_dir/<basename of location>` if `dest_name` is `None`).
///
/// The destination is populated atomically: bytes land in a uniquely named
/// sibling tempfile first, and only a successful rename makes them visible
/// under the final name. This is the only reliable way to detect several
/// of these tools' silent-skip failure modes (e.g. `rsync -L` against a
/// dangling symlink): if the tool produced nothing, there is nothing to
/// rename, and the caller sees an error instead of an empty or missing
/// file passing silently.
#[instrument(skip(tools), fields(source = %source, location))]
pub async fn fetch_file(
    tools: &ToolRegistry,
    source: &Url,
    location: &str,
    dest_dir: &Path,
    dest_name: Option<&str>,
) -> Result<(), Error> {
    tokio::fs::create_dir_all(dest_dir)
        .await
        .map_err(|err| Error::new(format!("failed to create {}: {err}", dest_dir.display())))?;

    let dest_name = dest_name
        .map(str::to_owned)
        .unwrap_or_else(|| basename(location).to_owned());

    let temp = tempfile::Builder::new()
        .prefix(&format!("{dest_name}."))
        .tempfile_in(dest_dir)
        .map_err(|err| Error::new(format!("failed to reserve tempfile in {}: {err}", dest_dir.display())))?;
    let temp_path = temp.path().to_path_buf();
    // The transport tool must create this path itself (rsync/scp refuse to
    // overwrite through an existing file handle cleanly in all cases); drop
    // the handle and remove the file, keeping only the reserved name.
    drop(temp);
    let _ = tokio::fs::remove_file(&temp_path).await;

    let source_url = source.join(location);
    let result = match source.transport {
        Transport::File => file::fetch(tools, &source_url, &temp_path).await,
        Transport::Http | Transport::Https => http::fetch(tools, &source_url, &temp_path).await,
        Transport::RsyncSsh => ssh::fetch_rsync_ssh(tools, &source_url, &temp_path).await,
        Transport::Scp | Transport::Ssh => ssh::fetch_scp(tools, &source_url, &temp_path).await,
        other => Err(Error::new(format!("unhandled transport: {other}")).with_code(CONFIG_ERROR)),
    };

    if let Err(err) = result {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err);
    }

    let dest_path = dest_dir.join(&dest_name);
    tokio::fs::rename(&temp_path, &dest_path)
        .await
        .map_err(|err| {
            Error::new(format!(
                "commit failed: transport reported success but {} does not exist ({err})",
                temp_path.display()
            ))
        })
        .tap_ok(|_| trace!(dest = %dest_path.display(), "committed fetched file"))?;

    Ok(())
}

/// Push `local_path` to `location` under `dest`.
///
/// `push_permissions`, if given, is applied as a destination mode via the
/// transport tool's `--chmod`-equivalent flag where supported (`file`,
/// `rsync+ssh`); `scp`/`ssh` ignore it and a one-shot warning is logged.
/// `try_hardlink` only has an effect for the `file` transport with no
/// `push_permissions` set.
#[instrument(skip(tools), fields(dest = %dest, location))]
pub async fn push_file(
    tools: &ToolRegistry,
    local_path: &Path,
    dest: &Url,
    location: &str,
    push_permissions: Option<&str>,
    try_hardlink: bool,
) -> Result<(), Error> {
    let dest_url = dest.join(location);

    match dest.transport {
        Transport::File => file::push(tools, local_path, &dest_url, push_permissions, try_hardlink).await,
        Transport::RsyncSsh => ssh::push_rsync_ssh(tools, local_path, &dest_url, push_permissions).await,
        Transport::Scp | Transport::Ssh => ssh::push_scp(tools, local_path, &dest_url, push_permissions).await,
        other => Err(Error::new(format!("unhandled transport: {other}")).with_code(CONFIG_ERROR)),
    }
}

/// Best-effort presence check for `location` under `source`.
#[instrument(skip(tools), fields(source = %source, location))]
pub async fn file_exists(tools: &ToolRegistry, source: &Url, location: &str) -> Result<bool, Error> {
    let source_url = source.join(location);
    match source.transport {
        Transport::File => file::exists(&source_url).await,
        Transport::RsyncSsh => ssh::exists_rsync_ssh(tools, &source_url).await,
        Transport::Scp | Transport::Ssh => ssh::exists_ssh(tools, &source_url).await,
        Transport::Http | Transport::Https => http::exists(tools, &source_url).await,
        other => Err(Error::new(format!("unhandled transport: {other}")).with_code(CONFIG_ERROR)),
    }
}

fn basename(location: &str) -> &str {
    Path::new(location).file_name().and_then(|n| n.to_str()).unwrap_or(location)
}

/// Split `url`'s path into (directory, bare filename) for transports that
/// need to create the destination directory before writing the file.
pub(crate) fn split_dir_and_name(url: &Url) -> (String, String) {
    match url.path.rsplit_once('/') {
        Some((dir, name)) => (dir.to_owned(), name.to_owned()),
        None => (String::new(), url.path.clone()),
    }
}

pub(crate) fn dest_path_buf(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_rejects_unhandled_transport() {
        let tools = ToolRegistry::new();
        // `git://` parses fine (`Transport::Git` is a recognized scheme) but
        // `fetch_file`'s dispatch has no arm for it, so this exercises the
        // `other =>` fallback rather than `Url::parse` itself rejecting the
        // scheme.
        let source = Url::parse("git://host/x").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let err = fetch_file(&tools, &source, "x", dest.path(), None).await.unwrap_err();
        assert_eq!(err.code(), Some(CONFIG_ERROR));
        assert!(err.to_string().contains("unhandled transport"));
    }

    #[test]
    fn basename_extracts_final_path_component() {
        assert_eq!(basename("x/y/z.tar"), "z.tar");
        assert_eq!(basename("bare"), "bare");
    }

    #[test]
    fn split_dir_and_name_handles_nested_and_bare_paths() {
        let url = Url::parse("file:///a/b/c.txt").unwrap();
        assert_eq!(split_dir_and_name(&url), ("a/b".to_owned(), "c.txt".to_owned()));

        let url = Url::parse("file:///c.txt").unwrap();
        assert_eq!(split_dir_and_name(&url), (String::new(), "c.txt".to_owned()));
    }
}
