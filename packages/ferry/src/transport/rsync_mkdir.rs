//! Creating a directory on a remote that only accepts `rsync` invocations
//! (a restricted-shell SSH account with no general command execution).
//!
//! This is a surprising but effective workaround: `rsync -r <empty dir>/
//! host:/a/b/c/` creates every path component of `/a/b/c` that doesn't yet
//! exist, as a side effect of rsync's directory-sync behavior, *provided*
//! the parent already exists. So the trick is to find how much of the path
//! already exists by walking backward from the full path until a prefix
//! succeeds, then walk forward re-creating each missing component.

use crate::error::Error;
use crate::exec::{Line, callcmd_capture};
use crate::tools::ToolRegistry;

/// Create `remote_path` (an absolute path with no trailing slash
/// requirement) on `user_host` using only `rsync` invocations.
pub async fn rsync_only_mkdir(tools: &ToolRegistry, user_host: &str, remote_path: &str) -> Result<(), Error> {
    let components: Vec<&str> = remote_path.trim_matches('/').split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Ok(());
    }

    let empty_dir = tempfile::tempdir().map_err(|err| Error::new(format!("failed to create scratch dir: {err}")))?;
    let rsync = tools.get_tool_path("rsync")?;

    // Walk backward from the full path to find the longest prefix that
    // already exists (or can be created directly because its parent does).
    let mut depth = components.len();
    let mut failing = Vec::new();
    loop {
        if sync_prefix(&rsync, empty_dir.path(), user_host, &components, depth).await? {
            break;
        }
        if depth == 0 {
            return Err(Error::new(format!(
                "rsync-only mkdir could not create any prefix of {remote_path} on {user_host}"
            )));
        }
        failing.push(depth);
        depth -= 1;
    }

    // Walk forward, re-creating each component we popped.
    for depth in failing.into_iter().rev() {
        if !sync_prefix(&rsync, empty_dir.path(), user_host, &components, depth).await? {
            return Err(Error::new(format!(
                "rsync-only mkdir failed to recreate prefix depth {depth} of {remote_path} on {user_host}"
            )));
        }
    }

    Ok(())
}

async fn sync_prefix(
    rsync: &std::path::Path,
    empty_dir: &std::path::Path,
    user_host: &str,
    components: &[&str],
    depth: usize,
) -> Result<bool, Error> {
    let prefix = format!("/{}/", components[..depth].join("/"));
    let remote = format!("{user_host}:{prefix}");
    let args = vec!["-r".to_owned(), format!("{}/", empty_dir.to_string_lossy()), remote];
    Ok(callcmd_capture(rsync, &args, |_: Line| {}).await.is_ok())
}
