//! The `file` transport: local filesystem, reached through `rsync` for
//! fetches (so that `-L`'s symlink-dereferencing semantics and the
//! rename-as-commit detector are shared with the other transports) and
//! direct filesystem calls for pushes where possible.

use std::path::Path;

use tracing::warn;

use crate::error::Error;
use crate::exec::{Line, callcmd_capture};
use crate::perm::Perm;
use crate::tools::ToolRegistry;
use crate::url::{Transport, Url};

use super::split_dir_and_name;

pub async fn fetch(tools: &ToolRegistry, source: &Url, temp_path: &Path) -> Result<(), Error> {
    let abs_src = source.to_file_path(Some(Transport::File), false)?;
    let rsync = tools.get_tool_path("rsync")?;
    let args = vec!["-L".to_owned(), abs_src, temp_path.to_string_lossy().into_owned()];

    callcmd_capture(&rsync, &args, |_: Line| {}).await
}

pub async fn push(
    tools: &ToolRegistry,
    local_path: &Path,
    dest: &Url,
    push_permissions: Option<&str>,
    try_hardlink: bool,
) -> Result<(), Error> {
    let (dir, _name) = split_dir_and_name(dest);
    let abs_dir = format!("/{dir}");
    let abs_dest = dest.to_file_path(Some(Transport::File), false)?;

    let mkdir = tools.get_tool_path("mkdir")?;
    let mkdir_args = if let Some(perm) = push_permissions {
        let parsed = Perm::parse(perm)?;
        let mode = parsed.apply(0o755);
        vec!["-p".to_owned(), "-m".to_owned(), format!("{mode:o}"), abs_dir.clone()]
    } else {
        vec!["-p".to_owned(), abs_dir.clone()]
    };
    callcmd_capture(&mkdir, &mkdir_args, |_: Line| {}).await?;

    if push_permissions.is_none() && try_hardlink {
        let _ = std::fs::remove_file(&abs_dest);
        if std::fs::hard_link(local_path, &abs_dest).is_ok() {
            return Ok(());
        }
    }

    let rsync = tools.get_tool_path("rsync")?;
    let mut args = vec![local_path.to_string_lossy().into_owned(), abs_dest.clone()];
    if let Some(perm) = push_permissions {
        args.insert(0, format!("--chmod={perm}"));
    }
    callcmd_capture(&rsync, &args, |_: Line| {}).await?;
    if push_permissions.is_some() {
        warn!(dest = %abs_dest, "file transport push applied --chmod via rsync fallback");
    }
    Ok(())
}

pub async fn exists(source: &Url) -> Result<bool, Error> {
    let abs_src = source.to_file_path(Some(Transport::File), false)?;
    Ok(tokio::fs::metadata(&abs_src).await.is_ok())
}
