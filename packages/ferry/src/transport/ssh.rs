//! The `ssh`/`scp`/`rsync+ssh` transports.

use std::path::Path;
use std::sync::Once;

use tracing::warn;

use crate::error::{Error, TOOL_FAIL};
use crate::exec::{Line, callcmd_capture};
use crate::tools::ToolRegistry;
use crate::url::Url;

use super::rsync_mkdir::rsync_only_mkdir;
use super::split_dir_and_name;

static SCP_NOT_CRASH_SAFE_WARNED: Once = Once::new();
static SCP_IGNORES_PERMISSIONS_WARNED: Once = Once::new();

fn user_host(url: &Url) -> String {
    match &url.user {
        Some(user) => format!("{user}@{}", url.servername),
        None => url.servername.clone(),
    }
}

/// Quote `s` for interpolation into a remote shell command the way
/// `scp`/`ssh` need it: wrapped in single quotes, with embedded single
/// quotes escaped as `'\''`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

async fn ssh_flags(tools: &ToolRegistry) -> Result<Vec<String>, Error> {
    tools.get_tool_flags_argv("ssh")
}

pub async fn fetch_rsync_ssh(tools: &ToolRegistry, source: &Url, temp_path: &Path) -> Result<(), Error> {
    let rsync = tools.get_tool_path("rsync")?;
    let ssh = tools.get_tool_path("ssh")?;
    let mut flags = ssh_flags(tools).await?;
    flags.insert(0, ssh.to_string_lossy().into_owned());

    let remote = format!("{}:/{}", user_host(source), source.path);
    let args = vec![
        format!("--rsh={}", flags.join(" ")),
        remote,
        temp_path.to_string_lossy().into_owned(),
    ];
    callcmd_capture(&rsync, &args, |_: Line| {}).await
}

pub async fn fetch_scp(tools: &ToolRegistry, source: &Url, temp_path: &Path) -> Result<(), Error> {
    let scp = tools.get_tool_path("scp")?;
    let remote = format!("{}:{}", user_host(source), shell_quote(&format!("/{}", source.path)));
    let args = vec![remote, temp_path.to_string_lossy().into_owned()];
    callcmd_capture(&scp, &args, |_: Line| {}).await
}

pub async fn push_rsync_ssh(
    tools: &ToolRegistry,
    local_path: &Path,
    dest: &Url,
    push_permissions: Option<&str>,
) -> Result<(), Error> {
    let (dir, _name) = split_dir_and_name(dest);
    rsync_only_mkdir(tools, &user_host(dest), &format!("/{dir}")).await?;

    let rsync = tools.get_tool_path("rsync")?;
    let ssh = tools.get_tool_path("ssh")?;
    let mut flags = ssh_flags(tools).await?;
    flags.insert(0, ssh.to_string_lossy().into_owned());

    let mut args = vec![format!("--rsh={}", flags.join(" "))];
    if let Some(perm) = push_permissions {
        args.push(format!("--chmod={perm}"));
    }
    args.push(local_path.to_string_lossy().into_owned());
    args.push(format!("{}:/{}", user_host(dest), dest.path));

    callcmd_capture(&rsync, &args, |_: Line| {}).await
}

pub async fn push_scp(tools: &ToolRegistry, local_path: &Path, dest: &Url, push_permissions: Option<&str>) -> Result<(), Error> {
    SCP_NOT_CRASH_SAFE_WARNED.call_once(|| {
        warn!("scp uploads are not crash-safe: a failure partway through can leave a partial file at the destination");
    });
    if push_permissions.is_some() {
        SCP_IGNORES_PERMISSIONS_WARNED.call_once(|| {
            warn!("push_permissions was given but the scp/ssh transport cannot apply destination permissions");
        });
    }

    let (dir, _name) = split_dir_and_name(dest);
    let ssh = tools.get_tool_path("ssh")?;
    callcmd_capture(
        &ssh,
        &[user_host(dest), format!("mkdir -p /{dir}")],
        |_: Line| {},
    )
    .await?;

    let scp = tools.get_tool_path("scp")?;
    let remote = format!("{}:{}", user_host(dest), shell_quote(&format!("/{}", dest.path)));
    callcmd_capture(&scp, &[local_path.to_string_lossy().into_owned(), remote], |_: Line| {}).await
}

pub async fn exists_rsync_ssh(tools: &ToolRegistry, source: &Url) -> Result<bool, Error> {
    let rsync = tools.get_tool_path("rsync")?;
    let ssh = tools.get_tool_path("ssh")?;
    let mut flags = ssh_flags(tools).await?;
    flags.insert(0, ssh.to_string_lossy().into_owned());

    let remote = format!("{}:/{}", user_host(source), source.path);
    let args = vec!["-n".to_owned(), format!("--rsh={}", flags.join(" ")), remote, "/dev/null".to_owned()];
    Ok(callcmd_capture(&rsync, &args, |_: Line| {}).await.is_ok())
}

pub async fn exists_ssh(tools: &ToolRegistry, source: &Url) -> Result<bool, Error> {
    let ssh = tools.get_tool_path("ssh")?;
    let remote_path = shell_quote(&format!("/{}", source.path));

    let present = callcmd_capture(
        &ssh,
        &[user_host(source), format!("test -e {remote_path}")],
        |_: Line| {},
    )
    .await
    .is_ok();

    let absent = callcmd_capture(
        &ssh,
        &[user_host(source), format!("test ! -e {remote_path}")],
        |_: Line| {},
    )
    .await
    .is_ok();

    if present == absent {
        return Err(Error::new(format!(
            "could not determine existence of {} over ssh (connectivity failure)",
            source
        ))
        .with_code(TOOL_FAIL));
    }

    Ok(present)
}
