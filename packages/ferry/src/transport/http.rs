//! The `http`/`https` transports, via `curl`.

use std::path::Path;

use crate::error::{Error, TOOL_FAIL};
use crate::exec::{Line, callcmd_capture};
use crate::tools::ToolRegistry;
use crate::url::Url;

pub async fn fetch(tools: &ToolRegistry, source: &Url, temp_path: &Path) -> Result<(), Error> {
    let curl = tools.get_tool_path("curl")?;
    let args = vec![
        "--create-dirs".to_owned(),
        "--silent".to_owned(),
        "--show-error".to_owned(),
        "--fail".to_owned(),
        source.to_string(),
        "-o".to_owned(),
        temp_path.to_string_lossy().into_owned(),
    ];

    let mut tail = Vec::new();
    callcmd_capture(&curl, &args, |line: Line| tail.push(line.as_str().to_owned()))
        .await
        .map_err(|err| {
            if err.code() == Some(TOOL_FAIL) {
                err.cat(Error::new(tail.join("\n")))
            } else {
                err
            }
        })
}

/// `curl --head --fail`: a nonzero exit is treated as "not present" rather
/// than propagated, since HTTP connectivity failures and 404s both exit
/// nonzero and this call's contract is a best-effort presence check, not a
/// general-purpose HTTP client.
pub async fn exists(tools: &ToolRegistry, source: &Url) -> Result<bool, Error> {
    let curl = tools.get_tool_path("curl")?;
    let args = vec![
        "--head".to_owned(),
        "--fail".to_owned(),
        "--silent".to_owned(),
        source.to_string(),
    ];
    Ok(callcmd_capture(&curl, &args, |_: Line| {}).await.is_ok())
}
