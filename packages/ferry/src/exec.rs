//! Running external tools and capturing their output.
//!
//! Two shapes cover every way this crate needs to run a subprocess:
//! [`callcmd_capture`] runs one program and streams its merged stdout/stderr
//! to a callback in arrival order, and [`callcmd_pipe`] chains several
//! programs together the way a shell pipeline would. Both route through
//! [`tokio::process::Command`] with argv-based arguments; neither ever
//! builds a shell command line.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::error::{Error, INTERRUPT, TOOL_FAIL};

/// Signals that flip the process-wide cancellation flag checked by
/// [`callcmd_capture`] between output lines. Registered once by
/// [`install_signal_handlers`].
#[cfg(unix)]
const CANCEL_SIGNALS: [std::ffi::c_int; 4] = [
    signal_hook::consts::SIGINT,
    signal_hook::consts::SIGTERM,
    signal_hook::consts::SIGHUP,
    signal_hook::consts::SIGPIPE,
];

static CANCELLED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

/// Register handlers for `SIGINT`/`SIGTERM`/`SIGHUP`/`SIGPIPE` that set a
/// process-wide cancellation flag, checked by [`callcmd_capture`] between
/// output lines so a long-running child can be abandoned promptly.
///
/// Safe to call more than once; `signal_hook::low_level::register` itself
/// tolerates duplicate registration, each call simply adds another handler.
#[cfg(unix)]
pub fn install_signal_handlers() -> Result<(), Error> {
    for signal in CANCEL_SIGNALS {
        // SAFETY: the handler only performs an async-signal-safe atomic
        // store, per the requirement documented on
        // `signal_hook::low_level::register`.
        unsafe {
            signal_hook::low_level::register(signal, || {
                CANCELLED.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        }
        .map_err(|err| Error::new(format!("failed to register handler for signal {signal}: {err}")))?;
    }
    Ok(())
}

/// Whether a cancellation signal has been observed since startup (or since
/// [`reset_cancelled`] was last called).
pub fn is_cancelled() -> bool {
    CANCELLED.load(std::sync::atomic::Ordering::SeqCst)
}

/// Clear the cancellation flag. Intended for tests; production code should
/// treat cancellation as terminal for the process.
pub fn reset_cancelled() {
    CANCELLED.store(false, std::sync::atomic::Ordering::SeqCst);
}

/// One line of output from [`callcmd_capture`], tagged by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Stdout(String),
    Stderr(String),
}

impl Line {
    pub fn as_str(&self) -> &str {
        match self {
            Line::Stdout(s) | Line::Stderr(s) => s,
        }
    }
}

/// Decode a [`std::process::ExitStatus`] into a small integer the way a
/// POSIX shell's `$?` would: the exit code if the process exited normally,
/// or `128 + signal number` if it was killed by a signal.
#[cfg(unix)]
pub fn decode_exit_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(not(unix))]
pub fn decode_exit_status(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Run `program` with `args`, calling `on_line` for each line of output in
/// the order the child produced it (stdout and stderr interleaved), and
/// returning an error tagged [`TOOL_FAIL`] if the child exits nonzero or is
/// killed by a signal, or [`INTERRUPT`] if a cancellation signal arrived
/// while the child was running.
///
/// `on_line` is synchronous and must not block: it runs inline on the task
/// draining output, between every line.
#[instrument(skip(args, on_line), fields(program = %program.as_ref().to_string_lossy()))]
pub async fn callcmd_capture(
    program: impl AsRef<OsStr>,
    args: &[impl AsRef<OsStr>],
    mut on_line: impl FnMut(Line),
) -> Result<(), Error> {
    let mut child = Command::new(program.as_ref())
        .args(args.iter().map(AsRef::as_ref))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| Error::new(format!("failed to spawn {}: {err}", program.as_ref().to_string_lossy())))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stdout_tx = tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdout_tx.send(Line::Stdout(line)).is_err() {
                break;
            }
        }
    });
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(Line::Stderr(line)).is_err() {
                break;
            }
        }
    });

    let mut interrupted = false;
    while let Some(line) = rx.recv().await {
        on_line(line);
        if is_cancelled() {
            interrupted = true;
            break;
        }
    }

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    if interrupted {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return Err(Error::new(format!(
            "{} interrupted by signal before completion",
            program.as_ref().to_string_lossy()
        ))
        .with_code(INTERRUPT));
    }

    let status = child
        .wait()
        .await
        .map_err(|err| Error::new(format!("failed to wait on {}: {err}", program.as_ref().to_string_lossy())))?;

    if !status.success() {
        return Err(Error::new(format!(
            "{} exited with status {}",
            program.as_ref().to_string_lossy(),
            decode_exit_status(status)
        ))
        .with_code(TOOL_FAIL));
    }

    Ok(())
}

/// One stage of a [`callcmd_pipe`] chain.
pub struct Stage<'a> {
    pub program: &'a OsStr,
    pub args: Vec<&'a OsStr>,
}

/// The outcome of a [`callcmd_pipe`] run: the last stage's stdout, and one
/// exit code per stage in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeOutput {
    pub stdout: Vec<u8>,
    pub statuses: Vec<i32>,
}

/// Run a chain of programs with each stage's stdout feeding the next
/// stage's stdin, the way a shell `a | b | c` pipeline would.
///
/// Every stage's stderr is drained concurrently and merged line-by-line
/// into `on_line`, tagged with the stage's index; line order across stages
/// is undefined, but lines within a single stage arrive in the order that
/// stage wrote them. If every stage exits zero, returns the final stage's
/// stdout plus one exit code per stage, in pipeline order. If any stage
/// exits nonzero, all stages are still waited on (so none are left as
/// zombies), but the call reports only an error tagged [`TOOL_FAIL`] naming
/// the first such stage in pipeline order; the rest of that run's per-stage
/// codes are not exposed, matching how [`callcmd_capture`] reports a single
/// failure rather than partial output.
#[instrument(skip(stages, on_line), fields(stage_count = stages.len()))]
pub async fn callcmd_pipe(stages: &[Stage<'_>], mut on_line: impl FnMut(usize, Line)) -> Result<PipeOutput, Error> {
    if stages.is_empty() {
        return Err(Error::new("callcmd_pipe requires at least one stage"));
    }

    let mut children = Vec::with_capacity(stages.len());
    let mut next_stdin = Stdio::null();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut stderr_tasks = Vec::with_capacity(stages.len());
    let mut last_stdout_task = None;
    let last_index = stages.len() - 1;

    for (i, stage) in stages.iter().enumerate() {
        let is_last = i == last_index;
        let mut cmd = Command::new(stage.program);
        cmd.args(&stage.args)
            .stdin(next_stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| Error::new(format!("failed to spawn {}: {err}", stage.program.to_string_lossy())))?;

        let stderr = child.stderr.take().expect("piped stderr");
        let stage_tx = tx.clone();
        stderr_tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stage_tx.send((i, line)).is_err() {
                    break;
                }
            }
        }));

        if is_last {
            let mut stdout = child.stdout.take().expect("piped stdout");
            last_stdout_task = Some(tokio::spawn(async move {
                let mut buf = Vec::new();
                tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await.map(|_| buf)
            }));
            next_stdin = Stdio::null();
        } else {
            next_stdin = child
                .stdout
                .take()
                .expect("piped stdout")
                .try_into()
                .map_err(|err| Error::new(format!("failed to chain pipeline stage: {err}")))?;
        }

        children.push((stage.program, child));
    }
    drop(tx);

    // Every stage's stderr pipe must be drained while the last stage's
    // stdout is read concurrently: if either stream fills its OS pipe
    // buffer while nobody is reading it, that stage blocks on write and
    // the whole pipeline deadlocks waiting for it to exit.
    let (_, last_stdout) = tokio::join!(
        async {
            while let Some((i, line)) = rx.recv().await {
                on_line(i, Line::Stderr(line));
            }
        },
        async {
            match last_stdout_task.take() {
                Some(handle) => handle
                    .await
                    .map_err(|err| Error::new(format!("stdout reader task panicked: {err}")))?
                    .map_err(|err| Error::new(format!("failed to read final stage stdout: {err}"))),
                None => unreachable!("exactly one stage is last"),
            }
        }
    );
    let last_stdout = last_stdout?;

    for task in stderr_tasks {
        let _ = task.await;
    }

    let mut statuses = Vec::with_capacity(children.len());
    let mut first_failure = None;
    for (program, mut child) in children {
        let status = child
            .wait()
            .await
            .map_err(|err| Error::new(format!("failed to wait on {}: {err}", program.to_string_lossy())))?;
        let code = decode_exit_status(status);
        statuses.push(code);
        if !status.success() && first_failure.is_none() {
            first_failure = Some((program.to_string_lossy().into_owned(), code));
        }
    }

    if let Some((program, code)) = first_failure {
        return Err(Error::new(format!("{program} exited with status {code}")).with_code(TOOL_FAIL));
    }

    Ok(PipeOutput {
        stdout: last_stdout,
        statuses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_lines_in_order() {
        let mut lines = Vec::new();
        callcmd_capture("printf", &["a\\nb\\nc\\n"], |line| lines.push(line))
            .await
            .unwrap();
        let rendered: Vec<_> = lines.iter().map(Line::as_str).collect();
        assert_eq!(rendered, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_tool_fail() {
        let err = callcmd_capture("false", &[] as &[&str], |_: Line| {}).await.unwrap_err();
        assert_eq!(err.code(), Some(TOOL_FAIL));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let err = callcmd_capture("definitely-not-a-real-binary", &[] as &[&str], |_: Line| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn pipe_chains_stdout_to_stdin() {
        let stages = vec![
            Stage {
                program: OsStr::new("printf"),
                args: vec![OsStr::new("b\na\nc\n")],
            },
            Stage {
                program: OsStr::new("sort"),
                args: vec![],
            },
        ];
        let out = callcmd_pipe(&stages, |_, _| {}).await.unwrap();
        assert_eq!(String::from_utf8(out.stdout).unwrap(), "a\nb\nc\n");
        assert_eq!(out.statuses, vec![0, 0]);
    }

    #[tokio::test]
    async fn pipe_reports_failing_stage() {
        let stages = vec![Stage {
            program: OsStr::new("false"),
            args: vec![],
        }];
        let err = callcmd_pipe(&stages, |_, _| {}).await.unwrap_err();
        assert_eq!(err.code(), Some(TOOL_FAIL));
    }

    #[tokio::test]
    async fn pipe_status_vector_records_every_stage() {
        let stages = vec![
            Stage {
                program: OsStr::new("true"),
                args: vec![],
            },
            Stage {
                program: OsStr::new("true"),
                args: vec![],
            },
            Stage {
                program: OsStr::new("true"),
                args: vec![],
            },
        ];
        let out = callcmd_pipe(&stages, |_, _| {}).await.unwrap();
        assert_eq!(out.statuses, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn pipe_error_names_the_first_failing_stage() {
        let stages = vec![
            Stage {
                program: OsStr::new("true"),
                args: vec![],
            },
            Stage {
                program: OsStr::new("false"),
                args: vec![],
            },
        ];
        let err = callcmd_pipe(&stages, |_, _| {}).await.unwrap_err();
        assert_eq!(err.code(), Some(TOOL_FAIL));
        assert!(err.to_string().contains("false"));
    }

    #[tokio::test]
    async fn pipe_merges_stderr_from_every_stage() {
        let stages = vec![
            Stage {
                program: OsStr::new("sh"),
                args: vec![OsStr::new("-c"), OsStr::new("echo one >&2")],
            },
            Stage {
                program: OsStr::new("sh"),
                args: vec![OsStr::new("-c"), OsStr::new("cat >/dev/null; echo two >&2")],
            },
        ];
        let mut lines = Vec::new();
        callcmd_pipe(&stages, |i, line| lines.push((i, line.as_str().to_owned())))
            .await
            .unwrap();
        assert!(lines.contains(&(0, "one".to_owned())));
        assert!(lines.contains(&(1, "two".to_owned())));
    }

    #[tokio::test]
    async fn pipe_drains_large_stderr_without_deadlock() {
        // A stage writing well past a single OS pipe buffer (~64KB) to
        // stderr must not block forever waiting for a reader.
        let stages = vec![Stage {
            program: OsStr::new("sh"),
            args: vec![
                OsStr::new("-c"),
                OsStr::new("yes x | head -c 200000 >&2; printf done"),
            ],
        }];
        let mut stderr_bytes = 0usize;
        let out = callcmd_pipe(&stages, |_, line| stderr_bytes += line.as_str().len())
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out.stdout).unwrap(), "done");
        assert!(stderr_bytes >= 200_000);
    }

    #[test]
    fn exit_status_decodes_signal_as_128_plus_signo() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(9); // killed by SIGKILL (signal 9)
        assert_eq!(decode_exit_status(status), 128 + 9);
    }
}
