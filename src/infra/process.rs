//! Bounded execution of external programs.

use std::{
    io::{self, ErrorKind},
    process::{Output, Stdio},
    time::Duration,
};

use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error while talking to `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

/// Run `command` to completion, feeding `stdin` when provided.
///
/// The child is killed when the deadline passes; stdout and stderr are
/// captured in full.
pub async fn run_with_timeout(
    mut command: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<Output, ProcessError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let pipe = child.stdin.take();
    let feed = async move {
        let (Some(input), Some(mut pipe)) = (stdin, pipe) else {
            return Ok(());
        };
        let written = pipe.write_all(&input).await;
        drop(pipe);
        match written {
            // The program may exit without reading its input; its status tells the story.
            Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    };

    let run = async {
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let io_error = |source: io::Error| ProcessError::Io {
            program: program.clone(),
            source,
        };
        fed.map_err(io_error)?;
        output.map_err(io_error)
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => Err(ProcessError::TimedOut { program, timeout }),
    }
}

/// Lossy, trimmed stderr for logs and error messages.
pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}
