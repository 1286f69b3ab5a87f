//! Child process plumbing shared by the process-backed engines.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::{EngineError, ExecOutput};

/// How captured lines are echoed to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
  /// Stage output the user wants to see while it runs.
  Info,
  /// Engine plumbing.
  Debug,
}

/// Run `command` to completion, streaming stdout and stderr into the log.
///
/// Both pipes are drained concurrently so neither can fill up and stall the
/// child. The returned output interleaves the two streams in arrival order.
pub async fn run_streaming(mut command: Command, label: &str, echo: Echo) -> std::io::Result<ExecOutput> {
  let mut child = command
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()?;

  let (tx, mut rx) = mpsc::unbounded_channel::<String>();
  let mut readers = Vec::new();
  if let Some(stdout) = child.stdout.take() {
    readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
  }
  if let Some(stderr) = child.stderr.take() {
    readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
  }
  drop(tx);

  let mut output = String::new();
  while let Some(line) = rx.recv().await {
    match echo {
      Echo::Info => info!(target: "frontbuild::engine_output", "[{}] {}", label, line),
      Echo::Debug => debug!(target: "frontbuild::engine_output", "[{}] {}", label, line),
    }
    output.push_str(&line);
    output.push('\n');
  }
  for reader in readers {
    let _ = reader.await;
  }

  let status = child.wait().await?;
  Ok(ExecOutput {
    code: status.code(),
    output,
    cached: false,
  })
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
  R: AsyncRead + Unpin,
{
  let mut reader = BufReader::new(reader);
  let mut buf = Vec::new();
  loop {
    buf.clear();
    match reader.read_until(b'\n', &mut buf).await {
      Ok(0) | Err(_) => break,
      Ok(_) => {
        let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
        if tx.send(line).is_err() {
          break;
        }
      }
    }
  }
}

/// Run a plumbing command and return its trimmed stdout.
///
/// Non-zero exits become [`EngineError::Command`] carrying stderr; a
/// missing program becomes [`EngineError::Unavailable`].
pub async fn capture(program: &str, args: &[String]) -> Result<String, EngineError> {
  let rendered = render(program, args);
  debug!(command = %rendered, "running engine command");

  let output = Command::new(program)
    .args(args)
    .stdin(Stdio::null())
    .output()
    .await
    .map_err(|e| match e.kind() {
      std::io::ErrorKind::NotFound => EngineError::Unavailable {
        program: program.to_string(),
        message: "executable not found in PATH".to_string(),
      },
      _ => EngineError::Io(e),
    })?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    return Err(EngineError::Command {
      command: rendered,
      message: if stderr.is_empty() {
        format!("exited with {:?}", output.status.code())
      } else {
        stderr
      },
    });
  }

  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Render a command line for logs and error messages.
pub fn render(program: &str, args: &[String]) -> String {
  std::iter::once(program)
    .chain(args.iter().map(String::as_str))
    .collect::<Vec<_>>()
    .join(" ")
}
