use anyhow::{anyhow, Context, Result};
use log::{error, trace};
use std::ffi::OsStr;
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

/// Run command returning decoded stdout.
///
/// On failure the error message carries the command's stderr, so callers can
/// classify well-known failures (e.g. "no free loop device").
pub fn run_command<I, S>(commands: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let commands = commands
        .into_iter()
        .map(|s| (*s.as_ref()).to_os_string())
        .collect::<Vec<_>>();
    let (program, args) = commands
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;

    trace!(
        "running command: '{} {}'",
        program.to_string_lossy(),
        args.join(OsStr::new(" ")).to_string_lossy()
    );

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context(format!(
            "failed to spawn child process for `{}`",
            program.to_string_lossy()
        ))?;

    // Log stdout and stderr of child process from separate threads
    let stdout = child.stdout.take().ok_or_else(|| {
        anyhow!(
            "failed to capture stdout of `{}`",
            program.to_string_lossy()
        )
    })?;

    let stderr = child.stderr.take().ok_or_else(|| {
        anyhow!(
            "failed to capture stderr of `{}`",
            program.to_string_lossy()
        )
    })?;

    let (stdout_tx, stdout_rx) = mpsc::channel::<String>();
    let (stderr_tx, stderr_rx) = mpsc::channel::<String>();
    let stdout_log_target = program.to_string_lossy().to_string();
    let stderr_log_target = program.to_string_lossy().to_string();

    let stdout_thread = thread::spawn(move || {
        BufReader::new(stdout)
            .lines()
            .map_while(Result::ok)
            .for_each(|line| {
                trace!(target: stdout_log_target.as_str(), "{}", line);
                // receiver outlives this thread
                let _ = stdout_tx.send(line);
            });
    });

    let stderr_thread = thread::spawn(move || {
        BufReader::new(stderr)
            .lines()
            .map_while(Result::ok)
            .for_each(|line| {
                trace!(target: stderr_log_target.as_str(), "{}", line);
                let _ = stderr_tx.send(line);
            });
    });

    let exit_status = child.wait().context(format!(
        "attempted to wait for child process `{}` which is not running",
        program.to_string_lossy()
    ))?;

    stdout_thread
        .join()
        .map_err(|_| anyhow!("stdout reader of `{}` panicked", program.to_string_lossy()))?;
    stderr_thread
        .join()
        .map_err(|_| anyhow!("stderr reader of `{}` panicked", program.to_string_lossy()))?;

    let stdout = stdout_rx.into_iter().collect::<Vec<String>>().join("\n");
    let stderr = stderr_rx.into_iter().collect::<Vec<String>>().join("\n");

    if exit_status.success() {
        Ok(stdout)
    } else {
        stderr
            .lines()
            .for_each(|line| error!(target: &program.to_string_lossy(), "{}", line));
        Err(anyhow!(
            "child process `{}` failed with {}: {}",
            program.to_string_lossy(),
            exit_status,
            stderr.trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::run_command;

    #[test]
    fn test_run_command_stdout() {
        let out = run_command(["sh", "-c", "echo /dev/loop7"]).expect("sh must run");
        assert_eq!(out, "/dev/loop7");
    }

    #[test]
    fn test_run_command_failure_carries_stderr() {
        let err = run_command(["sh", "-c", "echo 'no free loop device' >&2; exit 1"])
            .expect_err("command must fail");
        assert!(format!("{err:#}").contains("no free loop device"));
    }

    #[test]
    fn test_run_command_empty() {
        assert!(run_command(Vec::<&str>::new()).is_err());
    }
}
