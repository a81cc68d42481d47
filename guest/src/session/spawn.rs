//! Turning an `ExecuteCommand` into a running process.

use std::process::Stdio;
use std::time::Duration;

use guestctl_shared::protocol::{ExecCommand, ProcessStatus};
use guestctl_shared::{GuestCtlError, GuestCtlResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use super::exit;
use super::tools::{Tool, ToolProcess};

pub(crate) type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Standard streams taken from a [`Launched`] process.
pub(crate) struct ProcessIo {
    pub(crate) stdin: Option<ProcessWriter>,
    pub(crate) stdout: Option<ProcessReader>,
    pub(crate) stderr: Option<ProcessReader>,
}

/// A started command: a child process or a built-in tool.
pub(crate) enum Launched {
    Child(Child),
    Tool(ToolProcess),
}

impl Launched {
    /// `None` when the child has already been reaped.
    pub(crate) fn id(&self) -> Option<u32> {
        match self {
            Self::Child(child) => child.id(),
            Self::Tool(tool) => Some(tool.pid()),
        }
    }

    pub(crate) fn take_io(&mut self) -> ProcessIo {
        match self {
            Self::Child(child) => ProcessIo {
                stdin: child.stdin.take().map(|s| Box::new(s) as ProcessWriter),
                stdout: child.stdout.take().map(|s| Box::new(s) as ProcessReader),
                stderr: child.stderr.take().map(|s| Box::new(s) as ProcessReader),
            },
            Self::Tool(tool) => ProcessIo {
                stdin: tool.stdin.take().map(|s| Box::new(s) as ProcessWriter),
                stdout: tool.stdout.take().map(|s| Box::new(s) as ProcessReader),
                stderr: tool.stderr.take().map(|s| Box::new(s) as ProcessReader),
            },
        }
    }

    /// Wait for the process to end and classify how it did.
    pub(crate) async fn wait(&mut self) -> std::io::Result<(ProcessStatus, u32)> {
        match self {
            Self::Child(child) => child.wait().await.map(exit::classify),
            Self::Tool(tool) => Ok(tool.wait().await),
        }
    }

    /// Kill the process and wait for it; false when it could not be confirmed dead.
    pub(crate) async fn kill(&mut self, grace: Duration) -> bool {
        match self {
            Self::Child(child) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill process");
                    return false;
                }
                matches!(tokio::time::timeout(grace, child.wait()).await, Ok(Ok(_)))
            }
            Self::Tool(tool) => tool.kill(grace).await,
        }
    }
}

/// Program and argument vector (without argv\[0\]) for `cmd`.
///
/// A command line without separate arguments is split shell-style.
pub(crate) fn program_and_args(cmd: &ExecCommand) -> GuestCtlResult<(String, Vec<String>)> {
    if cmd.command.trim().is_empty() {
        return Err(GuestCtlError::Config("command is empty".into()));
    }
    if !cmd.args.is_empty() || !cmd.command.contains(char::is_whitespace) {
        return Ok((cmd.command.clone(), cmd.args.clone()));
    }

    let words = shell_words::split(&cmd.command).map_err(|e| {
        GuestCtlError::Config(format!("command line {:?}: {e}", cmd.command))
    })?;
    let mut words = words.into_iter();
    match words.next() {
        Some(program) if !program.is_empty() => Ok((program, words.collect())),
        _ => Err(GuestCtlError::Config(format!(
            "command line {:?} has no program",
            cmd.command
        ))),
    }
}

/// Start `cmd`, either as a built-in tool or as a child process.
pub(crate) fn launch(cmd: &ExecCommand) -> GuestCtlResult<Launched> {
    let (program, args) = program_and_args(cmd)?;
    match Tool::from_program(&program) {
        Some(tool) if !cmd.user.is_empty() => Err(GuestCtlError::Unsupported(format!(
            "{} cannot run as user {}",
            tool.name(),
            cmd.user
        ))),
        Some(tool) => Ok(Launched::Tool(ToolProcess::start(tool, args))),
        None => spawn_child(cmd, program, args).map(Launched::Child),
    }
}

/// Start a child with all three standard streams piped.
fn spawn_child(cmd: &ExecCommand, program: String, args: Vec<String>) -> GuestCtlResult<Child> {
    let mut command = Command::new(&program);
    command
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for entry in &cmd.env {
        // The codec only lets through entries with a non-empty key.
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }

    if !cmd.user.is_empty() {
        apply_user(&mut command, &cmd.user)?;
    }

    let child = command.spawn()?;
    tracing::debug!(%program, ?args, pid = ?child.id(), "Spawned child");
    Ok(child)
}

#[cfg(unix)]
fn apply_user(command: &mut Command, name: &str) -> GuestCtlResult<()> {
    use nix::unistd::User;

    let user = User::from_name(name)
        .map_err(|e| GuestCtlError::Io(std::io::Error::from(e)))?
        .ok_or_else(|| GuestCtlError::NotFound(format!("user {name}")))?;
    command.uid(user.uid.as_raw()).gid(user.gid.as_raw());
    Ok(())
}

#[cfg(not(unix))]
fn apply_user(_command: &mut Command, name: &str) -> GuestCtlResult<()> {
    Err(GuestCtlError::Unsupported(format!(
        "running as user {name} is not supported on this platform"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestctl_shared::constants::error_code;

    fn exec(command: &str, args: &[&str]) -> ExecCommand {
        ExecCommand {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_command_line_is_split_without_args() {
        let (program, args) = program_and_args(&exec("echo 'a b' c", &[])).unwrap();
        assert_eq!(program, "echo");
        assert_eq!(args, vec!["a b", "c"]);
    }

    #[test]
    fn test_explicit_args_are_kept() {
        let (program, args) = program_and_args(&exec("/bin/echo", &["x y"])).unwrap();
        assert_eq!(program, "/bin/echo");
        assert_eq!(args, vec!["x y"]);
    }

    #[test]
    fn test_empty_command_is_invalid() {
        let err = program_and_args(&exec("   ", &[])).unwrap_err();
        assert_eq!(err.status_code(), error_code::INVALID_PARAMETER);
    }

    #[test]
    fn test_unterminated_quote_is_invalid() {
        for line in ["echo 'unterminated", "sh -c \"echo hi"] {
            let err = program_and_args(&exec(line, &[])).unwrap_err();
            assert!(matches!(err, GuestCtlError::Config(_)), "{line}: {err:?}");
            assert_eq!(err.status_code(), error_code::INVALID_PARAMETER);
        }
    }

    #[tokio::test]
    async fn test_missing_program_reports_errno() {
        let err = launch(&exec("/nonexistent/guestctl-test-binary", &[]))
            .err()
            .unwrap();
        assert_eq!(err.status_code(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let mut cmd = exec("/bin/true", &[]);
        cmd.user = "guestctl-no-such-user".into();
        let err = launch(&cmd).err().unwrap();
        assert_eq!(err.status_code(), error_code::NOT_FOUND);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_overlay() {
        let mut cmd = exec("sh", &["-c", "printf %s \"$GUESTCTL_TEST_VAR\""]);
        cmd.env = vec!["GUESTCTL_TEST_VAR=a=b".into()];
        let Launched::Child(child) = launch(&cmd).unwrap() else {
            panic!("sh is not a built-in");
        };
        let out = child.wait_with_output().await.unwrap();
        assert_eq!(out.stdout, b"a=b");
    }

    #[tokio::test]
    async fn test_builtin_tool_is_recognised() {
        let mut launched = launch(&exec("vbox_cat", &[])).unwrap();
        assert!(matches!(launched, Launched::Tool(_)));
        assert!(launched.id().unwrap() >= 0x8000_0000);

        // Dropping stdin ends cat.
        drop(launched.take_io());
        assert_eq!(launched.wait().await.unwrap(), (ProcessStatus::ExitedNormally, 0));
    }

    #[test]
    fn test_builtin_tool_refuses_other_user() {
        let mut cmd = exec("vbox_mkdir", &["/tmp/x"]);
        cmd.user = "nobody".into();
        let err = launch(&cmd).err().unwrap();
        assert_eq!(err.status_code(), error_code::NOT_SUPPORTED);
    }
}
