//! Commands built into the agent.
//!
//! `vbox_cat` and `vbox_mkdir` run as tasks inside the agent. Their standard
//! streams are in-memory pipes, so the session plumbing treats them like any
//! other process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use clap::Parser;
use guestctl_shared::protocol::ProcessStatus;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

pub(crate) const CAT: &str = "vbox_cat";
pub(crate) const MKDIR: &str = "vbox_mkdir";

/// Built-in tools get pids above every pid the kernel hands out.
const PID_BASE: u32 = 0x8000_0000;
const PIPE_CAPACITY: usize = 64 * 1024;

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_SYNTAX: i32 = 2;

static NEXT_PID: AtomicU32 = AtomicU32::new(PID_BASE);

fn allocate_pid() -> u32 {
    NEXT_PID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
            Some(if p == u32::MAX { PID_BASE } else { p + 1 })
        })
        .unwrap_or(PID_BASE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tool {
    Cat,
    Mkdir,
}

impl Tool {
    pub(crate) fn from_program(program: &str) -> Option<Self> {
        match program {
            CAT => Some(Self::Cat),
            MKDIR => Some(Self::Mkdir),
            _ => None,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Cat => CAT,
            Self::Mkdir => MKDIR,
        }
    }
}

/// Concatenate files (or stdin) to stdout or a file.
#[derive(Parser, Debug)]
#[clap(
    name = "vbox_cat",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct CatArgs {
    /// Write to this file instead of stdout.
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Accepted and ignored; output is never buffered.
    #[clap(short = 'u', hide = true)]
    _unbuffered: bool,
    /// Inputs in order; none or `-` means stdin.
    files: Vec<PathBuf>,
}

/// Create directories.
#[derive(Parser, Debug)]
#[clap(
    name = "vbox_mkdir",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct MkdirArgs {
    /// Create missing parents; an existing directory is not an error.
    #[clap(short, long)]
    parents: bool,
    /// Octal permission bits for the new directories.
    #[clap(short, long, value_parser = parse_mode)]
    mode: Option<u32>,
    /// Print one line per created directory.
    #[clap(short, long)]
    verbose: bool,
    #[clap(required = true)]
    dirs: Vec<PathBuf>,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    match u32::from_str_radix(s, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("invalid mode '{s}'")),
    }
}

struct ToolIo {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

/// A built-in tool running as a task.
pub(crate) struct ToolProcess {
    pid: u32,
    pub(crate) stdin: Option<DuplexStream>,
    pub(crate) stdout: Option<DuplexStream>,
    pub(crate) stderr: Option<DuplexStream>,
    task: JoinHandle<i32>,
}

impl ToolProcess {
    pub(crate) fn start(tool: Tool, args: Vec<String>) -> Self {
        let (stdin, tool_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (tool_stdout, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (tool_stderr, stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let io = ToolIo {
            stdin: tool_stdin,
            stdout: tool_stdout,
            stderr: tool_stderr,
        };
        let pid = allocate_pid();
        tracing::debug!(pid, tool = tool.name(), ?args, "Starting built-in tool");

        let task = tokio::spawn(async move {
            match tool {
                Tool::Cat => cat(args, io).await,
                Tool::Mkdir => mkdir(args, io).await,
            }
        });

        Self {
            pid,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            task,
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the tool to return its exit code.
    pub(crate) async fn wait(&mut self) -> (ProcessStatus, u32) {
        match (&mut self.task).await {
            Ok(code) => (ProcessStatus::ExitedNormally, code as u32),
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Built-in tool did not finish");
                (ProcessStatus::ExitedAbnormally, 0)
            }
        }
    }

    /// Abort the task; false when it did not stop within `grace`.
    pub(crate) async fn kill(&mut self, grace: Duration) -> bool {
        self.task.abort();
        tokio::time::timeout(grace, &mut self.task).await.is_ok()
    }
}

async fn complain(stderr: &mut DuplexStream, tool: &str, message: &str) {
    let line = format!("{tool}: {}\n", message.trim_end());
    let _ = stderr.write_all(line.as_bytes()).await;
}

async fn cat(args: Vec<String>, mut io: ToolIo) -> i32 {
    let args = match CatArgs::try_parse_from(&args) {
        Ok(args) => args,
        Err(e) => {
            complain(&mut io.stderr, CAT, &e.to_string()).await;
            return EXIT_SYNTAX;
        }
    };

    let mut file;
    let out: &mut (dyn AsyncWrite + Send + Unpin) = match &args.output {
        Some(path) => match tokio::fs::File::create(path).await {
            Ok(created) => {
                file = created;
                &mut file
            }
            Err(e) => {
                let message = format!("{}: {e}", path.display());
                complain(&mut io.stderr, CAT, &message).await;
                return EXIT_FAILURE;
            }
        },
        None => &mut io.stdout,
    };

    let sources = if args.files.is_empty() {
        vec![PathBuf::from("-")]
    } else {
        args.files
    };

    let mut code = EXIT_SUCCESS;
    for source in &sources {
        let copied = if source.as_os_str() == "-" {
            tokio::io::copy(&mut io.stdin, &mut *out).await
        } else {
            match tokio::fs::File::open(source).await {
                Ok(mut input) => tokio::io::copy(&mut input, &mut *out).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = copied {
            let message = format!("{}: {e}", source.display());
            complain(&mut io.stderr, CAT, &message).await;
            code = EXIT_FAILURE;
        }
    }

    if let Err(e) = out.flush().await {
        complain(&mut io.stderr, CAT, &e.to_string()).await;
        code = EXIT_FAILURE;
    }
    code
}

async fn mkdir(args: Vec<String>, mut io: ToolIo) -> i32 {
    let args = match MkdirArgs::try_parse_from(&args) {
        Ok(args) => args,
        Err(e) => {
            complain(&mut io.stderr, MKDIR, &e.to_string()).await;
            return EXIT_SYNTAX;
        }
    };

    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(args.parents);
    #[cfg(unix)]
    if let Some(mode) = args.mode {
        builder.mode(mode);
    }

    let mut code = EXIT_SUCCESS;
    for dir in &args.dirs {
        match builder.create(dir).await {
            Ok(()) => {
                if args.verbose {
                    let line = format!("{MKDIR}: created directory '{}'\n", dir.display());
                    let _ = io.stdout.write_all(line.as_bytes()).await;
                }
            }
            Err(e) => {
                let message = format!("{}: {e}", dir.display());
                complain(&mut io.stderr, MKDIR, &message).await;
                code = EXIT_FAILURE;
            }
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn run(tool: Tool, args: &[&str], stdin: &[u8]) -> (i32, Vec<u8>, Vec<u8>) {
        let mut process = ToolProcess::start(tool, args.iter().map(|s| s.to_string()).collect());
        let mut input = process.stdin.take().unwrap();
        input.write_all(stdin).await.unwrap();
        drop(input);

        let mut stdout = process.stdout.take().unwrap();
        let mut stderr = process.stderr.take().unwrap();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let (read_out, read_err) =
            tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        read_out.unwrap();
        read_err.unwrap();

        match process.wait().await {
            (ProcessStatus::ExitedNormally, code) => (code as i32, out, err),
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn test_from_program() {
        assert_eq!(Tool::from_program("vbox_cat"), Some(Tool::Cat));
        assert_eq!(Tool::from_program("vbox_mkdir"), Some(Tool::Mkdir));
        assert_eq!(Tool::from_program("/bin/cat"), None);
    }

    #[test]
    fn test_pids_do_not_overlap_kernel_pids() {
        let a = allocate_pid();
        let b = allocate_pid();
        assert!(a >= PID_BASE && b >= PID_BASE);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_cat_copies_stdin() {
        let (code, out, err) = run(Tool::Cat, &[], b"hello\n").await;
        assert_eq!(code, 0);
        assert_eq!(out, b"hello\n");
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn test_cat_files_and_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let joined = dir.path().join("joined");
        std::fs::write(&a, b"one ").unwrap();
        std::fs::write(&b, b"two").unwrap();

        let (code, out, _) = run(
            Tool::Cat,
            &[
                "-o",
                joined.to_str().unwrap(),
                a.to_str().unwrap(),
                "-",
                b.to_str().unwrap(),
            ],
            b"and ",
        )
        .await;
        assert_eq!(code, 0);
        assert!(out.is_empty());
        assert_eq!(std::fs::read(&joined).unwrap(), b"one and two");
    }

    #[tokio::test]
    async fn test_cat_missing_file_fails() {
        let (code, _, err) = run(Tool::Cat, &["/nonexistent/guestctl-cat"], b"").await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(String::from_utf8_lossy(&err).starts_with("vbox_cat: /nonexistent/guestctl-cat"));
    }

    #[tokio::test]
    async fn test_mkdir_parents_and_verbose() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        let (code, out, _) = run(
            Tool::Mkdir,
            &["-p", "-v", nested.to_str().unwrap()],
            b"",
        )
        .await;
        assert_eq!(code, 0);
        assert!(nested.is_dir());
        assert!(String::from_utf8_lossy(&out).contains("created directory"));

        // Existing directory is fine with -p, an error without it.
        assert_eq!(run(Tool::Mkdir, &["-p", nested.to_str().unwrap()], b"").await.0, 0);
        assert_eq!(
            run(Tool::Mkdir, &[nested.to_str().unwrap()], b"").await.0,
            EXIT_FAILURE
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mkdir_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("private");
        let (code, _, _) = run(Tool::Mkdir, &["-m", "700", target.to_str().unwrap()], b"").await;
        assert_eq!(code, 0);
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_usage_errors() {
        assert_eq!(run(Tool::Mkdir, &[], b"").await.0, EXIT_SYNTAX);
        assert_eq!(run(Tool::Mkdir, &["-m", "999", "x"], b"").await.0, EXIT_SYNTAX);
        let (code, _, err) = run(Tool::Cat, &["--bogus"], b"").await;
        assert_eq!(code, EXIT_SYNTAX);
        assert!(err.starts_with(b"vbox_cat: "));
    }

    #[tokio::test]
    async fn test_kill_aborts_blocked_tool() {
        let mut process = ToolProcess::start(Tool::Cat, Vec::new());
        // stdin stays open, so cat blocks.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(process.kill(Duration::from_secs(5)).await);
    }
}
