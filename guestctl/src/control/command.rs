//! Builder for commands executed in the guest.

use std::time::Duration;

use guestctl_shared::protocol::{ExecCommand, flags};
use guestctl_shared::{GuestCtlError, GuestCtlResult};

/// A command to run inside the guest.
///
/// ```rust
/// use guestctl::GuestCommand;
/// use std::time::Duration;
///
/// let cmd = GuestCommand::new("/bin/ls")
///     .arg("-la")
///     .env("LANG", "C")
///     .timeout(Duration::from_secs(10));
/// ```
#[derive(Clone, Default)]
pub struct GuestCommand {
    pub(crate) command: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Option<Vec<(String, String)>>,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) flags: u32,
}

impl std::fmt::Debug for GuestCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestCommand")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .field("flags", &self.flags)
            .finish()
    }
}

impl GuestCommand {
    /// Program to run. Without arguments, a command line with spaces is
    /// split by the guest.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    /// Run as this guest user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Kill the process if it runs longer than this.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Apply the timeout to process start-up only.
    pub fn wait_for_start_only(mut self) -> Self {
        self.flags |= flags::exec::WAIT_FOR_START_ONLY;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Validate and turn into the wire message (context still unset).
    pub(crate) fn build(&self) -> GuestCtlResult<ExecCommand> {
        let invalid = |what: String| GuestCtlError::Config(format!("invalid command: {what}"));

        if self.command.trim().is_empty() {
            return Err(invalid("empty command".into()));
        }
        if self.command.contains('\0') || self.args.iter().any(|a| a.contains('\0')) {
            return Err(invalid("embedded NUL".into()));
        }
        if self.flags & !flags::exec::KNOWN != 0 {
            return Err(invalid(format!("unknown flags {:#x}", self.flags)));
        }

        let mut env = Vec::new();
        for (key, value) in self.env.iter().flatten() {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(invalid(format!("environment variable '{key}'")));
            }
            env.push(format!("{key}={value}"));
        }

        let timeout_ms = match self.timeout {
            None => 0,
            Some(t) => u32::try_from(t.as_millis()).unwrap_or(u32::MAX).max(1),
        };

        Ok(ExecCommand {
            context: 0,
            command: self.command.clone(),
            flags: self.flags,
            args: self.args.clone(),
            env,
            user: self.user.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            timeout_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build() {
        let cmd = GuestCommand::new("/bin/sh")
            .args(["-c", "exit 3"])
            .env("A", "1")
            .env("B", "x=y")
            .user("nobody")
            .timeout(Duration::from_millis(1500))
            .wait_for_start_only()
            .build()
            .unwrap();
        assert_eq!(cmd.args, vec!["-c", "exit 3"]);
        assert_eq!(cmd.env, vec!["A=1", "B=x=y"]);
        assert_eq!(cmd.user, "nobody");
        assert_eq!(cmd.timeout_ms, 1500);
        assert!(cmd.wait_for_start_only());
    }

    #[test]
    fn test_no_timeout_is_zero() {
        let cmd = GuestCommand::new("/bin/true").build().unwrap();
        assert_eq!(cmd.timeout_ms, 0);
        let cmd = GuestCommand::new("/bin/true")
            .timeout(Duration::from_micros(10))
            .build()
            .unwrap();
        assert_eq!(cmd.timeout_ms, 1);
    }

    #[test]
    fn test_rejects_invalid_commands() {
        assert!(GuestCommand::new("  ").build().is_err());
        assert!(GuestCommand::new("/bin/echo").arg("a\0b").build().is_err());
        assert!(GuestCommand::new("/bin/true").env("", "v").build().is_err());
        assert!(GuestCommand::new("/bin/true").env("A=B", "v").build().is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let cmd = GuestCommand::new("/bin/true").password("hunter2");
        assert!(!format!("{cmd:?}").contains("hunter2"));
    }
}
