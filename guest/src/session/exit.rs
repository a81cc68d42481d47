//! Mapping of child exits to protocol statuses.

use std::process::ExitStatus;

use guestctl_shared::protocol::ProcessStatus;

/// Status and `flags` word reported for a reaped child.
pub(crate) fn classify(status: ExitStatus) -> (ProcessStatus, u32) {
    if let Some(code) = status.code() {
        return (ProcessStatus::ExitedNormally, code as u32);
    }

    #[cfg(unix)]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(&status) {
        return (ProcessStatus::ExitedViaSignal, signal as u32);
    }

    (ProcessStatus::ExitedAbnormally, 0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_exit_code() {
        // wait(2) encoding: exit code in the second byte.
        assert_eq!(
            classify(ExitStatus::from_raw(3 << 8)),
            (ProcessStatus::ExitedNormally, 3)
        );
        assert_eq!(
            classify(ExitStatus::from_raw(0)),
            (ProcessStatus::ExitedNormally, 0)
        );
    }

    #[test]
    fn test_signal() {
        assert_eq!(
            classify(ExitStatus::from_raw(9)),
            (ProcessStatus::ExitedViaSignal, 9)
        );
    }
}
