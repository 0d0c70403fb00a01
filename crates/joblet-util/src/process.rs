//! Small process-exit helpers, matching the daemon exit codes specified in §6:
//! `0` normal shutdown, `1` startup failure, `2` fatal invariant violation.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    StartupFailure = 1,
    FatalInvariantViolation = 2,
}

impl ExitCode {
    pub fn raw(self) -> i32 {
        self as i32
    }
}

impl std::process::Termination for ExitCode {
    fn report(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self.raw() as u8)
    }
}
