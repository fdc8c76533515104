use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use crate::process::{outcome_for_code, worker_command, ApplyExit, ApplyOutcome, ApplyRequest};

/// What came back from the privileged channel. A missing helper is reported
/// as `Unavailable` so callers can distinguish "could not even try" from an
/// apply that ran elevated and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationOutcome {
    Applied(ApplyOutcome),
    Unavailable,
}

pub trait ElevationStrategy {
    fn is_available(&self) -> bool;
    fn elevate(&self, request: &ApplyRequest) -> Result<ApplyOutcome>;
}

/// Re-runs the apply worker through a privileged helper binary. The helper
/// receives the identical archive, target, and log path, so its install log
/// is directly comparable to the unprivileged attempt's.
pub struct HelperElevation {
    helper: PathBuf,
}

impl HelperElevation {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }
}

impl ElevationStrategy for HelperElevation {
    fn is_available(&self) -> bool {
        self.helper.is_file()
    }

    fn elevate(&self, request: &ApplyRequest) -> Result<ApplyOutcome> {
        let status = worker_command(&self.helper, request)
            .status()
            .with_context(|| {
                format!(
                    "failed to launch privileged helper: {}",
                    self.helper.display()
                )
            })?;
        let code = status.code().unwrap_or(ApplyExit::Generic.code());
        Ok(outcome_for_code(code))
    }
}

/// Platforms or configurations without a privileged helper.
pub struct NoElevation;

impl ElevationStrategy for NoElevation {
    fn is_available(&self) -> bool {
        false
    }

    fn elevate(&self, _request: &ApplyRequest) -> Result<ApplyOutcome> {
        Err(anyhow!("no privileged helper is configured"))
    }
}

pub struct ElevationBroker {
    strategy: Box<dyn ElevationStrategy>,
}

impl ElevationBroker {
    pub fn new(strategy: Box<dyn ElevationStrategy>) -> Self {
        Self { strategy }
    }

    pub fn unavailable() -> Self {
        Self::new(Box::new(NoElevation))
    }

    pub fn elevate(&self, request: &ApplyRequest) -> Result<ElevationOutcome> {
        if !self.strategy.is_available() {
            return Ok(ElevationOutcome::Unavailable);
        }
        self.strategy
            .elevate(request)
            .map(ElevationOutcome::Applied)
    }
}
