use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Starting,
    Downloading,
    Extracting,
    Completed,
    Failed,
}

impl InstallPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One throttled progress update from an install.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallProgress {
    pub phase: InstallPhase,
    /// 0..=100
    pub percent: u8,
    pub status: String,
    pub speed_mbps: Option<f64>,
}

impl InstallProgress {
    pub fn new(phase: InstallPhase, percent: u8, status: impl Into<String>) -> Self {
        Self {
            phase,
            percent: percent.min(100),
            status: status.into(),
            speed_mbps: None,
        }
    }

    #[must_use]
    pub fn with_speed(mut self, speed_mbps: f64) -> Self {
        self.speed_mbps = Some(speed_mbps);
        self
    }

    pub fn failed(status: impl Into<String>) -> Self {
        Self::new(InstallPhase::Failed, 0, status)
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: InstallProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(InstallProgress) + Send + Sync,
{
    fn report(&self, progress: InstallProgress) {
        self(progress);
    }
}

/// Sink that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: InstallProgress) {}
}
