use std::fmt;

use thiserror::Error;
use transition_system::PackageRequest;

/// Terminal status of one requested package.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Marked and committed.
    Removed,
    /// Unknown to the package cache, or staged but never committed.
    Failed,
    /// Never reached: the run ended before this package was marked.
    Skipped,
}

/// Why a run ended without doing everything it was asked to.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("Permission denied by policy ({0})")]
    PermissionDenied(String),
    #[error("Could not obtain the package lock: {0}")]
    LockUnavailable(String),
    #[error("Could not open the package cache: {0}")]
    OpenCache(String),
    #[error("Could not mark {package} for removal: {message}")]
    Mark { package: String, message: String },
    #[error("Could not remove packages: {0}")]
    Commit(String),
    #[error("Removal was cancelled")]
    Cancelled,
    #[error("Removal stopped unexpectedly: {0}")]
    Aborted(String),
}

/// Result of one coordinator run, in request order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub outcomes: Vec<(PackageRequest, RemovalOutcome)>,
    pub error: Option<RunError>,
}

impl RunSummary {
    pub fn outcome(&self, name: &str) -> Option<RemovalOutcome> {
        self.outcomes
            .iter()
            .find(|(request, _)| request.name() == name)
            .map(|(_, outcome)| *outcome)
    }

    pub fn removed(&self) -> impl Iterator<Item = &PackageRequest> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == RemovalOutcome::Removed)
            .map(|(request, _)| request)
    }

    /// Builds the final report. Flatpak installation happens elsewhere, so
    /// the caller supplies what it installed.
    pub fn report(&self, installed_flatpaks: &[String]) -> Report {
        let mut errors: Vec<String> = self
            .outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == RemovalOutcome::Failed)
            .map(|(request, _)| format!("{request} was not removed"))
            .collect();
        if let Some(error) = &self.error {
            errors.push(error.to_string());
        }

        Report {
            installed: installed_flatpaks.to_vec(),
            removed: self.removed().map(ToString::to_string).collect(),
            errors,
        }
    }
}

/// The three-section summary shown at the end of a run. Empty sections read
/// "None" so an empty run can be told apart from a suppressed one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub installed: Vec<String>,
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn section(f: &mut fmt::Formatter<'_>, title: &str, items: &[String]) -> fmt::Result {
            writeln!(f, "{title}:")?;
            if items.is_empty() {
                return writeln!(f, "  None");
            }
            for item in items {
                writeln!(f, "  {item}")?;
            }
            Ok(())
        }

        section(f, "Flatpaks installed", &self.installed)?;
        section(f, "Debian packages removed", &self.removed)?;
        section(f, "Errors", &self.errors)
    }
}
