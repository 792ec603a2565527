use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use console::style;
use serde::{Serialize, Serializer};

use crate::cache::CacheCounts;
use crate::error::{BuildError, KamadoError};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// A task that did not complete, or a node that could not be built.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub targets: Vec<String>,
    #[serde(serialize_with = "as_display")]
    pub error: BuildError,
}

/// A node that was not attempted because a dependency failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub node: String,
    pub cause: String,
}

/// Outcome of one build round.
#[derive(Debug, Default, Serialize)]
pub struct BuildReport {
    /// Targets whose action ran.
    pub executed: Vec<String>,
    /// Targets restored from the build cache.
    pub retrieved: Vec<String>,
    /// Derived nodes found up to date.
    pub up_to_date: usize,
    pub failures: Vec<Failure>,
    pub skipped: Vec<Skipped>,
    /// Every distinct dependency cycle, members in the order they were found.
    /// Each one is also listed in `failures`.
    pub cycles: Vec<Vec<String>>,
    /// Task timings keyed by the name of the first target.
    #[serde(skip)]
    pub execution_times: HashMap<String, TaskExecution>,
    pub cache: Option<CacheCounts>,
    /// No new tasks were started after the first failure.
    pub stopped_early: bool,
}

fn as_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.cycles.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} executed, {} retrieved, {} up to date, {} failed, {} skipped",
            self.executed.len(),
            self.retrieved.len(),
            self.up_to_date,
            self.failures.len(),
            self.skipped.len(),
        )
    }

    pub fn into_result(self) -> Result<Self, KamadoError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(KamadoError::BuildFailed(self.to_string()))
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Prints the report to stderr with colors.
    pub fn print(&self) {
        for failure in &self.failures {
            eprintln!(
                "{} {}: {}",
                style("failed").red().bold(),
                failure.targets.join(", "),
                failure.error
            );
        }
        for skipped in &self.skipped {
            eprintln!(
                "{} {} (because '{}' failed)",
                style("skipped").yellow(),
                skipped.node,
                skipped.cause
            );
        }

        let status = if self.is_success() {
            style("Build succeeded:").green()
        } else {
            style("Build failed:").red()
        };
        eprintln!("{status} {}", self.summary());
    }
}

impl Display for BuildReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.summary())?;
        for failure in &self.failures {
            writeln!(f, "  {}: {}", failure.targets.join(", "), failure.error)?;
        }
        for skipped in &self.skipped {
            writeln!(f, "  {} skipped, '{}' failed", skipped.node, skipped.cause)?;
        }
        if self.stopped_early {
            writeln!(f, "  stopped after the first failure")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_summary_and_result() {
        let mut report = BuildReport {
            executed: vec!["a".into(), "b".into()],
            up_to_date: 3,
            ..Default::default()
        };
        assert!(report.is_success());
        assert_eq!(
            report.summary(),
            "2 executed, 0 retrieved, 3 up to date, 0 failed, 0 skipped"
        );

        report.failures.push(Failure {
            targets: vec!["c".into()],
            error: BuildError::Action { status: 2 },
        });
        report.skipped.push(Skipped {
            node: "d".into(),
            cause: "c".into(),
        });

        let err = report.into_result().unwrap_err();
        assert_matches!(
            &err,
            KamadoError::BuildFailed(text) if text.contains("c: action exited with status 2")
        );
    }

    #[test]
    fn test_json() {
        let report = BuildReport {
            failures: vec![Failure {
                targets: vec!["x".into()],
                error: BuildError::MissingSource("x".into()),
            }],
            cycles: vec![vec!["a".into(), "b".into()]],
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(
            json["failures"][0]["error"],
            "source 'x' does not exist and no builder is declared for it"
        );
        assert_eq!(json["cycles"][0][1], "b");
    }
}
