//! Bulk selection and teardown of sandboxes by image.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{LifecycleError, ReapFailure};
use crate::sandbox::runtime::{ContainerRuntime, ContainerSummary, Removal, RuntimeError};

/// Container-ID substrings to keep out of a selection.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet(BTreeSet<String>);

impl ExclusionSet {
    /// Empty entries are dropped; they would otherwise match every ID.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            entries
                .into_iter()
                .map(|s| s.as_ref().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn excludes(&self, container_id: &str) -> bool {
        self.0.iter().any(|entry| container_id.contains(entry.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Containers of any state created from exactly `image`, minus exclusions,
/// in runtime listing order.
pub fn select(
    runtime: &dyn ContainerRuntime,
    image: &str,
    exclusions: &ExclusionSet,
) -> Result<Vec<ContainerSummary>, LifecycleError> {
    let all = runtime.list_by_ancestor(image).map_err(|e| match e {
        RuntimeError::Unreachable { runtime, cause } => {
            LifecycleError::RuntimeUnreachable { runtime, cause }
        }
        other => LifecycleError::precondition(format!("image '{}'", image), other.to_string()),
    })?;
    let total = all.len();
    let selected: Vec<_> = all
        .into_iter()
        .filter(|c| !exclusions.excludes(&c.id))
        .collect();
    info!(
        image,
        total,
        selected = selected.len(),
        "fleet:selected"
    );
    Ok(selected)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapSummary {
    pub stopped: usize,
    pub removed: usize,
    pub already_absent: usize,
    pub failed: Vec<ReapFailure>,
    /// The operator declined; nothing was touched.
    pub aborted: bool,
}

impl ReapSummary {
    pub fn total(&self) -> usize {
        self.removed + self.already_absent + self.failed.len()
    }

    /// Err if any candidate could not be removed.
    pub fn into_result(self) -> Result<Self, LifecycleError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(LifecycleError::PartialReap {
                total: self.total(),
                failures: self.failed,
            })
        }
    }
}

pub(crate) enum Outcome {
    /// `stopped` is false when the container was not live or the stop failed.
    Removed { stopped: bool },
    AlreadyAbsent,
}

/// Stop then remove each candidate. Per-candidate failures are collected;
/// only an unreachable runtime aborts the batch.
///
/// `confirm` sees the full candidate list before anything is touched.
pub fn reap(
    runtime: &dyn ContainerRuntime,
    candidates: &[ContainerSummary],
    stop_timeout: Duration,
    confirm: impl FnOnce(&[ContainerSummary]) -> Result<bool>,
) -> Result<ReapSummary, LifecycleError> {
    let mut summary = ReapSummary::default();
    if candidates.is_empty() {
        return Ok(summary);
    }

    runtime.ping().map_err(unreachable)?;

    let confirmed = confirm(candidates).map_err(|e| {
        LifecycleError::precondition("reap confirmation", format!("{:#}", e))
    })?;
    if !confirmed {
        info!(candidates = candidates.len(), "fleet:reap declined");
        summary.aborted = true;
        return Ok(summary);
    }

    for candidate in candidates {
        match reap_one(runtime, candidate, stop_timeout) {
            Ok(Outcome::Removed { stopped }) => {
                if stopped {
                    summary.stopped += 1;
                }
                summary.removed += 1;
            }
            Ok(Outcome::AlreadyAbsent) => {
                info!(container = %candidate.id, "fleet:already absent");
                summary.already_absent += 1;
            }
            Err(RuntimeError::Unreachable { runtime, cause }) => {
                return Err(LifecycleError::RuntimeUnreachable { runtime, cause });
            }
            Err(e) => {
                warn!(container = %candidate.id, name = %candidate.name, error = %e, "fleet:reap failed");
                summary.failed.push(ReapFailure {
                    container: candidate.id.clone(),
                    cause: e.to_string(),
                });
            }
        }
    }

    info!(
        stopped = summary.stopped,
        removed = summary.removed,
        already_absent = summary.already_absent,
        failed = summary.failed.len(),
        "fleet:reap finished"
    );
    Ok(summary)
}

/// Graceful stop, then forced removal. A failed stop still falls through to `rm -f`.
pub(crate) fn reap_one(
    runtime: &dyn ContainerRuntime,
    candidate: &ContainerSummary,
    stop_timeout: Duration,
) -> Result<Outcome, RuntimeError> {
    let stopped = match runtime.stop(&candidate.id, stop_timeout) {
        Ok(Removal::Done) => candidate.state.is_live(),
        Ok(Removal::AlreadyAbsent) => return Ok(Outcome::AlreadyAbsent),
        Err(e @ RuntimeError::Unreachable { .. }) => return Err(e),
        Err(e) => {
            warn!(container = %candidate.id, error = %e, "fleet:stop failed, forcing removal");
            false
        }
    };
    match runtime.remove(&candidate.id)? {
        Removal::Done => Ok(Outcome::Removed { stopped }),
        Removal::AlreadyAbsent => Ok(Outcome::AlreadyAbsent),
    }
}

/// Forced teardown of a single sandbox by name. `stop_timeout` picks the
/// grace period once the container, and thus its image, is known.
pub fn remove_by_name(
    runtime: &dyn ContainerRuntime,
    name: &str,
    stop_timeout: impl FnOnce(&ContainerSummary) -> Duration,
) -> Result<Removal, LifecycleError> {
    let Some(container) = runtime.find_by_name(name).map_err(unreachable_or(name))? else {
        return Ok(Removal::AlreadyAbsent);
    };
    match reap_one(runtime, &container, stop_timeout(&container)) {
        Ok(Outcome::Removed { .. }) => {
            info!(container = name, id = %container.id, "fleet:removed");
            Ok(Removal::Done)
        }
        Ok(Outcome::AlreadyAbsent) => Ok(Removal::AlreadyAbsent),
        Err(e) => Err(unreachable_or(name)(e)),
    }
}

fn unreachable(e: RuntimeError) -> LifecycleError {
    match e {
        RuntimeError::Unreachable { runtime, cause } => {
            LifecycleError::RuntimeUnreachable { runtime, cause }
        }
        other => LifecycleError::RuntimeUnreachable {
            runtime: "container runtime".to_string(),
            cause: other.to_string(),
        },
    }
}

fn unreachable_or(name: &str) -> impl Fn(RuntimeError) -> LifecycleError + '_ {
    move |e| match e {
        RuntimeError::Unreachable { runtime, cause } => {
            LifecycleError::RuntimeUnreachable { runtime, cause }
        }
        other => LifecycleError::PartialReap {
            total: 1,
            failures: vec![ReapFailure {
                container: name.to_string(),
                cause: other.to_string(),
            }],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::ContainerState;
    use crate::sandbox::runtime::fake::FakeRuntime;
    use anyhow::anyhow;

    fn ids(rows: &[ContainerSummary]) -> Vec<&str> {
        rows.iter().map(|c| c.id.as_str()).collect()
    }

    fn yes(_: &[ContainerSummary]) -> Result<bool> {
        Ok(true)
    }

    #[test]
    fn test_select_exact_image_minus_exclusions() {
        let rt = FakeRuntime::with_containers(&[
            ("c1", "X:latest", "a"),
            ("c2", "X:latest", "b"),
            ("c3", "Y:latest", "c"),
        ]);
        let selected = select(&rt, "X:latest", &ExclusionSet::new(["c1"])).unwrap();
        assert_eq!(ids(&selected), vec!["c2"]);
    }

    #[test]
    fn test_select_never_matches_prefix_image() {
        let rt = FakeRuntime::with_containers(&[
            ("aaa", "foo:latest", "a"),
            ("bbb", "foo-bar:latest", "b"),
        ]);
        let selected = select(&rt, "foo", &ExclusionSet::default()).unwrap();
        assert_eq!(ids(&selected), vec!["aaa"]);
    }

    #[test]
    fn test_exclusion_is_substring_and_ignores_empty() {
        let set = ExclusionSet::new(["", "  ", "3f9a"]);
        assert!(set.excludes("ab3f9a00"));
        assert!(!set.excludes("ab3f9b00"));
        assert!(!ExclusionSet::new([""]).excludes("anything"));
        assert!(ExclusionSet::new([""]).is_empty());
    }

    #[test]
    fn test_selection_never_contains_excluded_id() {
        let rt = FakeRuntime::with_containers(&[
            ("deadbeef01", "X", "a"),
            ("cafe0002", "X", "b"),
            ("beef0003", "X", "c"),
            ("0004", "X", "d"),
        ]);
        let exclusions = ExclusionSet::new(["beef", "00"]);
        let selected = select(&rt, "X", &exclusions).unwrap();
        assert!(selected.iter().all(|c| !exclusions.excludes(&c.id)));
        assert!(selected.is_empty());
    }

    #[test]
    fn test_select_unreachable_runtime() {
        let rt = FakeRuntime::new();
        *rt.unreachable.lock().unwrap() = true;
        assert!(matches!(
            select(&rt, "X", &ExclusionSet::default()),
            Err(LifecycleError::RuntimeUnreachable { .. })
        ));
    }

    #[test]
    fn test_reap_reports_already_absent() {
        let rt = FakeRuntime::with_containers(&[("c1", "X", "a"), ("c2", "X", "b")]);
        let candidates = select(&rt, "X", &ExclusionSet::default()).unwrap();
        // Someone else removes c1 between selection and reaping.
        rt.containers.lock().unwrap().retain(|c| c.summary.id != "c1");

        let summary = reap(&rt, &candidates, Duration::from_secs(1), yes).unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.stopped, 1);
        assert_eq!(summary.already_absent, 1);
        assert!(summary.failed.is_empty());
        assert!(rt.containers.lock().unwrap().is_empty());
        assert!(summary.into_result().is_ok());
    }

    #[test]
    fn test_reap_continues_past_failure() {
        let rt = FakeRuntime::with_containers(&[
            ("c1", "X", "a"),
            ("c2", "X", "b"),
            ("c3", "X", "c"),
        ]);
        rt.stuck.lock().unwrap().push("c2".to_string());
        let candidates = select(&rt, "X", &ExclusionSet::default()).unwrap();

        let summary = reap(&rt, &candidates, Duration::from_secs(1), yes).unwrap();
        assert_eq!(summary.removed, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].container, "c2");

        match summary.into_result() {
            Err(LifecycleError::PartialReap { total, failures }) => {
                assert_eq!(total, 3);
                assert_eq!(failures.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reap_declined_touches_nothing() {
        let rt = FakeRuntime::with_containers(&[("c1", "X", "a")]);
        let candidates = select(&rt, "X", &ExclusionSet::default()).unwrap();
        let summary = reap(&rt, &candidates, Duration::from_secs(1), |_| Ok(false)).unwrap();
        assert!(summary.aborted);
        assert_eq!(rt.containers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_reap_confirmation_error_touches_nothing() {
        let rt = FakeRuntime::with_containers(&[("c1", "X", "a")]);
        let candidates = select(&rt, "X", &ExclusionSet::default()).unwrap();
        let result = reap(&rt, &candidates, Duration::from_secs(1), |_| {
            Err(anyhow!("stdin closed"))
        });
        assert!(result.is_err());
        assert_eq!(rt.containers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_reap_unreachable_fails_whole_batch() {
        let rt = FakeRuntime::with_containers(&[("c1", "X", "a")]);
        let candidates = select(&rt, "X", &ExclusionSet::default()).unwrap();
        *rt.unreachable.lock().unwrap() = true;
        assert!(matches!(
            reap(&rt, &candidates, Duration::from_secs(1), yes),
            Err(LifecycleError::RuntimeUnreachable { .. })
        ));
    }

    #[test]
    fn test_remove_by_name() {
        let rt = FakeRuntime::with_containers(&[("c1", "X", "eval-1")]);
        assert_eq!(
            remove_by_name(&rt, "eval-1", |c| {
                assert_eq!(c.image, "X");
                Duration::from_secs(7)
            })
            .unwrap(),
            Removal::Done
        );
        assert_eq!(
            rt.stops.lock().unwrap().as_slice(),
            &[("c1".to_string(), Duration::from_secs(7))]
        );
        assert_eq!(
            remove_by_name(&rt, "eval-1", |_| Duration::from_secs(1)).unwrap(),
            Removal::AlreadyAbsent
        );
    }

    #[test]
    fn test_reap_counts_only_live_containers_as_stopped() {
        let rt = FakeRuntime::with_containers(&[("c1", "X", "a"), ("c2", "X", "b")]);
        rt.set_state("c2", ContainerState::Exited);
        let candidates = select(&rt, "X", &ExclusionSet::default()).unwrap();

        let summary = reap(&rt, &candidates, Duration::from_secs(1), yes).unwrap();
        assert_eq!(summary.removed, 2);
        assert_eq!(summary.stopped, 1);
    }

    #[test]
    fn test_reap_forces_removal_when_stop_fails() {
        let rt = FakeRuntime::with_containers(&[("c1", "X", "a")]);
        rt.stop_fails.lock().unwrap().push("c1".to_string());
        let candidates = select(&rt, "X", &ExclusionSet::default()).unwrap();

        let summary = reap(&rt, &candidates, Duration::from_secs(1), yes).unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.stopped, 0);
        assert!(summary.failed.is_empty());
        assert!(rt.containers.lock().unwrap().is_empty());
    }
}
