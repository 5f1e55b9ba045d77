//! Tracking of CronJob pods until enough of them succeeded.

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;

/// Time granted to the CronJob on top of the runs themselves.
const COMPLETION_GRACE: Duration = Duration::from_secs(15 * 60);

/// Upper bound of any completion check.
pub const MAX_COMPLETION_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

/// How long to wait for `completes` runs of `run_timeout` each.
pub fn completion_timeout(run_timeout: Duration, completes: u32) -> Duration {
    run_timeout
        .checked_mul(completes)
        .and_then(|runs| runs.checked_add(COMPLETION_GRACE))
        .map_or(MAX_COMPLETION_TIMEOUT, |timeout| {
            timeout.min(MAX_COMPLETION_TIMEOUT)
        })
}

/// Whether `pod` was created for the job or CronJob `job_name`.
///
/// Job pods carry a `job-name` label. Pods of a CronJob are named after the
/// job, which is named after the CronJob.
pub fn owned_by(pod: &Pod, job_name: &str) -> bool {
    let label = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("job-name"));
    if label.is_some_and(|label| label == job_name) {
        return true;
    }
    pod.metadata
        .name
        .as_deref()
        .is_some_and(|name| name.starts_with(job_name))
}

/// Phase reported in a pod's status, or `Unknown`.
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("Unknown")
}

/// State of a scheduled execution of the CronJob.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionState {
    /// No pods of the CronJob exist yet.
    Scheduled,
    Running,
    Succeeded,
    /// The check expired after pods of the CronJob failed.
    Failed,
    TimedOut,
}

/// Counts of one poll.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Progress {
    pub owned: usize,
    pub succeeded: usize,
    /// Pods that failed since the previous poll.
    pub newly_failed: Vec<String>,
}

/// Follows the pods of one CronJob across polls.
#[derive(Debug)]
pub struct CompletionTracker {
    job_name: String,
    target: usize,
    succeeded: usize,
    failed: BTreeSet<String>,
    state: ExecutionState,
}

impl CompletionTracker {
    pub fn new(job_name: &str, target: usize) -> Self {
        Self {
            job_name: job_name.to_owned(),
            target,
            succeeded: 0,
            failed: BTreeSet::new(),
            state: ExecutionState::Scheduled,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Names of all failed pods seen so far.
    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(String::as_str)
    }

    /// Updates the state from the namespace's current pods.
    pub fn observe(&mut self, pods: &[Pod]) -> Progress {
        let mut progress = Progress::default();
        for pod in pods.iter().filter(|pod| owned_by(pod, &self.job_name)) {
            progress.owned += 1;
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            match pod_phase(pod) {
                "Succeeded" => progress.succeeded += 1,
                "Failed" if self.failed.insert(name.to_owned()) => {
                    progress.newly_failed.push(name.to_owned());
                }
                _ => {}
            }
        }

        self.succeeded = progress.succeeded;
        self.state = if progress.succeeded >= self.target {
            ExecutionState::Succeeded
        } else if progress.owned == 0 {
            ExecutionState::Scheduled
        } else {
            ExecutionState::Running
        };
        progress
    }

    /// Ends tracking without success.
    pub fn expire(&mut self) -> ExecutionState {
        if self.state != ExecutionState::Succeeded {
            self.state = if self.failed.is_empty() {
                ExecutionState::TimedOut
            } else {
                ExecutionState::Failed
            };
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod(name: &str, job: Option<&str>, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: job.map(|job| BTreeMap::from([("job-name".to_owned(), job.to_owned())])),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn timeout_is_capped() {
        let minute = Duration::from_secs(60);
        assert_eq!(completion_timeout(minute, 10), Duration::from_secs(25 * 60));
        assert_eq!(completion_timeout(minute, 0), COMPLETION_GRACE);
        assert_eq!(
            completion_timeout(Duration::from_secs(3600), 10),
            MAX_COMPLETION_TIMEOUT
        );
        assert_eq!(
            completion_timeout(Duration::MAX, 2),
            MAX_COMPLETION_TIMEOUT
        );
    }

    #[test]
    fn ownership() {
        assert!(owned_by(&pod("x", Some("cron"), "Running"), "cron"));
        assert!(owned_by(&pod("cron-1593205200-2t2tv", None, "Running"), "cron"));
        assert!(!owned_by(&pod("other", Some("job"), "Running"), "cron"));
        assert!(!owned_by(&Pod::default(), "cron"));
    }

    #[test]
    fn states_follow_pods() {
        let mut tracker = CompletionTracker::new("cron", 2);
        assert_eq!(tracker.state(), ExecutionState::Scheduled);

        tracker.observe(&[pod("unrelated", None, "Succeeded")]);
        assert_eq!(tracker.state(), ExecutionState::Scheduled);

        let progress = tracker.observe(&[
            pod("cron-1-a", None, "Succeeded"),
            pod("cron-1-b", None, "Running"),
        ]);
        assert_eq!(progress.owned, 2);
        assert_eq!(tracker.state(), ExecutionState::Running);
        assert_eq!(tracker.succeeded(), 1);

        tracker.observe(&[
            pod("cron-1-a", None, "Succeeded"),
            pod("cron-1-b", None, "Succeeded"),
        ]);
        assert_eq!(tracker.state(), ExecutionState::Succeeded);
        assert_eq!(tracker.expire(), ExecutionState::Succeeded);
    }

    #[test]
    fn failures_reported_once() {
        let mut tracker = CompletionTracker::new("cron", 1);
        let pods = [pod("cron-1-a", None, "Failed")];

        assert_eq!(tracker.observe(&pods).newly_failed, ["cron-1-a"]);
        assert!(tracker.observe(&pods).newly_failed.is_empty());
        assert_eq!(tracker.failed().collect::<Vec<_>>(), ["cron-1-a"]);
        assert_eq!(tracker.expire(), ExecutionState::Failed);
    }

    #[test]
    fn expires_without_failures() {
        let mut tracker = CompletionTracker::new("cron", 1);
        tracker.observe(&[pod("cron-1-a", None, "Running")]);
        assert_eq!(tracker.expire(), ExecutionState::TimedOut);
    }
}
