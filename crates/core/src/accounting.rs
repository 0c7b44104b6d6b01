use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TaskOutcome {
    Succeeded,
    /// Completed, but the archive held no payload.
    Empty,
    Failed { code: String, message: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub display_name: String,
    pub remote_key: String,
    pub decompressed_bytes: u64,
    pub outcome: TaskOutcome,
}

impl TaskResult {
    pub fn succeeded(display_name: String, remote_key: String, decompressed_bytes: u64) -> Self {
        let outcome = if decompressed_bytes > 0 {
            TaskOutcome::Succeeded
        } else {
            TaskOutcome::Empty
        };
        Self {
            display_name,
            remote_key,
            decompressed_bytes,
            outcome,
        }
    }

    pub fn failed(display_name: String, remote_key: String, err: &crate::Error) -> Self {
        let outcome = match err {
            crate::Error::Cancelled => TaskOutcome::Cancelled,
            other => TaskOutcome::Failed {
                code: other.code().to_string(),
                message: other.to_string(),
            },
        };
        Self {
            display_name,
            remote_key,
            decompressed_bytes: 0,
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        self.decompressed_bytes > 0
    }
}

/// Run-wide totals. Order-independent: `record` and `merge` only add.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccumulator {
    pub total_bytes: u64,
    pub completed_count: u32,
    pub succeeded: u32,
    pub empty: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl RunAccumulator {
    pub fn record(&mut self, result: &TaskResult) {
        self.total_bytes = self.total_bytes.saturating_add(result.decompressed_bytes);
        self.completed_count += 1;
        match result.outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Empty => self.empty += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn merge(&mut self, other: &RunAccumulator) {
        self.total_bytes = self.total_bytes.saturating_add(other.total_bytes);
        self.completed_count += other.completed_count;
        self.succeeded += other.succeeded;
        self.empty += other.empty;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

impl<'a> FromIterator<&'a TaskResult> for RunAccumulator {
    fn from_iter<I: IntoIterator<Item = &'a TaskResult>>(iter: I) -> Self {
        let mut acc = RunAccumulator::default();
        for r in iter {
            acc.record(r);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn results() -> Vec<TaskResult> {
        vec![
            TaskResult::succeeded("a.csv.tar".into(), "k/a".into(), 100),
            TaskResult::failed(
                "b.csv.tar".into(),
                "k/b".into(),
                &Error::DownloadFailed {
                    key: "k/b".into(),
                    message: "http 403".into(),
                },
            ),
            TaskResult::succeeded("c.csv.tar".into(), "k/c".into(), 7),
            TaskResult::succeeded("d.csv.tar".into(), "k/d".into(), 0),
            TaskResult::failed("e.csv.tar".into(), "k/e".into(), &Error::Cancelled),
        ]
    }

    #[test]
    fn totals_do_not_depend_on_completion_order() {
        let forward = results();
        let expected: RunAccumulator = forward.iter().collect();

        let mut reversed = forward.clone();
        reversed.reverse();
        let mut rotated = forward.clone();
        rotated.rotate_left(2);
        let mut swapped = forward.clone();
        swapped.swap(0, 3);

        for order in [reversed, rotated, swapped] {
            let acc: RunAccumulator = order.iter().collect();
            assert_eq!(acc, expected);
        }

        assert_eq!(expected.total_bytes, 107);
        assert_eq!(expected.completed_count, 5);
        assert_eq!(expected.succeeded, 2);
        assert_eq!(expected.empty, 1);
        assert_eq!(expected.failed, 1);
        assert_eq!(expected.cancelled, 1);
    }

    #[test]
    fn merging_partial_totals_matches_a_single_pass() {
        let all = results();
        let whole: RunAccumulator = all.iter().collect();

        let (left, right) = all.split_at(2);
        let mut merged: RunAccumulator = right.iter().collect();
        merged.merge(&left.iter().collect());

        assert_eq!(merged, whole);
    }

    #[test]
    fn failed_results_carry_zero_bytes_and_error_code() {
        let r = TaskResult::failed(
            "x.csv.tar".into(),
            "k/x".into(),
            &Error::ArchiveCorrupt {
                path: "x.csv.tar".into(),
                message: "bad header".into(),
            },
        );
        assert_eq!(r.decompressed_bytes, 0);
        assert!(!r.is_success());
        match r.outcome {
            TaskOutcome::Failed { code, .. } => assert_eq!(code, "archive.corrupt"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
