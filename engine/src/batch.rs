//! Partial-failure batch executor: applies one unit of work to an ordered
//! list of targets with stop-on-error, dry-run, and inter-item pacing.
//! Per-item faults are data in the outcome, never errors.

use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use folio_core::content::ContentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Pause before every item except the first. A throttle against
    /// downstream rate limits, not a scheduling primitive.
    #[serde(default)]
    pub inter_item_delay_ms: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            dry_run: false,
            inter_item_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Ok,
    Simulated,
    Error,
    Exception,
    StoppedOnError,
}

impl ItemStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Simulated => "simulated",
            Self::Error => "error",
            Self::Exception => "exception",
            Self::StoppedOnError => "stopped_on_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    pub id: ContentId,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A unit of work failed. `Failed` is the unit reporting its own negative
/// outcome; `Exception` is a fault the unit did not classify itself.
#[derive(Debug, Clone)]
pub enum UnitFault {
    Failed(String),
    Exception(String),
}

/// Result of one batch run. The three lists are disjoint and together
/// cover every requested target exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success: Vec<ItemReport>,
    pub failed: Vec<ItemReport>,
    pub skipped: Vec<ItemReport>,
    pub dry_run: bool,
    pub elapsed_ms: u64,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.success.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<ContentId> {
        self.failed.iter().map(|item| item.id).collect()
    }
}

/// Apply `unit` to every target in strict input order.
///
/// - `dry_run`: records a synthetic `simulated` success per target and
///   never invokes the unit.
/// - Any `UnitFault` lands in `failed`; the loop keeps going unless
///   `stop_on_error`, in which case every unprocessed target is recorded
///   as `skipped` and the loop ends immediately.
pub async fn run_batch<F, Fut>(
    targets: &[ContentId],
    options: &BatchOptions,
    mut unit: F,
) -> BatchOutcome
where
    F: FnMut(ContentId) -> Fut,
    Fut: Future<Output = Result<Option<String>, UnitFault>>,
{
    let started = Instant::now();
    let mut outcome = BatchOutcome {
        success: Vec::new(),
        failed: Vec::new(),
        skipped: Vec::new(),
        dry_run: options.dry_run,
        elapsed_ms: 0,
    };

    for (index, id) in targets.iter().copied().enumerate() {
        if index > 0 && options.inter_item_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(options.inter_item_delay_ms))
                .await;
        }

        if options.dry_run {
            outcome.success.push(ItemReport {
                id,
                status: ItemStatus::Simulated,
                detail: None,
            });
            continue;
        }

        match unit(id).await {
            Ok(detail) => outcome.success.push(ItemReport {
                id,
                status: ItemStatus::Ok,
                detail,
            }),
            Err(fault) => {
                let report = match fault {
                    UnitFault::Failed(detail) => ItemReport {
                        id,
                        status: ItemStatus::Error,
                        detail: Some(detail),
                    },
                    UnitFault::Exception(detail) => ItemReport {
                        id,
                        status: ItemStatus::Exception,
                        detail: Some(detail),
                    },
                };
                outcome.failed.push(report);

                if options.stop_on_error {
                    for remaining in targets.iter().copied().skip(index + 1) {
                        outcome.skipped.push(ItemReport {
                            id: remaining,
                            status: ItemStatus::StoppedOnError,
                            detail: Some("stopped_on_error".to_string()),
                        });
                    }
                    break;
                }
            }
        }
    }

    outcome.elapsed_ms = started.elapsed().as_millis() as u64;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn targets(n: usize) -> Vec<ContentId> {
        (0..n).map(|_| Uuid::now_v7()).collect()
    }

    #[tokio::test]
    async fn counts_are_conserved_for_every_option_combination() {
        let ids = targets(6);
        let failing = ids[2];
        for stop_on_error in [false, true] {
            for dry_run in [false, true] {
                let options = BatchOptions {
                    stop_on_error,
                    dry_run,
                    inter_item_delay_ms: 0,
                };
                let outcome = run_batch(&ids, &options, |id| async move {
                    if id == failing {
                        Err(UnitFault::Failed("nope".to_string()))
                    } else {
                        Ok(None)
                    }
                })
                .await;
                assert_eq!(outcome.total(), ids.len(), "stop={stop_on_error} dry={dry_run}");
            }
        }
    }

    #[tokio::test]
    async fn stop_on_error_is_deterministic() {
        let ids = targets(4);
        let failing = ids[1];
        let options = BatchOptions {
            stop_on_error: true,
            ..Default::default()
        };
        let outcome = run_batch(&ids, &options, |id| async move {
            if id == failing {
                Err(UnitFault::Failed("boom".to_string()))
            } else {
                Ok(None)
            }
        })
        .await;

        assert_eq!(
            outcome.success.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![ids[0]]
        );
        assert_eq!(outcome.failed_ids(), vec![ids[1]]);
        assert_eq!(
            outcome.skipped.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![ids[2], ids[3]]
        );
        assert!(outcome
            .skipped
            .iter()
            .all(|r| r.status == ItemStatus::StoppedOnError));
    }

    #[tokio::test]
    async fn dry_run_never_invokes_the_unit() {
        let ids = targets(3);
        let calls = AtomicUsize::new(0);
        let options = BatchOptions {
            dry_run: true,
            ..Default::default()
        };

        let mut runs = Vec::new();
        for _ in 0..2 {
            let outcome = run_batch(&ids, &options, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<Option<String>, UnitFault>(None) }
            })
            .await;
            assert!(outcome.dry_run);
            let statuses: Vec<(ContentId, ItemStatus)> = outcome
                .success
                .iter()
                .map(|r| (r.id, r.status))
                .collect();
            runs.push(statuses);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(runs[0], runs[1]);
        assert!(runs[0].iter().all(|(_, s)| *s == ItemStatus::Simulated));
    }

    #[tokio::test]
    async fn unclassified_faults_do_not_abort_the_loop() {
        let ids = targets(3);
        let crashing = ids[0];
        let outcome = run_batch(&ids, &BatchOptions::default(), |id| async move {
            if id == crashing {
                Err(UnitFault::Exception("index out of bounds".to_string()))
            } else {
                Ok(Some("updated".to_string()))
            }
        })
        .await;

        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].status, ItemStatus::Exception);
        assert_eq!(outcome.success.len(), 2);
        assert!(outcome.skipped.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_a_clean_noop() {
        let outcome = run_batch(&[], &BatchOptions::default(), |_| async move {
            Ok::<Option<String>, UnitFault>(None)
        })
        .await;
        assert_eq!(outcome.total(), 0);
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn pacing_applies_between_items_only() {
        let ids = targets(3);
        let options = BatchOptions {
            inter_item_delay_ms: 10,
            ..Default::default()
        };
        let started = Instant::now();
        let outcome = run_batch(&ids, &options, |_| async move {
            Ok::<Option<String>, UnitFault>(None)
        })
        .await;
        assert!(started.elapsed().as_millis() >= 20);
        assert_eq!(outcome.success.len(), 3);
    }
}
