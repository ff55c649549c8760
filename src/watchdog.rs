// =============================================================================
// Watchdog — detects stalled discussions and stuck items, forces resolution
// =============================================================================
//
// Runs on its own cadence, independent of the per-sector tickers. Each sweep:
//   - IN_PROGRESS discussions whose checklist has not moved for
//     stall_timeout_s are force-closed (PENDING / REVISE_REQUIRED items
//     rejected) with close_reason "watchdog_force_close_stalled_<age>s".
//   - PENDING items older than item_pending_timeout_s are rejected with
//     "watchdog_timeout_pending"; REVISE_REQUIRED older than
//     item_revise_timeout_s with "watchdog_timeout_revise". If that leaves
//     every item terminal, the discussion closes.
//
// The per-discussion mutex shared with the tickers guarantees a sweep never
// interleaves with a round step on the same discussion.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::discussion_engine::{force_close, DiscussionEngine};
use crate::error::CoreResult;
use crate::model::{Discussion, ScoreRecord};
use crate::runtime_config::RuntimeConfig;
use crate::storage::{collections, KeyedStore};
use crate::ticker::DiscussionLocks;
use crate::types::ItemStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub discussions_closed: usize,
    pub items_rejected: usize,
}

pub struct Watchdog {
    store: Arc<KeyedStore>,
    config: Arc<RwLock<RuntimeConfig>>,
    discussions: Arc<DiscussionEngine>,
    locks: DiscussionLocks,
}

impl Watchdog {
    pub fn new(
        store: Arc<KeyedStore>,
        config: Arc<RwLock<RuntimeConfig>>,
        discussions: Arc<DiscussionEngine>,
        locks: DiscussionLocks,
    ) -> Self {
        Self {
            store,
            config,
            discussions,
            locks,
        }
    }

    /// One watchdog pass over all in-progress discussions.
    pub async fn sweep(&self) -> CoreResult<SweepReport> {
        let (stall_timeout, pending_timeout, revise_timeout) = {
            let cfg = self.config.read();
            (
                cfg.stall_timeout_s as i64,
                cfg.item_pending_timeout_s as i64,
                cfg.item_revise_timeout_s as i64,
            )
        };

        let in_progress: Vec<(String, String)> = self
            .store
            .read::<Discussion>(collections::DISCUSSIONS)
            .await?
            .into_iter()
            .filter(|d| d.is_in_progress())
            .map(|d| (d.id, d.sector_id))
            .collect();

        let mut report = SweepReport::default();

        for (discussion_id, sector_id) in in_progress {
            // Never interleave with a round step on the same discussion.
            let lock = self.locks.lock_for(&discussion_id);
            let _guard = lock.lock().await;

            let did = discussion_id.clone();
            let closed = self
                .store
                .update::<Discussion, _, _>(collections::DISCUSSIONS, move |discussions| {
                    let Some(d) = discussions.iter_mut().find(|d| d.id == did) else {
                        return Ok(None);
                    };
                    if !d.is_in_progress() {
                        return Ok(None);
                    }

                    let now = Utc::now();
                    let mut rejected = 0usize;

                    // ── Item timeouts ───────────────────────────────────
                    for item in d.checklist.iter_mut() {
                        let age = (now - item.updated_at).num_seconds();
                        let reason = match item.status {
                            ItemStatus::Pending if age > pending_timeout => {
                                Some("watchdog_timeout_pending")
                            }
                            ItemStatus::ReviseRequired if age > revise_timeout => {
                                Some("watchdog_timeout_revise")
                            }
                            _ => None,
                        };
                        if let Some(reason) = reason {
                            item.status = ItemStatus::Rejected;
                            item.rejection_reason = Some(ScoreRecord::watchdog(reason));
                            item.updated_at = now;
                            rejected += 1;
                        }
                    }
                    if rejected > 0 {
                        d.updated_at = now;
                    }

                    // ── Stall detection ─────────────────────────────────
                    let stall_age = (now - d.last_checklist_item_at).num_seconds();
                    if stall_age > stall_timeout {
                        force_close(d, &format!("watchdog_force_close_stalled_{stall_age}s"));
                        return Ok(Some((rejected, false)));
                    }

                    if rejected > 0 && d.all_items_terminal() {
                        force_close(d, "watchdog_timeout_items");
                        return Ok(Some((rejected, false)));
                    }

                    if rejected > 0 {
                        Ok(Some((rejected, true)))
                    } else {
                        Ok(None)
                    }
                })
                .await?;

            match closed {
                Some((rejected, still_in_progress)) => {
                    report.items_rejected += rejected;
                    if !still_in_progress {
                        report.discussions_closed += 1;
                        warn!(discussion = %discussion_id, sector = %sector_id, "watchdog closed discussion");
                        self.discussions.after_close(&sector_id).await?;
                        self.locks.forget(&discussion_id);
                    }
                }
                None => {
                    debug!(discussion = %discussion_id, "watchdog: healthy");
                }
            }
        }

        Ok(report)
    }
}

/// The watchdog loop; spawned once at startup.
pub async fn run(watchdog: Arc<Watchdog>, mut shutdown: watch::Receiver<bool>) {
    let period = watchdog.config.read().watchdog_period_ms;
    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(period.max(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(period_ms = period, "watchdog started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match watchdog.sweep().await {
                    Ok(report) if report.discussions_closed + report.items_rejected > 0 => {
                        info!(
                            closed = report.discussions_closed,
                            rejected = report.items_rejected,
                            "watchdog sweep resolved work"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "watchdog sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{CandleFeed, SharedCandleFeed};
    use crate::model::{Agent, ChecklistItem, Personality, Sector};
    use crate::oracle::DeterministicOracle;
    use crate::types::{ActionType, AgentRole, DiscussionStatus, SystemMode};
    use chrono::Duration;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("concord-watchdog-{}", uuid::Uuid::new_v4()))
    }

    struct Fixture {
        dir: PathBuf,
        store: Arc<KeyedStore>,
        watchdog: Watchdog,
        sector_id: String,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    async fn fixture() -> Fixture {
        let dir = temp_dir();
        let store = Arc::new(
            KeyedStore::open(&dir, std::time::Duration::from_secs(2), 3).unwrap(),
        );
        let config = Arc::new(RwLock::new(RuntimeConfig::default()));
        let feed: SharedCandleFeed = Arc::new(CandleFeed::new());
        let locks = DiscussionLocks::new();
        let discussions = Arc::new(DiscussionEngine::new(
            store.clone(),
            Arc::new(DeterministicOracle),
            config.clone(),
            feed,
        ));

        let sector = Sector::new(
            "Energy",
            "ENRG",
            1000.0,
            100.0,
            0.02,
            40,
            0.0,
            vec!["ENRG".into()],
            SystemMode::Simulation,
        );
        let agent = Agent::new(sector.id.clone(), "w0", AgentRole::Trader, Personality::default());
        let sector_id = sector.id.clone();

        let s = sector.clone();
        store
            .update::<Sector, _, _>(collections::SECTORS, move |v| {
                v.push(s.clone());
                Ok(())
            })
            .await
            .unwrap();
        let a = agent.clone();
        store
            .update::<Agent, _, _>(collections::AGENTS, move |v| {
                v.push(a.clone());
                Ok(())
            })
            .await
            .unwrap();

        Fixture {
            dir,
            watchdog: Watchdog::new(store.clone(), config, discussions, locks),
            store,
            sector_id,
        }
    }

    async fn insert_discussion(f: &Fixture, d: Discussion) {
        let clone = d.clone();
        f.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |v| {
                v.push(clone.clone());
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn read_discussion(f: &Fixture, id: &str) -> Discussion {
        f.store
            .read::<Discussion>(collections::DISCUSSIONS)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.id == id)
            .unwrap()
    }

    fn pending_item(age_seconds: i64) -> ChecklistItem {
        let mut item =
            ChecklistItem::new("a1", 2, ActionType::Buy, "ENRG", 100.0, 10.0, 70.0, "x");
        item.updated_at = Utc::now() - Duration::seconds(age_seconds);
        item
    }

    #[tokio::test]
    async fn stalled_discussion_is_force_closed() {
        let f = fixture().await;
        let mut d = Discussion::new(f.sector_id.clone(), vec!["a1".into(), "a2".into()], 2);
        d.checklist.push(pending_item(0));
        d.last_checklist_item_at = Utc::now() - Duration::seconds(31);
        let id = d.id.clone();
        insert_discussion(&f, d).await;

        let report = f.watchdog.sweep().await.unwrap();
        assert_eq!(report.discussions_closed, 1);

        let stored = read_discussion(&f, &id).await;
        assert_eq!(stored.status, DiscussionStatus::Decided);
        assert!(stored
            .close_reason
            .as_deref()
            .unwrap()
            .starts_with("watchdog_force_close_stalled_"));
        assert_eq!(stored.checklist[0].status, ItemStatus::Rejected);

        // Cooldown kicked in on the sector.
        let sector: Sector = f
            .store
            .read::<Sector>(collections::SECTORS)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == f.sector_id)
            .unwrap();
        assert!(sector.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn old_pending_item_is_rejected_by_timeout() {
        let f = fixture().await;
        let mut d = Discussion::new(f.sector_id.clone(), vec!["a1".into(), "a2".into()], 2);
        d.checklist.push(pending_item(301));
        d.last_checklist_item_at = Utc::now();
        let id = d.id.clone();
        insert_discussion(&f, d).await;

        let report = f.watchdog.sweep().await.unwrap();
        assert_eq!(report.items_rejected, 1);

        let stored = read_discussion(&f, &id).await;
        assert_eq!(stored.checklist[0].status, ItemStatus::Rejected);
        assert_eq!(
            stored.checklist[0]
                .rejection_reason
                .as_ref()
                .unwrap()
                .reason,
            "watchdog_timeout_pending"
        );
        // All items terminal after the rejection: discussion closed too.
        assert_eq!(stored.status, DiscussionStatus::Decided);
        assert_eq!(stored.close_reason.as_deref(), Some("watchdog_timeout_items"));
    }

    #[tokio::test]
    async fn old_revise_item_uses_the_revise_timeout() {
        let f = fixture().await;
        let mut d = Discussion::new(f.sector_id.clone(), vec!["a1".into(), "a2".into()], 2);
        let mut fresh = pending_item(400);
        fresh.status = ItemStatus::ReviseRequired;
        d.checklist.push(fresh);
        d.last_checklist_item_at = Utc::now();
        let id = d.id.clone();
        insert_discussion(&f, d).await;

        // 400s is old for PENDING but fresh for REVISE_REQUIRED.
        let report = f.watchdog.sweep().await.unwrap();
        assert_eq!(report.items_rejected, 0);
        assert_eq!(
            read_discussion(&f, &id).await.checklist[0].status,
            ItemStatus::ReviseRequired
        );

        // Push it past the revise timeout.
        let did = id.clone();
        f.store
            .update::<Discussion, _, _>(collections::DISCUSSIONS, move |v| {
                let d = v.iter_mut().find(|d| d.id == did).unwrap();
                d.checklist[0].updated_at = Utc::now() - Duration::seconds(601);
                Ok(())
            })
            .await
            .unwrap();
        let report = f.watchdog.sweep().await.unwrap();
        assert_eq!(report.items_rejected, 1);
        let stored = read_discussion(&f, &id).await;
        assert_eq!(
            stored.checklist[0].rejection_reason.as_ref().unwrap().reason,
            "watchdog_timeout_revise"
        );
    }

    #[tokio::test]
    async fn healthy_discussions_are_left_alone() {
        let f = fixture().await;
        let mut d = Discussion::new(f.sector_id.clone(), vec!["a1".into(), "a2".into()], 2);
        d.checklist.push(pending_item(0));
        d.last_checklist_item_at = Utc::now();
        let id = d.id.clone();
        insert_discussion(&f, d).await;

        let report = f.watchdog.sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(read_discussion(&f, &id).await.status, DiscussionStatus::InProgress);
    }
}
