//! Job acquisition: select due jobs, defer blocked exclusive ones, lock the rest.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use jobflow_core::{Entity, EntityId};
use jobflow_jobs::job::fields;
use jobflow_jobs::{Job, instant_after};

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::interceptor::Operation;
use crate::store::{Criterion, OperationKind, RecordQuery};
use crate::unit_of_work::LockFailureResolution;

/// Locks up to `max_jobs` acquirable jobs for `lock_owner`.
#[derive(Debug, Clone)]
pub struct AcquireJobs {
    pub lock_owner: String,
    pub lock_duration: Duration,
    pub max_jobs: usize,
}

/// Result of one acquisition cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquiredJobs {
    /// Dispatch batches; each runs sequentially on one worker.
    pub batches: Vec<Vec<EntityId>>,
    /// Candidate rows examined, across every page of the candidate query.
    pub candidates: usize,
    /// Exclusive jobs held back because their entity is busy.
    pub deferred: usize,
    /// Jobs another owner locked first.
    pub lost: Vec<EntityId>,
}

impl AcquiredJobs {
    pub fn job_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn job_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.batches.iter().flatten().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl AcquireJobs {
    pub fn new(lock_owner: impl Into<String>, lock_duration: Duration, max_jobs: usize) -> Self {
        Self {
            lock_owner: lock_owner.into(),
            lock_duration,
            max_jobs,
        }
    }

    /// Due, unlocked (or expired), non-suspended jobs with retries left.
    ///
    /// Highest priority first, then earliest due date; a job without a due
    /// date counts as due since forever and sorts ahead of dated ones.
    fn candidate_query(&self, now_ms: i64, limit: usize) -> RecordQuery {
        RecordQuery::of::<Job>()
            .filter(Criterion::any_of(vec![
                Criterion::is_null(fields::DUE_DATE),
                Criterion::le(fields::DUE_DATE, now_ms),
            ]))
            .filter(Criterion::gt(fields::RETRIES, 0))
            .filter(Criterion::eq(fields::SUSPENDED, false))
            .filter(Criterion::any_of(vec![
                Criterion::is_null(fields::LOCK_OWNER),
                Criterion::lt(fields::LOCK_EXPIRATION, now_ms),
            ]))
            .descending(fields::PRIORITY)
            .ascending_nulls_first(fields::DUE_DATE)
            .limit(limit)
    }

    fn entity_busy(
        &self,
        ctx: &mut CommandContext,
        entity_id: EntityId,
        now_ms: i64,
    ) -> Result<bool, EngineError> {
        let query = RecordQuery::of::<Job>()
            .filter(Criterion::eq(fields::EXCLUSIVE, true))
            .filter(Criterion::id_eq(fields::ASSOCIATED_ENTITY_ID, entity_id))
            .filter(Criterion::not_null(fields::LOCK_OWNER))
            .filter(Criterion::ge(fields::LOCK_EXPIRATION, now_ms));
        Ok(ctx.unit_of_work().count(&query)? > 0)
    }
}

impl Operation for AcquireJobs {
    type Output = AcquiredJobs;

    fn name(&self) -> &str {
        "acquire_jobs"
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> Result<AcquiredJobs, EngineError> {
        if self.max_jobs == 0 {
            return Ok(AcquiredJobs::default());
        }

        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_at = instant_after(now, self.lock_duration).ok_or_else(|| {
            EngineError::validation(format!(
                "lock duration of {:?} overflows the lock expiration",
                self.lock_duration
            ))
        })?;

        let mut acquired = AcquiredJobs::default();
        let mut seen: HashSet<EntityId> = HashSet::new();
        let mut busy_entities: HashSet<EntityId> = HashSet::new();
        let mut locked: Vec<(EntityId, Option<EntityId>)> = Vec::with_capacity(self.max_jobs);

        // Deferred rows do not count against `max_jobs`: widen the window past
        // them until enough jobs are locked or the candidates run out.
        let mut limit = self.max_jobs;
        'pages: loop {
            let page: Vec<Job> = ctx.unit_of_work().query(&self.candidate_query(now_ms, limit))?;
            let last_page = page.len() < limit;

            for candidate in page {
                if !seen.insert(candidate.id) {
                    continue;
                }
                if locked.len() == self.max_jobs {
                    break 'pages;
                }
                acquired.candidates += 1;

                let exclusive_entity = candidate
                    .exclusive
                    .then_some(candidate.associated_entity_id)
                    .flatten();
                if let Some(entity_id) = exclusive_entity {
                    if busy_entities.contains(&entity_id) || self.entity_busy(ctx, entity_id, now_ms)? {
                        debug!(job_id = %candidate.id, entity_id = %entity_id, "deferring exclusive job");
                        busy_entities.insert(entity_id);
                        acquired.deferred += 1;
                        continue;
                    }
                }

                if let Some(job) = ctx.unit_of_work().get_or_load::<Job>(candidate.id)? {
                    job.lock(self.lock_owner.clone(), expires_at);
                    locked.push((job.id, exclusive_entity));
                }
            }

            if last_page || locked.len() >= self.max_jobs {
                break;
            }
            limit = seen.len() + (self.max_jobs - locked.len());
        }

        // Losing the compare-and-set on a job update just means another owner got there first.
        ctx.unit_of_work().on_optimistic_lock(|failure| {
            if failure.entity_type == Job::ENTITY_TYPE && failure.kind == OperationKind::Update {
                LockFailureResolution::Ignore
            } else {
                LockFailureResolution::Fail
            }
        });
        let summary = ctx.unit_of_work().flush()?;

        acquired.lost = summary.ignored.iter().map(|failure| failure.id).collect();
        let lost: HashSet<EntityId> = acquired.lost.iter().copied().collect();
        for id in &acquired.lost {
            debug!(job_id = %id, owner = %self.lock_owner, "lost acquisition race");
        }

        let mut exclusive_batches: Vec<(EntityId, usize)> = Vec::new();
        for (job_id, exclusive_entity) in locked {
            if lost.contains(&job_id) {
                continue;
            }
            match exclusive_entity {
                Some(entity_id) => {
                    match exclusive_batches.iter().find(|(e, _)| *e == entity_id) {
                        Some((_, index)) => acquired.batches[*index].push(job_id),
                        None => {
                            exclusive_batches.push((entity_id, acquired.batches.len()));
                            acquired.batches.push(vec![job_id]);
                        }
                    }
                }
                None => acquired.batches.push(vec![job_id]),
            }
        }

        Ok(acquired)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::interceptor::CommandExecutor;
    use crate::services::EngineServices;
    use crate::store::{EntityStore, InMemoryEntityStore};

    fn executor() -> (CommandExecutor, Arc<InMemoryEntityStore>) {
        let store = Arc::new(InMemoryEntityStore::new());
        let services = EngineServices::new(store.clone(), EngineConfig::default());
        (CommandExecutor::standard(Arc::new(services)), store)
    }

    fn insert(executor: &CommandExecutor, jobs: Vec<Job>) {
        executor
            .execute_fn("insert_jobs", move |ctx| {
                for job in jobs {
                    ctx.unit_of_work().register_insert(job);
                }
                Ok(())
            })
            .unwrap();
    }

    fn acquire(executor: &CommandExecutor, owner: &str, max: usize) -> AcquiredJobs {
        executor
            .execute(AcquireJobs::new(owner, Duration::from_secs(60), max))
            .unwrap()
    }

    fn load(store: &InMemoryEntityStore, id: EntityId) -> Job {
        let record = store.load(Job::ENTITY_TYPE, id).unwrap().unwrap();
        serde_json::from_value(record.payload).unwrap()
    }

    #[test]
    fn locks_due_jobs_by_priority() {
        let (executor, store) = executor();
        let low = Job::new("t", json!({})).with_priority(1);
        let high = Job::new("t", json!({})).with_priority(9);
        let (low_id, high_id) = (low.id, high.id);
        insert(&executor, vec![low, high]);

        let acquired = acquire(&executor, "node-a", 1);
        assert_eq!(acquired.batches, vec![vec![high_id]]);
        assert_eq!(load(&store, high_id).lock_owner.as_deref(), Some("node-a"));
        assert!(load(&store, low_id).lock_owner.is_none());
    }

    #[test]
    fn skips_future_exhausted_and_suspended_jobs() {
        let (executor, _) = executor();
        let future = Job::new("t", json!({})).with_due_date(Utc::now() + ChronoDuration::hours(1));
        let exhausted = Job::new("t", json!({})).with_retries(0);
        let suspended = Job::new("t", json!({})).suspended(true);
        insert(&executor, vec![future, exhausted, suspended]);

        let acquired = acquire(&executor, "node-a", 10);
        assert!(acquired.is_empty());
        assert_eq!(acquired.candidates, 0);
    }

    #[test]
    fn locked_job_is_not_reacquired_until_expiry() {
        let (executor, _) = executor();
        let job = Job::new("t", json!({}));
        insert(&executor, vec![job]);

        assert_eq!(acquire(&executor, "node-a", 10).job_count(), 1);
        assert_eq!(acquire(&executor, "node-a", 10).job_count(), 0);
        assert_eq!(acquire(&executor, "node-b", 10).job_count(), 0);
    }

    #[test]
    fn expired_lock_is_acquirable() {
        let (executor, store) = executor();
        let mut job = Job::new("t", json!({}));
        job.lock("crashed-node", Utc::now() - ChronoDuration::seconds(1));
        let id = job.id;
        insert(&executor, vec![job]);

        assert_eq!(acquire(&executor, "node-b", 10).batches, vec![vec![id]]);
        assert_eq!(load(&store, id).lock_owner.as_deref(), Some("node-b"));
    }

    #[test]
    fn exclusive_jobs_of_one_entity_share_a_batch() {
        let (executor, _) = executor();
        let entity = EntityId::new();
        let a = Job::new("t", json!({})).exclusive_for(entity).with_priority(3);
        let b = Job::new("t", json!({})).exclusive_for(entity).with_priority(2);
        let c = Job::new("t", json!({})).with_priority(1);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        insert(&executor, vec![a, b, c]);

        let acquired = acquire(&executor, "node-a", 10);
        assert_eq!(acquired.batches, vec![vec![a_id, b_id], vec![c_id]]);
    }

    #[test]
    fn exclusive_job_deferred_while_entity_is_busy() {
        let (executor, _) = executor();
        let entity = EntityId::new();
        let mut running = Job::new("t", json!({})).exclusive_for(entity);
        running.lock("node-a", Utc::now() + ChronoDuration::minutes(5));
        let waiting = Job::new("t", json!({})).exclusive_for(entity);
        insert(&executor, vec![running, waiting]);

        let acquired = acquire(&executor, "node-b", 10);
        assert!(acquired.is_empty());
        assert_eq!(acquired.deferred, 1);
    }

    #[test]
    fn busy_exclusive_siblings_do_not_starve_other_jobs() {
        let (executor, store) = executor();
        let entity = EntityId::new();
        let mut running = Job::new("t", json!({})).exclusive_for(entity).with_priority(10);
        running.lock("node-a", Utc::now() + ChronoDuration::minutes(5));
        let siblings: Vec<Job> = (0..3)
            .map(|_| Job::new("t", json!({})).exclusive_for(entity).with_priority(10))
            .collect();
        let normal = Job::new("t", json!({})).with_priority(1);
        let normal_id = normal.id;
        let mut jobs = vec![running];
        jobs.extend(siblings);
        jobs.push(normal);
        insert(&executor, jobs);

        let acquired = acquire(&executor, "node-b", 3);
        assert_eq!(acquired.batches, vec![vec![normal_id]]);
        assert_eq!(acquired.deferred, 3);
        assert_eq!(load(&store, normal_id).lock_owner.as_deref(), Some("node-b"));

        let again = acquire(&executor, "node-b", 3);
        assert!(again.is_empty());
        assert_eq!(again.deferred, 3);
    }

    #[test]
    fn paging_stops_once_enough_jobs_are_locked() {
        let (executor, _) = executor();
        let entity = EntityId::new();
        let mut running = Job::new("t", json!({})).exclusive_for(entity).with_priority(10);
        running.lock("node-a", Utc::now() + ChronoDuration::minutes(5));
        let mut jobs = vec![running, Job::new("t", json!({})).exclusive_for(entity).with_priority(9)];
        jobs.extend((0..5).map(|_| Job::new("t", json!({})).with_priority(1)));
        insert(&executor, jobs);

        let acquired = acquire(&executor, "node-b", 2);
        assert_eq!(acquired.job_count(), 2);
        assert_eq!(acquired.deferred, 1);
        assert_eq!(acquired.candidates, 3);
    }

    #[test]
    fn undated_jobs_are_acquired_before_dated_ones() {
        let (executor, _) = executor();
        let dated = Job::new("t", json!({})).with_due_date(Utc::now() - ChronoDuration::minutes(1));
        let undated = Job::new("t", json!({}));
        let undated_id = undated.id;
        insert(&executor, vec![dated, undated]);

        assert_eq!(acquire(&executor, "node-a", 1).batches, vec![vec![undated_id]]);
    }

    #[test]
    fn unrepresentable_lock_duration_is_rejected() {
        let (executor, store) = executor();
        let job = Job::new("t", json!({}));
        let id = job.id;
        insert(&executor, vec![job]);

        let err = executor
            .execute(AcquireJobs::new("node-a", Duration::from_secs(u64::MAX / 4), 1))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(load(&store, id).lock_owner.is_none());
    }
}
