//! Integration tests for the whole engine.
//!
//! Tests: Operation → Interceptors → UnitOfWork → EntityStore → JobExecutor
//!
//! Verifies:
//! - Concurrent acquisition locks each job for at most one owner
//! - Flushes are atomic and conflicts leave the store untouched
//! - Failed jobs are retried, exhausted and turned into incidents
//! - Batches fan out, run and complete
//! - Transaction hooks, nested contexts and authorization behave as documented

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use serde_json::json;

    use jobflow_auth::{AuthzError, Principal, PrincipalId, Role};
    use jobflow_core::{Entity, EntityId, TenantId};
    use jobflow_jobs::batch::{SEED_JOB_TYPE, WORK_JOB_TYPE};
    use jobflow_jobs::{Batch, BatchConfiguration, IncidentType, Job, RetryPolicy};

    use crate::batch::{CreateBatch, FnBatchHandler};
    use crate::config::EngineConfig;
    use crate::context::TransactionPhase;
    use crate::engine::ProcessEngine;
    use crate::error::{EngineError, JobError};
    use crate::interceptor::{
        AuthorizationInterceptor, CommandExecutor, ContextInterceptor, Interceptor, Invocation,
        Next, TransactionInterceptor,
    };
    use crate::jobs::AcquireJobs;
    use crate::management::{IncidentQuery, JobQuery};
    use crate::services::EngineServices;
    use crate::store::{EntityStore, InMemoryEntityStore, RecordQuery};
    use crate::unit_of_work::UnitOfWork;

    fn test_config() -> EngineConfig {
        EngineConfig::default()
            .with_engine_name("test")
            .with_acquisition_interval(Duration::from_millis(20))
            .with_retry_policy(RetryPolicy::immediate())
            .with_batch_poll_interval(Duration::from_millis(10), Duration::from_millis(40))
    }

    fn engine_with(
        config: EngineConfig,
        configure: impl FnOnce(crate::engine::ProcessEngineBuilder) -> crate::engine::ProcessEngineBuilder,
    ) -> (ProcessEngine, Arc<InMemoryEntityStore>) {
        let store = Arc::new(InMemoryEntityStore::new());
        let builder = ProcessEngine::builder(config).store(store.clone());
        (configure(builder).build().unwrap(), store)
    }

    fn insert_job(executor: &CommandExecutor, job: Job) -> EntityId {
        executor
            .execute_fn("insert_job", move |ctx| Ok(ctx.unit_of_work().register_insert(job)))
            .unwrap()
    }

    fn stored_job(store: &InMemoryEntityStore, id: EntityId) -> Option<Job> {
        store
            .load(Job::ENTITY_TYPE, id)
            .unwrap()
            .map(|record| {
                let mut job: Job = serde_json::from_value(record.payload).unwrap();
                job.set_revision(record.revision);
                job
            })
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn operator() -> Principal {
        Principal::with_roles(PrincipalId::new(), vec![Role::OPERATOR])
    }

    fn viewer() -> Principal {
        Principal::with_roles(PrincipalId::new(), vec![Role::VIEWER])
    }

    // ---- acquisition ----

    #[test]
    fn concurrent_acquisition_has_exactly_one_winner() {
        let (engine, store) = engine_with(test_config(), |b| b);
        let executor = engine.command_executor().clone();
        let job_id = insert_job(&executor, Job::new("t", json!({})));

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["node-a", "node-b"]
            .into_iter()
            .map(|owner| {
                let executor = executor.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let acquired = executor
                        .execute(AcquireJobs::new(owner, Duration::from_secs(60), 3))
                        .unwrap();
                    (owner, acquired.job_count())
                })
            })
            .collect();
        let results: Vec<(&str, usize)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<_> = results.iter().filter(|(_, n)| *n == 1).collect();
        assert_eq!(winners.len(), 1, "results: {results:?}");
        assert_eq!(results.iter().map(|(_, n)| n).sum::<usize>(), 1);

        let job = stored_job(&store, job_id).unwrap();
        assert_eq!(job.lock_owner.as_deref(), Some(winners[0].0));
    }

    #[test]
    fn reacquiring_a_held_job_is_a_no_op() {
        let (engine, store) = engine_with(test_config(), |b| b);
        let executor = engine.command_executor();
        let job_id = insert_job(executor, Job::new("t", json!({})));

        let first = executor
            .execute(AcquireJobs::new("node-a", Duration::from_secs(60), 3))
            .unwrap();
        let revision = stored_job(&store, job_id).unwrap().revision();
        let second = executor
            .execute(AcquireJobs::new("node-a", Duration::from_secs(60), 3))
            .unwrap();

        assert_eq!(first.job_count(), 1);
        assert_eq!(second.job_count(), 0);
        assert_eq!(stored_job(&store, job_id).unwrap().revision(), revision);
    }

    // ---- unit of work ----

    #[test]
    fn conflicting_flush_leaves_store_untouched() {
        let store = Arc::new(InMemoryEntityStore::new());
        let (a, b) = (Job::new("a", json!({})), Job::new("b", json!({})));
        let (a_id, b_id) = (a.id, b.id);
        let mut seed = UnitOfWork::new(store.clone());
        seed.register_insert(a);
        seed.register_insert(b);
        seed.flush().unwrap();

        let mut first = UnitOfWork::new(store.clone());
        first.get_or_load::<Job>(a_id).unwrap().unwrap().priority = 5;
        first.get_or_load::<Job>(b_id).unwrap().unwrap().priority = 5;

        let mut second = UnitOfWork::new(store.clone());
        second.get_or_load::<Job>(b_id).unwrap().unwrap().priority = 9;
        second.flush().unwrap();

        let error = first.flush().unwrap_err();
        assert!(error.is_optimistic_lock());
        assert_eq!(stored_job(&store, a_id).unwrap().priority, 0);
        assert_eq!(stored_job(&store, b_id).unwrap().priority, 9);
    }

    // ---- job execution ----

    #[test]
    fn single_retry_failure_exhausts_job_and_opens_incident() {
        let (engine, store) = engine_with(test_config(), |b| {
            b.handler("flaky", |_, _| Err(JobError::retryable("service unavailable")))
        });
        let job_id = insert_job(
            engine.command_executor(),
            Job::new("flaky", json!({})).with_retries(1),
        );

        let handle = engine.start_job_executor().unwrap();
        let exhausted = wait_until(Duration::from_secs(5), || handle.stats().jobs_exhausted == 1);
        let stats = handle.stats();
        handle.shutdown();

        assert!(exhausted);
        let management = engine.management();
        let job = stored_job(&store, job_id).unwrap();
        assert_eq!(job.retries, 0);
        assert!(!job.is_acquirable(Utc::now()));
        assert!(job.lock_owner.is_none());
        assert_eq!(job.exception_message.as_deref(), Some("service unavailable"));

        let incidents = management
            .incident_query(IncidentQuery::new().job(job_id))
            .unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_type, IncidentType::FailedJob);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.jobs_exhausted, 1);
    }

    #[test]
    fn retried_job_eventually_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let (engine, store) = engine_with(test_config(), move |b| {
            b.handler("eventually", move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(JobError::retryable("not yet"))
                } else {
                    Ok(())
                }
            })
        });
        let job_id = insert_job(engine.command_executor(), Job::new("eventually", json!({})));

        let handle = engine.start_job_executor().unwrap();
        let done = wait_until(Duration::from_secs(5), || stored_job(&store, job_id).is_none());
        handle.shutdown();

        assert!(done);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn inserted_job_wakes_a_sleeping_executor() {
        let config = test_config().with_acquisition_interval(Duration::from_secs(30));
        let (engine, store) = engine_with(config, |b| b.handler("*", |_, _| Ok(())));

        let handle = engine.start_job_executor().unwrap();
        // Let the first (empty) cycle run so the loop is waiting.
        thread::sleep(Duration::from_millis(100));
        let job_id = insert_job(engine.command_executor(), Job::new("wake", json!({})));

        let done = wait_until(Duration::from_secs(5), || stored_job(&store, job_id).is_none());
        handle.shutdown();
        assert!(done);
    }

    #[test]
    fn full_queue_runs_jobs_on_the_acquisition_thread() {
        let config = test_config()
            .with_worker_pool(1, 1)
            .with_max_jobs_per_acquisition(3);
        let (engine, store) = engine_with(config, |b| {
            b.handler("slow", |_, _| {
                thread::sleep(Duration::from_millis(200));
                Ok(())
            })
        });
        let ids: Vec<_> = (0..3)
            .map(|_| insert_job(engine.command_executor(), Job::new("slow", json!({}))))
            .collect();

        let handle = engine.start_job_executor().unwrap();
        let done = wait_until(Duration::from_secs(5), || handle.stats().jobs_succeeded == 3);
        let stats = handle.stats();
        handle.shutdown();

        assert!(done);
        assert!(ids.iter().all(|id| stored_job(&store, *id).is_none()));
        assert!(stats.caller_runs >= 1, "stats: {stats:?}");
    }

    #[test]
    fn exclusive_jobs_of_one_entity_never_overlap_on_the_worker_pool() {
        let config = test_config()
            .with_worker_pool(4, 8)
            .with_max_jobs_per_acquisition(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (current, peak) = (in_flight.clone(), max_in_flight.clone());
        let (engine, store) = engine_with(config, move |b| {
            b.handler("entity.step", move |_, _| {
                let now_running = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now_running, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .handler("free", |_, _| {
                thread::sleep(Duration::from_millis(30));
                Ok(())
            })
        });

        let entity = EntityId::new();
        let executor = engine.command_executor();
        let mut ids: Vec<EntityId> = (0..6)
            .map(|_| insert_job(executor, Job::new("entity.step", json!({})).exclusive_for(entity)))
            .collect();
        ids.extend((0..4).map(|_| insert_job(executor, Job::new("free", json!({})))));

        let handle = engine.start_job_executor().unwrap();
        let done = wait_until(Duration::from_secs(10), || handle.stats().jobs_succeeded == 10);
        let stats = handle.stats();
        handle.shutdown();

        assert!(done, "stats: {stats:?}");
        assert!(stats.acquisition_cycles >= 2, "stats: {stats:?}");
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| stored_job(&store, *id).is_none()));
    }

    // ---- batches ----

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("target-{i}")).collect()
    }

    #[test]
    fn seed_job_fans_out_a_thousand_targets_into_ten_work_jobs() {
        let (engine, store) = engine_with(test_config(), |b| {
            b.batch_handler(FnBatchHandler::new("reindex", |_, _, _| Ok(())))
        });
        let batch = engine
            .create_batch(
                None,
                CreateBatch::new("reindex", BatchConfiguration::new(targets(1000), json!({})))
                    .with_sizes(100, 100),
            )
            .unwrap();
        assert_eq!(batch.total_jobs, 10);

        let management = engine.management();
        let seed_jobs = management
            .job_query(JobQuery::new().job_type(SEED_JOB_TYPE))
            .unwrap();
        assert_eq!(seed_jobs.len(), 1);
        management.execute_job(seed_jobs[0].id).unwrap();

        let work_jobs = management
            .job_query(JobQuery::new().job_type(WORK_JOB_TYPE))
            .unwrap();
        assert_eq!(work_jobs.len(), 10);
        assert!(stored_job(&store, seed_jobs[0].id).is_none());
        assert!(
            management
                .job_query(JobQuery::new().job_type(SEED_JOB_TYPE))
                .unwrap()
                .is_empty()
        );

        let stats = management.batch_statistics(batch.id).unwrap();
        assert_eq!(stats.jobs_created, 10);
        assert_eq!(stats.remaining_jobs, 10);
        assert!(!stats.completed);
    }

    #[test]
    fn batch_runs_to_completion_and_records_failed_invocations() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let (engine, _) = engine_with(test_config(), move |b| {
            b.batch_handler(FnBatchHandler::new("notify", move |target, payload, _| {
                recorder.lock().unwrap().push(target.to_string());
                if target == "target-3" {
                    return Err(JobError::retryable(format!("{} refused", payload["channel"])));
                }
                Ok(())
            }))
        });
        let batch = engine
            .create_batch(
                Some(&operator()),
                CreateBatch::new(
                    "notify",
                    BatchConfiguration::new(targets(5), json!({"channel": "mail"})),
                )
                .with_sizes(2, 1),
            )
            .unwrap();

        let handle = engine.start_job_executor().unwrap();
        let management = engine.management();
        let completed = wait_until(Duration::from_secs(10), || {
            management.batch(batch.id).unwrap().is_some_and(|b| b.is_completed())
        });
        handle.shutdown();

        assert!(completed);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, targets(5));

        let incidents = management
            .incident_query(IncidentQuery::new().batch(batch.id))
            .unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_type, IncidentType::FailedBatchInvocation);
        assert!(incidents[0].message.contains("target-3"));

        let stats = management.batch_statistics(batch.id).unwrap();
        assert_eq!(stats.remaining_jobs, 0);
        assert_eq!(stats.incidents, 1);
        assert!(stats.completed);
    }

    #[test]
    fn create_batch_rejects_unknown_batch_type() {
        let (engine, _) = engine_with(test_config(), |b| b);
        let error = engine
            .create_batch(None, CreateBatch::new("missing", BatchConfiguration::default()))
            .unwrap_err();
        assert!(matches!(error, EngineError::Validation(_)));
    }

    #[test]
    fn suspended_batch_jobs_are_not_acquired() {
        let (engine, _) = engine_with(test_config(), |b| {
            b.batch_handler(FnBatchHandler::new("reindex", |_, _, _| Ok(())))
        });
        let batch = engine
            .create_batch(
                None,
                CreateBatch::new("reindex", BatchConfiguration::new(targets(3), json!({}))),
            )
            .unwrap();
        let management = engine.management();
        management.suspend_batch(batch.id).unwrap();

        let acquired = engine
            .command_executor()
            .execute(AcquireJobs::new("node-a", Duration::from_secs(60), 10))
            .unwrap();
        assert!(acquired.is_empty());
        assert!(management.batch(batch.id).unwrap().unwrap().suspended);

        management.activate_batch(batch.id).unwrap();
        let acquired = engine
            .command_executor()
            .execute(AcquireJobs::new("node-a", Duration::from_secs(60), 10))
            .unwrap();
        assert_eq!(acquired.job_count(), 1);
    }

    #[test]
    fn cascading_batch_delete_removes_jobs_and_definitions() {
        let (engine, store) = engine_with(test_config(), |b| {
            b.batch_handler(FnBatchHandler::new("reindex", |_, _, _| Ok(())))
        });
        let batch = engine
            .create_batch(
                None,
                CreateBatch::new("reindex", BatchConfiguration::new(targets(3), json!({}))),
            )
            .unwrap();

        engine.management().delete_batch(batch.id, true).unwrap();

        assert_eq!(store.count(&RecordQuery::of::<Batch>()).unwrap(), 0);
        assert_eq!(store.count(&RecordQuery::of::<Job>()).unwrap(), 0);
        assert_eq!(store.count(&RecordQuery::new("job_definition")).unwrap(), 0);
    }

    // ---- management ----

    #[test]
    fn operator_retry_reset_resolves_the_incident() {
        let (engine, store) = engine_with(test_config(), |b| {
            b.handler("broken", |_, _| Err(JobError::fatal("bad input")))
        });
        let job_id = insert_job(engine.command_executor(), Job::new("broken", json!({})));
        let management = engine.management().with_principal(operator());

        assert!(management.execute_job(job_id).is_err());
        assert_eq!(stored_job(&store, job_id).unwrap().retries, 0);
        assert_eq!(
            management
                .job_query(JobQuery::new().exhausted(true).with_exception())
                .unwrap()
                .len(),
            1
        );

        management.set_job_retries(job_id, 2).unwrap();
        let job = stored_job(&store, job_id).unwrap();
        assert_eq!(job.retries, 2);
        assert!(job.is_acquirable(Utc::now()));
        assert!(management.incident_query(IncidentQuery::new()).unwrap().is_empty());
    }

    #[test]
    fn viewer_cannot_change_jobs() {
        let (engine, _) = engine_with(test_config(), |b| b);
        let job_id = insert_job(engine.command_executor(), Job::new("t", json!({})));
        let management = engine.management().with_principal(viewer());

        assert_eq!(management.job_query(JobQuery::new()).unwrap().len(), 1);
        let error = management.set_job_priority(job_id, 10).unwrap_err();
        assert!(matches!(error, EngineError::Authorization(AuthzError::Forbidden(_))));
    }

    #[test]
    fn tenant_scoped_principal_sees_only_its_tenant() {
        let (engine, _) = engine_with(test_config(), |b| b);
        let (acme, globex) = (TenantId::new(), TenantId::new());
        let executor = engine.command_executor();
        let own = insert_job(executor, Job::new("t", json!({})).with_tenant(Some(acme)));
        let foreign = insert_job(executor, Job::new("t", json!({})).with_tenant(Some(globex)));

        let principal = Principal::for_tenant(PrincipalId::new(), acme, vec![Role::OPERATOR]);
        let management = engine.management().with_principal(principal);

        let visible: Vec<_> = management
            .job_query(JobQuery::new())
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(visible, vec![own]);

        let error = management.suspend_job(foreign).unwrap_err();
        assert!(matches!(error, EngineError::Authorization(AuthzError::TenantForbidden)));
    }

    // ---- transaction hooks and nesting ----

    #[test]
    fn committing_listener_can_veto() {
        let (engine, store) = engine_with(test_config(), |b| b);
        let result = engine.command_executor().execute_fn("vetoed", |ctx| {
            ctx.unit_of_work().register_insert(Job::new("t", json!({})));
            ctx.add_listener(TransactionPhase::Committing, |_| {
                Err(EngineError::validation("not today"))
            });
            Ok(())
        });

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(store.count(&RecordQuery::of::<Job>()).unwrap(), 0);
    }

    #[test]
    fn committing_listener_can_enqueue_more_work() {
        let (engine, store) = engine_with(test_config(), |b| b);
        engine
            .command_executor()
            .execute_fn("with_follow_up", |ctx| {
                ctx.unit_of_work().register_insert(Job::new("first", json!({})));
                ctx.add_listener(TransactionPhase::Committing, |ctx| {
                    ctx.unit_of_work().register_insert(Job::new("second", json!({})));
                    Ok(())
                });
                Ok(())
            })
            .unwrap();

        assert_eq!(store.count(&RecordQuery::of::<Job>()).unwrap(), 2);
    }

    #[test]
    fn late_phase_listener_errors_are_not_propagated() {
        let (engine, _) = engine_with(test_config(), |b| b);
        let rolled_back = Arc::new(AtomicUsize::new(0));

        let committed = engine.command_executor().execute_fn("committed", |ctx| {
            ctx.add_listener(TransactionPhase::Committed, |_| {
                Err(EngineError::Internal("listener broke".into()))
            });
            Ok(7)
        });
        assert_eq!(committed.unwrap(), 7);

        let counter = rolled_back.clone();
        let failed: Result<(), _> = engine.command_executor().execute_fn("failed", move |ctx| {
            ctx.add_listener(TransactionPhase::RolledBack, move |ctx| {
                assert!(matches!(ctx.rollback_cause(), Some(EngineError::NotFound(_))));
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Internal("listener broke".into()))
            });
            Err(EngineError::not_found("thing"))
        });
        assert!(matches!(failed, Err(EngineError::NotFound(_))));
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn requires_new_commits_independently_of_the_caller() {
        let (engine, store) = engine_with(test_config(), |b| b);
        let inner = Job::new("inner", json!({}));
        let outer = Job::new("outer", json!({}));
        let (inner_id, outer_id) = (inner.id, outer.id);

        let result: Result<(), _> = engine.command_executor().execute_fn("outer", move |ctx| {
            ctx.unit_of_work().register_insert(outer);
            ctx.requires_new(crate::interceptor::FnOperation::new("inner", move |ctx| {
                ctx.unit_of_work().register_insert(inner);
                Ok(())
            }))?;
            Err(EngineError::validation("outer fails"))
        });

        assert!(result.is_err());
        assert!(stored_job(&store, inner_id).is_some());
        assert!(stored_job(&store, outer_id).is_none());
    }

    #[test]
    fn nested_execute_shares_the_callers_unit_of_work() {
        let (engine, store) = engine_with(test_config(), |b| b);
        let result: Result<(), _> = engine.command_executor().execute_fn("outer", |ctx| {
            ctx.execute(crate::interceptor::FnOperation::new("inner", |ctx| {
                ctx.unit_of_work().register_insert(Job::new("inner", json!({})));
                Ok(())
            }))?;
            assert!(ctx.unit_of_work().has_pending_changes()?);
            Err(EngineError::validation("outer fails"))
        });

        assert!(result.is_err());
        assert_eq!(store.count(&RecordQuery::of::<Job>()).unwrap(), 0);
    }

    struct CountingInterceptor(Arc<AtomicUsize>);

    impl Interceptor for CountingInterceptor {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn intercept(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<(), EngineError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.proceed(invocation)
        }
    }

    #[test]
    fn custom_interceptor_chain_runs_every_operation() {
        let count = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryEntityStore::new());
        let services = Arc::new(EngineServices::new(store.clone(), test_config()));
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(CountingInterceptor(count.clone())),
            Arc::new(ContextInterceptor),
            Arc::new(AuthorizationInterceptor),
            Arc::new(TransactionInterceptor),
        ];
        let executor = CommandExecutor::new(services, interceptors);

        insert_job(&executor, Job::new("t", json!({})));
        executor
            .execute(AcquireJobs::new("node-a", Duration::from_secs(60), 1))
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(store.count(&RecordQuery::of::<Job>()).unwrap(), 1);
    }

    #[test]
    fn system_invocations_skip_authorization() {
        let (engine, _) = engine_with(test_config(), |b| {
            b.batch_handler(FnBatchHandler::new("reindex", |_, _, _| Ok(())))
        });
        let create = || CreateBatch::new("reindex", BatchConfiguration::new(targets(1), json!({})));

        assert!(engine.create_batch(None, create()).is_ok());
        assert!(matches!(
            engine.create_batch(Some(&viewer()), create()),
            Err(EngineError::Authorization(_))
        ));
    }
}
