//! Block scheduler integration tests over the in-memory store.
//!
//! Every test builds a fresh [`common::Harness`] with a stub engine so runs
//! finish in milliseconds. The real Lucas-Lehmer engine is exercised once on
//! a hand-seeded block of tiny exponents.
//!
//! ```bash
//! cargo test --test scheduler_tests
//! ```

mod common;

use mersenne_lab::db::{BlockStatus, BlockStore, UnitStatus, Verdict};
use mersenne_lab::engine::{progress_pct, LucasLehmer};
use mersenne_lab::events::{BlockBus, BlockSubscription, BusMessage, JobProgress};
use mersenne_lab::jobs::JobStatus;
use mersenne_lab::prom_metrics::Metrics;
use mersenne_lab::scheduler::{
    BlockScheduler, SchedulerConfig, SchedulerError, StartOutcome, StopOutcome,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Drain a subscription until the topic closes.
async fn collect(mut sub: BlockSubscription) -> Vec<BusMessage> {
    let mut out = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), sub.recv()).await {
            Ok(Some(message)) => out.push(message.as_ref().clone()),
            Ok(None) => return out,
            Err(_) => panic!("topic {} never closed", sub.topic()),
        }
    }
}

fn finished(messages: &[BusMessage]) -> &BusMessage {
    let last = messages.last().expect("no messages");
    assert!(matches!(last, BusMessage::Finished { .. }), "last message was {:?}", last);
    last
}

async fn unit_statuses(store: &dyn BlockStore, block_id: i64) -> Vec<(i64, UnitStatus)> {
    store
        .units_by_block(block_id)
        .await
        .unwrap()
        .into_iter()
        .map(|u| (u.p, u.status))
        .collect()
}

// == Cancellation ==============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_engine_leaves_every_unit_queued() {
    let engine = Arc::new(common::CancellingEngine::new());
    let h = common::harness(engine.clone());
    common::seed_block(h.store.as_ref(), 5, &[5_000_011, 5_000_077, 5_000_081]).await;

    let sub = h.bus.subscribe(5);
    let outcome = h.scheduler.start(5, 2).await.unwrap();
    assert_eq!(
        outcome,
        StartOutcome::Scheduled {
            scheduled: 3,
            block_id: 5,
            concurrency: 2
        }
    );

    let messages = collect(sub).await;
    common::wait_run(&h.scheduler, 5).await;

    match finished(&messages) {
        BusMessage::Finished { done, stopped, tested, .. } => {
            assert!(*done);
            assert_eq!(*stopped, Some(true));
            assert_eq!(*tested, 0);
        }
        _ => unreachable!(),
    }
    for (p, status) in unit_statuses(h.store.as_ref(), 5).await {
        assert_eq!(status, UnitStatus::Queued, "unit {} not rolled back", p);
    }
    assert!(engine.calls.load(Ordering::SeqCst) <= 2);

    let block = h.store.get_block(5).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::Idle);
    assert_eq!(block.tested_count, 0);
    assert!(h.scheduler.active_runs().is_empty());
}

#[tokio::test]
async fn stop_without_run_is_a_noop() {
    let h = common::harness(Arc::new(common::InstantEngine));
    let mut sub = h.bus.subscribe(9);

    assert_eq!(h.scheduler.stop(9), StopOutcome { ok: true, block_id: 9 });
    assert!(sub.try_recv().is_err());
    assert!(h.store.get_block(9).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_mid_run_keeps_remaining_units_queued() {
    let engine = Arc::new(common::GatedEngine::new());
    let h = common::harness(engine.clone());
    common::seed_block(h.store.as_ref(), 3, &[3_000_017, 3_000_029, 3_000_047, 3_000_061]).await;

    let sub = h.bus.subscribe(3);
    h.scheduler.start(3, 1).await.unwrap();
    engine.wait_entered(1).await;

    h.scheduler.stop(3);
    let messages = collect(sub).await;
    common::wait_run(&h.scheduler, 3).await;

    assert!(messages
        .iter()
        .any(|m| matches!(m, BusMessage::Stopped { stopped: true, .. })));
    match finished(&messages) {
        BusMessage::Finished { stopped, .. } => assert_eq!(*stopped, Some(true)),
        _ => unreachable!(),
    }
    assert_eq!(engine.entered.load(Ordering::SeqCst), 1);
    for (_, status) in unit_statuses(h.store.as_ref(), 3).await {
        assert_eq!(status, UnitStatus::Queued);
    }
    assert_eq!(h.metrics.units_reset.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unit_past_final_checkpoint_finishes_after_stop() {
    let engine = Arc::new(common::FinalCheckpointEngine::new());
    let h = common::harness(engine.clone());
    common::seed_block(h.store.as_ref(), 2, &[2_000_003, 2_000_029, 2_000_039]).await;

    let sub = h.bus.subscribe(2);
    h.scheduler.start(2, 1).await.unwrap();
    engine.wait_entered(1).await;

    h.scheduler.stop(2);
    engine.open();
    let messages = collect(sub).await;
    common::wait_run(&h.scheduler, 2).await;

    match finished(&messages) {
        BusMessage::Finished { stopped, tested, .. } => {
            assert_eq!(*stopped, Some(true));
            assert_eq!(*tested, 1);
        }
        _ => unreachable!(),
    }
    let statuses = unit_statuses(h.store.as_ref(), 2).await;
    assert_eq!(
        statuses,
        vec![
            (2_000_003, UnitStatus::Done),
            (2_000_029, UnitStatus::Queued),
            (2_000_039, UnitStatus::Queued),
        ]
    );
    assert_eq!(engine.entered.load(Ordering::SeqCst), 1);

    let block = h.store.get_block(2).await.unwrap().unwrap();
    assert_eq!(block.tested_count, 1);
    assert_eq!(block.status, BlockStatus::Idle);
    assert_eq!(h.metrics.units_reset.get(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_rollback_leaves_block_idle() {
    let store = Arc::new(common::ResetFailingStore::new());
    let scheduler = BlockScheduler::new(
        store.clone(),
        Arc::new(common::CancellingEngine::new()),
        Arc::new(BlockBus::new(64)),
        Arc::new(Metrics::new()),
        SchedulerConfig {
            engine_threads: 1,
            checkpoint_interval: 0,
        },
    )
    .unwrap();
    common::seed_block(store.as_ref(), 6, &[6_000_011]).await;

    let sub = scheduler.bus().subscribe(6);
    scheduler.start(6, 1).await.unwrap();
    let messages = collect(sub).await;
    common::wait_run(&scheduler, 6).await;

    // The unit could not be rolled back, so it is still marked running.
    assert_eq!(
        unit_statuses(store.as_ref(), 6).await,
        vec![(6_000_011, UnitStatus::Running)]
    );
    assert_eq!(store.units_unfinished(6).await.unwrap(), Vec::<i64>::new());
    let block = store.get_block(6).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::Idle);
    assert!(block.finished_at.is_none());
    match finished(&messages) {
        BusMessage::Finished { stopped, tested, .. } => {
            assert_eq!(*stopped, Some(true));
            assert_eq!(*tested, 0);
        }
        _ => unreachable!(),
    }
}

// == Completion ================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lucas_lehmer_run_records_verdicts() {
    let h = common::harness(Arc::new(LucasLehmer));
    common::seed_block(h.store.as_ref(), 0, &[2, 3, 5, 7, 11, 13]).await;

    let sub = h.bus.subscribe(0);
    h.scheduler.start(0, 3).await.unwrap();
    let messages = collect(sub).await;
    common::wait_run(&h.scheduler, 0).await;

    let block = h.store.get_block(0).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::Done);
    assert_eq!(block.tested_count, 6);
    assert_eq!(block.verified_count, 5);
    assert!(block.finished_at.is_some());

    let units = h.store.units_by_block(0).await.unwrap();
    for unit in &units {
        assert_eq!(unit.status, UnitStatus::Done);
        let expected = if unit.p == 11 { Verdict::Composite } else { Verdict::Prime };
        assert_eq!(unit.verdict, expected, "M{}", unit.p);
        assert!(unit.engine_info.as_deref().unwrap().contains("lucas-lehmer"));
    }

    match finished(&messages) {
        BusMessage::Finished { tested, total, stopped, .. } => {
            assert_eq!((*tested, *total), (6, 6));
            assert_eq!(*stopped, Some(false));
        }
        _ => unreachable!(),
    }
    assert_eq!(h.metrics.primes_found.get(), 5);
    assert_eq!(h.store.prime_count().await.unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_tests_in_ascending_order() {
    let h = common::harness(Arc::new(common::InstantEngine));
    common::seed_block(h.store.as_ref(), 0, &[13, 2, 7, 3, 11, 5]).await;

    let sub = h.bus.subscribe(0);
    h.scheduler.start(0, 1).await.unwrap();
    let messages = collect(sub).await;

    let order: Vec<i64> = messages
        .iter()
        .filter_map(|m| match m {
            BusMessage::Coverage { last_candidate, .. } => Some(*last_candidate),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![2, 3, 5, 7, 11, 13]);

    let tested: Vec<i64> = messages
        .iter()
        .filter_map(|m| match m {
            BusMessage::Coverage { tested, .. } => Some(*tested),
            _ => None,
        })
        .collect();
    assert_eq!(tested, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_messages_carry_percentages() {
    let h = common::harness(Arc::new(common::InstantEngine));
    common::seed_block(h.store.as_ref(), 0, &[31]).await;

    let sub = h.bus.subscribe(0);
    h.scheduler.start(0, 1).await.unwrap();
    let messages = collect(sub).await;

    let progress: Vec<(i64, u64)> = messages
        .iter()
        .filter_map(|m| match m {
            BusMessage::Progress { candidate, pct, .. } => Some((*candidate, *pct)),
            _ => None,
        })
        .collect();
    // One checkpoint at iteration p-3, the last of p-2 iterations.
    assert_eq!(progress, vec![(31, 100)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_block_reports_already_complete() {
    let h = common::harness(Arc::new(common::InstantEngine));
    common::seed_block(h.store.as_ref(), 0, &[2, 3]).await;

    h.scheduler.start(0, 1).await.unwrap();
    common::wait_run(&h.scheduler, 0).await;

    let sub = h.bus.subscribe(0);
    let outcome = h.scheduler.start(0, 4).await.unwrap();
    assert!(matches!(outcome, StartOutcome::AlreadyComplete { scheduled: 0, .. }));

    let messages = collect(sub).await;
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        BusMessage::Finished { tested, total, stopped, done, .. } => {
            assert_eq!((*tested, *total), (2, 2));
            assert!(*done);
            assert_eq!(*stopped, None);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.scheduler.active_runs().is_empty());
}

// == Failures ==================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_units_are_offered_again() {
    let h = common::harness(Arc::new(common::FailingEngine { failing: vec![11] }));
    common::seed_block(h.store.as_ref(), 0, &[2, 3, 5, 7, 11, 13]).await;

    h.scheduler.start(0, 2).await.unwrap();
    common::wait_run(&h.scheduler, 0).await;

    let units = h.store.units_by_block(0).await.unwrap();
    let failed = units.iter().find(|u| u.p == 11).unwrap();
    assert_eq!(failed.status, UnitStatus::Error);
    assert!(failed.error.as_deref().unwrap().contains("stub failure on 11"));
    let block = h.store.get_block(0).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::Idle);
    assert_eq!(block.tested_count, 5);
    assert_eq!(h.metrics.units_failed.get(), 1);

    // A second scheduler over the same store retries only the failed unit.
    let retry = BlockScheduler::new(
        Arc::clone(&h.store) as Arc<dyn BlockStore>,
        Arc::new(common::InstantEngine),
        Arc::clone(&h.bus),
        Arc::clone(&h.metrics),
        SchedulerConfig {
            engine_threads: 1,
            checkpoint_interval: 0,
        },
    )
    .unwrap();
    let outcome = retry.start(0, 1).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Scheduled { scheduled: 1, .. }));
    common::wait_run(&retry, 0).await;

    let block = h.store.get_block(0).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::Done);
    assert_eq!(block.tested_count, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_panic_marks_unit_error() {
    let h = common::harness(Arc::new(common::PanickingEngine));
    common::seed_block(h.store.as_ref(), 0, &[7]).await;

    h.scheduler.start(0, 1).await.unwrap();
    common::wait_run(&h.scheduler, 0).await;

    let unit = &h.store.units_by_block(0).await.unwrap()[0];
    assert_eq!(unit.status, UnitStatus::Error);
    assert!(unit.error.as_deref().unwrap().contains("residue overflow on 7"));
    assert_eq!(h.store.get_block(0).await.unwrap().unwrap().status, BlockStatus::Idle);
}

// == Admission =================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_start_conflicts_while_running() {
    let engine = Arc::new(common::GatedEngine::new());
    let h = common::harness(engine.clone());
    common::seed_block(h.store.as_ref(), 1, &[1_000_003, 1_000_033]).await;

    h.scheduler.start(1, 1).await.unwrap();
    engine.wait_entered(1).await;

    let err = h.scheduler.start(1, 1).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Conflict(1)));
    assert_eq!(h.scheduler.active_runs(), vec![1]);
    assert_eq!(h.store.get_block(1).await.unwrap().unwrap().status, BlockStatus::Running);

    engine.open();
    common::wait_run(&h.scheduler, 1).await;
    assert_eq!(h.store.get_block(1).await.unwrap().unwrap().status, BlockStatus::Done);
    assert!(h.scheduler.phase(1).is_none());
}

#[tokio::test]
async fn start_rejects_bad_arguments() {
    let h = common::harness(Arc::new(common::InstantEngine));

    for (block_id, concurrency) in [(-1, 1), (5_000, 1), (0, 0)] {
        let err = h.scheduler.start(block_id, concurrency).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)), "{} / {}", block_id, concurrency);
    }
    assert!(h.scheduler.active_runs().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn orphaned_running_units_resume() {
    let h = common::harness(Arc::new(common::InstantEngine));
    common::seed_block(h.store.as_ref(), 0, &[2, 3, 5]).await;
    h.store.unit_start(3).await.unwrap();

    let outcome = h.scheduler.start(0, 1).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Scheduled { scheduled: 3, .. }));
    common::wait_run(&h.scheduler, 0).await;

    for (_, status) in unit_statuses(h.store.as_ref(), 0).await {
        assert_eq!(status, UnitStatus::Done);
    }
}

// == Seeding ===================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_zero_seeds_all_primes_below_a_million() {
    let h = common::harness(Arc::new(common::InstantEngine));

    let block = h.scheduler.ensure_block(0).await.unwrap();
    assert_eq!((block.start_p, block.end_p_excl), (0, 1_000_000));
    assert_eq!(block.candidate_count, 78_498);
    assert_eq!(block.status, BlockStatus::Idle);

    let units = h.store.units_by_block(0).await.unwrap();
    assert_eq!(units.len(), 78_498);
    let head: Vec<i64> = units.iter().take(5).map(|u| u.p).collect();
    assert_eq!(head, vec![2, 3, 5, 7, 11]);
    assert_eq!(units.last().unwrap().p, 999_983);
    assert!(units.iter().all(|u| u.status == UnitStatus::Queued));

    // Seeding twice never duplicates or resets.
    let again = h.scheduler.ensure_block(0).await.unwrap();
    assert_eq!(again.candidate_count, 78_498);
    let inserted = h.store.seed_units(0, &[2, 3, 5]).await.unwrap();
    assert_eq!(inserted, 0);
    assert_eq!(h.store.units_by_block(0).await.unwrap().len(), 78_498);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_blocks_seeds_missing_ids() {
    let h = common::harness(Arc::new(common::InstantEngine));

    let blocks = h.scheduler.list_blocks(3).await.unwrap();
    let ids: Vec<i64> = blocks.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(blocks[1].start_p, 1_000_000);
    assert_eq!(blocks[1].candidate_count, 70_435);

    assert!(matches!(
        h.scheduler.list_blocks(0).await,
        Err(SchedulerError::Validation(_))
    ));
    assert!(matches!(
        h.scheduler.list_blocks(101).await,
        Err(SchedulerError::Validation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_concurrency_spawns_one_worker_per_unit() {
    let h = common::harness(Arc::new(common::InstantEngine));
    common::seed_block(h.store.as_ref(), 0, &[3, 7]).await;

    let sub = h.bus.subscribe(0);
    let outcome = h.scheduler.start(0, usize::MAX).await.unwrap();
    assert_eq!(
        outcome,
        StartOutcome::Scheduled {
            scheduled: 2,
            block_id: 0,
            concurrency: usize::MAX
        }
    );
    let messages = collect(sub).await;
    common::wait_run(&h.scheduler, 0).await;

    match finished(&messages) {
        BusMessage::Finished { tested, total, stopped, .. } => {
            assert_eq!((*tested, *total), (2, 2));
            assert_eq!(*stopped, Some(false));
        }
        _ => unreachable!(),
    }
    let block = h.store.get_block(0).await.unwrap().unwrap();
    assert_eq!(block.status, BlockStatus::Done);
}

// == Jobs ======================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_streams_checkpoints_then_records_result() {
    let engine = Arc::new(common::GatedEngine::new());
    let h = common::harness(engine.clone());

    let id = h.scheduler.submit_job(31, Some(1)).unwrap();
    let mut sub = h.scheduler.job_bus().subscribe(id);
    engine.wait_entered(1).await;
    assert_eq!(h.scheduler.job(&id).unwrap().status, JobStatus::Running);

    // The gated engine keeps checkpointing until opened.
    let first = tokio::time::timeout(Duration::from_secs(10), sub.recv())
        .await
        .unwrap()
        .unwrap();
    engine.open();

    let mut frames: Vec<JobProgress> = vec![first.as_ref().clone()];
    loop {
        match tokio::time::timeout(Duration::from_secs(10), sub.recv()).await {
            Ok(Some(message)) => frames.push(message.as_ref().clone()),
            Ok(None) => break,
            Err(_) => panic!("job topic never closed"),
        }
    }
    assert!(frames.windows(2).all(|w| w[0].iteration < w[1].iteration));
    for frame in &frames {
        assert_eq!(frame.digest, "00".repeat(32));
        assert_eq!(frame.pct, progress_pct(frame.iteration, 31));
    }

    let job = h.scheduler.job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Done);
    let result = job.result.unwrap();
    assert_eq!((result.p, result.iterations), (31, 29));
    assert!(result.is_prime && result.final_residue_is_zero);
    assert_eq!(result.engine_info, "stub:instant");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lucas_lehmer_job_rejects_composite() {
    let h = common::harness(Arc::new(LucasLehmer));
    let id = h.scheduler.submit_job(11, None).unwrap();
    for _ in 0..500 {
        if h.scheduler.job(&id).unwrap().status.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = h.scheduler.job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(!job.result.unwrap().is_prime);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_engine_panic_is_recorded() {
    let h = common::harness(Arc::new(common::PanickingEngine));
    let id = h.scheduler.submit_job(13, None).unwrap();
    let mut sub = h.scheduler.job_bus().subscribe(id);
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        while sub.recv().await.is_some() {}
    })
    .await;
    for _ in 0..500 {
        if h.scheduler.job(&id).unwrap().status.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = h.scheduler.job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error.unwrap().contains("residue overflow on 13"));
    assert!(job.result.is_none());
}

#[tokio::test]
async fn job_rejects_bad_arguments() {
    let h = common::harness(Arc::new(common::InstantEngine));
    assert!(matches!(
        h.scheduler.submit_job(1, None),
        Err(SchedulerError::Validation(_))
    ));
    assert!(matches!(
        h.scheduler.submit_job(7, Some(-1)),
        Err(SchedulerError::Validation(_))
    ));
}
