//! End-to-end session scenarios against the in-process mock cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use lamina_client::{ApplyError, FlushMode, LocatedTablet, Operation, Session, Table};
use lamina_data::Partition;
use lamina_errors::Error;

use common::{partition_key, test_table, MockCluster};

fn insert_op(table: &Arc<Table>, key: i32, val: Option<&str>) -> Operation {
    let mut op = Operation::insert(table);
    op.row_mut().set(0, key).unwrap();
    if let Some(val) = val {
        op.row_mut().set(1, val).unwrap();
    }
    op
}

fn session_over(cluster: &Arc<MockCluster>) -> Session {
    Session::new(cluster.clone(), cluster.clone())
}

#[tokio::test]
async fn simple_insert_in_sync_mode() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);

    let pending = session
        .apply(insert_op(&table, 1, Some("abc")))
        .expect("sync apply");
    let response = pending.await.unwrap();

    assert!(!response.has_row_error());
    assert!(response.write_timestamp() > 0);
    assert_eq!(response.tserver_uuid(), Some("ts-tablet-0"));

    let requests = cluster.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].tablet_id, "tablet-0");
    assert_eq!(requests[0].num_ops, 1);
    assert!(cluster.contains_row(1));
}

#[tokio::test]
async fn duplicate_rows_suppressed_when_ignored() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();
    session.set_ignore_duplicate_rows(true).unwrap();

    let first = session.apply(insert_op(&table, 7, None)).unwrap();
    let second = session.apply(insert_op(&table, 7, None)).unwrap();
    let responses = session.flush().await;

    assert_eq!(responses.len(), 2);
    assert!(!responses[0].has_row_error());
    assert!(!responses[1].has_row_error());
    assert!(!first.await.unwrap().has_row_error());
    assert!(!second.await.unwrap().has_row_error());
    assert_eq!(session.count_pending_errors(), 0);
}

#[tokio::test]
async fn duplicate_rows_surface_without_ignore() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    session.apply(insert_op(&table, 7, None)).unwrap();
    session.apply(insert_op(&table, 7, None)).unwrap();
    let responses = session.flush().await;

    assert!(!responses[0].has_row_error());
    let error = responses[1].row_error().expect("duplicate key error");
    assert!(error.status().is_already_present());
}

#[tokio::test]
async fn non_covered_range_fails_the_row_without_an_rpc() {
    let table = test_table();
    let cluster = MockCluster::with_tablets(
        table.clone(),
        vec![LocatedTablet::new(
            "tablet-0",
            Partition::new(partition_key(&table, 0), partition_key(&table, 100)),
            None,
        )],
    );
    let mut session = session_over(&cluster);
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    let pending = session.apply(insert_op(&table, 9999, None)).unwrap();
    let responses = session.flush().await;

    assert_eq!(cluster.request_count(), 0);
    assert_eq!(responses.len(), 1);
    let error = responses[0].row_error().expect("non-covered range error");
    assert!(error.status().is_not_found());
    assert!(pending.await.unwrap().has_row_error());
    // Row-level errors only join the collector in background mode.
    assert_eq!(session.count_pending_errors(), 0);
}

#[tokio::test]
async fn non_covered_range_joins_the_collector_in_background_mode() {
    let table = test_table();
    let cluster = MockCluster::with_tablets(
        table.clone(),
        vec![LocatedTablet::new(
            "tablet-0",
            Partition::new(partition_key(&table, 0), partition_key(&table, 100)),
            None,
        )],
    );
    let mut session = session_over(&cluster);
    session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap();

    session.apply(insert_op(&table, 9999, None)).unwrap();
    session.flush().await;

    assert_eq!(session.count_pending_errors(), 1);
    let (errors, overflowed) = session.get_pending_errors();
    assert!(!overflowed);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].status().is_not_found());
    assert_eq!(session.count_pending_errors(), 0);
}

#[tokio::test(start_paused = true)]
async fn throttle_when_both_buffers_are_flushing() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    cluster.set_send_delay(Duration::from_millis(50));
    let mut session = session_over(&cluster);
    session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap();
    session.set_mutation_buffer_space(2).unwrap();
    session.set_mutation_buffer_low_watermark(1.0).unwrap();

    session.apply(insert_op(&table, 0, None)).unwrap();
    let first_flush = session.flush();
    session.apply(insert_op(&table, 1, None)).unwrap();
    let second_flush = session.flush();

    // Both buffers are now flushing; admission must shed the producer.
    let err = session
        .apply(insert_op(&table, 2, Some("v")))
        .expect_err("both buffers flushing");
    assert!(matches!(err, ApplyError::Throttled { .. }));
    assert!(err.status().is_service_unavailable());
    let notification = err.notification().unwrap();
    let mut op = err.into_operation();

    // The rejected row comes back unfrozen and unbuffered.
    op.row_mut().set(1, "retried").unwrap();

    // The carried notification resolves once a buffer generation completes.
    notification.await;
    let pending = loop {
        match session.apply(op) {
            Ok(pending) => break pending,
            Err(err) => {
                let notification = err.notification().expect("only throttling is expected here");
                op = err.into_operation();
                notification.await;
            }
        }
    };

    first_flush.await;
    second_flush.await;
    session.flush().await;
    assert!(!pending.await.unwrap().has_row_error());
    assert_eq!(cluster.request_count(), 3);
    assert!(cluster.contains_row(2));
}

#[tokio::test(start_paused = true)]
async fn manual_flush_supersedes_the_scheduled_flush() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);
    session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap();
    assert_eq!(session.flush_interval(), Duration::from_millis(1000));

    session.apply(insert_op(&table, 0, None)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.apply(insert_op(&table, 1, None)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let responses = session.flush().await;
    assert_eq!(responses.len(), 2);
    assert_eq!(cluster.request_count(), 1);

    // The timer armed at the first apply fires and must find its buffer
    // gone; no second, empty flush may happen.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cluster.request_count(), 1);
    assert!(!session.has_pending_operations());
}

#[tokio::test(start_paused = true)]
async fn background_flush_fires_after_the_interval() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);
    session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap();

    let pending = session.apply(insert_op(&table, 5, None)).unwrap();
    assert_eq!(cluster.request_count(), 0);
    assert!(session.has_pending_operations());

    // Resolves once the scheduled flush has run.
    let response = pending.await.unwrap();
    assert!(!response.has_row_error());
    assert_eq!(cluster.request_count(), 1);
    assert!(!session.has_pending_operations());
}

#[tokio::test]
async fn responses_preserve_apply_order_across_tablets() {
    let table = test_table();
    let cluster = MockCluster::with_tablets(
        table.clone(),
        vec![
            LocatedTablet::new(
                "tablet-a",
                Partition::new(Vec::new(), partition_key(&table, 50)),
                None,
            ),
            LocatedTablet::new(
                "tablet-b",
                Partition::new(partition_key(&table, 50), Vec::new()),
                None,
            ),
        ],
    );
    let mut session = session_over(&cluster);
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    let high = session.apply(insert_op(&table, 60, None)).unwrap();
    let low = session.apply(insert_op(&table, 10, None)).unwrap();
    let responses = session.flush().await;

    // Two parallel RPCs, one per tablet.
    assert_eq!(cluster.request_count(), 2);
    // The flattened list preserves apply order regardless of RPC completion
    // order.
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].tserver_uuid(), Some("ts-tablet-b"));
    assert_eq!(responses[1].tserver_uuid(), Some("ts-tablet-a"));
    assert!(!high.await.unwrap().has_row_error());
    assert!(!low.await.unwrap().has_row_error());
}

#[tokio::test]
async fn buffer_space_of_one_flushes_every_apply() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);
    session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap();
    session.set_mutation_buffer_space(1).unwrap();

    for key in 0..3 {
        let pending = session.apply(insert_op(&table, key, None)).unwrap();
        assert!(!pending.await.unwrap().has_row_error());
    }
    assert_eq!(cluster.request_count(), 3);
    for request in cluster.requests() {
        assert_eq!(request.num_ops, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn full_watermark_disables_early_throttling() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    cluster.set_send_delay(Duration::from_millis(100));
    let mut session = session_over(&cluster);
    session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap();
    session.set_mutation_buffer_space(4).unwrap();
    session.set_mutation_buffer_low_watermark(1.0).unwrap();

    // Eight straight applies: four fill and rotate the first buffer, four
    // fill the second while the first is still flushing. None may throttle.
    let mut pendings = Vec::new();
    for key in 0..8 {
        pendings.push(session.apply(insert_op(&table, key, None)).unwrap());
    }
    session.flush().await;
    for pending in pendings {
        assert!(!pending.await.unwrap().has_row_error());
    }
}

#[tokio::test(start_paused = true)]
async fn zero_watermark_arms_probabilistic_backpressure() {
    for _ in 0..3 {
        let table = test_table();
        let cluster = MockCluster::single_tablet(table.clone());
        cluster.set_send_delay(Duration::from_millis(100));
        let mut session = session_over(&cluster);
        session
            .set_flush_mode(FlushMode::AutoFlushBackground)
            .unwrap();
        session.set_mutation_buffer_space(8).unwrap();
        session.set_mutation_buffer_low_watermark(0.0).unwrap();

        // The first eight applies fill and rotate buffer one without arming
        // the early-flush path (a spare buffer exists). From then on every
        // apply draws against the zero watermark; the expected shed rate
        // makes sixteen straight successes astronomically unlikely.
        let mut pendings = Vec::new();
        let mut throttled = false;
        for key in 0..16 {
            match session.apply(insert_op(&table, key, None)) {
                Ok(pending) => pendings.push(pending),
                Err(err) => {
                    assert!(matches!(err, ApplyError::Throttled { .. }));
                    throttled = true;
                    break;
                }
            }
        }

        session.flush().await;
        for pending in pendings {
            assert!(!pending.await.unwrap().has_row_error());
        }
        if throttled {
            return;
        }
    }
    panic!("probabilistic backpressure never triggered in three rounds");
}

#[tokio::test]
async fn manual_flush_buffer_overflow_is_a_programmer_error() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();
    session.set_mutation_buffer_space(2).unwrap();

    session.apply(insert_op(&table, 0, None)).unwrap();
    session.apply(insert_op(&table, 1, None)).unwrap();
    let err = session
        .apply(insert_op(&table, 2, None))
        .expect_err("buffer is at capacity");
    assert!(matches!(err, ApplyError::Rejected { .. }));
    assert!(matches!(err.status(), Error::IllegalState(_)));

    session.flush().await;
    session.apply(err.into_operation()).unwrap();
    let responses = session.flush().await;
    assert_eq!(responses.len(), 1);
}

#[tokio::test]
async fn failed_rpc_synthesizes_row_errors_for_the_batch() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    cluster.fail_sends(Error::Network("connection reset by peer".into()));
    let mut session = session_over(&cluster);
    session
        .set_flush_mode(FlushMode::AutoFlushBackground)
        .unwrap();

    let first = session.apply(insert_op(&table, 0, None)).unwrap();
    let second = session.apply(insert_op(&table, 1, None)).unwrap();
    let responses = session.flush().await;

    assert_eq!(responses.len(), 2);
    for response in &responses {
        let error = response.row_error().expect("batch-wide failure");
        assert!(matches!(error.status(), Error::Network(_)));
        assert!(error.operation().row().is_frozen());
    }
    assert!(first.await.unwrap().has_row_error());
    assert!(second.await.unwrap().has_row_error());

    // Batch-level failures land in the collector in background mode.
    assert_eq!(session.count_pending_errors(), 2);
    let (errors, overflowed) = session.get_pending_errors();
    assert!(!overflowed);

    // The failed operations can be resubmitted once the fault clears.
    cluster.clear_send_failure();
    let mut pendings = Vec::new();
    for error in errors {
        pendings.push(session.apply(error.into_operation()).unwrap());
    }
    session.flush().await;
    for pending in pendings {
        assert!(!pending.await.unwrap().has_row_error());
    }
    assert!(cluster.contains_row(0));
    assert!(cluster.contains_row(1));
}

#[tokio::test]
async fn write_timestamps_propagate_to_subsequent_requests() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    session.apply(insert_op(&table, 0, None)).unwrap();
    let responses = session.flush().await;
    let first_timestamp = responses[0].write_timestamp();
    assert!(first_timestamp > 0);
    assert_eq!(cluster.last_propagated(), Some(first_timestamp));

    session.apply(insert_op(&table, 1, None)).unwrap();
    session.flush().await;

    let requests = cluster.requests();
    assert_eq!(requests[0].propagated_timestamp, None);
    assert_eq!(requests[1].propagated_timestamp, Some(first_timestamp));
    assert!(cluster.last_propagated().unwrap() > first_timestamp);
}

#[tokio::test]
async fn flush_of_an_idle_session_is_immediate_and_empty() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table);
    let session = session_over(&cluster);

    let responses = session.flush().await;
    assert!(responses.is_empty());
    assert_eq!(cluster.request_count(), 0);

    let responses = session.close().await;
    assert!(responses.is_empty());
    let responses = session.close().await;
    assert!(responses.is_empty());
}

#[tokio::test]
async fn updates_and_deletes_of_missing_rows_fail_per_row() {
    let table = test_table();
    let cluster = MockCluster::single_tablet(table.clone());
    let mut session = session_over(&cluster);
    session.set_flush_mode(FlushMode::ManualFlush).unwrap();

    let mut update = Operation::update(&table);
    update.row_mut().set(0, 404i32).unwrap();
    update.row_mut().set(1, "nope").unwrap();
    let mut delete = Operation::delete(&table);
    delete.row_mut().set(0, 404i32).unwrap();

    session.apply(update).unwrap();
    session.apply(delete).unwrap();
    let responses = session.flush().await;

    assert!(responses[0].row_error().unwrap().status().is_not_found());
    assert!(responses[1].row_error().unwrap().status().is_not_found());

    // Upsert creates the row; a later update then succeeds.
    let mut upsert = Operation::upsert(&table);
    upsert.row_mut().set(0, 404i32).unwrap();
    session.apply(upsert).unwrap();
    let mut update = Operation::update(&table);
    update.row_mut().set(0, 404i32).unwrap();
    update.row_mut().set(1, "now it exists").unwrap();
    session.apply(update).unwrap();
    let responses = session.flush().await;
    assert!(!responses[0].has_row_error());
    assert!(!responses[1].has_row_error());
}
