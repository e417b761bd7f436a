// Redelivery, crash-and-replay and retry behavior across stages

mod common;

use bytes::Bytes;
use common::{detection, local, local_with, predictions, test_config, Failure, Local, ScriptedEndpoint};
use dripdrop_core::payloads::to_json;
use dripdrop_core::{
    CorrelationId, PersistenceRequest, PostId, ProcessingState, SegmentationRequest, Stage, UploadEvent,
};
use dripdrop_pipeline::{keys, queues};
use dripdrop_storage::{Catalog, CatalogStats, MessageQueue, RecordTable};

fn outfit() -> ScriptedEndpoint {
    ScriptedEndpoint::new(
        vec![
            detection([4.0, 4.0, 30.0, 60.0], 6, 0.9),
            detection([34.0, 4.0, 60.0, 40.0], 14, 0.6),
        ],
        vec![
            predictions(&[("denim", 0.9), ("blue", 0.7)]),
            predictions(&[("wool", 0.8), ("black", 0.5)]),
        ],
    )
}

async fn send<T: serde::Serialize>(local: &Local, queue: &str, message: &T) {
    let body = to_json(message).unwrap();
    local.stores.queue.send(queue, Bytes::from(body)).await.unwrap();
}

async fn run_one(local: &Local, path: &str) -> (CorrelationId, PostId, CatalogStats) {
    let post = local.upload(path).await;
    let id = local
        .pipeline
        .dispatcher()
        .dispatch(UploadEvent::new(path, Some(post)))
        .await
        .unwrap();
    local.pipeline.run_until_idle().await.unwrap();
    let stats = local.stores.catalog.stats().await.unwrap();
    (id, post, stats)
}

#[tokio::test]
async fn test_late_segmentation_copy_is_a_no_op() {
    let local = local(outfit());
    let (id, post, before) = run_one(&local, "images/look.jpg").await;
    assert_eq!(before.clothing_items, 2);

    let request = SegmentationRequest {
        correlation_id: id.clone(),
        image_path: "images/look.jpg".to_string(),
        post_id: Some(post),
    };
    send(&local, queues::SEGMENTATION, &request).await;
    let handled = local.pipeline.run_until_idle().await.unwrap();

    assert_eq!(handled, 1);
    assert_eq!(local.stores.catalog.stats().await.unwrap(), before);
    assert_eq!(local.endpoint.detect_calls(), 1);
    assert_eq!(local.pipeline.record(&id).await.unwrap().state, ProcessingState::Persisted);
}

#[tokio::test]
async fn test_duplicate_copies_in_flight_converge() {
    let local = local(outfit());
    let post = local.upload("images/look.jpg").await;
    let id = local
        .pipeline
        .dispatcher()
        .dispatch(UploadEvent::new("images/look.jpg", Some(post)))
        .await
        .unwrap();
    // at-least-once delivery: a second copy of the segmentation request
    let copy = SegmentationRequest {
        correlation_id: id.clone(),
        image_path: "images/look.jpg".to_string(),
        post_id: Some(post),
    };
    send(&local, queues::SEGMENTATION, &copy).await;

    local.pipeline.run_until_idle().await.unwrap();

    let stats = local.stores.catalog.stats().await.unwrap();
    assert_eq!(stats.clothing_items, 2);
    assert_eq!(stats.image_items, 2);
    assert_eq!(stats.item_tags, 4);
    assert_eq!(local.endpoint.detect_calls(), 1);
    assert_eq!(local.endpoint.classify_calls(), 1);
    for queue in queues::ALL {
        assert!(local.stores.queue.dead_letters(queue).await.unwrap().is_empty(), "{}", queue);
    }
}

#[tokio::test]
async fn test_persistence_replay_after_crash_writes_nothing_twice() {
    let local = local(outfit());
    let (id, post, before) = run_one(&local, "images/look.jpg").await;

    // crash between the catalog writes and the record update
    let mut record = local.stores.records.get(&id).await.unwrap().unwrap();
    record.state = ProcessingState::Merged;
    local.stores.records.put(record).await.unwrap();

    let request = PersistenceRequest {
        correlation_id: id.clone(),
        image_path: "images/look.jpg".to_string(),
        post_id: Some(post),
        merged_ref: keys::merged(&id),
    };
    send(&local, queues::PERSISTENCE, &request).await;
    local.pipeline.run_until_idle().await.unwrap();

    assert_eq!(local.stores.catalog.stats().await.unwrap(), before);
    assert_eq!(local.pipeline.record(&id).await.unwrap().state, ProcessingState::Persisted);
}

#[tokio::test]
async fn test_transient_classify_failure_is_retried() {
    let local = local(outfit().failing_call(0, Failure::Unavailable));
    let (id, _, stats) = run_one(&local, "images/look.jpg").await;

    assert_eq!(stats.clothing_items, 2);
    assert_eq!(local.endpoint.classify_calls(), 2);
    assert!(local
        .stores
        .queue
        .dead_letters(queues::CLASSIFICATION)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(local.pipeline.record(&id).await.unwrap().state, ProcessingState::Persisted);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_record() {
    let mut config = test_config();
    config.queues.max_receives = 3;
    let local = local_with(outfit().always_failing(Failure::Unavailable), config);
    let (id, post, stats) = run_one(&local, "images/look.jpg").await;

    assert_eq!(stats.clothing_items, 0);
    assert_eq!(local.endpoint.classify_calls(), 3);
    assert_eq!(
        local.stores.queue.dead_letters(queues::CLASSIFICATION).await.unwrap().len(),
        1
    );
    match local.pipeline.record(&id).await.unwrap().state {
        ProcessingState::Failed { stage, .. } => assert_eq!(stage, Stage::Classification),
        other => panic!("expected failed record, got {:?}", other),
    }
    let row = local.stores.catalog.find_post(post).await.unwrap().unwrap();
    assert_eq!(row.status, dripdrop_core::PostStatus::Private);
}
