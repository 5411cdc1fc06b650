use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use tower::util::ServiceExt;
use wellcalc::{
    parse_timestamp, status_router, steps, EntityProgress, EntityProgressTracker, SchedulerMode,
    StatusSnapshot,
};

fn tracker() -> EntityProgressTracker {
    let start = parse_timestamp("2023-11-20T13:00:00.000Z").unwrap();
    let tracker = EntityProgressTracker::new(start);
    tracker.sync_entities(["w1", "w2"]);
    tracker.record_cursor("w1", start + steps(4));
    tracker.set_good_data_boundary("w1", start + steps(6));
    tracker.set_busy("w2", true);
    tracker
}

async fn get(uri: &str) -> (StatusCode, Vec<u8>) {
    let response = status_router(SchedulerMode::DataFound, tracker())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn status_lists_every_tracked_entity() {
    let (status, body) = get("/status").await;
    assert_eq!(status, StatusCode::OK);

    let snapshot: StatusSnapshot = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot.mode, "data_found");
    assert_eq!(snapshot.busy, 1);
    assert_eq!(snapshot.entities.len(), 2);
    assert!(snapshot.entities["w2"].busy);
}

#[tokio::test]
async fn entity_route_returns_progress() {
    let (status, body) = get("/status/w1").await;
    assert_eq!(status, StatusCode::OK);

    let progress: EntityProgress = serde_json::from_slice(&body).unwrap();
    let start = parse_timestamp("2023-11-20T13:00:00.000Z").unwrap();
    assert_eq!(progress.cursor, start + steps(4));
    assert_eq!(progress.good_data_boundary, start + steps(6));
    assert_eq!(progress.error_count, 0);
    assert!(!progress.busy);
}

#[tokio::test]
async fn unknown_entity_is_not_found() {
    let (status, body) = get("/status/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("unknown entity ghost"));
}
