// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! StreamReleases and CreateRelease integration tests.

mod common;

use common::{TestContext, first_response, next_response};
use gantry_controller::names::PageToken;
use gantry_controller::store::{ControllerStore, EventFilter, EventType};
use gantry_protocol::controller::rpc_request::Request;
use gantry_protocol::controller::rpc_response::Response;
use gantry_protocol::controller::{
    CreateReleaseRequest, Release, RpcRequest, StreamReleasesRequest,
};

fn stream_releases_request(req: StreamReleasesRequest) -> RpcRequest {
    RpcRequest {
        request: Some(Request::StreamReleases(req)),
    }
}

#[tokio::test]
async fn snapshot_pages_out_of_the_event_log() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    let _r1 = ctx.seed_release(&app.id, &["img:v1"]).await;
    let r2 = ctx.seed_release(&app.id, &["img:v2"]).await;
    let r3 = ctx.seed_release(&app.id, &["img:v3"]).await;

    let response = first_response(
        &ctx.client,
        &stream_releases_request(StreamReleasesRequest {
            page_size: 2,
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    let Response::Releases(page) = response else {
        panic!("unexpected response {response:?}");
    };
    assert!(page.page_complete);
    // Newest first.
    assert_eq!(
        page.releases.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        vec![
            format!("apps/{}/releases/{}", app.id, r3.id),
            format!("apps/{}/releases/{}", app.id, r2.id),
        ]
    );

    // The next-page token cursors off the head of the returned window.
    let events = ctx
        .store
        .list_events(
            &EventFilter {
                object_types: vec![EventType::Release],
                ..Default::default()
            },
            None,
            0,
        )
        .await
        .unwrap();
    let token = PageToken::parse(&page.next_page_token).unwrap();
    assert_eq!(token.before_id, Some(events[0].id));
    assert_eq!(token.size, 2);
}

#[tokio::test]
async fn live_tail_dedupes_against_the_snapshot() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;
    ctx.seed_release(&app.id, &["img:v1"]).await;
    ctx.seed_release(&app.id, &["img:v2"]).await;

    let mut stream = ctx
        .client
        .open_stream(&stream_releases_request(StreamReleasesRequest {
            page_size: 10,
            stream_creates: true,
            ..Default::default()
        }))
        .await
        .unwrap();

    let Response::Releases(snapshot) = next_response(&mut stream).await else {
        panic!("expected snapshot");
    };
    assert_eq!(snapshot.releases.len(), 2);

    // A release created after the snapshot appears exactly once, as a delta.
    let r3 = ctx.seed_release(&app.id, &["img:v3"]).await;
    let Response::Releases(delta) = next_response(&mut stream).await else {
        panic!("expected delta");
    };
    assert_eq!(delta.releases.len(), 1);
    assert_eq!(
        delta.releases[0].name,
        format!("apps/{}/releases/{}", app.id, r3.id)
    );
    common::assert_quiet(&mut stream, std::time::Duration::from_millis(100)).await;
}

#[tokio::test]
async fn name_filters_narrow_by_app_and_release() {
    let ctx = TestContext::new().await;
    let app1 = ctx.seed_app("one").await;
    let app2 = ctx.seed_app("two").await;
    let r1 = ctx.seed_release(&app1.id, &["img:v1"]).await;
    let _r2 = ctx.seed_release(&app2.id, &["img:v1"]).await;

    // App filter keeps only app1's releases.
    let response = first_response(
        &ctx.client,
        &stream_releases_request(StreamReleasesRequest {
            name_filters: vec![format!("apps/{}", app1.id)],
            page_size: 10,
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    let Response::Releases(page) = response else {
        panic!("expected releases");
    };
    assert_eq!(page.releases.len(), 1);
    assert_eq!(
        page.releases[0].name,
        format!("apps/{}/releases/{}", app1.id, r1.id)
    );

    // Release filter keeps exactly the named release.
    let response = first_response(
        &ctx.client,
        &stream_releases_request(StreamReleasesRequest {
            name_filters: vec![format!("apps/{}/releases/{}", app1.id, r1.id)],
            page_size: 10,
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    let Response::Releases(page) = response else {
        panic!("expected releases");
    };
    assert_eq!(page.releases.len(), 1);
    assert_eq!(
        page.releases[0].name,
        format!("apps/{}/releases/{}", app1.id, r1.id)
    );
}

#[tokio::test]
async fn create_release_returns_the_stored_record() {
    let ctx = TestContext::new().await;
    let app = ctx.seed_app("web").await;

    let response = ctx
        .client
        .unary(&RpcRequest {
            request: Some(Request::CreateRelease(CreateReleaseRequest {
                parent: format!("apps/{}", app.id),
                release: Some(Release {
                    artifacts: vec!["img:v1".to_string()],
                    env: [("LOG_LEVEL".to_string(), "debug".to_string())].into(),
                    process_types: vec!["web".to_string()],
                    ..Default::default()
                }),
            })),
        })
        .await
        .unwrap();

    let Some(Response::Release(release)) = response.response else {
        panic!("expected release");
    };
    assert!(release.name.starts_with(&format!("apps/{}/releases/", app.id)));
    assert_eq!(release.artifacts, vec!["img:v1".to_string()]);
    assert_eq!(
        release.env.get("LOG_LEVEL").map(String::as_str),
        Some("debug")
    );

    // The create landed in the event log.
    let events = ctx
        .store
        .list_events(
            &EventFilter {
                object_types: vec![EventType::Release],
                ..Default::default()
            },
            None,
            0,
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}
