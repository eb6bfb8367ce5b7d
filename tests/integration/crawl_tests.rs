//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock HTTP servers and test
//! the full crawl cycle end-to-end.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use vodsweep::config::{
    parse_config, CollectRule, MergeConfig, RetryConfig, ScanConfig, UserAgentConfig,
};
use vodsweep::crawler::cursor::{encode_r, LinkCursor, PageNumberCursor, TokenCursor};
use vodsweep::crawler::{
    build_http_client, run_job, Controls, CrawlEngine, EndpointTable, EngineSettings,
    IdRangeSource, JobMode, JobOptions, MergeStrategy, PageHandler, PageRequest, RateLimiter,
    RetryingFetcher, StreamListSource, StreamSpec,
};
use vodsweep::state::{CrawlPhase, CrawlState, StreamPosition};
use vodsweep::storage::GzipFileStore;
use vodsweep::FetchError;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Match, Mock, MockServer, Request, Respond, ResponseTemplate};

/// Matches requests that do not carry the named query parameter
struct WithoutParam(&'static str);

impl Match for WithoutParam {
    fn matches(&self, request: &Request) -> bool {
        !request.url.query_pairs().any(|(name, _)| name == self.0)
    }
}

/// Answers an ID-batch request with one video per requested ID
struct EchoIds;

impl Respond for EchoIds {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let videos: Vec<Value> = request
            .url
            .query_pairs()
            .filter(|(name, _)| name == "id")
            .map(|(_, id)| json!({"id": id, "owner": {"id": format!("c{}", id)}}))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "videos": videos }))
    }
}

/// Records new item IDs per page and the final merged runs of each stream
#[derive(Default)]
struct Recorder {
    seen: Vec<String>,
    merged_runs: Vec<Value>,
}

impl PageHandler for Recorder {
    fn on_page(&mut self, _: &mut CrawlState, _: &str, items: &[Value]) {
        self.seen.extend(ids_of(items));
    }

    fn on_stream_end(&mut self, _: &mut CrawlState, _: &str, merge: &dyn MergeStrategy) {
        self.merged_runs = merge.merged("runs").into_iter().cloned().collect();
    }
}

fn user_agent() -> UserAgentConfig {
    UserAgentConfig {
        crawler_name: "TestSweep".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: "https://example.com/contact".to_string(),
        contact_email: "test@example.com".to_string(),
    }
}

fn fetcher(max_retries: u32) -> RetryingFetcher {
    let client = build_http_client(&user_agent(), Duration::from_secs(5)).unwrap();
    let endpoints = Arc::new(EndpointTable::new(vec![], Duration::from_millis(1)));
    let limiter = Arc::new(RateLimiter::from_table(&endpoints));
    let retry = RetryConfig {
        max_retries,
        transient_delay_ms: 5,
        rate_limited_delay_ms: 5,
        reset_floor_ms: 1,
    };
    RetryingFetcher::new(client, limiter, endpoints, retry)
}

fn settings() -> EngineSettings {
    EngineSettings {
        checkpoint_every_pages: 1,
        flush_interval: Duration::from_secs(60),
        progress_every_pages: 100,
    }
}

fn engine(max_retries: u32, controls: &Controls) -> CrawlEngine {
    CrawlEngine::new(fetcher(max_retries), settings(), controls)
}

fn get(server: &MockServer, route: &str) -> PageRequest {
    PageRequest::get(Url::parse(&format!("{}{}", server.uri(), route)).unwrap())
}

fn flat() -> MergeConfig {
    MergeConfig::Flat {
        field: "data".to_string(),
    }
}

fn link_page(ids: &[&str], next: Option<&str>) -> Value {
    let links: Vec<Value> = next
        .map(|uri| vec![json!({"rel": "next", "uri": uri})])
        .unwrap_or_default();
    json!({
        "data": ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
        "pagination": {"links": links},
    })
}

async fn mount_page(server: &MockServer, route: &str, body: Value, times: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(times)
        .mount(server)
        .await;
}

fn ids_of(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item["id"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_link_cursor_visits_pages_in_order() {
    let server = MockServer::start().await;
    mount_page(&server, "/a", link_page(&["1", "2"], Some("/b")), 1).await;
    mount_page(&server, "/b", link_page(&["3"], Some("/c")), 1).await;
    mount_page(&server, "/c", link_page(&["4", "5"], None), 1).await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("links", CrawlPhase::Discovery);
    let controls = Controls::new(2);

    let stream = StreamSpec::new("runs", get(&server, "/a"), Arc::new(LinkCursor), flat());
    let mut source = StreamListSource::new(vec![stream]);

    let mut seen = Vec::new();
    let mut handler = |_: &mut CrawlState, _: &str, items: &[Value]| seen.extend(ids_of(items));
    let report = engine(0, &controls)
        .run_with_handler(&mut source, &mut state, &store, &mut handler)
        .await
        .unwrap();

    assert_eq!(seen, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(report.pages, 3);
    assert_eq!(report.items, 5);
    assert_eq!(report.units_completed, 1);
    assert!(!report.cancelled);
    assert_eq!(state.save_count(), 3);
    assert_eq!(state.progress().resume_key(), Some("runs"));
}

#[tokio::test]
async fn test_stopper_halts_after_second_page() {
    let server = MockServer::start().await;
    mount_page(&server, "/p1", link_page(&["1"], Some("/p2")), 1).await;
    mount_page(&server, "/p2", link_page(&["2"], Some("/p3")), 1).await;
    mount_page(&server, "/p3", link_page(&["3"], Some("/p4")), 0).await;
    mount_page(&server, "/p4", link_page(&["4"], Some("/p5")), 0).await;
    mount_page(&server, "/p5", link_page(&["5"], None), 0).await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("stopper", CrawlPhase::Discovery);
    let controls = Controls::new(1);

    let pages = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pages);
    let stream = StreamSpec::new("runs", get(&server, "/p1"), Arc::new(LinkCursor), flat())
        .with_stopper(move |_| counter.fetch_add(1, Ordering::SeqCst) + 1 >= 2);
    let mut source = StreamListSource::new(vec![stream]);

    let report = engine(0, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.streams_stopped, 1);
    assert_eq!(pages.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stop_on_known_ends_incremental_stream() {
    let server = MockServer::start().await;
    mount_page(&server, "/new", link_page(&["9", "8"], Some("/older")), 1).await;
    mount_page(&server, "/older", link_page(&["7", "6"], Some("/oldest")), 1).await;
    mount_page(&server, "/oldest", link_page(&["5"], None), 0).await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("incremental", CrawlPhase::Discovery);
    state.insert("runs", "6");
    let controls = Controls::new(1);

    let stream = StreamSpec::new("runs", get(&server, "/new"), Arc::new(LinkCursor), flat())
        .with_collect(vec![CollectRule {
            set: "runs".to_string(),
            field: "id".to_string(),
        }])
        .with_stop_on_known(Some("runs".to_string()));
    let mut source = StreamListSource::new(vec![stream]);

    let report = engine(0, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.streams_stopped, 1);
    let runs = state.set("runs").unwrap();
    assert_eq!(runs.len(), 4);
    assert!(runs.contains("7"));
}

#[tokio::test]
async fn test_failed_stream_does_not_block_siblings() {
    let server = MockServer::start().await;
    mount_page(&server, "/first", link_page(&["a"], None), 1).await;
    mount_page(&server, "/third", link_page(&["c"], None), 1).await;
    Mock::given(method("GET"))
        .and(path("/second"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("fanout", CrawlPhase::Discovery);
    let controls = Controls::new(3);

    let streams = ["first", "second", "third"]
        .into_iter()
        .map(|name| {
            StreamSpec::new(
                name,
                get(&server, &format!("/{}", name)),
                Arc::new(LinkCursor),
                flat(),
            )
        })
        .collect();
    let mut source = StreamListSource::new(streams);

    let report = engine(2, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.streams_failed, 1);
    assert_eq!(report.units_completed, 3);
    assert!(state.failed().contains("second"));

    let reloaded = CrawlState::load(&store, "fanout", CrawlPhase::Discovery, &[]).unwrap();
    assert_eq!(reloaded.failed().len(), 1);
    assert_eq!(reloaded.progress().resume_key(), Some("third"));
}

#[tokio::test]
async fn test_retry_cap_then_exhausted() {
    let server = MockServer::start().await;
    Mock::given(path("/flaky"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(4)
        .mount(&server)
        .await;

    let err = fetcher(3).fetch(&get(&server, "/flaky")).await.unwrap_err();
    assert!(matches!(err, FetchError::Exhausted { attempts: 4, .. }));
}

#[tokio::test]
async fn test_rate_limited_request_recovers() {
    let server = MockServer::start().await;
    let reset = chrono::Utc::now().timestamp().to_string();
    Mock::given(path("/limited"))
        .respond_with(ResponseTemplate::new(429).insert_header("Ratelimit-Reset", reset.as_str()))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_page(&server, "/limited", json!({"data": [1]}), 1).await;

    let body = fetcher(3).fetch(&get(&server, "/limited")).await.unwrap();
    assert_eq!(body["data"], json!([1]));
}

#[tokio::test]
async fn test_not_found_ends_stream_without_failure() {
    let server = MockServer::start().await;
    mount_page(&server, "/videos", link_page(&["1"], Some("/videos-2")), 1).await;
    Mock::given(path("/videos-2"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("gone", CrawlPhase::Discovery);
    let controls = Controls::new(1);

    let stream = StreamSpec::new("videos", get(&server, "/videos"), Arc::new(LinkCursor), flat());
    let mut source = StreamListSource::new(vec![stream]);

    let report = engine(5, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(report.streams_failed, 0);
    assert_eq!(report.units_completed, 1);
    assert!(state.failed().is_empty());
}

#[tokio::test]
async fn test_resume_continues_from_saved_page() {
    let server = MockServer::start().await;
    mount_page(&server, "/page-1", link_page(&["1", "2"], Some("/page-2")), 0).await;
    mount_page(&server, "/page-2", link_page(&["2", "3"], Some("/page-3")), 1).await;
    mount_page(&server, "/page-3", link_page(&["4"], None), 1).await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let collect = vec![CollectRule {
        set: "runs".to_string(),
        field: "id".to_string(),
    }];
    let sets = vec!["runs".to_string()];

    {
        let mut interrupted = CrawlState::new("resume", CrawlPhase::Discovery);
        interrupted.progress_mut().dispatch(0, "runs");
        interrupted.insert("runs", "1");
        interrupted.insert("runs", "2");
        interrupted.set_stream_position(
            "runs",
            StreamPosition::open(get(&server, "/page-2")),
        );
        interrupted.save(&store).unwrap();
    }

    let mut state = CrawlState::load(&store, "resume", CrawlPhase::Discovery, &sets).unwrap();
    assert_eq!(state.open_streams(), 1);
    let controls = Controls::new(1);

    let stream = StreamSpec::new("runs", get(&server, "/page-1"), Arc::new(LinkCursor), flat())
        .with_collect(collect);
    let mut source = StreamListSource::new(vec![stream]);

    let report = engine(0, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(state.set("runs").unwrap().len(), 4);
    assert_eq!(state.open_streams(), 0);
    assert_eq!(state.progress().resume_key(), Some("runs"));
}

#[tokio::test]
async fn test_completed_units_are_skipped_on_resume() {
    let server = MockServer::start().await;
    mount_page(&server, "/one", link_page(&["1"], None), 0).await;
    mount_page(&server, "/two", link_page(&["2"], None), 1).await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    {
        let mut previous = CrawlState::new("skip", CrawlPhase::Discovery);
        previous.progress_mut().dispatch(0, "one");
        previous.progress_mut().complete(0);
        previous.save(&store).unwrap();
    }

    let mut state = CrawlState::load(&store, "skip", CrawlPhase::Discovery, &[]).unwrap();
    let controls = Controls::new(2);
    let streams = vec![
        StreamSpec::new("one", get(&server, "/one"), Arc::new(LinkCursor), flat()),
        StreamSpec::new("two", get(&server, "/two"), Arc::new(LinkCursor), flat()),
    ];
    let mut source = StreamListSource::new(streams);

    let report = engine(0, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.units_skipped, 1);
    assert_eq!(report.units_completed, 1);
    assert_eq!(state.progress().resume_key(), Some("two"));
}

#[tokio::test]
async fn test_page_number_merge_dedupes_by_id() {
    let server = MockServer::start().await;
    Mock::given(path("/v2/GetRuns"))
        .and(WithoutParam("_r"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runs": [{"id": "a", "time": 10}, {"id": "b", "time": 11}],
            "players": [{"id": "p1"}],
            "pagination": {"page": 1, "pages": 2},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut second = serde_json::Map::new();
    second.insert("page".to_string(), json!(2));
    Mock::given(path("/v2/GetRuns"))
        .and(query_param("_r", encode_r(&second).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runs": [{"id": "b", "time": 12}, {"id": "c", "time": 13}],
            "players": [{"id": "p1"}, {"id": "p2"}],
            "pagination": {"page": 2, "pages": 2},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("leaderboard", CrawlPhase::Discovery);
    let controls = Controls::new(1);

    let merge = MergeConfig::ById {
        fields: vec!["runs".to_string(), "players".to_string()],
        key: "id".to_string(),
    };
    let stream = StreamSpec::new(
        "runs",
        get(&server, "/v2/GetRuns"),
        Arc::new(PageNumberCursor),
        merge,
    );
    let mut source = StreamListSource::new(vec![stream]);

    let mut seen = Vec::new();
    let mut handler = |_: &mut CrawlState, _: &str, items: &[Value]| seen.extend(ids_of(items));
    let report = engine(0, &controls)
        .run_with_handler(&mut source, &mut state, &store, &mut handler)
        .await
        .unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(seen, vec!["a", "b", "p1", "c", "p2"]);
}

#[tokio::test]
async fn test_resumed_merge_does_not_repeat_earlier_items() {
    let server = MockServer::start().await;
    Mock::given(path("/v2/GetRuns"))
        .and(WithoutParam("_r"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runs": [{"id": "a", "time": 10}, {"id": "b", "time": 11}],
            "players": [{"id": "p1"}],
            "pagination": {"page": 1, "pages": 2},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut second = serde_json::Map::new();
    second.insert("page".to_string(), json!(2));
    Mock::given(path("/v2/GetRuns"))
        .and(query_param("_r", encode_r(&second).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runs": [{"id": "b", "time": 12}, {"id": "c", "time": 13}],
            "players": [{"id": "p1"}, {"id": "p2"}],
            "pagination": {"page": 2, "pages": 2},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let merge = MergeConfig::ById {
        fields: vec!["runs".to_string(), "players".to_string()],
        key: "id".to_string(),
    };
    let stream = || {
        StreamSpec::new(
            "runs",
            get(&server, "/v2/GetRuns"),
            Arc::new(PageNumberCursor),
            merge.clone(),
        )
    };

    // First run stops after page 1
    {
        let mut state = CrawlState::new("leaderboard", CrawlPhase::Discovery);
        let controls = Controls::new(1);
        let cancel = controls.cancel_token();
        let mut source = StreamListSource::new(vec![stream()]);
        let mut first = Vec::new();
        let mut handler = |_: &mut CrawlState, _: &str, items: &[Value]| {
            first.extend(ids_of(items));
            cancel.cancel();
        };
        let report = engine(0, &controls)
            .run_with_handler(&mut source, &mut state, &store, &mut handler)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(first, vec!["a", "b", "p1"]);
    }

    let mut state = CrawlState::load(&store, "leaderboard", CrawlPhase::Discovery, &[]).unwrap();
    assert_eq!(state.open_streams(), 1);
    let controls = Controls::new(1);
    let mut source = StreamListSource::new(vec![stream()]);
    let mut recorder = Recorder::default();
    let report = engine(0, &controls)
        .run_with_handler(&mut source, &mut state, &store, &mut recorder)
        .await
        .unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(recorder.seen, vec!["c", "p2"]);
    assert_eq!(
        recorder.merged_runs,
        vec![json!({"id": "b", "time": 12}), json!({"id": "c", "time": 13})]
    );
    assert_eq!(state.open_streams(), 0);
}

#[tokio::test]
async fn test_stream_end_exposes_merged_values() {
    let server = MockServer::start().await;
    Mock::given(path("/v2/GetRuns"))
        .and(WithoutParam("_r"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runs": [{"id": "a", "time": 10}, {"id": "b", "time": 11}],
            "pagination": {"page": 1, "pages": 2},
        })))
        .mount(&server)
        .await;
    let mut second = serde_json::Map::new();
    second.insert("page".to_string(), json!(2));
    Mock::given(path("/v2/GetRuns"))
        .and(query_param("_r", encode_r(&second).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runs": [{"id": "a", "time": 9}],
            "pagination": {"page": 2, "pages": 2},
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("merged", CrawlPhase::Discovery);
    let controls = Controls::new(1);
    let merge = MergeConfig::ById {
        fields: vec!["runs".to_string()],
        key: "id".to_string(),
    };
    let stream = StreamSpec::new(
        "runs",
        get(&server, "/v2/GetRuns"),
        Arc::new(PageNumberCursor),
        merge,
    );
    let mut source = StreamListSource::new(vec![stream]);

    let mut recorder = Recorder::default();
    engine(0, &controls)
        .run_with_handler(&mut source, &mut state, &store, &mut recorder)
        .await
        .unwrap();

    assert_eq!(recorder.seen, vec!["a", "b"]);
    assert_eq!(
        recorder.merged_runs,
        vec![json!({"id": "a", "time": 9}), json!({"id": "b", "time": 11})]
    );
}

#[tokio::test]
async fn test_token_cursor_follows_after_param() {
    let server = MockServer::start().await;
    Mock::given(path("/helix/videos"))
        .and(WithoutParam("after"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "v1"}],
            "pagination": {"cursor": "tok-1"},
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/helix/videos"))
        .and(query_param("after", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "v2"}],
            "pagination": {},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("twitch", CrawlPhase::Discovery);
    let controls = Controls::new(1);

    let stream = StreamSpec::new(
        "videos",
        get(&server, "/helix/videos?user_id=5"),
        Arc::new(TokenCursor),
        flat(),
    )
    .with_collect(vec![CollectRule {
        set: "videos".to_string(),
        field: "id".to_string(),
    }]);
    let mut source = StreamListSource::new(vec![stream]);

    let report = engine(0, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.pages, 2);
    let videos = state.set("videos").unwrap();
    assert!(videos.contains("v1"));
    assert!(videos.contains("v2"));
}

#[tokio::test]
async fn test_id_range_scan_records_marker() {
    let server = MockServer::start().await;
    Mock::given(path("/videos"))
        .respond_with(EchoIds)
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let scan = ScanConfig {
        ranges: vec!["1-5".to_string()],
        page_size: 2,
        url: format!("{}/videos", server.uri()),
        id_param: "id".to_string(),
        merge: MergeConfig::ById {
            fields: vec!["videos".to_string()],
            key: "id".to_string(),
        },
        collect: vec![CollectRule {
            set: "channels".to_string(),
            field: "owner.id".to_string(),
        }],
    };
    let sets = vec!["channels".to_string()];
    let controls = Controls::new(3);

    let mut state = CrawlState::new("scan", CrawlPhase::Scan);
    let mut source = IdRangeSource::from_config(&scan).unwrap();
    let report = engine(0, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.units_completed, 3);
    assert_eq!(report.items, 5);
    assert_eq!(state.progress().marker(), Some(5));
    assert_eq!(state.progress().resume_key(), Some("5-5"));
    assert_eq!(state.set("channels").unwrap().len(), 5);

    // A second run resumes past the marker and requests nothing
    let mut resumed = CrawlState::load(&store, "scan", CrawlPhase::Scan, &sets).unwrap();
    let mut source = IdRangeSource::from_config(&scan).unwrap();
    let report = engine(0, &controls)
        .run(&mut source, &mut resumed, &store)
        .await
        .unwrap();
    assert_eq!(report.pages, 0);
    assert_eq!(report.units_skipped, 3);
    assert!(resumed.set("channels").unwrap().contains("c3"));
}

#[tokio::test]
async fn test_shutdown_drains_and_keeps_position() {
    let server = MockServer::start().await;
    mount_page(&server, "/p1", link_page(&["1"], Some("/p2")), 1).await;
    mount_page(&server, "/p2", link_page(&["2"], None), 0).await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("drain", CrawlPhase::Discovery);
    let controls = Controls::new(1);
    let cancel = controls.cancel_token();

    let stream = StreamSpec::new("runs", get(&server, "/p1"), Arc::new(LinkCursor), flat());
    let mut source = StreamListSource::new(vec![stream]);

    let mut handler = |_: &mut CrawlState, _: &str, _: &[Value]| cancel.cancel();
    let report = engine(0, &controls)
        .run_with_handler(&mut source, &mut state, &store, &mut handler)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.pages, 1);

    let saved = CrawlState::load(&store, "drain", CrawlPhase::Discovery, &[]).unwrap();
    let expected = get(&server, "/p2");
    assert_eq!(
        saved.stream_position("runs"),
        Some(&StreamPosition::open(expected))
    );
    assert_eq!(saved.progress().resume_key(), None);
}

#[tokio::test]
async fn test_paused_crawl_resumes_on_new_limit() {
    let server = MockServer::start().await;
    mount_page(&server, "/only", link_page(&["1"], None), 1).await;

    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("paused", CrawlPhase::Discovery);
    let controls = Arc::new(Controls::new(0));

    let stream = StreamSpec::new("only", get(&server, "/only"), Arc::new(LinkCursor), flat());
    let mut source = StreamListSource::new(vec![stream]);

    let unpause = Arc::clone(&controls);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        unpause.handle_line("concurrency streams 2");
    });

    let report = engine(0, &controls)
        .run(&mut source, &mut state, &store)
        .await
        .unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(controls.concurrency(), 2);
}

#[tokio::test]
async fn test_pipeline_job_runs_discovery_then_entities() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/channels",
        json!({"data": [{"id": "10"}, {"id": "20"}]}),
        1,
    )
    .await;
    for channel in ["10", "20"] {
        mount_page(
            &server,
            &format!("/channels/{}/videos", channel),
            json!({"data": [{"id": format!("{}-a", channel)}, {"id": format!("{}-b", channel)}]}),
            1,
        )
        .await;
    }

    let dir = TempDir::new().unwrap();
    let config_text = format!(
        r#"
[crawler]
concurrency = 4
default-interval-ms = 1

[user-agent]
crawler-name = "TestSweep"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[retry]
max-retries = 0
transient-delay-ms = 5
rate-limited-delay-ms = 5
reset-floor-ms = 1

[output]
checkpoint-dir = "{dir}"
job = "pipeline"

[[stream]]
name = "channels"
url = "{base}/channels"
pagination = "single"
merge = {{ kind = "flat", field = "data" }}
collect = [{{ set = "channels", field = "id" }}]

[entities]
source-set = "channels"

[[entities.stream]]
name = "videos"
url = "{base}/channels/{{id}}/videos"
pagination = "single"
merge = {{ kind = "flat", field = "data" }}
collect = [{{ set = "videos", field = "id" }}]
"#,
        dir = dir.path().display(),
        base = server.uri()
    );
    let config = parse_config(&config_text).unwrap();
    let controls = Controls::new(4);
    let options = JobOptions {
        mode: JobMode::Pipeline,
        fresh: false,
    };

    let summary = run_job(&config, "hash-1", options, &controls).await.unwrap();
    assert!(!summary.cancelled);
    assert_eq!(summary.phases.len(), 2);
    assert_eq!(summary.phases[0].0, CrawlPhase::Discovery);
    assert_eq!(summary.phases[1].0, CrawlPhase::Entities);
    assert_eq!(summary.pages(), 3);

    let store = GzipFileStore::new(dir.path()).unwrap();
    let state = CrawlState::load(&store, "pipeline", CrawlPhase::Discovery, &config.set_names())
        .unwrap();
    assert_eq!(state.phase(), CrawlPhase::Done);
    assert_eq!(state.set("videos").unwrap().len(), 4);
    assert_eq!(state.config_hash(), Some("hash-1"));

    // A finished job does nothing on the next start
    let again = run_job(&config, "hash-1", options, &controls).await.unwrap();
    assert!(again.phases.is_empty());
}

#[tokio::test]
async fn test_scan_mode_refuses_pipeline_job() {
    let dir = TempDir::new().unwrap();
    let store = GzipFileStore::new(dir.path()).unwrap();
    let mut state = CrawlState::new("mixed", CrawlPhase::Discovery);
    state.save(&store).unwrap();

    let config_text = format!(
        r#"
[crawler]
concurrency = 1

[user-agent]
crawler-name = "TestSweep"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[output]
checkpoint-dir = "{dir}"
job = "mixed"

[scan]
ranges = ["1-10"]
page-size = 5
url = "https://api.example.com/videos"
id-param = "id"
merge = {{ kind = "by-id", fields = ["videos"] }}
"#,
        dir = dir.path().display()
    );
    let config = parse_config(&config_text).unwrap();
    let options = JobOptions {
        mode: JobMode::Scan,
        fresh: false,
    };

    let err = run_job(&config, "hash", options, &Controls::new(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("discovery"));
}
