//! End-to-end tests: host bridge, in-process V8 evaluator, and the real
//! reqwest-backed proxy against a local mock HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use widget_sandbox::widget::{MemoryCache, QuickLinkWidget, ResultCache, WidgetRunner};
use widget_sandbox::{
    BridgeConfig, FetchDispatcher, FetchOptions, HttpFetcher, InProcessLauncher, SandboxBridge,
    SandboxError, WorkerConfig,
};

fn bridge_with_timeout(timeout: Duration) -> Arc<SandboxBridge> {
    let worker = WorkerConfig {
        watchdog_ms: timeout.as_millis() as u64 + 2_000,
        ..Default::default()
    };
    Arc::new(SandboxBridge::new(
        BridgeConfig {
            timeout,
            ..Default::default()
        },
        Arc::new(InProcessLauncher::new(worker)),
        Arc::new(HttpFetcher::new()),
    ))
}

fn bridge() -> Arc<SandboxBridge> {
    bridge_with_timeout(Duration::from_secs(10))
}

/// A server that accepts connections and never answers.
async fn silent_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

#[tokio::test]
async fn returned_value_is_sanitized() {
    let bridge = bridge();
    let result = bridge
        .execute_script(r#"return { value: 42, label: "answer", extra: "drop-me" };"#)
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        serde_json::json!({"value": "42", "label": "answer"})
    );
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn thrown_error_rejects_with_message() {
    let bridge = bridge();
    let err = bridge
        .execute_script("throw new Error('intentional failure');")
        .await
        .unwrap_err();
    assert!(
        matches!(&err, SandboxError::Script { message } if message == "intentional failure"),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn syntax_error_rejects_with_non_empty_message() {
    let err = bridge().execute_script("return {{{").await.unwrap_err();
    match err {
        SandboxError::Script { message } => assert!(!message.is_empty()),
        other => panic!("expected Script error, got: {other:?}"),
    }
}

#[tokio::test]
async fn fetch_data_resolves_to_body_text() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/data")
        .with_status(200)
        .with_body(r#"{"x":1}"#)
        .create_async()
        .await;

    let code = format!(
        r#"const body = await fetchData("{}/data");
           return {{ value: body, label: typeof body }};"#,
        server.url()
    );
    let result = bridge().execute_script(&code).await.unwrap();
    assert_eq!(result.value, r#"{"x":1}"#);
    assert_eq!(result.label.as_deref(), Some("string"));
    mock.assert_async().await;
}

#[tokio::test]
async fn fetch_forwards_method_headers_and_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/submit")
        .match_header("x-api-key", "secret")
        .match_body("payload")
        .with_status(201)
        .with_body("created")
        .create_async()
        .await;

    let code = format!(
        r#"return {{ value: await fetchData("{}/submit", {{
               method: "POST",
               headers: {{ "X-Api-Key": "secret" }},
               body: "payload",
               credentials: "include",
           }}) }};"#,
        server.url()
    );
    let result = bridge().execute_script(&code).await.unwrap();
    assert_eq!(result.value, "created");
    mock.assert_async().await;
}

#[tokio::test]
async fn non_success_status_still_returns_body() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/missing")
        .with_status(404)
        .with_body("not here")
        .create_async()
        .await;

    let code = format!(
        r#"return {{ value: await fetchData("{}/missing") }};"#,
        server.url()
    );
    let result = bridge().execute_script(&code).await.unwrap();
    assert_eq!(result.value, "not here");
}

#[tokio::test]
async fn network_failure_is_thrown_with_proxy_message() {
    // Nothing listens on port 1.
    let url = "http://127.0.0.1:1/";
    let expected = HttpFetcher::new()
        .fetch(url, FetchOptions::default())
        .await
        .unwrap_err()
        .to_string();

    let code = format!(
        r#"try {{
               await fetchData("{url}");
               return {{ value: "unreachable" }};
           }} catch (e) {{
               return {{ value: e.message }};
           }}"#
    );
    let result = bridge().execute_script(&code).await.unwrap();
    assert_eq!(result.value, expected);
}

#[tokio::test]
async fn unanswered_fetch_times_out_at_the_ceiling() {
    let addr = silent_server().await;
    let timeout = Duration::from_secs(1);
    let bridge = bridge_with_timeout(timeout);
    bridge.init_sandbox().await.unwrap();

    let code = format!(r#"await fetchData("http://{addr}/slow"); return {{ value: 1 }};"#);
    let start = Instant::now();
    let err = bridge.execute_script(&code).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, SandboxError::Timeout { timeout_ms: 1000 }), "{err:?}");
    assert!(elapsed >= timeout, "rejected too early: {elapsed:?}");
    assert!(elapsed < timeout * 3, "rejected too late: {elapsed:?}");
    assert_eq!(bridge.pending_count(), 0);

    // The sandbox stays usable after abandoning a call.
    let result = bridge.execute_script("return { value: 'ok' };").await.unwrap();
    assert_eq!(result.value, "ok");
}

#[tokio::test]
async fn concurrent_scripts_resolve_independently() {
    let bridge = bridge();
    let (a, b, c) = tokio::join!(
        bridge.execute_script("return { value: 'a' };"),
        bridge.execute_script("throw new Error('b failed');"),
        bridge.execute_script("await Promise.resolve(); return { value: 'c', color: 'red' };"),
    );
    assert_eq!(a.unwrap().value, "a");
    assert_eq!(b.unwrap_err().to_string(), "b failed");
    let c = c.unwrap();
    assert_eq!(c.value, "c");
    assert_eq!(c.color.as_deref(), Some("red"));
}

#[tokio::test]
async fn destroy_rejects_in_flight_and_reinit_starts_fresh() {
    let bridge = bridge();
    bridge
        .execute_script("globalThis.marker = 1; return {};")
        .await
        .unwrap();

    let addr = silent_server().await;
    let in_flight = {
        let bridge = bridge.clone();
        let code = format!(r#"await fetchData("http://{addr}/"); return {{}};"#);
        tokio::spawn(async move { bridge.execute_script(&code).await })
    };
    // Wait until the call is registered.
    while bridge.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    bridge.destroy_sandbox();
    assert!(matches!(
        in_flight.await.unwrap(),
        Err(SandboxError::Destroyed)
    ));
    assert!(!bridge.is_ready());

    bridge.init_sandbox().await.unwrap();
    let result = bridge
        .execute_script("return { value: typeof marker };")
        .await
        .unwrap();
    assert_eq!(result.value, "undefined");
}

#[tokio::test]
async fn widget_runner_caches_successes_and_reports_failures() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/temp")
        .with_status(200)
        .with_body("72")
        .create_async()
        .await;

    let cache = Arc::new(MemoryCache::default());
    let runner = WidgetRunner::new(bridge(), cache.clone());

    let mut weather = QuickLinkWidget {
        name: "Weather".into(),
        script: format!(
            r#"const t = await fetchData("{}/temp");
               return {{ value: t + "°F", label: "Berlin", color: "orange" }};"#,
            server.url()
        ),
        icon: "☀".into(),
        url: "https://wttr.in".into(),
        refresh_interval_secs: 600,
        last_result: None,
    };

    let view = runner.run(&weather).await;
    assert_eq!(view.display_value, "72°F");
    assert_eq!(view.color.as_deref(), Some("orange"));
    assert_eq!(view.tooltip, "Weather | Berlin");
    assert_eq!(view.error, None);
    assert_eq!(cache.last_result("Weather").as_deref(), Some("72°F"));

    weather.script = "throw new Error('api down');".into();
    let view = runner.run(&weather).await;
    assert_eq!(view.display_value, "72°F");
    assert_eq!(view.error.as_deref(), Some("api down"));
    assert_eq!(view.color.as_deref(), Some("orange"));
    assert_eq!(view.tooltip, "Weather | Berlin | Error: api down");
    assert_eq!(cache.last_result("Weather").as_deref(), Some("72°F"));

    weather.script.clear();
    let view = runner.run(&weather).await;
    assert_eq!(view.display_value, "72°F");
    assert_eq!(view.tooltip, "Weather | Berlin");
    assert_eq!(view.error, None);

    // A new runner only has the cached value to go on.
    let fresh = WidgetRunner::new(bridge(), cache.clone());
    let view = fresh.run(&weather).await;
    assert_eq!(view.display_value, "72°F");
    assert_eq!(view.color, None);
    assert_eq!(view.tooltip, "Weather");
}
