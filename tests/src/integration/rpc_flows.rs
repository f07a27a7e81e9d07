//! # RPC Flows
//!
//! A caller process and one or more serving processes for `image`:
//!
//! ```text
//! store ──CallMessage──→ [image:rpc_queue] ──→ image (group "rpc")
//!   ↑                                              │
//!   └────ResultMessage──── [store.p1:results] ←────┘
//! ```

#[cfg(test)]
mod tests {
    use crate::cluster::{eventually, kwargs, shutdown, start, Cluster};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use wirebus_client::{rpc_fn, BusError, HandlerError, Kwargs, RpcServingMode};
    use wirebus_node::demo;
    use wirebus_types::channels::rpc_queue;

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    async fn image_server(cluster: &Cluster, process: &str) -> wirebus_client::BusClient {
        let server = cluster.process("image", process).await;
        server.register_api(demo::image_api().unwrap()).await.unwrap();
        server
    }

    fn counting_resize(served: Arc<AtomicUsize>) -> Arc<dyn wirebus_client::RpcHandler> {
        rpc_fn(&["url", "width", "height"], move |args: Kwargs| {
            let served = served.clone();
            async move {
                served.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(json!(format!(
                    "{}@{}x{}",
                    args["url"].as_str().unwrap_or_default(),
                    args["width"],
                    args["height"]
                )))
            }
        })
    }

    // =========================================================================
    // ROUND TRIPS
    // =========================================================================

    #[tokio::test]
    async fn test_image_resize_returns_handler_result() {
        let cluster = Cluster::new();
        let server = image_server(&cluster, "s1").await;
        server
            .bind_rpc(
                "image",
                "resize",
                rpc_fn(&["url", "width", "height"], |_args: Kwargs| async {
                    Ok::<_, anyhow::Error>(json!("https://placehold.it/200x200"))
                }),
            )
            .await
            .unwrap();
        let running = start(&server).await;

        let store = cluster.process("store", "p1").await;
        let resized = store
            .call("image", "resize", kwargs(json!({"url": "x", "width": 200, "height": 200})))
            .await
            .unwrap();
        assert_eq!(resized, json!("https://placehold.it/200x200"));
        assert_eq!(store.pending_calls().pending_count(), 0);

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&server, running).await;
    }

    #[tokio::test]
    async fn test_calls_are_shared_between_competing_servers() {
        let cluster = Cluster::new();
        let served = Arc::new(AtomicUsize::new(0));
        let mut servers = Vec::new();
        for process in ["s1", "s2"] {
            let server = image_server(&cluster, process).await;
            server
                .bind_rpc("image", "resize", counting_resize(served.clone()))
                .await
                .unwrap();
            let running = start(&server).await;
            servers.push((server, running));
        }

        let store = cluster.process("store", "p1").await;
        let calls = (0..20).map(|i| {
            let store = store.clone();
            async move {
                store
                    .api("image")
                    .call(
                        "resize",
                        kwargs(json!({"url": format!("/{i}"), "width": i, "height": i})),
                    )
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(format!("/{i}@{i}x{i}")));
        }
        assert_eq!(served.load(Ordering::SeqCst), 20);

        store.stop(Duration::from_secs(1)).await.unwrap();
        for (server, running) in servers {
            shutdown(&server, running).await;
        }
    }

    #[tokio::test]
    async fn test_call_queued_before_server_starts_is_answered() {
        let cluster = Cluster::new();
        let server = image_server(&cluster, "s1").await;
        server
            .bind_rpc("image", "resize", counting_resize(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();

        let store = cluster.process("store", "p1").await;
        let call = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .call(
                        "image",
                        "resize",
                        kwargs(json!({"url": "late", "width": 1, "height": 1})),
                    )
                    .await
            }
        });
        eventually(Duration::from_secs(2), || cluster.broker.stream_len(&rpc_queue("image")) == 1)
            .await;

        let running = start(&server).await;
        assert_eq!(call.await.unwrap().unwrap(), json!("late@1x1"));

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&server, running).await;
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    #[tokio::test]
    async fn test_remote_error_keeps_kind_and_message() {
        let cluster = Cluster::new();
        let server = image_server(&cluster, "s1").await;
        server
            .bind_rpc(
                "image",
                "resize",
                rpc_fn(&["url", "width", "height"], |_args: Kwargs| async {
                    Err::<serde_json::Value, _>(anyhow::Error::new(HandlerError::new(
                        "ValueError",
                        "width must be positive",
                    )))
                }),
            )
            .await
            .unwrap();
        let running = start(&server).await;

        let store = cluster.process("store", "p1").await;
        let err = store
            .call("image", "resize", kwargs(json!({"url": "x", "width": -1, "height": 1})))
            .await
            .unwrap_err();
        match err {
            BusError::RemoteError { kind, message, .. } => {
                assert_eq!(kind, "ValueError");
                assert_eq!(message, "width must be positive");
            }
            other => panic!("expected a remote error, got {other:?}"),
        }

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&server, running).await;
    }

    #[tokio::test]
    async fn test_call_without_server_times_out() {
        let cluster = Cluster::new();
        let server = image_server(&cluster, "s1").await;

        let store = cluster.process("store", "p1").await;
        let started = tokio::time::Instant::now();
        let err = store
            .call_with_timeout(
                "image",
                "resize",
                kwargs(json!({"url": "x", "width": 1, "height": 1})),
                Duration::from_millis(150),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { timeout_ms: 150, .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(store.pending_calls().pending_count(), 0);

        store.stop(Duration::from_secs(1)).await.unwrap();
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_late_result_is_discarded() {
        let cluster = Cluster::new();
        let server = image_server(&cluster, "s1").await;
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        server
            .bind_rpc(
                "image",
                "resize",
                rpc_fn(&["url", "width", "height"], move |_args: Kwargs| {
                    let done = done.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(json!("too late"))
                    }
                }),
            )
            .await
            .unwrap();
        let running = start(&server).await;

        let store = cluster.process("store", "p1").await;
        let err = store
            .call_with_timeout(
                "image",
                "resize",
                kwargs(json!({"url": "x", "width": 1, "height": 1})),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));

        eventually(Duration::from_secs(3), || {
            store.pending_calls().stats().total_late.load(Ordering::SeqCst) == 1
        })
        .await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(store.pending_calls().pending_count(), 0);

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&server, running).await;
    }

    // =========================================================================
    // SERVING MODES
    // =========================================================================

    #[tokio::test]
    async fn test_exclusive_serving_rejects_second_server() {
        let cluster = Cluster::new();
        let exclusive = |config: &mut wirebus_client::BusConfig| {
            config.rpc_serving_mode = RpcServingMode::Exclusive;
            config.rpc_lease_ttl_ms = 3_000;
        };

        let first = cluster.process_with("image", "s1", exclusive).await;
        first.register_api(demo::image_api().unwrap()).await.unwrap();
        first
            .bind_rpc("image", "resize", counting_resize(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();
        let running = start(&first).await;

        let second = cluster.process_with("image", "s2", exclusive).await;
        second.register_api(demo::image_api().unwrap()).await.unwrap();
        second
            .bind_rpc("image", "resize", counting_resize(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), second.run())
            .await
            .unwrap()
            .unwrap_err();
        match err {
            BusError::ApiAlreadyServed { api, holder } => {
                assert_eq!(api, "image");
                assert_eq!(holder, "image.s1");
            }
            other => panic!("expected ApiAlreadyServed, got {other:?}"),
        }

        let store = cluster.process("store", "p1").await;
        let answer = store
            .call("image", "resize", kwargs(json!({"url": "x", "width": 2, "height": 3})))
            .await
            .unwrap();
        assert_eq!(answer, json!("x@2x3"));

        store.stop(Duration::from_secs(1)).await.unwrap();
        second.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&first, running).await;
    }

    #[tokio::test]
    async fn test_exclusive_lease_released_on_stop() {
        let cluster = Cluster::new();
        let exclusive = |config: &mut wirebus_client::BusConfig| {
            config.rpc_serving_mode = RpcServingMode::Exclusive;
        };

        let first = cluster.process_with("image", "s1", exclusive).await;
        first.register_api(demo::image_api().unwrap()).await.unwrap();
        first
            .bind_rpc("image", "resize", counting_resize(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();
        let running = start(&first).await;
        shutdown(&first, running).await;

        let second = cluster.process_with("image", "s2", exclusive).await;
        second.register_api(demo::image_api().unwrap()).await.unwrap();
        second
            .bind_rpc("image", "resize", counting_resize(Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();
        let running = start(&second).await;
        shutdown(&second, running).await;
    }
}
