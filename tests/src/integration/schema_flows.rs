//! # Schema Flows
//!
//! Schemas registered by one process validate calls and events made by
//! every other process on the bus.

#[cfg(test)]
mod tests {
    use crate::cluster::{eventually, kwargs, shutdown, start, Cluster};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use wirebus_client::{
        event_fn, rpc_fn, BusError, EventMessage, Kwargs, ListenOptions, Transport,
    };
    use wirebus_node::demo;
    use wirebus_types::channels::{consumer_group, rpc_queue};
    use wirebus_types::encode;

    async fn resize_server(cluster: &Cluster) -> wirebus_client::BusClient {
        let server = cluster.process("image", "s1").await;
        server.register_api(demo::image_api().unwrap()).await.unwrap();
        server
            .bind_rpc(
                "image",
                "resize",
                rpc_fn(&["url", "width", "height"], |_args: Kwargs| async {
                    Ok::<_, anyhow::Error>(json!("resized"))
                }),
            )
            .await
            .unwrap();
        server
    }

    // =========================================================================
    // CALLS
    // =========================================================================

    #[tokio::test]
    async fn test_caller_rejects_mismatched_arguments() {
        let cluster = Cluster::new();
        let server = resize_server(&cluster).await;

        let store = cluster.process("store", "p1").await;
        let err = store
            .call("image", "resize", kwargs(json!({"url": "x", "width": "big", "height": 1})))
            .await
            .unwrap_err();
        match err {
            BusError::SchemaMismatch { api, member, reason } => {
                assert_eq!(api, "image");
                assert_eq!(member, "resize");
                assert!(reason.contains("width"), "{reason}");
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
        assert_eq!(cluster.broker.stream_len(&rpc_queue("image")), 0);

        store.stop(Duration::from_secs(1)).await.unwrap();
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_mismatched_arguments() {
        let cluster = Cluster::new();
        let server = resize_server(&cluster).await;
        let running = start(&server).await;

        let store = cluster
            .process_with("store", "p1", |config| config.validate_outgoing = false)
            .await;
        let err = store
            .call("image", "resize", kwargs(json!({"url": "x", "width": 1})))
            .await
            .unwrap_err();
        match err {
            BusError::SchemaMismatch { reason, .. } => {
                assert!(reason.contains("missing required parameter 'height'"), "{reason}");
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&server, running).await;
    }

    #[tokio::test]
    async fn test_unknown_procedure_rejected_by_caller() {
        let cluster = Cluster::new();
        let server = resize_server(&cluster).await;

        let store = cluster.process("store", "p1").await;
        let err = store.call("image", "crop", Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, BusError::UnknownProcedure { .. }), "{err:?}");

        store.stop(Duration::from_secs(1)).await.unwrap();
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_strict_caller_rejects_unknown_api() {
        let cluster = Cluster::new();
        let store = cluster
            .process_with("store", "p1", |config| config.strict_validation = true)
            .await;
        let err = store.call("billing", "charge", Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, BusError::ApiNotFound(ref api) if api == "billing"), "{err:?}");
        store.stop(Duration::from_secs(1)).await.unwrap();
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    #[tokio::test]
    async fn test_firer_rejects_bad_events() {
        let cluster = Cluster::new();
        let store = cluster.process("store", "p1").await;
        store.register_api(demo::store_api().unwrap()).await.unwrap();

        let err = store.fire("store", "checkout", Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, BusError::UnknownEvent { .. }), "{err:?}");

        let err = store
            .fire("store", "page_view", kwargs(json!({"url": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::SchemaMismatch { .. }), "{err:?}");

        let err = store.fire("billing", "paid", Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, BusError::ApiNotFound(_)), "{err:?}");

        assert_eq!(cluster.broker.stream_len("store.*:stream"), 0);
        store.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_drops_invalid_events() {
        let cluster = Cluster::new();
        let store = cluster.process("store", "p1").await;
        store.register_api(demo::store_api().unwrap()).await.unwrap();

        let handled = Arc::new(AtomicUsize::new(0));
        let count = handled.clone();
        let dashboard = cluster.process("dashboard", "p1").await;
        dashboard
            .listen(
                &[("store", "page_view")],
                event_fn(&["url"], move |_event: EventMessage| {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(())
                    }
                }),
                ListenOptions::default(),
            )
            .await
            .unwrap();
        let running = start(&dashboard).await;

        // A process with an outdated schema publishes straight to the stream.
        let rogue = cluster.broker.connect();
        let bad = EventMessage::new("store", "page_view", kwargs(json!({"path": "/"})));
        rogue
            .publish("store.*:stream", &encode(&bad).unwrap())
            .await
            .unwrap();
        rogue.publish("store.*:stream", b"not json").await.unwrap();
        store
            .fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap();

        let group = consumer_group("dashboard", "default");
        eventually(Duration::from_secs(5), || {
            handled.load(Ordering::SeqCst) == 1
                && cluster.broker.pending_count("store.*:stream", &group) == 0
        })
        .await;

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, running).await;
    }

    #[tokio::test]
    async fn test_listen_checks_handler_parameters() {
        let cluster = Cluster::new();
        let store = cluster.process("store", "p1").await;
        store.register_api(demo::store_api().unwrap()).await.unwrap();

        let dashboard = cluster.process("dashboard", "p1").await;
        let err = dashboard
            .listen(
                &[("store", "page_view")],
                event_fn(&["path"], |_event: EventMessage| async { Ok::<_, anyhow::Error>(()) }),
                ListenOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::HandlerMismatch { .. }), "{err:?}");

        store.stop(Duration::from_secs(1)).await.unwrap();
        dashboard.stop(Duration::from_secs(1)).await.unwrap();
    }

    // =========================================================================
    // SHARING
    // =========================================================================

    #[tokio::test]
    async fn test_schema_visible_to_other_processes() {
        let cluster = Cluster::new();
        let store = cluster.process("store", "p1").await;
        store.register_api(demo::store_api().unwrap()).await.unwrap();

        let web = cluster.process("web", "p1").await;
        let schema = web.schema().get("store").await.unwrap();
        assert!(schema.event("page_view").is_some());
        assert!(!web.schema().is_local("store"));

        web.fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap();
        assert_eq!(cluster.broker.stream_len("store.*:stream"), 1);

        store.stop(Duration::from_secs(1)).await.unwrap();
        web.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_caller_follows_upgraded_schema() {
        let cluster = Cluster::new();
        let v1 = cluster.process("image", "v1").await;
        let old = wirebus_types::ApiDefinition::builder("image")
            .rpc(wirebus_types::RpcSignature::new(
                "resize",
                [wirebus_types::Parameter::typed("url", wirebus_types::ParamType::String)],
            ))
            .build()
            .unwrap();
        v1.register_api(old).await.unwrap();
        v1.bind_rpc(
            "image",
            "resize",
            rpc_fn(&["url"], |_args: Kwargs| async {
                Ok::<_, anyhow::Error>(json!("v1"))
            }),
        )
        .await
        .unwrap();
        let running_v1 = start(&v1).await;

        let web = cluster.process("web", "p1").await;
        let reply = web.call("image", "resize", kwargs(json!({"url": "/a.png"}))).await;
        assert_eq!(reply.unwrap(), json!("v1"));
        shutdown(&v1, running_v1).await;

        let v2 = cluster.process("image", "v2").await;
        v2.register_api(demo::image_api().unwrap()).await.unwrap();
        v2.bind_rpc(
            "image",
            "resize",
            rpc_fn(&["url", "width", "height"], |_args: Kwargs| async {
                Ok::<_, anyhow::Error>(json!("v2"))
            }),
        )
        .await
        .unwrap();
        let running_v2 = start(&v2).await;

        let reply = web
            .call("image", "resize", kwargs(json!({"url": "/a.png", "width": 2, "height": 2})))
            .await;
        assert_eq!(reply.unwrap(), json!("v2"));

        let err = web
            .call("image", "resize", kwargs(json!({"url": "/a.png"})))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::SchemaMismatch { .. }), "{err:?}");

        web.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&v2, running_v2).await;
    }

    #[tokio::test]
    async fn test_listener_accepts_events_from_upgraded_firer() {
        let cluster = Cluster::new();
        let store = cluster.process("store", "p1").await;
        store.register_api(demo::store_api().unwrap()).await.unwrap();

        let dashboard = cluster.process("dashboard", "p1").await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        dashboard
            .listen(
                &[("store", "page_view")],
                event_fn(&["url"], move |_event: EventMessage| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                ListenOptions::group("views"),
            )
            .await
            .unwrap();
        let running = start(&dashboard).await;
        store.stop(Duration::from_secs(1)).await.unwrap();

        let upgraded = cluster.process("store", "p2").await;
        let api = wirebus_types::ApiDefinition::builder("store")
            .event(wirebus_types::EventDeclaration::new(
                "page_view",
                [
                    ("url", wirebus_types::ParamType::String),
                    ("referrer", wirebus_types::ParamType::String),
                ],
            ))
            .build()
            .unwrap();
        upgraded.register_api(api).await.unwrap();
        upgraded
            .fire("store", "page_view", kwargs(json!({"url": "/pet/1", "referrer": "/"})))
            .await
            .unwrap();

        eventually(Duration::from_secs(2), || seen.load(Ordering::SeqCst) == 1).await;
        upgraded.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, running).await;
    }

    #[tokio::test]
    async fn test_schema_expires_without_refresh() {
        let cluster = Cluster::new();
        let short_ttl = |config: &mut wirebus_client::BusConfig| config.schema_ttl_ms = 200;

        let idle = cluster.process_with("store", "p1", short_ttl).await;
        idle.register_api(demo::store_api().unwrap()).await.unwrap();

        let serving = cluster.process_with("image", "s1", short_ttl).await;
        serving.register_api(demo::image_api().unwrap()).await.unwrap();
        let running = start(&serving).await;

        tokio::time::sleep(Duration::from_millis(500)).await;

        let web = cluster.process("web", "p1").await;
        assert!(web.schema().get("store").await.is_err());
        assert!(web.schema().get("image").await.is_ok());

        web.stop(Duration::from_secs(1)).await.unwrap();
        idle.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&serving, running).await;
    }

    #[tokio::test]
    async fn test_dumped_schema_loads_in_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.json");

        let origin = Cluster::new();
        let image = origin.process("image", "s1").await;
        image.register_api(demo::image_api().unwrap()).await.unwrap();
        image.schema().dump(&path).await.unwrap();
        image.stop(Duration::from_secs(1)).await.unwrap();

        let elsewhere = Cluster::new();
        let store = elsewhere
            .process_with("store", "p1", |config| config.strict_validation = true)
            .await;
        assert_eq!(store.schema().load_local(&path).await.unwrap(), vec!["image"]);

        let err = store
            .call("image", "resize", kwargs(json!({"url": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::SchemaMismatch { .. }), "{err:?}");
        store.stop(Duration::from_secs(1)).await.unwrap();
    }
}
