//! # Resilience
//!
//! Broker outages, exhausted reconnects and shutdown with work in flight.

#[cfg(test)]
mod tests {
    use crate::cluster::{eventually, kwargs, shutdown, start, Cluster};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use wirebus_client::{event_fn, BusClient, BusError, EventMessage, Kwargs, ListenOptions};
    use wirebus_node::demo::{self, PageViewCounter};
    use wirebus_types::channels::consumer_group;
    use wirebus_types::TransportError;

    async fn store(cluster: &Cluster) -> BusClient {
        let store = cluster.process("store", "p1").await;
        store.register_api(demo::store_api().unwrap()).await.unwrap();
        store
    }

    fn counting(counter: PageViewCounter) -> Arc<dyn wirebus_client::EventHandler> {
        event_fn(&["url"], move |event: EventMessage| {
            let counter = counter.clone();
            async move {
                counter.record(event.kwargs["url"].as_str().unwrap_or_default());
                Ok::<_, anyhow::Error>(())
            }
        })
    }

    /// Handler that flags when it starts and then takes `duration`.
    fn slow(
        started: Arc<AtomicBool>,
        finished: Arc<AtomicUsize>,
        duration: Duration,
    ) -> Arc<dyn wirebus_client::EventHandler> {
        event_fn(&["url"], move |_event: EventMessage| {
            let started = started.clone();
            let finished = finished.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(duration).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
    }

    // =========================================================================
    // OUTAGES
    // =========================================================================

    #[tokio::test]
    async fn test_listener_recovers_after_outage() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let dashboard = cluster.process("dashboard", "p1").await;
        let counter = PageViewCounter::new();
        dashboard
            .listen(&[("store", "page_view")], counting(counter.clone()), ListenOptions::default())
            .await
            .unwrap();
        let running = start(&dashboard).await;

        cluster.broker.set_available(false);
        let err = store
            .fire("store", "page_view", kwargs(json!({"url": "/down"})))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BusError::Transport(TransportError::ConnectionLost(_))),
            "{err:?}"
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!running.is_finished());

        cluster.broker.set_available(true);
        store
            .fire("store", "page_view", kwargs(json!({"url": "/up"})))
            .await
            .unwrap();
        eventually(Duration::from_secs(5), || counter.count("/up") == 1).await;
        assert_eq!(counter.count("/down"), 0);

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, running).await;
    }

    #[tokio::test]
    async fn test_calls_resume_after_outage() {
        let cluster = Cluster::new();
        let server = cluster.process("image", "s1").await;
        server.register_api(demo::image_api().unwrap()).await.unwrap();
        server
            .bind_rpc(
                "image",
                "resize",
                wirebus_client::rpc_fn(&["url", "width", "height"], |_args: Kwargs| async {
                    Ok::<_, anyhow::Error>(json!("ok"))
                }),
            )
            .await
            .unwrap();
        let running = start(&server).await;
        let caller = cluster.process("store", "p1").await;

        cluster.broker.set_available(false);
        let err = caller
            .call("image", "resize", kwargs(json!({"url": "x", "width": 1, "height": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Transport(_)), "{err:?}");
        assert_eq!(caller.pending_calls().pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        cluster.broker.set_available(true);

        let answer = caller
            .call("image", "resize", kwargs(json!({"url": "x", "width": 1, "height": 1})))
            .await
            .unwrap();
        assert_eq!(answer, json!("ok"));

        caller.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&server, running).await;
    }

    #[tokio::test]
    async fn test_run_fails_when_reconnects_are_exhausted() {
        let cluster = Cluster::new();
        let _store = store(&cluster).await;

        let dashboard = cluster
            .process_with("dashboard", "p1", |config| config.consumer.max_reconnect_attempts = 2)
            .await;
        dashboard
            .listen(
                &[("store", "page_view")],
                counting(PageViewCounter::new()),
                ListenOptions::default(),
            )
            .await
            .unwrap();
        let running = start(&dashboard).await;

        cluster.broker.set_available(false);
        let outcome = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(
                outcome,
                Err(BusError::Transport(TransportError::RetriesExhausted { attempts: 2, .. }))
            ),
            "{outcome:?}"
        );

        cluster.broker.set_available(true);
        dashboard.stop(Duration::from_secs(1)).await.unwrap();
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    #[tokio::test]
    async fn test_stop_waits_for_inflight_handler() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicUsize::new(0));
        let dashboard = cluster.process("dashboard", "p1").await;
        dashboard
            .listen(
                &[("store", "page_view")],
                slow(started.clone(), finished.clone(), Duration::from_millis(200)),
                ListenOptions::default(),
            )
            .await
            .unwrap();
        let running = start(&dashboard).await;

        store
            .fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap();
        eventually(Duration::from_secs(5), || started.load(Ordering::SeqCst)).await;

        dashboard.stop(Duration::from_secs(2)).await.unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(
            cluster
                .broker
                .pending_count("store.*:stream", &consumer_group("dashboard", "default")),
            0
        );

        store.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_aborts_handlers_past_grace() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicUsize::new(0));
        let dashboard = cluster.process("dashboard", "p1").await;
        dashboard
            .listen(
                &[("store", "page_view")],
                slow(started.clone(), finished.clone(), Duration::from_secs(30)),
                ListenOptions::default(),
            )
            .await
            .unwrap();
        let running = start(&dashboard).await;

        store
            .fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap();
        eventually(Duration::from_secs(5), || started.load(Ordering::SeqCst)).await;

        tokio::time::timeout(Duration::from_secs(3), dashboard.stop(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        // The event is still pending for the stopped process and is replayed
        // when a process with the same name comes back.
        let group = consumer_group("dashboard", "default");
        assert_eq!(cluster.broker.pending_count("store.*:stream", &group), 1);

        let restarted = cluster.process("dashboard", "p1").await;
        let counter = PageViewCounter::new();
        restarted
            .listen(&[("store", "page_view")], counting(counter.clone()), ListenOptions::default())
            .await
            .unwrap();
        let running = start(&restarted).await;
        eventually(Duration::from_secs(5), || counter.count("/") == 1).await;

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&restarted, running).await;
    }

    #[tokio::test]
    async fn test_stopped_client_refuses_work() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;
        store.stop(Duration::from_secs(1)).await.unwrap();
        store.stop(Duration::from_secs(1)).await.unwrap();

        let err = store
            .fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Shutdown), "{err:?}");
        let err = store.call("image", "resize", Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, BusError::Shutdown), "{err:?}");
        assert!(matches!(store.run().await, Err(BusError::Shutdown)));
    }
}
