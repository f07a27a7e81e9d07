//! # Event Flows
//!
//! `store` fires `page_view`; listener groups in other services consume it:
//!
//! ```text
//!                          ┌──→ dashboard-default ──→ counter
//! store ──page_view──→ [store.*:stream]
//!                          └──→ audit-default ──────→ log
//! ```

#[cfg(test)]
mod tests {
    use crate::cluster::{eventually, kwargs, shutdown, start, Cluster};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use wirebus_client::{
        event_fn, BusClient, EventHandler, EventMessage, ListenOptions, StartPosition, StreamLayout,
    };
    use wirebus_node::demo::{self, PageViewCounter};
    use wirebus_transport::{ReadCursor, Transport};
    use wirebus_types::channels::{consumer_group, dead_letter_channel, event_stream};
    use wirebus_types::MessageId;

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    fn counting(counter: PageViewCounter) -> Arc<dyn EventHandler> {
        event_fn(&["url"], move |event: EventMessage| {
            let counter = counter.clone();
            async move {
                counter.record(event.kwargs["url"].as_str().unwrap_or_default());
                Ok::<_, anyhow::Error>(())
            }
        })
    }

    async fn store(cluster: &Cluster) -> BusClient {
        let store = cluster.process("store", "p1").await;
        store.register_api(demo::store_api().unwrap()).await.unwrap();
        store
    }

    async fn fire_views(store: &BusClient, urls: &[&str]) {
        for url in urls {
            store
                .fire("store", "page_view", kwargs(json!({ "url": url })))
                .await
                .unwrap();
        }
    }

    // =========================================================================
    // DELIVERY
    // =========================================================================

    #[tokio::test]
    async fn test_page_view_counter() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let dashboard = cluster.process("dashboard", "p1").await;
        let counter = PageViewCounter::new();
        dashboard
            .listen(&[("store", "page_view")], counting(counter.clone()), ListenOptions::default())
            .await
            .unwrap();
        let running = start(&dashboard).await;

        fire_views(&store, &["/", "/pet/1", "/pet/1"]).await;

        let channel = event_stream(StreamLayout::PerApi, "store", "page_view");
        let group = consumer_group("dashboard", "default");
        eventually(Duration::from_secs(5), || {
            counter.snapshot().values().sum::<u64>() == 3
                && cluster.broker.pending_count(&channel, &group) == 0
        })
        .await;
        assert_eq!(counter.count("/"), 1);
        assert_eq!(counter.count("/pet/1"), 2);
        assert_eq!(counter.snapshot().len(), 2);

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, running).await;
    }

    #[tokio::test]
    async fn test_fire_without_listeners_succeeds() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let first = store
            .fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap();
        let second = store
            .fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap();
        assert!(second.position > first.position);
        assert_ne!(first.id, second.id);
        assert_eq!(cluster.broker.stream_len("store.*:stream"), 2);

        store.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_each_group_receives_every_event_once() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let dashboard = cluster.process("dashboard", "p1").await;
        let dashboard_views = PageViewCounter::new();
        dashboard
            .listen(
                &[("store", "page_view")],
                counting(dashboard_views.clone()),
                ListenOptions::default(),
            )
            .await
            .unwrap();

        let audit = cluster.process("audit", "p1").await;
        let audit_views = PageViewCounter::new();
        audit
            .listen(
                &[("store", "page_view")],
                counting(audit_views.clone()),
                ListenOptions::default(),
            )
            .await
            .unwrap();

        let dashboard_running = start(&dashboard).await;
        let audit_running = start(&audit).await;

        let urls: Vec<String> = (0..10).map(|i| format!("/pet/{i}")).collect();
        let urls: Vec<&str> = urls.iter().map(String::as_str).collect();
        fire_views(&store, &urls).await;

        eventually(Duration::from_secs(5), || {
            dashboard_views.snapshot().len() == 10 && audit_views.snapshot().len() == 10
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        for counter in [&dashboard_views, &audit_views] {
            assert!(counter.snapshot().values().all(|count| *count == 1));
        }

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, dashboard_running).await;
        shutdown(&audit, audit_running).await;
    }

    #[tokio::test]
    async fn test_processes_in_one_group_share_events() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let counter = PageViewCounter::new();
        let mut workers = Vec::new();
        for process in ["p1", "p2"] {
            let worker = cluster.process("dashboard", process).await;
            worker
                .listen(
                    &[("store", "page_view")],
                    counting(counter.clone()),
                    ListenOptions::default(),
                )
                .await
                .unwrap();
            let running = start(&worker).await;
            workers.push((worker, running));
        }

        let urls: Vec<String> = (0..10).map(|i| format!("/{i}")).collect();
        let urls: Vec<&str> = urls.iter().map(String::as_str).collect();
        fire_views(&store, &urls).await;

        eventually(Duration::from_secs(5), || counter.snapshot().len() == 10).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.snapshot().values().sum::<u64>(), 10);

        store.stop(Duration::from_secs(1)).await.unwrap();
        for (worker, running) in workers {
            shutdown(&worker, running).await;
        }
    }

    #[tokio::test]
    async fn test_failed_handler_gets_same_message_again() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let seen: Arc<Mutex<Vec<MessageId>>> = Arc::default();
        let deliveries = seen.clone();
        let handler = event_fn(&["url"], move |event: EventMessage| {
            let deliveries = deliveries.clone();
            async move {
                let first = {
                    let mut seen = deliveries.lock();
                    let first = !seen.contains(&event.id);
                    seen.push(event.id);
                    first
                };
                if first {
                    anyhow::bail!("database unavailable");
                }
                Ok(())
            }
        });

        let dashboard = cluster.process("dashboard", "p1").await;
        dashboard
            .listen(&[("store", "page_view")], handler, ListenOptions::default())
            .await
            .unwrap();
        let running = start(&dashboard).await;

        let receipt = store
            .fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap();

        let group = consumer_group("dashboard", "default");
        eventually(Duration::from_secs(5), || {
            seen.lock().len() == 2 && cluster.broker.pending_count("store.*:stream", &group) == 0
        })
        .await;
        assert_eq!(*seen.lock(), vec![receipt.id, receipt.id]);

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, running).await;
    }

    #[tokio::test]
    async fn test_poison_event_is_dead_lettered() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;

        let dashboard = cluster.process("dashboard", "p1").await;
        dashboard
            .listen(
                &[("store", "page_view")],
                event_fn(&["url"], |_event: EventMessage| async {
                    Err::<(), _>(anyhow::anyhow!("cannot parse url"))
                }),
                ListenOptions::default().max_deliveries(3),
            )
            .await
            .unwrap();
        let running = start(&dashboard).await;

        fire_views(&store, &["::bad::"]).await;

        let dead = dead_letter_channel("store.*:stream");
        eventually(Duration::from_secs(5), || cluster.broker.stream_len(&dead) == 1).await;
        assert_eq!(
            cluster
                .broker
                .pending_count("store.*:stream", &consumer_group("dashboard", "default")),
            0
        );

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, running).await;
    }

    #[tokio::test]
    async fn test_abandoned_event_is_reclaimed_by_group_member() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;
        let channel = event_stream(StreamLayout::PerApi, "store", "page_view");
        let group = consumer_group("dashboard", "default");

        // A process of the group reads the event and dies before acknowledging.
        let crashed = cluster.broker.connect();
        crashed
            .ensure_group(&channel, &group, StartPosition::Latest)
            .await
            .unwrap();
        fire_views(&store, &["/pet/7"]).await;
        let taken = crashed
            .read_group(
                &[channel.clone()],
                &group,
                "crashed",
                ReadCursor::New,
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        let survivor = cluster
            .process_with("dashboard", "p2", |config| config.consumer.claim_timeout_ms = 200)
            .await;
        let counter = PageViewCounter::new();
        survivor
            .listen(&[("store", "page_view")], counting(counter.clone()), ListenOptions::default())
            .await
            .unwrap();
        let running = start(&survivor).await;

        eventually(Duration::from_secs(5), || counter.count("/pet/7") == 1).await;
        eventually(Duration::from_secs(2), || cluster.broker.pending_count(&channel, &group) == 0)
            .await;

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&survivor, running).await;
    }

    #[tokio::test]
    async fn test_listener_starting_at_beginning_sees_history() {
        let cluster = Cluster::new();
        let store = store(&cluster).await;
        fire_views(&store, &["/", "/about"]).await;

        let replay = cluster.process("replay", "p1").await;
        let counter = PageViewCounter::new();
        replay
            .listen(
                &[("store", "page_view")],
                counting(counter.clone()),
                ListenOptions::group("backfill").start(StartPosition::Beginning),
            )
            .await
            .unwrap();
        let running = start(&replay).await;

        eventually(Duration::from_secs(5), || counter.snapshot().len() == 2).await;

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&replay, running).await;
    }

    // =========================================================================
    // LAYOUT
    // =========================================================================

    #[tokio::test]
    async fn test_per_event_layout_uses_one_stream_per_event() {
        let cluster = Cluster::new();
        let per_event = |config: &mut wirebus_client::BusConfig| {
            config.stream_layout = StreamLayout::PerEvent;
        };

        let store = cluster.process_with("store", "p1", per_event).await;
        let api = wirebus_client::ApiDefinition::builder("store")
            .event(wirebus_client::EventDeclaration::new("page_view", ["url"]))
            .event(wirebus_client::EventDeclaration::new("checkout", ["order_id"]))
            .build()
            .unwrap();
        store.register_api(api).await.unwrap();

        let dashboard = cluster.process_with("dashboard", "p1", per_event).await;
        let received: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let by_event = received.clone();
        dashboard
            .listen(
                &[("store", "page_view")],
                event_fn(&["url"], move |event: EventMessage| {
                    let by_event = by_event.clone();
                    async move {
                        *by_event.lock().entry(event.event_name).or_default() += 1;
                        Ok::<_, anyhow::Error>(())
                    }
                }),
                ListenOptions::default(),
            )
            .await
            .unwrap();
        let running = start(&dashboard).await;

        store
            .fire("store", "page_view", kwargs(json!({"url": "/"})))
            .await
            .unwrap();
        store
            .fire("store", "checkout", kwargs(json!({"order_id": 7})))
            .await
            .unwrap();

        assert_eq!(cluster.broker.stream_len("store.page_view:stream"), 1);
        assert_eq!(cluster.broker.stream_len("store.checkout:stream"), 1);
        assert_eq!(cluster.broker.stream_len("store.*:stream"), 0);

        eventually(Duration::from_secs(5), || received.lock().get("page_view") == Some(&1)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(received.lock().len(), 1);

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, running).await;
    }

    #[tokio::test]
    async fn test_per_api_layout_skips_unrequested_events() {
        let cluster = Cluster::new();
        let store = cluster.process("store", "p1").await;
        let api = wirebus_client::ApiDefinition::builder("store")
            .event(wirebus_client::EventDeclaration::new("page_view", ["url"]))
            .event(wirebus_client::EventDeclaration::new("checkout", ["order_id"]))
            .build()
            .unwrap();
        store.register_api(api).await.unwrap();

        let dashboard = cluster.process("dashboard", "p1").await;
        let counter = PageViewCounter::new();
        dashboard
            .listen(&[("store", "page_view")], counting(counter.clone()), ListenOptions::default())
            .await
            .unwrap();
        let running = start(&dashboard).await;

        store
            .fire("store", "checkout", kwargs(json!({"order_id": 1})))
            .await
            .unwrap();
        fire_views(&store, &["/"]).await;

        let group = consumer_group("dashboard", "default");
        eventually(Duration::from_secs(5), || {
            counter.count("/") == 1 && cluster.broker.pending_count("store.*:stream", &group) == 0
        })
        .await;
        assert_eq!(counter.snapshot().len(), 1);

        store.stop(Duration::from_secs(1)).await.unwrap();
        shutdown(&dashboard, running).await;
    }
}
