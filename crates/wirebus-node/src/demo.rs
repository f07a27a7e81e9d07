//! # Demo Services
//!
//! A small shop split over three services, all hosted by one process when
//! `wirebus run --demo` is used:
//!
//! ```text
//!   store ──page_view──→ [store.*:stream] ──→ dashboard (group "dashboard")
//!     │
//!     └──call image.resize──→ [image:rpc_queue] ──→ image
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use wirebus_client::{
    event_typed, rpc_typed, ApiDefinition, BusClient, BusError, EventDeclaration, ListenOptions,
    ParamType, Parameter, RpcSignature,
};
use wirebus_types::to_kwargs;

pub const IMAGE_API: &str = "image";
pub const STORE_API: &str = "store";
pub const DASHBOARD_GROUP: &str = "dashboard";

pub fn image_api() -> Result<ApiDefinition, BusError> {
    ApiDefinition::builder(IMAGE_API)
        .rpc(
            RpcSignature::new(
                "resize",
                [
                    Parameter::typed("url", ParamType::String),
                    Parameter::typed("width", ParamType::Integer),
                    Parameter::typed("height", ParamType::Integer),
                ],
            )
            .returns(ParamType::String),
        )
        .build()
}

pub fn store_api() -> Result<ApiDefinition, BusError> {
    ApiDefinition::builder(STORE_API)
        .event(EventDeclaration::new(
            "page_view",
            [Parameter::typed("url", ParamType::String)],
        ))
        .build()
}

#[derive(Debug, Deserialize)]
struct Resize {
    url: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct PageView {
    url: String,
}

#[derive(Serialize)]
struct ViewArgs<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct ResizeArgs<'a> {
    url: &'a str,
    width: u32,
    height: u32,
}

/// Page views per url, as seen by the dashboard.
#[derive(Debug, Clone, Default)]
pub struct PageViewCounter {
    views: Arc<DashMap<String, u64>>,
}

impl PageViewCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, url: &str) -> u64 {
        let mut count = self.views.entry(url.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn count(&self, url: &str) -> u64 {
        self.views.get(url).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.views
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Register the demo APIs without binding any handler.
pub async fn register_apis(bus: &BusClient) -> Result<(), BusError> {
    bus.register_api(image_api()?).await?;
    bus.register_api(store_api()?).await?;
    Ok(())
}

/// Register the demo APIs, bind `image.resize` and subscribe the dashboard.
pub async fn install(bus: &BusClient) -> Result<PageViewCounter, BusError> {
    register_apis(bus).await?;

    bus.bind_rpc(
        IMAGE_API,
        "resize",
        rpc_typed(&["url", "width", "height"], |args: Resize| async move {
            if args.width == 0 || args.height == 0 {
                anyhow::bail!("cannot resize {} to {}x{}", args.url, args.width, args.height);
            }
            info!(url = %args.url, width = args.width, height = args.height, "Resizing image");
            Ok(format!("https://placehold.it/{}x{}", args.width, args.height))
        }),
    )
    .await?;

    let counter = PageViewCounter::new();
    let views = counter.clone();
    bus.listen(
        &[(STORE_API, "page_view")],
        event_typed(&["url"], move |view: PageView| {
            let views = views.clone();
            async move {
                let total = views.record(&view.url);
                info!(url = %view.url, total, "[dashboard] Page viewed");
                Ok::<_, anyhow::Error>(())
            }
        }),
        ListenOptions::group(DASHBOARD_GROUP),
    )
    .await?;

    Ok(counter)
}

/// What the store front end would do: view a few pages and resize an image.
pub async fn drive_traffic(bus: BusClient, with_calls: bool) -> anyhow::Result<()> {
    bus.wait_ready().await;

    let store = bus.api(STORE_API);
    for url in ["/", "/pet/1", "/pet/1"] {
        store.fire("page_view", to_kwargs(&ViewArgs { url })?).await?;
    }

    if with_calls {
        let kwargs = to_kwargs(&ResizeArgs {
            url: "https://example.com/pet/1.jpg",
            width: 200,
            height: 200,
        })?;
        match bus.api(IMAGE_API).call("resize", kwargs).await {
            Ok(resized) => info!(%resized, "[store] Resized image"),
            Err(e) => warn!(error = %e, "[store] Resize failed"),
        }
    }
    Ok(())
}
