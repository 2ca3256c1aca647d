//! Statsd metrics of the monitor phases.
//!
//! Metrics are emitted with the [`metric!`](crate::metric) macro and are dropped until
//! [`configure_statsd`] has been called.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, MetricSink, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client adding the configured custom tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    custom_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn new<S>(prefix: &str, sink: S, custom_tags: BTreeMap<String, String>) -> Self
    where
        S: MetricSink + Send + Sync + std::panic::RefUnwindSafe + 'static,
    {
        Self {
            statsd: StatsdClient::from_sink(prefix, sink),
            custom_tags,
        }
    }

    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.custom_tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Reports all metrics to the statsd server at `host`.
///
/// Fails if the host cannot be resolved or metrics were configured before.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    custom_tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host has no addresses");
    };
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket)?;

    METRICS_CLIENT
        .set(MetricsClient::new(prefix, sink, custom_tags))
        .map_err(|_| anyhow::anyhow!("metrics are already configured"))
}

/// Invokes `f` with the configured client, or returns the default without statsd.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    match METRICS_CLIENT.get() {
        Some(client) => f(client),
        None => Default::default(),
    }
}

/// Emits a counter, gauge or timer with optional `key => value` tags.
///
/// ```ignore
/// metric!(counter("reports.analyzed") += 1, "result" => "ok");
/// metric!(gauge("store.size.bytes") = size, "store" => "reports");
/// metric!(timer("phase.duration") = started.elapsed(), "phase" => "fetch");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}
