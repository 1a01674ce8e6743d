//! Statsd reporting for cache, refresh and task metrics.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

thread_local! {
    static CURRENT_CLIENT: Option<&'static MetricsClient> = METRICS_CLIENT.get();
}

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,

    /// A collection of tags and values that will be sent with every metric.
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in self.tags.iter() {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd_client
    }
}

/// Tell the metrics system to report to statsd.
///
/// Calling this more than once keeps the first configured client.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;
    let statsd_client = StatsdClient::from_sink(prefix, sink);

    if METRICS_CLIENT
        .set(MetricsClient {
            statsd_client,
            tags,
        })
        .is_err()
    {
        tracing::warn!("statsd client was already configured");
    }

    Ok(())
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part
/// the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| {
        if let Some(client) = client {
            f(client)
        } else {
            Default::default()
        }
    })
}

/// Emits a metric.
///
/// Does nothing until [`configure_statsd`] was called.
///
/// ```ignore
/// metric!(counter("refresh.trigger") += 1, "trigger" => "manual");
/// metric!(timer("refresh.lease.held") = held_for);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags, $id, $value $(, $k => $v)*)
    };

    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(client.$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
