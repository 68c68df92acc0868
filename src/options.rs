//! Options controlling a single pool instance.
//!
//! Per-cluster limits ([`crate::resource::ResourceManager`], `max_requests_per_connection`,
//! `per_upstream_preconnect_ratio`) come from [`crate::host::ClusterInfo`] instead of living here:
//! they are shared across every pool at the same (cluster, priority) scope, where the options in
//! this module are local to the one pool instance that owns them.

use std::time::Duration;

use typed_builder::TypedBuilder;

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Construction options for a [`crate::pool::Pool`].
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ConnectionPoolOptions {
    /// How long to wait for a new connection to finish connecting before treating it as a local
    /// connection failure and purging its pending streams.
    #[builder(default = default_connect_timeout())]
    pub connect_timeout: Duration,

    /// Maximum lifetime of a connection before it is drained (not closed outright; existing
    /// streams are allowed to finish). `None` means connections are never drained purely for age.
    #[builder(default, setter(strip_option))]
    pub max_connection_duration: Option<Duration>,

    /// Whether `attach_stream_to_client` consults the cluster's `requests` resource limit.
    /// HTTP/1 and TCP both set this; a specialization with no per-stream request concept (there
    /// is none in this crate yet) could disable it.
    #[builder(default = true)]
    pub enforce_max_requests: bool,

    /// TCP only: whether a half-close from the upstream (end_stream with no matching end_stream
    /// from downstream) forces a full reset of the downstream stream rather than leaving it open
    /// to finish independently.
    #[builder(default = true)]
    pub force_reset_on_upstream_half_close: bool,
}

impl Default for ConnectionPoolOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = ConnectionPoolOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.max_connection_duration, None);
        assert!(options.enforce_max_requests);
        assert!(options.force_reset_on_upstream_half_close);
    }

    #[test]
    fn builder_overrides_apply() {
        let options = ConnectionPoolOptions::builder()
            .connect_timeout(Duration::from_secs(1))
            .max_connection_duration(Duration::from_secs(60))
            .enforce_max_requests(false)
            .build();
        assert_eq!(options.connect_timeout, Duration::from_secs(1));
        assert_eq!(
            options.max_connection_duration,
            Some(Duration::from_secs(60))
        );
        assert!(!options.enforce_max_requests);
    }
}
