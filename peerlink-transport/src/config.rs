use std::sync::Arc;
use std::time::Duration;

use quinn::{TransportConfig, VarInt};

/// Tunables for the transport.
///
/// Defaults follow the transport's production profile: generous stream
/// limits, 10 MiB / 15 MiB flow-control windows, keep-alives enabled, and a
/// socket reaper sweeping every 30 seconds.
pub struct QuicConfig {
    /// Maximum concurrent bidirectional streams a peer may open.
    pub max_concurrent_bidi_streams: u32,

    /// Per-stream flow-control window.
    pub stream_receive_window: u32,

    /// Per-connection flow-control window.
    pub receive_window: u32,

    /// Keep-alive interval.
    pub keep_alive_interval: Duration,

    /// Idle timeout after which a silent connection is dropped.
    pub max_idle_timeout: Duration,

    /// How often the socket reaper sweeps the reuse registry.
    pub garbage_collect_interval: Duration,

    /// How long a socket may sit unreferenced before the reaper closes it.
    pub max_unused_duration: Duration,

    /// Capacity of the address-validation token store.
    pub token_store_capacity: usize,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            max_concurrent_bidi_streams: 1000,
            stream_receive_window: 10 * (1 << 20),
            receive_window: 15 * (1 << 20),
            keep_alive_interval: Duration::from_secs(15),
            max_idle_timeout: Duration::from_secs(30),
            garbage_collect_interval: Duration::from_secs(30),
            max_unused_duration: Duration::from_secs(10),
            token_store_capacity: 32,
        }
    }
}

impl QuicConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reaper sweep interval.
    pub fn garbage_collect_interval(mut self, interval: Duration) -> Self {
        self.garbage_collect_interval = interval;
        self
    }

    /// Set how long an unreferenced socket survives before being closed.
    pub fn max_unused_duration(mut self, duration: Duration) -> Self {
        self.max_unused_duration = duration;
        self
    }

    /// Set the idle timeout.
    pub fn max_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Build the QUIC transport parameters shared by all connections.
    pub(crate) fn build_transport_config(&self) -> Arc<TransportConfig> {
        let mut transport = TransportConfig::default();

        transport.max_concurrent_bidi_streams(VarInt::from_u32(self.max_concurrent_bidi_streams));
        // Unidirectional streams are not part of the muxed-stream contract.
        transport.max_concurrent_uni_streams(VarInt::from_u32(0));
        transport.stream_receive_window(VarInt::from_u32(self.stream_receive_window));
        transport.receive_window(VarInt::from_u32(self.receive_window));
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().unwrap()));

        Arc::new(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert_eq!(config.max_concurrent_bidi_streams, 1000);
        assert_eq!(config.garbage_collect_interval, Duration::from_secs(30));
        assert_eq!(config.max_unused_duration, Duration::from_secs(10));
    }

    #[test]
    fn test_config_builder() {
        let config = QuicConfig::new()
            .garbage_collect_interval(Duration::from_millis(50))
            .max_unused_duration(Duration::from_millis(10));

        assert_eq!(config.garbage_collect_interval, Duration::from_millis(50));
        assert_eq!(config.max_unused_duration, Duration::from_millis(10));
    }
}
