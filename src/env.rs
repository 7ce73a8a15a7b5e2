use std::path::PathBuf;

/// Device RNR retry count that programs the firmware to retry indefinitely.
pub const RNR_INFINITE_RETRY: u8 = 7;

/// Memory interface of a data buffer.
///
/// Protocol thresholds (medium cut-off, read threshold, runt size) are
/// tuned separately for host and device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemIface {
    System = 0,
    Device = 1,
}

impl MemIface {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Endpoint configuration. Every field is read once at endpoint init.
#[derive(Debug, Clone)]
pub struct Config {
    /// Floor for the per-peer in-flight packet budget.
    pub tx_min_credits: usize,
    /// Device send queue depth; also the default per-peer credit pool.
    pub tx_queue_size: usize,
    /// Device receive queue depth.
    pub rx_size: usize,
    /// Receive-side message-id reorder window, in messages.
    pub recvwin_size: usize,
    /// Window (bytes) advertised in each CTS.
    pub cts_window_size: u64,
    /// User completion queue depth.
    pub cq_size: usize,
    /// Wire packet maximum, including headers.
    pub mtu_size: usize,
    /// Device completions drained per progress tick.
    pub cq_read_size: usize,
    /// Maximum bytes submitted per one-sided read work request.
    pub read_segment_size: usize,
    /// Maximum bytes submitted per one-sided write work request.
    pub write_segment_size: usize,
    /// Device-level retries before a send surfaces RNR (0..=7, 7 = infinite).
    pub rnr_retry: u8,
    /// When set, the endpoint queues and retries packets that hit RNR.
    /// When cleared the application manages receiver resources itself and
    /// gets a single error completion per affected operation instead.
    pub provider_managed_resources: bool,
    /// First backoff interval after an RNR, microseconds.
    pub rnr_backoff_initial_wait: u64,
    /// Backoff interval cap, microseconds.
    pub rnr_backoff_wait_cap: u64,
    /// Zero-copy receive: post user buffers to the device and keep exactly
    /// one internal buffer posted for control traffic.
    pub use_zcpy_rx: bool,
    /// Allow one-sided device transfers where the hardware supports them.
    pub use_device_rdma: bool,
    /// Forward operations to the shared-memory collaborator for co-located
    /// peers.
    pub enable_shm_transfer: bool,
    /// Largest message forwarded through the SHM medium path.
    pub shm_max_medium_size: usize,
    /// Maximum payload for inject-shaped calls.
    pub inject_size: usize,
    /// A multi-recv buffer is retired once its remaining space drops
    /// below this.
    pub min_multi_recv_size: usize,
    /// Size of the application-owned prefix at the front of the first
    /// data segment, skipped by the transport.
    pub msg_prefix_size: usize,
    /// Buffers added per pool grow, for the device RX pool.
    pub rx_pool_chunk_size: usize,
    /// Buffers added per pool grow, for the unexpected packet pool.
    pub unexp_pool_chunk_size: usize,
    /// Buffers added per pool grow, for the out-of-order packet pool.
    pub ooo_pool_chunk_size: usize,
    /// Total size cap of the registered read-copy pool, in buffers.
    pub readcopy_pool_size: usize,
    /// Messages at or above this size use a read-based protocol,
    /// indexed by [`MemIface`].
    pub min_read_msg_size: [usize; 2],
    /// Largest message sent with the medium protocol, indexed by
    /// [`MemIface`].
    pub max_medium_msg_size: [usize; 2],
    /// Bytes sent inline by the runting-read protocol, shared between all
    /// in-flight runts of a peer, indexed by [`MemIface`].
    pub runt_size: [usize; 2],
    /// Optional file carrying a hex host id in the 16 characters
    /// starting at its 4th character.
    pub host_id_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tx_min_credits: 32,
            tx_queue_size: 64,
            rx_size: 1024,
            recvwin_size: 16384,
            cts_window_size: 1 << 20,
            cq_size: 8192,
            mtu_size: 8192,
            cq_read_size: 50,
            read_segment_size: 1 << 30,
            write_segment_size: 1 << 30,
            rnr_retry: 3,
            provider_managed_resources: true,
            rnr_backoff_initial_wait: 1000,
            rnr_backoff_wait_cap: 1_000_000,
            use_zcpy_rx: false,
            use_device_rdma: true,
            enable_shm_transfer: true,
            shm_max_medium_size: 4096,
            inject_size: 2048,
            min_multi_recv_size: 1024,
            msg_prefix_size: 0,
            rx_pool_chunk_size: 64,
            unexp_pool_chunk_size: 64,
            ooo_pool_chunk_size: 64,
            readcopy_pool_size: 64,
            min_read_msg_size: [1 << 20, 256 * 1024],
            max_medium_msg_size: [65536, 65536],
            runt_size: [307200, 307200],
            host_id_file: None,
        }
    }
}

impl Config {
    /// Parse the host id from `host_id_file`.
    ///
    /// The 16 hex characters starting at the 4th character of the file
    /// (an instance-id-style string such as `i-0f7c826e5f3bd8685`) are
    /// converted to an 8-byte integer. Parsing is best-effort: a missing
    /// file, a short file or a non-hex string all yield the default host
    /// id 0.
    pub fn host_id(&self) -> u64 {
        let Some(path) = &self.host_id_file else {
            return 0;
        };
        let Ok(contents) = std::fs::read(path) else {
            return 0;
        };
        let Some(window) = contents.get(3..19) else {
            return 0;
        };
        let Ok(hex) = std::str::from_utf8(window) else {
            return 0;
        };
        u64::from_str_radix(hex, 16).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn host_id_parses_instance_id_style_string() {
        let mut file = tempfile_path("rdm-host-id-ok");
        write!(file.1, "i-0f7c826e5f3bd8685").unwrap();
        let cfg = Config {
            host_id_file: Some(file.0.clone()),
            ..Config::default()
        };
        assert_eq!(cfg.host_id(), 0xf7c826e5f3bd8685);
        std::fs::remove_file(file.0).ok();
    }

    #[test]
    fn host_id_defaults_to_zero_on_garbage() {
        let mut file = tempfile_path("rdm-host-id-bad");
        write!(file.1, "quickfoxbrownfence").unwrap();
        let cfg = Config {
            host_id_file: Some(file.0.clone()),
            ..Config::default()
        };
        assert_eq!(cfg.host_id(), 0);
        std::fs::remove_file(file.0).ok();
    }

    #[test]
    fn host_id_defaults_to_zero_on_short_file() {
        let mut file = tempfile_path("rdm-host-id-short");
        write!(file.1, "789e1cab").unwrap();
        let cfg = Config {
            host_id_file: Some(file.0.clone()),
            ..Config::default()
        };
        assert_eq!(cfg.host_id(), 0);
        std::fs::remove_file(file.0).ok();
    }

    #[test]
    fn host_id_defaults_to_zero_on_missing_file() {
        let cfg = Config {
            host_id_file: Some(PathBuf::from("/nonexistent/rdm-host-id")),
            ..Config::default()
        };
        assert_eq!(cfg.host_id(), 0);
    }

    fn tempfile_path(name: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("{}-{}", name, std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
