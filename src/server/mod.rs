//! Proxy core and server.
//!
//! [`Core`] packages the egress registry, dialer, connection table, traffic
//! accountant, admission gate, and store. It is constructed once at startup
//! from the store and shared (via `Arc`) by every frontend and background
//! loop; there is no process-wide mutable state. [`Server`] owns the
//! ingress listeners, the per-connection tasks, and the background loops.

pub mod admission;
pub mod config;
pub mod conntrack;
pub mod traffic;

pub use admission::Admission;
pub use config::{GatewayConfig, Limits, Settings};
pub use conntrack::{ActiveConnection, ConnectionTable};
pub use traffic::{TrafficAccountant, TrafficSnapshot};

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::egress::{Dialer, Egress, EgressMode, EgressSnapshot, Registry, SourceRule};
use crate::error::{Error, Result};
use crate::proxy::{socks5, tunnel};
#[cfg(target_os = "linux")]
use crate::proxy::transparent;
use crate::store::{StatisticsRow, Store};

/// Serialized shape of the source-rule import/export file:
/// egress address → source IP → rule.
type RulesFile = HashMap<String, HashMap<IpAddr, SourceRule>>;

/// One egress plus its live transfer rates, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct EgressTraffic {
    #[serde(flatten)]
    pub egress: EgressSnapshot,
    pub bytes_in_per_sec: u64,
    pub bytes_out_per_sec: u64,
}

/// Everything a frontend needs, constructed once at startup.
pub struct Core {
    pub settings: Settings,
    pub gateway: GatewayConfig,
    pub limits: Limits,
    pub registry: Arc<Registry>,
    pub dialer: Dialer,
    pub table: Arc<ConnectionTable>,
    pub traffic: Arc<TrafficAccountant>,
    pub admission: Arc<Admission>,
    pub store: Arc<Store>,
}

impl Core {
    /// Load settings, gateway config, and the egress set from the store.
    /// Store errors here are fatal.
    pub fn new(store: Store) -> Result<Self> {
        Self::with_limits(store, Limits::default())
    }

    pub fn with_limits(store: Store, limits: Limits) -> Result<Self> {
        let settings = store.load_settings()?;
        let gateway = store.load_gateway()?;

        let mut egresses = Vec::new();
        for row in store.list_egresses()? {
            let mut egress = Egress::new(row.id, row.address, row.interface, row.weight.max(1));
            egress.enabled = row.enabled;
            egress.selections = row.selections;
            egress.success = row.success;
            egress.failure = row.failure;
            egress.bytes_prior = row.bytes;
            egresses.push(egress);
        }
        for rule in store.list_rules()? {
            let Ok(source_ip) = rule.source_ip.parse::<IpAddr>() else {
                warn!(source_ip = %rule.source_ip, "skipping rule with unparsable source IP");
                continue;
            };
            if let Some(egress) = egresses.iter_mut().find(|e| e.id == rule.egress_id) {
                egress.set_rule(SourceRule {
                    source_ip,
                    weight: rule.weight,
                    description: rule.description,
                });
            }
        }
        info!(egresses = egresses.len(), "egress set loaded from store");

        let mode = if settings.tunnel_mode {
            EgressMode::Tunnel
        } else {
            EgressMode::Dispatch
        };

        Ok(Self {
            registry: Arc::new(Registry::new(egresses)),
            dialer: Dialer::new(mode, limits.dial_timeout),
            table: Arc::new(ConnectionTable::new(
                limits.max_connections,
                limits.idle_timeout,
            )),
            traffic: Arc::new(TrafficAccountant::new()),
            admission: Arc::new(Admission::new(limits.max_tasks)),
            store: Arc::new(store),
            settings,
            gateway,
            limits,
        })
    }

    pub fn list_egresses(&self) -> Vec<EgressSnapshot> {
        self.registry.list()
    }

    /// Add an egress, persisting it and appending it to the live set.
    pub fn add_egress(&self, address: &str, interface: &str, weight: u32) -> Result<EgressSnapshot> {
        if weight == 0 {
            return Err(Error::invalid("egress weight must be at least 1"));
        }
        self.validate_address(address)?;
        if self.registry.contains(address) {
            return Err(Error::Duplicate(address.to_string()));
        }
        let id = self.store.insert_egress(address, interface, weight)?;
        let egress = Egress::new(id, address, interface, weight);
        let snapshot = egress.snapshot();
        self.registry.add(egress)?;
        info!(address, interface, weight, "egress added");
        Ok(snapshot)
    }

    /// Remove an egress; its rules cascade both in memory and in the store.
    pub fn remove_egress(&self, address: &str) -> Result<()> {
        self.registry.remove(address)?;
        self.store.delete_egress(address)?;
        info!(address, "egress removed");
        Ok(())
    }

    pub fn set_egress_enabled(&self, address: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(address, enabled)?;
        self.store.set_egress_enabled(address, enabled)?;
        info!(address, enabled, "egress toggled");
        Ok(())
    }

    pub fn set_egress_weight(&self, address: &str, weight: u32) -> Result<()> {
        self.registry.set_weight(address, weight)?;
        self.store.set_egress_weight(address, weight)?;
        info!(address, weight, "egress weight changed");
        Ok(())
    }

    pub fn upsert_rule(
        &self,
        address: &str,
        source_ip: IpAddr,
        weight: u32,
        description: &str,
    ) -> Result<()> {
        self.registry
            .upsert_rule(address, source_ip, weight, description)?;
        let id = self.registry.id_of(address)?;
        self.store
            .upsert_rule(id, &source_ip.to_string(), weight, description)?;
        info!(address, source = %source_ip, weight, "source rule upserted");
        Ok(())
    }

    pub fn delete_rule(&self, address: &str, source_ip: IpAddr) -> Result<()> {
        self.registry.delete_rule(address, source_ip)?;
        let id = self.registry.id_of(address)?;
        self.store.delete_rule(id, &source_ip.to_string())?;
        info!(address, source = %source_ip, "source rule deleted");
        Ok(())
    }

    pub fn list_connections(
        &self,
        source_filter: &str,
        dest_filter: &str,
        limit: usize,
    ) -> Vec<ActiveConnection> {
        self.table.list(source_filter, dest_filter, limit)
    }

    pub fn traffic_snapshot(&self) -> TrafficSnapshot {
        self.traffic.snapshot()
    }

    /// Egress snapshots enriched with their current per-second rates.
    pub fn egress_traffic(&self) -> Vec<EgressTraffic> {
        self.registry
            .list()
            .into_iter()
            .map(|egress| {
                let (bytes_in_per_sec, bytes_out_per_sec) = self.traffic.egress_rate(egress.id);
                EgressTraffic {
                    egress,
                    bytes_in_per_sec,
                    bytes_out_per_sec,
                }
            })
            .collect()
    }

    /// Recently retired connections, oldest first.
    pub fn connection_history(&self) -> Vec<ActiveConnection> {
        self.table.history()
    }

    /// Apply rules from the JSON file named by `settings.config_file`.
    /// A missing file is not an error. Returns the number of rules applied.
    pub fn import_rules_file(&self) -> Result<usize> {
        let path = Path::new(&self.settings.config_file);
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path)?;
        let parsed: RulesFile = serde_json::from_str(&content)
            .map_err(|e| Error::invalid(format!("rules file: {e}")))?;

        let mut applied = 0;
        for (address, rules) in parsed {
            if !self.registry.contains(&address) {
                warn!(address, "rules file references unknown egress");
                continue;
            }
            for (source_ip, rule) in rules {
                self.upsert_rule(&address, source_ip, rule.weight, &rule.description)?;
                applied += 1;
            }
        }
        info!(applied, "source rules imported");
        Ok(applied)
    }

    /// Write the current rule set to the JSON file named by
    /// `settings.config_file`.
    pub fn export_rules_file(&self) -> Result<()> {
        let mut file: RulesFile = HashMap::new();
        for (address, rule) in self.registry.all_rules() {
            file.entry(address).or_default().insert(rule.source_ip, rule);
        }
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::invalid(format!("rules file: {e}")))?;
        std::fs::write(&self.settings.config_file, content)?;
        Ok(())
    }

    /// Write live egress counters and a statistics snapshot to the store.
    pub fn sync_to_store(&self) -> Result<()> {
        self.store.sync_counters(&self.registry.list())?;
        let snapshot = self.traffic.snapshot();
        self.store.append_statistics(&StatisticsRow {
            total_connections: snapshot.total_connections,
            total_bytes_in: snapshot.bytes_in,
            total_bytes_out: snapshot.bytes_out,
            uptime_seconds: snapshot.uptime_secs as f64,
        })?;
        Ok(())
    }

    fn validate_address(&self, address: &str) -> Result<()> {
        match self.dialer.mode() {
            EgressMode::Dispatch => {
                address.parse::<Ipv4Addr>().map_err(|_| {
                    Error::invalid(format!("{address} is not an IPv4 address"))
                })?;
            }
            EgressMode::Tunnel => {
                let valid = address
                    .rsplit_once(':')
                    .map(|(host, port)| !host.is_empty() && port.parse::<u16>().map(|p| p > 0).unwrap_or(false))
                    .unwrap_or(false);
                if !valid {
                    return Err(Error::invalid(format!(
                        "{address} is not a host:port relay address"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Ingress listeners plus the background loops.
pub struct Server {
    core: Arc<Core>,
}

impl Server {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Bind the configured ingress address and serve until the stop channel
    /// fires. On stop the acceptor is closed first and a final counter sync
    /// runs; in-flight relays finish naturally.
    pub async fn run(&self, stop_rx: mpsc::Receiver<()>) -> Result<()> {
        self.core.settings.validate()?;
        let listener = TcpListener::bind(self.core.settings.listen_addr()).await?;
        self.run_with_listener(listener, stop_rx).await
    }

    /// Serve on an already-bound ingress listener.
    pub async fn run_with_listener(
        &self,
        listener: TcpListener,
        mut stop_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let core = &self.core;
        info!(
            addr = %listener.local_addr()?,
            mode = ?core.dialer.mode(),
            "ingress listening"
        );
        log_egress_banner(core);

        #[cfg(target_os = "linux")]
        if core.gateway.enabled {
            let addr = format!("0.0.0.0:{}", core.gateway.transparent_port);
            let transparent_listener = TcpListener::bind(&addr).await?;
            info!(%addr, "transparent ingress listening");
            let core = Arc::clone(&self.core);
            tokio::spawn(async move { accept_transparent(core, transparent_listener).await });
        }

        self.spawn_background_loops();

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }

        info!("shutting down, syncing store");
        let core = Arc::clone(&self.core);
        match tokio::task::spawn_blocking(move || core.sync_to_store()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "final store sync failed"),
            Err(err) => warn!(error = %err, "final store sync task failed"),
        }
        Ok(())
    }

    fn spawn_background_loops(&self) {
        let table = Arc::clone(&self.core.table);
        let reap_interval = self.core.limits.reap_interval;
        tokio::spawn(async move { table.run_reaper(reap_interval).await });

        let traffic = Arc::clone(&self.core.traffic);
        let registry = Arc::clone(&self.core.registry);
        let sample_interval = self.core.limits.sample_interval;
        tokio::spawn(async move { traffic.run_sampler(registry, sample_interval).await });

        let admission = Arc::clone(&self.core.admission);
        let monitor_table = Arc::clone(&self.core.table);
        let monitor_interval = self.core.limits.monitor_interval;
        tokio::spawn(async move { admission.run_monitor(monitor_table, monitor_interval).await });

        let sync_core = Arc::clone(&self.core);
        let sync_interval = self.core.limits.sync_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sync_interval).await;
                let core = Arc::clone(&sync_core);
                match tokio::task::spawn_blocking(move || core.sync_to_store()).await {
                    Ok(Ok(())) => debug!("store sync complete"),
                    Ok(Err(err)) => {
                        warn!(error = %err, "store sync failed, in-memory state stays authoritative")
                    }
                    Err(err) => warn!(error = %err, "store sync task failed"),
                }
            }
        });
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let Ok(permit) = self.core.admission.try_admit() else {
            debug!(%peer, "admission gate full, dropping connection");
            return;
        };
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            let _permit = permit;
            let result = if core.settings.tunnel_mode {
                tunnel::handle(&core, stream, peer).await
            } else {
                socks5::handle(&core, stream, peer).await
            };
            if let Err(err) = result {
                debug!(%peer, error = %err, "session ended");
            }
        });
    }
}

#[cfg(target_os = "linux")]
async fn accept_transparent(core: Arc<Core>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Ok(permit) = core.admission.try_admit() else {
                    debug!(%peer, "admission gate full, dropping redirected connection");
                    continue;
                };
                let core = Arc::clone(&core);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = transparent::handle(&core, stream, peer).await {
                        debug!(%peer, error = %err, "redirected session ended");
                    }
                });
            }
            Err(err) => warn!(error = %err, "transparent accept failed"),
        }
    }
}

fn log_egress_banner(core: &Core) {
    for (index, egress) in core.registry.list().iter().enumerate() {
        info!(
            index,
            address = %egress.address,
            interface = %egress.interface,
            weight = egress.weight,
            rules = egress.rule_count,
            enabled = egress.enabled,
            "egress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_core() -> Arc<Core> {
        Arc::new(Core::new(Store::open_in_memory().unwrap()).unwrap())
    }

    fn tunnel_core() -> Arc<Core> {
        let store = Store::open_in_memory().unwrap();
        let mut settings = store.load_settings().unwrap();
        settings.tunnel_mode = true;
        store.save_settings(&settings).unwrap();
        Arc::new(Core::new(store).unwrap())
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn client_server_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    #[tokio::test]
    async fn test_socks_session_end_to_end() {
        let core = test_core();
        core.add_egress("127.0.0.1", "", 1).unwrap();
        let origin = spawn_echo().await;

        let (mut client, server, peer) = client_server_pair().await;
        let session_core = Arc::clone(&core);
        let session =
            tokio::spawn(async move { socks5::handle(&session_core, server, peer).await });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [5, 0]);

        let SocketAddr::V4(origin_v4) = origin else {
            panic!("expected IPv4 origin");
        };
        let mut request = vec![5, 1, 0, 1];
        request.extend_from_slice(&origin_v4.ip().octets());
        request.extend_from_slice(&origin_v4.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(client);
        session.await.unwrap().unwrap();

        assert_eq!(core.traffic.total_connections(), 1);
        assert_eq!(core.table.history_count(), 1);
        let snapshot = &core.registry.list()[0];
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.selections, 1);
        assert_eq!(snapshot.bytes_out, 4);
        assert_eq!(snapshot.bytes_in, 4);
    }

    #[tokio::test]
    async fn test_socks_all_egresses_down_reply() {
        let core = test_core();
        core.add_egress("10.255.255.1", "", 1).unwrap();
        core.add_egress("10.255.255.2", "", 1).unwrap();

        let (mut client, server, peer) = client_server_pair().await;
        let session_core = Arc::clone(&core);
        let session =
            tokio::spawn(async move { socks5::handle(&session_core, server, peer).await });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();

        client
            .write_all(&[5, 1, 0, 1, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 3, 0, 1, 0, 0, 0, 0, 0, 0]);

        let result = session.await.unwrap();
        assert!(matches!(result, Err(Error::AllEgressesFailed(2))));

        let snapshots = core.registry.list();
        assert_eq!(snapshots[0].failure, 1);
        assert_eq!(snapshots[1].failure, 1);
    }

    #[tokio::test]
    async fn test_tunnel_session_relays_raw_bytes() {
        let core = tunnel_core();
        let origin = spawn_echo().await;
        core.add_egress(&origin.to_string(), "", 1).unwrap();

        let (mut client, server, peer) = client_server_pair().await;
        let session_core = Arc::clone(&core);
        let session =
            tokio::spawn(async move { tunnel::handle(&session_core, server, peer).await });

        client.write_all(b"raw bytes straight through").await.unwrap();
        let mut echoed = [0u8; 26];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"raw bytes straight through");

        drop(client);
        session.await.unwrap().unwrap();
        assert_eq!(core.registry.list()[0].success, 1);
    }

    #[tokio::test]
    async fn test_selection_alternates_across_sessions() {
        // Two equal-weight egresses: four sequential sessions from one
        // source land on them alternately and the counters agree.
        let core = test_core();
        core.add_egress("127.0.0.1", "", 1).unwrap();
        core.add_egress("127.0.0.2", "", 1).unwrap();
        let origin = spawn_echo().await;

        let mut indices = Vec::new();
        for _ in 0..4 {
            let (stream, selection) = crate::egress::connect_via(
                &core.registry,
                &core.dialer,
                "10.0.0.1".parse().unwrap(),
                &origin.to_string(),
            )
            .await
            .unwrap();
            indices.push(selection.index);
            drop(stream);
        }

        assert_eq!(indices, [0, 1, 0, 1]);
        let snapshots = core.registry.list();
        assert_eq!(snapshots[0].selections, 2);
        assert_eq!(snapshots[1].selections, 2);
    }

    #[tokio::test]
    async fn test_handshake_deadline_closes_client() {
        let limits = Limits {
            handshake_timeout: std::time::Duration::from_millis(50),
            ..Limits::default()
        };
        let core = Arc::new(Core::with_limits(Store::open_in_memory().unwrap(), limits).unwrap());
        core.add_egress("127.0.0.1", "", 1).unwrap();

        // The client connects and then says nothing.
        let (_client, server, peer) = client_server_pair().await;
        let result = socks5::handle(&core, server, peer).await;
        assert!(matches!(
            result,
            Err(Error::Handshake { stage: "deadline", .. })
        ));
    }

    #[tokio::test]
    async fn test_egress_traffic_reports_rates_after_sampling() {
        let core = test_core();
        core.add_egress("127.0.0.1", "", 1).unwrap();
        let id = core.list_egresses()[0].id;

        core.registry.add_bytes(id, 1000, 0);
        core.traffic.tick(&core.registry);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        core.registry.add_bytes(id, 1000, 0);
        core.traffic.tick(&core.registry);

        let traffic = core.egress_traffic();
        assert_eq!(traffic.len(), 1);
        assert!(traffic[0].bytes_in_per_sec > 0);
        assert_eq!(traffic[0].egress.bytes_in, 2000);
    }

    #[test]
    fn test_admin_flow_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dispatchd.db");

        {
            let core = Core::new(Store::open(&db).unwrap()).unwrap();
            core.add_egress("192.168.1.10", "eth0", 3).unwrap();
            assert!(matches!(
                core.add_egress("192.168.1.10", "eth0", 3),
                Err(Error::Duplicate(_))
            ));
            core.upsert_rule("192.168.1.10", "10.0.0.5".parse().unwrap(), 2, "lab")
                .unwrap();
            core.set_egress_weight("192.168.1.10", 4).unwrap();
            core.set_egress_enabled("192.168.1.10", false).unwrap();
        }

        let core = Core::new(Store::open(&db).unwrap()).unwrap();
        let egresses = core.list_egresses();
        assert_eq!(egresses.len(), 1);
        assert_eq!(egresses[0].weight, 4);
        assert!(!egresses[0].enabled);
        assert_eq!(egresses[0].rule_count, 1);

        core.remove_egress("192.168.1.10").unwrap();
        assert!(core.list_egresses().is_empty());
        assert!(core.store.list_rules().unwrap().is_empty());
    }

    #[test]
    fn test_add_egress_validates_address_per_mode() {
        let core = test_core();
        assert!(matches!(
            core.add_egress("not-an-ip", "", 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            core.add_egress("127.0.0.1", "", 0),
            Err(Error::InvalidArgument(_))
        ));

        let tunnel = tunnel_core();
        assert!(matches!(
            tunnel.add_egress("relay-without-port", "", 1),
            Err(Error::InvalidArgument(_))
        ));
        tunnel.add_egress("relay.example.com:1080", "", 1).unwrap();
    }

    #[test]
    fn test_rules_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("rules.json");

        let store = Store::open_in_memory().unwrap();
        let mut settings = store.load_settings().unwrap();
        settings.config_file = rules_path.to_string_lossy().into_owned();
        store.save_settings(&settings).unwrap();

        let core = Core::new(store).unwrap();
        core.add_egress("192.168.1.10", "eth0", 1).unwrap();
        core.upsert_rule("192.168.1.10", "10.0.0.5".parse().unwrap(), 3, "lab")
            .unwrap();
        core.export_rules_file().unwrap();
        core.delete_rule("192.168.1.10", "10.0.0.5".parse().unwrap())
            .unwrap();
        assert_eq!(core.list_egresses()[0].rule_count, 0);

        let applied = core.import_rules_file().unwrap();
        assert_eq!(applied, 1);
        assert_eq!(core.list_egresses()[0].rule_count, 1);
    }

    #[test]
    fn test_import_missing_rules_file_is_noop() {
        let core = test_core();
        assert_eq!(core.import_rules_file().unwrap(), 0);
    }

    #[test]
    fn test_sync_to_store_writes_counters_and_statistics() {
        let core = test_core();
        core.add_egress("127.0.0.1", "", 1).unwrap();
        core.registry.record_success(core.list_egresses()[0].id);
        core.traffic.record_connection();

        core.sync_to_store().unwrap();

        let rows = core.store.list_egresses().unwrap();
        assert_eq!(rows[0].success, 1);
        let stats = core.store.latest_statistics().unwrap().unwrap();
        assert_eq!(stats.total_connections, 1);
    }
}
