use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::TtlStore;

/// How long a tunnel record survives without a heartbeat.
pub const CONNECTION_TTL: Duration = Duration::from_secs(300);

/// Live-tunnel record the edge uses to route a subdomain to an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConnectionInfo {
    pub workspace_id: String,
    pub user_id: String,
    pub subdomain: String,
    pub primary_port: u16,
    /// Named additional services, reachable via `<subdomain>-<name>`.
    pub exposed_ports: BTreeMap<String, u16>,
    pub connected_at: DateTime<Utc>,
    pub last_ping_at: DateTime<Utc>,
    pub instance_id: String,
}

impl TunnelConnectionInfo {
    pub fn new(
        workspace_id: impl Into<String>,
        user_id: impl Into<String>,
        subdomain: impl Into<String>,
        primary_port: u16,
        exposed_ports: BTreeMap<String, u16>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workspace_id: workspace_id.into(),
            user_id: user_id.into(),
            subdomain: subdomain.into(),
            primary_port,
            exposed_ports,
            connected_at: now,
            last_ping_at: now,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("workspaceId".to_string(), self.workspace_id.clone());
        fields.insert("userId".to_string(), self.user_id.clone());
        fields.insert("subdomain".to_string(), self.subdomain.clone());
        fields.insert("primaryPort".to_string(), self.primary_port.to_string());
        fields.insert(
            "exposedPorts".to_string(),
            serde_json::to_string(&self.exposed_ports).unwrap_or_else(|_| "{}".to_string()),
        );
        fields.insert("connectedAt".to_string(), self.connected_at.to_rfc3339());
        fields.insert("lastPingAt".to_string(), self.last_ping_at.to_rfc3339());
        fields.insert("instanceId".to_string(), self.instance_id.clone());
        fields
    }

    /// Reassemble from a stored hash. Any missing or unparseable required
    /// field means the record is treated as absent, not as an error.
    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            workspace_id: fields.get("workspaceId")?.clone(),
            user_id: fields.get("userId")?.clone(),
            subdomain: fields.get("subdomain")?.clone(),
            primary_port: fields.get("primaryPort")?.parse().ok()?,
            exposed_ports: serde_json::from_str(fields.get("exposedPorts")?).ok()?,
            connected_at: DateTime::parse_from_rfc3339(fields.get("connectedAt")?)
                .ok()?
                .with_timezone(&Utc),
            last_ping_at: DateTime::parse_from_rfc3339(fields.get("lastPingAt")?)
                .ok()?
                .with_timezone(&Utc),
            instance_id: fields.get("instanceId")?.clone(),
        })
    }

    /// Hostnames this record claims: the primary subdomain plus one derived
    /// `<subdomain>-<service>` per exposed service.
    fn hostnames(&self) -> Vec<(String, u16)> {
        let mut names = vec![(self.subdomain.clone(), self.primary_port)];
        for (service, port) in &self.exposed_ports {
            names.push((format!("{}-{}", self.subdomain, service), *port));
        }
        names
    }
}

fn conn_key(subdomain: &str) -> String {
    format!("tunnel:conn:{subdomain}")
}

fn service_port_key(fqdn: &str) -> String {
    format!("tunnel:service:port:{fqdn}")
}

fn service_base_key(fqdn: &str) -> String {
    format!("tunnel:service:base:{fqdn}")
}

fn user_key(user_id: &str) -> String {
    format!("tunnel:user:{user_id}")
}

/// Shared registry mapping subdomains and service hostnames to live tunnels.
///
/// Readers (edge instances) may be many; the writer for any one subdomain is
/// assumed to be a single agent session. Two agents registering or
/// heartbeating the same subdomain concurrently is an unsynchronized race the
/// caller must prevent upstream (one active session per workspace).
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    store: TtlStore,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build over an existing store handle so several edge components share
    /// one set of keys.
    pub fn with_store(store: TtlStore) -> Self {
        Self { store }
    }

    /// Record a newly attached agent: the main per-subdomain hash, a
    /// `servicePort`/`serviceBase` index pair per hostname, and membership in
    /// the owner's active-tunnel set, all under [`CONNECTION_TTL`].
    ///
    /// The writes go out as one batched sequence and are not transactional; a
    /// crash mid-batch can leave a partial registration behind until the TTL
    /// clears it.
    pub fn register_connection(&self, info: &TunnelConnectionInfo) {
        self.store
            .put_hash(&conn_key(&info.subdomain), info.to_fields(), Some(CONNECTION_TTL));

        for (fqdn, port) in info.hostnames() {
            self.store.put_string(
                &service_port_key(&fqdn),
                &port.to_string(),
                Some(CONNECTION_TTL),
            );
            self.store
                .put_string(&service_base_key(&fqdn), &info.subdomain, Some(CONNECTION_TTL));
        }

        self.store
            .set_add(&user_key(&info.user_id), &info.workspace_id);

        tracing::info!(
            subdomain = %info.subdomain,
            workspace_id = %info.workspace_id,
            services = info.exposed_ports.len(),
            "Registered tunnel connection"
        );
    }

    /// Resolve a subdomain to its live record. Expired or partially written
    /// records read as absent.
    pub fn get_connection(&self, subdomain: &str) -> Option<TunnelConnectionInfo> {
        let fields = self.store.get_hash(&conn_key(subdomain))?;
        TunnelConnectionInfo::from_fields(&fields)
    }

    /// Refresh the TTL on the main record and every secondary index key
    /// without touching stored values. Returns `false` (no-op) once the
    /// record has already expired.
    pub fn update_heartbeat(&self, subdomain: &str) -> bool {
        let Some(info) = self.get_connection(subdomain) else {
            tracing::debug!(subdomain, "Heartbeat for expired or unknown tunnel, ignoring");
            return false;
        };

        self.store.expire(&conn_key(subdomain), CONNECTION_TTL);
        for (fqdn, _) in info.hostnames() {
            self.store.expire(&service_port_key(&fqdn), CONNECTION_TTL);
            self.store.expire(&service_base_key(&fqdn), CONNECTION_TTL);
        }
        true
    }

    /// Routing hot path: local port for a fully-qualified service hostname.
    pub fn get_service_port(&self, fqdn: &str) -> Option<u16> {
        self.store.get_string(&service_port_key(fqdn))?.parse().ok()
    }

    /// Routing hot path: owning subdomain for a fully-qualified hostname.
    pub fn get_service_base(&self, fqdn: &str) -> Option<String> {
        self.store.get_string(&service_base_key(fqdn))
    }

    /// Delete the main record, all secondary keys, and the user-set entry.
    /// A no-op if nothing is registered for the subdomain.
    pub fn remove_connection(&self, subdomain: &str) {
        let Some(info) = self.get_connection(subdomain) else {
            return;
        };

        for (fqdn, _) in info.hostnames() {
            self.store.delete(&service_port_key(&fqdn));
            self.store.delete(&service_base_key(&fqdn));
        }
        self.store.delete(&conn_key(subdomain));
        self.store
            .set_remove(&user_key(&info.user_id), &info.workspace_id);

        tracing::info!(subdomain, "Removed tunnel connection");
    }

    /// Number of active tunnels for a user, for external quota enforcement.
    pub fn user_tunnel_count(&self, user_id: &str) -> usize {
        self.store.set_len(&user_key(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TunnelConnectionInfo {
        TunnelConnectionInfo::new(
            "ws-1",
            "user-1",
            "blue-otter",
            3000,
            BTreeMap::from([("api".to_string(), 4000), ("docs".to_string(), 8080)]),
        )
    }

    #[tokio::test]
    async fn test_register_then_get_returns_same_fields() {
        let registry = ConnectionRegistry::new();
        let info = sample();
        registry.register_connection(&info);

        let read = registry.get_connection("blue-otter").unwrap();
        assert_eq!(read, info);
    }

    #[tokio::test]
    async fn test_service_index_lookups() {
        let registry = ConnectionRegistry::new();
        registry.register_connection(&sample());

        assert_eq!(registry.get_service_port("blue-otter"), Some(3000));
        assert_eq!(registry.get_service_port("blue-otter-api"), Some(4000));
        assert_eq!(registry.get_service_port("blue-otter-docs"), Some(8080));
        assert_eq!(
            registry.get_service_base("blue-otter-api").as_deref(),
            Some("blue-otter")
        );
        assert_eq!(registry.get_service_port("red-fox"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_after_ttl() {
        let registry = ConnectionRegistry::new();
        registry.register_connection(&sample());

        tokio::time::advance(CONNECTION_TTL + Duration::from_secs(1)).await;
        assert!(registry.get_connection("blue-otter").is_none());
        assert_eq!(registry.get_service_port("blue-otter-api"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_extends_without_mutating() {
        let registry = ConnectionRegistry::new();
        let info = sample();
        registry.register_connection(&info);

        tokio::time::advance(Duration::from_secs(250)).await;
        assert!(registry.update_heartbeat("blue-otter"));

        // Past the original TTL, alive only because of the refresh.
        tokio::time::advance(Duration::from_secs(250)).await;
        let read = registry.get_connection("blue-otter").unwrap();
        assert_eq!(read, info);
        assert_eq!(registry.get_service_port("blue-otter-docs"), Some(8080));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_expiry_is_noop() {
        let registry = ConnectionRegistry::new();
        registry.register_connection(&sample());

        tokio::time::advance(CONNECTION_TTL + Duration::from_secs(1)).await;
        assert!(!registry.update_heartbeat("blue-otter"));
        assert!(registry.get_connection("blue-otter").is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_prunes_user_set() {
        let registry = ConnectionRegistry::new();
        let info = sample();
        registry.register_connection(&info);
        assert_eq!(registry.user_tunnel_count("user-1"), 1);

        registry.remove_connection("blue-otter");
        assert!(registry.get_connection("blue-otter").is_none());
        assert_eq!(registry.get_service_base("blue-otter-api"), None);
        assert_eq!(registry.user_tunnel_count("user-1"), 0);

        // Second removal finds nothing to do.
        registry.remove_connection("blue-otter");
    }

    #[tokio::test]
    async fn test_registries_share_a_store() {
        let store = TtlStore::new();
        let writer = ConnectionRegistry::with_store(store.clone());
        let reader = ConnectionRegistry::with_store(store);

        writer.register_connection(&sample());
        assert!(reader.get_connection("blue-otter").is_some());
        assert_eq!(reader.get_service_port("blue-otter-api"), Some(4000));
    }

    #[tokio::test]
    async fn test_user_tunnel_count_across_workspaces() {
        let registry = ConnectionRegistry::new();
        let a = sample();
        let mut b = TunnelConnectionInfo::new("ws-2", "user-1", "red-fox", 5000, BTreeMap::new());
        b.instance_id = "fixed".to_string();

        registry.register_connection(&a);
        registry.register_connection(&b);
        assert_eq!(registry.user_tunnel_count("user-1"), 2);
        assert_eq!(registry.user_tunnel_count("user-2"), 0);

        registry.remove_connection("red-fox");
        assert_eq!(registry.user_tunnel_count("user-1"), 1);
    }
}
