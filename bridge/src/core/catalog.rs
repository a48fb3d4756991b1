//! Registered capability servers.
//!
//! Fed by the registration API and updated by health tracking. Removal is
//! soft: the record keeps a `deleted_at` timestamp but is invisible to
//! lookups.

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;

use super::config::{ServerConfig, ServerDefinition, ServerEdit, ServerId, ServerStatus};
use crate::error::{BridgeError, BridgeResult};

#[derive(Default)]
pub struct ServerCatalog {
    servers: DashMap<ServerId, ServerConfig>,
}

impl ServerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server. A previously removed id may be registered again.
    pub fn register(&self, definition: ServerDefinition) -> BridgeResult<ServerConfig> {
        definition.validate()?;
        let id = definition.id.clone();

        match self.servers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if !entry.get().is_removed() {
                    return Err(BridgeError::Config(format!(
                        "server '{}' is already registered",
                        id
                    )));
                }
                let config = ServerConfig::from_definition(definition);
                entry.insert(config.clone());
                info!(server_id = %id, "Re-registered server");
                Ok(config)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let config = ServerConfig::from_definition(definition);
                entry.insert(config.clone());
                info!(server_id = %id, transport = config.transport.kind().as_str(), "Registered server");
                Ok(config)
            }
        }
    }

    pub fn update(&self, id: &ServerId, edit: ServerEdit) -> BridgeResult<ServerConfig> {
        if let Some(transport) = &edit.transport {
            transport.validate()?;
        }
        let mut entry = self
            .servers
            .get_mut(id)
            .filter(|e| !e.is_removed())
            .ok_or_else(|| BridgeError::ServerNotFound(id.to_string()))?;

        if let Some(name) = edit.name {
            entry.name = name;
        }
        if let Some(tenant_id) = edit.tenant_id {
            entry.tenant_id = tenant_id;
        }
        if let Some(transport) = edit.transport {
            entry.transport = transport;
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    pub fn remove(&self, id: &ServerId) -> BridgeResult<ServerConfig> {
        let mut entry = self
            .servers
            .get_mut(id)
            .filter(|e| !e.is_removed())
            .ok_or_else(|| BridgeError::ServerNotFound(id.to_string()))?;

        let now = Utc::now();
        entry.deleted_at = Some(now);
        entry.updated_at = now;
        entry.status = ServerStatus::Inactive;
        info!(server_id = %id, "Removed server");
        Ok(entry.clone())
    }

    pub fn get(&self, id: &ServerId) -> Option<ServerConfig> {
        self.servers
            .get(id)
            .filter(|e| !e.is_removed())
            .map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.get(id).is_some()
    }

    /// Live servers ordered by id.
    pub fn list(&self) -> Vec<ServerConfig> {
        let mut servers: Vec<ServerConfig> = self
            .servers
            .iter()
            .filter(|e| !e.is_removed())
            .map(|e| e.value().clone())
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    pub fn ids(&self) -> Vec<ServerId> {
        self.list().into_iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.iter().filter(|e| !e.is_removed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mirror health state into the stored record.
    pub(crate) fn apply_health(
        &self,
        id: &ServerId,
        consecutive_failures: u32,
        status: ServerStatus,
        checked: bool,
    ) {
        if let Some(mut entry) = self.servers.get_mut(id) {
            if entry.is_removed() {
                return;
            }
            entry.consecutive_failures = consecutive_failures;
            entry.status = status;
            if checked {
                entry.last_health_check = Some(Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TransportConfig;

    fn echo_def(id: &str) -> ServerDefinition {
        ServerDefinition::stdio(id, "acme", "echo-server", vec![])
    }

    #[test]
    fn test_register_and_get() {
        let catalog = ServerCatalog::new();
        let config = catalog.register(echo_def("echo")).unwrap();
        assert_eq!(config.status, ServerStatus::Active);
        assert_eq!(config.consecutive_failures, 0);
        assert!(config.last_health_check.is_none());

        let fetched = catalog.get(&ServerId::new("echo")).unwrap();
        assert_eq!(fetched.tenant_id.as_str(), "acme");
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let catalog = ServerCatalog::new();
        catalog.register(echo_def("echo")).unwrap();
        assert!(matches!(
            catalog.register(echo_def("echo")),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_soft_remove_hides_server() {
        let catalog = ServerCatalog::new();
        catalog.register(echo_def("echo")).unwrap();
        let id = ServerId::new("echo");

        let removed = catalog.remove(&id).unwrap();
        assert!(removed.is_removed());
        assert_eq!(removed.status, ServerStatus::Inactive);

        assert!(catalog.get(&id).is_none());
        assert!(catalog.is_empty());
        assert!(matches!(
            catalog.remove(&id),
            Err(BridgeError::ServerNotFound(_))
        ));

        // Removed ids can be reused.
        assert!(catalog.register(echo_def("echo")).is_ok());
    }

    #[test]
    fn test_update_transport() {
        let catalog = ServerCatalog::new();
        let original = catalog.register(echo_def("echo")).unwrap();
        let id = ServerId::new("echo");

        let updated = catalog
            .update(
                &id,
                ServerEdit {
                    name: Some("Echo v2".to_string()),
                    transport: Some(TransportConfig::Stdio {
                        command: "echo-server-v2".to_string(),
                        args: vec![],
                        env: Default::default(),
                    }),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.name, "Echo v2");
        assert_ne!(updated.transport, original.transport);
        assert!(updated.updated_at >= original.updated_at);

        let invalid = ServerEdit {
            transport: Some(TransportConfig::Stdio {
                command: String::new(),
                args: vec![],
                env: Default::default(),
            }),
            ..Default::default()
        };
        assert!(catalog.update(&id, invalid).is_err());
        assert!(catalog.update(&ServerId::new("missing"), ServerEdit::default()).is_err());
    }

    #[test]
    fn test_list_is_sorted() {
        let catalog = ServerCatalog::new();
        catalog.register(echo_def("b")).unwrap();
        catalog.register(echo_def("a")).unwrap();
        catalog.register(echo_def("c")).unwrap();
        catalog.remove(&ServerId::new("c")).unwrap();

        let ids: Vec<String> = catalog.ids().into_iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_apply_health() {
        let catalog = ServerCatalog::new();
        catalog.register(echo_def("echo")).unwrap();
        let id = ServerId::new("echo");

        catalog.apply_health(&id, 2, ServerStatus::Error, true);
        let config = catalog.get(&id).unwrap();
        assert_eq!(config.consecutive_failures, 2);
        assert_eq!(config.status, ServerStatus::Error);
        assert!(config.last_health_check.is_some());
    }
}
