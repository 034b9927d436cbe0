use std::sync::Arc;

use society_api::{
    Backend, BackendConfig, BackendKind, ConnectorFactory, SecretStore, SocietyError,
};

mod memory;
mod supabase;

pub use memory::{BackendCall, BackendOp, MemoryBackend};
pub use supabase::SupabaseBackend;

pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, secret_ref: &str) -> Result<String, SocietyError> {
        std::env::var(secret_ref)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SocietyError::NotFound(format!("missing secret env var {secret_ref}")))
    }
}

#[derive(Default)]
pub struct DefaultConnectorFactory;

impl ConnectorFactory for DefaultConnectorFactory {
    fn build(
        &self,
        cfg: &BackendConfig,
        secrets: &dyn SecretStore,
    ) -> Result<Arc<dyn Backend>, SocietyError> {
        match cfg.kind {
            BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
            BackendKind::Supabase => {
                let anon_key = secrets.get(&cfg.secret_ref)?;
                Ok(Arc::new(SupabaseBackend::new(cfg, anon_key)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    struct MapSecrets(BTreeMap<String, String>);

    impl SecretStore for MapSecrets {
        fn get(&self, secret_ref: &str) -> Result<String, SocietyError> {
            self.0
                .get(secret_ref)
                .cloned()
                .ok_or_else(|| SocietyError::NotFound(secret_ref.to_string()))
        }
    }

    fn config(kind: BackendKind) -> BackendConfig {
        BackendConfig {
            kind,
            base_url: "http://127.0.0.1:54321".to_string(),
            secret_ref: "ANON".to_string(),
            request_timeout_ms: 1_000,
            signup_on_invalid_credentials: true,
        }
    }

    #[test]
    fn memory_backend_needs_no_secret() {
        let secrets = MapSecrets(BTreeMap::new());
        let backend = DefaultConnectorFactory
            .build(&config(BackendKind::Memory), &secrets)
            .unwrap();
        assert!(backend.export_session().is_none());
    }

    #[test]
    fn supabase_backend_requires_its_key() {
        let empty = MapSecrets(BTreeMap::new());
        let err = DefaultConnectorFactory
            .build(&config(BackendKind::Supabase), &empty)
            .err()
            .unwrap();
        assert_eq!(err, SocietyError::NotFound("ANON".to_string()));

        let secrets = MapSecrets(BTreeMap::from([("ANON".to_string(), "key".to_string())]));
        assert!(DefaultConnectorFactory
            .build(&config(BackendKind::Supabase), &secrets)
            .is_ok());
    }
}
