//! Registrar Manager
//!
//! Resolves a grain type to its registration strategy, and a strategy to the
//! registrar instance that implements it. Both maps are filled at startup.

use crate::errors::DirectoryError;
use crate::gsi::registrar::{Registrar, RegistrationStrategy};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct RegistrarManager {
    registrars: HashMap<RegistrationStrategy, Arc<dyn Registrar>>,
    grain_strategies: RwLock<HashMap<String, RegistrationStrategy>>,
    default_strategy: RegistrationStrategy,
}

impl RegistrarManager {
    pub fn new(default_strategy: RegistrationStrategy) -> Self {
        Self {
            registrars: HashMap::new(),
            grain_strategies: RwLock::new(HashMap::new()),
            default_strategy,
        }
    }

    /// Install the registrar for `strategy`.
    pub fn with_registrar(mut self, strategy: RegistrationStrategy, registrar: Arc<dyn Registrar>) -> Self {
        self.registrars.insert(strategy, registrar);
        self
    }

    /// Set the strategy of a grain type.
    pub fn set_strategy(&self, grain_type: impl Into<String>, strategy: RegistrationStrategy) {
        self.grain_strategies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(grain_type.into(), strategy);
    }

    pub fn strategy_for(&self, grain_type: &str) -> RegistrationStrategy {
        self.grain_strategies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(grain_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Registrar responsible for grains of `grain_type`.
    pub fn registrar_for(&self, grain_type: &str) -> Result<Arc<dyn Registrar>, DirectoryError> {
        let strategy = self.strategy_for(grain_type);
        self.registrars
            .get(&strategy)
            .cloned()
            .ok_or_else(|| DirectoryError::NoRegistrarForStrategy {
                strategy: strategy.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::partition::InMemoryDirectoryPartition;
    use crate::gsi::registrar::ClusterLocalRegistrar;

    fn local_registrar() -> Arc<dyn Registrar> {
        Arc::new(ClusterLocalRegistrar::new(Arc::new(InMemoryDirectoryPartition::default())))
    }

    #[test]
    fn test_strategy_defaults_and_overrides() {
        let manager = RegistrarManager::new(RegistrationStrategy::GlobalSingleInstance);
        assert_eq!(manager.strategy_for("Player"), RegistrationStrategy::GlobalSingleInstance);

        manager.set_strategy("Session", RegistrationStrategy::ClusterLocal);
        assert_eq!(manager.strategy_for("Session"), RegistrationStrategy::ClusterLocal);
        assert_eq!(manager.strategy_for("Player"), RegistrationStrategy::GlobalSingleInstance);
    }

    #[test]
    fn test_missing_registrar_is_a_configuration_error() {
        let manager = RegistrarManager::new(RegistrationStrategy::GlobalSingleInstance)
            .with_registrar(RegistrationStrategy::ClusterLocal, local_registrar());
        manager.set_strategy("Session", RegistrationStrategy::ClusterLocal);

        assert!(manager.registrar_for("Session").is_ok());
        let err = manager.registrar_for("Player").err().unwrap();
        assert!(matches!(err, DirectoryError::NoRegistrarForStrategy { .. }));
    }
}
