//! Service container handed to step functions.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A read-only map from service key to shared service instance.
///
/// Steps resolve their collaborators (repositories, gateways, clients) from
/// the container instead of capturing them, so the same flow definition can
/// run against different wiring per call.
#[derive(Clone, Default)]
pub struct Container {
    services: Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the container with `service` registered under `key`.
    pub fn with<T: Send + Sync + 'static>(mut self, key: impl Into<String>, service: T) -> Self {
        Arc::make_mut(&mut self.services).insert(key.into(), Arc::new(service));
        self
    }

    /// Registers a service under `key`, replacing any previous entry.
    pub fn register<T: Send + Sync + 'static>(&mut self, key: impl Into<String>, service: Arc<T>) {
        Arc::make_mut(&mut self.services).insert(key.into(), service);
    }

    /// Resolves the service stored under `key` if it has type `T`.
    pub fn resolve<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.services
            .get(key)
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.services.contains_key(key)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.services.keys().collect();
        keys.sort();
        f.debug_struct("Container").field("services", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CartService {
        prefix: &'static str,
    }

    #[test]
    fn resolve_registered_service() {
        let container = Container::new().with("cart", CartService { prefix: "cart_" });

        let service = container.resolve::<CartService>("cart").unwrap();
        assert_eq!(service.prefix, "cart_");
    }

    #[test]
    fn resolve_with_wrong_type_is_none() {
        let container = Container::new().with("cart", CartService { prefix: "cart_" });
        assert!(container.resolve::<String>("cart").is_none());
        assert!(container.resolve::<CartService>("order").is_none());
    }

    #[test]
    fn clones_do_not_share_later_registrations() {
        let base = Container::new().with("cart", CartService { prefix: "cart_" });
        let mut extended = base.clone();
        extended.register("region", Arc::new("eu".to_string()));

        assert!(extended.contains("region"));
        assert!(!base.contains("region"));
    }
}
