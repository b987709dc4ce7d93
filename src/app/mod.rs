use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::logging::Logger;
use crate::metrics::Metrics;
use crate::router::Router;
use crate::store::Store;

// Shared wiring for every worker: collaborators, client-facing knobs, and
// the registry of device ids currently connected to this process.
pub struct Application {
    logger: Arc<Logger>,
    metrics: Arc<Metrics>,
    store: Arc<dyn Store>,
    router: Arc<dyn Router>,
    clients: Mutex<HashSet<String>>,
    client_min_ping: Duration,
    client_hello_timeout: Duration,
    push_long_pongs: bool,
}

impl Application {
    pub fn new(
        logger: Arc<Logger>,
        metrics: Arc<Metrics>,
        store: Arc<dyn Store>,
        router: Arc<dyn Router>,
        client_config: &ClientConfig,
    ) -> Self {
        Self {
            logger,
            metrics,
            store,
            router,
            clients: Mutex::new(HashSet::new()),
            client_min_ping: Duration::from_secs(client_config.min_ping_secs),
            client_hello_timeout: Duration::from_secs(client_config.hello_timeout_secs),
            push_long_pongs: client_config.long_pongs,
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn router(&self) -> &dyn Router {
        self.router.as_ref()
    }

    pub fn client_min_ping(&self) -> Duration {
        self.client_min_ping
    }

    pub fn client_hello_timeout(&self) -> Duration {
        self.client_hello_timeout
    }

    pub fn push_long_pongs(&self) -> bool {
        self.push_long_pongs
    }

    pub fn client_exists(&self, device_id: &str) -> bool {
        self.clients
            .lock()
            .expect("client registry lock poisoned")
            .contains(device_id)
    }

    pub fn add_client(&self, device_id: &str) -> bool {
        self.clients
            .lock()
            .expect("client registry lock poisoned")
            .insert(device_id.to_owned())
    }

    pub fn remove_client(&self, device_id: &str) {
        self.clients
            .lock()
            .expect("client registry lock poisoned")
            .remove(device_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .expect("client registry lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::ClientConfig;
    use crate::logging::{LogLevel, Logger, LoggerConfig};
    use crate::metrics::Metrics;
    use crate::router::{LocalRouter, Router};
    use crate::store::MemoryStore;

    use super::Application;

    fn test_application(client_config: &ClientConfig) -> Application {
        let logger = Arc::new(Logger::new(LoggerConfig {
            min_level: LogLevel::Error,
            human_friendly: false,
        }));
        let router: Arc<dyn Router> =
            Arc::new(LocalRouter::new(&crate::config::RouterConfig::default()));
        Application::new(
            logger,
            Arc::new(Metrics::default()),
            Arc::new(MemoryStore::new(200, Duration::ZERO)),
            router,
            client_config,
        )
    }

    #[test]
    fn client_registry_tracks_connected_devices() {
        let app = test_application(&ClientConfig::default());

        assert!(!app.client_exists("dev1"));
        assert!(app.add_client("dev1"));
        assert!(!app.add_client("dev1"));
        assert!(app.client_exists("dev1"));
        assert_eq!(app.client_count(), 1);

        app.remove_client("dev1");
        assert!(!app.client_exists("dev1"));
        assert_eq!(app.client_count(), 0);
    }

    #[test]
    fn client_knobs_come_from_config() {
        let app = test_application(&ClientConfig {
            min_ping_secs: 7,
            hello_timeout_secs: 11,
            long_pongs: true,
        });

        assert_eq!(app.client_min_ping(), Duration::from_secs(7));
        assert_eq!(app.client_hello_timeout(), Duration::from_secs(11));
        assert!(app.push_long_pongs());
    }
}
