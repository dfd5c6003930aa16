//! Mapping from table names to the handlers bound to them.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::consumer::RowsEventHandler;

/// Filter key binding a handler to every table.
pub const ALL_TABLES: &str = "";

/// Thread-safe, append-only mapping from a table filter to the handlers
/// registered for it, in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn RowsEventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Appends handlers to the list of `table_filter`.
    /// [`ALL_TABLES`] binds them to every table.
    ///
    /// Registering the same handler twice under one filter makes it run
    /// twice per event. This is allowed, but reported.
    pub async fn register<I>(&self, table_filter: &str, handlers: I)
    where
        I: IntoIterator<Item = Arc<dyn RowsEventHandler>>,
    {
        let mut map = self.handlers.write().await;
        let registered = map.entry(table_filter.to_string()).or_default();

        for handler in handlers {
            if registered.iter().any(|h| Arc::ptr_eq(h, &handler)) {
                warn!(
                    handler = %handler,
                    table_filter,
                    "Handler registered more than once for the same table filter, \
                     it will run once per registration"
                );
            }
            registered.push(handler);
        }
    }

    /// Returns handlers registered for `table_name` followed by the ones
    /// registered for all tables, each group in registration order.
    /// An empty table name only matches the all-tables handlers.
    pub async fn handlers_for(&self, table_name: &str) -> Vec<Arc<dyn RowsEventHandler>> {
        let map = self.handlers.read().await;

        let exact = (!table_name.is_empty())
            .then(|| map.get(table_name))
            .flatten()
            .into_iter()
            .flatten();
        let wildcard = map.get(ALL_TABLES).into_iter().flatten();

        exact.chain(wildcard).cloned().collect()
    }

    /// Returns every `(table_filter, handler)` registration.
    pub async fn registrations(&self) -> Vec<(String, Arc<dyn RowsEventHandler>)> {
        let map = self.handlers.read().await;

        map.iter()
            .flat_map(|(filter, handlers)| {
                handlers
                    .iter()
                    .map(move |handler| (filter.clone(), Arc::clone(handler)))
            })
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utilities::RecordingHandler;

    fn names(handlers: &[Arc<dyn RowsEventHandler>]) -> Vec<String> {
        handlers.iter().map(|h| h.to_string()).collect()
    }

    #[tokio::test]
    async fn test_exact_handlers_come_before_wildcard() {
        let registry = HandlerRegistry::new();
        registry
            .register(ALL_TABLES, [RecordingHandler::new("audit").into_dyn()])
            .await;
        registry
            .register(
                "orders",
                [
                    RecordingHandler::new("search").into_dyn(),
                    RecordingHandler::new("cache").into_dyn(),
                ],
            )
            .await;

        assert_eq!(
            names(&registry.handlers_for("orders").await),
            vec!["search", "cache", "audit"]
        );
        assert_eq!(names(&registry.handlers_for("customers").await), vec!["audit"]);
    }

    #[tokio::test]
    async fn test_empty_table_name_only_gets_wildcard() {
        let registry = HandlerRegistry::new();
        registry
            .register("orders", [RecordingHandler::new("search").into_dyn()])
            .await;

        assert!(registry.handlers_for("").await.is_empty());
        assert!(registry.handlers_for("customers").await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_kept() {
        let registry = HandlerRegistry::new();
        let handler = RecordingHandler::new("search").into_dyn();
        registry.register("orders", [handler.clone()]).await;
        registry.register("orders", [handler]).await;

        assert_eq!(registry.handlers_for("orders").await.len(), 2);
        assert_eq!(registry.registrations().await.len(), 2);
    }

    #[tokio::test]
    async fn test_registrations_cover_every_filter() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty().await);

        registry
            .register("orders", [RecordingHandler::new("search").into_dyn()])
            .await;
        registry
            .register(ALL_TABLES, [RecordingHandler::new("audit").into_dyn()])
            .await;

        let mut registrations: Vec<_> = registry
            .registrations()
            .await
            .into_iter()
            .map(|(filter, handler)| (filter, handler.to_string()))
            .collect();
        registrations.sort();

        assert_eq!(
            registrations,
            vec![
                (String::new(), "audit".to_string()),
                ("orders".to_string(), "search".to_string()),
            ]
        );
        assert!(!registry.is_empty().await);
    }
}
