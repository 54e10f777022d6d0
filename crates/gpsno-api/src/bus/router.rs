// ── Topic router ──
//
// Ordered list of (filter, handler) routes. Registration appends a new
// route list via `ArcSwap::rcu`, so routing never blocks on a lock.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use regex::Regex;

use super::message::BusMessage;
use crate::error::{BoxError, Error};
use crate::topic::filter_regex;

/// Receives messages routed to a registered filter.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: BusMessage) -> Result<(), BoxError>;
}

struct Route {
    filter: String,
    regex: Regex,
    handler: Arc<dyn MessageHandler>,
}

/// Dispatches inbound messages to the first matching handler.
pub struct Router {
    routes: ArcSwap<Vec<Arc<Route>>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Register `handler` for an MQTT filter (`+` and `#` allowed).
    ///
    /// Routes are tried in registration order.
    pub fn register_handler(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Error> {
        let route = Arc::new(Route {
            filter: filter.to_owned(),
            regex: filter_regex(filter)?,
            handler,
        });

        self.routes.rcu(|routes| {
            let mut next = Vec::clone(routes);
            next.push(Arc::clone(&route));
            next
        });

        tracing::debug!(filter, "registered bus handler");
        Ok(())
    }

    /// Hand `message` to the first handler whose filter matches its topic.
    pub async fn route(&self, message: BusMessage) -> Result<(), Error> {
        let handler = {
            let routes = self.routes.load();
            routes
                .iter()
                .find(|route| route.regex.is_match(&message.topic))
                .map(|route| Arc::clone(&route.handler))
        };

        let Some(handler) = handler else {
            return Err(Error::NoHandler {
                topic: message.topic,
            });
        };

        let topic = message.topic.clone();
        handler
            .handle(message)
            .await
            .map_err(|source| Error::Handler { topic, source })
    }

    /// Registered filters, in routing order.
    pub fn filters(&self) -> Vec<String> {
        self.routes
            .load()
            .iter()
            .map(|route| route.filter.clone())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(&'static str, String)>>,
    }

    struct Tagged(Arc<Recorder>, &'static str);

    #[async_trait]
    impl MessageHandler for Tagged {
        async fn handle(&self, message: BusMessage) -> Result<(), BoxError> {
            self.0.seen.lock().unwrap().push((self.1, message.topic));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(&self, _message: BusMessage) -> Result<(), BoxError> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn first_registered_match_wins() {
        let rec = Arc::new(Recorder::default());
        let router = Router::new();
        router
            .register_handler(
                "gps-no/v1/stations/+",
                Arc::new(Tagged(Arc::clone(&rec), "station")),
            )
            .unwrap();
        router
            .register_handler("gps-no/#", Arc::new(Tagged(Arc::clone(&rec), "catch-all")))
            .unwrap();

        router
            .route(BusMessage::new("gps-no/v1/stations/abc", "{}"))
            .await
            .unwrap();
        router
            .route(BusMessage::new("gps-no/v1/clusters/1", "{}"))
            .await
            .unwrap();

        let seen = rec.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("station", "gps-no/v1/stations/abc".to_owned()),
                ("catch-all", "gps-no/v1/clusters/1".to_owned()),
            ]
        );
        assert_eq!(router.filters(), vec!["gps-no/v1/stations/+", "gps-no/#"]);
    }

    #[tokio::test]
    async fn unmatched_topic_is_no_handler() {
        let router = Router::new();
        let err = router
            .route(BusMessage::new("elsewhere/x", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoHandler { topic } if topic == "elsewhere/x"));
    }

    #[tokio::test]
    async fn handler_failure_carries_topic() {
        let router = Router::new();
        router.register_handler("a/+", Arc::new(Failing)).unwrap();
        let err = router.route(BusMessage::new("a/b", "{}")).await.unwrap_err();
        assert!(matches!(err, Error::Handler { ref topic, .. } if topic == "a/b"));
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let router = Router::new();
        assert!(router.register_handler("a/#/b", Arc::new(Failing)).is_err());
        assert!(router.filters().is_empty());
    }
}
