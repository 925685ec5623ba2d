//! Starting and stopping several listeners together.

use std::collections::BTreeMap;

use futures::future;
use tracing::{error, info};

use crate::container::SharedMessageListenerContainer;
use crate::errors::ListenerError;

/// Registry of containers keyed by identifier.
///
/// Typically an application registers one container per queue at startup,
/// calls [`start_all`](Self::start_all), and [`stop_all`](Self::stop_all) on
/// shutdown.
#[derive(Default)]
pub struct ContainerCoordinator {
    containers: BTreeMap<String, SharedMessageListenerContainer>,
}

impl ContainerCoordinator {
    pub fn new() -> Self {
        ContainerCoordinator::default()
    }

    pub fn add(&mut self, container: SharedMessageListenerContainer) -> Result<(), ListenerError> {
        let identifier = container.identifier().to_string();
        if self.containers.contains_key(&identifier) {
            return Err(ListenerError::DuplicateContainer { identifier });
        }
        self.containers.insert(identifier, container);
        Ok(())
    }

    pub fn container(&self, identifier: &str) -> Option<&SharedMessageListenerContainer> {
        self.containers.get(identifier)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.containers.keys().map(String::as_str)
    }

    /// Starts every container. Containers that fail to start are logged and
    /// the first error is returned once all others have been started.
    pub async fn start_all(&self) -> Result<(), ListenerError> {
        info!(count = self.containers.len(), "Starting all containers");
        let results = future::join_all(self.containers.values().map(|container| container.start())).await;
        let mut first_error = None;
        for (identifier, result) in self.containers.keys().zip(results) {
            if let Err(error) = result {
                error!(container = %identifier, error = %error, "Failed to start container");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops every container concurrently and waits for all of them.
    pub async fn stop_all(&self) {
        info!(count = self.containers.len(), "Stopping all containers");
        future::join_all(self.containers.values().map(|container| container.stop())).await;
    }

    pub async fn start(&self, identifier: &str) -> Result<(), ListenerError> {
        self.lookup(identifier)?.start().await
    }

    pub async fn stop(&self, identifier: &str) -> Result<(), ListenerError> {
        self.lookup(identifier)?.stop().await;
        Ok(())
    }

    fn lookup(&self, identifier: &str) -> Result<&SharedMessageListenerContainer, ListenerError> {
        self.containers
            .get(identifier)
            .ok_or_else(|| ListenerError::UnknownContainer {
                identifier: identifier.to_string(),
            })
    }
}
