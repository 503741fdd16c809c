use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::containers::Container;
use crate::error::{Result, VertexError};
use crate::events::{Event, EventBus, TOPIC_CONTAINERS};

/// In-memory catalog of every known container, keyed by UUID. The single
/// source of truth for existence; every mutation is announced on the bus
/// after it is visible to readers.
pub struct Registry {
    containers: RwLock<HashMap<Uuid, Arc<Container>>>,
    bus: EventBus,
}

impl Registry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub async fn get(&self, uuid: Uuid) -> Result<Arc<Container>> {
        self.containers
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or(VertexError::ContainerNotFound(uuid))
    }

    pub async fn get_all(&self) -> Vec<Arc<Container>> {
        self.containers.read().await.values().cloned().collect()
    }

    pub async fn exists(&self, uuid: Uuid) -> bool {
        self.containers.read().await.contains_key(&uuid)
    }

    pub async fn set(&self, container: Arc<Container>) -> Result<()> {
        {
            let mut containers = self.containers.write().await;
            if containers.contains_key(&container.uuid) {
                return Err(VertexError::ContainerAlreadyExists(container.uuid));
            }
            containers.insert(container.uuid, container);
        }
        self.bus.publish(TOPIC_CONTAINERS, Event::CatalogChanged);
        Ok(())
    }

    pub async fn delete(&self, uuid: Uuid) -> Result<Arc<Container>> {
        let removed = {
            let mut containers = self.containers.write().await;
            containers
                .remove(&uuid)
                .ok_or(VertexError::ContainerNotFound(uuid))?
        };
        self.bus.publish(TOPIC_CONTAINERS, Event::CatalogChanged);
        Ok(removed)
    }
}
