//!
//! Explicit registration of listener containers and producer templates.
//!
//! The host application enumerates its listeners and calls [`Registrar::register_consumer`] for
//! each; the registrar fills in shared settings, starts the container and keeps a handle so that
//! [`Registrar::shutdown`] can stop everything it started.
//!
use crate::config::{ContainerConfig, RocketMQProperties};
use crate::consumer::ConsumerFactory;
use crate::container::{ListenerContainer, RocketMQListener};
use crate::error::MessagingError;
use crate::producer::ProducerClient;
use crate::publisher::Publisher;
use crate::resolver::Payload;
use crate::template::RocketMQTemplate;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Start/stop handle shared by containers and templates.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self) -> Result<(), MessagingError>;

    async fn destroy(&self);
}

#[async_trait]
impl<T: Send + 'static> Lifecycle for ListenerContainer<T> {
    async fn start(&self) -> Result<(), MessagingError> {
        ListenerContainer::start(self).await
    }

    async fn destroy(&self) {
        ListenerContainer::destroy(self).await
    }
}

#[async_trait]
impl Lifecycle for RocketMQTemplate {
    async fn start(&self) -> Result<(), MessagingError> {
        RocketMQTemplate::start(self).await
    }

    async fn destroy(&self) {
        RocketMQTemplate::destroy(self).await
    }
}

#[derive(Default)]
struct Registry {
    ids: HashSet<String>,
    handles: Vec<(String, Arc<dyn Lifecycle>)>,
}

pub struct Registrar {
    properties: RocketMQProperties,
    factory: Arc<dyn ConsumerFactory>,
    registry: Mutex<Registry>,
}

impl Registrar {
    pub fn new(properties: RocketMQProperties, factory: Arc<dyn ConsumerFactory>) -> Self {
        Self {
            properties,
            factory,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Build and start a container for `listener`.
    ///
    /// The shared name server is used when `config` names none. The container is registered as
    /// `{group}_{topic}`, suffixed with a counter when that id is taken.
    pub async fn register_consumer<T: Send + 'static>(
        &self,
        mut config: ContainerConfig,
        payload: Payload<T>,
        listener: Arc<dyn RocketMQListener<T>>,
    ) -> Result<Arc<ListenerContainer<T>>, MessagingError> {
        if config.name_server.is_none() {
            config.name_server = self.properties.name_server.clone();
        }
        let base = format!(
            "{}_{}",
            config.consumer_group.as_deref().unwrap_or_default(),
            config.topic.as_deref().unwrap_or_default()
        );

        let container = Arc::new(
            ListenerContainer::new(config, payload, Arc::clone(&self.factory))
                .with_listener(listener),
        );
        container.start().await?;

        let id = self.register(&base, Arc::clone(&container) as Arc<dyn Lifecycle>)?;
        info!(id = %id, "Register the listener to container");
        Ok(container)
    }

    /// Build a remoting producer from the shared properties and start a template over it.
    ///
    /// # Errors
    /// `MissingProperty` if the name server or the producer group is not configured.
    pub async fn register_producer(&self) -> Result<Arc<RocketMQTemplate>, MessagingError> {
        let name_server = self
            .properties
            .name_server
            .as_deref()
            .filter(|name_server| !name_server.trim().is_empty())
            .ok_or(MessagingError::MissingProperty("nameServer"))?;
        let config = self
            .properties
            .producer
            .clone()
            .filter(|producer| !producer.group.trim().is_empty())
            .ok_or(MessagingError::MissingProperty("producer.group"))?;

        let publisher = Publisher::new(name_server, config).map_err(MessagingError::Client)?;
        self.register_producer_with(Arc::new(publisher)).await
    }

    /// Start a template over a caller-supplied producer client.
    pub async fn register_producer_with(
        &self,
        producer: Arc<dyn ProducerClient>,
    ) -> Result<Arc<RocketMQTemplate>, MessagingError> {
        let template = Arc::new(RocketMQTemplate::new(producer));
        template.start().await?;
        let id = self.register("rocketMQTemplate", Arc::clone(&template) as Arc<dyn Lifecycle>)?;
        info!(id = %id, "Producer template started");
        Ok(template)
    }

    /// Ids of everything registered, in registration order.
    pub fn ids(&self) -> Vec<String> {
        match self.registry.lock() {
            Ok(registry) => registry.handles.iter().map(|(id, _)| id.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Destroy every registered container and template, most recent first.
    pub async fn shutdown(&self) {
        let handles = match self.registry.lock() {
            Ok(mut registry) => {
                registry.ids.clear();
                std::mem::take(&mut registry.handles)
            }
            Err(e) => {
                warn!("Lock is poisoned. Cause: {}", e);
                return;
            }
        };
        for (id, handle) in handles.into_iter().rev() {
            handle.destroy().await;
            info!(id = %id, "Destroyed");
        }
    }

    fn register(&self, base: &str, handle: Arc<dyn Lifecycle>) -> Result<String, MessagingError> {
        let mut registry = self.registry.lock().map_err(|e| {
            MessagingError::IllegalArgument(format!("registry is unavailable: {}", e))
        })?;
        let id = if registry.ids.contains(base) {
            (1..)
                .map(|n| format!("{}_{}", base, n))
                .find(|candidate| !registry.ids.contains(candidate))
                .unwrap_or_else(|| base.to_owned())
        } else {
            base.to_owned()
        };
        registry.ids.insert(id.clone());
        registry.handles.push((id.clone(), handle));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProducerConfig;
    use crate::container::{listener_fn, ListenerError};
    use crate::envelope::Envelope;
    use crate::mock::{MockBehavior, MockConsumerFactory, MockProducerClient};

    fn noop() -> Arc<dyn RocketMQListener<String>> {
        listener_fn(|_body: String| async move { Ok::<(), ListenerError>(()) })
    }

    fn properties() -> RocketMQProperties {
        RocketMQProperties {
            name_server: Some("127.0.0.1:9876".to_owned()),
            producer: Some(ProducerConfig::new("P")),
        }
    }

    #[tokio::test]
    async fn test_register_consumers() -> Result<(), MessagingError> {
        let factory = Arc::new(MockConsumerFactory::new());
        let registrar = Registrar::new(properties(), Arc::clone(&factory) as Arc<dyn ConsumerFactory>);

        let config = ContainerConfig {
            consumer_group: Some("G".to_owned()),
            topic: Some("T".to_owned()),
            ..Default::default()
        };
        let first = registrar
            .register_consumer(config.clone(), Payload::text(), noop())
            .await?;
        let second = registrar
            .register_consumer(config, Payload::text(), noop())
            .await?;
        assert!(first.is_running());
        assert!(second.is_running());
        assert_eq!(first.config().name_server.as_deref(), Some("127.0.0.1:9876"));
        assert_eq!(registrar.ids(), vec!["G_T", "G_T_1"]);

        // A container failing to start is not registered.
        let result = registrar
            .register_consumer(ContainerConfig::default(), Payload::text(), noop())
            .await;
        assert!(matches!(result, Err(MessagingError::MissingProperty(_))));
        assert_eq!(registrar.ids().len(), 2);

        registrar.shutdown().await;
        assert!(!first.is_running());
        assert!(!second.is_running());
        assert!(registrar.ids().is_empty());
        assert_eq!(factory.consumer(0).map(|record| record.shutdown_calls), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_register_producer_with_client() -> Result<(), MessagingError> {
        let registrar = Registrar::new(properties(), Arc::new(MockConsumerFactory::new()));
        let client = Arc::new(MockProducerClient::new(MockBehavior::Acknowledge, 2));
        let template = registrar
            .register_producer_with(Arc::clone(&client) as Arc<dyn ProducerClient>)
            .await?;
        assert!(client.is_started());

        let result = template.sync_send(&Envelope::text("T", "hello")).await?;
        assert!(!result.msg_id.is_empty());

        registrar.shutdown().await;
        assert!(!client.is_started());
        Ok(())
    }

    #[tokio::test]
    async fn test_register_producer_requires_group_and_name_server() -> Result<(), MessagingError> {
        let factory: Arc<dyn ConsumerFactory> = Arc::new(MockConsumerFactory::new());

        let without_group = Registrar::new(
            RocketMQProperties {
                producer: None,
                ..properties()
            },
            Arc::clone(&factory),
        );
        assert!(matches!(
            without_group.register_producer().await,
            Err(MessagingError::MissingProperty("producer.group"))
        ));

        let without_name_server = Registrar::new(
            RocketMQProperties {
                name_server: None,
                ..properties()
            },
            Arc::clone(&factory),
        );
        assert!(matches!(
            without_name_server.register_producer().await,
            Err(MessagingError::MissingProperty("nameServer"))
        ));

        let registrar = Registrar::new(properties(), factory);
        let template = registrar.register_producer().await?;
        assert_eq!(registrar.ids(), vec!["rocketMQTemplate"]);
        template.destroy().await;
        Ok(())
    }
}
