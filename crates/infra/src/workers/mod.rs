//! Background execution: the worker pool that drains the task queue and the
//! watchdog that recovers work a crashed worker left behind.

pub mod pool;
pub mod watchdog;

pub use pool::{ShutdownReport, WorkerError, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use watchdog::{SweepReport, Watchdog, WatchdogConfig};

use crate::jobs::GenerationJob;
use crate::queue::{EnqueueOptions, QueueError, Task, TaskPayload, TaskQueue};

/// Announce a QUEUED job to the workers.
pub async fn enqueue_job(
    queue: &dyn TaskQueue,
    job: &GenerationJob,
    options: EnqueueOptions,
) -> Result<Task, QueueError> {
    queue.enqueue(TaskPayload::for_job(job), options).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use coursegen_ai::ScriptedProvider;
    use coursegen_events::InMemoryEventBus;

    use super::*;
    use crate::batch::BatchCoordinator;
    use crate::cache::TenantCache;
    use crate::jobs::{InMemoryJobStore, RetryPolicy};
    use crate::notifications::{InMemoryNotificationStore, NotificationEnvelope, NotificationFanout};
    use crate::orchestrator::{
        Collaborators, HandlerRegistry, InMemoryContentRepository, InMemoryKnowledgeBase,
        Orchestrator,
    };
    use crate::queue::InMemoryTaskQueue;
    use crate::registration::{InMemoryProvisioner, InMemoryRegistrationStore, ProvisioningService};

    /// Every component wired over in-memory adapters.
    pub(crate) struct Pipeline {
        pub store: Arc<InMemoryJobStore>,
        pub queue: Arc<InMemoryTaskQueue>,
        pub provider: Arc<ScriptedProvider>,
        pub knowledge: Arc<InMemoryKnowledgeBase>,
        pub content: Arc<InMemoryContentRepository>,
        pub notifications: Arc<InMemoryNotificationStore>,
        pub bus: Arc<InMemoryEventBus<NotificationEnvelope>>,
        pub registrations: Arc<InMemoryRegistrationStore>,
        pub provisioner: Arc<InMemoryProvisioner>,
        pub batch: Arc<BatchCoordinator>,
        pub orchestrator: Arc<Orchestrator>,
        pub provisioning: Arc<ProvisioningService>,
    }

    impl Pipeline {
        pub fn new() -> Self {
            let store = Arc::new(InMemoryJobStore::with_retry_policy(RetryPolicy::fixed(
                Duration::from_millis(1),
            )));
            let queue = Arc::new(InMemoryTaskQueue::new());
            let provider = Arc::new(ScriptedProvider::new());
            let knowledge = Arc::new(InMemoryKnowledgeBase::new());
            let content = Arc::new(InMemoryContentRepository::new());
            let notifications = Arc::new(InMemoryNotificationStore::new());
            let registrations = Arc::new(InMemoryRegistrationStore::new());
            let provisioner = Arc::new(InMemoryProvisioner::new());

            let bus = Arc::new(InMemoryEventBus::<NotificationEnvelope>::new());
            let fanout = NotificationFanout::new(notifications.clone(), bus.clone());
            let batch = Arc::new(BatchCoordinator::new(store.clone(), queue.clone(), fanout.clone()));
            let collab = Collaborators {
                provider: provider.clone(),
                knowledge: knowledge.clone(),
                content: content.clone(),
                cache: TenantCache::in_memory(Duration::from_secs(60)),
            };
            let registry = Arc::new(HandlerRegistry::standard(collab, batch.clone()));
            let orchestrator = Arc::new(Orchestrator::new(
                store.clone(),
                registry,
                fanout,
                batch.clone(),
            ));
            let provisioning = Arc::new(ProvisioningService::new(
                registrations.clone(),
                provisioner.clone(),
            ));

            Self {
                store,
                queue,
                provider,
                knowledge,
                content,
                notifications,
                bus,
                registrations,
                provisioner,
                batch,
                orchestrator,
                provisioning,
            }
        }

        pub fn pool(&self, config: WorkerPoolConfig) -> WorkerPool {
            WorkerPool::new(
                config,
                self.store.clone(),
                self.queue.clone(),
                self.orchestrator.clone(),
            )
            .with_provisioning(self.provisioning.clone())
        }

        pub fn watchdog(&self, config: WatchdogConfig) -> Watchdog {
            Watchdog::new(
                config,
                self.store.clone(),
                self.queue.clone(),
                self.orchestrator.clone(),
            )
            .with_registrations(self.registrations.clone())
        }
    }
}
