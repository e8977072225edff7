use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::{debug, info, warn};

use coursegen_ai::{ContentProvider, ScriptedProvider};
use coursegen_core::{CourseId, LessonId};
use coursegen_events::InMemoryEventBus;
use coursegen_infra::{
    batch::{BatchCoordinator, BatchError, BatchStart},
    cache::TenantCache,
    config::AppConfig,
    jobs::{GenerationJob, InMemoryJobStore, JobId, JobPayload, JobStore, JobStoreError, NewJob},
    notifications::{
        InMemoryNotificationStore, NotificationBus, NotificationEnvelope, NotificationFanout,
        NotificationStore,
    },
    orchestrator::{
        Collaborators, ContentRepository, HandlerRegistry, InMemoryContentRepository,
        InMemoryKnowledgeBase, KnowledgeBase, Orchestrator,
    },
    queue::{EnqueueOptions, InMemoryTaskQueue, TaskQueue},
    registration::{
        EventTrigger, InMemoryProvisioner, InMemoryRegistrationStore, Provisioner,
        ProvisioningService, RegistrationStore, WebhookVerifier,
    },
    workers::{
        ShutdownReport, Watchdog, WatchdogConfig, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
        enqueue_job,
    },
};

#[cfg(feature = "redis")]
use coursegen_infra::{cache::RedisCache, event_bus::RedisPubSubEventBus, queue::RedisTaskQueue};

use crate::context::RequestContext;

/// Everything the routes and the background workers share.
pub struct AppServices {
    pub config: AppConfig,
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub knowledge: Arc<dyn KnowledgeBase>,
    pub content: Arc<dyn ContentRepository>,
    pub notifications: Arc<dyn NotificationStore>,
    pub batch: Arc<BatchCoordinator>,
    pub orchestrator: Arc<Orchestrator>,
    pub registrations: Arc<dyn RegistrationStore>,
    pub provisioning: Arc<ProvisioningService>,
    pub trigger: EventTrigger,
    pub verifier: WebhookVerifier,
    enqueue: EnqueueOptions,
    realtime_tx: broadcast::Sender<NotificationEnvelope>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Adapters picked from the config; anything unconfigured is in-memory.
struct Backends {
    jobs: Arc<dyn JobStore>,
    notifications: Arc<dyn NotificationStore>,
    registrations: Arc<dyn RegistrationStore>,
    queue: Arc<dyn TaskQueue>,
    cache: TenantCache,
    bus: Arc<dyn NotificationBus>,
}

pub async fn build_services(config: AppConfig) -> anyhow::Result<AppServices> {
    let backends = select_backends(&config).await?;
    Ok(assemble(
        config,
        backends,
        Arc::new(ScriptedProvider::new()),
        Arc::new(InMemoryProvisioner::new()),
    ))
}

async fn select_backends(config: &AppConfig) -> anyhow::Result<Backends> {
    let mut backends = Backends {
        jobs: Arc::new(InMemoryJobStore::with_retry_policy(config.retry.clone())),
        notifications: Arc::new(InMemoryNotificationStore::new()),
        registrations: Arc::new(InMemoryRegistrationStore::new()),
        queue: Arc::new(InMemoryTaskQueue::new()),
        cache: TenantCache::in_memory(config.cache_ttl),
        bus: Arc::new(InMemoryEventBus::<NotificationEnvelope>::new()),
    };

    if let Some(database_url) = &config.database_url {
        use coursegen_infra::{
            jobs::PostgresJobStore, notifications::PostgresNotificationStore,
            registration::PostgresRegistrationStore, schema::ensure_schema,
        };

        let pool = sqlx::PgPool::connect(database_url).await?;
        ensure_schema(&pool).await?;
        backends.jobs = Arc::new(PostgresJobStore::with_retry_policy(pool.clone(), config.retry.clone()));
        backends.notifications = Arc::new(PostgresNotificationStore::new(pool.clone()));
        backends.registrations = Arc::new(PostgresRegistrationStore::new(pool));
        info!("using postgres stores");
    } else {
        warn!("DATABASE_URL not set; jobs, notifications and registrations are in-memory");
    }

    if let Some(redis_url) = &config.redis_url {
        #[cfg(feature = "redis")]
        {
            backends.queue = Arc::new(RedisTaskQueue::new(redis_url, None)?);
            backends.cache = TenantCache::new(Arc::new(RedisCache::new(redis_url)?), config.cache_ttl);
            backends.bus = Arc::new(RedisPubSubEventBus::<coursegen_infra::notifications::Notification>::new(
                redis_url,
            )?);
            info!("using redis queue, cache and pub/sub");
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = redis_url;
            warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory");
        }
    }

    Ok(backends)
}

fn assemble(
    config: AppConfig,
    backends: Backends,
    provider: Arc<dyn ContentProvider>,
    provisioner: Arc<dyn Provisioner>,
) -> AppServices {
    let Backends {
        jobs,
        notifications,
        registrations,
        queue,
        cache,
        bus,
    } = backends;

    let enqueue = EnqueueOptions::default().with_max_deliveries(config.queue_max_deliveries);
    let knowledge: Arc<dyn KnowledgeBase> = Arc::new(InMemoryKnowledgeBase::new());
    let content: Arc<dyn ContentRepository> = Arc::new(InMemoryContentRepository::new());

    let (realtime_tx, _realtime_rx) = broadcast::channel::<NotificationEnvelope>(256);
    spawn_realtime_bridge(bus.as_ref(), realtime_tx.clone());

    let fanout = NotificationFanout::new(notifications.clone(), bus);
    let batch = Arc::new(
        BatchCoordinator::new(jobs.clone(), queue.clone(), fanout.clone())
            .with_policy(config.aggregation_policy)
            .with_enqueue_options(enqueue.clone())
            .with_max_retries(config.job_max_retries),
    );
    let collab = Collaborators {
        provider,
        knowledge: knowledge.clone(),
        content: content.clone(),
        cache,
    };
    let registry = Arc::new(HandlerRegistry::standard(collab, batch.clone()));
    let orchestrator = Arc::new(Orchestrator::new(jobs.clone(), registry, fanout, batch.clone()));

    let provisioning = Arc::new(ProvisioningService::new(registrations.clone(), provisioner));
    let trigger = EventTrigger::new(registrations.clone(), queue.clone(), enqueue.clone());
    let verifier = WebhookVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance);

    AppServices {
        config,
        jobs,
        queue,
        knowledge,
        content,
        notifications,
        batch,
        orchestrator,
        registrations,
        provisioning,
        trigger,
        verifier,
        enqueue,
        realtime_tx,
    }
}

/// Forward bus deliveries into the broadcast channel the SSE streams read.
fn spawn_realtime_bridge(bus: &dyn NotificationBus, realtime_tx: broadcast::Sender<NotificationEnvelope>) {
    let sub = bus.subscribe();
    let spawned = std::thread::Builder::new()
        .name("notification-bridge".to_string())
        .spawn(move || {
            while let Ok(envelope) = sub.recv() {
                // No connected stream is fine; the row is already stored.
                let _ = realtime_tx.send(envelope);
            }
            debug!("notification bridge stopped");
        });

    if let Err(e) = spawned {
        warn!(error = %e, "failed to start notification bridge; real-time delivery disabled");
    }
}

/// Worker pool and watchdog running in the background.
#[derive(Debug)]
pub struct Background {
    pool: WorkerPoolHandle,
    watchdog: JoinHandle<()>,
}

impl Background {
    /// Stop the watchdog and drain the pool within `deadline`.
    pub async fn shutdown(self, deadline: Duration) -> ShutdownReport {
        let report = self.pool.shutdown(deadline).await;
        if let Err(e) = self.watchdog.await {
            warn!(error = %e, "watchdog task ended abnormally");
        }
        report
    }
}

impl AppServices {
    pub fn realtime_tx(&self) -> &broadcast::Sender<NotificationEnvelope> {
        &self.realtime_tx
    }

    pub fn start_background(&self) -> Background {
        let pool = WorkerPool::new(
            WorkerPoolConfig::from_app(&self.config),
            self.jobs.clone(),
            self.queue.clone(),
            self.orchestrator.clone(),
        )
        .with_provisioning(self.provisioning.clone())
        .spawn();

        let watchdog = Watchdog::new(
            WatchdogConfig::from_app(&self.config),
            self.jobs.clone(),
            self.queue.clone(),
            self.orchestrator.clone(),
        )
        .with_registrations(self.registrations.clone())
        .spawn(pool.shutdown_token());

        Background { pool, watchdog }
    }

    /// Create a QUEUED job and announce it to the workers.
    ///
    /// An enqueue failure is logged only: the job is durable and a worker's
    /// `claim_next` fallback will still find it.
    pub async fn submit(&self, ctx: RequestContext, payload: JobPayload) -> Result<GenerationJob, JobStoreError> {
        let new = NewJob::new(ctx.tenant_id(), ctx.user_id(), payload).with_max_retries(self.config.job_max_retries);
        let job = self.jobs.create(new).await?;

        if let Err(e) = enqueue_job(self.queue.as_ref(), &job, self.enqueue.clone()).await {
            warn!(job_id = %job.id, error = %e, "failed to enqueue job task");
        }
        info!(job_id = %job.id, tenant_id = %job.tenant_id, job_type = %job.job_type, "job submitted");
        Ok(job)
    }

    /// Cancel a job (cascading to its children) and re-check its batch.
    pub async fn cancel(&self, ctx: RequestContext, id: JobId) -> Result<GenerationJob, JobStoreError> {
        let transition = self.jobs.cancel(ctx.tenant_id(), id).await?;
        if transition.applied {
            info!(job_id = %id, tenant_id = %ctx.tenant_id(), "job cancelled");
            self.orchestrator.notify_batch(&transition.job).await;
        }
        Ok(transition.job)
    }

    /// Outline approval: one LESSON_CONTENT job per outline lesson.
    pub async fn approve_outline(
        &self,
        ctx: RequestContext,
        course_id: CourseId,
        lesson_ids: Vec<LessonId>,
    ) -> Result<BatchStart, BatchError> {
        self.batch
            .start_batch(ctx.tenant_id(), ctx.user_id(), course_id, lesson_ids)
            .await
    }
}

/// SSE stream of the caller's own notifications.
pub fn notification_sse_stream(
    services: Arc<AppServices>,
    ctx: RequestContext,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(envelope) if envelope.tenant_id() == ctx.tenant_id() && envelope.user_id() == ctx.user_id() => {
            let data = serde_json::to_string(envelope.payload()).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(envelope.topic()).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
