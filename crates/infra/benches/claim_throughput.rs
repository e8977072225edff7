use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use coursegen_core::{CourseId, LessonId, TenantId, UserId};
use coursegen_infra::batch::{AggregationPolicy, aggregate};
use coursegen_infra::jobs::{GenerationJob, InMemoryJobStore, JobPayload, JobStatus, JobStore, JobType, NewJob};
use coursegen_infra::queue::{EnqueueOptions, InMemoryTaskQueue, TaskKind, TaskPayload, TaskQueue};
use std::time::Duration;
use tokio::runtime::Runtime;

fn lesson_job(tenant_id: TenantId, user_id: UserId) -> NewJob {
    NewJob::new(
        tenant_id,
        user_id,
        JobPayload::LessonContent {
            course_id: CourseId::new(),
            lesson_id: LessonId::new(),
        },
    )
}

fn bench_claim_next(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("job_claim_next");

    for backlog in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::new("drain_backlog", backlog), backlog, |b, &size| {
            let tenant_id = TenantId::new();
            let user_id = UserId::new();

            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryJobStore::new();
                    for _ in 0..size {
                        store.create(lesson_job(tenant_id, user_id)).await.unwrap();
                    }
                    while let Some(job) = store.claim_next(&JobType::ALL).await.unwrap() {
                        black_box(job);
                    }
                })
            });
        });
    }

    group.finish();
}

fn bench_queue_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("task_queue_cycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue_dequeue_ack", |b| {
        let queue = InMemoryTaskQueue::new();
        let tenant_id = TenantId::new();
        let user_id = UserId::new();
        let job = rt
            .block_on(InMemoryJobStore::new().create(lesson_job(tenant_id, user_id)))
            .unwrap();

        b.iter(|| {
            rt.block_on(async {
                queue
                    .enqueue(TaskPayload::for_job(&job), EnqueueOptions::default())
                    .await
                    .unwrap();
                let task = queue
                    .dequeue(&[TaskKind::Generation], Duration::from_secs(30))
                    .await
                    .unwrap()
                    .unwrap();
                queue.ack(task.id).await.unwrap();
            })
        });
    });

    group.finish();
}

fn bench_batch_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_aggregation");
    let now = Utc::now();

    for lessons in [5usize, 50, 500].iter() {
        let tenant_id = TenantId::new();
        let user_id = UserId::new();
        let children: Vec<GenerationJob> = (0..*lessons)
            .map(|i| {
                let mut job = GenerationJob::from_new(lesson_job(tenant_id, user_id), now).unwrap();
                job.status = if i % 7 == 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
                job.tokens_used = 100;
                job
            })
            .collect();

        for policy in [AggregationPolicy::FailFast, AggregationPolicy::BestEffort] {
            group.bench_with_input(
                BenchmarkId::new(policy.as_str(), lessons),
                &children,
                |b, children| b.iter(|| black_box(aggregate(children, policy))),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_claim_next, bench_queue_cycle, bench_batch_aggregation);
criterion_main!(benches);
