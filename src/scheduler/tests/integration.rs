use super::*;
use crate::config::SchedulerConfig;
use crate::events::{bus::NullSink, EventBus, EventType};
use crate::messages::InterruptTarget;
use crate::models::{Priority, TaskState};
use crate::scheduler::{AgentRegistry, Scheduler};
use std::time::Duration;

const ALL_KINDS: [AgentKind; 6] = [
    AgentKind::CasualChat,
    AgentKind::Knowledge,
    AgentKind::Compute,
    AgentKind::Translate,
    AgentKind::Summarize,
    AgentKind::ToolUse,
];

async fn gated_fleet(
    config: SchedulerConfig,
) -> (Scheduler, Arc<EventBus>, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(0));
    let registry = Arc::new(AgentRegistry::new());
    for kind in ALL_KINDS {
        registry
            .register(Arc::new(GatedAgent {
                kind,
                gate: gate.clone(),
            }))
            .await
            .unwrap();
    }
    let bus = EventBus::new(64, Arc::new(NullSink));
    let scheduler = Scheduler::new(registry, bus.clone(), config);
    let runner = scheduler.clone();
    tokio::spawn(async move { runner.run().await });
    (scheduler, bus, gate)
}

async fn wait_for_snapshot(
    scheduler: &Scheduler,
    check: impl Fn(&crate::scheduler::HealthSnapshot) -> bool,
) {
    for _ in 0..100 {
        if check(&scheduler.snapshot().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 2.5s");
}

#[tokio::test]
async fn concurrency_never_exceeds_the_global_bound() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 5,
        task_timeout_secs: 10,
        retry_ceiling: 2,
        max_queue_size: 100,
    };
    let (scheduler, _bus, gate) = gated_fleet(config).await;

    // Six tasks, six distinct agents, capacity five.
    let mut ids = Vec::new();
    for kind in ALL_KINDS {
        let id = scheduler
            .submit(Task::new("sess", kind, Priority::default()))
            .await
            .unwrap();
        ids.push(id);
    }

    wait_for_snapshot(&scheduler, |s| s.running == 5).await;
    let snapshot = scheduler.snapshot().await;
    assert_eq!(snapshot.running, 5);
    assert_eq!(snapshot.queued, 1);
    assert!(snapshot.oldest_queued_at.is_some());

    // Draining one frees exactly one slot; the queued task starts.
    gate.add_permits(1);
    wait_for_snapshot(&scheduler, |s| s.queued == 0 && s.running == 5).await;

    gate.add_permits(10);
    for id in &ids {
        let completion = scheduler.wait(id).await.unwrap();
        assert_eq!(completion.state, TaskState::Succeeded);
    }
}

#[tokio::test]
async fn priority_order_with_arrival_tiebreak() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 1,
        task_timeout_secs: 10,
        retry_ceiling: 0,
        max_queue_size: 100,
    };
    let (scheduler, _bus, gate) = gated_fleet(config).await;

    // Occupy the only slot so later submissions stack in the queue.
    let blocker = scheduler
        .submit(Task::new("sess", AgentKind::ToolUse, Priority::default()))
        .await
        .unwrap();
    wait_for_snapshot(&scheduler, |s| s.running == 1).await;

    let low = scheduler
        .submit(Task::new(
            "sess",
            AgentKind::CasualChat,
            Priority::new(2).unwrap(),
        ))
        .await
        .unwrap();
    let high = scheduler
        .submit(Task::new(
            "sess",
            AgentKind::Compute,
            Priority::new(9).unwrap(),
        ))
        .await
        .unwrap();

    gate.add_permits(10);
    scheduler.wait(&blocker).await.unwrap();
    let high_done = scheduler.wait(&high).await.unwrap();
    let low_done = scheduler.wait(&low).await.unwrap();
    assert_eq!(high_done.state, TaskState::Succeeded);
    assert_eq!(low_done.state, TaskState::Succeeded);

    let high_task = scheduler.get_task(&high).await.unwrap();
    let low_task = scheduler.get_task(&low).await.unwrap();
    assert!(high_task.started_at.unwrap() <= low_task.started_at.unwrap());
}

#[tokio::test]
async fn interrupt_running_task_is_terminal_with_no_further_events() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 2,
        task_timeout_secs: 10,
        retry_ceiling: 2,
        max_queue_size: 100,
    };
    let (scheduler, bus, _gate) = gated_fleet(config).await;
    let mut rx = bus.subscribe("sess").await;

    let task_id = scheduler
        .submit(Task::new("sess", AgentKind::Knowledge, Priority::default()))
        .await
        .unwrap();
    wait_for_snapshot(&scheduler, |s| s.running == 1).await;

    scheduler
        .interrupt(InterruptTarget::Task(task_id.clone()))
        .await
        .unwrap();
    let completion = scheduler.wait(&task_id).await.unwrap();
    assert_eq!(completion.state, TaskState::Interrupted);
    assert_eq!(completion.error.unwrap().kind.as_str(), "interrupted");

    // executing status, then the interruption status; nothing after.
    let executing = rx.recv().await.unwrap();
    assert_eq!(executing.event_type, EventType::Status);
    let interrupted = rx.recv().await.unwrap();
    assert_eq!(interrupted.content.message, "interrupted");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());

    // Terminal state never re-enters running.
    assert_eq!(
        scheduler.get_task(&task_id).await.unwrap().state,
        TaskState::Interrupted
    );
}

#[tokio::test]
async fn interrupt_by_agent_name_cancels_its_current_task() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 2,
        task_timeout_secs: 10,
        retry_ceiling: 2,
        max_queue_size: 100,
    };
    let (scheduler, _bus, _gate) = gated_fleet(config).await;

    let task_id = scheduler
        .submit(Task::new("sess", AgentKind::Translate, Priority::default()))
        .await
        .unwrap();
    wait_for_snapshot(&scheduler, |s| s.running == 1).await;

    scheduler
        .interrupt(InterruptTarget::Agent(AgentKind::Translate))
        .await
        .unwrap();
    let completion = scheduler.wait(&task_id).await.unwrap();
    assert_eq!(completion.state, TaskState::Interrupted);
}

#[tokio::test]
async fn interrupt_propagates_to_descendants() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 1,
        task_timeout_secs: 10,
        retry_ceiling: 2,
        max_queue_size: 100,
    };
    let (scheduler, _bus, _gate) = gated_fleet(config).await;

    let parent_id = scheduler
        .submit(Task::new("sess", AgentKind::Knowledge, Priority::default()))
        .await
        .unwrap();
    wait_for_snapshot(&scheduler, |s| s.running == 1).await;
    // Child queued behind the capacity bound.
    let child_id = scheduler
        .submit(
            Task::new("sess", AgentKind::Compute, Priority::default())
                .with_parent(parent_id.clone()),
        )
        .await
        .unwrap();

    scheduler
        .interrupt(InterruptTarget::Task(parent_id.clone()))
        .await
        .unwrap();

    assert_eq!(
        scheduler.wait(&parent_id).await.unwrap().state,
        TaskState::Interrupted
    );
    assert_eq!(
        scheduler.wait(&child_id).await.unwrap().state,
        TaskState::Interrupted
    );
}

#[tokio::test]
async fn session_cascade_interrupts_and_forgets() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 2,
        task_timeout_secs: 10,
        retry_ceiling: 2,
        max_queue_size: 100,
    };
    let (scheduler, _bus, gate) = gated_fleet(config).await;

    let doomed = scheduler
        .submit(Task::new("doomed", AgentKind::Knowledge, Priority::default()))
        .await
        .unwrap();
    let survivor = scheduler
        .submit(Task::new("kept", AgentKind::Compute, Priority::default()))
        .await
        .unwrap();
    wait_for_snapshot(&scheduler, |s| s.running == 2).await;

    let interrupted = scheduler.interrupt_session("doomed").await;
    assert_eq!(interrupted, vec![doomed.clone()]);
    assert_eq!(
        scheduler.wait(&doomed).await.unwrap().state,
        TaskState::Interrupted
    );

    scheduler.forget_session("doomed").await;
    assert!(scheduler.get_task(&doomed).await.is_none());

    gate.add_permits(5);
    assert_eq!(
        scheduler.wait(&survivor).await.unwrap().state,
        TaskState::Succeeded
    );
}
