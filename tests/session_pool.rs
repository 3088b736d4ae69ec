#![cfg(unix)]

use cctm_engine::config::Config;
use cctm_engine::error::{AppError, ErrorKind};
use cctm_engine::monitor::{ProcessSample, ResourceSampler, SessionResourceMonitor, SystemMemory};
use cctm_engine::session::types::{Rect, Session, SessionEventKind, SessionId, SessionOptions, SessionStatus};
use cctm_engine::session::SessionPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
struct Readings {
    memory_bytes: u64,
    cpu_fraction: f64,
    system_used: u64,
    system_total: u64,
}

#[derive(Clone)]
struct ScriptedSampler(Arc<Mutex<Readings>>);

impl ScriptedSampler {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Readings {
            memory_bytes: 10 * 1024 * 1024,
            cpu_fraction: 0.01,
            system_used: 40,
            system_total: 100,
        })))
    }

    fn set(&self, update: impl FnOnce(&mut Readings)) {
        update(&mut self.0.lock().unwrap());
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&mut self, pids: &[u32]) -> HashMap<u32, ProcessSample> {
        let r = *self.0.lock().unwrap();
        pids.iter()
            .map(|pid| {
                (
                    *pid,
                    ProcessSample {
                        cpu_fraction: r.cpu_fraction,
                        memory_bytes: r.memory_bytes,
                    },
                )
            })
            .collect()
    }

    fn system_memory(&mut self) -> SystemMemory {
        let r = *self.0.lock().unwrap();
        SystemMemory {
            used_bytes: r.system_used,
            total_bytes: r.system_total,
        }
    }
}

fn setup(config: Config) -> (SessionPool, ScriptedSampler) {
    let config = Arc::new(Config {
        default_shell: Some("sh".into()),
        provider_dirs: Vec::new(),
        ..config
    });
    let sampler = ScriptedSampler::new();
    let monitor = Arc::new(SessionResourceMonitor::with_sampler(&config, Box::new(sampler.clone())));
    (SessionPool::new(config, monitor), sampler)
}

async fn wait_until<F>(pool: &SessionPool, id: &SessionId, mut pred: F) -> Session
where
    F: FnMut(&Session) -> bool,
{
    let mut last = None;
    for _ in 0..200 {
        let session = pool.get(id).await.unwrap();
        if pred(&session) {
            return session;
        }
        last = Some(session);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached; last state: {:?}", last);
}

fn joined(session: &Session) -> String {
    session.output.concat()
}

#[tokio::test]
async fn create_run_input_terminate() {
    let (pool, _) = setup(Config::default());
    let dir = TempDir::new().unwrap();
    let mut events = pool.subscribe();

    let id = pool.create(dir.path(), Some("scratch".into())).await.unwrap();
    let session = pool.get(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(session.title, "scratch");
    assert!(session.pid.is_some());
    assert_eq!(session.opacity, 1.0);
    assert_eq!(session.position, Rect::default());
    assert!(session.last_activity_at >= session.created_at);

    let first = events.recv().await.unwrap();
    assert_eq!(first.session_id, id);
    assert!(matches!(first.kind, SessionEventKind::Created { .. }));
    let second = events.recv().await.unwrap();
    assert!(matches!(
        second.kind,
        SessionEventKind::StatusChanged { from: SessionStatus::Starting, to: SessionStatus::Running }
    ));

    let before = session.last_activity_at;
    pool.send_input(&id, "echo hello-from-session").await.unwrap();
    let session = wait_until(&pool, &id, |s| joined(s).contains("hello-from-session")).await;
    assert!(session.last_activity_at >= before);
    assert!(!session.needs_attention);

    pool.terminate(&id).await.unwrap();
    let session = pool.get(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.pid.is_none());
    assert!(session.ended_at.is_some());
    assert_eq!(pool.active_count(), 0);

    assert!(matches!(pool.terminate(&id).await, Err(AppError::NotFound(_))));
    assert!(matches!(pool.send_input(&id, "ls").await, Err(AppError::InvalidState(_))));
    assert!(matches!(pool.terminate(&SessionId::new()).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn ceiling_is_enforced_and_released() {
    let (pool, _) = setup(Config {
        max_sessions: 2,
        ..Config::default()
    });
    let dir = TempDir::new().unwrap();
    let a = pool.create(dir.path(), None).await.unwrap();
    let _b = pool.create(dir.path(), None).await.unwrap();

    let err = pool.create(dir.path(), None).await.unwrap_err();
    assert!(matches!(err, AppError::ResourceExhausted(_)));
    assert!(err.is_retryable());
    assert_eq!(pool.active_count(), 2);
    assert_eq!(pool.list().await.len(), 2, "a refused create leaves no record");

    pool.terminate(&a).await.unwrap();
    pool.create(dir.path(), None).await.unwrap();
    assert_eq!(pool.active_count(), 2);

    pool.set_max_sessions(3).unwrap();
    pool.create(dir.path(), None).await.unwrap();
    assert!(matches!(pool.set_max_sessions(0), Err(AppError::OutOfRange(_))));
    pool.shutdown().await;
}

#[tokio::test]
async fn validation_errors() {
    let (pool, _) = setup(Config::default());
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("plain.txt");
    std::fs::write(&file, "x").unwrap();

    assert!(matches!(
        pool.create(dir.path().join("missing"), None).await,
        Err(AppError::InvalidPath(_))
    ));
    assert!(matches!(pool.create(&file, None).await, Err(AppError::InvalidPath(_))));
    assert!(matches!(pool.create("", None).await, Err(AppError::InvalidPath(_))));

    let mut options = SessionOptions::new(dir.path());
    options.opacity = Some(1.5);
    assert!(matches!(pool.create_with(options).await, Err(AppError::OutOfRange(_))));
    assert_eq!(pool.active_count(), 0);

    let id = pool.create(dir.path(), None).await.unwrap();
    assert!(matches!(pool.set_opacity(&id, 1.5).await, Err(AppError::OutOfRange(_))));
    assert_eq!(pool.get(&id).await.unwrap().opacity, 1.0);
    pool.set_opacity(&id, 0.4).await.unwrap();
    assert_eq!(pool.get(&id).await.unwrap().opacity, 0.4);

    let rect = Rect { x: 10.0, y: 20.0, width: 300.0, height: 200.0 };
    pool.update_position(&id, rect).await.unwrap();
    assert!(matches!(
        pool.update_position(&id, Rect { width: -1.0, ..rect }).await,
        Err(AppError::OutOfRange(_))
    ));
    pool.set_popup(&id, true).await.unwrap();
    let session = pool.get(&id).await.unwrap();
    assert_eq!(session.position, rect);
    assert!(session.is_popup);

    assert!(matches!(pool.purge(&id).await, Err(AppError::InvalidState(_))));
    pool.terminate(&id).await.unwrap();
    assert!(matches!(pool.set_opacity(&id, 0.5).await, Err(AppError::InvalidState(_))));
    pool.purge(&id).await.unwrap();
    assert!(matches!(pool.get(&id).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn list_is_ordered_by_creation() {
    let (pool, _) = setup(Config::default());
    let dir = TempDir::new().unwrap();
    let mut ids = Vec::new();
    for n in 0..4 {
        ids.push(pool.create(dir.path(), Some(format!("s{}", n))).await.unwrap());
    }
    let listed: Vec<SessionId> = pool.list().await.into_iter().map(|s| s.id).collect();
    assert_eq!(listed, ids);
    pool.shutdown().await;
}

#[tokio::test]
async fn prompt_sets_waiting_and_answer_resumes() {
    let (pool, _) = setup(Config::default());
    let dir = TempDir::new().unwrap();
    let options = SessionOptions::new(dir.path()).command(
        "sh",
        &["-c", "echo 'Continue? [y/n]'; read answer; echo \"got $answer\"; sleep 5"],
    );
    let id = pool.create_with(options).await.unwrap();

    let session = wait_until(&pool, &id, |s| s.status == SessionStatus::Waiting).await;
    assert!(session.needs_attention);
    assert!(session.pid.is_some());

    pool.send_input(&id, "y").await.unwrap();
    let session = wait_until(&pool, &id, |s| joined(s).contains("got y")).await;
    assert!(!session.needs_attention);
    assert_eq!(session.status, SessionStatus::Running);
    pool.shutdown().await;
}

#[tokio::test]
async fn exit_codes_decide_terminal_status() {
    let (pool, _) = setup(Config::default());
    let dir = TempDir::new().unwrap();

    let ok = pool
        .create_with(SessionOptions::new(dir.path()).command("sh", &["-c", "sleep 0.2; exit 0"]))
        .await
        .unwrap();
    let failing = pool
        .create_with(SessionOptions::new(dir.path()).command("sh", &["-c", "sleep 0.2; echo boom; exit 3"]))
        .await
        .unwrap();

    let session = wait_until(&pool, &ok, |s| s.status.is_terminal()).await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.exit_code, Some(0));

    let session = wait_until(&pool, &failing, |s| s.status.is_terminal()).await;
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.exit_code, Some(3));
    assert_eq!(session.termination.unwrap().kind, Some(ErrorKind::ProcessFault));
    assert!(joined(&pool.get(&failing).await.unwrap()).contains("boom"));
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn spawn_failure_is_retained_as_error() {
    let (pool, _) = setup(Config::default());
    let dir = TempDir::new().unwrap();
    let err = pool
        .create_with(SessionOptions::new(dir.path()).command("no-such-program-for-cctm", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ProcessFault(_)));

    let sessions = pool.list().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Error);
    assert!(sessions[0].pid.is_none());
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn memory_budget_violation_fails_the_session() {
    let (pool, sampler) = setup(Config {
        session_memory_budget_bytes: 512 * 1024 * 1024,
        ..Config::default()
    });
    let dir = TempDir::new().unwrap();
    let id = pool.create(dir.path(), None).await.unwrap();

    pool.check_resources().await;
    assert_eq!(pool.get(&id).await.unwrap().status, SessionStatus::Running);

    sampler.set(|r| r.memory_bytes = 1024 * 1024 * 1024);
    pool.check_resources().await;
    let session = pool.get(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.termination.unwrap().kind, Some(ErrorKind::ResourceBudgetExceeded));
    assert!(session.pid.is_none());
    assert_eq!(pool.active_count(), 0);
    assert!(!pool.monitor().is_tracking(&id));
}

#[tokio::test]
async fn cpu_alert_is_not_fatal() {
    let (pool, sampler) = setup(Config::default());
    let dir = TempDir::new().unwrap();
    let id = pool.create(dir.path(), None).await.unwrap();
    let mut events = pool.subscribe();

    sampler.set(|r| r.cpu_fraction = 0.97);
    pool.check_resources().await;

    let alert = loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let SessionEventKind::ResourceAlert { usage } = event.kind {
            break usage;
        }
    };
    assert!(alert.cpu_fraction > 0.9);
    assert_eq!(pool.get(&id).await.unwrap().status, SessionStatus::Running);
    pool.shutdown().await;
}

#[tokio::test]
async fn memory_pressure_refuses_admission() {
    let (pool, sampler) = setup(Config::default());
    let dir = TempDir::new().unwrap();
    sampler.set(|r| r.system_used = 97);
    pool.check_resources().await;

    assert!(matches!(pool.create(dir.path(), None).await, Err(AppError::ResourceExhausted(_))));

    sampler.set(|r| r.system_used = 50);
    pool.check_resources().await;
    pool.create(dir.path(), None).await.unwrap();
    pool.shutdown().await;
}
