#![cfg(unix)]

use async_trait::async_trait;
use cctm_engine::capability::{Capability, CapabilityRequest, ProviderDescriptor, ProviderLauncher, ProviderState};
use cctm_engine::config::Config;
use cctm_engine::engine::Engine;
use cctm_engine::error::{AppError, AppResult};
use cctm_engine::project::ProjectKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Minimal MCP server in sh: answers `initialize`, `tools/list` and `tools/call`.
const SCRIPTED_PROVIDER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      version=$(printf '%s' "$line" | sed -n 's/.*"protocolVersion":"\([^"]*\)".*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"%s","capabilities":{"tools":{}},"serverInfo":{"name":"cargo","version":"0.1.0"}}}\n' "$id" "$version" ;;
    *'"method":"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id" ;;
    *'"method":"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"cargo test --all"}]}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;

struct Tagged {
    tag: &'static str,
    seen_history: Arc<AtomicUsize>,
}

#[async_trait]
impl Capability for Tagged {
    async fn respond(&self, request: CapabilityRequest) -> AppResult<String> {
        self.seen_history.store(request.history.len(), Ordering::SeqCst);
        Ok(format!("[{}:{}] {}", self.tag, request.project.kind, request.input))
    }

    async fn health_check(&self) -> AppResult<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

struct TaggedLauncher {
    tag: &'static str,
    seen_history: Arc<AtomicUsize>,
}

#[async_trait]
impl ProviderLauncher for TaggedLauncher {
    async fn launch(&self, _descriptor: &ProviderDescriptor) -> AppResult<Arc<dyn Capability>> {
        Ok(Arc::new(Tagged {
            tag: self.tag,
            seen_history: self.seen_history.clone(),
        }))
    }
}

fn config(provider_dir: Option<&TempDir>) -> Config {
    Config {
        default_shell: Some("sh".into()),
        provider_dirs: provider_dir.map(|d| vec![d.path().to_path_buf()]).unwrap_or_default(),
        state_dir: None,
        dispatch_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

#[tokio::test]
async fn manifest_provider_answers_rust_sessions() {
    let providers = TempDir::new().unwrap();
    let manifest = serde_json::json!({
        "name": "Cargo helper",
        "command": "sh",
        "args": ["-c", SCRIPTED_PROVIDER],
        "supports": ["rust"],
    });
    std::fs::write(providers.path().join("cargo.json"), manifest.to_string()).unwrap();

    let engine = Engine::new(config(Some(&providers)));
    engine.start().await;
    let listed = engine.registry().list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, ProviderState::Discovered);

    let project = TempDir::new().unwrap();
    std::fs::write(project.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    let id = engine.pool().create(project.path(), None).await.unwrap();
    assert_eq!(engine.pool().get(&id).await.unwrap().project.kind, ProjectKind::Rust);

    let reply = engine.bridge().dispatch(&id, "run all the tests").await.unwrap();
    assert_eq!(reply.provider_id, "cargo");
    assert_eq!(reply.output, "cargo test --all");
    assert_eq!(engine.registry().list().await[0].state, ProviderState::Ready);

    // A python project has no provider and no default.
    let other = TempDir::new().unwrap();
    std::fs::write(other.path().join("pyproject.toml"), "").unwrap();
    let py = engine.pool().create(other.path(), None).await.unwrap();
    let err = engine.bridge().dispatch(&py, "lint").await.unwrap_err();
    assert!(matches!(err, AppError::NoCapabilityAvailable(_)));
    assert!(engine.bridge().history(&py).is_empty());

    engine.shutdown().await;
    assert_eq!(engine.registry().list().await[0].state, ProviderState::Stopped);
}

#[tokio::test]
async fn default_provider_covers_unknown_projects_with_memory() {
    let engine = Engine::new(config(None));
    engine.start().await;
    let seen_history = Arc::new(AtomicUsize::new(0));
    engine
        .registry()
        .register(
            ProviderDescriptor::new("general").as_default(),
            Arc::new(TaggedLauncher {
                tag: "general",
                seen_history: seen_history.clone(),
            }),
        )
        .unwrap();

    let dir = TempDir::new().unwrap();
    let id = engine.pool().create(dir.path(), None).await.unwrap();
    for n in 0..8 {
        let reply = engine.bridge().dispatch(&id, &format!("step {}", n)).await.unwrap();
        assert_eq!(reply.output, format!("[general:unknown] step {}", n));
    }
    assert_eq!(seen_history.load(Ordering::SeqCst), 5);
    assert_eq!(engine.bridge().history(&id).len(), 8);

    engine.pool().terminate(&id).await.unwrap();
    for _ in 0..100 {
        if engine.bridge().history(&id).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.bridge().history(&id).is_empty());
    assert!(matches!(
        engine.bridge().dispatch(&id, "more").await,
        Err(AppError::InvalidState(_))
    ));
    engine.shutdown().await;
}
