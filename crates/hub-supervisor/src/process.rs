//! Plugins running as child processes
//!
//! Every subdirectory of the plugins directory holding a `plugin.yaml`
//! becomes an installable plugin. The child speaks newline delimited JSON
//! on stdin and stdout:
//!
//! ```text
//! hub → child   start, add_actor, remove_actor, call_action, call_scene, shutdown
//! child → hub   ready, log, set_state
//! ```
//!
//! A `set_state` line is republished as `EntitySetState`, so it goes
//! through the supervisor like any other mutation.

use async_trait::async_trait;
use hub_core::models::{Entity, PluginKind, PluginOptions};
use hub_core::{topics, EntityId, Event, HubError, HubResult, StateParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::actor::{ActionHandler, Actor, ActorSet};
use crate::plugin::{Plugin, PluginService, SharedPlugin};
use crate::registry::{PluginFactory, PluginLoader};

pub const MANIFEST_FILE: &str = "plugin.yaml";

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest a write may wait on a child that stopped reading stdin
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Contents of `plugin.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Executable, relative to the manifest directory unless absolute
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub options: PluginOptions,
    #[serde(default)]
    pub settings: Value,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl Manifest {
    pub fn parse(content: &str) -> HubResult<Self> {
        let manifest: Manifest = serde_yaml::from_str(content).map_err(HubError::internal)?;
        if manifest.name.trim().is_empty() {
            return Err(HubError::internal("plugin manifest without a name"));
        }
        Ok(manifest)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Start { settings: Value },
    AddActor { entity: Box<Entity> },
    RemoveActor { entity_id: EntityId },
    CallAction { entity_id: EntityId, action: String, args: Value },
    CallScene { entity_id: EntityId, args: Value },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Ready,
    Log {
        #[serde(default)]
        level: String,
        message: String,
    },
    SetState {
        entity_id: EntityId,
        #[serde(flatten)]
        params: StateParams,
    },
}

/// Scans a directory for plugin manifests
pub struct ProcessPluginLoader {
    dir: PathBuf,
}

impl ProcessPluginLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn manifests(&self) -> HubResult<Vec<(PathBuf, Manifest)>> {
        if !self.dir.is_dir() {
            debug!(dir = %self.dir.display(), "No plugins directory");
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(HubError::internal)? {
            let dir = entry.map_err(HubError::internal)?.path();
            let path = dir.join(MANIFEST_FILE);
            if !path.is_file() {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(HubError::internal)
                .and_then(|content| Manifest::parse(&content));
            match parsed {
                Ok(manifest) => found.push((dir, manifest)),
                Err(err) => warn!(path = %path.display(), error = %err, "Invalid plugin manifest"),
            }
        }
        found.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        Ok(found)
    }
}

impl PluginLoader for ProcessPluginLoader {
    fn name(&self) -> &str {
        "process"
    }

    fn discover(&self) -> HubResult<Vec<(String, PluginFactory)>> {
        Ok(self
            .manifests()?
            .into_iter()
            .map(|(dir, manifest)| {
                let name = manifest.name.clone();
                let plugin: SharedPlugin = Arc::new(ProcessPlugin::new(manifest, dir));
                let factory: PluginFactory = Arc::new(move || plugin.clone());
                (name, factory)
            })
            .collect())
    }
}

/// Write side of the child's stdin
struct Channel {
    stdin: Mutex<Option<ChildStdin>>,
    send_timeout: Duration,
}

impl Default for Channel {
    fn default() -> Self {
        Self::with_timeout(SEND_TIMEOUT)
    }
}

impl Channel {
    fn with_timeout(send_timeout: Duration) -> Self {
        Self {
            stdin: Mutex::new(None),
            send_timeout,
        }
    }

    async fn send(&self, message: &Outbound) -> HubResult<()> {
        let mut line = serde_json::to_vec(message).map_err(HubError::internal)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| HubError::internal("plugin process not running"))?;
        let write = async {
            pipe.write_all(&line).await?;
            pipe.flush().await
        };
        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(result) => result.map_err(HubError::internal),
            Err(_) => Err(HubError::internal(format!(
                "plugin process did not read its input within {:?}",
                self.send_timeout
            ))),
        }
    }
}

/// Forwards actor commands to the child
struct ProcessActions {
    channel: Arc<Channel>,
}

#[async_trait]
impl ActionHandler for ProcessActions {
    async fn call_action(&self, actor: &Actor, action: &str, args: Value) -> HubResult<()> {
        self.channel
            .send(&Outbound::CallAction {
                entity_id: actor.id().clone(),
                action: action.to_string(),
                args,
            })
            .await
    }

    async fn call_scene(&self, actor: &Actor, args: Value) -> HubResult<()> {
        self.channel
            .send(&Outbound::CallScene {
                entity_id: actor.id().clone(),
                args,
            })
            .await
    }
}

pub struct ProcessPlugin {
    manifest: Manifest,
    dir: PathBuf,
    actors: ActorSet,
    channel: Arc<Channel>,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessPlugin {
    pub fn new(manifest: Manifest, dir: impl Into<PathBuf>) -> Self {
        let channel = Arc::new(Channel::default());
        let actors = ActorSet::with_handler(
            manifest.name.clone(),
            Arc::new(ProcessActions {
                channel: channel.clone(),
            }),
        );
        Self {
            manifest,
            dir: dir.into(),
            actors,
            channel,
            child: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn command_path(&self) -> PathBuf {
        if self.manifest.command.is_absolute() {
            self.manifest.command.clone()
        } else {
            self.dir.join(&self.manifest.command)
        }
    }

    async fn wait_ready(&self, lines: &mut tokio::io::Lines<BufReader<ChildStdout>>) -> HubResult<()> {
        let name = self.manifest.name.as_str();
        loop {
            let line = tokio::time::timeout(READY_TIMEOUT, lines.next_line())
                .await
                .map_err(|_| HubError::Internal(format!("plugin {name} did not report ready")))?
                .map_err(HubError::internal)?
                .ok_or_else(|| HubError::Internal(format!("plugin {name} exited before ready")))?;
            match serde_json::from_str::<Inbound>(&line) {
                Ok(Inbound::Ready) => return Ok(()),
                Ok(Inbound::Log { level, message }) => log_line(name, &level, &message),
                Ok(other) => trace!(plugin = name, message = ?other, "Ignoring message before ready"),
                Err(err) => warn!(plugin = name, error = %err, "Malformed plugin message"),
            }
        }
    }
}

fn log_line(plugin: &str, level: &str, message: &str) {
    match level {
        "trace" => trace!(target: "plugin", plugin, "{message}"),
        "debug" => debug!(target: "plugin", plugin, "{message}"),
        "warn" => warn!(target: "plugin", plugin, "{message}"),
        "error" => error!(target: "plugin", plugin, "{message}"),
        _ => info!(target: "plugin", plugin, "{message}"),
    }
}

async fn read_loop(
    plugin: String,
    mut lines: tokio::io::Lines<BufReader<ChildStdout>>,
    bus: hub_event_bus::SharedEventBus,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<Inbound>(&line) {
                Ok(Inbound::Log { level, message }) => log_line(&plugin, &level, &message),
                Ok(Inbound::SetState { entity_id, params }) => {
                    if entity_id.plugin_name() != plugin {
                        warn!(plugin = %plugin, entity_id = %entity_id, "Plugin set state of a foreign entity");
                        continue;
                    }
                    bus.publish(topics::entity(&entity_id), Event::EntitySetState { entity_id, params })
                        .await;
                }
                Ok(Inbound::Ready) => {}
                Err(err) => warn!(plugin = %plugin, error = %err, "Malformed plugin message"),
            },
            Ok(None) => {
                info!(plugin = %plugin, "Plugin process closed its output");
                break;
            }
            Err(err) => {
                error!(plugin = %plugin, error = %err, "Plugin IPC error");
                break;
            }
        }
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn version(&self) -> &str {
        &self.manifest.version
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Installable
    }

    fn depends(&self) -> Vec<String> {
        self.manifest.depends.clone()
    }

    fn options(&self) -> PluginOptions {
        self.manifest.options.clone()
    }

    async fn load(&self, service: PluginService) -> HubResult<()> {
        let command = self.command_path();
        info!(plugin = %self.manifest.name, command = %command.display(), "Spawning plugin process");

        let mut child = Command::new(&command)
            .args(&self.manifest.args)
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HubError::Internal(format!("failed to spawn {}: {e}", command.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::internal("plugin stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::internal("plugin stdout not captured"))?;

        let mut lines = BufReader::new(stdout).lines();
        *self.channel.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let started = async {
            self.channel
                .send(&Outbound::Start {
                    settings: self.manifest.settings.clone(),
                })
                .await?;
            self.wait_ready(&mut lines).await
        }
        .await;
        if let Err(err) = started {
            self.stop_process().await;
            return Err(err);
        }

        let reader = tokio::spawn(read_loop(self.manifest.name.clone(), lines, service.bus.clone()));
        *self.reader.lock().await = Some(reader);
        self.actors.bind(service);
        debug!(plugin = %self.manifest.name, "Plugin process ready");
        Ok(())
    }

    async fn unload(&self) -> HubResult<()> {
        if let Err(err) = self.channel.send(&Outbound::Shutdown).await {
            debug!(plugin = %self.manifest.name, error = %err, "Shutdown not delivered");
        }
        self.actors.clear().await;
        self.stop_process().await;
        Ok(())
    }

    async fn install(&self) -> HubResult<()> {
        let command = self.command_path();
        if command.is_file() {
            Ok(())
        } else {
            Err(HubError::not_found("plugin executable", command.display()))
        }
    }

    fn actors(&self) -> Option<&ActorSet> {
        Some(&self.actors)
    }

    async fn add_or_update_actor(&self, entity: Entity) -> HubResult<()> {
        self.actors.add_or_update(entity.clone()).await?;
        self.channel
            .send(&Outbound::AddActor {
                entity: Box::new(entity),
            })
            .await
    }

    async fn remove_actor(&self, entity_id: &EntityId) -> HubResult<()> {
        self.actors.remove(entity_id).await?;
        self.channel
            .send(&Outbound::RemoveActor {
                entity_id: entity_id.clone(),
            })
            .await
    }
}

impl ProcessPlugin {
    async fn stop_process(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.channel.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(plugin = %self.manifest.name, %status, "Plugin process exited"),
                _ => {
                    warn!(plugin = %self.manifest.name, "Killing plugin process");
                    let _ = child.kill().await;
                }
            }
        }
    }

    pub fn manifest_dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manifest_defaults() {
        let manifest = Manifest::parse("name: weather\ncommand: ./weather\n").unwrap();
        assert_eq!(manifest.version, "0.1.0");
        assert!(manifest.depends.is_empty());
        assert!(Manifest::parse("name: ''\ncommand: x\n").is_err());
    }

    #[test]
    fn test_protocol_lines() {
        let line = serde_json::to_value(Outbound::CallAction {
            entity_id: "weather.home".parse().unwrap(),
            action: "refresh".into(),
            args: json!({}),
        })
        .unwrap();
        assert_eq!(line["type"], "call_action");
        assert_eq!(serde_json::to_value(Outbound::Shutdown).unwrap(), json!({"type": "shutdown"}));

        let inbound: Inbound = serde_json::from_str(
            r#"{"type":"set_state","entity_id":"weather.home","new_state":"sunny"}"#,
        )
        .unwrap();
        match inbound {
            Inbound::SetState { entity_id, params } => {
                assert_eq!(entity_id.plugin_name(), "weather");
                assert_eq!(params.new_state.as_deref(), Some("sunny"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_loader_discovers_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("weather");
        std::fs::create_dir(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join(MANIFEST_FILE),
            "name: weather\nversion: 1.2.0\ncommand: run.sh\ndepends: [triggers]\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();

        let found = ProcessPluginLoader::new(dir.path()).discover().unwrap();
        assert_eq!(found.len(), 1);
        let plugin = (found[0].1)();
        assert_eq!(plugin.name(), "weather");
        assert_eq!(plugin.version(), "1.2.0");
        assert_eq!(plugin.kind(), PluginKind::Installable);
        assert_eq!(plugin.depends(), vec!["triggers"]);
    }

    #[tokio::test]
    async fn test_install_requires_executable() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = ProcessPlugin::new(Manifest::parse("name: ghost\ncommand: nothing\n").unwrap(), dir.path());
        assert!(plugin.install().await.unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_to_stalled_child_times_out() {
        // never reads stdin, so the pipe fills up
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let channel = Channel::with_timeout(Duration::from_millis(200));
        *channel.stdin.lock().await = child.stdin.take();

        let message = Outbound::CallAction {
            entity_id: "weather.home".parse().unwrap(),
            action: "refresh".into(),
            args: json!("x".repeat(1 << 20)),
        };
        let started = std::time::Instant::now();
        let err = channel.send(&message).await.unwrap_err();
        assert!(matches!(err, HubError::Internal(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        child.kill().await.unwrap();
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let loader = ProcessPluginLoader::new("/nonexistent/hub/plugins");
        assert!(loader.discover().unwrap().is_empty());
    }
}
