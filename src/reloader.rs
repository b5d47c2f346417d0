//! # Module Reloader
//!
//! Command modules are compiled in; what can change at runtime is their
//! manifest. Each directory under the modules root (`modules/<name>/`) selects
//! the factory registered under `<name>` and holds a `module.json`:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "commands": { "greet": { "enabled": true, "description": "Say hi" } },
//!   "settings": { "default_greeting": "Hello" }
//! }
//! ```
//!
//! Reloading a module rebuilds it from its manifest, replaces the commands it
//! previously registered with the new set and re-syncs the remote command list.
//! A `notify` watcher can trigger reloads when files under a module directory
//! change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{Config as WatchConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serenity::{
    all::{CommandInteraction, ComponentInteraction},
    client::Context,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    app::AppContext,
    platform::{ChatPlatform, CommandDescriptor, PlatformError, Presence},
};

pub const MANIFEST_FILE: &str = "module.json";

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("no hay un módulo compilado llamado '{0}'")]
    UnknownModule(String),

    #[error("no se pudo leer el manifiesto de '{module}': {source}")]
    Manifest {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("manifiesto inválido en '{module}': {source}")]
    InvalidManifest {
        module: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("el comando '{command}' ya pertenece al módulo '{owner}'")]
    Conflict { command: String, owner: String },

    #[error("no se pudieron sincronizar los comandos: {0}")]
    Sync(#[from] PlatformError),

    #[error("error del watcher de módulos: {0}")]
    Watch(#[from] notify::Error),

    #[error("no se pudo leer el directorio de módulos: {0}")]
    Io(#[from] std::io::Error),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Contenido de `module.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandOverride>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModuleManifest {
    fn default() -> Self {
        Self {
            enabled: true,
            commands: BTreeMap::new(),
            settings: serde_json::Map::new(),
        }
    }
}

impl ModuleManifest {
    /// Aplica los overrides: quita comandos deshabilitados y cambia descripciones.
    pub fn apply(&self, commands: Vec<CommandDescriptor>) -> Vec<CommandDescriptor> {
        commands
            .into_iter()
            .filter_map(|mut command| {
                if let Some(over) = self.commands.get(&command.name) {
                    if !over.enabled {
                        return None;
                    }
                    if let Some(description) = &over.description {
                        command.description = description.clone();
                    }
                }
                Some(command)
            })
            .collect()
    }

    pub fn setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.settings.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Setting '{}' inválido: {}", key, e);
                None
            }
        }
    }
}

/// Un grupo de slash commands que se recarga como unidad.
#[async_trait]
pub trait CommandModule: Send + Sync {
    fn name(&self) -> &str;

    fn commands(&self) -> Vec<CommandDescriptor>;

    async fn handle(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        app: &AppContext,
    ) -> anyhow::Result<()>;

    /// `true` si el módulo atendió la interacción.
    async fn handle_component(
        &self,
        _ctx: &Context,
        _component: &ComponentInteraction,
        _app: &AppContext,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub type ModuleFactory = fn(&ModuleManifest) -> Arc<dyn CommandModule>;

#[derive(Clone)]
struct RegisteredCommand {
    module: String,
    descriptor: CommandDescriptor,
}

#[derive(Default)]
struct Registry {
    modules: HashMap<String, Arc<dyn CommandModule>>,
    registered: HashMap<String, BTreeSet<String>>,
    commands: BTreeMap<String, RegisteredCommand>,
}

impl Registry {
    fn unload(&mut self, module: &str) -> BTreeSet<String> {
        self.modules.remove(module);
        let previous = self.registered.remove(module).unwrap_or_default();
        for command in &previous {
            self.commands.remove(command);
        }
        previous
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub synced: usize,
}

#[derive(Debug, Clone)]
pub struct ReloadRecord {
    pub module: String,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ModuleReloader {
    root: PathBuf,
    factories: HashMap<&'static str, ModuleFactory>,
    state: RwLock<Registry>,
    platform: Arc<dyn ChatPlatform>,
    watcher: Mutex<Option<WatchHandle>>,
    last_reload: Mutex<Option<ReloadRecord>>,
    debounce: Duration,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ModuleReloader {
    pub fn new(
        root: PathBuf,
        factories: HashMap<&'static str, ModuleFactory>,
        platform: Arc<dyn ChatPlatform>,
        debounce: Duration,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        // rutas absolutas para poder comparar con las de notify
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            factories,
            state: RwLock::new(Registry::default()),
            platform,
            watcher: Mutex::new(None),
            last_reload: Mutex::new(None),
            debounce,
            tasks,
            shutdown,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Carga todos los directorios de módulos y sincroniza una sola vez.
    pub async fn load_all(&self) -> Result<LoadReport, ReloadError> {
        *self.state.write() = Registry::default();
        let mut report = LoadReport::default();

        for name in self.module_dirs().await? {
            match self.load_one(&name).await {
                Ok(commands) => {
                    info!("📦 Módulo '{}' cargado ({} comandos)", name, commands.len());
                    report.loaded.push(name);
                }
                Err(e) => {
                    error!("❌ No se pudo cargar el módulo '{}': {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report.synced = self.sync().await?;
        Ok(report)
    }

    /// Reconstruye un módulo desde su manifiesto y reemplaza sus comandos.
    ///
    /// No sincroniza con Discord; devuelve los comandos que quedaron registrados.
    pub async fn load_one(&self, name: &str) -> Result<BTreeSet<String>, ReloadError> {
        let factory = *self
            .factories
            .get(name)
            .ok_or_else(|| ReloadError::UnknownModule(name.to_string()))?;

        let dir = self.root.join(name);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            let removed = self.state.write().unload(name);
            info!("📦 Módulo '{}' descargado ({} comandos)", name, removed.len());
            return Ok(BTreeSet::new());
        }

        let manifest = self.read_manifest(name).await?;
        if !manifest.enabled {
            let removed = self.state.write().unload(name);
            info!("📦 Módulo '{}' deshabilitado ({} comandos quitados)", name, removed.len());
            return Ok(BTreeSet::new());
        }

        let module = factory(&manifest);
        let commands = manifest.apply(module.commands());

        let mut state = self.state.write();
        let mut names = BTreeSet::new();
        for command in &commands {
            if let Some(owner) = state.commands.get(&command.name) {
                if owner.module != name {
                    return Err(ReloadError::Conflict {
                        command: command.name.clone(),
                        owner: owner.module.clone(),
                    });
                }
            }
            if !names.insert(command.name.clone()) {
                return Err(ReloadError::Conflict {
                    command: command.name.clone(),
                    owner: name.to_string(),
                });
            }
        }

        let previous = state.unload(name);
        for command in commands {
            state.commands.insert(
                command.name.clone(),
                RegisteredCommand {
                    module: name.to_string(),
                    descriptor: command,
                },
            );
        }
        state.registered.insert(name.to_string(), names.clone());
        state.modules.insert(name.to_string(), module);

        let removed: Vec<_> = previous.difference(&names).collect();
        let added: Vec<_> = names.difference(&previous).collect();
        if !removed.is_empty() || !added.is_empty() {
            debug!("Módulo '{}': +{:?} -{:?}", name, added, removed);
        }
        Ok(names)
    }

    /// Envía a Discord el conjunto completo de comandos registrados.
    pub async fn sync(&self) -> Result<usize, ReloadError> {
        let commands = self.commands();
        let synced = self.platform.sync_commands(&commands).await?;
        info!("🔄 {} comandos sincronizados", synced);
        Ok(synced)
    }

    /// Recarga un módulo y sincroniza, mostrando el estado en la presencia.
    pub async fn reload(&self, name: &str) -> Result<BTreeSet<String>, ReloadError> {
        self.platform
            .set_presence(Presence::Reloading(name.to_string()))
            .await;

        let result = match self.load_one(name).await {
            Ok(commands) => self.sync().await.map(|_| commands),
            Err(e) => Err(e),
        };

        self.platform.restore_presence().await;

        *self.last_reload.lock() = Some(ReloadRecord {
            module: name.to_string(),
            at: Utc::now(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });

        match &result {
            Ok(commands) => info!("♻️ Módulo '{}' recargado ({} comandos)", name, commands.len()),
            Err(e) => error!("❌ Error recargando '{}': {}", name, e),
        }
        result
    }

    /// Módulo dueño de un comando.
    pub fn resolve(&self, command: &str) -> Option<Arc<dyn CommandModule>> {
        let state = self.state.read();
        let owner = state.commands.get(command)?;
        state.modules.get(&owner.module).cloned()
    }

    pub fn module(&self, name: &str) -> Option<Arc<dyn CommandModule>> {
        self.state.read().modules.get(name).cloned()
    }

    pub fn registered_for(&self, module: &str) -> BTreeSet<String> {
        self.state
            .read()
            .registered
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    pub fn loaded_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn commands(&self) -> Vec<CommandDescriptor> {
        self.state
            .read()
            .commands
            .values()
            .map(|c| c.descriptor.clone())
            .collect()
    }

    pub fn is_admin_only(&self, command: &str) -> bool {
        self.state
            .read()
            .commands
            .get(command)
            .is_some_and(|c| c.descriptor.admin_only)
    }

    pub fn last_reload(&self) -> Option<ReloadRecord> {
        self.last_reload.lock().clone()
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Empieza a vigilar el directorio de módulos. No hace nada si ya vigila.
    pub fn start_watching(self: &Arc<Self>) -> Result<(), ReloadError> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            WatchConfig::default(),
        )?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        let cancel = self.shutdown.child_token();
        let this = Arc::clone(self);
        let task = self
            .tasks
            .spawn(this.watch_loop(watcher, rx, cancel.clone()));

        *slot = Some(WatchHandle { cancel, task });
        info!("👀 Vigilando módulos en {}", self.root.display());
        Ok(())
    }

    pub async fn stop_watching(&self) {
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!("El watcher de módulos terminó con error: {}", e);
            }
            info!("🛑 Auto-reload detenido");
        }
    }

    async fn watch_loop(
        self: Arc<Self>,
        // se mantiene vivo mientras dure el loop
        _watcher: RecommendedWatcher,
        mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        cancel: CancellationToken,
    ) {
        let mut pending: BTreeSet<String> = BTreeSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(Ok(event)) => {
                        if matches!(event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        for path in &event.paths {
                            if let Some(module) = self.module_for_path(path) {
                                pending.insert(module);
                            }
                        }
                    }
                    Some(Err(e)) => warn!("Error del watcher de módulos: {}", e),
                    None => break,
                },
                _ = tokio::time::sleep(self.debounce), if !pending.is_empty() => {
                    for module in std::mem::take(&mut pending) {
                        // el error ya queda registrado en reload
                        let _ = self.reload(&module).await;
                    }
                }
            }
        }
        debug!("Watcher de módulos terminado");
    }

    /// Módulo afectado por un cambio en `path`, si corresponde recargar.
    fn module_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let module = components.next()?.as_os_str().to_str()?;

        let ignored = |name: &str| name.starts_with('.') || name.starts_with('_') || name.ends_with('~');
        if ignored(module) {
            return None;
        }
        if let Some(file) = relative.file_name().and_then(|f| f.to_str()) {
            if ignored(file) {
                return None;
            }
        }

        self.factories
            .contains_key(module)
            .then(|| module.to_string())
    }

    async fn module_dirs(&self) -> Result<Vec<String>, ReloadError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn read_manifest(&self, name: &str) -> Result<ModuleManifest, ReloadError> {
        let path = self.root.join(name).join(MANIFEST_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("'{}' sin manifiesto, usando valores por defecto", name);
                return Ok(ModuleManifest::default());
            }
            Err(source) => {
                return Err(ReloadError::Manifest {
                    module: name.to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| ReloadError::InvalidManifest {
            module: name.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use pretty_assertions::assert_eq;

    /// Módulo cuyos comandos salen de `settings.commands`.
    struct ListModule {
        name: String,
        commands: Vec<String>,
    }

    #[async_trait]
    impl CommandModule for ListModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn commands(&self) -> Vec<CommandDescriptor> {
            self.commands
                .iter()
                .map(|c| CommandDescriptor::new(c, format!("{c} command")))
                .collect()
        }

        async fn handle(
            &self,
            _ctx: &Context,
            _command: &CommandInteraction,
            _app: &AppContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn alpha(manifest: &ModuleManifest) -> Arc<dyn CommandModule> {
        Arc::new(ListModule {
            name: "alpha".to_string(),
            commands: manifest.setting("commands").unwrap_or_default(),
        })
    }

    fn beta(manifest: &ModuleManifest) -> Arc<dyn CommandModule> {
        Arc::new(ListModule {
            name: "beta".to_string(),
            commands: manifest.setting("commands").unwrap_or_default(),
        })
    }

    fn write_manifest(root: &Path, module: &str, json: &str) {
        let dir = root.join(module);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), json).unwrap();
    }

    fn reloader(root: &Path, platform: Arc<FakePlatform>) -> Arc<ModuleReloader> {
        let mut factories: HashMap<&'static str, ModuleFactory> = HashMap::new();
        factories.insert("alpha", alpha);
        factories.insert("beta", beta);
        Arc::new(ModuleReloader::new(
            root.to_path_buf(),
            factories,
            platform,
            Duration::from_millis(50),
            TaskTracker::new(),
            CancellationToken::new(),
        ))
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn reload_replaces_command_set() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "alpha", r#"{"settings": {"commands": ["a", "b"]}}"#);
        let platform = Arc::new(FakePlatform::default());
        let reloader = reloader(dir.path(), platform.clone());

        let report = reloader.load_all().await.unwrap();
        assert_eq!(report.loaded, vec!["alpha".to_string()]);
        assert_eq!(reloader.registered_for("alpha"), set(&["a", "b"]));

        write_manifest(dir.path(), "alpha", r#"{"settings": {"commands": ["b", "c"]}}"#);
        let commands = reloader.reload("alpha").await.unwrap();

        assert_eq!(commands, set(&["b", "c"]));
        assert!(reloader.resolve("a").is_none());
        assert!(reloader.resolve("c").is_some());
        assert_eq!(platform.last_sync(), Some(vec!["b".to_string(), "c".to_string()]));
        assert_eq!(platform.presences.lock()[0], Presence::Reloading("alpha".to_string()));
        assert_eq!(platform.last_presence(), Some(Presence::Idle));
    }

    #[tokio::test]
    async fn failing_module_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "alpha", "{ broken");
        write_manifest(dir.path(), "beta", r#"{"settings": {"commands": ["x"]}}"#);
        std::fs::create_dir_all(dir.path().join("unknown")).unwrap();
        let platform = Arc::new(FakePlatform::default());
        let reloader = reloader(dir.path(), platform.clone());

        let report = reloader.load_all().await.unwrap();

        assert_eq!(report.loaded, vec!["beta".to_string()]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(platform.synced.lock().len(), 1);
        assert_eq!(platform.last_sync(), Some(vec!["x".to_string()]));
    }

    #[tokio::test]
    async fn command_claimed_by_other_module_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "alpha", r#"{"settings": {"commands": ["shared"]}}"#);
        write_manifest(dir.path(), "beta", r#"{"settings": {"commands": ["shared", "y"]}}"#);
        let reloader = reloader(dir.path(), Arc::new(FakePlatform::default()));

        reloader.load_one("alpha").await.unwrap();
        let err = reloader.load_one("beta").await.unwrap_err();

        assert!(matches!(err, ReloadError::Conflict { ref owner, .. } if owner == "alpha"));
        assert!(reloader.registered_for("beta").is_empty());
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_commands_and_restores_presence() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "alpha", r#"{"settings": {"commands": ["a"]}}"#);
        let platform = Arc::new(FakePlatform::default());
        let reloader = reloader(dir.path(), platform.clone());
        reloader.load_all().await.unwrap();

        write_manifest(dir.path(), "alpha", "not json");
        assert!(reloader.reload("alpha").await.is_err());

        assert_eq!(reloader.registered_for("alpha"), set(&["a"]));
        assert_eq!(platform.last_presence(), Some(Presence::Idle));
        assert!(reloader.last_reload().unwrap().error.is_some());
    }

    #[tokio::test]
    async fn manifest_overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "alpha",
            r#"{
                "settings": {"commands": ["a", "b"]},
                "commands": {"a": {"enabled": false}, "b": {"description": "custom"}}
            }"#,
        );
        write_manifest(dir.path(), "beta", r#"{"enabled": false, "settings": {"commands": ["z"]}}"#);
        let reloader = reloader(dir.path(), Arc::new(FakePlatform::default()));

        reloader.load_all().await.unwrap();

        let commands = reloader.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].description, "custom");
        assert_eq!(reloader.loaded_modules(), vec!["alpha".to_string()]);
    }

    #[test]
    fn ignored_paths_do_not_trigger_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let reloader = reloader(dir.path(), Arc::new(FakePlatform::default()));
        let root = reloader.root().to_path_buf();

        assert_eq!(
            reloader.module_for_path(&root.join("alpha").join(MANIFEST_FILE)),
            Some("alpha".to_string())
        );
        assert_eq!(reloader.module_for_path(&root.join("alpha").join(".module.json.swp")), None);
        assert_eq!(reloader.module_for_path(&root.join("alpha").join("module.json~")), None);
        assert_eq!(reloader.module_for_path(&root.join("_scratch").join("x")), None);
        assert_eq!(reloader.module_for_path(&root.join("unknown").join("x")), None);
    }

    #[tokio::test]
    async fn watcher_reloads_changed_module() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "alpha", r#"{"settings": {"commands": ["a"]}}"#);
        let platform = Arc::new(FakePlatform::default());
        let reloader = reloader(dir.path(), platform.clone());
        reloader.load_all().await.unwrap();

        reloader.start_watching().unwrap();
        assert!(reloader.is_watching());
        write_manifest(dir.path(), "alpha", r#"{"settings": {"commands": ["a", "w"]}}"#);

        let mut reloaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if reloader.registered_for("alpha").contains("w") {
                reloaded = true;
                break;
            }
        }
        reloader.stop_watching().await;

        assert!(reloaded);
        assert!(!reloader.is_watching());
    }
}
