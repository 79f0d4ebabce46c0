//! Engine facade: the operations front ends call.
//!
//! Owns the session store, the profile configuration and the two command
//! runners, and wires capture, finalisation, commit and rollback together.
//! All state lives in the store; an `Engine` can be rebuilt per process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wd_protocol::display_argv;

use crate::allowlist::Allowlist;
use crate::audit::AuditLogger;
use crate::commit::CommitExecutor;
use crate::config::Config;
use crate::controller::{self, SandboxController, Vfs};
use crate::error::{CoreError, IoContext, Result};
use crate::policy::{Aggregate, Decision, Profile};
use crate::predict::{classify_prediction, LiteralCommand, PythonLiteralPredictor, StaticPredictor};
use crate::rollback::{RollbackEngine, RollbackReport};
use crate::runner::{CommandRunner, Confinement, HostRunner, SandboxedRunner};
use crate::session::{RunMode, Session, SessionDraft, SessionStatus};
use crate::store::SessionStore;

/// Options for [`Engine::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Profile name; the configured default when `None`.
    pub profile: Option<String>,
    pub mode: RunMode,
    /// Display name; the script's file stem when `None`.
    pub name: Option<String>,
}

pub struct Engine {
    config: Config,
    store: SessionStore,
    predictor: Box<dyn StaticPredictor>,
    live: Arc<dyn CommandRunner>,
    host: Arc<dyn CommandRunner>,
    /// Binary that serves `--sandbox-exec` for the interpreter and live execs.
    trampoline: PathBuf,
    allowlist: Allowlist,
}

impl Engine {
    /// Build an engine from configuration: sessions and audit log under the
    /// configured (or XDG) data directory.
    pub fn open(config: Config) -> Result<Self> {
        let audit = if config.audit.enabled {
            let path = config.audit.resolve_path();
            AuditLogger::new(&path).at(&path)?
        } else {
            AuditLogger::noop()
        };
        let store = SessionStore::open(
            config.session.resolve_sessions_dir(),
            chrono::Duration::seconds(config.session.ttl_secs),
            audit,
        )?;
        Self::with_store(config, store)
    }

    /// Build an engine over an existing store.
    pub fn with_store(config: Config, store: SessionStore) -> Result<Self> {
        let trampoline =
            std::env::current_exe().map_err(|e| CoreError::io("warden executable", e))?;
        let timeout = Duration::from_secs(config.sandbox.exec_timeout_secs);
        let live = live_runner(&config, trampoline.clone())?;
        Ok(Self {
            store,
            predictor: Box::new(PythonLiteralPredictor),
            live: Arc::new(live),
            host: Arc::new(HostRunner::new(timeout)),
            trampoline,
            allowlist: Allowlist::new(config.approvals.resolve_path()),
            config,
        })
    }

    /// Use `trampoline` instead of the current executable for every
    /// confined launch.
    pub fn with_trampoline(mut self, trampoline: PathBuf) -> Result<Self> {
        self.live = Arc::new(live_runner(&self.config, trampoline.clone())?);
        self.trampoline = trampoline;
        Ok(self)
    }

    /// Replace the runners used for live execs during capture and for execs
    /// at commit.
    pub fn with_runners(mut self, live: Arc<dyn CommandRunner>, host: Arc<dyn CommandRunner>) -> Self {
        self.live = live;
        self.host = host;
        self
    }

    pub fn with_predictor(mut self, predictor: Box<dyn StaticPredictor>) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A configured or built-in profile, with the persistent allowlist
    /// merged in.
    pub fn profile(&self, name: &str) -> Result<Profile> {
        Ok(self.config.profile(name)?.with_approved(self.allowlist.read()?))
    }

    /// Capture `script` under `profile` without running anything. The
    /// returned session is sealed Pending, or Failed.
    pub async fn run_dry(
        &self,
        script: &Path,
        profile: &str,
        cancel: CancellationToken,
    ) -> Result<Session> {
        let options = RunOptions {
            profile: Some(profile.to_string()),
            mode: RunMode::DryRun,
            name: None,
        };
        self.capture(script, &options, cancel).await
    }

    /// Capture `script` and finalise the session by its aggregate:
    /// Blocked is rejected, Fast is approved and executed, Review stays
    /// Pending for an operator.
    pub async fn run(
        &self,
        script: &Path,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<Session> {
        let session = self.capture(script, &options, cancel.clone()).await?;
        if session.status() != SessionStatus::Pending {
            return Ok(session);
        }

        match session.aggregate.unwrap_or(Aggregate::Review) {
            Aggregate::Blocked => {
                let reason = block_reason(&session);
                let mut guard = self.store.lock(&session.id)?;
                guard.transition(SessionStatus::Rejected, Some(reason))?;
                Ok(guard.into_session())
            }
            Aggregate::Fast => {
                let mut guard = self.store.lock(&session.id)?;
                guard.transition(
                    SessionStatus::Approved,
                    Some(format!("auto-approved by profile {}", session.profile)),
                )?;
                drop(guard);
                self.execute(&session.id, cancel).await
            }
            Aggregate::Review => Ok(session),
        }
    }

    async fn capture(
        &self,
        script: &Path,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<Session> {
        let script = canonical_script(script)?;
        let profile_name = options
            .profile
            .clone()
            .unwrap_or_else(|| self.config.default_profile.clone());
        let profile = self.profile(&profile_name)?;

        let (_, predicted) = self.predict_with(&script, &profile)?;
        // A script predicted Blocked never gets live execs.
        let mode = if predicted == Aggregate::Blocked {
            RunMode::DryRun
        } else {
            options.mode
        };

        let name = options.name.clone().unwrap_or_else(|| {
            script
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "script".to_string())
        });
        let capture = self.store.begin(SessionDraft {
            name,
            script_path: script.clone(),
            profile: profile_name,
            mode,
        })?;

        let read_roots = self.config.read_roots();
        let mut interpreter_roots = read_roots.clone();
        interpreter_roots.extend(script.parent().map(Path::to_path_buf));
        let confinement = Confinement::read_only(self.trampoline.clone(), &interpreter_roots)
            .map_err(|e| CoreError::io(&self.trampoline, e))?;

        let vfs = Vfs::new(&read_roots, &script, &self.config.sandbox.interpreter);
        let controller = SandboxController::new(capture, profile, vfs);
        controller::drive(
            controller,
            &confinement,
            &self.config.sandbox.interpreter,
            &script,
            self.live.as_ref(),
            predicted,
            Duration::from_secs(self.config.sandbox.exec_timeout_secs),
            cancel,
        )
        .await
    }

    /// Aggregate verdict of a session. An unsealed session is `Review`.
    pub fn classify(&self, id: &str) -> Result<Aggregate> {
        Ok(self.store.load(id)?.aggregate.unwrap_or(Aggregate::Review))
    }

    /// Static prediction for `script` under `profile`.
    pub fn predict(
        &self,
        script: &Path,
        profile: &str,
    ) -> Result<(Option<Vec<LiteralCommand>>, Aggregate)> {
        let profile = self.profile(profile)?;
        self.predict_with(&canonical_script(script)?, &profile)
    }

    fn predict_with(
        &self,
        script: &Path,
        profile: &Profile,
    ) -> Result<(Option<Vec<LiteralCommand>>, Aggregate)> {
        let source = std::fs::read(script).at(script)?;
        let prediction = self.predictor.predict(&String::from_utf8_lossy(&source));
        let aggregate = classify_prediction(prediction.as_deref(), profile);
        tracing::debug!(script = %script.display(), %aggregate, "static prediction");
        Ok((prediction, aggregate))
    }

    pub fn show(&self, id: &str) -> Result<Session> {
        self.store.load(id)
    }

    pub fn list(&self, pending_only: bool, limit: Option<usize>) -> Result<Vec<Session>> {
        if pending_only {
            self.store.list_pending()
        } else {
            self.store.list(limit)
        }
    }

    pub fn approve(&self, id: &str) -> Result<Session> {
        let mut guard = self.store.lock(id)?;
        guard.transition(SessionStatus::Approved, Some("approved by operator".to_string()))?;
        Ok(guard.into_session())
    }

    /// Add the command lines of a session that needed review to the
    /// persistent allowlist. Returns the lines that were new.
    pub fn remember(&self, id: &str) -> Result<Vec<String>> {
        let session = self.store.load(id)?;
        let commands: Vec<String> = session
            .operations
            .iter()
            .filter(|op| {
                session
                    .decision_for(op.sequence())
                    .is_some_and(|d| d.decision == Decision::Review)
            })
            .filter_map(|op| op.target().as_argv().map(display_argv))
            .collect();
        self.allowlist.append(commands)
    }

    pub fn reject(&self, id: &str, reason: Option<&str>) -> Result<Session> {
        let mut guard = self.store.lock(id)?;
        let reason = reason.unwrap_or("rejected by operator").to_string();
        guard.transition(SessionStatus::Rejected, Some(reason))?;
        Ok(guard.into_session())
    }

    pub async fn execute(&self, id: &str, cancel: CancellationToken) -> Result<Session> {
        CommitExecutor::new(&self.store, self.host.as_ref())
            .execute(id, &cancel)
            .await
    }

    pub fn rollback(&self, id: &str, force: bool) -> Result<RollbackReport> {
        RollbackEngine::new(&self.store).rollback(id, force)
    }

    pub fn rollback_preview(&self, id: &str, force: bool) -> Result<RollbackReport> {
        RollbackEngine::new(&self.store).preview(id, force)
    }
}

fn live_runner(config: &Config, trampoline: PathBuf) -> Result<SandboxedRunner> {
    let confinement = Confinement::read_only(trampoline, &config.read_roots())
        .map_err(|e| CoreError::io("sandbox policy", e))?;
    Ok(SandboxedRunner::new(
        confinement,
        Duration::from_secs(config.sandbox.exec_timeout_secs),
    ))
}

fn canonical_script(script: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(script) {
        Ok(path) if path.is_file() => Ok(path),
        Ok(_) => Err(CoreError::NotFound(format!("script {}", script.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CoreError::NotFound(format!("script {}", script.display())))
        }
        Err(e) => Err(CoreError::io(script, e)),
    }
}

/// Reason recorded when a session is rejected on its aggregate.
fn block_reason(session: &Session) -> String {
    match session.first_denial() {
        Some((op, pattern)) => CoreError::PolicyViolation {
            operation: op.describe(),
            pattern: pattern.unwrap_or_default().to_string(),
        }
        .to_string(),
        None => "blocked by static prediction".to_string(),
    }
}
