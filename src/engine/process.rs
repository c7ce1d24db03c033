// Game process lifecycle. A single actor task owns all state; callers and the
// process-exit watcher only talk to it through channels.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::events::EngineEvent;
use super::executable::locate_executable;
use crate::catalog::{InstalledTitle, Platform};
use crate::source::traits::PlaytimeReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Launching,
    Running,
    Exited,
}

/// How to find and start the executable of an installed title.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub platform: Platform,
    /// Catalog-declared executable, relative to the install path.
    pub entry_point: Option<String>,
    /// Name token for the Linux scan.
    pub name_token: Option<String>,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            entry_point: None,
            name_token: None,
            args: Vec::new(),
        }
    }
}

enum LifecycleCommand {
    Launch {
        title: InstalledTitle,
        spec: LaunchSpec,
        reply: oneshot::Sender<Result<bool>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

struct RunningGame {
    title_id: String,
    started: Instant,
    kill: Option<oneshot::Sender<()>>,
    exited: oneshot::Receiver<()>,
}

/// Handle to the lifecycle actor of one title.
pub struct ProcessLifecycleManager {
    commands: mpsc::Sender<LifecycleCommand>,
    state: watch::Receiver<LifecycleState>,
}

impl ProcessLifecycleManager {
    /// Start the actor task. Must be called from within a tokio runtime.
    pub fn spawn(
        reporter: Arc<dyn PlaytimeReporter>,
        events: broadcast::Sender<EngineEvent>,
        stop_timeout: Duration,
        report_timeout: Duration,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let actor = LifecycleActor {
            commands: commands_rx,
            state: state_tx,
            events,
            reporter,
            stop_timeout,
            report_timeout,
            running: None,
        };
        tokio::spawn(actor.run());
        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Start the title's executable. Returns `Ok(false)` without doing anything
    /// when a game is already running.
    pub async fn launch(&self, title: &InstalledTitle, spec: LaunchSpec) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LifecycleCommand::Launch {
                title: title.clone(),
                spec,
                reply,
            })
            .await
            .map_err(|_| anyhow!("process lifecycle actor has stopped"))?;
        rx.await
            .map_err(|_| anyhow!("process lifecycle actor dropped the launch request"))?
    }

    /// Kill the running game, if any, and wait (bounded) for it to exit.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LifecycleCommand::Stop { reply })
            .await
            .map_err(|_| anyhow!("process lifecycle actor has stopped"))?;
        rx.await
            .map_err(|_| anyhow!("process lifecycle actor dropped the stop request"))
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }
}

struct LifecycleActor {
    commands: mpsc::Receiver<LifecycleCommand>,
    state: watch::Sender<LifecycleState>,
    events: broadcast::Sender<EngineEvent>,
    reporter: Arc<dyn PlaytimeReporter>,
    stop_timeout: Duration,
    report_timeout: Duration,
    running: Option<RunningGame>,
}

async fn wait_exit(running: &mut Option<RunningGame>) {
    match running {
        Some(game) => {
            let _ = (&mut game.exited).await;
        }
        None => std::future::pending().await,
    }
}

impl LifecycleActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = wait_exit(&mut self.running) => self.finish(),
            }
        }
        debug!("process lifecycle actor finished");
    }

    async fn handle(&mut self, cmd: LifecycleCommand) {
        match cmd {
            LifecycleCommand::Launch { title, spec, reply } => {
                let result = self.launch(title, spec).await;
                let _ = reply.send(result);
            }
            LifecycleCommand::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
        }
    }

    async fn launch(&mut self, title: InstalledTitle, spec: LaunchSpec) -> Result<bool> {
        if let Some(game) = &self.running {
            debug!("launch ignored, {} is already running", game.title_id);
            return Ok(false);
        }

        self.state.send_replace(LifecycleState::Launching);
        match spawn_game(&title, spec).await {
            Ok(game) => {
                info!("game {} started", game.title_id);
                self.running = Some(game);
                self.state.send_replace(LifecycleState::Running);
                let _ = self.events.send(EngineEvent::GameRunningChanged {
                    title_id: title.title_id,
                    running: true,
                });
                Ok(true)
            }
            Err(e) => {
                warn!("launch of {} failed: {:#}", title.title_id, e);
                self.state.send_replace(LifecycleState::Idle);
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        let Some(game) = self.running.as_mut() else {
            debug!("stop ignored, nothing is running");
            return;
        };
        info!("stopping game {}", game.title_id);
        if let Some(kill) = game.kill.take() {
            let _ = kill.send(());
        }
        if tokio::time::timeout(self.stop_timeout, &mut game.exited)
            .await
            .is_err()
        {
            warn!(
                "game {} did not exit within {:?} of being killed",
                game.title_id, self.stop_timeout
            );
        }
        self.finish();
    }

    /// Exit bookkeeping: stop the clock, notify, back to idle. The play time report runs
    /// on its own task so queued commands are not held up by a slow endpoint.
    fn finish(&mut self) {
        let Some(game) = self.running.take() else {
            return;
        };
        let elapsed = game.started.elapsed();
        self.state.send_replace(LifecycleState::Exited);
        info!("game {} exited after {:?}", game.title_id, elapsed);
        let _ = self.events.send(EngineEvent::GameRunningChanged {
            title_id: game.title_id.clone(),
            running: false,
        });

        tokio::spawn(report_session(
            self.reporter.clone(),
            self.events.clone(),
            self.report_timeout,
            game.title_id,
            elapsed,
        ));
        self.state.send_replace(LifecycleState::Idle);
    }
}

/// Deliver the play time of a finished session and publish `PlaySessionEnded`.
/// Failures are logged, never propagated.
async fn report_session(
    reporter: Arc<dyn PlaytimeReporter>,
    events: broadcast::Sender<EngineEvent>,
    report_timeout: Duration,
    title_id: String,
    elapsed: Duration,
) {
    let reported = match tokio::time::timeout(
        report_timeout,
        reporter.report_playtime(&title_id, elapsed),
    )
    .await
    {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("playtime report for {} failed: {:#}", title_id, e);
            false
        }
        Err(_) => {
            warn!("playtime report for {} timed out", title_id);
            false
        }
    };
    let _ = events.send(EngineEvent::PlaySessionEnded {
        title_id,
        elapsed,
        reported,
    });
}

async fn spawn_game(title: &InstalledTitle, spec: LaunchSpec) -> Result<RunningGame> {
    let root = title.install_path.clone();
    let platform = spec.platform;
    let entry_point = spec.entry_point.clone();
    let name_token = spec.name_token.clone();
    let executable: PathBuf = tokio::task::spawn_blocking(move || {
        locate_executable(&root, platform, entry_point.as_deref(), name_token.as_deref())
    })
    .await
    .context("executable scan panicked")??;

    let working_dir = executable
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| title.install_path.clone());
    let mut child = Command::new(&executable)
        .args(&spec.args)
        .current_dir(&working_dir)
        .stdin(Stdio::null())
        .spawn()
        .with_context(|| format!("starting {}", executable.display()))?;
    let started = Instant::now();
    debug!("spawned {} pid={:?}", executable.display(), child.id());

    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = oneshot::channel::<()>();
    let title_id = title.title_id.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!("kill of {} failed: {}", title_id, e);
                }
                child.wait().await
            }
        };
        match status {
            Ok(status) => debug!("process of {} exited with {}", title_id, status),
            Err(e) => warn!("waiting on process of {} failed: {}", title_id, e),
        }
        let _ = exit_tx.send(());
    });

    Ok(RunningGame {
        title_id: title.title_id.clone(),
        started,
        kill: Some(kill_tx),
        exited: exit_rx,
    })
}
