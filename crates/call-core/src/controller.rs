//! Session controller
//!
//! The façade the presentation layer talks to. It composes the signaling
//! port, the media capability and the peer engine with a
//! [`NegotiationStateMachine`] running on its own task, and exposes:
//!
//! - user actions: [`search`](SessionController::search),
//!   [`next`](SessionController::next), [`hangup`](SessionController::hangup),
//!   [`toggle_auto_search`](SessionController::toggle_auto_search)
//! - a status stream ([`watch_status`](SessionController::watch_status))
//! - an event/error stream ([`subscribe`](SessionController::subscribe))
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pairtalk_call_core::{CallConfig, SessionController};
//! # use pairtalk_call_core::{MediaCapability, PeerEngine, SignalingPort};
//! # async fn run(
//! #     signaling: Arc<dyn SignalingPort>,
//! #     media: Arc<dyn MediaCapability>,
//! #     engine: Arc<dyn PeerEngine>,
//! # ) -> pairtalk_call_core::CallResult<()> {
//! let controller = SessionController::new(
//!     CallConfig::new().with_auto_search(true),
//!     signaling,
//!     media,
//!     engine,
//! )?;
//!
//! let mut status = controller.watch_status();
//! controller.search().await?;
//! status.changed().await.ok();
//! println!("status: {}", *status.borrow());
//!
//! controller.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::events::{EventEmitter, EventIterator, EventStream};
use crate::machine::{MachineInputs, NegotiationStateMachine};
use crate::media::MediaCapability;
use crate::peer::PeerEngine;
use crate::signaling::{SignalingMessage, SignalingPort, SignalingStream};
use crate::types::{CallStatus, SessionSnapshot};

/// Requests handled by the controller task
enum ControllerCommand {
    Search(oneshot::Sender<CallResult<()>>),
    Next(oneshot::Sender<CallResult<()>>),
    Hangup(oneshot::Sender<CallResult<()>>),
    SetAutoSearch {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    ToggleAutoSearch(oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Top-level handle on one anonymous pairing client
pub struct SessionController {
    commands: mpsc::Sender<ControllerCommand>,
    status: watch::Receiver<CallStatus>,
    events: EventEmitter,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Validate `config`, subscribe to `signaling` and start the controller
    /// task. Must be called from within a Tokio runtime.
    pub fn new(
        config: CallConfig,
        signaling: Arc<dyn SignalingPort>,
        media: Arc<dyn MediaCapability>,
        engine: Arc<dyn PeerEngine>,
    ) -> CallResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CallError::configuration("SessionController needs a Tokio runtime"))?;
        let inbound = signaling.subscribe()?;

        let events = EventEmitter::new(config.event_capacity);
        let (status_tx, status) = watch::channel(CallStatus::Idle);
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity);

        let (machine, inputs) =
            NegotiationStateMachine::new(config, signaling, media, engine, events.clone(), status_tx);
        let task = runtime.spawn(run_controller(machine, inputs, commands_rx, inbound));
        info!("session controller started");

        Ok(Self {
            commands: commands_tx,
            status,
            events,
            task: Mutex::new(Some(task)),
        })
    }

    /// Send `FindPartner` and enter `Searching`
    pub async fn search(&self) -> CallResult<()> {
        self.request(ControllerCommand::Search).await?
    }

    /// Drop the current partner and search again after the rematch delay
    pub async fn next(&self) -> CallResult<()> {
        self.request(ControllerCommand::Next).await?
    }

    /// Hang up, stop searching, or cancel a pending rematch
    pub async fn hangup(&self) -> CallResult<()> {
        self.request(ControllerCommand::Hangup).await?
    }

    /// Set the auto-search flag; returns the previous value
    pub async fn set_auto_search(&self, enabled: bool) -> CallResult<bool> {
        self.request(|reply| ControllerCommand::SetAutoSearch { enabled, reply })
            .await
    }

    /// Flip the auto-search flag; returns the new value
    pub async fn toggle_auto_search(&self) -> CallResult<bool> {
        self.request(ControllerCommand::ToggleAutoSearch).await
    }

    /// Point-in-time view of the controller
    pub async fn snapshot(&self) -> CallResult<SessionSnapshot> {
        self.request(ControllerCommand::Snapshot).await
    }

    /// Current status
    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    /// Status stream; `Closing` is never published
    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Subscribe to events with a simple iterator
    pub fn subscribe_simple(&self) -> EventIterator {
        self.events.subscribe_simple()
    }

    /// Whether the controller task is still running
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Hang up if needed, release everything and stop the task.
    ///
    /// Later commands fail with [`CallError::Shutdown`]. Calling it again is
    /// a no-op.
    pub async fn shutdown(&self) -> CallResult<()> {
        match self.request(ControllerCommand::Shutdown).await {
            Ok(()) | Err(CallError::Shutdown) => {}
            Err(e) => return Err(e),
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| CallError::internal(format!("controller task failed: {}", e)))?;
        }
        Ok(())
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand) -> CallResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)
    }
}

/// Controller task: one input at a time, in arrival order per source
async fn run_controller(
    mut machine: NegotiationStateMachine,
    mut inputs: MachineInputs,
    mut commands: mpsc::Receiver<ControllerCommand>,
    mut inbound: SignalingStream,
) {
    let mut signaling_open = true;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ControllerCommand::Shutdown(reply)) => {
                    machine.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Some(command) => handle_command(&mut machine, command).await,
                None => {
                    debug!("all controller handles dropped");
                    machine.shutdown().await;
                    break;
                }
            },

            message = inbound.recv(), if signaling_open => match message {
                Some(message) => {
                    debug!(kind = message.kind(), "signaling message received");
                    machine.handle_signaling(message).await;
                }
                None => {
                    signaling_open = false;
                    machine.handle_signaling(SignalingMessage::TransportDisconnected).await;
                }
            },

            Some(event) = inputs.peer_events.recv() => machine.handle_peer_event(event).await,

            Some(step) = inputs.steps.recv() => machine.handle_step(step).await,

            Some(fired) = inputs.timers.recv() => machine.handle_timer(fired).await,
        }
    }

    info!("session controller stopped");
}

async fn handle_command(machine: &mut NegotiationStateMachine, command: ControllerCommand) {
    match command {
        ControllerCommand::Search(reply) => {
            let _ = reply.send(machine.search().await);
        }
        ControllerCommand::Next(reply) => {
            let _ = reply.send(machine.next().await);
        }
        ControllerCommand::Hangup(reply) => {
            let _ = reply.send(machine.hangup().await);
        }
        ControllerCommand::SetAutoSearch { enabled, reply } => {
            let _ = reply.send(machine.set_auto_search(enabled).await);
        }
        ControllerCommand::ToggleAutoSearch(reply) => {
            let _ = reply.send(machine.toggle_auto_search().await);
        }
        ControllerCommand::Snapshot(reply) => {
            let _ = reply.send(machine.snapshot());
        }
        ControllerCommand::Shutdown(reply) => {
            machine.shutdown().await;
            let _ = reply.send(());
        }
    }
}
