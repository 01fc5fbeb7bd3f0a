//! Feeds chain events into the coordinator and polls for timeouts.

use crate::{coordinator::Coordinator, ledger::ChainId, monitor::ChainEvent, swap::SwapId};
use anyhow::Context;
use futures::{
    channel::{mpsc, oneshot},
    stream, FutureExt, StreamExt,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

#[derive(Debug)]
enum Command {
    Event(ChainId, ChainEvent),
    Tick,
}

#[derive(Debug)]
struct Actor {
    mailbox: mpsc::Sender<Command>,
    /// Events the mailbox had no room for, oldest first.
    backlog: VecDeque<Command>,
}

impl Actor {
    /// Moves as much of the backlog into the mailbox as fits.
    fn flush(&mut self) {
        while let Some(command) = self.backlog.pop_front() {
            if let Err(e) = self.mailbox.try_send(command) {
                self.backlog.push_front(e.into_inner());
                return;
            }
        }
    }

    fn deliver(&mut self, command: Command) {
        self.flush();
        if !self.backlog.is_empty() {
            self.backlog.push_back(command);
            return;
        }

        if let Err(e) = self.mailbox.try_send(command) {
            if e.is_full() {
                tracing::warn!("swap actor is busy, holding back its events");
                self.backlog.push_back(e.into_inner());
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.backlog.is_empty()
    }
}

/// Runs one actor task per swap. Events of a swap are handled in order,
/// swaps make progress independently: a swap stuck on a slow chain holds up
/// nobody but itself.
#[derive(Debug)]
pub struct Driver {
    coordinator: Arc<Coordinator>,
    actor_capacity: usize,
    actors: HashMap<SwapId, Actor>,
    tasks: Vec<JoinHandle<()>>,
}

impl Driver {
    /// Commands queued in a swap's mailbox before the driver holds them
    /// back.
    pub const DEFAULT_ACTOR_CAPACITY: usize = 16;
    /// How long shutdown waits for a swap actor to finish what it is doing.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self::with_actor_capacity(coordinator, Self::DEFAULT_ACTOR_CAPACITY)
    }

    pub fn with_actor_capacity(coordinator: Arc<Coordinator>, actor_capacity: usize) -> Self {
        Driver {
            coordinator,
            actor_capacity,
            actors: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Starts all monitors and runs until `shutdown` fires or its sender is
    /// dropped.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        let monitors = self.coordinator.monitors();
        for monitor in &monitors {
            monitor
                .start()
                .await
                .with_context(|| format!("failed to start monitor of chain {}", monitor.chain()))?;
        }

        let mut events = stream::select_all(monitors.iter().map(|monitor| {
            let chain = monitor.chain().clone();
            monitor.subscribe().map(move |event| (chain.clone(), event))
        }));
        let mut interval = tokio::time::interval(self.coordinator.settings().swap.poll_interval);

        tracing::info!(chains = monitors.len(), "driver started");
        loop {
            futures::select! {
                _ = shutdown => break,
                (chain, event) = events.select_next_some() => {
                    self.dispatch(chain, event).await;
                },
                _ = interval.tick().fuse() => {
                    self.tick().await;
                }
            }
        }

        tracing::info!("shutting down driver");
        self.actors.clear();
        for mut task in self.tasks.drain(..) {
            match tokio::time::timeout(Self::SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("swap actor failed: {}", e),
                Err(_) => {
                    tracing::warn!("swap actor did not stop in time");
                    task.abort();
                }
            }
        }
        for monitor in &monitors {
            if let Err(e) = monitor.stop().await {
                tracing::warn!("failed to stop monitor of chain {}: {:#}", monitor.chain(), e);
            }
        }

        Ok(())
    }

    async fn dispatch(&mut self, chain: ChainId, event: ChainEvent) {
        let swap_id = match self.coordinator.route(&chain, event.htlc()).await {
            Some((swap_id, _)) => swap_id,
            None => {
                tracing::trace!(%chain, "no swap for {}", event);
                return;
            }
        };

        self.actor(swap_id).deliver(Command::Event(chain, event));
    }

    /// Asks every active swap to poll its chains. A swap still busy with
    /// the previous round is skipped.
    async fn tick(&mut self) {
        let backlogged = self
            .actors
            .iter()
            .filter(|(_, actor)| !actor.is_idle())
            .map(|(swap_id, _)| *swap_id)
            .collect::<Vec<_>>();
        for swap_id in backlogged {
            self.actor(swap_id).flush();
        }

        for swap_id in self.coordinator.active_swaps().await {
            let actor = self.actor(swap_id);
            if !actor.is_idle() {
                continue;
            }
            if actor.mailbox.try_send(Command::Tick).is_err() {
                tracing::debug!(%swap_id, "swap actor is busy, skipping tick");
            }
        }

        self.actors
            .retain(|_, actor| !actor.mailbox.is_closed() || !actor.is_idle());
        self.tasks.retain(|task| !task.is_finished());
    }

    /// The actor of `swap_id`, respawned if it has stopped. Held back
    /// commands carry over.
    fn actor(&mut self, swap_id: SwapId) -> &mut Actor {
        let actor = match self.actors.remove(&swap_id) {
            Some(actor) if !actor.mailbox.is_closed() => actor,
            stopped => Actor {
                mailbox: self.spawn_actor(swap_id),
                backlog: stopped.map(|actor| actor.backlog).unwrap_or_default(),
            },
        };

        self.actors.entry(swap_id).or_insert(actor)
    }

    fn spawn_actor(&mut self, swap_id: SwapId) -> mpsc::Sender<Command> {
        let (sender, mut receiver) = mpsc::channel::<Command>(self.actor_capacity);
        let coordinator = self.coordinator.clone();

        let task = tokio::spawn(
            async move {
                while let Some(command) = receiver.next().await {
                    match command {
                        Command::Event(chain, event) => {
                            if let Err(e) = coordinator.handle_chain_event(&chain, event).await {
                                tracing::error!("failed to handle chain event: {}", e);
                            }
                        }
                        Command::Tick => {
                            let _ = coordinator.tick_swap(swap_id).await;
                        }
                    }

                    let finished = coordinator
                        .swap(swap_id)
                        .await
                        .map_or(true, |swap| swap.state.is_terminal());
                    if finished {
                        break;
                    }
                }
                tracing::debug!("swap actor stopped");
            }
            .instrument(tracing::info_span!("actor", swap_id = %swap_id)),
        );
        self.tasks.push(task);

        sender
    }
}
