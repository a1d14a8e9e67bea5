//! NotificationTracker: keeps one viewer's unread counts in sync with the message store.
//!
//! Each tracker is a single tokio task that owns its `UnreadState` and handles one event
//! at a time: commands from [`TrackerHandle`], completions of store calls it spawned, and
//! the live message feed. Store calls run as separate tasks, so feed events keep being
//! applied while a reconcile is in flight; the reconcile result then replaces the counters
//! wholesale (last writer wins).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, TrackerError};
use crate::store::{MessageRecord, MessageStore, Subscription};
use crate::unread::{CorrespondentId, Toast, UnreadState, UserId};

/// How long a toast stays up unless dismissed or replaced.
pub const DEFAULT_TOAST_TIMEOUT: Duration = Duration::from_millis(5000);

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub toast_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            toast_timeout: DEFAULT_TOAST_TIMEOUT,
        }
    }
}

enum Command {
    SetViewer(Option<UserId>),
    Reconcile(Option<oneshot::Sender<UnreadState>>),
    Incoming(MessageRecord),
    MarkRead(CorrespondentId),
    DismissToast,
    Shutdown,
}

/// Results of work the tracker spawned, fed back into its loop.
enum Completion {
    Reconciled {
        generation: u64,
        result: Result<Reconciled, StoreError>,
        reply: Option<oneshot::Sender<UnreadState>>,
    },
    MarkReadFailed {
        generation: u64,
        correspondent: CorrespondentId,
        error: StoreError,
    },
    ToastExpired(Uuid),
}

struct Reconciled {
    reported_total: u64,
    counts: Vec<(CorrespondentId, u64)>,
    display_names: HashMap<CorrespondentId, String>,
}

/// Cloneable control surface for one tracker. The tracker stops when
/// [`TrackerHandle::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct TrackerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<UnreadState>,
}

impl TrackerHandle {
    /// Re-supply the viewing user. `None` means unauthenticated.
    pub async fn set_viewer(&self, viewer: Option<UserId>) -> Result<(), TrackerError> {
        self.send(Command::SetViewer(viewer)).await
    }

    /// Run a full reconciliation and return the resulting state.
    /// On store failure the returned state is the unchanged previous one.
    pub async fn reconcile(&self) -> Result<UnreadState, TrackerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reconcile(Some(tx))).await?;
        rx.await.map_err(|_| TrackerError::Stopped)
    }

    /// Feed one message into the tracker as if it came from the live feed.
    pub async fn on_incoming_message(&self, message: MessageRecord) -> Result<(), TrackerError> {
        self.send(Command::Incoming(message)).await
    }

    pub async fn mark_read(&self, correspondent: CorrespondentId) -> Result<(), TrackerError> {
        self.send(Command::MarkRead(correspondent)).await
    }

    pub async fn dismiss_toast(&self) -> Result<(), TrackerError> {
        self.send(Command::DismissToast).await
    }

    /// Stop the tracker. Stopping an already stopped tracker is fine.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Latest published state.
    pub fn state(&self) -> UnreadState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<UnreadState> {
        self.state.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), TrackerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TrackerError::Stopped)
    }
}

pub struct NotificationTracker {
    store: Arc<dyn MessageStore>,
    config: TrackerConfig,
    viewer: Option<UserId>,
    /// Bumped on every viewer change; completions from an older generation are dropped.
    generation: u64,
    state: UnreadState,
    display_names: HashMap<CorrespondentId, String>,
    subscription: Option<Subscription>,
    toast_timer: Option<JoinHandle<()>>,
    state_tx: watch::Sender<UnreadState>,
    completions: mpsc::Sender<Completion>,
}

impl NotificationTracker {
    /// Spawn a tracker task for `viewer` and return its handle.
    pub fn spawn(
        store: Arc<dyn MessageStore>,
        config: TrackerConfig,
        viewer: Option<UserId>,
    ) -> TrackerHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completion_tx, completion_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(UnreadState::empty());

        let tracker = Self {
            store,
            config,
            viewer: None,
            generation: 0,
            state: UnreadState::empty(),
            display_names: HashMap::new(),
            subscription: None,
            toast_timer: None,
            state_tx,
            completions: completion_tx,
        };
        tokio::spawn(tracker.run(viewer, command_rx, completion_rx));

        TrackerHandle {
            commands: command_tx,
            state: state_rx,
        }
    }

    async fn run(
        mut self,
        initial_viewer: Option<UserId>,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::Receiver<Completion>,
    ) {
        if initial_viewer.is_some() {
            self.set_viewer(initial_viewer).await;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                message = next_message(&mut self.subscription) => match message {
                    Some(message) => self.on_incoming_message(message),
                    None => {
                        warn!("message feed closed");
                        self.subscription = None;
                    }
                },
            }
        }

        self.release();
        self.publish();
        debug!("notification tracker stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetViewer(viewer) => self.set_viewer(viewer).await,
            Command::Reconcile(reply) => self.start_reconcile(reply),
            Command::Incoming(message) => self.on_incoming_message(message),
            Command::MarkRead(correspondent) => self.mark_read(correspondent),
            Command::DismissToast => self.dismiss_toast(),
            Command::Shutdown => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Reconciled {
                generation,
                result,
                reply,
            } => {
                if generation == self.generation {
                    match result {
                        Ok(reconciled) => self.apply_reconciled(reconciled),
                        Err(error) => {
                            warn!(%error, "reconcile failed, keeping previous unread state")
                        }
                    }
                } else {
                    debug!("discarding reconcile started for a previous viewer");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(self.state.clone());
                }
            }
            Completion::MarkReadFailed {
                generation,
                correspondent,
                error,
            } => {
                if generation != self.generation {
                    return;
                }
                warn!(%correspondent, %error, "mark read failed, resyncing unread state");
                self.start_reconcile(None);
            }
            Completion::ToastExpired(toast_id) => {
                if self.state.expire_toast(toast_id) {
                    self.publish();
                }
            }
        }
    }

    async fn set_viewer(&mut self, viewer: Option<UserId>) {
        if viewer == self.viewer {
            if self.viewer.is_some() && self.subscription.is_none() {
                self.open_subscription().await;
            }
            self.start_reconcile(None);
            return;
        }

        self.release();
        self.viewer = viewer;
        self.publish();

        if let Some(viewer) = self.viewer.clone() {
            info!(%viewer, "tracking unread messages");
            self.open_subscription().await;
            self.start_reconcile(None);
        }
    }

    async fn open_subscription(&mut self) {
        let Some(viewer) = self.viewer.clone() else {
            return;
        };
        match self.store.subscribe_to_messages(&viewer).await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(error) => warn!(%viewer, %error, "failed to subscribe to messages"),
        }
    }

    fn start_reconcile(&mut self, reply: Option<oneshot::Sender<UnreadState>>) {
        let Some(viewer) = self.viewer.clone() else {
            self.state = UnreadState::empty();
            self.publish();
            if let Some(reply) = reply {
                let _ = reply.send(self.state.clone());
            }
            return;
        };

        let store = Arc::clone(&self.store);
        let completions = self.completions.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = fetch_unread(store.as_ref(), &viewer).await;
            let _ = completions
                .send(Completion::Reconciled {
                    generation,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn apply_reconciled(&mut self, reconciled: Reconciled) {
        let Reconciled {
            reported_total,
            counts,
            display_names,
        } = reconciled;
        self.display_names = display_names;
        self.state.replace_counts(counts);
        if reported_total != self.state.total_unread() {
            debug!(
                reported_total,
                from_friends = self.state.total_unread(),
                "unread total includes messages from non-friends"
            );
        }
        self.publish();
    }

    fn on_incoming_message(&mut self, message: MessageRecord) {
        match &self.viewer {
            Some(viewer) if *viewer == message.receiver_id => {}
            _ => return,
        }

        let name = self
            .display_names
            .get(&message.sender_id)
            .cloned()
            .unwrap_or_else(|| message.sender_id.to_string());
        let toast = Toast::new(name, message.content);
        let toast_id = toast.id;
        self.state.record_incoming(message.sender_id, toast);
        self.publish();
        self.schedule_toast_clear(toast_id);
    }

    /// Older timers keep running; `expire_toast` ignores them once a newer toast exists.
    fn schedule_toast_clear(&mut self, toast_id: Uuid) {
        let completions = self.completions.clone();
        let timeout = self.config.toast_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = completions.send(Completion::ToastExpired(toast_id)).await;
        });
        self.toast_timer = Some(timer);
    }

    fn mark_read(&mut self, correspondent: CorrespondentId) {
        let Some(viewer) = self.viewer.clone() else {
            return;
        };

        let cleared = self.state.clear_correspondent(&correspondent);
        self.publish();
        debug!(%correspondent, cleared, "marked messages read locally");

        let store = Arc::clone(&self.store);
        let completions = self.completions.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            if let Err(error) = store.mark_messages_as_read(&viewer, &correspondent).await {
                let _ = completions
                    .send(Completion::MarkReadFailed {
                        generation,
                        correspondent,
                        error,
                    })
                    .await;
            }
        });
    }

    fn dismiss_toast(&mut self) {
        if self.state.pending_toast().is_some() {
            self.state.dismiss_toast();
            self.publish();
        }
    }

    /// Drop everything tied to the current viewer.
    fn release(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(timer) = self.toast_timer.take() {
            timer.abort();
        }
        self.generation += 1;
        self.state = UnreadState::empty();
        self.display_names.clear();
    }

    fn publish(&self) {
        debug_assert!(self.state.is_consistent(), "unread counters out of sync");
        self.state_tx.send_replace(self.state.clone());
    }
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<MessageRecord> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Full re-derivation of per-friend unread counts from the store.
async fn fetch_unread(store: &dyn MessageStore, viewer: &UserId) -> Result<Reconciled, StoreError> {
    let reported_total = store.get_unread_message_count(viewer).await?;
    let friends = store.get_friends(viewer).await?;

    let mut counts = Vec::with_capacity(friends.len());
    let mut display_names = HashMap::with_capacity(friends.len());
    for friend in friends {
        let messages = store.get_messages(viewer, &friend.friend_id).await?;
        let unread = messages
            .iter()
            .filter(|m| &m.receiver_id == viewer && !m.read)
            .count() as u64;
        display_names.insert(friend.friend_id.clone(), friend.display_name);
        counts.push((friend.friend_id, unread));
    }

    Ok(Reconciled {
        reported_total,
        counts,
        display_names,
    })
}
