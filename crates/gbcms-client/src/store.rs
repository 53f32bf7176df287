//! Client-side source of truth for every resource kind.
//!
//! Each kind runs the same `idle → loading → succeeded | failed` machine.
//! Transitions go through `begin`, `succeed`/`succeed_with` and `fail`; the
//! terminal ones only apply when they carry the ticket handed out by the
//! `begin` that is currently in flight, so a kind never sees two terminal
//! writes for one request and completions from before a `reset` are dropped.
//! A request whose caller goes away calls `abandon`, which puts the kind back
//! where it was before `begin`.

use gbcms_core::{
    GraphData, LogEntry, Message, Project, ResourceError, ResourceKind, ResourceState,
    ResourceStatus, UserProfile,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Default)]
pub struct StoreState {
    projects: ResourceState<Vec<Project>>,
    logs: ResourceState<Vec<LogEntry>>,
    user: ResourceState<UserProfile>,
    graph: ResourceState<GraphData>,
    chat: ResourceState<Vec<Message>>,
    in_flight: HashMap<ResourceKind, InFlight>,
    next_ticket: u64,
}

/// What a running request displaced, restored if the request is abandoned.
#[derive(Debug)]
struct InFlight {
    ticket: u64,
    previous_status: ResourceStatus,
    previous_error: Option<ResourceError>,
}

pub trait Resource: Send + 'static {
    type Data: Clone + Send + 'static;
    const KIND: ResourceKind;

    fn slot(state: &StoreState) -> &ResourceState<Self::Data>;
    fn slot_mut(state: &mut StoreState) -> &mut ResourceState<Self::Data>;
}

macro_rules! resource {
    ($name:ident, $field:ident, $data:ty, $kind:expr) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl Resource for $name {
            type Data = $data;
            const KIND: ResourceKind = $kind;

            fn slot(state: &StoreState) -> &ResourceState<Self::Data> {
                &state.$field
            }

            fn slot_mut(state: &mut StoreState) -> &mut ResourceState<Self::Data> {
                &mut state.$field
            }
        }
    };
}

resource!(Projects, projects, Vec<Project>, ResourceKind::Projects);
resource!(Logs, logs, Vec<LogEntry>, ResourceKind::Logs);
resource!(User, user, UserProfile, ResourceKind::User);
resource!(Graph, graph, GraphData, ResourceKind::Graph);
resource!(Chat, chat, Vec<Message>, ResourceKind::Chat);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    kind: ResourceKind,
    id: u64,
}

impl Ticket {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    Started(Ticket),
    /// A request for this kind is already loading; nothing changed.
    InFlight,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<StoreState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(StoreState::default())),
            revision: Arc::new(revision),
        }
    }

    pub fn begin<R: Resource>(&self) -> Begin {
        self.update(|state| {
            if state.in_flight.contains_key(&R::KIND) {
                return (Begin::InFlight, false);
            }
            state.next_ticket += 1;
            let ticket = Ticket {
                kind: R::KIND,
                id: state.next_ticket,
            };
            let slot = R::slot_mut(state);
            let displaced = InFlight {
                ticket: ticket.id,
                previous_status: slot.status,
                previous_error: slot.error.clone(),
            };
            slot.mark_loading();
            state.in_flight.insert(R::KIND, displaced);
            (Begin::Started(ticket), true)
        })
    }

    pub fn succeed<R: Resource>(&self, ticket: Ticket, data: R::Data) -> bool {
        self.settle::<R>(ticket, |slot| slot.mark_succeeded(data))
    }

    /// Like `succeed`, computing the new data from the previous snapshot.
    pub fn succeed_with<R, F>(&self, ticket: Ticket, merge: F) -> bool
    where
        R: Resource,
        F: FnOnce(Option<R::Data>) -> R::Data,
    {
        self.settle::<R>(ticket, |slot| {
            let previous = slot.data.take();
            slot.mark_succeeded(merge(previous));
        })
    }

    pub fn fail<R: Resource>(&self, ticket: Ticket, error: ResourceError) -> bool {
        self.settle::<R>(ticket, |slot| slot.mark_failed(error))
    }

    /// Releases the in-flight slot without a result. Status and error go back
    /// to what they were before `begin`; data was never touched.
    pub fn abandon<R: Resource>(&self, ticket: Ticket) -> bool {
        let abandoned = self.update(|state| {
            if !holds_slot::<R>(state, ticket) {
                return (false, false);
            }
            let Some(displaced) = state.in_flight.remove(&R::KIND) else {
                return (false, false);
            };
            let slot = R::slot_mut(state);
            slot.status = displaced.previous_status;
            slot.error = displaced.previous_error;
            (true, true)
        });
        if abandoned {
            debug!(kind = %R::KIND, ticket = ticket.id, "request_abandoned");
        }
        abandoned
    }

    pub fn read<R: Resource>(&self) -> ResourceState<R::Data> {
        R::slot(&self.lock()).clone()
    }

    pub fn status(&self, kind: ResourceKind) -> ResourceStatus {
        let state = self.lock();
        match kind {
            ResourceKind::Projects => state.projects.status,
            ResourceKind::Logs => state.logs.status,
            ResourceKind::User => state.user.status,
            ResourceKind::Graph => state.graph.status,
            ResourceKind::Chat => state.chat.status,
        }
    }

    pub fn error(&self, kind: ResourceKind) -> Option<ResourceError> {
        let state = self.lock();
        match kind {
            ResourceKind::Projects => state.projects.error.clone(),
            ResourceKind::Logs => state.logs.error.clone(),
            ResourceKind::User => state.user.error.clone(),
            ResourceKind::Graph => state.graph.error.clone(),
            ResourceKind::Chat => state.chat.error.clone(),
        }
    }

    pub fn is_in_flight(&self, kind: ResourceKind) -> bool {
        self.lock().in_flight.contains_key(&kind)
    }

    /// Revision counter that moves on every applied change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub async fn wait_settled(&self, kind: ResourceKind) {
        let mut changes = self.revision.subscribe();
        while self.is_in_flight(kind) {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Appends to the chat sequence. Returns `false` when a message with the
    /// same id is already there.
    pub fn append_message(&self, message: Message) -> bool {
        self.update(|state| {
            let messages = state.chat.data.get_or_insert_with(Vec::new);
            if messages.iter().any(|existing| existing.id == message.id) {
                return (false, false);
            }
            messages.push(message);
            (true, true)
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().chat.data.clone().unwrap_or_default()
    }

    pub(crate) fn chat_connecting(&self) {
        self.update(|state| {
            state.chat.mark_loading();
            ((), true)
        });
    }

    pub(crate) fn chat_connected(&self) {
        self.update(|state| {
            let messages = state.chat.data.take().unwrap_or_default();
            state.chat.mark_succeeded(messages);
            ((), true)
        });
    }

    pub(crate) fn chat_failed(&self, error: ResourceError) {
        self.update(|state| {
            state.chat.mark_failed(error);
            ((), true)
        });
    }

    pub(crate) fn chat_closed(&self) {
        self.update(|state| {
            state.chat.status = ResourceStatus::Idle;
            state.chat.error = None;
            ((), true)
        });
    }

    /// Back to the initial state: every kind idle, no data, no request in
    /// flight. Tickets issued before the reset no longer apply.
    pub fn reset(&self) {
        self.update(|state| {
            let next_ticket = state.next_ticket;
            *state = StoreState {
                next_ticket,
                ..StoreState::default()
            };
            ((), true)
        });
        debug!("store_reset");
    }

    fn settle<R: Resource>(
        &self,
        ticket: Ticket,
        apply: impl FnOnce(&mut ResourceState<R::Data>),
    ) -> bool {
        let applied = self.update(|state| {
            if !holds_slot::<R>(state, ticket) {
                return (false, false);
            }
            state.in_flight.remove(&R::KIND);
            apply(R::slot_mut(state));
            (true, true)
        });
        if !applied {
            debug!(kind = %R::KIND, ticket = ticket.id, "stale_completion_ignored");
        }
        applied
    }

    fn update<T>(&self, f: impl FnOnce(&mut StoreState) -> (T, bool)) -> T {
        let (value, changed) = {
            let mut state = self.lock();
            f(&mut state)
        };
        if changed {
            self.revision.send_modify(|rev| *rev += 1);
        }
        value
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn holds_slot<R: Resource>(state: &StoreState, ticket: Ticket) -> bool {
    ticket.kind == R::KIND
        && state
            .in_flight
            .get(&R::KIND)
            .is_some_and(|running| running.ticket == ticket.id)
}
