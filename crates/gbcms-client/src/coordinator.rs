use crate::api::Api;
use crate::store::{Begin, Graph, Logs, Projects, Resource, Store, Ticket, User};
use gbcms_core::validation::validate_new_project;
use gbcms_core::{
    ClientError, GraphData, LogEntry, NewProject, Project, ProjectArchive, ResourceState,
    SettingsUpdate, UserProfile,
};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs server requests and maps each outcome onto the store.
///
/// Reads join a request that is already loading for the same kind instead
/// of issuing another. Writes wait for the kind to settle, then take the
/// in-flight slot themselves, so they are applied one after another. Request
/// failures end up in the store as a `failed` state; only local validation
/// is returned as an `Err`. A call dropped before its request settles, by a
/// timeout or `select!` around it, releases the kind again.
#[derive(Clone)]
pub struct FetchCoordinator {
    api: Arc<dyn Api>,
    store: Store,
    request_timeout: Duration,
}

/// Result of a write that produces a record: the record the server returned
/// and the settled state of the kind afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome<T, V> {
    pub record: Option<V>,
    pub state: ResourceState<T>,
}

/// Holds the in-flight slot for one request. Dropping it before the request
/// settles hands the slot back through `Store::abandon`.
struct Pending<R: Resource> {
    store: Store,
    ticket: Option<Ticket>,
    _kind: PhantomData<fn() -> R>,
}

impl<R: Resource> Pending<R> {
    fn new(store: &Store, ticket: Ticket) -> Self {
        Self {
            store: store.clone(),
            ticket: Some(ticket),
            _kind: PhantomData,
        }
    }

    fn settle(mut self, result: Result<R::Data, ClientError>) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        match result {
            Ok(data) => {
                self.store.succeed::<R>(ticket, data);
            }
            Err(err) => {
                warn!(kind = %R::KIND, "request_failed: {err}");
                self.store.fail::<R>(ticket, err.to_resource_error());
            }
        }
    }

    fn merge(mut self, merge: impl FnOnce(Option<R::Data>) -> R::Data) {
        if let Some(ticket) = self.ticket.take() {
            self.store.succeed_with::<R, _>(ticket, merge);
        }
    }
}

impl<R: Resource> Drop for Pending<R> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.store.abandon::<R>(ticket);
        }
    }
}

impl FetchCoordinator {
    pub fn new(api: Arc<dyn Api>, store: Store, request_timeout: Duration) -> Self {
        Self {
            api,
            store,
            request_timeout,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn fetch_projects(&self) -> ResourceState<Vec<Project>> {
        self.fetch::<Projects, _>(move || self.api.list_projects()).await
    }

    pub async fn fetch_logs(&self) -> ResourceState<Vec<LogEntry>> {
        self.fetch::<Logs, _>(move || self.api.fetch_logs()).await
    }

    pub async fn fetch_user(&self) -> ResourceState<UserProfile> {
        self.fetch::<User, _>(move || self.api.fetch_user()).await
    }

    pub async fn fetch_graph(&self) -> ResourceState<GraphData> {
        self.fetch::<Graph, _>(move || async move {
            let graph = self.api.fetch_graph().await?;
            graph.validate()?;
            Ok(graph)
        })
        .await
    }

    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
    ) -> Result<WriteOutcome<Vec<Project>, Project>, ClientError> {
        let project = NewProject {
            name: name.trim().to_string(),
            description: description.trim().to_string(),
        };
        validate_new_project(&project)?;
        info!(name = %project.name, "project_create");
        Ok(self
            .mutate::<Projects, _, _>(move || self.api.create_project(project), upsert_project)
            .await)
    }

    pub async fn import_project(
        &self,
        archive: ProjectArchive,
    ) -> Result<WriteOutcome<Vec<Project>, Project>, ClientError> {
        archive.validate()?;
        info!(file = %archive.file_name, bytes = archive.bytes.len(), "project_import");
        Ok(self
            .mutate::<Projects, _, _>(move || self.api.import_project(archive), upsert_project)
            .await)
    }

    pub async fn update_user_settings(
        &self,
        update: SettingsUpdate,
    ) -> Result<ResourceState<UserProfile>, ClientError> {
        update.validate()?;
        let request = move || self.api.update_user_settings(update);
        let outcome = self
            .mutate::<User, _, _>(request, |_, profile| profile)
            .await;
        Ok(outcome.state)
    }

    async fn fetch<R, Fut>(&self, request: impl FnOnce() -> Fut) -> ResourceState<R::Data>
    where
        R: Resource,
        Fut: Future<Output = Result<R::Data, ClientError>>,
    {
        let pending = match self.store.begin::<R>() {
            Begin::Started(ticket) => Pending::<R>::new(&self.store, ticket),
            Begin::InFlight => {
                debug!(kind = %R::KIND, "fetch_coalesced");
                self.store.wait_settled(R::KIND).await;
                return self.store.read::<R>();
            }
        };
        pending.settle(self.with_timeout(request()).await);
        self.store.read::<R>()
    }

    async fn mutate<R, V, Fut>(
        &self,
        request: impl FnOnce() -> Fut,
        merge: impl FnOnce(Option<R::Data>, V) -> R::Data,
    ) -> WriteOutcome<R::Data, V>
    where
        R: Resource,
        V: Clone,
        Fut: Future<Output = Result<V, ClientError>>,
    {
        let pending = loop {
            match self.store.begin::<R>() {
                Begin::Started(ticket) => break Pending::<R>::new(&self.store, ticket),
                Begin::InFlight => self.store.wait_settled(R::KIND).await,
            }
        };
        let record = match self.with_timeout(request()).await {
            Ok(value) => {
                let record = value.clone();
                pending.merge(|previous| merge(previous, value));
                Some(record)
            }
            Err(err) => {
                pending.settle(Err(err));
                None
            }
        };
        WriteOutcome {
            record,
            state: self.store.read::<R>(),
        }
    }

    async fn with_timeout<T>(
        &self,
        request: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(format!(
                "request exceeded {}s",
                self.request_timeout.as_secs()
            ))),
        }
    }
}

fn upsert_project(previous: Option<Vec<Project>>, project: Project) -> Vec<Project> {
    let mut projects = previous.unwrap_or_default();
    match projects.iter_mut().find(|existing| existing.id == project.id) {
        Some(existing) => *existing = project,
        None => projects.push(project),
    }
    projects
}
