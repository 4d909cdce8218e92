//! Per-endpoint coordinator matching queued operations to connections.
//!
//! All structural state of an endpoint (groups, connections, queues) sits behind one
//! mutex that is never held across I/O. A single loop task per endpoint does the
//! dispatching. It is started by the first submission and exits once the endpoint has
//! neither connections nor queued work.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};

use crate::group::ConnectionGroup;
use crate::operation::{self, Finished, Operation, Outcome};
use crate::pool::Context;
use crate::{Endpoint, EndpointConfig, Error};

/// Connection pool of one [`Endpoint`].
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    endpoint: Endpoint,
    ctx: Arc<Context>,
    state: Mutex<State>,
    notify: Arc<Notify>,
}

struct State {
    config: EndpointConfig,
    default_group: ConnectionGroup,
    groups: HashMap<String, ConnectionGroup>,
    running: bool,
    finished_tx: Option<mpsc::UnboundedSender<Finished>>,
    next_conn_id: u64,
    shutdown: bool,
}

impl Scheduler {
    pub(crate) fn new(endpoint: Endpoint, ctx: Arc<Context>, config: EndpointConfig) -> Scheduler {
        let state = State {
            config,
            default_group: ConnectionGroup::new(""),
            groups: HashMap::new(),
            running: false,
            finished_tx: None,
            next_conn_id: 1,
            shutdown: false,
        };

        Scheduler {
            shared: Arc::new(Shared {
                endpoint,
                ctx,
                state: Mutex::new(state),
                notify: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        self.shared.notify.clone()
    }

    /// Queue `op` and wake the loop, starting it if needed.
    pub(crate) fn submit(&self, mut op: Operation) -> Result<(), Error> {
        let mut state = self.shared.lock();

        if state.shutdown {
            op.abort(Error::Shutdown);
            return Err(Error::Shutdown);
        }

        debug!(
            "Submit operation {} to {} group '{}'",
            op.id,
            self.shared.endpoint,
            op.group()
        );

        let name = op.group().to_string();
        state.group_mut(&name).enqueue(op);

        if !state.running {
            let (tx, rx) = mpsc::unbounded_channel();
            state.running = true;
            state.finished_tx = Some(tx);
            tokio::spawn(run_loop(self.shared.clone(), rx));
        }

        drop(state);
        self.shared.notify.notify_one();

        Ok(())
    }

    /// Abort the queued operations of a group and close its connections. Returns
    /// `false` if there is no such group.
    pub fn close_group(&self, name: &str) -> bool {
        let mut state = self.shared.lock();
        let found = if name.is_empty() {
            state.default_group.close();
            true
        } else {
            match state.groups.remove(name) {
                Some(mut g) => {
                    g.close();
                    true
                }
                None => false,
            }
        };
        drop(state);
        self.shared.notify.notify_one();
        found
    }

    pub fn set_connection_limit(&self, limit: usize) {
        self.shared.lock().config.connection_limit = limit;
        self.shared.notify.notify_one();
    }

    pub fn set_max_idle_time(&self, max_idle_time: Duration) {
        self.shared.lock().config.max_idle_time = max_idle_time;
        self.shared.notify.notify_one();
    }

    pub fn connection_limit(&self) -> usize {
        self.shared.lock().config.connection_limit
    }

    pub fn max_idle_time(&self) -> Duration {
        self.shared.lock().config.max_idle_time
    }

    /// Open connections across all groups.
    pub fn current_connections(&self) -> usize {
        let state = self.shared.lock();
        state.groups().map(|g| g.connection_count()).sum()
    }

    /// Since when every connection of the endpoint is idle. `None` while any
    /// connection is busy or there are none.
    pub fn idle_since(&self) -> Option<Instant> {
        let state = self.shared.lock();
        let mut latest = None;
        for g in state.groups() {
            if g.connection_count() == 0 {
                continue;
            }
            latest = latest.max(Some(g.idle_since()?));
        }
        latest
    }

    /// Close everything. Later submissions fail with [`Error::Shutdown`].
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        debug!("Shutdown {}", self.shared.endpoint);
        state.shutdown = true;
        state.default_group.close();
        for (_, mut g) in state.groups.drain() {
            g.close();
        }
        drop(state);
        self.shared.notify.notify_one();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("endpoint", &self.shared.endpoint)
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn group_mut(&mut self, name: &str) -> &mut ConnectionGroup {
        if name.is_empty() {
            return &mut self.default_group;
        }
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| ConnectionGroup::new(name))
    }

    fn existing_group_mut(&mut self, name: &str) -> Option<&mut ConnectionGroup> {
        if name.is_empty() {
            Some(&mut self.default_group)
        } else {
            self.groups.get_mut(name)
        }
    }

    /// Default group first.
    fn groups(&self) -> impl Iterator<Item = &ConnectionGroup> {
        std::iter::once(&self.default_group).chain(self.groups.values())
    }

    fn is_empty(&self) -> bool {
        self.groups().all(|g| g.is_empty())
    }

    /// Remove closed and idle-expired connections, reap empty named groups.
    fn sweep(&mut self, now: Instant) {
        let max_idle = self.config.max_idle_time;
        self.default_group.expire_idle(now, max_idle);
        for g in self.groups.values_mut() {
            g.expire_idle(now, max_idle);
        }
        self.groups.retain(|name, g| {
            let keep = !g.is_empty();
            if !keep {
                trace!("Drop empty group '{}'", name);
            }
            keep
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        let max_idle = self.config.max_idle_time;
        self.groups()
            .filter_map(|g| g.next_idle_deadline(max_idle))
            .min()
    }

    /// Start queued operations until no group makes progress.
    fn dispatch(&mut self, shared: &Shared) {
        let Some(tx) = self.finished_tx.clone() else {
            return;
        };

        let State {
            config,
            default_group,
            groups,
            next_conn_id,
            ..
        } = self;

        loop {
            let mut progress = false;

            for group in std::iter::once(&mut *default_group).chain(groups.values_mut()) {
                while let Some((lease, op)) = group.dispatch_next(config, next_conn_id) {
                    trace!(
                        "Dispatch operation {} to connection {} in '{}'",
                        op.id,
                        lease.conn_id,
                        group.name()
                    );
                    tokio::spawn(operation::run(
                        shared.ctx.clone(),
                        shared.endpoint.clone(),
                        lease,
                        op,
                        tx.clone(),
                    ));
                    progress = true;
                }
            }

            if !progress {
                break;
            }
        }
    }

    fn on_finished(&mut self, finished: Finished, shared: &Shared) {
        let Finished {
            conn_id,
            group,
            op_id,
            outcome,
        } = finished;

        let config = self.config.clone();
        let tx = self.finished_tx.clone();

        let Some(g) = self.existing_group_mut(&group) else {
            trace!("Operation {} finished in a closed group", op_id);
            return;
        };

        match outcome {
            Outcome::Failed => {
                g.retire_connection(conn_id);
            }
            Outcome::Done { stream, binding } => {
                if let Some(c) = g.connection_mut(conn_id) {
                    c.release(stream, binding);
                }
                g.remove_closed();
            }
            Outcome::Successor { mut op, stream } => {
                let lease = g.connection_mut(conn_id).and_then(|c| {
                    c.release(stream, None);
                    c.start(&op, true, &config)
                });

                match (lease, tx) {
                    (Some(lease), Some(tx)) => {
                        debug!("Operation {} continues on connection {}", op.id, conn_id);
                        tokio::spawn(operation::run(
                            shared.ctx.clone(),
                            shared.endpoint.clone(),
                            lease,
                            op,
                            tx,
                        ));
                    }
                    _ => {
                        debug!("Operation {} continues on a new connection", op.id);
                        g.retire_connection(conn_id);
                        op.force_new_connection = true;
                        g.enqueue_front(op);
                    }
                }
            }
        }
    }
}

async fn run_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Finished>) {
    debug!("Scheduler loop start: {}", shared.endpoint);

    loop {
        let deadline = {
            let mut state = shared.lock();
            state.sweep(Instant::now());
            state.dispatch(&shared);

            if state.is_empty() {
                state.running = false;
                state.finished_tx = None;
                break;
            }

            state.next_deadline()
        };

        let idle_timer = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shared.notify.notified() => {}
            Some(finished) = rx.recv() => {
                shared.lock().on_finished(finished, &shared);
            }
            _ = idle_timer => {
                trace!("Idle timer fired");
            }
        }
    }

    debug!("Scheduler loop exit: {}", shared.endpoint);
}
