//! Named partition of an endpoint's connections with its queue of pending operations.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::connection::{Connection, Eligibility, Lease};
use crate::operation::Operation;
use crate::{EndpointConfig, Error};

#[derive(Debug)]
pub(crate) struct ConnectionGroup {
    name: String,
    connections: Vec<Connection>,
    queue: VecDeque<Operation>,
}

impl ConnectionGroup {
    pub fn new(name: &str) -> ConnectionGroup {
        ConnectionGroup {
            name: name.to_string(),
            connections: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue(&mut self, op: Operation) {
        trace!("Group '{}' enqueue operation {}", self.name, op.id);
        self.queue.push_back(op);
    }

    /// Queue ahead of everything else. Used for auth retries.
    pub fn enqueue_front(&mut self, op: Operation) {
        trace!("Group '{}' enqueue operation {} first", self.name, op.id);
        self.queue.push_front(op);
    }

    /// Drop aborted operations from the head of the queue.
    fn skip_canceled(&mut self) {
        while let Some(op) = self.queue.front() {
            if !op.is_canceled() {
                break;
            }
            if let Some(mut op) = self.queue.pop_front() {
                debug!("Group '{}' skips aborted operation {}", self.name, op.id);
                op.abort(Error::RequestCanceled);
            }
        }
    }

    /// Pair the next queued operation with a connection. The operation stays queued if
    /// no connection can be had.
    pub fn dispatch_next(
        &mut self,
        config: &EndpointConfig,
        next_id: &mut u64,
    ) -> Option<(Lease, Operation)> {
        self.skip_canceled();
        let op = self.queue.front()?;
        let lease = find_or_create(&mut self.connections, &self.name, op, config, next_id)?;
        let op = self.queue.pop_front()?;
        Some((lease, op))
    }

    pub fn connection_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.id() == id)
    }

    /// Remove a connection whose operation gave it up, without canceling that
    /// operation.
    pub fn retire_connection(&mut self, id: u64) -> bool {
        let Some(idx) = self.connections.iter().position(|c| c.id() == id) else {
            return false;
        };
        let mut c = self.connections.remove(idx);
        c.retire();
        true
    }

    pub fn remove_closed(&mut self) {
        self.connections.retain(|c| !c.is_closed());
    }

    /// Close connections idle for `max_idle` or longer.
    pub fn expire_idle(&mut self, now: Instant, max_idle: Duration) {
        for c in &mut self.connections {
            let expired = c
                .idle_since()
                .map(|since| now.saturating_duration_since(since) >= max_idle)
                .unwrap_or(false);
            if expired {
                debug!("Connection {} idle timeout", c.id());
                c.close();
            }
        }
        self.remove_closed();
    }

    /// When the next idle connection expires.
    pub fn next_idle_deadline(&self, max_idle: Duration) -> Option<Instant> {
        self.connections
            .iter()
            .filter_map(|c| c.idle_since())
            .map(|since| since + max_idle)
            .min()
    }

    /// Abort all queued operations and close all connections.
    pub fn close(&mut self) {
        debug!(
            "Close group '{}': {} queued, {} connections",
            self.name,
            self.queue.len(),
            self.connections.len()
        );
        for mut op in self.queue.drain(..) {
            op.abort(Error::RequestCanceled);
        }
        for c in &mut self.connections {
            c.close();
        }
        self.connections.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty() && self.queue.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// `Some` only when every connection is idle: the last time one went idle.
    pub fn idle_since(&self) -> Option<Instant> {
        let mut latest = None;
        for c in &self.connections {
            let since = c.idle_since()?;
            latest = latest.max(Some(since));
        }
        latest
    }
}

/// Reuse the longest idle connection that can serve `op`, else create one if the
/// limit allows.
fn find_or_create(
    connections: &mut Vec<Connection>,
    group: &str,
    op: &Operation,
    config: &EndpointConfig,
    next_id: &mut u64,
) -> Option<Lease> {
    let mut ideal: Option<(usize, Instant)> = None;
    let mut mismatch: Option<usize> = None;

    for (idx, c) in connections.iter().enumerate() {
        match c.can_serve(op) {
            Eligibility::Yes => {
                let Some(since) = c.idle_since() else {
                    continue;
                };
                if ideal.map(|(_, s)| since < s).unwrap_or(true) {
                    ideal = Some((idx, since));
                }
            }
            Eligibility::Mismatch => {
                mismatch.get_or_insert(idx);
            }
            Eligibility::Busy => {}
        }
    }

    if let Some((idx, _)) = ideal {
        if let Some(lease) = connections[idx].start(op, true, config) {
            trace!("Reuse connection {} for operation {}", lease.conn_id, op.id);
            return Some(lease);
        }
    }

    if let Some(idx) = mismatch {
        // start() refuses it and closes it.
        let _ = connections[idx].start(op, true, config);
        connections.retain(|c| !c.is_closed());
    }

    let under_limit = connections.len() < config.connection_limit;

    if !(under_limit || connections.is_empty() || op.force_new_connection) {
        trace!(
            "Group '{}' at limit ({}), operation {} waits",
            group,
            config.connection_limit,
            op.id
        );
        return None;
    }

    let id = *next_id;
    *next_id += 1;

    info!("New connection {} in group '{}'", id, group);
    let mut c = Connection::new(id, group);
    let lease = c.start(op, false, config);
    connections.push(c);
    lease
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::test_operation;
    use crate::transport::Stream;
    use http::Method;

    fn op() -> (Operation, crate::Call) {
        test_operation(Method::GET, "http://q.test/", Default::default())
    }

    fn idle_stream() -> Stream {
        let (mock, _) = crate::test::MockTransport::new(b"");
        Stream::new(Box::new(mock))
    }

    fn config(limit: usize) -> EndpointConfig {
        EndpointConfig {
            connection_limit: limit,
            ..Default::default()
        }
    }

    #[test]
    fn creates_up_to_limit_then_queues() {
        let mut g = ConnectionGroup::new("");
        let mut next = 1;
        let mut calls = vec![];
        for _ in 0..3 {
            let (o, c) = op();
            g.enqueue(o);
            calls.push(c);
        }

        assert!(g.dispatch_next(&config(2), &mut next).is_some());
        assert!(g.dispatch_next(&config(2), &mut next).is_some());
        assert!(g.dispatch_next(&config(2), &mut next).is_none());
        assert_eq!(g.connection_count(), 2);
        assert_eq!(g.queued(), 1);
    }

    #[test]
    fn reuses_longest_idle() {
        let mut g = ConnectionGroup::new("");
        let mut next = 1;
        let cfg = config(4);

        let (o1, _c1) = op();
        let (o2, _c2) = op();
        g.enqueue(o1);
        g.enqueue(o2);
        let (l1, _) = g.dispatch_next(&cfg, &mut next).unwrap();
        let (l2, _) = g.dispatch_next(&cfg, &mut next).unwrap();

        g.connection_mut(l2.conn_id)
            .unwrap()
            .release(Some(idle_stream()), None);
        std::thread::sleep(Duration::from_millis(5));
        g.connection_mut(l1.conn_id)
            .unwrap()
            .release(Some(idle_stream()), None);

        let (o3, _c3) = op();
        g.enqueue(o3);
        let (l3, _) = g.dispatch_next(&cfg, &mut next).unwrap();
        assert_eq!(l3.conn_id, l2.conn_id);
        assert!(l3.reused);
        assert!(l3.stream.is_some());
        assert_eq!(g.connection_count(), 2);
    }

    #[test]
    fn forced_creation_past_limit() {
        let mut g = ConnectionGroup::new("");
        let mut next = 1;
        let cfg = config(1);

        let (o1, _c1) = op();
        g.enqueue(o1);
        g.dispatch_next(&cfg, &mut next).unwrap();

        let (mut o2, _c2) = op();
        o2.force_new_connection = true;
        g.enqueue_front(o2);
        assert!(g.dispatch_next(&cfg, &mut next).is_some());
        assert_eq!(g.connection_count(), 2);
    }

    #[test]
    fn aborted_operations_are_skipped() {
        let mut g = ConnectionGroup::new("named");
        let mut next = 1;
        let (o1, c1) = op();
        let (o2, _c2) = op();
        g.enqueue(o1);
        g.enqueue(o2);
        c1.abort();
        let (_, op) = g.dispatch_next(&config(1), &mut next).unwrap();
        assert!(!op.is_canceled());
        assert_eq!(g.queued(), 0);
        assert_eq!(g.connection_count(), 1);
    }

    #[tokio::test]
    async fn close_aborts_queue() {
        let mut g = ConnectionGroup::new("named");
        let (o1, mut c1) = op();
        g.enqueue(o1);
        g.close();
        assert!(g.is_empty());
        assert!(matches!(c1.response().await, Err(Error::RequestCanceled)));
    }

    #[test]
    fn idle_expiry() {
        let mut g = ConnectionGroup::new("");
        let mut next = 1;
        let (o1, _c1) = op();
        g.enqueue(o1);
        let (l1, _) = g.dispatch_next(&config(2), &mut next).unwrap();
        g.connection_mut(l1.conn_id)
            .unwrap()
            .release(Some(idle_stream()), None);

        let deadline = g.next_idle_deadline(Duration::from_secs(10)).unwrap();
        assert!(g.idle_since().is_some());

        g.expire_idle(deadline - Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(g.connection_count(), 1);
        g.expire_idle(deadline, Duration::from_secs(10));
        assert_eq!(g.connection_count(), 0);
    }
}
