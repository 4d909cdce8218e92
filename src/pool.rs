use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use http::{Request, Uri};

use crate::auth::{Authenticator, BasicAuthenticator};
use crate::operation::{Call, Operation};
use crate::request::Body;
use crate::scheduler::Scheduler;
use crate::transport::{GaiResolver, Resolver, TlsConnect};
use crate::{CallOptions, Endpoint, EndpointConfig, Error, Proxy};

/// Collaborators shared by every endpoint of a pool.
#[derive(Debug)]
pub(crate) struct Context {
    pub resolver: Arc<dyn Resolver>,
    pub tls: Option<Arc<dyn TlsConnect>>,
    pub authenticators: Vec<Arc<dyn Authenticator>>,
}

/// Builder for a [`Pool`].
pub struct PoolBuilder {
    resolver: Arc<dyn Resolver>,
    tls: Option<Arc<dyn TlsConnect>>,
    authenticators: Vec<Arc<dyn Authenticator>>,
    config: EndpointConfig,
}

impl PoolBuilder {
    pub fn resolver(mut self, resolver: impl Resolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn tls_connector(mut self, tls: impl TlsConnect) -> Self {
        self.tls = Some(Arc::new(tls));
        self
    }

    /// Add an authenticator. Earlier ones are tried first for the same scheme.
    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticators.push(Arc::new(authenticator));
        self
    }

    /// Configuration for every endpoint created by the pool.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Pool {
        Pool {
            ctx: Arc::new(Context {
                resolver: self.resolver,
                tls: self.tls,
                authenticators: self.authenticators,
            }),
            config: self.config,
            schedulers: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(1),
        }
    }
}

/// Registry of per-endpoint connection pools.
///
/// Requests must be submitted from within a tokio runtime.
///
/// ```no_run
/// # async fn example() -> Result<(), webconn::Error> {
/// use webconn::{Pool, CallOptions};
/// use webconn::http::Request;
///
/// let pool = Pool::new();
/// let req = Request::get("http://q.test/").body(().into()).unwrap();
///
/// let mut call = pool.submit(req, CallOptions::default())?;
/// let mut response = call.response().await?;
/// let text = response.text().await?;
/// call.finished().await?;
/// # Ok(()) }
/// ```
pub struct Pool {
    ctx: Arc<Context>,
    config: EndpointConfig,
    schedulers: Mutex<HashMap<Endpoint, Scheduler>>,
    next_op: AtomicU64,
}

impl Pool {
    /// Pool with the system resolver, no TLS and `Basic` authentication.
    pub fn new() -> Pool {
        Pool::builder().build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            resolver: Arc::new(GaiResolver),
            tls: None,
            authenticators: vec![Arc::new(BasicAuthenticator)],
            config: EndpointConfig::default(),
        }
    }

    /// Submit a request. The returned [`Call`] resolves as the request progresses.
    pub fn submit(&self, request: Request<Body>, options: CallOptions) -> Result<Call, Error> {
        let endpoint = Endpoint::from_uri(request.uri(), options.proxy.as_ref())?;
        let scheduler = self.endpoint(endpoint);

        let id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let (parts, body) = request.into_parts();
        let (op, call) = Operation::new(id, parts, body, options, scheduler.wake_handle());

        scheduler.submit(op)?;

        Ok(call)
    }

    /// The pool of the endpoint serving `uri` through `proxy`.
    pub fn scheduler(&self, uri: &Uri, proxy: Option<&Proxy>) -> Result<Scheduler, Error> {
        let endpoint = Endpoint::from_uri(uri, proxy)?;
        Ok(self.endpoint(endpoint))
    }

    fn endpoint(&self, endpoint: Endpoint) -> Scheduler {
        let mut schedulers = self.schedulers.lock().unwrap_or_else(PoisonError::into_inner);
        schedulers
            .entry(endpoint)
            .or_insert_with_key(|e| {
                debug!("New endpoint: {}", e);
                Scheduler::new(e.clone(), self.ctx.clone(), self.config.clone())
            })
            .clone()
    }

    /// Close the named connection group on every endpoint. Returns `true` if any
    /// endpoint had it.
    pub fn close_connection_group(&self, name: &str) -> bool {
        let schedulers = self.schedulers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found = false;
        for s in schedulers.values() {
            found |= s.close_group(name);
        }
        found
    }

    /// Close every endpoint and forget them.
    pub fn shutdown(&self) {
        let mut schedulers = self.schedulers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, s) in schedulers.drain() {
            s.shutdown();
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("ctx", &self.ctx)
            .field("config", &self.config)
            .finish()
    }
}
