//! A single pooled connection and how it gets established.

use std::time::{Duration, Instant};

use http::{Method, Uri};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthContext};
use crate::operation::Operation;
use crate::pool::Context;
use crate::transport::{connect_tcp, with_timeout, Rewind, Stream};
use crate::tunnel::{Tunnel, TunnelOutcome};
use crate::{CallOptions, Credentials, Endpoint, EndpointConfig, Error, Timeout};

/// Credentials a connection was authenticated with by a connection-based scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NtlmBinding {
    pub credentials: Option<Credentials>,
    pub unsafe_sharing: bool,
}

#[derive(Debug)]
pub(crate) enum ConnState {
    Idle { since: Instant },
    Busy { op_id: u64, cancel: CancellationToken },
    Closed,
}

/// Whether a connection can serve an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eligibility {
    Yes,
    /// Busy or closed.
    Busy,
    /// Idle, but authenticated for someone else.
    Mismatch,
}

/// What an operation gets to run on. A lease without a stream must establish the
/// connection first.
#[derive(Debug)]
pub(crate) struct Lease {
    pub conn_id: u64,
    pub group: String,
    pub stream: Option<Stream>,
    pub reused: bool,
    /// This is the last operation the connection may serve.
    pub last: bool,
    pub connect_timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Connection {
    id: u64,
    group: String,
    state: ConnState,
    stream: Option<Stream>,
    ntlm: Option<NtlmBinding>,
    served: usize,
}

impl Connection {
    pub fn new(id: u64, group: &str) -> Connection {
        Connection {
            id,
            group: group.to_string(),
            state: ConnState::Idle {
                since: Instant::now(),
            },
            stream: None,
            ntlm: None,
            served: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, ConnState::Busy { .. })
    }

    pub fn idle_since(&self) -> Option<Instant> {
        match self.state {
            ConnState::Idle { since } => Some(since),
            _ => None,
        }
    }

    /// The one place reuse eligibility is decided.
    pub fn can_serve(&self, op: &Operation) -> Eligibility {
        if !matches!(self.state, ConnState::Idle { .. }) {
            return Eligibility::Busy;
        }

        let Some(binding) = &self.ntlm else {
            return Eligibility::Yes;
        };

        let same_credentials = binding.credentials == op.options.credentials;
        let same_sharing =
            binding.unsafe_sharing == op.options.unsafe_authenticated_connection_sharing;

        if same_credentials && same_sharing {
            Eligibility::Yes
        } else {
            Eligibility::Mismatch
        }
    }

    /// Claim the connection for `op`.
    ///
    /// A reused connection authenticated for other credentials is closed instead.
    pub fn start(&mut self, op: &Operation, reused: bool, config: &EndpointConfig) -> Option<Lease> {
        match self.can_serve(op) {
            Eligibility::Yes => {}
            Eligibility::Busy => return None,
            Eligibility::Mismatch => {
                if reused {
                    warn!(
                        "Connection {} is authenticated for other credentials, closing",
                        self.id
                    );
                    self.close();
                }
                return None;
            }
        }

        self.served += 1;
        self.state = ConnState::Busy {
            op_id: op.id,
            cancel: op.cancel.clone(),
        };

        debug!(
            "Connection {} busy with operation {} (reused: {}, served: {})",
            self.id, op.id, reused, self.served
        );

        Some(Lease {
            conn_id: self.id,
            group: self.group.clone(),
            stream: self.stream.take(),
            reused,
            last: self.served >= config.max_requests_per_connection,
            connect_timeout: config.connect_timeout,
        })
    }

    /// Busy → Idle with the returned stream, or Busy → Closed without one.
    pub fn release(&mut self, stream: Option<Stream>, binding: Option<NtlmBinding>) {
        if !self.is_busy() {
            return;
        }

        if binding.is_some() {
            self.ntlm = binding;
        }

        match stream {
            Some(s) => {
                debug!("Connection {} idle", self.id);
                self.stream = Some(s);
                self.state = ConnState::Idle {
                    since: Instant::now(),
                };
            }
            None => self.retire(),
        }
    }

    /// Busy → Closed at the request of the operation itself. Unlike `close` the
    /// operation's token is left alone: its successor and its response body share it.
    pub fn retire(&mut self) {
        if !self.is_closed() {
            info!("Connection {} closed", self.id);
        }
        self.state = ConnState::Closed;
        self.stream = None;
        self.ntlm = None;
    }

    /// Close the connection, canceling a running operation.
    pub fn close(&mut self) {
        if let ConnState::Busy { op_id, cancel } = &self.state {
            debug!("Connection {} closing, cancel operation {}", self.id, op_id);
            cancel.cancel();
        }
        self.retire();
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// ESTABLISH

/// Connect to `endpoint`: TCP, then a `CONNECT` tunnel if proxied `https`, then TLS.
pub(crate) async fn establish(
    ctx: &Context,
    endpoint: &Endpoint,
    connect_timeout: Duration,
    options: &CallOptions,
) -> Result<Stream, Error> {
    if endpoint.is_secure() && ctx.tls.is_none() {
        return Err(Error::NoTlsConnector);
    }

    let (host, port) = endpoint.connect_target();
    let tcp = connect_tcp(&*ctx.resolver, host, port, connect_timeout).await?;
    info!("Connection open: {}", endpoint);

    let mut stream = Stream::new(Box::new(tcp));

    if endpoint.needs_tunnel() {
        stream = open_tunnel(ctx, endpoint, connect_timeout, options, stream).await?;
    }

    if let Some(tls) = ctx.tls.as_ref().filter(|_| endpoint.is_secure()) {
        let (mut io, leftover) = stream.into_inner();
        if !leftover.is_empty() {
            debug!("Replay {} bytes received behind the tunnel reply", leftover.len());
            io = Box::new(Rewind::new(leftover.freeze(), io));
        }
        let io = with_timeout(Some(connect_timeout), Timeout::Connect, async move {
            Ok(tls.connect(endpoint.host(), io).await?)
        })
        .await?;
        debug!("TLS established with {}", endpoint.host());
        stream = Stream::new(io);
    }

    Ok(stream)
}

async fn open_tunnel(
    ctx: &Context,
    endpoint: &Endpoint,
    connect_timeout: Duration,
    options: &CallOptions,
    mut stream: Stream,
) -> Result<Stream, Error> {
    let Some(proxy) = endpoint.proxy() else {
        return Ok(stream);
    };

    let target: Uri = endpoint
        .authority()
        .parse()
        .map_err(|_| Error::BadUri(endpoint.authority()))?;

    let read_timeout = options.read_timeout.or(Some(connect_timeout));
    let mut tunnel = Tunnel::new(endpoint.authority(), read_timeout, options.write_timeout);

    let mut authorization: Option<String> = None;
    let mut connection_based = false;

    loop {
        let outcome = tunnel
            .initialize(&mut stream, authorization.as_deref(), connection_based)
            .await?;

        let mut result = match outcome {
            TunnelOutcome::Established(r) => {
                debug!("Tunnel to {} established", endpoint.authority());
                stream.set_leftover(r.leftover);
                return Ok(stream);
            }
            TunnelOutcome::RetryWithChallenge(r) => r,
        };

        let status = result.status;
        let bound = if connection_based { 2 } else { 1 };
        if tunnel.attempts() > bound {
            debug!("Proxy still demands authentication after {} attempts", tunnel.attempts());
            return Err(Error::Authentication(status));
        }

        let credentials = proxy
            .credentials
            .as_ref()
            .ok_or(Error::Authentication(status))?;

        let auth_ctx = AuthContext {
            method: &Method::CONNECT,
            uri: &target,
            proxy: true,
        };

        let answer = auth::answer(&ctx.authenticators, &result.challenges, &auth_ctx, credentials)
            .ok_or(Error::Authentication(status))?;

        authorization = Some(answer.value);
        connection_based = answer.connection_based;

        if !tunnel.drain_body(&mut stream, &mut result).await? {
            if connection_based {
                // The challenge belongs to the socket that got it.
                return Err(Error::Authentication(status));
            }
            debug!("Proxy closes after {}, reconnecting", status);
            let (host, port) = endpoint.connect_target();
            let tcp = connect_tcp(&*ctx.resolver, host, port, connect_timeout).await?;
            stream = Stream::new(Box::new(tcp));
        }
    }
}
