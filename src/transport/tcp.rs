use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, error, instrument, trace, warn};

use super::{Handler, Transport, TransportError};
use crate::error::ProtocolError;
use crate::protocol::{Request, Response};

/// Longest envelope line a [`TcpServer`] reads, newline excluded.
pub const MAX_ENVELOPE_BYTES: u64 = 1 << 20;

/// One JSON envelope per line, one connection per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }
}

fn classify(endpoint: &str, timeout: Duration, e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => TransportError::Refused {
            endpoint: endpoint.to_string(),
        },
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout {
            endpoint: endpoint.to_string(),
            after: timeout,
        },
        _ => TransportError::Reset {
            endpoint: endpoint.to_string(),
            detail: e.to_string(),
        },
    }
}

impl Transport for TcpTransport {
    #[instrument(skip(self, request), fields(method = %request.method))]
    fn call(
        &self,
        endpoint: &str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let started = Instant::now();
        let addr: SocketAddr = endpoint
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::Refused {
                endpoint: endpoint.to_string(),
            })?;

        let mut stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| classify(endpoint, timeout, e))?;

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(TransportError::Timeout {
                endpoint: endpoint.to_string(),
                after: timeout,
            });
        }
        stream
            .set_read_timeout(Some(remaining))
            .and_then(|_| stream.set_write_timeout(Some(remaining)))
            .map_err(|e| classify(endpoint, timeout, e))?;

        let mut line = serde_json::to_string(request).map_err(|e| TransportError::Codec {
            endpoint: endpoint.to_string(),
            detail: e.to_string(),
        })?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .map_err(|e| classify(endpoint, timeout, e))?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        let n = reader
            .read_line(&mut reply)
            .map_err(|e| classify(endpoint, timeout, e))?;
        if n == 0 {
            return Err(TransportError::Reset {
                endpoint: endpoint.to_string(),
                detail: "connection closed before reply".to_string(),
            });
        }
        serde_json::from_str(reply.trim_end()).map_err(|e| TransportError::Codec {
            endpoint: endpoint.to_string(),
            detail: e.to_string(),
        })
    }
}

/// Serves a [`Handler`] on a TCP port until [`TcpServer::shutdown`] or drop.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl TcpServer {
    const ACCEPT_POLL: Duration = Duration::from_millis(10);
    /// A connection that sends nothing for this long is closed.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Bind `addr` (use port 0 for an ephemeral port) and start accepting.
    pub fn bind(addr: &str, handler: Arc<dyn Handler>) -> anyhow::Result<TcpServer> {
        Self::bind_with_idle_timeout(addr, handler, Self::IDLE_TIMEOUT)
    }

    pub fn bind_with_idle_timeout(
        addr: &str,
        handler: Arc<dyn Handler>,
        idle_timeout: Duration,
    ) -> anyhow::Result<TcpServer> {
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("could not bind TcpListener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        listener
            .set_nonblocking(true)
            .context("setting non-blocking accept")?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let accept_thread = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        trace!(%peer, "accepted");
                        let handler = handler.clone();
                        thread::spawn(move || serve_connection(stream, handler, idle_timeout));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Self::ACCEPT_POLL);
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        thread::sleep(Self::ACCEPT_POLL);
                    }
                }
            }
            debug!(%local_addr, "server stopped");
        });

        Ok(TcpServer {
            local_addr,
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint string to hand to [`TcpTransport`].
    pub fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_connection(stream: TcpStream, handler: Arc<dyn Handler>, idle_timeout: Duration) {
    // accepted sockets may inherit non-blocking mode from the listener
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(idle_timeout)))
    {
        warn!("could not set up connection: {e}");
        return;
    }
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!("could not clone connection: {e}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match (&mut reader).take(MAX_ENVELOPE_BYTES + 1).read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                trace!("connection dropped: {e}");
                break;
            }
        }
        let overflow = !line.ends_with('\n') && line.len() as u64 > MAX_ENVELOPE_BYTES;
        if !overflow && line.trim().is_empty() {
            continue;
        }
        let reply = if overflow {
            warn!("envelope over {MAX_ENVELOPE_BYTES} bytes, closing connection");
            Response::err(
                String::new(),
                ProtocolError::protocol(format!("envelope exceeds {MAX_ENVELOPE_BYTES} bytes")),
            )
        } else {
            match serde_json::from_str::<Request>(&line) {
                Ok(request) => handler.handle(request),
                Err(e) => Response::err(
                    String::new(),
                    ProtocolError::protocol(format!("malformed envelope: {e}")),
                ),
            }
        };
        let Ok(mut out) = serde_json::to_string(&reply) else {
            break;
        };
        out.push('\n');
        if writer.write_all(out.as_bytes()).is_err() || overflow {
            break;
        }
    }
}
