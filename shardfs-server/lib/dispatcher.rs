//! The accept loop shared by the coordinator and the storage nodes.
//!
//! Every accepted connection is handed to its own dedicated OS thread, where the handler performs
//! ordinary blocking socket and file I/O. Connections are long-lived, so they must not occupy a
//! bounded pool. Workers share no state besides the handler, which only holds immutable
//! configuration. Finished workers report back over a channel and are joined as they complete,
//! concurrently with accepting new connections.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Serves a single connection. Called on a dedicated worker thread.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, stream: TcpStream, peer: SocketAddr);
}

pub struct Dispatcher<H: ConnectionHandler> {
    name: String,
    listener: TcpListener,
    handler: Arc<H>,
}

/// Reports the worker as finished when dropped, also when the handler panics.
struct Completion {
    id: u64,
    finished: mpsc::UnboundedSender<u64>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let _ = self.finished.send(self.id);
    }
}

impl<H: ConnectionHandler> Dispatcher<H> {
    pub async fn bind(name: impl Into<String>, addr: SocketAddr, handler: H) -> io::Result<Self> {
        Ok(Self {
            name: name.into(),
            listener: TcpListener::bind(addr).await?,
            handler: Arc::new(handler),
        })
    }

    /// Wraps an already bound listener. Must be called within a Tokio runtime.
    pub fn from_std(
        name: impl Into<String>,
        listener: std::net::TcpListener,
        handler: H,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            name: name.into(),
            listener: TcpListener::from_std(listener)?,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` completes.
    ///
    /// Workers still running at shutdown are detached and finish on their own.
    pub async fn run<F: Future<Output = ()>>(self, shutdown: F) -> io::Result<()> {
        let mut workers: HashMap<u64, JoinHandle<()>> = HashMap::new();
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
        let mut next_id = 0u64;
        info!(server = %self.name, addr = %self.local_addr()?, "listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(id) = finished_rx.recv() => {
                    // Sent as the worker returns, so joining only waits for the thread to exit.
                    if let Some(worker) = workers.remove(&id)
                        && worker.join().is_err()
                    {
                        error!(server = %self.name, "connection worker panicked");
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(server = %self.name, "failed to accept connection: {err}");
                            continue;
                        }
                    };
                    let stream = match stream.into_std().and_then(|stream| {
                        stream.set_nonblocking(false)?;
                        Ok(stream)
                    }) {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!(server = %self.name, %peer, "failed to set up connection: {err}");
                            continue;
                        }
                    };
                    debug!(server = %self.name, %peer, workers = workers.len(), "accepted connection");
                    let id = next_id;
                    next_id += 1;
                    let handler = Arc::clone(&self.handler);
                    let completion = Completion {
                        id,
                        finished: finished_tx.clone(),
                    };
                    let spawned = thread::Builder::new()
                        .name(format!("{}-conn", self.name))
                        .spawn(move || {
                            let _completion = completion;
                            handler.handle(stream, peer);
                        });
                    match spawned {
                        Ok(worker) => {
                            workers.insert(id, worker);
                        }
                        Err(err) => {
                            error!(server = %self.name, %peer, "failed to spawn connection worker: {err}");
                        }
                    }
                }
            }
        }
        info!(
            server = %self.name,
            active_connections = workers.len(),
            "shutting down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct Echo;

    impl ConnectionHandler for Echo {
        fn handle(&self, mut stream: TcpStream, _peer: SocketAddr) {
            let mut buf = Vec::new();
            if stream.read_to_end(&mut buf).is_ok() {
                let _ = stream.write_all(&buf);
            }
        }
    }

    struct LineEcho;

    impl ConnectionHandler for LineEcho {
        fn handle(&self, stream: TcpStream, _peer: SocketAddr) {
            let Ok(mut writer) = stream.try_clone() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            while matches!(reader.read_line(&mut line), Ok(n) if n > 0) {
                if writer.write_all(line.as_bytes()).is_err() {
                    return;
                }
                line.clear();
            }
        }
    }

    struct Blocking {
        started: Mutex<mpsc::Sender<()>>,
    }

    impl ConnectionHandler for Blocking {
        fn handle(&self, mut stream: TcpStream, _peer: SocketAddr) {
            let _ = self.started.lock().unwrap().send(());
            let mut buf = [0; 1];
            let _ = stream.read(&mut buf);
        }
    }

    fn request(addr: SocketAddr, data: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(data).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_serves_many_connections() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let addr = runtime.block_on(async {
            let dispatcher = Dispatcher::bind("echo", "127.0.0.1:0".parse().unwrap(), Echo)
                .await
                .unwrap();
            let addr = dispatcher.local_addr().unwrap();
            tokio::spawn(dispatcher.run(async {
                let _ = shutdown_rx.await;
            }));
            addr
        });

        for i in 0..50 {
            let message = format!("message {i}");
            assert_eq!(request(addr, message.as_bytes()), message.as_bytes());
        }
        shutdown_tx.send(()).unwrap();
        runtime.shutdown_background();
    }

    #[test]
    fn test_stalled_connection_does_not_block_others() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        runtime.block_on(async {
            let dispatcher = Dispatcher::from_std(
                "blocking",
                listener,
                Blocking {
                    started: Mutex::new(started_tx),
                },
            )
            .unwrap();
            tokio::spawn(dispatcher.run(async {
                let _ = shutdown_rx.await;
            }));
        });

        let stalled = TcpStream::connect(addr).unwrap();
        started_rx.recv().unwrap();
        let other = TcpStream::connect(addr).unwrap();
        started_rx.recv().unwrap();

        drop(other);
        drop(stalled);
        shutdown_tx.send(()).unwrap();
        runtime.shutdown_background();
    }

    #[test]
    fn test_idle_connections_do_not_exhaust_workers() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let addr = runtime.block_on(async {
            let dispatcher = Dispatcher::bind("echo", "127.0.0.1:0".parse().unwrap(), LineEcho)
                .await
                .unwrap();
            let addr = dispatcher.local_addr().unwrap();
            tokio::spawn(dispatcher.run(async {
                let _ = shutdown_rx.await;
            }));
            addr
        });

        let mut idle = Vec::new();
        for _ in 0..64 {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(b"hello\n").unwrap();
            let mut reply = [0; 6];
            stream.read_exact(&mut reply).unwrap();
            assert_eq!(&reply, b"hello\n");
            idle.push(stream);
        }

        let mut fresh = TcpStream::connect(addr).unwrap();
        fresh
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        fresh.write_all(b"still served\n").unwrap();
        let mut reply = [0; 13];
        fresh.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"still served\n");

        drop(idle);
        shutdown_tx.send(()).unwrap();
        runtime.shutdown_background();
    }
}
