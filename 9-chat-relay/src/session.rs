//! One connected client, from username handshake to teardown.
//!
//! A session runs as its own Tokio task. It reads exactly one line as the
//! username, registers with the [`Registry`], then relays every further line
//! verbatim until the peer goes away or the registry closes it after a failed
//! write. The task's return value, [`SessionExit`], is the termination event.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    line::read_line,
    registry::{Registry, SessionHandle, SessionId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// The peer went away before sending a complete username line.
    HandshakeFailed,
    /// The peer closed the connection or a read failed.
    Disconnected { id: SessionId, username: String },
    /// A broadcast could not write to this session, so the registry removed it.
    Evicted { id: SessionId, username: String },
}

pub fn spawn<R, W>(registry: Arc<Registry>, reader: R, writer: W) -> JoinHandle<SessionExit>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(run(registry, reader, writer))
}

pub async fn run<R, W>(registry: Arc<Registry>, reader: R, mut writer: W) -> SessionExit
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let id = registry.next_id();
    let mut reader = BufReader::new(reader);

    let username = match perform_handshake(&mut reader).await {
        Ok(username) => username,
        Err(error) => {
            debug!(session = id, ?error, "handshake failed");
            if let Err(error) = writer.shutdown().await {
                debug!(session = id, ?error, "failed to shut down writer");
            }
            return SessionExit::HandshakeFailed;
        }
    };

    let session = Arc::new(SessionHandle::new(id, username.clone(), Box::new(writer)));
    if !registry.admit(Arc::clone(&session)).await {
        warn!(session = id, %username, "session id already registered");
        release(&session).await;
        return SessionExit::HandshakeFailed;
    }
    info!(session = id, %username, "session joined");

    if let Err(error) = relay(&registry, &session, &mut reader).await {
        debug!(session = id, ?error, "relay loop ended with error");
    }

    teardown(&registry, &session).await
}

async fn perform_handshake<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await.context("failed to read username")? {
        Some(username) => Ok(username),
        None => anyhow::bail!("connection closed before username"),
    }
}

async fn relay<R>(registry: &Registry, session: &SessionHandle, reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            biased;

            _ = session.closed() => return Ok(()),
            line = read_line(reader) => {
                match line.context("failed to read from peer")? {
                    // The registry also drops lines from removed senders, which
                    // covers an eviction that lands while this waits for the lock.
                    Some(_) if session.is_closed() => return Ok(()),
                    Some(line) => {
                        registry.broadcast(Some(session.id()), &line).await;
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn teardown(registry: &Registry, session: &SessionHandle) -> SessionExit {
    let id = session.id();
    let username = session.username().to_string();
    let departed = registry.depart(id).await;
    release(session).await;

    if departed {
        info!(session = id, %username, "session left");
        SessionExit::Disconnected { id, username }
    } else {
        info!(session = id, %username, "session closed after eviction");
        SessionExit::Evicted { id, username }
    }
}

async fn release(session: &SessionHandle) {
    if let Err(error) = session.shutdown().await {
        debug!(session = session.id(), ?error, "failed to shut down writer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::write_line;
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, DuplexStream},
        time::{sleep, timeout},
    };

    async fn wait_for_members(registry: &Registry, expected: usize) {
        timeout(Duration::from_secs(1), async {
            while registry.len().await != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    async fn next_line<R>(reader: &mut R) -> String
    where
        R: AsyncBufRead + Unpin,
    {
        timeout(Duration::from_secs(1), read_line(reader))
            .await
            .expect("timed out waiting for line")
            .expect("read line")
            .expect("stream closed")
    }

    async fn finished(task: JoinHandle<SessionExit>) -> SessionExit {
        timeout(Duration::from_secs(1), task)
            .await
            .expect("session did not finish")
            .expect("session task panicked")
    }

    /// Spawns a session over one duplex pair and returns the client end.
    fn connect(registry: &Arc<Registry>) -> (JoinHandle<SessionExit>, DuplexStream) {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server_side);
        (spawn(Arc::clone(registry), reader, writer), client_side)
    }

    #[tokio::test]
    async fn closing_before_username_is_a_handshake_failure() {
        let registry = Arc::new(Registry::new());
        let (task, client) = connect(&registry);
        drop(client);

        assert_eq!(finished(task).await, SessionExit::HandshakeFailed);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn unterminated_username_is_a_handshake_failure() {
        let registry = Arc::new(Registry::new());
        let (task, mut client) = connect(&registry);
        client.write_all(b"alice").await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(finished(task).await, SessionExit::HandshakeFailed);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn empty_username_is_accepted() {
        let registry = Arc::new(Registry::new());
        let (_task, mut client) = connect(&registry);
        write_line(&mut client, "").await.unwrap();

        wait_for_members(&registry, 1).await;
        assert_eq!(registry.usernames().await, vec![String::new()]);
    }

    #[tokio::test]
    async fn relays_raw_lines_and_reports_disconnect() {
        let registry = Arc::new(Registry::new());
        let (alice_task, alice) = connect(&registry);
        let (mut alice_rx, mut alice_tx) = tokio::io::split(alice);
        write_line(&mut alice_tx, "alice").await.unwrap();
        wait_for_members(&registry, 1).await;

        let (_bob_task, bob) = connect(&registry);
        let (bob_rx, mut bob_tx) = tokio::io::split(bob);
        let mut bob_rx = BufReader::new(bob_rx);
        write_line(&mut bob_tx, "bob").await.unwrap();
        wait_for_members(&registry, 2).await;

        write_line(&mut alice_tx, "alice: hello").await.unwrap();
        assert_eq!(next_line(&mut bob_rx).await, "alice: hello");

        alice_tx.shutdown().await.unwrap();
        let exit = finished(alice_task).await;
        assert!(
            matches!(exit, SessionExit::Disconnected { ref username, .. } if username == "alice")
        );
        assert_eq!(next_line(&mut bob_rx).await, "SERVER: alice has left the chat!");
        assert_eq!(registry.usernames().await, vec!["bob"]);

        // Alice saw bob arrive, never her own line, and then the stream closed.
        let mut rest = String::new();
        alice_rx.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "SERVER: bob has entered the chat!\n");
    }

    #[tokio::test]
    async fn failed_write_evicts_session_and_ends_its_task() {
        let registry = Arc::new(Registry::new());

        // Separate pipes for input and output so the output can die on its own.
        let (input_server, mut input_client) = tokio::io::duplex(4096);
        let (output_server, output_client) = tokio::io::duplex(4096);
        let task = spawn(Arc::clone(&registry), input_server, output_server);
        write_line(&mut input_client, "ghost").await.unwrap();
        wait_for_members(&registry, 1).await;

        let (watcher, watcher_client) = tokio::io::duplex(4096);
        let mut watcher_rx = BufReader::new(watcher_client);
        let watcher = Arc::new(SessionHandle::new(
            registry.next_id(),
            "watcher",
            Box::new(watcher),
        ));
        registry.admit(Arc::clone(&watcher)).await;

        drop(output_client);
        let delivery = registry.broadcast(Some(watcher.id()), "watcher: hi").await;
        assert_eq!(delivery.delivered, 0);
        assert_eq!(delivery.evicted.len(), 1);

        let exit = finished(task).await;
        assert!(matches!(exit, SessionExit::Evicted { ref username, .. } if username == "ghost"));

        registry.broadcast(None, "marker").await;
        assert_eq!(next_line(&mut watcher_rx).await, "SERVER: ghost has left the chat!");
        assert_eq!(next_line(&mut watcher_rx).await, "marker");
        assert_eq!(registry.usernames().await, vec!["watcher"]);
    }

    #[tokio::test]
    async fn evicted_session_relays_nothing_more() {
        let registry = Arc::new(Registry::new());

        let (input_server, mut input_client) = tokio::io::duplex(4096);
        let (output_server, output_client) = tokio::io::duplex(4096);
        let task = spawn(Arc::clone(&registry), input_server, output_server);
        write_line(&mut input_client, "ghost").await.unwrap();
        wait_for_members(&registry, 1).await;

        let (watcher, watcher_client) = tokio::io::duplex(4096);
        let mut watcher_rx = BufReader::new(watcher_client);
        let watcher = Arc::new(SessionHandle::new(
            registry.next_id(),
            "watcher",
            Box::new(watcher),
        ));
        registry.admit(Arc::clone(&watcher)).await;

        drop(output_client);
        registry.broadcast(Some(watcher.id()), "watcher: hi").await;

        // Lines that reach the evicted session's input after its departure.
        for n in 0..5 {
            // The session may already have dropped its input half.
            let _ = write_line(&mut input_client, &format!("ghost: after {n}")).await;
        }
        let exit = finished(task).await;
        assert!(matches!(exit, SessionExit::Evicted { .. }));

        registry.broadcast(None, "marker").await;
        assert_eq!(next_line(&mut watcher_rx).await, "SERVER: ghost has left the chat!");
        assert_eq!(next_line(&mut watcher_rx).await, "marker");
    }
}
