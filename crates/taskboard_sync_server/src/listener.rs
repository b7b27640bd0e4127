//! TCP transport.
//!
//! Frames are newline-delimited JSON. The first frame on a socket must be
//! `hello`, carrying an identity that was already authenticated upstream.
//! Each connection gets a writer task draining its outbound queue, while
//! the accepting task reads and handles requests.

use crate::error::{SyncError, SyncResult};
use crate::server::SyncServer;
use crate::session::Session;
use crate::store::EntityStore;
use std::future::Future;
use std::sync::Arc;
use taskboard_sync_protocol::{Actor, ClientMessage, ProtocolError, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Accepts connections until `shutdown` resolves.
pub async fn serve<S: EntityStore>(
    server: Arc<SyncServer<S>>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> SyncResult<()> {
    info!(addr = %listener.local_addr()?, "sync server listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("sync server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    debug!(%peer, "accepted");
                    if let Err(err) = handle_connection(server, stream).await {
                        warn!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
}

/// Runs one connection from `hello` to disconnect.
pub async fn handle_connection<S: EntityStore>(
    server: Arc<SyncServer<S>>,
    stream: TcpStream,
) -> SyncResult<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    let actor = match ClientMessage::decode(&first) {
        Ok(ClientMessage::Hello { user_id, role }) => Actor { user_id, role },
        Ok(other) => {
            let err = ProtocolError::UnexpectedMessage {
                expected: "hello",
                got: other.kind(),
            };
            refuse(&mut writer, &err).await?;
            return Err(err.into());
        }
        Err(err) => {
            refuse(&mut writer, &err).await?;
            return Err(err.into());
        }
    };

    let (session, mut outbound) = server.connect(actor)?;
    let id = session.id();

    let mut writer_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(err) = write_frame(&mut writer, &message).await {
                debug!(error = %err, "write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    // The writer stops on its own when the registry drops the connection.
    let (result, writer_done) = tokio::select! {
        result = read_loop(&session, &mut lines) => (result, false),
        _ = &mut writer_task => (Ok(()), true),
    };

    server.disconnect(id);
    if !writer_done {
        let _ = writer_task.await;
    }
    result
}

async fn read_loop<S: EntityStore>(
    session: &Session<S>,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) -> SyncResult<()> {
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match ClientMessage::decode(&line) {
            Ok(message) => message,
            Err(err) => {
                debug!(conn = %session.id(), error = %err, "undecodable frame");
                session.send_error(err.to_string())?;
                continue;
            }
        };

        match session.handle(message).await {
            Ok(()) => {}
            Err(SyncError::ConnectionLost(_)) => return Ok(()),
            Err(err) => {
                warn!(conn = %session.id(), error = %err, "request failed");
                session.send_error(err.to_string())?;
            }
        }
    }
    Ok(())
}

async fn refuse(writer: &mut OwnedWriteHalf, err: &ProtocolError) -> SyncResult<()> {
    let message = ServerMessage::Error {
        message: err.to_string(),
    };
    write_frame(writer, &message).await
}

async fn write_frame(writer: &mut OwnedWriteHalf, message: &ServerMessage) -> SyncResult<()> {
    let mut frame = message.encode()?;
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    Ok(())
}
