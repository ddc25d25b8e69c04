//! Per-connection session loop
//!
//! A session reads newline-delimited lines from its connection and moves
//! through `Unjoined -> Joined -> Closed`. Each input line causes at most one
//! registry mutation, one broadcast and one transcript append.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info};

use crate::error::Result;
use crate::protocol::{ChatEvent, Command, JOIN_PROMPT};
use crate::server::state::ServerState;
use crate::transport::ConnectionHandle;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    /// Connected, no `/join` yet
    Unjoined,
    /// Joined; `nickname` is what this session last registered
    Joined { nickname: String },
    /// Loop finished and cleanup done
    Closed,
}

/// What the loop should do after a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct Session {
    state: Arc<ServerState>,
    connection: ConnectionHandle,
    session_state: SessionState,
}

impl Session {
    pub fn new(state: Arc<ServerState>, connection: ConnectionHandle) -> Self {
        Self {
            state,
            connection,
            session_state: SessionState::Unjoined,
        }
    }

    /// Run until EOF, a read error, `/exit`, or the connection is closed
    /// elsewhere. Cleanup always runs before returning.
    pub async fn run<R>(mut self, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let codec = LinesCodec::new_with_max_length(self.state.config().max_line_length);
        let mut lines = FramedRead::new(reader, codec);

        let result = loop {
            let next = tokio::select! {
                _ = self.connection.closed() => break Ok(()),
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => match self.handle_line(&line).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Exit) => break Ok(()),
                    Err(e) => break Err(e),
                },
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            }
        };

        self.finish().await;
        result
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        match Command::parse(line) {
            Command::Exit => {
                debug!("{} sent /exit", self.connection.remote_addr());
                Ok(Flow::Exit)
            }
            Command::Join(nickname) => {
                self.join(nickname).await;
                Ok(Flow::Continue)
            }
            Command::Chat(text) => {
                self.chat(text).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn join(&mut self, nickname: String) {
        let previous = self
            .state
            .registry()
            .register(&self.connection, nickname.clone())
            .await;

        match previous {
            Some(old) => info!(
                "{} re-joined as \"{}\" (was \"{}\")",
                self.connection.remote_addr(),
                nickname,
                old
            ),
            None => info!(
                "{} joined as \"{}\"",
                self.connection.remote_addr(),
                nickname
            ),
        }

        self.session_state = SessionState::Joined {
            nickname: nickname.clone(),
        };
        self.state.publish(ChatEvent::Joined { nickname }).await;
    }

    async fn chat(&mut self, text: String) -> Result<()> {
        if self.session_state == SessionState::Unjoined {
            return self
                .connection
                .send(Bytes::from_static(JOIN_PROMPT.as_bytes()))
                .await;
        }

        match self.state.registry().lookup(self.connection.id()).await {
            Some(nickname) => {
                self.state
                    .publish(ChatEvent::Message { nickname, text })
                    .await;
            }
            None => debug!(
                "Dropping line from deregistered connection {}",
                self.connection.remote_addr()
            ),
        }
        Ok(())
    }

    /// Deregister, announce the leave if this session ever joined, then let
    /// the writer flush what is still queued for this connection
    async fn finish(&mut self) {
        let removed = self.state.registry().remove(self.connection.id()).await;
        let previous = std::mem::replace(&mut self.session_state, SessionState::Closed);

        // The broadcaster may already have evicted this connection; fall back
        // to the nickname this session registered last.
        let nickname = match (removed, previous) {
            (Some(nickname), _) => Some(nickname),
            (None, SessionState::Joined { nickname }) => Some(nickname),
            (None, _) => None,
        };

        if let Some(nickname) = nickname {
            info!(
                "\"{}\" at {} left",
                nickname,
                self.connection.remote_addr()
            );
            self.state.publish(ChatEvent::Left { nickname }).await;
        }

        self.connection.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerConfig;
    use crate::transcript::tests::temp_transcript_path;
    use tokio::io::{AsyncWriteExt, duplex};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn state() -> (Arc<ServerState>, std::path::PathBuf) {
        let path = temp_transcript_path();
        let config = ServerConfig::default().with_transcript_path(&path);
        (Arc::new(ServerState::new(config)), path)
    }

    fn connection() -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = ConnectionHandle::new(
            "127.0.0.1:40002".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(String::from_utf8(bytes.to_vec()).unwrap());
        }
        out
    }

    /// Strip the `HH:MM ` stamp
    fn unstamped(line: &str) -> &str {
        &line[6..]
    }

    #[tokio::test]
    async fn test_unjoined_chat_gets_prompt_only() {
        let (state, path) = state();
        let (conn, mut rx) = connection();
        let (mut client, server) = duplex(1024);

        client.write_all(b"hi\n").await.unwrap();
        drop(client);

        Session::new(Arc::clone(&state), conn).run(server).await.unwrap();

        assert_eq!(drain(&mut rx), vec![JOIN_PROMPT.to_string()]);
        assert_eq!(state.broadcaster().issued().await, 0);
        assert!(tokio::fs::metadata(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_join_chat_and_leave() {
        let (state, path) = state();
        let (conn, mut rx) = connection();
        let (observer, mut observer_rx) = connection();
        state.registry().register(&observer, "observer").await;

        let (mut client, server) = duplex(1024);
        client.write_all(b"/join alice\nhello\n").await.unwrap();
        drop(client);

        Session::new(Arc::clone(&state), conn.clone())
            .run(server)
            .await
            .unwrap();

        let seen: Vec<String> = drain(&mut observer_rx);
        let seen: Vec<&str> = seen.iter().map(|l| unstamped(l)).collect();
        assert_eq!(
            seen,
            vec![
                "Notice: \"alice\" joined the chat\n",
                "- alice: hello\n",
                "Notice: \"alice\" left the chat\n",
            ]
        );

        // The sender sees its own join and chat, not its leave.
        assert_eq!(drain(&mut rx).len(), 2);
        assert!(!state.registry().contains(conn.id()).await);
        assert!(conn.is_draining());

        let log = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(log.lines().count(), 3);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_rejoin_renames_without_extra_notice() {
        let (state, path) = state();
        let (conn, _rx) = connection();
        let (observer, mut observer_rx) = connection();
        state.registry().register(&observer, "observer").await;

        let (mut client, server) = duplex(1024);
        client
            .write_all(b"/join alice\n/join alicia\nhey\n/exit\nignored\n")
            .await
            .unwrap();

        Session::new(Arc::clone(&state), conn).run(server).await.unwrap();

        let seen: Vec<String> = drain(&mut observer_rx);
        let seen: Vec<&str> = seen.iter().map(|l| unstamped(l)).collect();
        assert_eq!(
            seen,
            vec![
                "Notice: \"alice\" joined the chat\n",
                "Notice: \"alicia\" joined the chat\n",
                "- alicia: hey\n",
                "Notice: \"alicia\" left the chat\n",
            ]
        );
        drop(client);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_exit_before_join_is_silent() {
        let (state, path) = state();
        let (conn, mut rx) = connection();
        let (mut client, server) = duplex(1024);

        client.write_all(b"/exit\n").await.unwrap();

        Session::new(Arc::clone(&state), conn).run(server).await.unwrap();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(state.broadcaster().issued().await, 0);
        drop(client);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_evicted_session_still_announces_leave_once() {
        let (state, path) = state();
        let (conn, _rx) = connection();
        let (observer, mut observer_rx) = connection();
        state.registry().register(&observer, "observer").await;

        let (mut client, server) = duplex(1024);
        client.write_all(b"/join bob\n").await.unwrap();

        let session_state = Arc::clone(&state);
        let evicted = conn.clone();
        let task = tokio::spawn(Session::new(session_state, conn).run(server));

        while !state.registry().contains(evicted.id()).await {
            tokio::task::yield_now().await;
        }
        // What the broadcaster does to a failed recipient.
        evicted.close();
        state.registry().remove(evicted.id()).await;

        task.await.unwrap().unwrap();

        let seen: Vec<String> = drain(&mut observer_rx);
        let leaves = seen
            .iter()
            .filter(|l| unstamped(l) == "Notice: \"bob\" left the chat\n")
            .count();
        assert_eq!(leaves, 1);
        drop(client);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_overlong_line_ends_session() {
        let path = temp_transcript_path();
        let config = ServerConfig::default()
            .with_transcript_path(&path)
            .with_max_line_length(8);
        let state = Arc::new(ServerState::new(config));
        let (conn, _rx) = connection();
        let (mut client, server) = duplex(1024);

        client.write_all(b"this line is far too long\n").await.unwrap();

        let result = Session::new(state, conn.clone()).run(server).await;
        assert!(result.is_err());
        assert!(conn.is_draining());
        drop(client);
    }
}
