//! Listening sockets.
//!
//! A server keeps exactly one socket listening on its port. Each call to
//! [`Server::available`] or [`Server::write`] runs the session loop first:
//! sockets whose peer went away are closed once drained, and a new
//! listening socket is opened when the previous one was taken by a peer.

use std::time::Duration;

use crate::cache::{Renew, SlotHandle, SlotId};
use crate::error::Result;
use crate::hw_trait::Spi;
use crate::protocol::cmd;
use crate::shield::Shield;
use crate::socket::ConnectionState;
use crate::tracing::prelude::*;

/// Response deadline while the shield does TLS key operations.
const SSL_RESPONSE_WAIT: Duration = Duration::from_millis(600);

/// Response deadline while the shield does SSH key exchange.
const SSH_RESPONSE_WAIT: Duration = Duration::from_millis(900);

const DEFAULT_WS_PATH: &str = "remocon";

/// Longest SSH username or password read back from the shield.
const SSH_AUTH_LEN: usize = 32;

/// Application protocol served on the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerApi {
    Tcp,
    Telnet,
    WebSocket {
        path: String,
    },
    Ssl,
    Ssh {
        username: Option<String>,
        password: Option<String>,
    },
}

impl ServerApi {
    fn slots(&self) -> Vec<SlotId> {
        match self {
            ServerApi::Ssl => vec![SlotId::SSL],
            ServerApi::Ssh { .. } => vec![SlotId::SSH],
            _ => SlotId::tcp().collect(),
        }
    }
}

#[derive(Debug)]
pub struct Server {
    port: u16,
    api: ServerApi,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl Server {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            api: ServerApi::Tcp,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn api(&self) -> &ServerApi {
        &self.api
    }

    pub async fn begin<S: Spi>(&mut self, shield: &mut Shield<S>) -> Result<()> {
        self.start(shield, ServerApi::Tcp).await
    }

    pub async fn begin_telnet<S: Spi>(&mut self, shield: &mut Shield<S>) -> Result<()> {
        self.start(shield, ServerApi::Telnet).await
    }

    /// WebSocket server on `path`; an empty path serves the default.
    pub async fn begin_websocket<S: Spi>(&mut self, shield: &mut Shield<S>, path: &str) -> Result<()> {
        let path = non_empty(path).unwrap_or_else(|| DEFAULT_WS_PATH.to_string());
        self.start(shield, ServerApi::WebSocket { path }).await
    }

    pub async fn begin_ssl<S: Spi>(&mut self, shield: &mut Shield<S>) -> Result<()> {
        shield.set_response_wait(Some(SSL_RESPONSE_WAIT));
        self.start(shield, ServerApi::Ssl).await
    }

    /// SSH server. Empty credentials are not checked.
    pub async fn begin_ssh<S: Spi>(
        &mut self,
        shield: &mut Shield<S>,
        username: &str,
        password: &str,
    ) -> Result<()> {
        shield.set_response_wait(Some(SSH_RESPONSE_WAIT));
        let api = ServerApi::Ssh {
            username: non_empty(username),
            password: non_empty(password),
        };
        self.start(shield, api).await
    }

    async fn start<S: Spi>(&mut self, shield: &mut Shield<S>, api: ServerApi) -> Result<()> {
        self.api = api;
        self.session_loop(shield).await
    }

    fn owns<S: Spi>(&self, shield: &Shield<S>, id: SlotId) -> bool {
        shield.slots[id].listen_port == Some(self.port)
    }

    /// A session with bytes to read, if any.
    pub async fn available<S: Spi>(&mut self, shield: &mut Shield<S>) -> Result<Option<SlotHandle>> {
        self.session_loop(shield).await?;
        for id in self.api.slots() {
            if self.owns(shield, id) && shield.cache_available(id).await? > 0 {
                return Ok(Some(shield.slots.acquire(id)));
            }
        }
        Ok(None)
    }

    /// Send `data` to every connected session. Returns the total queued.
    pub async fn write<S: Spi>(&mut self, shield: &mut Shield<S>, data: &[u8]) -> Result<usize> {
        self.session_loop(shield).await?;
        let mut written = 0;
        for id in self.api.slots() {
            if !self.owns(shield, id) {
                continue;
            }
            shield.update(id, Renew::empty()).await?;
            if shield.slots[id].state.is_connected() {
                written += shield.cache_write(id, data).await?;
            }
        }
        Ok(written)
    }

    async fn session_loop<S: Spi>(&mut self, shield: &mut Shield<S>) -> Result<()> {
        let mut listening = 0;

        for id in self.api.slots() {
            if !self.owns(shield, id) {
                continue;
            }
            shield.update(id, Renew::empty()).await?;
            match shield.slots[id].state {
                ConnectionState::Listen => listening += 1,
                ConnectionState::SshAuth => self.authenticate(shield, id).await?,
                ConnectionState::Closed | ConnectionState::Closing(_) => {
                    if shield.cache_available(id).await? == 0 {
                        debug!(slot = %id, port = self.port, "Reaping session");
                        shield.close_slot(id).await?;
                    }
                }
                _ => {}
            }
        }

        if listening > 0 {
            return Ok(());
        }

        let Some(id) = shield.slots.find_free(self.api.slots().into_iter()) else {
            return Ok(());
        };
        self.listen(shield, id).await
    }

    async fn listen<S: Spi>(&self, shield: &mut Shield<S>, id: SlotId) -> Result<()> {
        let set = shield.engine.codec().set_verb();
        let mut setup = Vec::new();
        match &self.api {
            ServerApi::Tcp => setup.push(cmd!("tcp{} {} api tcp", id, set)),
            ServerApi::Telnet => setup.push(cmd!("tcp{} {} api telnet", id, set)),
            ServerApi::WebSocket { path } => {
                setup.push(cmd!("tcp{} {} api ws", id, set));
                setup.push(cmd!("tcp{} {} ws path {}", id, set, path));
                setup.push(cmd!("tcp{} {} ws proto text.phpoc", id, set));
                // unicode text frames
                setup.push(cmd!("tcp{} {} ws mode 0", id, set));
            }
            ServerApi::Ssl => {
                let method = shield.engine.codec().ssl_method(true);
                setup.push(cmd!("tcp{} {} api ssl", id, set));
                setup.push(cmd!("tcp{} {} ssl method {}", id, set, method));
            }
            ServerApi::Ssh { .. } => setup.push(cmd!("tcp{} {} api ssh", id, set)),
        }
        for command in setup {
            shield.engine.command(command).await?;
        }
        shield.engine.command(cmd!("tcp{} listen {}", id, self.port)).await?;

        shield.reset_slot(id, ConnectionState::Listen);
        shield.slots[id].listen_port = Some(self.port);
        info!(slot = %id, port = self.port, api = ?self.api, "Listening");
        Ok(())
    }

    /// Accept or reject an SSH peer against the configured credentials.
    async fn authenticate<S: Spi>(&self, shield: &mut Shield<S>, id: SlotId) -> Result<()> {
        let ServerApi::Ssh { username, password } = &self.api else {
            return Ok(());
        };
        let get = shield.engine.codec().get_verb();
        let set = shield.engine.codec().set_verb();

        let mut accept = true;
        for (key, expected) in [("username", username), ("password", password)] {
            let Some(expected) = expected else {
                continue;
            };
            let given = shield
                .engine
                .query_string(cmd!("tcp{} {} ssh {}", id, get, key), SSH_AUTH_LEN)
                .await?;
            if given.is_empty() || &given != expected {
                accept = false;
                break;
            }
        }

        let verdict = if accept { "accept" } else { "reject" };
        shield
            .engine
            .command(cmd!("tcp{} {} ssh auth {}", id, set, verdict))
            .await?;
        info!(slot = %id, verdict, "SSH authentication");
        shield.update(id, Renew::STATE).await
    }
}
