//! Async driver around `SyncEngine`
//!
//! A `Session` owns the engine, the request/response implementation and the
//! push channel. One task runs `Session::run`, which multiplexes UI commands,
//! push events, request completions and the typing deadline in a single
//! `select!` loop, so every engine operation runs to completion before the
//! next one starts. The UI talks to it through a cloneable `SessionHandle`.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::api::{self, ApiResponse, ChatApi, Upload};
use crate::channel::{ChannelEvent, ChannelHandle};
use crate::config;
use crate::engine::{Effect, SyncEngine, Ticket};
use crate::error::{Result, SyncError};
use crate::models::{Contact, DeletionPolicy, MediaKind, Message, MessageId, UserId};
use crate::selection::DeletionPrompt;

type Completion = BoxFuture<'static, (Ticket, Result<ApiResponse>)>;

/// Point-in-time copy of what the UI renders
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub active: Option<UserId>,
    pub messages: Vec<Message>,
    pub selected: Vec<MessageId>,
    pub expired: bool,
}

#[derive(Debug)]
pub enum Command {
    SelectConversation(UserId),
    SendText(String),
    SendAttachment { upload: Upload, kind: MediaKind },
    Input,
    Blur,
    SetVisibility(bool),
    EnterSelection(MessageId),
    ToggleSelection(MessageId),
    CancelSelection,
    RequestDeletion(oneshot::Sender<Result<DeletionPrompt>>),
    ConfirmDeletion(DeletionPolicy, oneshot::Sender<Result<()>>),
    Contacts(String, oneshot::Sender<Vec<Contact>>),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn select_conversation(&self, peer_id: UserId) -> Result<()> {
        self.send(Command::SelectConversation(peer_id)).await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(Command::SendText(text.to_string())).await
    }

    pub async fn input(&self) -> Result<()> {
        self.send(Command::Input).await
    }

    pub async fn set_visibility(&self, visible: bool) -> Result<()> {
        self.send(Command::SetVisibility(visible)).await
    }

    pub async fn request_deletion(&self) -> Result<DeletionPrompt> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::RequestDeletion(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub async fn confirm_deletion(&self, policy: DeletionPolicy) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ConfirmDeletion(policy, tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub async fn contacts(&self, term: &str) -> Result<Vec<Contact>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Contacts(term.to_string(), tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}

pub struct Session {
    engine: SyncEngine,
    api: Arc<dyn ChatApi>,
    channel: ChannelHandle,
    commands: mpsc::Receiver<Command>,
    session_file: Option<PathBuf>,
}

impl Session {
    pub fn new(
        engine: SyncEngine,
        api: Arc<dyn ChatApi>,
        channel: ChannelHandle,
        buffer: usize,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        let session = Session {
            engine,
            api,
            channel,
            commands: rx,
            session_file: None,
        };
        (session, SessionHandle { commands: tx })
    }

    /// Stored session to forget when the credential is rejected
    pub fn with_session_file(mut self, path: PathBuf) -> Self {
        self.session_file = Some(path);
        self
    }

    /// Access the engine before running, e.g. to subscribe observers
    pub fn engine_mut(&mut self) -> &mut SyncEngine {
        &mut self.engine
    }

    /// Run until shutdown. Returns `Unauthorized` if the session expired.
    pub async fn run(mut self) -> Result<()> {
        let mut requests: FuturesUnordered<Completion> = FuturesUnordered::new();
        let mut channel_open = true;

        self.engine.start()?;
        self.dispatch(&mut requests);

        loop {
            let deadline = self.engine.next_typing_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        info!("Session shutting down");
                        self.engine.on_blur();
                        self.dispatch(&mut requests);
                        return Ok(());
                    }
                    Some(command) => self.apply(command),
                },
                event = self.channel.next_event(), if channel_open => match event {
                    Some(event) => self.on_channel_event(event),
                    None => {
                        channel_open = false;
                        self.engine.on_disconnected("push channel closed");
                    }
                },
                Some((ticket, result)) = requests.next(), if !requests.is_empty() => {
                    self.engine.complete(ticket, result);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.engine.on_typing_deadline(Instant::now());
                }
            }

            self.dispatch(&mut requests);

            if self.engine.is_expired() {
                self.forget_session();
                return Err(SyncError::Unauthorized);
            }
        }
    }

    fn apply(&mut self, command: Command) {
        let result = match command {
            Command::SelectConversation(peer_id) => self.engine.select_conversation(peer_id),
            Command::SendText(text) => self.engine.send_text(&text).map(|_| ()),
            Command::SendAttachment { upload, kind } => self.engine.send_attachment(upload, kind).map(|_| ()),
            Command::Input => self.engine.on_input(Instant::now()),
            Command::Blur => {
                self.engine.on_blur();
                Ok(())
            }
            Command::SetVisibility(visible) => self.engine.set_visibility(visible),
            Command::EnterSelection(id) => {
                self.engine.enter_selection(id);
                Ok(())
            }
            Command::ToggleSelection(id) => {
                self.engine.toggle_selection(id);
                Ok(())
            }
            Command::CancelSelection => {
                self.engine.cancel_selection();
                Ok(())
            }
            Command::RequestDeletion(reply) => {
                let _ = reply.send(self.engine.request_deletion());
                Ok(())
            }
            Command::ConfirmDeletion(policy, reply) => {
                let _ = reply.send(self.engine.confirm_deletion(policy).map(|_| ()));
                Ok(())
            }
            Command::Contacts(term, reply) => {
                let contacts = self.engine.contacts().filter(&term).into_iter().cloned().collect();
                let _ = reply.send(contacts);
                Ok(())
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                Ok(())
            }
            Command::Shutdown => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(SyncError::DuplicatePending(id)) => {
                info!("Identical message {} still pending, not sending again", id)
            }
            Err(e) => warn!("Command failed: {}", e),
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => self.engine.on_connected(),
            ChannelEvent::Disconnected(reason) => self.engine.on_disconnected(&reason),
            ChannelEvent::ConnectError(reason) => self.engine.on_connect_error(&reason),
            ChannelEvent::Event(event) => self.engine.handle_inbound(event),
        }
    }

    /// Carry out the effects the engine produced
    fn dispatch(&mut self, requests: &mut FuturesUnordered<Completion>) {
        for effect in self.engine.take_effects() {
            match effect {
                Effect::Emit(event) => {
                    if let Err(e) = self.channel.emit(event) {
                        warn!("{}", e);
                    }
                }
                Effect::Request { ticket, request } => {
                    debug!("Issuing {:?} as {:?}", request, ticket);
                    let api = self.api.clone();
                    requests.push(Box::pin(async move {
                        let result = api::execute(api.as_ref(), &request).await;
                        (ticket, result)
                    }));
                }
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            active: self.engine.active_conversation(),
            messages: self.engine.messages().to_vec(),
            selected: self.engine.selection().selected_ids(),
            expired: self.engine.is_expired(),
        }
    }

    fn forget_session(&self) {
        if let Some(path) = &self.session_file {
            if let Err(e) = config::clear_session_at(path) {
                error!("Failed to clear stored session: {}", e);
            }
        }
    }
}
