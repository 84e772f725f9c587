// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! A fixed pool of connections served by worker threads.
//!
//! Callers get pool-wide handles instead of connection message ids. Bind
//! and StartTLS are not sent right away: they become the pool's session
//! settings and every worker applies them to its own connection before
//! running its next operation.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::background::BackgroundStrategy;
use super::{Strategy, StrategySettings};
use crate::config::PoolConfig;
use crate::correlator::ResponseBundle;
use crate::error::{LdapError, Result};
use crate::locks::{lock, wait, wait_timeout};
use crate::message::{
    BindResponse, ExtendedResponse, LdapMessage, LdapResult, MessageId, ProtocolOp, Request,
    START_TLS_OID,
};
use crate::ops;
use crate::session::SessionState;

enum PoolCommand {
    Execute { handle: MessageId, request: Request },
    Shutdown,
}

#[derive(Debug, Default)]
struct PoolState {
    open: bool,
    next_handle: u32,
    generation: u64,
    bind: Option<Request>,
    start_tls: bool,
    bound: bool,
    pending: HashSet<MessageId>,
    abandoned: HashSet<MessageId>,
    /// Handles being executed: worker index and the id on its connection
    running: HashMap<MessageId, (usize, MessageId)>,
    results: HashMap<MessageId, Result<ResponseBundle>>,
    unsolicited: Vec<LdapMessage>,
}

#[derive(Debug, Default)]
struct PoolShared {
    state: Mutex<PoolState>,
    done: Condvar,
}

impl PoolState {
    /// Handles wrap like message ids and skip any still in use.
    fn allocate(&mut self) -> MessageId {
        loop {
            if self.next_handle == 0 || self.next_handle > MessageId::MAX {
                self.next_handle = 1;
            }
            let handle = MessageId::new(self.next_handle);
            self.next_handle += 1;
            if !self.pending.contains(&handle) && !self.results.contains_key(&handle) {
                return handle;
            }
        }
    }
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }

    /// Publish the outcome for `handle` unless it was abandoned meanwhile.
    fn complete(&self, handle: MessageId, result: Result<ResponseBundle>) {
        let mut state = self.state();
        state.abandoned.remove(&handle);
        if state.pending.remove(&handle) {
            state.results.insert(handle, result);
        } else {
            debug!(handle = %handle, "discarding result of abandoned operation");
        }
        self.done.notify_all();
    }
}

struct Worker {
    connection: Arc<BackgroundStrategy>,
    thread: JoinHandle<()>,
}

pub struct PooledStrategy {
    settings: StrategySettings,
    pool: PoolConfig,
    shared: Arc<PoolShared>,
    queue: Mutex<Option<Sender<PoolCommand>>>,
    workers: Mutex<Vec<Worker>>,
}

impl PooledStrategy {
    pub fn new(settings: StrategySettings, pool: PoolConfig) -> Self {
        Self {
            settings,
            pool,
            shared: Arc::new(PoolShared::default()),
            queue: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.pool.size
    }

    fn next_handle(&self) -> MessageId {
        self.shared.state().allocate()
    }

    /// Record an immediately known result under a fresh handle.
    fn settle(&self, op: ProtocolOp) -> Result<MessageId> {
        let mut state = self.shared.state();
        let handle = state.allocate();
        let bundle = ResponseBundle::from_parts(handle, Vec::new(), LdapMessage::new(handle, op))?;
        state.results.insert(handle, Ok(bundle));
        Ok(handle)
    }

    fn spawn_worker(&self, index: usize, queue: Arc<Mutex<Receiver<PoolCommand>>>) -> Result<Worker> {
        let connection = Arc::new(BackgroundStrategy::new(self.settings.clone()));
        let context = WorkerContext {
            index,
            connection: Arc::clone(&connection),
            shared: Arc::clone(&self.shared),
            timeout: self.pool.operation_timeout(),
            generation: 0,
        };
        let thread = std::thread::Builder::new()
            .name(format!("ldap-pool-{index}"))
            .spawn(move || context.run(&queue))
            .map_err(crate::error::TransportError::Runtime)?;
        Ok(Worker { connection, thread })
    }
}

struct WorkerContext {
    index: usize,
    connection: Arc<BackgroundStrategy>,
    shared: Arc<PoolShared>,
    timeout: Duration,
    /// Pool session generation last applied to `connection`
    generation: u64,
}

impl WorkerContext {
    fn run(mut self, queue: &Mutex<Receiver<PoolCommand>>) {
        debug!(worker = self.index, "pool worker started");
        loop {
            let command = lock(queue).recv();
            match command {
                Ok(PoolCommand::Execute { handle, request }) => {
                    if self.shared.state().abandoned.remove(&handle) {
                        continue;
                    }
                    let result = self.execute(handle, request);
                    let unsolicited = self.connection.drain_unsolicited();
                    if !unsolicited.is_empty() {
                        self.shared.state().unsolicited.extend(unsolicited);
                    }
                    self.shared.complete(handle, result);
                }
                Ok(PoolCommand::Shutdown) | Err(_) => break,
            }
        }
        if let Err(err) = self.connection.close() {
            warn!(worker = self.index, error = %err, "failed to close pooled connection");
        }
        debug!(worker = self.index, "pool worker stopped");
    }

    fn execute(&mut self, handle: MessageId, request: Request) -> Result<ResponseBundle> {
        self.prepare()?;
        let id = {
            // Sending and recording happen under one lock so an abandon
            // either sees the running entry or stops the send
            let mut state = self.shared.state();
            if state.abandoned.remove(&handle) || !state.pending.contains(&handle) {
                return Err(LdapError::NoSuchOperation(handle));
            }
            let id = self.connection.send(request)?;
            state.running.insert(handle, (self.index, id));
            id
        };
        let result = self.connection.await_response(id, Some(self.timeout));
        self.shared.state().running.remove(&handle);
        result.map(|bundle| bundle.relabel(handle))
    }

    /// Bring the connection up to the pool's current session settings.
    fn prepare(&mut self) -> Result<()> {
        let (generation, bind, start_tls) = {
            let state = self.shared.state();
            (state.generation, state.bind.clone(), state.start_tls)
        };
        let session = self.connection.session();
        if session.open && generation == self.generation {
            return Ok(());
        }
        if !session.open {
            self.connection.open()?;
        }
        if start_tls && !self.connection.session().tls_active {
            let bundle = self.connection.execute(ops::start_tls(), Some(self.timeout))?;
            expect_success("StartTLS", &bundle)?;
        }
        if let Some(bind) = bind {
            let bundle = self.connection.execute(bind, Some(self.timeout))?;
            expect_success("bind", &bundle)?;
        }
        debug!(worker = self.index, generation, "pooled connection prepared");
        self.generation = generation;
        Ok(())
    }
}

fn expect_success(what: &str, bundle: &ResponseBundle) -> Result<()> {
    match bundle.result_code() {
        Some(code) if !code.is_success() => Err(LdapError::operation_failed(format!(
            "pooled connection {what} failed: {code}"
        ))),
        _ => Ok(()),
    }
}

impl Strategy for PooledStrategy {
    fn open(&self) -> Result<()> {
        let mut queue = lock(&self.queue);
        if queue.is_some() {
            return Ok(());
        }
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = lock(&self.workers);
        for index in 0..self.pool.size {
            workers.push(self.spawn_worker(index, Arc::clone(&receiver))?);
        }
        *queue = Some(sender);

        let mut state = self.shared.state();
        state.open = true;
        state.generation += 1;
        info!(endpoint = %self.settings.endpoint, size = self.pool.size, "connection pool started");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let Some(sender) = lock(&self.queue).take() else {
            return Ok(());
        };
        self.shared.state().open = false;

        let workers = std::mem::take(&mut *lock(&self.workers));
        for _ in &workers {
            let _ = sender.send(PoolCommand::Shutdown);
        }
        drop(sender);
        for worker in workers {
            worker.connection.close()?;
            if worker.thread.join().is_err() {
                error!("pool worker panicked");
            }
        }

        let mut state = self.shared.state();
        for handle in std::mem::take(&mut state.pending) {
            state.results.insert(handle, Err(LdapError::NotConnected));
        }
        state.running.clear();
        state.abandoned.clear();
        // A reopened pool starts unauthenticated
        state.bind = None;
        state.start_tls = false;
        state.bound = false;
        self.shared.done.notify_all();
        info!(endpoint = %self.settings.endpoint, "connection pool stopped");
        Ok(())
    }

    fn session(&self) -> SessionState {
        let state = self.shared.state();
        SessionState {
            open: state.open,
            bound: state.bound,
            tls_active: state.open && (state.start_tls || self.settings.endpoint.use_tls),
        }
    }

    fn send(&self, request: Request) -> Result<MessageId> {
        if !self.shared.state().open {
            return Err(LdapError::NotConnected);
        }

        match &request.op {
            ProtocolOp::BindRequest(bind) => {
                if bind.is_sasl() {
                    return Err(LdapError::UnsupportedOperation(
                        "SASL binds cannot be shared across a connection pool".to_string(),
                    ));
                }
                {
                    let mut state = self.shared.state();
                    state.bind = Some(request.clone());
                    state.bound = true;
                    state.generation += 1;
                }
                debug!("pool bind credentials updated");
                self.settle(ProtocolOp::BindResponse(BindResponse {
                    result: LdapResult::success(),
                    server_sasl_creds: None,
                }))
            }
            ProtocolOp::ExtendedRequest(_) if request.is_start_tls() => {
                {
                    let mut state = self.shared.state();
                    state.start_tls = true;
                    state.generation += 1;
                }
                self.settle(ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult::success(),
                    name: Some(START_TLS_OID.to_string()),
                    value: None,
                }))
            }
            ProtocolOp::UnbindRequest => {
                let handle = self.next_handle();
                self.close()?;
                Ok(handle)
            }
            ProtocolOp::AbandonRequest(target) => {
                let target = *target;
                let handle = self.next_handle();
                self.abandon(target)?;
                Ok(handle)
            }
            _ => {
                let handle = self.next_handle();
                self.shared.state().pending.insert(handle);
                let queued = lock(&self.queue)
                    .as_ref()
                    .map(|sender| sender.send(PoolCommand::Execute { handle, request }).is_ok())
                    .unwrap_or(false);
                if !queued {
                    self.shared.state().pending.remove(&handle);
                    return Err(LdapError::NotConnected);
                }
                Ok(handle)
            }
        }
    }

    fn await_response(&self, id: MessageId, timeout: Option<Duration>) -> Result<ResponseBundle> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state();
        loop {
            if let Some(result) = state.results.remove(&id) {
                return result;
            }
            if !state.pending.contains(&id) {
                return Err(LdapError::NoSuchOperation(id));
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LdapError::ResponseTimeout {
                            message_id: id,
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    wait_timeout(&self.shared.done, state, deadline - now)
                }
                None => wait(&self.shared.done, state),
            };
        }
    }

    fn abandon(&self, id: MessageId) -> Result<()> {
        let running = {
            let mut state = self.shared.state();
            state.results.remove(&id);
            if !state.pending.remove(&id) {
                return Ok(());
            }
            let running = state.running.get(&id).copied();
            if running.is_none() {
                state.abandoned.insert(id);
            }
            self.shared.done.notify_all();
            running
        };

        if let Some((index, inner)) = running {
            let connection = lock(&self.workers)
                .get(index)
                .map(|worker| Arc::clone(&worker.connection));
            if let Some(connection) = connection {
                connection.abandon(inner)?;
            }
        }
        debug!(handle = %id, "abandoned");
        Ok(())
    }

    fn drain_unsolicited(&self) -> Vec<LdapMessage> {
        std::mem::take(&mut self.shared.state().unsolicited)
    }
}

impl Drop for PooledStrategy {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
