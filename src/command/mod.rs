//! The two-phase mutating-command path.
//!
//! A command handler runs twice against the same code: once in the `Execute`
//! phase, performing its side effect inside a store transaction that also
//! carries the operation-log row, and once in the `Invalidate` phase, where
//! re-invoking the read operations it staled turns each call into an
//! invalidation. The explicit [`Phase`] on the context replaces any ambient
//! thread-local flag. If Execute fails, Invalidate never runs; errors during
//! Invalidate are logged and never roll back the committed effect.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, ErrorCode, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::{CancelToken, ComputeCtx, CoreError, Phase, Registry};
use crate::error::{Effect, Transience};
use crate::oplog::{
    AgentId, ChangeNotifier, CommandEnvelope, CompletedOps, OpLogError, Operation, OperationLog,
};

/// A mutating command: serializable so it can travel through the operation
/// log and be re-run (Invalidate phase only) on remote processes.
pub trait Command: Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;
}

/// Handles one command type in both phases.
pub trait CommandHandler<C: Command>: Send + Sync {
    fn handle(&self, cx: &mut CommandContext<'_>, command: &C) -> Result<(), CommandError>;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("concurrency conflict: {reason}")]
    Conflict { reason: String },

    #[error("store access during the invalidate phase")]
    StoreAccessInInvalidatePhase,

    #[error("command encode failed: {reason}")]
    Encode { reason: String },

    #[error("command decode failed: {reason}")]
    Decode { reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    OpLog(#[from] OpLogError),

    #[error("command state lock poisoned")]
    LockPoisoned,

    #[error("command failed: {reason}")]
    Failed { reason: String },
}

impl CommandError {
    pub fn transience(&self) -> Transience {
        match self {
            CommandError::Conflict { .. } => Transience::Retryable,
            CommandError::Store(e) => store_transience(e),
            CommandError::Core(e) => e.transience(),
            CommandError::OpLog(e) => e.transience(),
            CommandError::StoreAccessInInvalidatePhase
            | CommandError::Encode { .. }
            | CommandError::Decode { .. }
            | CommandError::LockPoisoned => Transience::Permanent,
            CommandError::Failed { .. } => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            CommandError::Conflict { .. }
            | CommandError::StoreAccessInInvalidatePhase
            | CommandError::Encode { .. }
            | CommandError::Decode { .. } => Effect::None,
            CommandError::Core(e) => e.effect(),
            CommandError::Store(_)
            | CommandError::OpLog(_)
            | CommandError::LockPoisoned
            | CommandError::Failed { .. } => Effect::Unknown,
        }
    }
}

fn store_transience(error: &rusqlite::Error) -> Transience {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => Transience::Retryable,
        Some(_) => Transience::Permanent,
        None => Transience::Unknown,
    }
}

/// Per-invocation context handed to a handler.
pub struct CommandContext<'a> {
    phase: Phase,
    registry: &'a Registry,
    cancel: CancelToken,
    txn: Option<&'a Transaction<'a>>,
    items: BTreeMap<String, Value>,
    store_used: bool,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn for_execute(registry: &'a Registry, txn: &'a Transaction<'a>) -> Self {
        Self {
            phase: Phase::Execute,
            registry,
            cancel: CancelToken::new(),
            txn: Some(txn),
            items: BTreeMap::new(),
            store_used: false,
        }
    }

    pub(crate) fn for_invalidate(registry: &'a Registry, items: BTreeMap<String, Value>) -> Self {
        Self {
            phase: Phase::Invalidate,
            registry,
            cancel: CancelToken::new(),
            txn: None,
            items,
            store_used: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// Compute context carrying this command's phase: reads made through it
    /// become invalidations during the Invalidate pass.
    pub fn compute(&self) -> ComputeCtx<'a> {
        ComputeCtx::new(self.registry, self.phase, self.cancel.clone())
    }

    /// The store transaction. Only the Execute phase may touch the store;
    /// taking the handle records that this command used it, which is what
    /// decides whether peers get notified.
    pub fn txn(&mut self) -> Result<&'a Transaction<'a>, CommandError> {
        match self.txn {
            Some(txn) if self.phase == Phase::Execute => {
                self.store_used = true;
                Ok(txn)
            }
            _ => Err(CommandError::StoreAccessInInvalidatePhase),
        }
    }

    /// Stash a value during Execute for the Invalidate pass; items persist
    /// with the operation row and reappear on remote watchers.
    pub fn set_item(
        &mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<(), CommandError> {
        let value = serde_json::to_value(value).map_err(|e| CommandError::Encode {
            reason: e.to_string(),
        })?;
        self.items.insert(key.into(), value);
        Ok(())
    }

    pub fn item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.items.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn item_bool(&self, key: &str) -> bool {
        self.item::<bool>(key).unwrap_or(false)
    }

    fn into_parts(self) -> (BTreeMap<String, Value>, bool) {
        (self.items, self.store_used)
    }
}

/// Drives both phases of a command on the local process, appends the
/// operation row, and signals peers.
pub struct CommandRunner {
    registry: Registry,
    conn: Mutex<Connection>,
    log: OperationLog,
    notifier: Arc<ChangeNotifier>,
    completed: Arc<CompletedOps>,
}

impl CommandRunner {
    pub fn new(
        registry: Registry,
        conn: Connection,
        log: OperationLog,
        notifier: Arc<ChangeNotifier>,
        completed: Arc<CompletedOps>,
    ) -> Self {
        Self {
            registry,
            conn: Mutex::new(conn),
            log,
            notifier,
            completed,
        }
    }

    pub fn agent(&self) -> &AgentId {
        self.log.agent()
    }

    pub fn run<C: Command>(
        &self,
        handler: &dyn CommandHandler<C>,
        command: &C,
    ) -> Result<Operation, CommandError> {
        let body = serde_json::to_value(command).map_err(|e| CommandError::Encode {
            reason: e.to_string(),
        })?;

        let mut conn = self.conn.lock().map_err(|_| CommandError::LockPoisoned)?;
        let txn = conn.transaction()?;

        let mut cx = CommandContext::for_execute(&self.registry, &txn);
        // Execute failure aborts here: the transaction rolls back on drop
        // and the Invalidate phase never runs.
        handler.handle(&mut cx, command)?;
        let (items, store_used) = cx.into_parts();

        let mut op = self.log.new_operation(
            CommandEnvelope {
                kind: C::KIND.to_string(),
                body,
            },
            items,
        );
        self.log.add(&txn, &mut op)?;
        txn.commit()?;
        drop(conn);

        self.completed.record(op.id);
        tracing::debug!(kind = C::KIND, id = %op.id, "command committed");

        run_invalidate_phase(&self.registry, handler, command, &op);

        if store_used {
            self.notifier.notify_detached();
        }
        Ok(op)
    }
}

/// The Invalidate pass. Its errors are logged, never propagated: the
/// committed Execute effect stands regardless.
fn run_invalidate_phase<C: Command>(
    registry: &Registry,
    handler: &dyn CommandHandler<C>,
    command: &C,
    op: &Operation,
) {
    let mut cx = CommandContext::for_invalidate(registry, op.items.clone());
    if let Err(e) = handler.handle(&mut cx, command) {
        tracing::error!(kind = %op.command.kind, id = %op.id, "invalidate pass failed: {e}");
    }
}

type ReRun = Box<dyn Fn(&Registry, &Operation) -> Result<(), CommandError> + Send + Sync>;

/// Maps command kinds to handlers so the operation watcher can re-run the
/// Invalidate phase for operations committed by other processes.
#[derive(Default)]
pub struct CommandRouter {
    routes: HashMap<String, ReRun>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C, H>(&mut self, handler: Arc<H>)
    where
        C: Command + 'static,
        H: CommandHandler<C> + 'static,
    {
        self.routes.insert(
            C::KIND.to_string(),
            Box::new(move |registry, op| {
                let command: C =
                    serde_json::from_value(op.command.body.clone()).map_err(|e| {
                        CommandError::Decode {
                            reason: format!("{} body: {e}", op.command.kind),
                        }
                    })?;
                let mut cx = CommandContext::for_invalidate(registry, op.items.clone());
                handler.handle(&mut cx, &command)
            }),
        );
    }

    /// Re-run the Invalidate phase for a remotely committed operation.
    /// Unknown kinds are skipped with a warning: peers may run newer code.
    pub fn reinvalidate(&self, registry: &Registry, op: &Operation) -> Result<(), CommandError> {
        match self.routes.get(&op.command.kind) {
            Some(rerun) => rerun(registry, op),
            None => {
                tracing::warn!(kind = %op.command.kind, id = %op.id, "no route for operation");
                Ok(())
            }
        }
    }
}
