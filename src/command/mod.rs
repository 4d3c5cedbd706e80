//! Command descriptors, the registry, and the handler contract.
//!
//! A command is registered once at startup and never mutated: a name, ACL
//! categories, a replication flag, optional subcommands, and its behavior.
//! Behavior comes in two kinds — built-in Rust handlers and scripted modules
//! loaded from Lua files — behind the same [`Command`] surface, so the
//! dispatcher and the ACL never care which kind they are talking to.
//!
//! Key extraction is part of the contract: every command reports the read-key
//! and write-key sets for a raw argument vector, and the ACL filters on that
//! output without parsing command semantics itself.

pub mod acl_cmd;
pub mod generic;
pub mod hash;
pub mod list;
pub mod ping;
pub mod pubsub_cmd;
pub mod set;
pub mod sorted_set;
pub mod string;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::acl::Acl;
use crate::config::Config;
use crate::connection::ConnInfo;
use crate::error::{MurexError, MurexResult};
use crate::keyspace::{Keyspace, LockCtx};
use crate::pubsub::SharedPubSub;
use crate::script::ScriptCommand;

/// ACL category tags.
pub mod category {
    pub const READ: &str = "read";
    pub const WRITE: &str = "write";
    pub const FAST: &str = "fast";
    pub const SLOW: &str = "slow";
    pub const KEYSPACE: &str = "keyspace";
    pub const STRING: &str = "string";
    pub const LIST: &str = "list";
    pub const HASH: &str = "hash";
    pub const SET: &str = "set";
    pub const SORTEDSET: &str = "sortedset";
    pub const PUBSUB: &str = "pubsub";
    pub const CONNECTION: &str = "connection";
    pub const ADMIN: &str = "admin";
}

/// The read-key and write-key sets a command touches for a given raw vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedKeys {
    pub read: Vec<String>,
    pub write: Vec<String>,
}

impl ExtractedKeys {
    pub fn none() -> Self {
        ExtractedKeys::default()
    }

    pub fn reads(keys: Vec<String>) -> Self {
        ExtractedKeys {
            read: keys,
            write: Vec::new(),
        }
    }

    pub fn writes(keys: Vec<String>) -> Self {
        ExtractedKeys {
            read: Vec::new(),
            write: keys,
        }
    }
}

pub type KeyExtractFn = fn(&[String]) -> MurexResult<ExtractedKeys>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = MurexResult<Vec<u8>>> + Send>>;
pub type HandlerFn = fn(HandlerContext, Vec<String>) -> HandlerFuture;

/// Everything a handler may touch, threaded explicitly instead of through a
/// process-wide server handle.
#[derive(Clone)]
pub struct HandlerContext {
    pub keyspace: Arc<Keyspace>,
    pub pubsub: SharedPubSub,
    pub acl: Arc<Acl>,
    pub config: Arc<Config>,
    pub conn: ConnInfo,
    pub cancel: CancellationToken,
    /// The clock handlers must use for TTL decisions. On the apply path this
    /// is the leader's clock from the log record, so replicas agree.
    pub now_ms: u64,
}

impl HandlerContext {
    pub fn lock_ctx(&self) -> LockCtx {
        LockCtx {
            cancel: self.cancel.clone(),
            deadline: None,
        }
    }
}

#[derive(Debug)]
pub enum CommandKind {
    Builtin {
        key_extract: KeyExtractFn,
        handler: HandlerFn,
    },
    Script(Arc<ScriptCommand>),
}

#[derive(Debug)]
pub struct SubCommand {
    pub name: String,
    pub categories: Vec<String>,
    pub description: String,
    pub sync: bool,
}

#[derive(Debug)]
pub struct Command {
    pub name: String,
    pub categories: Vec<String>,
    pub description: String,
    /// Whether the command must go through the replicated log when clustered.
    pub sync: bool,
    pub subcommands: Vec<SubCommand>,
    pub kind: CommandKind,
}

impl Command {
    pub fn builtin(
        name: &str,
        categories: &[&str],
        description: &str,
        sync: bool,
        key_extract: KeyExtractFn,
        handler: HandlerFn,
    ) -> Self {
        Command {
            name: name.to_string(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            description: description.to_string(),
            sync,
            subcommands: Vec::new(),
            kind: CommandKind::Builtin {
                key_extract,
                handler,
            },
        }
    }

    pub fn with_subcommands(mut self, subcommands: Vec<SubCommand>) -> Self {
        self.subcommands = subcommands;
        self
    }

    pub fn extract_keys(&self, raw: &[String]) -> MurexResult<ExtractedKeys> {
        match &self.kind {
            CommandKind::Builtin { key_extract, .. } => key_extract(raw),
            CommandKind::Script(script) => script.extract_keys(raw),
        }
    }

    pub async fn handle(&self, ctx: HandlerContext, raw: Vec<String>) -> MurexResult<Vec<u8>> {
        match &self.kind {
            CommandKind::Builtin { handler, .. } => handler(ctx, raw).await,
            CommandKind::Script(script) => script.handle(ctx, raw).await,
        }
    }

    /// The subcommand record matching `raw`'s second token, if any.
    pub fn resolve_subcommand(&self, raw: &[String]) -> Option<&SubCommand> {
        let token = raw.get(1)?;
        self.subcommands
            .iter()
            .find(|sub| sub.name.eq_ignore_ascii_case(token))
    }
}

/// Name → command map with case-insensitive lookup. Later registrations for
/// the same name override earlier ones, which is what lets a loaded module
/// shadow a built-in.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry::default()
    }

    pub fn register(&mut self, command: Command) {
        self.commands
            .insert(command.name.to_lowercase(), Arc::new(command));
    }

    pub fn register_all(&mut self, commands: Vec<Command>) {
        for command in commands {
            self.register(command);
        }
    }

    pub fn lookup(&self, name: &str) -> MurexResult<Arc<Command>> {
        self.commands
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| MurexError::UnknownCommand(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Register every built-in module. Script modules load afterwards, so a
/// module file can shadow any of these names.
pub fn register_builtins(registry: &mut CommandRegistry) {
    registry.register_all(acl_cmd::commands());
    registry.register_all(pubsub_cmd::commands());
    registry.register_all(ping::commands());
    registry.register_all(string::commands());
    registry.register_all(generic::commands());
    registry.register_all(list::commands());
    registry.register_all(hash::commands());
    registry.register_all(set::commands());
    registry.register_all(sorted_set::commands());
}

// ---- shared argument helpers --------------------------------------------

pub(crate) fn arity(raw: &[String], at_least: usize, name: &str) -> MurexResult<()> {
    if raw.len() < at_least {
        return Err(MurexError::WrongArity(name.to_lowercase()));
    }
    Ok(())
}

pub(crate) fn exact_arity(raw: &[String], expected: usize, name: &str) -> MurexResult<()> {
    if raw.len() != expected {
        return Err(MurexError::WrongArity(name.to_lowercase()));
    }
    Ok(())
}

pub(crate) fn arg_i64(raw: &[String], idx: usize) -> MurexResult<i64> {
    raw.get(idx)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MurexError::generic("value is not an integer or out of range"))
}

pub(crate) fn arg_f64(raw: &[String], idx: usize) -> MurexResult<f64> {
    raw.get(idx)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MurexError::generic("value is not a valid float"))
}

/// Render a score the way clients expect: integral scores without the
/// fraction.
pub(crate) fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}
