//! Scripted command modules.
//!
//! A module is a Lua file that defines a `command` table:
//!
//! ```lua
//! command = {
//!     name = "module.set",
//!     categories = { "write", "fast" },
//!     description = "Set a key through a module",
//!     sync = true,
//!     key_extract = function(cmd)
//!         return { read = {}, write = { cmd[2] } }
//!     end,
//!     handler = function(cmd, keys_exist, get_value, set_value)
//!         set_value(cmd[2], tonumber(cmd[3]))
//!         return "+OK\r\n"
//!     end,
//! }
//! ```
//!
//! The handler sees the raw argument vector and the same `keys_exist` /
//! `get_value` / `set_value` surface built-in modules use; values it reads
//! are fetched under read locks before the interpreter runs, and values it
//! sets are written under write locks after it returns, so a script can
//! never hold the interpreter across a lock. Each invocation runs in a
//! fresh, short-lived interpreter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use mlua::prelude::*;

use crate::command::{Command, CommandKind, ExtractedKeys, HandlerContext};
use crate::error::{MurexError, MurexResult};
use crate::keyspace::{Entry, Value};

#[derive(Debug)]
pub struct ScriptCommand {
    pub name: String,
    source: String,
}

impl ScriptCommand {
    /// Load and validate a module file, producing a registrable command.
    pub fn load(path: impl AsRef<Path>) -> MurexResult<Command> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;

        let lua = Lua::new();
        let table = eval_command_table(&lua, &source)
            .map_err(|e| MurexError::BadModule(format!("{}: {e}", path.display())))?;

        let name: String = table
            .get("name")
            .map_err(|_| MurexError::BadModule(format!("{}: missing name", path.display())))?;
        let categories: Vec<String> = match table.get::<LuaValue>("categories") {
            Ok(LuaValue::Table(t)) => table_to_strings(&t)
                .map_err(|e| MurexError::BadModule(format!("{}: {e}", path.display())))?,
            _ => Vec::new(),
        };
        let description: String = table.get("description").unwrap_or_default();
        let sync: bool = table.get("sync").unwrap_or(false);

        for func in ["key_extract", "handler"] {
            if table.get::<LuaFunction>(func).is_err() {
                return Err(MurexError::BadModule(format!(
                    "{}: {func} must be a function",
                    path.display()
                )));
            }
        }

        Ok(Command {
            name: name.clone(),
            categories,
            description,
            sync,
            subcommands: Vec::new(),
            kind: CommandKind::Script(Arc::new(ScriptCommand { name, source })),
        })
    }

    pub fn extract_keys(&self, raw: &[String]) -> MurexResult<ExtractedKeys> {
        let lua = Lua::new();
        let table = eval_command_table(&lua, &self.source)
            .map_err(|e| MurexError::generic(format!("module {}: {e}", self.name)))?;
        let extract: LuaFunction = table
            .get("key_extract")
            .map_err(|e| MurexError::generic(format!("module {}: {e}", self.name)))?;

        let args = args_table(&lua, raw).map_err(|e| lua_error(&self.name, e))?;
        let result: LuaTable = extract.call(args).map_err(|e| lua_error(&self.name, e))?;

        let read = match result.get::<LuaValue>("read") {
            Ok(LuaValue::Table(t)) => table_to_strings(&t).map_err(|e| lua_error(&self.name, e))?,
            _ => Vec::new(),
        };
        let write = match result.get::<LuaValue>("write") {
            Ok(LuaValue::Table(t)) => table_to_strings(&t).map_err(|e| lua_error(&self.name, e))?,
            _ => Vec::new(),
        };
        Ok(ExtractedKeys { read, write })
    }

    pub async fn handle(&self, ctx: HandlerContext, raw: Vec<String>) -> MurexResult<Vec<u8>> {
        let keys = self.extract_keys(&raw)?;

        // Everything the script may touch is fetched under read locks before
        // the interpreter starts and written under write locks after it
        // finishes, so the interpreter itself never spans a suspension point.
        let mut prefetch = keys.read.clone();
        for key in &keys.write {
            if !prefetch.contains(key) {
                prefetch.push(key.clone());
            }
        }
        let exists = ctx.keyspace.keys_exist(&prefetch);
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &prefetch)
            .await?;

        let (reply, writes) = self.run(&raw, exists, values)?;

        let entries = writes
            .into_iter()
            .map(|(key, value)| (key, Entry::new(value)))
            .collect();
        ctx.keyspace.set_values(&ctx.lock_ctx(), entries).await?;
        Ok(reply)
    }

    fn run(
        &self,
        raw: &[String],
        exists: HashMap<String, bool>,
        values: HashMap<String, Option<Value>>,
    ) -> MurexResult<(Vec<u8>, Vec<(String, Value)>)> {
        let lua = Lua::new();
        let table =
            eval_command_table(&lua, &self.source).map_err(|e| lua_error(&self.name, e))?;
        let handler: LuaFunction = table
            .get("handler")
            .map_err(|e| lua_error(&self.name, e))?;

        let writes: Rc<RefCell<Vec<(String, Value)>>> = Rc::new(RefCell::new(Vec::new()));

        let keys_exist = lua
            .create_function(move |_, key: String| Ok(exists.get(&key).copied().unwrap_or(false)))
            .map_err(|e| lua_error(&self.name, e))?;

        let get_value = lua
            .create_function(move |lua, key: String| {
                value_to_lua(lua, values.get(&key).and_then(|v| v.as_ref()))
            })
            .map_err(|e| lua_error(&self.name, e))?;

        let write_log = Rc::clone(&writes);
        let set_value = lua
            .create_function(move |_, (key, value): (String, LuaValue)| {
                let value = lua_to_value(value)?;
                write_log.borrow_mut().push((key, value));
                Ok(())
            })
            .map_err(|e| lua_error(&self.name, e))?;

        let cmd = args_table(&lua, raw).map_err(|e| lua_error(&self.name, e))?;
        let result: LuaValue = handler
            .call((cmd, keys_exist, get_value, set_value))
            .map_err(|e| lua_error(&self.name, e))?;

        let reply = match result {
            LuaValue::String(s) => s.as_bytes().to_vec(),
            other => {
                return Err(MurexError::generic(format!(
                    "module {} handler returned {} instead of a reply string",
                    self.name,
                    other.type_name()
                )))
            }
        };
        let writes = writes.borrow().clone();
        Ok((reply, writes))
    }
}

fn eval_command_table(lua: &Lua, source: &str) -> LuaResult<LuaTable> {
    lua.load(source).exec()?;
    lua.globals().get("command")
}

fn args_table(lua: &Lua, raw: &[String]) -> LuaResult<LuaTable> {
    let table = lua.create_table()?;
    for (i, arg) in raw.iter().enumerate() {
        table.set(i + 1, lua.create_string(arg.as_bytes())?)?;
    }
    Ok(table)
}

fn table_to_strings(table: &LuaTable) -> LuaResult<Vec<String>> {
    let mut out = Vec::with_capacity(table.raw_len());
    for i in 1..=table.raw_len() {
        let s: LuaString = table.get(i)?;
        out.push(String::from_utf8_lossy(&s.as_bytes()).into_owned());
    }
    Ok(out)
}

fn lua_error(module: &str, err: LuaError) -> MurexError {
    MurexError::generic(format!("module {module}: {err}"))
}

/// Stored value → Lua value, for `get_value`.
fn value_to_lua(lua: &Lua, value: Option<&Value>) -> LuaResult<LuaValue> {
    match value {
        None => Ok(LuaValue::Nil),
        Some(Value::Int(n)) => Ok(LuaValue::Integer(*n)),
        Some(Value::Str(s)) => Ok(LuaValue::String(lua.create_string(s)?)),
        Some(Value::List(items)) => {
            let t = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                t.set(i + 1, lua.create_string(item)?)?;
            }
            Ok(LuaValue::Table(t))
        }
        Some(Value::Set(members)) => {
            let mut sorted: Vec<&Vec<u8>> = members.iter().collect();
            sorted.sort();
            let t = lua.create_table()?;
            for (i, member) in sorted.iter().enumerate() {
                t.set(i + 1, lua.create_string(member)?)?;
            }
            Ok(LuaValue::Table(t))
        }
        Some(Value::SortedSet(pairs)) => {
            let t = lua.create_table()?;
            for (i, (member, score)) in pairs.iter().enumerate() {
                let pair = lua.create_table()?;
                pair.set(1, lua.create_string(member)?)?;
                pair.set(2, *score)?;
                t.set(i + 1, pair)?;
            }
            Ok(LuaValue::Table(t))
        }
        Some(Value::Hash(fields)) => {
            let t = lua.create_table()?;
            for (field, value) in fields {
                t.set(field.as_str(), lua.create_string(value)?)?;
            }
            Ok(LuaValue::Table(t))
        }
    }
}

/// Lua value → stored value, for `set_value`.
fn lua_to_value(value: LuaValue) -> LuaResult<Value> {
    match value {
        LuaValue::Integer(n) => Ok(Value::Int(n)),
        LuaValue::Number(n) if n.fract() == 0.0 => Ok(Value::Int(n as i64)),
        LuaValue::Number(n) => Ok(Value::Str(n.to_string().into_bytes())),
        LuaValue::String(s) => Ok(Value::Str(s.as_bytes().to_vec())),
        LuaValue::Boolean(b) => Ok(Value::Int(b as i64)),
        LuaValue::Table(t) => {
            let mut items = Vec::with_capacity(t.raw_len());
            for i in 1..=t.raw_len() {
                let s: LuaString = t.get(i)?;
                items.push(s.as_bytes().to_vec());
            }
            Ok(Value::List(items))
        }
        other => Err(LuaError::RuntimeError(format!(
            "module set_value does not accept {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Acl;
    use crate::config::Config;
    use crate::connection::ConnInfo;
    use crate::keyspace::Keyspace;
    use crate::pubsub::PubSub;
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    const MODULE_SET: &str = r#"
command = {
    name = "module.set",
    categories = { "write", "fast" },
    description = "Set a key through a module",
    sync = true,
    key_extract = function(cmd)
        return { read = {}, write = { cmd[2] } }
    end,
    handler = function(cmd, keys_exist, get_value, set_value)
        set_value(cmd[2], tonumber(cmd[3]))
        return "+OK\r\n"
    end,
}
"#;

    fn write_module(name: &str, source: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("murex-test-{name}-{}.lua", std::process::id()));
        std::fs::write(&path, source).unwrap();
        path
    }

    fn test_ctx(keyspace: Arc<Keyspace>) -> HandlerContext {
        HandlerContext {
            keyspace,
            pubsub: Arc::new(RwLock::new(PubSub::new())),
            acl: Arc::new(Acl::new()),
            config: Arc::new(Config::default()),
            conn: ConnInfo::replayed("test-1"),
            cancel: CancellationToken::new(),
            now_ms: 0,
        }
    }

    #[test]
    fn load_validates_the_command_table() {
        let path = write_module("valid", MODULE_SET);
        let command = ScriptCommand::load(&path).unwrap();
        assert_eq!(command.name, "module.set");
        assert!(command.sync);
        assert_eq!(command.categories, vec!["write", "fast"]);
        std::fs::remove_file(path).ok();

        let path = write_module("broken", "command = { name = 'x' }");
        let err = ScriptCommand::load(&path).unwrap_err();
        assert!(matches!(err, MurexError::BadModule(_)));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn key_extraction_runs_the_script() {
        let path = write_module("extract", MODULE_SET);
        let command = ScriptCommand::load(&path).unwrap();
        let raw = vec!["MODULE.SET".to_string(), "k".to_string(), "42".to_string()];
        let keys = command.extract_keys(&raw).unwrap();
        assert!(keys.read.is_empty());
        assert_eq!(keys.write, vec!["k"]);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn handler_writes_through_the_keyspace() {
        let path = write_module("handle", MODULE_SET);
        let command = ScriptCommand::load(&path).unwrap();
        let keyspace = Arc::new(Keyspace::new());
        let ctx = test_ctx(Arc::clone(&keyspace));

        let raw = vec!["MODULE.SET".to_string(), "k".to_string(), "42".to_string()];
        let reply = command.handle(ctx.clone(), raw).await.unwrap();
        assert_eq!(reply, b"+OK\r\n");

        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), 0, &["k".to_string()])
            .await
            .unwrap();
        assert_eq!(values["k"], Some(Value::Int(42)));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn handler_reads_prefetched_values() {
        const DOUBLER: &str = r#"
command = {
    name = "module.double",
    categories = { "write" },
    sync = true,
    key_extract = function(cmd)
        return { read = { cmd[2] }, write = { cmd[2] } }
    end,
    handler = function(cmd, keys_exist, get_value, set_value)
        if not keys_exist(cmd[2]) then
            return "$-1\r\n"
        end
        local v = get_value(cmd[2])
        set_value(cmd[2], v * 2)
        return ":" .. tostring(v * 2) .. "\r\n"
    end,
}
"#;
        let path = write_module("double", DOUBLER);
        let command = ScriptCommand::load(&path).unwrap();
        let keyspace = Arc::new(Keyspace::new());
        let ctx = test_ctx(Arc::clone(&keyspace));

        keyspace
            .set_values(
                &ctx.lock_ctx(),
                vec![("n".to_string(), Entry::new(Value::Int(21)))],
            )
            .await
            .unwrap();

        let raw = vec!["MODULE.DOUBLE".to_string(), "n".to_string()];
        let reply = command.handle(ctx.clone(), raw).await.unwrap();
        assert_eq!(reply, b":42\r\n");

        let raw = vec!["MODULE.DOUBLE".to_string(), "missing".to_string()];
        let reply = command.handle(ctx, raw).await.unwrap();
        assert_eq!(reply, b"$-1\r\n");
        std::fs::remove_file(path).ok();
    }
}
