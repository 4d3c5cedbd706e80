//! String commands.

use super::{arity, category, exact_arity, Command, ExtractedKeys, HandlerContext, HandlerFuture};
use crate::error::{MurexError, MurexResult};
use crate::keyspace::{Entry, Value};
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "SET",
            &[category::WRITE, category::STRING, category::FAST],
            "Set a key to a string value",
            true,
            one_write_key,
            cmd_set,
        ),
        Command::builtin(
            "SETNX",
            &[category::WRITE, category::STRING, category::FAST],
            "Set a key only when it does not exist",
            true,
            one_write_key,
            cmd_setnx,
        ),
        Command::builtin(
            "GET",
            &[category::READ, category::STRING, category::FAST],
            "Get a key's value",
            false,
            one_read_key,
            cmd_get,
        ),
        Command::builtin(
            "MSET",
            &[category::WRITE, category::STRING, category::SLOW],
            "Set several keys in one call",
            true,
            mset_keys,
            cmd_mset,
        ),
        Command::builtin(
            "MGET",
            &[category::READ, category::STRING, category::FAST],
            "Get several keys in one call",
            false,
            mget_keys,
            cmd_mget,
        ),
        Command::builtin(
            "SETRANGE",
            &[category::WRITE, category::STRING, category::SLOW],
            "Overwrite part of a string at the given offset",
            true,
            setrange_keys,
            cmd_setrange,
        ),
        Command::builtin(
            "STRLEN",
            &[category::READ, category::STRING, category::FAST],
            "Length of a key's string value",
            false,
            one_read_key,
            cmd_strlen,
        ),
    ]
}

fn one_write_key(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 3, &raw[0])?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn one_read_key(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn mset_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    if raw.len() < 3 || raw.len() % 2 != 1 {
        return Err(MurexError::WrongArity("mset".to_string()));
    }
    Ok(ExtractedKeys::writes(
        raw[1..].iter().step_by(2).cloned().collect(),
    ))
}

fn mget_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    arity(raw, 2, "MGET")?;
    Ok(ExtractedKeys::reads(raw[1..].to_vec()))
}

fn setrange_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 4, "SETRANGE")?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn cmd_set(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let entry = Entry::new(Value::Str(raw[2].clone().into_bytes()));
        ctx.keyspace
            .set_values(&ctx.lock_ctx(), vec![(raw[1].clone(), entry)])
            .await?;
        Ok(Reply::ok().serialize())
    })
}

fn cmd_setnx(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let value = raw[2].clone().into_bytes();
        let created = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], |slot| {
                if slot.is_some() {
                    false
                } else {
                    *slot = Some(Entry::new(Value::Str(value)));
                    true
                }
            })
            .await?;
        Ok(Reply::Integer(created as i64).serialize())
    })
}

fn cmd_get(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let key = &raw[1];
        if !ctx.keyspace.exists(key) {
            return Ok(Reply::null().serialize());
        }
        let guard = match ctx.keyspace.rlock(&ctx.lock_ctx(), key).await {
            Ok(guard) => guard,
            Err(MurexError::NoSuchKey) => return Ok(Reply::null().serialize()),
            Err(e) => return Err(e),
        };
        match guard.entry(ctx.now_ms).map(|e| &e.value) {
            None => Ok(Reply::null().serialize()),
            Some(Value::Str(s)) => Ok(Reply::bulk(s.clone()).serialize()),
            Some(Value::Int(n)) => Ok(Reply::Integer(*n).serialize()),
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_mset(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let entries = raw[1..]
            .chunks(2)
            .map(|pair| {
                (
                    pair[0].clone(),
                    Entry::new(Value::Str(pair[1].clone().into_bytes())),
                )
            })
            .collect();
        ctx.keyspace.set_values(&ctx.lock_ctx(), entries).await?;
        Ok(Reply::ok().serialize())
    })
}

fn cmd_mget(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let keys = raw[1..].to_vec();
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &keys)
            .await?;
        let replies = keys
            .iter()
            .map(|key| match values.get(key).and_then(|v| v.as_ref()) {
                Some(Value::Str(s)) => Reply::bulk(s.clone()),
                Some(Value::Int(n)) => Reply::bulk(n.to_string()),
                _ => Reply::null(),
            })
            .collect();
        Ok(Reply::Array(replies).serialize())
    })
}

fn cmd_setrange(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let offset = super::arg_i64(&raw, 2)?;
        if offset < 0 {
            return Err(MurexError::generic("offset is out of range"));
        }
        let offset = offset as usize;
        let patch = raw[3].clone().into_bytes();

        let result = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], |slot| {
                let (mut bytes, expires_at) = match slot.take() {
                    None => (Vec::new(), None),
                    Some(Entry {
                        value: Value::Str(s),
                        expires_at,
                    }) => (s, expires_at),
                    Some(entry) => {
                        // Leave the value untouched on a type mismatch.
                        *slot = Some(entry);
                        return Err(MurexError::WrongType);
                    }
                };
                if bytes.len() < offset + patch.len() {
                    bytes.resize(offset + patch.len(), 0);
                }
                bytes[offset..offset + patch.len()].copy_from_slice(&patch);
                let len = bytes.len();
                *slot = Some(Entry {
                    value: Value::Str(bytes),
                    expires_at,
                });
                Ok(len as i64)
            })
            .await??;
        Ok(Reply::Integer(result).serialize())
    })
}

fn cmd_strlen(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Integer(0).serialize()),
            Some(Value::Str(s)) => Ok(Reply::Integer(s.len() as i64).serialize()),
            Some(Value::Int(n)) => Ok(Reply::Integer(n.to_string().len() as i64).serialize()),
            Some(_) => Err(MurexError::WrongType),
        }
    })
}
