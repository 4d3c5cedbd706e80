//! Hash commands.

use std::collections::HashMap;

use super::{arity, category, exact_arity, Command, ExtractedKeys, HandlerContext, HandlerFuture};
use crate::error::{MurexError, MurexResult};
use crate::keyspace::{Entry, Value};
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "HSET",
            &[category::WRITE, category::HASH, category::FAST],
            "Set hash fields",
            true,
            hset_keys,
            cmd_hset,
        ),
        Command::builtin(
            "HGET",
            &[category::READ, category::HASH, category::FAST],
            "Get one hash field",
            false,
            field_read_keys,
            cmd_hget,
        ),
        Command::builtin(
            "HDEL",
            &[category::WRITE, category::HASH, category::FAST],
            "Delete hash fields",
            true,
            hdel_keys,
            cmd_hdel,
        ),
        Command::builtin(
            "HEXISTS",
            &[category::READ, category::HASH, category::FAST],
            "Whether a hash field exists",
            false,
            field_read_keys,
            cmd_hexists,
        ),
        Command::builtin(
            "HLEN",
            &[category::READ, category::HASH, category::FAST],
            "Number of fields in a hash",
            false,
            one_read_key,
            cmd_hlen,
        ),
        Command::builtin(
            "HGETALL",
            &[category::READ, category::HASH, category::SLOW],
            "All fields and values of a hash",
            false,
            one_read_key,
            cmd_hgetall,
        ),
    ]
}

fn hset_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    if raw.len() < 4 || raw.len() % 2 != 0 {
        return Err(MurexError::WrongArity("hset".to_string()));
    }
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn hdel_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    arity(raw, 3, "HDEL")?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn field_read_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 3, &raw[0])?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn one_read_key(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn cmd_hset(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let pairs: Vec<(String, Vec<u8>)> = raw[2..]
            .chunks(2)
            .map(|p| (p[0].clone(), p[1].clone().into_bytes()))
            .collect();
        let added = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], move |slot| {
                let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
                let Value::Hash(hash) = &mut entry.value else {
                    return Err(MurexError::WrongType);
                };
                let mut added = 0i64;
                for (field, value) in pairs {
                    if hash.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                Ok(added)
            })
            .await??;
        Ok(Reply::Integer(added).serialize())
    })
}

fn cmd_hget(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::null().serialize()),
            Some(Value::Hash(hash)) => match hash.get(&raw[2]) {
                Some(v) => Ok(Reply::bulk(v.clone()).serialize()),
                None => Ok(Reply::null().serialize()),
            },
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_hdel(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if !ctx.keyspace.exists(&raw[1]) {
            return Ok(Reply::Integer(0).serialize());
        }
        let fields = raw[2..].to_vec();
        let removed = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], move |slot| {
                let Some(entry) = slot else {
                    return Ok(0i64);
                };
                let Value::Hash(hash) = &mut entry.value else {
                    return Err(MurexError::WrongType);
                };
                let mut removed = 0i64;
                for field in &fields {
                    if hash.remove(field).is_some() {
                        removed += 1;
                    }
                }
                if hash.is_empty() {
                    *slot = None;
                }
                Ok(removed)
            })
            .await??;
        Ok(Reply::Integer(removed).serialize())
    })
}

fn cmd_hexists(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Integer(0).serialize()),
            Some(Value::Hash(hash)) => {
                Ok(Reply::Integer(hash.contains_key(&raw[2]) as i64).serialize())
            }
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_hlen(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Integer(0).serialize()),
            Some(Value::Hash(hash)) => Ok(Reply::Integer(hash.len() as i64).serialize()),
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_hgetall(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Array(Vec::new()).serialize()),
            Some(Value::Hash(hash)) => {
                // Sorted so the reply is stable across runs.
                let mut fields: Vec<&String> = hash.keys().collect();
                fields.sort();
                let mut replies = Vec::with_capacity(fields.len() * 2);
                for field in fields {
                    replies.push(Reply::bulk(field.as_bytes()));
                    replies.push(Reply::bulk(hash[field].clone()));
                }
                Ok(Reply::Array(replies).serialize())
            }
            Some(_) => Err(MurexError::WrongType),
        }
    })
}
