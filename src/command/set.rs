//! Set commands.

use std::collections::HashSet;

use super::{arity, category, exact_arity, Command, ExtractedKeys, HandlerContext, HandlerFuture};
use crate::error::{MurexError, MurexResult};
use crate::keyspace::{Entry, Value};
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "SADD",
            &[category::WRITE, category::SET, category::FAST],
            "Add members to a set",
            true,
            member_write_keys,
            cmd_sadd,
        ),
        Command::builtin(
            "SREM",
            &[category::WRITE, category::SET, category::FAST],
            "Remove members from a set",
            true,
            member_write_keys,
            cmd_srem,
        ),
        Command::builtin(
            "SMEMBERS",
            &[category::READ, category::SET, category::SLOW],
            "All members of a set",
            false,
            one_read_key,
            cmd_smembers,
        ),
        Command::builtin(
            "SCARD",
            &[category::READ, category::SET, category::FAST],
            "Cardinality of a set",
            false,
            one_read_key,
            cmd_scard,
        ),
        Command::builtin(
            "SISMEMBER",
            &[category::READ, category::SET, category::FAST],
            "Whether a member is in a set",
            false,
            sismember_keys,
            cmd_sismember,
        ),
    ]
}

fn member_write_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    arity(raw, 3, &raw[0])?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn one_read_key(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn sismember_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 3, "SISMEMBER")?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn cmd_sadd(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let members: Vec<Vec<u8>> = raw[2..].iter().map(|m| m.clone().into_bytes()).collect();
        let added = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], move |slot| {
                let entry = slot.get_or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
                let Value::Set(set) = &mut entry.value else {
                    return Err(MurexError::WrongType);
                };
                let mut added = 0i64;
                for m in members {
                    if set.insert(m) {
                        added += 1;
                    }
                }
                Ok(added)
            })
            .await??;
        Ok(Reply::Integer(added).serialize())
    })
}

fn cmd_srem(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if !ctx.keyspace.exists(&raw[1]) {
            return Ok(Reply::Integer(0).serialize());
        }
        let members: Vec<Vec<u8>> = raw[2..].iter().map(|m| m.clone().into_bytes()).collect();
        let removed = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], move |slot| {
                let Some(entry) = slot else {
                    return Ok(0i64);
                };
                let Value::Set(set) = &mut entry.value else {
                    return Err(MurexError::WrongType);
                };
                let mut removed = 0i64;
                for m in &members {
                    if set.remove(m) {
                        removed += 1;
                    }
                }
                if set.is_empty() {
                    *slot = None;
                }
                Ok(removed)
            })
            .await??;
        Ok(Reply::Integer(removed).serialize())
    })
}

fn cmd_smembers(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Array(Vec::new()).serialize()),
            Some(Value::Set(set)) => {
                let mut members: Vec<&Vec<u8>> = set.iter().collect();
                members.sort();
                let replies = members.into_iter().map(|m| Reply::bulk(m.clone())).collect();
                Ok(Reply::Array(replies).serialize())
            }
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_scard(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Integer(0).serialize()),
            Some(Value::Set(set)) => Ok(Reply::Integer(set.len() as i64).serialize()),
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_sismember(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Integer(0).serialize()),
            Some(Value::Set(set)) => {
                Ok(Reply::Integer(set.contains(raw[2].as_bytes()) as i64).serialize())
            }
            Some(_) => Err(MurexError::WrongType),
        }
    })
}
