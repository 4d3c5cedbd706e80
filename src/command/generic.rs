//! Key lifecycle commands: deletion, existence, expiry.
//!
//! TTL decisions read `ctx.now_ms`, never the wall clock, so the same command
//! applied on every replica makes the same decision.

use super::{arity, category, exact_arity, Command, ExtractedKeys, HandlerContext, HandlerFuture};
use crate::error::MurexResult;
use crate::keyspace::Value;
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "DEL",
            &[category::WRITE, category::KEYSPACE, category::SLOW],
            "Delete one or more keys",
            true,
            multi_write_keys,
            cmd_del,
        ),
        Command::builtin(
            "EXISTS",
            &[category::READ, category::KEYSPACE, category::FAST],
            "Count how many of the given keys exist",
            false,
            multi_read_keys,
            cmd_exists,
        ),
        Command::builtin(
            "TYPE",
            &[category::READ, category::KEYSPACE, category::FAST],
            "Type of a key's value",
            false,
            one_read_key,
            cmd_type,
        ),
        Command::builtin(
            "EXPIRE",
            &[category::WRITE, category::KEYSPACE, category::FAST],
            "Set a key's lifetime in seconds",
            true,
            expire_keys,
            cmd_expire,
        ),
        Command::builtin(
            "PEXPIRE",
            &[category::WRITE, category::KEYSPACE, category::FAST],
            "Set a key's lifetime in milliseconds",
            true,
            expire_keys,
            cmd_pexpire,
        ),
        Command::builtin(
            "TTL",
            &[category::READ, category::KEYSPACE, category::FAST],
            "Remaining lifetime in seconds",
            false,
            one_read_key,
            cmd_ttl,
        ),
        Command::builtin(
            "PTTL",
            &[category::READ, category::KEYSPACE, category::FAST],
            "Remaining lifetime in milliseconds",
            false,
            one_read_key,
            cmd_pttl,
        ),
        Command::builtin(
            "PERSIST",
            &[category::WRITE, category::KEYSPACE, category::FAST],
            "Drop a key's expiry",
            true,
            persist_keys,
            cmd_persist,
        ),
    ]
}

fn multi_write_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::writes(raw[1..].to_vec()))
}

fn multi_read_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::reads(raw[1..].to_vec()))
}

fn one_read_key(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn expire_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 3, &raw[0])?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn persist_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 2, "PERSIST")?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn cmd_del(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let mut deleted = 0i64;
        for key in &raw[1..] {
            if ctx.keyspace.delete(&ctx.lock_ctx(), ctx.now_ms, key).await? {
                deleted += 1;
            }
        }
        Ok(Reply::Integer(deleted).serialize())
    })
}

fn cmd_exists(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..])
            .await?;
        // Count repeats the way clients expect: one per argument, not per key.
        let count = raw[1..]
            .iter()
            .filter(|k| values.get(*k).is_some_and(|v| v.is_some()))
            .count();
        Ok(Reply::Integer(count as i64).serialize())
    })
}

fn cmd_type(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        let name = values
            .get(&raw[1])
            .and_then(|v| v.as_ref())
            .map_or("none", Value::type_name);
        Ok(Reply::Simple(name.to_string()).serialize())
    })
}

fn cmd_expire(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let seconds = super::arg_i64(&raw, 2)?;
        apply_expiry(&ctx, &raw[1], seconds.saturating_mul(1000)).await
    })
}

fn cmd_pexpire(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let millis = super::arg_i64(&raw, 2)?;
        apply_expiry(&ctx, &raw[1], millis).await
    })
}

async fn apply_expiry(ctx: &HandlerContext, key: &str, delta_ms: i64) -> MurexResult<Vec<u8>> {
    if !ctx.keyspace.exists(key) {
        return Ok(Reply::Integer(0).serialize());
    }
    let now_ms = ctx.now_ms;
    let updated = ctx
        .keyspace
        .update(&ctx.lock_ctx(), now_ms, key, |slot| {
            if slot.is_none() {
                return false;
            }
            if delta_ms <= 0 {
                // A non-positive lifetime deletes the key outright.
                *slot = None;
            } else if let Some(entry) = slot.as_mut() {
                entry.expires_at = Some(now_ms + delta_ms as u64);
            }
            true
        })
        .await?;
    Ok(Reply::Integer(updated as i64).serialize())
}

fn cmd_ttl(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let millis = remaining_millis(&ctx, &raw[1]).await?;
        let seconds = if millis < 0 {
            millis
        } else {
            // Round up so a key with any lifetime left never reports 0.
            (millis + 999) / 1000
        };
        Ok(Reply::Integer(seconds).serialize())
    })
}

fn cmd_pttl(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let millis = remaining_millis(&ctx, &raw[1]).await?;
        Ok(Reply::Integer(millis).serialize())
    })
}

async fn remaining_millis(ctx: &HandlerContext, key: &str) -> MurexResult<i64> {
    if !ctx.keyspace.exists(key) {
        return Ok(-2);
    }
    let guard = match ctx.keyspace.rlock(&ctx.lock_ctx(), key).await {
        Ok(guard) => guard,
        Err(crate::error::MurexError::NoSuchKey) => return Ok(-2),
        Err(e) => return Err(e),
    };
    Ok(guard.entry(ctx.now_ms).map_or(-2, |e| e.ttl_millis(ctx.now_ms)))
}

fn cmd_persist(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        if !ctx.keyspace.exists(&raw[1]) {
            return Ok(Reply::Integer(0).serialize());
        }
        let dropped = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], |slot| match slot {
                Some(entry) if entry.expires_at.is_some() => {
                    entry.expires_at = None;
                    true
                }
                _ => false,
            })
            .await?;
        Ok(Reply::Integer(dropped as i64).serialize())
    })
}
