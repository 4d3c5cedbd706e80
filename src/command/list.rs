//! List commands.

use super::{arity, category, exact_arity, Command, ExtractedKeys, HandlerContext, HandlerFuture};
use crate::error::{MurexError, MurexResult};
use crate::keyspace::{Entry, Value};
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "LPUSH",
            &[category::WRITE, category::LIST, category::FAST],
            "Prepend values to a list",
            true,
            push_keys,
            cmd_lpush,
        ),
        Command::builtin(
            "RPUSH",
            &[category::WRITE, category::LIST, category::FAST],
            "Append values to a list",
            true,
            push_keys,
            cmd_rpush,
        ),
        Command::builtin(
            "LPOP",
            &[category::WRITE, category::LIST, category::FAST],
            "Pop from the head of a list",
            true,
            pop_keys,
            cmd_lpop,
        ),
        Command::builtin(
            "RPOP",
            &[category::WRITE, category::LIST, category::FAST],
            "Pop from the tail of a list",
            true,
            pop_keys,
            cmd_rpop,
        ),
        Command::builtin(
            "LLEN",
            &[category::READ, category::LIST, category::FAST],
            "Length of a list",
            false,
            pop_keys_read,
            cmd_llen,
        ),
        Command::builtin(
            "LRANGE",
            &[category::READ, category::LIST, category::SLOW],
            "Slice of a list by rank",
            false,
            lrange_keys,
            cmd_lrange,
        ),
    ]
}

fn push_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    arity(raw, 3, &raw[0])?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn pop_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn pop_keys_read(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn lrange_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 4, "LRANGE")?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn push(ctx: HandlerContext, raw: Vec<String>, front: bool) -> HandlerFuture {
    Box::pin(async move {
        let values: Vec<Vec<u8>> = raw[2..].iter().map(|s| s.clone().into_bytes()).collect();
        let len = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], move |slot| {
                let entry = slot.get_or_insert_with(|| Entry::new(Value::List(Vec::new())));
                let Value::List(list) = &mut entry.value else {
                    return Err(MurexError::WrongType);
                };
                for v in values {
                    if front {
                        list.insert(0, v);
                    } else {
                        list.push(v);
                    }
                }
                Ok(list.len() as i64)
            })
            .await??;
        Ok(Reply::Integer(len).serialize())
    })
}

fn cmd_lpush(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    push(ctx, raw, true)
}

fn cmd_rpush(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    push(ctx, raw, false)
}

fn pop(ctx: HandlerContext, raw: Vec<String>, front: bool) -> HandlerFuture {
    Box::pin(async move {
        if !ctx.keyspace.exists(&raw[1]) {
            return Ok(Reply::null().serialize());
        }
        let popped = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], |slot| {
                let Some(entry) = slot else {
                    return Ok(None);
                };
                let Value::List(list) = &mut entry.value else {
                    return Err(MurexError::WrongType);
                };
                let popped = if list.is_empty() {
                    None
                } else if front {
                    Some(list.remove(0))
                } else {
                    list.pop()
                };
                if list.is_empty() {
                    *slot = None;
                }
                Ok(popped)
            })
            .await??;
        match popped {
            Some(v) => Ok(Reply::bulk(v).serialize()),
            None => Ok(Reply::null().serialize()),
        }
    })
}

fn cmd_lpop(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    pop(ctx, raw, true)
}

fn cmd_rpop(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    pop(ctx, raw, false)
}

fn cmd_llen(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Integer(0).serialize()),
            Some(Value::List(list)) => Ok(Reply::Integer(list.len() as i64).serialize()),
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_lrange(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let start = super::arg_i64(&raw, 2)?;
        let stop = super::arg_i64(&raw, 3)?;
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        let list = match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => return Ok(Reply::Array(Vec::new()).serialize()),
            Some(Value::List(list)) => list,
            Some(_) => return Err(MurexError::WrongType),
        };

        let (start, stop) = range_bounds(start, stop, list.len());
        let replies = list[start..stop]
            .iter()
            .map(|v| Reply::bulk(v.clone()))
            .collect();
        Ok(Reply::Array(replies).serialize())
    })
}

/// Clamp a possibly-negative start/stop pair to a valid, inclusive-to-
/// exclusive slice over `len` elements.
pub(crate) fn range_bounds(start: i64, stop: i64, len: usize) -> (usize, usize) {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.clamp(0, len);
    stop = stop.clamp(-1, len - 1);
    if start > stop {
        return (0, 0);
    }
    (start as usize, (stop + 1) as usize)
}

#[cfg(test)]
mod tests {
    use super::range_bounds;

    #[test]
    fn range_normalization() {
        assert_eq!(range_bounds(0, -1, 4), (0, 4));
        assert_eq!(range_bounds(1, 2, 4), (1, 3));
        assert_eq!(range_bounds(-2, -1, 4), (2, 4));
        assert_eq!(range_bounds(3, 1, 4), (0, 0));
        assert_eq!(range_bounds(0, 99, 4), (0, 4));
        assert_eq!(range_bounds(0, -1, 0), (0, 0));
    }
}
