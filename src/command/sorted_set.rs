//! Sorted set commands. Members are kept ordered by score, then member.

use super::{category, exact_arity, format_score, Command, ExtractedKeys, HandlerContext, HandlerFuture};
use crate::error::{MurexError, MurexResult};
use crate::keyspace::{Entry, Value};
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "ZADD",
            &[category::WRITE, category::SORTEDSET, category::FAST],
            "Add members with scores to a sorted set",
            true,
            zadd_keys,
            cmd_zadd,
        ),
        Command::builtin(
            "ZREM",
            &[category::WRITE, category::SORTEDSET, category::FAST],
            "Remove members from a sorted set",
            true,
            zrem_keys,
            cmd_zrem,
        ),
        Command::builtin(
            "ZSCORE",
            &[category::READ, category::SORTEDSET, category::FAST],
            "Score of a member",
            false,
            member_read_keys,
            cmd_zscore,
        ),
        Command::builtin(
            "ZCARD",
            &[category::READ, category::SORTEDSET, category::FAST],
            "Cardinality of a sorted set",
            false,
            one_read_key,
            cmd_zcard,
        ),
        Command::builtin(
            "ZRANGE",
            &[category::READ, category::SORTEDSET, category::SLOW],
            "Members by rank range",
            false,
            zrange_keys,
            cmd_zrange,
        ),
    ]
}

fn zadd_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    if raw.len() < 4 || raw.len() % 2 != 0 {
        return Err(MurexError::WrongArity("zadd".to_string()));
    }
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn zrem_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    super::arity(raw, 3, "ZREM")?;
    Ok(ExtractedKeys::writes(vec![raw[1].clone()]))
}

fn member_read_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 3, &raw[0])?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn one_read_key(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn zrange_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 4, "ZRANGE")?;
    Ok(ExtractedKeys::reads(vec![raw[1].clone()]))
}

fn sort_pairs(pairs: &mut Vec<(Vec<u8>, f64)>) {
    pairs.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

fn cmd_zadd(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let mut updates = Vec::new();
        for (i, pair) in raw[2..].chunks(2).enumerate() {
            let score = super::arg_f64(&raw, 2 + i * 2)?;
            updates.push((pair[1].clone().into_bytes(), score));
        }
        let added = ctx
            .keyspace
            .update(&ctx.lock_ctx(), ctx.now_ms, &raw[1], move |slot| {
                let entry = slot.get_or_insert_with(|| Entry::new(Value::SortedSet(Vec::new())));
                let Value::SortedSet(pairs) = &mut entry.value else {
                    return Err(MurexError::WrongType);
                };
                let mut added = 0i64;
                for (member, score) in updates {
                    match pairs.iter_mut().find(|(m, _)| *m == member) {
                        Some(existing) => existing.1 = score,
                        None => {
                            pairs.push((member, score));
                            added += 1;
                        }
                    }
                }
                sort_pairs(pairs);
                Ok(added)
            })
            .await??;
        Ok(Reply::Integer(added).serialize())
    })
}

fn cmd_zrem(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
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
                let Value::SortedSet(pairs) = &mut entry.value else {
                    return Err(MurexError::WrongType);
                };
                let before = pairs.len();
                pairs.retain(|(m, _)| !members.contains(m));
                let removed = (before - pairs.len()) as i64;
                if pairs.is_empty() {
                    *slot = None;
                }
                Ok(removed)
            })
            .await??;
        Ok(Reply::Integer(removed).serialize())
    })
}

fn cmd_zscore(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::null().serialize()),
            Some(Value::SortedSet(pairs)) => {
                match pairs.iter().find(|(m, _)| m == raw[2].as_bytes()) {
                    Some((_, score)) => Ok(Reply::bulk(format_score(*score)).serialize()),
                    None => Ok(Reply::null().serialize()),
                }
            }
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_zcard(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => Ok(Reply::Integer(0).serialize()),
            Some(Value::SortedSet(pairs)) => Ok(Reply::Integer(pairs.len() as i64).serialize()),
            Some(_) => Err(MurexError::WrongType),
        }
    })
}

fn cmd_zrange(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let start = super::arg_i64(&raw, 2)?;
        let stop = super::arg_i64(&raw, 3)?;
        let values = ctx
            .keyspace
            .get_values(&ctx.lock_ctx(), ctx.now_ms, &raw[1..2])
            .await?;
        let pairs = match values.get(&raw[1]).and_then(|v| v.as_ref()) {
            None => return Ok(Reply::Array(Vec::new()).serialize()),
            Some(Value::SortedSet(pairs)) => pairs,
            Some(_) => return Err(MurexError::WrongType),
        };

        let (start, stop) = super::list::range_bounds(start, stop, pairs.len());
        let replies = pairs[start..stop]
            .iter()
            .map(|(m, _)| Reply::bulk(m.clone()))
            .collect();
        Ok(Reply::Array(replies).serialize())
    })
}
