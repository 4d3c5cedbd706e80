//! Pub/sub commands.
//!
//! SUBSCRIBE and friends write no direct reply: their confirmations travel
//! through the connection's delivery queue, so the first reads after a
//! subscription are the per-channel confirmations in order.

use super::{arity, category, exact_arity, Command, ExtractedKeys, HandlerContext, HandlerFuture, SubCommand};
use crate::error::{MurexError, MurexResult};
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "SUBSCRIBE",
            &[category::PUBSUB, category::CONNECTION],
            "Subscribe to channels",
            false,
            channel_args,
            cmd_subscribe,
        ),
        Command::builtin(
            "UNSUBSCRIBE",
            &[category::PUBSUB, category::CONNECTION],
            "Unsubscribe from channels, or all of them",
            false,
            no_keys,
            cmd_unsubscribe,
        ),
        Command::builtin(
            "PSUBSCRIBE",
            &[category::PUBSUB, category::CONNECTION],
            "Subscribe to channel patterns",
            false,
            channel_args,
            cmd_psubscribe,
        ),
        Command::builtin(
            "PUNSUBSCRIBE",
            &[category::PUBSUB, category::CONNECTION],
            "Unsubscribe from patterns, or all of them",
            false,
            no_keys,
            cmd_punsubscribe,
        ),
        Command::builtin(
            "PUBLISH",
            &[category::PUBSUB, category::FAST],
            "Publish a message to a channel",
            false,
            publish_args,
            cmd_publish,
        ),
        Command::builtin(
            "PUBSUB",
            &[category::PUBSUB, category::SLOW],
            "Pub/sub state introspection",
            false,
            no_keys,
            cmd_pubsub,
        )
        .with_subcommands(vec![
            sub("CHANNELS", "Channels with at least one subscriber"),
            sub("NUMSUB", "Subscriber counts for the given channels"),
            sub("NUMPAT", "Number of pattern subscriptions"),
        ]),
    ]
}

fn sub(name: &str, description: &str) -> SubCommand {
    SubCommand {
        name: name.to_string(),
        categories: vec![category::PUBSUB.to_string(), category::SLOW.to_string()],
        description: description.to_string(),
        sync: false,
    }
}

fn no_keys(_raw: &[String]) -> MurexResult<ExtractedKeys> {
    Ok(ExtractedKeys::none())
}

fn channel_args(raw: &[String]) -> MurexResult<ExtractedKeys> {
    arity(raw, 2, &raw[0])?;
    Ok(ExtractedKeys::none())
}

fn publish_args(raw: &[String]) -> MurexResult<ExtractedKeys> {
    exact_arity(raw, 3, "PUBLISH")?;
    Ok(ExtractedKeys::none())
}

fn delivery_queue(ctx: &HandlerContext) -> MurexResult<crate::pubsub::PubSubSender> {
    ctx.conn
        .pubsub_tx
        .clone()
        .ok_or_else(|| MurexError::generic("subscriptions are not available in this context"))
}

fn cmd_subscribe(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let sender = delivery_queue(&ctx)?;
        ctx.pubsub
            .write()
            .await
            .subscribe(ctx.conn.id, &raw[1..], sender);
        Ok(Vec::new())
    })
}

fn cmd_unsubscribe(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        ctx.pubsub.write().await.unsubscribe(ctx.conn.id, &raw[1..]);
        Ok(Vec::new())
    })
}

fn cmd_psubscribe(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let sender = delivery_queue(&ctx)?;
        ctx.pubsub
            .write()
            .await
            .psubscribe(ctx.conn.id, &raw[1..], sender);
        Ok(Vec::new())
    })
}

fn cmd_punsubscribe(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        ctx.pubsub
            .write()
            .await
            .punsubscribe(ctx.conn.id, &raw[1..]);
        Ok(Vec::new())
    })
}

fn cmd_publish(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let delivered = ctx.pubsub.read().await.publish(&raw[1], &raw[2]);
        Ok(Reply::Integer(delivered as i64).serialize())
    })
}

fn cmd_pubsub(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let sub = raw.get(1).map(|s| s.to_uppercase()).unwrap_or_default();
        let pubsub = ctx.pubsub.read().await;
        match sub.as_str() {
            "CHANNELS" => {
                let names = pubsub
                    .channels_matching(raw.get(2).map(String::as_str))
                    .into_iter()
                    .map(Reply::bulk)
                    .collect();
                Ok(Reply::Array(names).serialize())
            }
            "NUMSUB" => {
                let mut replies = Vec::new();
                for channel in &raw[2..] {
                    replies.push(Reply::bulk(channel.as_bytes()));
                    replies.push(Reply::Integer(pubsub.subscriber_count(channel) as i64));
                }
                Ok(Reply::Array(replies).serialize())
            }
            "NUMPAT" => Ok(Reply::Integer(pubsub.pattern_count() as i64).serialize()),
            _ => Err(MurexError::generic(format!(
                "unknown PUBSUB subcommand {}",
                raw.get(1).map(String::as_str).unwrap_or("")
            ))),
        }
    })
}
