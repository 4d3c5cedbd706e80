//! Connection liveness commands.

use super::{category, Command, ExtractedKeys, HandlerContext, HandlerFuture};
use crate::error::{MurexError, MurexResult};
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "PING",
            &[category::CONNECTION, category::FAST],
            "Ping the server, optionally echoing a message",
            false,
            no_keys,
            cmd_ping,
        ),
        Command::builtin(
            "ECHO",
            &[category::CONNECTION, category::FAST],
            "Echo the given message",
            false,
            echo_keys,
            cmd_echo,
        ),
    ]
}

fn no_keys(_raw: &[String]) -> MurexResult<ExtractedKeys> {
    Ok(ExtractedKeys::none())
}

fn echo_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    super::exact_arity(raw, 2, "ECHO")?;
    Ok(ExtractedKeys::none())
}

fn cmd_ping(_ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        match raw.len() {
            1 => Ok(Reply::Simple("PONG".to_string()).serialize()),
            2 => Ok(Reply::bulk(raw[1].as_bytes()).serialize()),
            _ => Err(MurexError::WrongArity("ping".to_string())),
        }
    })
}

fn cmd_echo(_ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move { Ok(Reply::bulk(raw[1].as_bytes()).serialize()) })
}
