//! AUTH and the ACL introspection subcommands.

use super::{category, Command, ExtractedKeys, HandlerContext, HandlerFuture, SubCommand};
use crate::error::{MurexError, MurexResult};
use crate::resp::Reply;

pub fn commands() -> Vec<Command> {
    vec![
        Command::builtin(
            "AUTH",
            &[category::CONNECTION, category::FAST],
            "Authenticate the connection as a user",
            false,
            auth_keys,
            cmd_auth,
        ),
        Command::builtin(
            "ACL",
            &[category::ADMIN, category::SLOW],
            "Access control introspection",
            false,
            no_keys,
            cmd_acl,
        )
        .with_subcommands(vec![
            sub("WHOAMI", "Name of the connection's current user"),
            sub("LIST", "Describe every configured user"),
            sub("USERS", "List configured usernames"),
        ]),
    ]
}

fn sub(name: &str, description: &str) -> SubCommand {
    SubCommand {
        name: name.to_string(),
        categories: vec![category::ADMIN.to_string(), category::SLOW.to_string()],
        description: description.to_string(),
        sync: false,
    }
}

fn no_keys(_raw: &[String]) -> MurexResult<ExtractedKeys> {
    Ok(ExtractedKeys::none())
}

fn auth_keys(raw: &[String]) -> MurexResult<ExtractedKeys> {
    if raw.len() != 2 && raw.len() != 3 {
        return Err(MurexError::WrongArity("auth".to_string()));
    }
    Ok(ExtractedKeys::none())
}

fn cmd_auth(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let (username, password) = match raw.len() {
            // A bare password authenticates against the default user.
            2 => (crate::acl::DEFAULT_USER, raw[1].as_str()),
            _ => (raw[1].as_str(), raw[2].as_str()),
        };
        ctx.acl.authenticate(ctx.conn.id, username, password)?;
        Ok(Reply::ok().serialize())
    })
}

fn cmd_acl(ctx: HandlerContext, raw: Vec<String>) -> HandlerFuture {
    Box::pin(async move {
        let sub = raw
            .get(1)
            .map(|s| s.to_uppercase())
            .unwrap_or_default();
        match sub.as_str() {
            "WHOAMI" => Ok(Reply::bulk(ctx.acl.whoami(ctx.conn.id)).serialize()),
            "LIST" => {
                let lines = ctx
                    .acl
                    .describe_users()
                    .into_iter()
                    .map(Reply::bulk)
                    .collect();
                Ok(Reply::Array(lines).serialize())
            }
            "USERS" => {
                let names = ctx.acl.usernames().into_iter().map(Reply::bulk).collect();
                Ok(Reply::Array(names).serialize())
            }
            _ => Err(MurexError::generic(format!(
                "unknown ACL subcommand {}",
                raw.get(1).map(String::as_str).unwrap_or("")
            ))),
        }
    })
}
