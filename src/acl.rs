//! Access control: per-connection identity and a pure authorization filter.
//!
//! The ACL never parses command semantics. Commands report their own read and
//! write key sets through their extraction functions, and the ACL filters
//! that output against the authenticated user's rules. Channel rules apply
//! only to the pub/sub entry points, which are recognized by name.
//!
//! Users come from an optional JSON file; the `default` user always exists
//! and, unless redefined, permits everything without a password.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::Deserialize;
use tracing::info;

use crate::command::{Command, ExtractedKeys, SubCommand};
use crate::error::{MurexError, MurexResult};
use crate::glob::glob_match;

pub const DEFAULT_USER: &str = "default";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
    pub enabled: bool,
    /// Authentication always succeeds for this user, with any password.
    pub no_password: bool,
    pub passwords: Vec<String>,
    /// Allowed ACL categories; `*` allows every category.
    pub categories: Vec<String>,
    /// Allowed command names (`name` or `name|subcommand`); `*` allows all.
    pub commands: Vec<String>,
    /// Explicit denials. A deny always wins over an allow.
    pub denied_commands: Vec<String>,
    pub read_key_patterns: Vec<String>,
    pub write_key_patterns: Vec<String>,
    pub channel_patterns: Vec<String>,
}

impl Default for User {
    fn default() -> Self {
        User {
            username: String::new(),
            enabled: true,
            no_password: false,
            passwords: Vec::new(),
            categories: Vec::new(),
            commands: Vec::new(),
            denied_commands: Vec::new(),
            read_key_patterns: Vec::new(),
            write_key_patterns: Vec::new(),
            channel_patterns: Vec::new(),
        }
    }
}

impl User {
    /// The permissive identity every connection starts with.
    pub fn default_user() -> Self {
        User {
            username: DEFAULT_USER.to_string(),
            enabled: true,
            no_password: true,
            categories: vec!["*".to_string()],
            commands: vec!["*".to_string()],
            read_key_patterns: vec!["*".to_string()],
            write_key_patterns: vec!["*".to_string()],
            channel_patterns: vec!["*".to_string()],
            ..User::default()
        }
    }

    fn describe(&self) -> String {
        format!(
            "user {} {} commands={} categories={} keys=r:{}/w:{} channels={}",
            self.username,
            if self.enabled { "on" } else { "off" },
            self.commands.join(","),
            self.categories.join(","),
            self.read_key_patterns.join(","),
            self.write_key_patterns.join(","),
            self.channel_patterns.join(","),
        )
    }
}

pub struct Acl {
    users: RwLock<HashMap<String, User>>,
    /// Connection id → authenticated username.
    connections: RwLock<HashMap<u64, String>>,
}

impl Default for Acl {
    fn default() -> Self {
        Self::new()
    }
}

impl Acl {
    pub fn new() -> Self {
        Self::with_users(Vec::new())
    }

    pub fn with_users(users: Vec<User>) -> Self {
        let mut map = HashMap::new();
        map.insert(DEFAULT_USER.to_string(), User::default_user());
        for user in users {
            map.insert(user.username.clone(), user);
        }
        Acl {
            users: RwLock::new(map),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Load user definitions from a JSON file.
    pub fn load_users(path: impl AsRef<Path>) -> MurexResult<Vec<User>> {
        let data = std::fs::read(path.as_ref())?;
        let users: Vec<User> = serde_json::from_slice(&data)
            .map_err(|e| MurexError::generic(format!("could not parse ACL file: {e}")))?;
        info!(count = users.len(), "loaded ACL users");
        Ok(users)
    }

    /// Attach the default identity to a new connection.
    pub fn register_connection(&self, conn_id: u64) {
        self.connections
            .write()
            .expect("acl connections poisoned")
            .insert(conn_id, DEFAULT_USER.to_string());
    }

    pub fn forget_connection(&self, conn_id: u64) {
        self.connections
            .write()
            .expect("acl connections poisoned")
            .remove(&conn_id);
    }

    pub fn whoami(&self, conn_id: u64) -> String {
        self.connections
            .read()
            .expect("acl connections poisoned")
            .get(&conn_id)
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER.to_string())
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .users
            .read()
            .expect("acl users poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn describe_users(&self) -> Vec<String> {
        let users = self.users.read().expect("acl users poisoned");
        let mut names: Vec<&String> = users.keys().collect();
        names.sort();
        names.iter().map(|n| users[*n].describe()).collect()
    }

    pub fn authenticate(
        &self,
        conn_id: u64,
        username: &str,
        password: &str,
    ) -> MurexResult<()> {
        let users = self.users.read().expect("acl users poisoned");
        let user = users
            .get(username)
            .ok_or_else(|| MurexError::generic("user not found"))?;
        if !user.enabled {
            return Err(MurexError::generic(format!("user {username} is disabled")));
        }
        let ok = user.no_password || user.passwords.iter().any(|p| p == password);
        if !ok {
            return Err(MurexError::generic("could not authenticate user"));
        }
        drop(users);

        self.connections
            .write()
            .expect("acl connections poisoned")
            .insert(conn_id, username.to_string());
        Ok(())
    }

    /// Authorize one command invocation for a connection.
    ///
    /// Deny order: disabled user, then key rules over the extracted read and
    /// write sets, then command/category rules (with an explicit deny
    /// overriding any allow), then channel rules for the pub/sub entry
    /// points.
    pub fn authorize(
        &self,
        conn_id: u64,
        raw: &[String],
        command: &Command,
        subcommand: Option<&SubCommand>,
        keys: &ExtractedKeys,
    ) -> MurexResult<()> {
        let username = self.whoami(conn_id);
        let users = self.users.read().expect("acl users poisoned");
        let user = users
            .get(&username)
            .ok_or_else(|| MurexError::denied(format!("user {username} not found")))?;

        if !user.enabled {
            return Err(MurexError::denied(format!("user {username} is disabled")));
        }

        for key in &keys.read {
            if !matches_any(&user.read_key_patterns, key) {
                return Err(MurexError::denied(format!(
                    "not authorized to read the key {key}"
                )));
            }
        }
        for key in &keys.write {
            if !matches_any(&user.write_key_patterns, key) {
                return Err(MurexError::denied(format!(
                    "not authorized to write the key {key}"
                )));
            }
        }

        let (effective, categories) = match subcommand {
            Some(sub) => (
                format!("{}|{}", command.name, sub.name).to_lowercase(),
                &sub.categories,
            ),
            None => (command.name.to_lowercase(), &command.categories),
        };

        if contains_command(&user.denied_commands, &effective) {
            return Err(MurexError::denied(format!(
                "not authorized to run the {effective} command"
            )));
        }
        let by_command = contains_command(&user.commands, &effective);
        let by_category = categories
            .iter()
            .any(|c| matches_any_exact(&user.categories, c));
        if !by_command && !by_category {
            return Err(MurexError::denied(format!(
                "not authorized to run the {effective} command"
            )));
        }

        for channel in target_channels(&command.name, raw) {
            if !matches_any(&user.channel_patterns, channel) {
                return Err(MurexError::denied(format!(
                    "not authorized to access the channel {channel}"
                )));
            }
        }

        Ok(())
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| p == "*" || glob_match(p, value))
}

fn matches_any_exact(allowed: &[String], value: &str) -> bool {
    allowed
        .iter()
        .any(|a| a == "*" || a.eq_ignore_ascii_case(value))
}

fn contains_command(list: &[String], effective: &str) -> bool {
    list.iter().any(|c| {
        let c = c.to_lowercase();
        // "name" in a rule covers every subcommand of "name|sub".
        c == "*"
            || c == effective
            || effective
                .split_once('|')
                .is_some_and(|(parent, _)| c == parent)
    })
}

/// The channels an invocation targets, for the commands that carry any.
fn target_channels<'a>(command_name: &str, raw: &'a [String]) -> &'a [String] {
    if raw.is_empty() {
        return &[];
    }
    match command_name.to_uppercase().as_str() {
        "SUBSCRIBE" | "PSUBSCRIBE" => &raw[1..],
        "PUBLISH" if raw.len() >= 2 => &raw[1..2],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{category, ExtractedKeys};
    use crate::resp::Reply;

    fn set_command() -> Command {
        Command::builtin(
            "SET",
            &[category::WRITE, category::STRING],
            "",
            true,
            |raw| Ok(ExtractedKeys::writes(vec![raw[1].clone()])),
            |_ctx, _raw| Box::pin(async { Ok(Reply::ok().serialize()) }),
        )
    }

    fn subscribe_command() -> Command {
        Command::builtin(
            "SUBSCRIBE",
            &[category::PUBSUB],
            "",
            false,
            |_raw| Ok(ExtractedKeys::none()),
            |_ctx, _raw| Box::pin(async { Ok(Vec::new()) }),
        )
    }

    fn raw(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_user_is_permissive() {
        let acl = Acl::new();
        acl.register_connection(1);
        let cmd = set_command();
        let raw = raw(&["SET", "any", "value"]);
        let keys = cmd.extract_keys(&raw).unwrap();
        assert!(acl.authorize(1, &raw, &cmd, None, &keys).is_ok());
    }

    #[test]
    fn restricted_user_denied_by_command_and_key() {
        let reader = User {
            username: "reader".to_string(),
            no_password: true,
            commands: vec!["get".to_string()],
            categories: vec!["read".to_string()],
            read_key_patterns: vec!["app:*".to_string()],
            write_key_patterns: vec![],
            channel_patterns: vec!["*".to_string()],
            ..User::default()
        };
        let acl = Acl::with_users(vec![reader]);
        acl.register_connection(1);
        acl.authenticate(1, "reader", "").unwrap();

        let cmd = set_command();
        let raw = raw(&["SET", "app:x", "1"]);
        let keys = cmd.extract_keys(&raw).unwrap();
        let err = acl.authorize(1, &raw, &cmd, None, &keys).unwrap_err();
        assert!(err.to_string().contains("not authorized to write the key"));
    }

    #[test]
    fn deny_overrides_allow() {
        let user = User {
            username: "almost".to_string(),
            no_password: true,
            commands: vec!["*".to_string()],
            categories: vec!["*".to_string()],
            denied_commands: vec!["set".to_string()],
            read_key_patterns: vec!["*".to_string()],
            write_key_patterns: vec!["*".to_string()],
            channel_patterns: vec!["*".to_string()],
            ..User::default()
        };
        let acl = Acl::with_users(vec![user]);
        acl.register_connection(9);
        acl.authenticate(9, "almost", "").unwrap();

        let cmd = set_command();
        let raw = raw(&["SET", "k", "v"]);
        let keys = cmd.extract_keys(&raw).unwrap();
        let err = acl.authorize(9, &raw, &cmd, None, &keys).unwrap_err();
        assert!(err.to_string().contains("not authorized to run the set command"));
    }

    #[test]
    fn channel_rules_gate_subscribe() {
        let user = User {
            username: "narrow".to_string(),
            no_password: true,
            commands: vec!["*".to_string()],
            categories: vec!["*".to_string()],
            read_key_patterns: vec!["*".to_string()],
            write_key_patterns: vec!["*".to_string()],
            channel_patterns: vec!["news.*".to_string()],
            ..User::default()
        };
        let acl = Acl::with_users(vec![user]);
        acl.register_connection(2);
        acl.authenticate(2, "narrow", "").unwrap();

        let cmd = subscribe_command();
        let ok = raw(&["SUBSCRIBE", "news.sports"]);
        let keys = ExtractedKeys::none();
        assert!(acl.authorize(2, &ok, &cmd, None, &keys).is_ok());

        let bad = raw(&["SUBSCRIBE", "news.sports", "admin.audit"]);
        let err = acl.authorize(2, &bad, &cmd, None, &keys).unwrap_err();
        assert!(err.to_string().contains("admin.audit"));
    }

    #[test]
    fn authentication_errors() {
        let acl = Acl::new();
        acl.register_connection(5);
        let err = acl.authenticate(5, "ghost", "pw").unwrap_err();
        assert_eq!(err.to_string(), "Error user not found");

        let locked = User {
            username: "locked".to_string(),
            passwords: vec!["secret".to_string()],
            ..User::default()
        };
        let acl = Acl::with_users(vec![locked]);
        acl.register_connection(5);
        let err = acl.authenticate(5, "locked", "wrong").unwrap_err();
        assert_eq!(err.to_string(), "Error could not authenticate user");
        acl.authenticate(5, "locked", "secret").unwrap();
        assert_eq!(acl.whoami(5), "locked");
    }

    #[test]
    fn disabled_user_is_denied() {
        let off = User {
            username: "off".to_string(),
            enabled: false,
            no_password: true,
            ..User::default()
        };
        let acl = Acl::with_users(vec![off]);
        acl.register_connection(3);
        let err = acl.authenticate(3, "off", "").unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
