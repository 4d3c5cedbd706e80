use std::sync::Arc;

/// Server configuration, parsed once from argv and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_id: String,
    pub bind: String,
    pub port: u16,
    pub tls: bool,
    pub cert: String,
    pub key: String,
    /// Serve the HTTP liveness endpoint instead of the data protocol.
    pub http: bool,
    pub bootstrap_cluster: bool,
    pub join_addr: String,
    pub loglevel: String,
    /// Lua module files registered after the built-ins.
    pub modules: Vec<String>,
    /// Optional JSON file of ACL user definitions.
    pub acl_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_id: "murex-0".to_string(),
            bind: "127.0.0.1".to_string(),
            port: 6379,
            tls: false,
            cert: String::new(),
            key: String::new(),
            http: false,
            bootstrap_cluster: false,
            join_addr: String::new(),
            loglevel: "info".to_string(),
            modules: Vec::new(),
            acl_file: String::new(),
        }
    }
}

impl Config {
    pub fn from_args(args: &[String]) -> Self {
        let mut config = Config::default();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--server-id" => {
                    if i + 1 < args.len() {
                        config.server_id = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--bind" => {
                    if i + 1 < args.len() {
                        config.bind = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--port" => {
                    if i + 1 < args.len() {
                        if let Ok(p) = args[i + 1].parse() {
                            config.port = p;
                        }
                        i += 1;
                    }
                }
                "--tls" => config.tls = true,
                "--cert" => {
                    if i + 1 < args.len() {
                        config.cert = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--key" => {
                    if i + 1 < args.len() {
                        config.key = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--http" => config.http = true,
                "--bootstrap-cluster" => config.bootstrap_cluster = true,
                "--join-addr" => {
                    if i + 1 < args.len() {
                        config.join_addr = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--loglevel" => {
                    if i + 1 < args.len() {
                        config.loglevel = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--load-module" => {
                    if i + 1 < args.len() {
                        config.modules.push(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--acl-file" => {
                    if i + 1 < args.len() {
                        config.acl_file = args[i + 1].clone();
                        i += 1;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        config
    }

    /// Whether this node participates in a replicated cluster.
    pub fn in_cluster(&self) -> bool {
        self.bootstrap_cluster || !self.join_addr.is_empty()
    }
}

pub type SharedConfig = Arc<Config>;

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_core_flags() {
        let config = Config::from_args(&args(&[
            "--server-id",
            "node-a",
            "--bind",
            "0.0.0.0",
            "--port",
            "7001",
            "--bootstrap-cluster",
            "--load-module",
            "mods/a.lua",
            "--load-module",
            "mods/b.lua",
        ]));
        assert_eq!(config.server_id, "node-a");
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 7001);
        assert!(config.bootstrap_cluster);
        assert!(config.in_cluster());
        assert_eq!(config.modules, vec!["mods/a.lua", "mods/b.lua"]);
    }

    #[test]
    fn join_addr_implies_cluster() {
        let config = Config::from_args(&args(&["--join-addr", "10.0.0.5:7000"]));
        assert!(config.in_cluster());
        assert!(!config.bootstrap_cluster);
    }

    #[test]
    fn standalone_by_default() {
        let config = Config::default();
        assert!(!config.in_cluster());
        assert_eq!(config.port, 6379);
    }
}
