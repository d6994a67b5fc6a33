use crate::object::EncodingLimits;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub databases: usize,
    pub hz: u64,
    pub loglevel: String,
    pub maxmemory: u64,
    pub maxmemory_policy: String,
    // Encoding thresholds
    pub list_max_listpack_size: i64,
    pub list_compress_depth: i64,
    pub hash_max_listpack_entries: u64,
    pub hash_max_listpack_value: u64,
    pub set_max_intset_entries: u64,
    // Expiration
    pub active_expire_enabled: bool,
    // Replication
    pub replicaof: Option<(String, u16)>,
    pub replica_read_only: bool,
    pub repl_backlog_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            databases: 16,
            hz: 10,
            loglevel: "notice".to_string(),
            maxmemory: 0,
            maxmemory_policy: "noeviction".to_string(),
            list_max_listpack_size: -2,
            list_compress_depth: 0,
            hash_max_listpack_entries: 128,
            hash_max_listpack_value: 64,
            set_max_intset_entries: 512,
            active_expire_enabled: true,
            replicaof: None,
            replica_read_only: true,
            repl_backlog_size: 1_048_576, // 1MB
        }
    }
}

impl Config {
    pub fn from_args(args: &[String]) -> Self {
        let mut config = Config::default();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--port" => {
                    if i + 1 < args.len() {
                        if let Ok(p) = args[i + 1].parse() {
                            config.port = p;
                        }
                        i += 1;
                    }
                }
                "--bind" => {
                    if i + 1 < args.len() {
                        config.bind = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--databases" => {
                    if i + 1 < args.len() {
                        if let Ok(d) = args[i + 1].parse() {
                            config.databases = d;
                        }
                        i += 1;
                    }
                }
                "--hz" => {
                    if i + 1 < args.len() {
                        if let Ok(h) = args[i + 1].parse() {
                            config.hz = h;
                        }
                        i += 1;
                    }
                }
                "--loglevel" => {
                    if i + 1 < args.len() {
                        config.loglevel = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--list-max-listpack-size" => {
                    if i + 1 < args.len() {
                        if let Ok(v) = args[i + 1].parse() {
                            config.list_max_listpack_size = v;
                        }
                        i += 1;
                    }
                }
                "--list-compress-depth" => {
                    if i + 1 < args.len() {
                        if let Ok(v) = args[i + 1].parse() {
                            config.list_compress_depth = v;
                        }
                        i += 1;
                    }
                }
                "--replicaof" | "--slaveof" => {
                    if i + 2 < args.len() {
                        let host = args[i + 1].clone();
                        if host.eq_ignore_ascii_case("no") && args[i + 2].eq_ignore_ascii_case("one")
                        {
                            config.replicaof = None;
                        } else if let Ok(port) = args[i + 2].parse::<u16>() {
                            config.replicaof = Some((host, port));
                        }
                        i += 2;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        config
    }

    pub fn is_replica(&self) -> bool {
        self.replicaof.is_some()
    }

    /// Quicklist fill factor for new list objects.
    pub fn list_fill(&self) -> i32 {
        self.list_max_listpack_size.clamp(-5, i32::MAX as i64) as i32
    }

    pub fn compress_depth(&self) -> usize {
        self.list_compress_depth.max(0) as usize
    }

    pub fn encoding_limits(&self) -> EncodingLimits {
        EncodingLimits {
            hash_max_entries: self.hash_max_listpack_entries as usize,
            hash_max_value: self.hash_max_listpack_value as usize,
            set_max_intset_entries: self.set_max_intset_entries as usize,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key.to_lowercase().as_str() {
            "bind" => Some(self.bind.clone()),
            "port" => Some(self.port.to_string()),
            "databases" => Some(self.databases.to_string()),
            "hz" => Some(self.hz.to_string()),
            "loglevel" => Some(self.loglevel.clone()),
            "maxmemory" => Some(self.maxmemory.to_string()),
            "maxmemory-policy" => Some(self.maxmemory_policy.clone()),
            "list-max-ziplist-size" | "list-max-listpack-size" => {
                Some(self.list_max_listpack_size.to_string())
            }
            "list-compress-depth" => Some(self.list_compress_depth.to_string()),
            "hash-max-ziplist-entries" | "hash-max-listpack-entries" => {
                Some(self.hash_max_listpack_entries.to_string())
            }
            "hash-max-ziplist-value" | "hash-max-listpack-value" => {
                Some(self.hash_max_listpack_value.to_string())
            }
            "set-max-intset-entries" => Some(self.set_max_intset_entries.to_string()),
            "replica-read-only" | "slave-read-only" => {
                Some(if self.replica_read_only { "yes" } else { "no" }.to_string())
            }
            "repl-backlog-size" => Some(self.repl_backlog_size.to_string()),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key.to_lowercase().as_str() {
            "hz" => {
                self.hz = value.parse().map_err(|_| "Invalid hz value".to_string())?;
                Ok(())
            }
            "loglevel" => {
                self.loglevel = value.to_string();
                Ok(())
            }
            "maxmemory" => {
                self.maxmemory = value
                    .parse()
                    .map_err(|_| "Invalid maxmemory value".to_string())?;
                Ok(())
            }
            "maxmemory-policy" => {
                self.maxmemory_policy = value.to_string();
                Ok(())
            }
            "list-max-ziplist-size" | "list-max-listpack-size" => {
                self.list_max_listpack_size =
                    value.parse().map_err(|_| "Invalid value".to_string())?;
                Ok(())
            }
            "list-compress-depth" => {
                self.list_compress_depth =
                    value.parse().map_err(|_| "Invalid value".to_string())?;
                Ok(())
            }
            "hash-max-ziplist-entries" | "hash-max-listpack-entries" => {
                self.hash_max_listpack_entries =
                    value.parse().map_err(|_| "Invalid value".to_string())?;
                Ok(())
            }
            "hash-max-ziplist-value" | "hash-max-listpack-value" => {
                self.hash_max_listpack_value =
                    value.parse().map_err(|_| "Invalid value".to_string())?;
                Ok(())
            }
            "set-max-intset-entries" => {
                self.set_max_intset_entries =
                    value.parse().map_err(|_| "Invalid value".to_string())?;
                Ok(())
            }
            "replica-read-only" | "slave-read-only" => {
                self.replica_read_only = value == "yes";
                Ok(())
            }
            _ => {
                // Accept unknown parameters silently for compatibility.
                Ok(())
            }
        }
    }
}
