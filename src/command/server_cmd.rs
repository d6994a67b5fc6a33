use bytes::Bytes;

use crate::connection::ClientState;
use crate::error::{OxidisError, OxidisResult};
use crate::resp::Reply;
use crate::server::ServerState;

use super::{arg_i64, arg_str, arg_upper, command_table, Outcome};

pub fn cmd_ping(_state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match argv.len() {
        1 => Ok(Outcome::Reply(Reply::simple("PONG"))),
        2 => Ok(Outcome::Reply(Reply::bulk(argv[1].as_ref()))),
        _ => Err(OxidisError::WrongArgCount("ping".to_string())),
    }
}

pub fn cmd_echo(_state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    Ok(Outcome::Reply(Reply::bulk(argv[1].as_ref())))
}

pub fn cmd_quit(_state: &mut ServerState, client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    client.should_close = true;
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_select(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let idx = arg_i64(&argv[1])?;
    if idx < 0 || idx as usize >= state.store.num_dbs() {
        return Err(OxidisError::Range("DB index".to_string()));
    }
    client.db_index = idx as usize;
    Ok(Outcome::Reply(Reply::ok()))
}

pub fn cmd_hello(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    if let Some(ver) = argv.get(1) {
        match arg_i64(ver) {
            Ok(2) => client.resp3 = false,
            Ok(3) => client.resp3 = true,
            _ => {
                return Err(OxidisError::Generic(
                    "NOPROTO unsupported protocol version".to_string(),
                ))
            }
        }
    }
    let proto = if client.resp3 { 3 } else { 2 };
    let role = if state.store.replica { "replica" } else { "master" };
    Ok(Outcome::Reply(Reply::array(vec![
        Reply::bulk("server"),
        Reply::bulk("oxidis"),
        Reply::bulk("version"),
        Reply::bulk(env!("CARGO_PKG_VERSION")),
        Reply::bulk("proto"),
        Reply::int(proto),
        Reply::bulk("id"),
        Reply::int(client.id as i64),
        Reply::bulk("mode"),
        Reply::bulk("standalone"),
        Reply::bulk("role"),
        Reply::bulk(role),
        Reply::bulk("modules"),
        Reply::array(Vec::new()),
    ])))
}

pub fn cmd_client(_state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match arg_upper(&argv[1]).as_str() {
        "ID" => Ok(Outcome::Reply(Reply::int(client.id as i64))),
        "GETNAME" => Ok(Outcome::Reply(match &client.name {
            Some(name) => Reply::bulk(name.as_bytes()),
            None => Reply::bulk(Vec::new()),
        })),
        "SETNAME" => {
            let name = arg_str(argv.get(2).ok_or_else(|| {
                OxidisError::WrongArgCount("client|setname".to_string())
            })?);
            if name.contains(' ') || name.contains('\n') {
                return Err(OxidisError::Generic(
                    "Client names cannot contain spaces, newlines or special characters.".to_string(),
                ));
            }
            client.name = Some(name);
            Ok(Outcome::Reply(Reply::ok()))
        }
        // Client libraries announce themselves at connect time; accept
        // and ignore.
        "SETINFO" => Ok(Outcome::Reply(Reply::ok())),
        "NO-TOUCH" => {
            match argv.get(2).map(|a| arg_upper(a)).as_deref() {
                Some("ON") => client.no_touch = true,
                Some("OFF") => client.no_touch = false,
                _ => return Err(OxidisError::Syntax),
            }
            Ok(Outcome::Reply(Reply::ok()))
        }
        "LIST" | "INFO" => {
            let line = format!(
                "id={} name={} db={} resp={}",
                client.id,
                client.name.as_deref().unwrap_or(""),
                client.db_index,
                if client.resp3 { 3 } else { 2 }
            );
            Ok(Outcome::Reply(Reply::bulk(line)))
        }
        other => Err(OxidisError::Generic(format!(
            "Unknown subcommand or wrong number of arguments for '{other}'. Try CLIENT HELP."
        ))),
    }
}

pub fn cmd_config(state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match arg_upper(&argv[1]).as_str() {
        "GET" => {
            if argv.len() < 3 {
                return Err(OxidisError::WrongArgCount("config|get".to_string()));
            }
            let mut out = Vec::new();
            for param in &argv[2..] {
                let name = arg_str(param).to_lowercase();
                if let Some(value) = state.config.get(&name) {
                    out.push(Reply::bulk(name.into_bytes()));
                    out.push(Reply::bulk(value.into_bytes()));
                }
            }
            Ok(Outcome::Reply(Reply::array(out)))
        }
        "SET" => {
            if argv.len() != 4 {
                return Err(OxidisError::WrongArgCount("config|set".to_string()));
            }
            let name = arg_str(&argv[2]);
            let value = arg_str(&argv[3]);
            state
                .config
                .set(&name, &value)
                .map_err(OxidisError::Generic)?;
            Ok(Outcome::Reply(Reply::ok()))
        }
        "RESETSTAT" => {
            state.store.hits = 0;
            state.store.misses = 0;
            Ok(Outcome::Reply(Reply::ok()))
        }
        other => Err(OxidisError::Generic(format!(
            "Unknown CONFIG subcommand or wrong number of arguments for '{other}'"
        ))),
    }
}

pub fn cmd_command(_state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match argv.get(1).map(|a| arg_upper(a)).as_deref() {
        None => {
            let out = command_table()
                .iter()
                .map(|spec| {
                    Reply::array(vec![
                        Reply::bulk(spec.name.to_lowercase()),
                        Reply::int(spec.arity as i64),
                    ])
                })
                .collect();
            Ok(Outcome::Reply(Reply::array(out)))
        }
        Some("COUNT") => Ok(Outcome::Reply(Reply::int(command_table().len() as i64))),
        Some("DOCS") => Ok(Outcome::Reply(Reply::array(Vec::new()))),
        Some(other) => Err(OxidisError::Generic(format!(
            "Unknown subcommand or wrong number of arguments for '{other}'"
        ))),
    }
}

pub fn cmd_info(state: &mut ServerState, _client: &mut ClientState, _argv: &[Bytes]) -> OxidisResult<Outcome> {
    let mut info = String::new();
    info.push_str("# Server\r\n");
    info.push_str(&format!("oxidis_version:{}\r\n", env!("CARGO_PKG_VERSION")));
    info.push_str("mode:standalone\r\n");
    info.push_str(&format!(
        "role:{}\r\n",
        if state.store.replica { "slave" } else { "master" }
    ));
    info.push_str("\r\n# Stats\r\n");
    info.push_str(&format!("keyspace_hits:{}\r\n", state.store.hits));
    info.push_str(&format!("keyspace_misses:{}\r\n", state.store.misses));
    info.push_str(&format!("expired_keys:{}\r\n", state.store.expired));
    info.push_str(&format!("lazyfreed_objects:{}\r\n", state.store.lazyfree_count()));
    info.push_str(&format!(
        "master_repl_offset:{}\r\n",
        state.propagator.replication_offset()
    ));
    info.push_str("\r\n# Keyspace\r\n");
    for i in 0..state.store.num_dbs() {
        let db = state.store.db(i);
        if !db.is_empty() {
            info.push_str(&format!(
                "db{}:keys={},expires={}\r\n",
                i,
                db.len(),
                db.expires_count()
            ));
        }
    }
    Ok(Outcome::Reply(Reply::bulk(info.into_bytes())))
}

pub fn cmd_debug(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match arg_upper(&argv[1]).as_str() {
        "SLEEP" => {
            let secs: f64 = argv
                .get(2)
                .and_then(|a| std::str::from_utf8(a).ok())
                .and_then(|s| s.parse().ok())
                .ok_or(OxidisError::NotFloat)?;
            // Deliberately blocks the whole loop, like the original.
            std::thread::sleep(std::time::Duration::from_secs_f64(secs));
            Ok(Outcome::Reply(Reply::ok()))
        }
        "SET-ACTIVE-EXPIRE" => {
            let on = arg_i64(argv.get(2).ok_or(OxidisError::Syntax)?)? != 0;
            state.config.active_expire_enabled = on;
            Ok(Outcome::Reply(Reply::ok()))
        }
        "OBJECT" => {
            let key = argv.get(2).ok_or(OxidisError::Syntax)?;
            let now = state.clock.cached();
            let obj = state
                .store
                .lookup_read(client.db_index, key, now, true, &mut state.propagator)
                .ok_or(OxidisError::NoSuchKey)?;
            Ok(Outcome::Reply(Reply::simple(format!(
                "Value at: ref_count:{} encoding:{} type:{}",
                crate::object::refcount(&obj) - 1,
                obj.encoding().name(),
                obj.otype().name()
            ))))
        }
        "JMAP" => Ok(Outcome::Reply(Reply::ok())),
        other => Err(OxidisError::Generic(format!(
            "DEBUG subcommand '{other}' not supported"
        ))),
    }
}

pub fn cmd_shutdown(state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    if let Some(arg) = argv.get(1) {
        match arg_upper(arg).as_str() {
            "NOSAVE" | "SAVE" => {}
            _ => return Err(OxidisError::Syntax),
        }
    }
    state.shutdown_requested = true;
    // No reply: the connection sees the socket close instead.
    Ok(Outcome::Reply(Reply::None))
}
