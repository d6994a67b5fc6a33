//! End-to-end tests over a real socket, driving the server with the
//! `redis` client crate. Each test gets its own server instance on its
//! own port.

use std::io::{Read, Write};
use std::time::Duration;

use redis::Commands;

fn start_server(port: u16) {
    start_server_with(port, |_| {})
}

fn start_server_with(port: u16, tweak: impl FnOnce(&mut oxidis::config::Config)) {
    let mut config = oxidis::config::Config {
        port,
        ..Default::default()
    };
    tweak(&mut config);
    std::thread::spawn(move || {
        let mut server = oxidis::server::Server::bind(config).expect("bind failed");
        server.run();
    });
}

fn get_client(port: u16) -> redis::Connection {
    let client = redis::Client::open(format!("redis://127.0.0.1:{port}/")).unwrap();
    for i in 0..50 {
        match client.get_connection() {
            Ok(conn) => return conn,
            Err(_) if i < 49 => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => panic!("Failed to connect: {e}"),
        }
    }
    unreachable!()
}

#[test]
fn test_ping_echo() {
    let port = 17380;
    start_server(port);
    let mut conn = get_client(port);
    let pong: String = redis::cmd("PING").query(&mut conn).unwrap();
    assert_eq!(pong, "PONG");
    let echoed: String = redis::cmd("ECHO").arg("hello world").query(&mut conn).unwrap();
    assert_eq!(echoed, "hello world");
}

#[test]
fn test_set_get_del_wire_format() {
    let port = 17381;
    start_server(port);
    // Drive the raw protocol for the canonical round trip.
    let _probe = get_client(port); // waits until the server is up
    let mut sock = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut read_reply = |sock: &mut std::net::TcpStream, expected: &[u8]| {
        let mut buf = vec![0u8; expected.len()];
        sock.read_exact(&mut buf).unwrap();
        assert_eq!(buf, expected, "wire mismatch: {}", String::from_utf8_lossy(&buf));
    };

    sock.write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n").unwrap();
    read_reply(&mut sock, b"+OK\r\n");
    sock.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").unwrap();
    read_reply(&mut sock, b"$3\r\nbar\r\n");
    sock.write_all(b"*2\r\n$3\r\nDEL\r\n$3\r\nfoo\r\n").unwrap();
    read_reply(&mut sock, b":1\r\n");
    sock.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").unwrap();
    read_reply(&mut sock, b"$-1\r\n");
}

#[test]
fn test_incr_decr_overflow() {
    let port = 17382;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = conn.set("counter", "10").unwrap();
    let v: i64 = conn.incr("counter", 1).unwrap();
    assert_eq!(v, 11);
    let v: i64 = conn.decr("counter", 5).unwrap();
    assert_eq!(v, 6);

    let _: () = conn.set("big", i64::MAX.to_string()).unwrap();
    let err = redis::cmd("INCR").arg("big").query::<i64>(&mut conn).unwrap_err();
    assert!(err.to_string().contains("overflow"), "{err}");

    let _: () = conn.set("notnum", "abc").unwrap();
    let err = redis::cmd("INCR").arg("notnum").query::<i64>(&mut conn).unwrap_err();
    assert!(err.to_string().contains("not an integer"), "{err}");
}

#[test]
fn test_append_strlen_ranges() {
    let port = 17383;
    start_server(port);
    let mut conn = get_client(port);
    let len: usize = conn.append("s", "Hello ").unwrap();
    assert_eq!(len, 6);
    let len: usize = conn.append("s", "World").unwrap();
    assert_eq!(len, 11);
    let len: usize = conn.strlen("s").unwrap();
    assert_eq!(len, 11);
    let range: String = conn.getrange("s", 0, 4).unwrap();
    assert_eq!(range, "Hello");
    let range: String = conn.getrange("s", -5, -1).unwrap();
    assert_eq!(range, "World");
    let len: usize = conn.setrange("s", 6, "Redis").unwrap();
    assert_eq!(len, 11);
    let v: String = conn.get("s").unwrap();
    assert_eq!(v, "Hello Redis");
}

#[test]
fn test_mset_mget_msetnx() {
    let port = 17384;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = redis::cmd("MSET").arg(&["a", "1", "b", "2"]).query(&mut conn).unwrap();
    let vals: Vec<Option<String>> = conn.get(&["a", "b", "missing"]).unwrap();
    assert_eq!(
        vals,
        vec![Some("1".to_string()), Some("2".to_string()), None]
    );
    let ok: i64 = redis::cmd("MSETNX").arg(&["b", "x", "c", "3"]).query(&mut conn).unwrap();
    assert_eq!(ok, 0);
    let c: Option<String> = conn.get("c").unwrap();
    assert_eq!(c, None);
    let ok: i64 = redis::cmd("MSETNX").arg(&["c", "3", "d", "4"]).query(&mut conn).unwrap();
    assert_eq!(ok, 1);
}

#[test]
fn test_expiration_visibility() {
    let port = 17385;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = conn.set("k", "v").unwrap();
    let set: i64 = redis::cmd("PEXPIRE").arg("k").arg(150).query(&mut conn).unwrap();
    assert_eq!(set, 1);
    let v: Option<String> = conn.get("k").unwrap();
    assert_eq!(v, Some("v".to_string()));
    let ttl: i64 = redis::cmd("PTTL").arg("k").query(&mut conn).unwrap();
    assert!(ttl > 0 && ttl <= 150);
    std::thread::sleep(Duration::from_millis(250));
    let v: Option<String> = conn.get("k").unwrap();
    assert_eq!(v, None);
    let ttl: i64 = redis::cmd("TTL").arg("k").query(&mut conn).unwrap();
    assert_eq!(ttl, -2);
}

#[test]
fn test_active_expiration_without_access() {
    let port = 17386;
    start_server(port);
    let mut conn = get_client(port);
    let mut pipe = redis::pipe();
    for i in 0..200 {
        pipe.cmd("SET").arg(format!("cold:{i}")).arg("v").ignore();
        pipe.cmd("PEXPIRE").arg(format!("cold:{i}")).arg(100).ignore();
    }
    let _: () = pipe.query(&mut conn).unwrap();
    let size: i64 = redis::cmd("DBSIZE").query(&mut conn).unwrap();
    assert_eq!(size, 200);
    // Never touch the keys again; the timer-driven cycle reaps them.
    std::thread::sleep(Duration::from_millis(1500));
    let size: i64 = redis::cmd("DBSIZE").query(&mut conn).unwrap();
    assert_eq!(size, 0);
}

#[test]
fn test_persist_and_expire_overwrite() {
    let port = 17387;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = conn.set("k", "v").unwrap();
    let _: i64 = redis::cmd("EXPIRE").arg("k").arg(100).query(&mut conn).unwrap();
    let ttl: i64 = redis::cmd("TTL").arg("k").query(&mut conn).unwrap();
    assert!(ttl > 90);
    let persisted: i64 = redis::cmd("PERSIST").arg("k").query(&mut conn).unwrap();
    assert_eq!(persisted, 1);
    let ttl: i64 = redis::cmd("TTL").arg("k").query(&mut conn).unwrap();
    assert_eq!(ttl, -1);
    // SET clears a TTL.
    let _: i64 = redis::cmd("EXPIRE").arg("k").arg(100).query(&mut conn).unwrap();
    let _: () = conn.set("k", "v2").unwrap();
    let ttl: i64 = redis::cmd("TTL").arg("k").query(&mut conn).unwrap();
    assert_eq!(ttl, -1);
}

#[test]
fn test_list_operations() {
    let port = 17388;
    start_server(port);
    let mut conn = get_client(port);
    let len: i64 = conn.rpush("l", &["b", "c"]).unwrap();
    assert_eq!(len, 2);
    let len: i64 = conn.lpush("l", "a").unwrap();
    assert_eq!(len, 3);
    let all: Vec<String> = conn.lrange("l", 0, -1).unwrap();
    assert_eq!(all, vec!["a", "b", "c"]);
    let head: Option<String> = conn.lpop("l", None).unwrap();
    assert_eq!(head, Some("a".to_string()));
    let tail: Option<String> = conn.rpop("l", None).unwrap();
    assert_eq!(tail, Some("c".to_string()));

    let _: i64 = conn.rpush("l", &["x", "y", "z"]).unwrap();
    let n: i64 = redis::cmd("LINSERT").arg("l").arg("BEFORE").arg("x").arg("w")
        .query(&mut conn)
        .unwrap();
    assert_eq!(n, 5);
    let _: () = conn.lset("l", 0, "B").unwrap();
    let v: Option<String> = conn.lindex("l", 0).unwrap();
    assert_eq!(v, Some("B".to_string()));
    let removed: i64 = conn.lrem("l", 0, "y").unwrap();
    assert_eq!(removed, 1);
    let _: () = conn.ltrim("l", 1, 2).unwrap();
    let all: Vec<String> = conn.lrange("l", 0, -1).unwrap();
    assert_eq!(all, vec!["w", "x"]);
    // Popping the last elements removes the key.
    let _: Option<String> = conn.lpop("l", None).unwrap();
    let _: Option<String> = conn.lpop("l", None).unwrap();
    let exists: bool = conn.exists("l").unwrap();
    assert!(!exists);
}

#[test]
fn test_list_bulk_preserves_order() {
    let port = 17389;
    start_server_with(port, |c| c.list_compress_depth = 1);
    let mut conn = get_client(port);
    let _: i64 = conn.rpush("big", &["a", "b", "c"]).unwrap();
    let payload = "x".repeat(1024);
    for chunk in 0..10 {
        let mut pipe = redis::pipe();
        for i in 0..1000 {
            pipe.cmd("RPUSH").arg("big").arg(format!("{payload}:{}", chunk * 1000 + i)).ignore();
        }
        let _: () = pipe.query(&mut conn).unwrap();
    }
    let len: i64 = conn.llen("big").unwrap();
    assert_eq!(len, 10_003);
    let encoding: String = redis::cmd("OBJECT").arg("ENCODING").arg("big").query(&mut conn).unwrap();
    assert_eq!(encoding, "quicklist");
    let all: Vec<String> = conn.lrange("big", 0, -1).unwrap();
    assert_eq!(all.len(), 10_003);
    assert_eq!(all[0], "a");
    assert_eq!(all[3], format!("{payload}:0"));
    assert_eq!(all[10_002], format!("{payload}:9999"));
}

#[test]
fn test_rpoplpush() {
    let port = 17390;
    start_server(port);
    let mut conn = get_client(port);
    let _: i64 = conn.rpush("src", &["1", "2", "3"]).unwrap();
    let v: Option<String> = conn.rpoplpush("src", "dst").unwrap();
    assert_eq!(v, Some("3".to_string()));
    let dst: Vec<String> = conn.lrange("dst", 0, -1).unwrap();
    assert_eq!(dst, vec!["3"]);
    // Missing source yields nil and leaves dst alone.
    let v: Option<String> = conn.rpoplpush("nosuch", "dst").unwrap();
    assert_eq!(v, None);
}

#[test]
fn test_hash_operations() {
    let port = 17391;
    start_server(port);
    let mut conn = get_client(port);
    let added: i64 = redis::cmd("HSET").arg("h").arg(&["f1", "v1", "f2", "v2"]).query(&mut conn).unwrap();
    assert_eq!(added, 2);
    let v: Option<String> = conn.hget("h", "f1").unwrap();
    assert_eq!(v, Some("v1".to_string()));
    let all: std::collections::HashMap<String, String> = conn.hgetall("h").unwrap();
    assert_eq!(all.len(), 2);
    let vals: Vec<Option<String>> = conn.hget("h", &["f2", "nope"]).unwrap();
    assert_eq!(vals, vec![Some("v2".to_string()), None]);
    let exists: bool = conn.hexists("h", "f1").unwrap();
    assert!(exists);
    let n: i64 = conn.hincr("h", "count", 5).unwrap();
    assert_eq!(n, 5);
    let n: i64 = conn.hincr("h", "count", -2).unwrap();
    assert_eq!(n, 3);
    let strlen: i64 = redis::cmd("HSTRLEN").arg("h").arg("f1").query(&mut conn).unwrap();
    assert_eq!(strlen, 2);
    let deleted: i64 = conn.hdel("h", &["f1", "f2"]).unwrap();
    assert_eq!(deleted, 2);
    let len: i64 = conn.hlen("h").unwrap();
    assert_eq!(len, 1);
}

#[test]
fn test_hash_encoding_transition() {
    let port = 17392;
    start_server(port);
    let mut conn = get_client(port);
    let _: i64 = redis::cmd("HSET").arg("h").arg(&["f", "small"]).query(&mut conn).unwrap();
    let enc: String = redis::cmd("OBJECT").arg("ENCODING").arg("h").query(&mut conn).unwrap();
    assert_eq!(enc, "listpack");
    // A value over the 64-byte threshold forces the table encoding.
    let long = "v".repeat(65);
    let _: i64 = redis::cmd("HSET").arg("h").arg(&["big", &long]).query(&mut conn).unwrap();
    let enc: String = redis::cmd("OBJECT").arg("ENCODING").arg("h").query(&mut conn).unwrap();
    assert_eq!(enc, "hashtable");
    // Removing the long value does not convert back.
    let _: i64 = conn.hdel("h", "big").unwrap();
    let enc: String = redis::cmd("OBJECT").arg("ENCODING").arg("h").query(&mut conn).unwrap();
    assert_eq!(enc, "hashtable");
}

#[test]
fn test_hscan_walks_large_hash() {
    let port = 17393;
    start_server(port);
    let mut conn = get_client(port);
    let mut pipe = redis::pipe();
    for i in 0..500 {
        pipe.cmd("HSET").arg("h").arg(format!("field:{i}")).arg(i).ignore();
    }
    let _: () = pipe.query(&mut conn).unwrap();
    let mut seen = std::collections::HashSet::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, items): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg("h")
            .arg(cursor)
            .arg("COUNT")
            .arg(50)
            .query(&mut conn)
            .unwrap();
        for pair in items.chunks(2) {
            seen.insert(pair[0].clone());
        }
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    assert_eq!(seen.len(), 500);
}

#[test]
fn test_keys_and_scan() {
    let port = 17394;
    start_server(port);
    let mut conn = get_client(port);
    let mut pipe = redis::pipe();
    for i in 0..1000 {
        pipe.cmd("SET").arg(format!("key:{i}")).arg(i).ignore();
    }
    pipe.cmd("SET").arg("other").arg("x").ignore();
    let _: () = pipe.query(&mut conn).unwrap();

    let matched: Vec<String> = conn.keys("key:1?").unwrap();
    assert_eq!(matched.len(), 10);

    let mut seen = std::collections::HashSet::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg("key:*")
            .arg("COUNT")
            .arg(100)
            .query(&mut conn)
            .unwrap();
        seen.extend(keys);
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    assert_eq!(seen.len(), 1000);
}

#[test]
fn test_type_and_wrongtype_errors() {
    let port = 17395;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = conn.set("s", "v").unwrap();
    let _: i64 = conn.rpush("l", "x").unwrap();
    let t: String = redis::cmd("TYPE").arg("s").query(&mut conn).unwrap();
    assert_eq!(t, "string");
    let t: String = redis::cmd("TYPE").arg("l").query(&mut conn).unwrap();
    assert_eq!(t, "list");
    let t: String = redis::cmd("TYPE").arg("none").query(&mut conn).unwrap();
    assert_eq!(t, "none");

    let err = redis::cmd("GET").arg("l").query::<String>(&mut conn).unwrap_err();
    assert!(err.to_string().contains("WRONGTYPE"), "{err}");
    let err = redis::cmd("LPUSH").arg("s").arg("x").query::<i64>(&mut conn).unwrap_err();
    assert!(err.to_string().contains("WRONGTYPE"), "{err}");
}

#[test]
fn test_rename_and_move() {
    let port = 17396;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = conn.set("old", "v").unwrap();
    let _: () = redis::cmd("RENAME").arg("old").arg("new").query(&mut conn).unwrap();
    let v: Option<String> = conn.get("new").unwrap();
    assert_eq!(v, Some("v".to_string()));
    let err = redis::cmd("RENAME").arg("ghost").arg("x").query::<String>(&mut conn).unwrap_err();
    assert!(err.to_string().contains("no such key"), "{err}");

    let _: () = conn.set("taken", "1").unwrap();
    let renamed: i64 = redis::cmd("RENAMENX").arg("new").arg("taken").query(&mut conn).unwrap();
    assert_eq!(renamed, 0);

    let moved: i64 = redis::cmd("MOVE").arg("new").arg(1).query(&mut conn).unwrap();
    assert_eq!(moved, 1);
    let v: Option<String> = conn.get("new").unwrap();
    assert_eq!(v, None);
    let _: () = redis::cmd("SELECT").arg(1).query(&mut conn).unwrap();
    let v: Option<String> = conn.get("new").unwrap();
    assert_eq!(v, Some("v".to_string()));
}

#[test]
fn test_transactions_basic() {
    let port = 17397;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = redis::cmd("MULTI").query(&mut conn).unwrap();
    let q: String = redis::cmd("SET").arg("t").arg("1").query(&mut conn).unwrap();
    assert_eq!(q, "QUEUED");
    let q: String = redis::cmd("INCR").arg("t").query(&mut conn).unwrap();
    assert_eq!(q, "QUEUED");
    let results: Vec<redis::Value> = redis::cmd("EXEC").query(&mut conn).unwrap();
    assert_eq!(results.len(), 2);
    let v: Option<String> = conn.get("t").unwrap();
    assert_eq!(v, Some("2".to_string()));
}

#[test]
fn test_transaction_watch_abort() {
    let port = 17398;
    start_server(port);
    let mut conn_a = get_client(port);
    let mut conn_b = get_client(port);

    let _: () = conn_a.set("balance", "100").unwrap();
    let _: () = redis::cmd("WATCH").arg("balance").query(&mut conn_a).unwrap();
    let _: () = redis::cmd("MULTI").query(&mut conn_a).unwrap();
    let _: String = redis::cmd("SET").arg("balance").arg("50").query(&mut conn_a).unwrap();

    // A second client touches the watched key before EXEC.
    let _: () = conn_b.set("balance", "0").unwrap();

    let result: Option<Vec<redis::Value>> = redis::cmd("EXEC").query(&mut conn_a).unwrap();
    assert_eq!(result, None, "EXEC must return the null array");
    let v: Option<String> = conn_a.get("balance").unwrap();
    assert_eq!(v, Some("0".to_string()));
}

#[test]
fn test_transaction_unwatched_commits() {
    let port = 17399;
    start_server(port);
    let mut conn_a = get_client(port);
    let mut conn_b = get_client(port);

    let _: () = redis::cmd("WATCH").arg("w").query(&mut conn_a).unwrap();
    let _: () = redis::cmd("MULTI").query(&mut conn_a).unwrap();
    let _: String = redis::cmd("SET").arg("w").arg("mine").query(&mut conn_a).unwrap();
    // The other client writes an unrelated key.
    let _: () = conn_b.set("unrelated", "x").unwrap();
    let result: Option<Vec<redis::Value>> = redis::cmd("EXEC").query(&mut conn_a).unwrap();
    assert!(result.is_some());
    let v: Option<String> = conn_a.get("w").unwrap();
    assert_eq!(v, Some("mine".to_string()));
}

#[test]
fn test_execabort_on_invalid_queued_command() {
    let port = 17400;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = redis::cmd("MULTI").query(&mut conn).unwrap();
    // Arity violation is reported now and poisons the queue.
    let err = redis::cmd("GET").query::<String>(&mut conn).unwrap_err();
    assert!(err.to_string().contains("wrong number"), "{err}");
    let _: String = redis::cmd("SET").arg("x").arg("1").query(&mut conn).unwrap();
    let err = redis::cmd("EXEC").query::<redis::Value>(&mut conn).unwrap_err();
    assert!(err.to_string().contains("EXECABORT"), "{err}");
    let v: Option<String> = conn.get("x").unwrap();
    assert_eq!(v, None);
}

#[test]
fn test_pubsub_channel_fanout() {
    let port = 17401;
    start_server(port);
    let mut publisher = get_client(port);
    let mut sub_conn = get_client(port);
    let mut pubsub = sub_conn.as_pubsub();
    pubsub.subscribe("events").unwrap();

    // No subscriber on this channel.
    let n: i64 = publisher.publish("other", "x").unwrap();
    assert_eq!(n, 0);
    let n: i64 = publisher.publish("events", "payload").unwrap();
    assert_eq!(n, 1);

    let msg = pubsub.get_message().unwrap();
    assert_eq!(msg.get_channel_name(), "events");
    assert_eq!(msg.get_payload::<String>().unwrap(), "payload");
}

#[test]
fn test_pubsub_pattern_matching() {
    let port = 17402;
    start_server(port);
    let mut publisher = get_client(port);
    let mut sub_conn = get_client(port);
    let mut pubsub = sub_conn.as_pubsub();
    pubsub.psubscribe("news.*").unwrap();

    let n: i64 = publisher.publish("news.weather", "hello").unwrap();
    assert_eq!(n, 1);
    // A non-matching channel is not delivered.
    let n: i64 = publisher.publish("newsletter", "hi").unwrap();
    assert_eq!(n, 0);

    let msg = pubsub.get_message().unwrap();
    assert_eq!(msg.get_pattern::<String>().unwrap(), "news.*");
    assert_eq!(msg.get_channel_name(), "news.weather");
    assert_eq!(msg.get_payload::<String>().unwrap(), "hello");

    pubsub.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    assert!(pubsub.get_message().is_err(), "newsletter must not arrive");
}

#[test]
fn test_pubsub_introspection() {
    let port = 17403;
    start_server(port);
    let mut conn = get_client(port);
    let mut sub_conn = get_client(port);
    let mut pubsub = sub_conn.as_pubsub();
    pubsub.subscribe("alpha").unwrap();
    pubsub.subscribe("beta").unwrap();
    pubsub.psubscribe("gamma.*").unwrap();

    let channels: Vec<String> = redis::cmd("PUBSUB").arg("CHANNELS").query(&mut conn).unwrap();
    assert_eq!(channels, vec!["alpha", "beta"]);
    let numsub: Vec<redis::Value> = redis::cmd("PUBSUB").arg("NUMSUB").arg("alpha").arg("nope")
        .query(&mut conn)
        .unwrap();
    assert_eq!(numsub.len(), 4);
    let numpat: i64 = redis::cmd("PUBSUB").arg("NUMPAT").query(&mut conn).unwrap();
    assert_eq!(numpat, 1);

    // Unsubscribing a never-subscribed pattern still acknowledges.
    pubsub.punsubscribe("never.*").unwrap();
}

#[test]
fn test_blpop_wakes_on_push() {
    let port = 17404;
    start_server(port);
    let mut pusher = get_client(port);

    let waiter = std::thread::spawn(move || {
        let mut conn = get_client(port);
        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg("jobs")
            .arg(5)
            .query(&mut conn)
            .unwrap();
        result
    });

    std::thread::sleep(Duration::from_millis(300));
    let _: i64 = pusher.rpush("jobs", "job-1").unwrap();
    let result = waiter.join().unwrap();
    assert_eq!(result, Some(("jobs".to_string(), "job-1".to_string())));
    // The served element is gone.
    let len: i64 = pusher.llen("jobs").unwrap();
    assert_eq!(len, 0);
}

#[test]
fn test_blpop_timeout_returns_nil() {
    let port = 17405;
    start_server(port);
    let mut conn = get_client(port);
    let start = std::time::Instant::now();
    let result: Option<(String, String)> = redis::cmd("BLPOP")
        .arg("nothing")
        .arg(1)
        .query(&mut conn)
        .unwrap();
    assert_eq!(result, None);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    // The connection is usable afterwards.
    let pong: String = redis::cmd("PING").query(&mut conn).unwrap();
    assert_eq!(pong, "PONG");
}

#[test]
fn test_brpoplpush_blocking() {
    let port = 17406;
    start_server(port);
    let mut pusher = get_client(port);

    let waiter = std::thread::spawn(move || {
        let mut conn = get_client(port);
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg("inbox")
            .arg("working")
            .arg(5)
            .query(&mut conn)
            .unwrap();
        result
    });

    std::thread::sleep(Duration::from_millis(300));
    let _: i64 = pusher.rpush("inbox", "task").unwrap();
    assert_eq!(waiter.join().unwrap(), Some("task".to_string()));
    let mut conn = get_client(port);
    let working: Vec<String> = conn.lrange("working", 0, -1).unwrap();
    assert_eq!(working, vec!["task"]);
}

#[test]
fn test_blpop_fifo_across_clients() {
    let port = 17407;
    start_server(port);
    let mut pusher = get_client(port);

    let first = std::thread::spawn(move || {
        let mut conn = get_client(port);
        let r: Option<(String, String)> = redis::cmd("BLPOP").arg("fifo").arg(5).query(&mut conn).unwrap();
        r
    });
    std::thread::sleep(Duration::from_millis(200));
    let second = std::thread::spawn(move || {
        let mut conn = get_client(port);
        let r: Option<(String, String)> = redis::cmd("BLPOP").arg("fifo").arg(5).query(&mut conn).unwrap();
        r
    });
    std::thread::sleep(Duration::from_millis(200));

    let _: i64 = pusher.rpush("fifo", &["one", "two"]).unwrap();
    let got_first = first.join().unwrap().unwrap();
    let got_second = second.join().unwrap().unwrap();
    assert_eq!(got_first.1, "one", "first blocker is served first");
    assert_eq!(got_second.1, "two");
}

#[test]
fn test_dbsize_flush_select() {
    let port = 17408;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = conn.set("a", "1").unwrap();
    let _: () = conn.set("b", "2").unwrap();
    let size: i64 = redis::cmd("DBSIZE").query(&mut conn).unwrap();
    assert_eq!(size, 2);
    let _: () = redis::cmd("FLUSHDB").query(&mut conn).unwrap();
    let size: i64 = redis::cmd("DBSIZE").query(&mut conn).unwrap();
    assert_eq!(size, 0);

    let _: () = conn.set("c", "3").unwrap();
    let _: () = redis::cmd("FLUSHALL").arg("ASYNC").query(&mut conn).unwrap();
    let size: i64 = redis::cmd("DBSIZE").query(&mut conn).unwrap();
    assert_eq!(size, 0);
}

#[test]
fn test_unlink() {
    let port = 17409;
    start_server(port);
    let mut conn = get_client(port);
    let mut pipe = redis::pipe();
    for i in 0..100 {
        pipe.cmd("RPUSH").arg("biglist").arg(format!("item-{i}")).ignore();
    }
    let _: () = pipe.query(&mut conn).unwrap();
    let n: i64 = redis::cmd("UNLINK").arg("biglist").arg("missing").query(&mut conn).unwrap();
    assert_eq!(n, 1);
    let exists: bool = conn.exists("biglist").unwrap();
    assert!(!exists);
}

#[test]
fn test_randomkey_and_exists() {
    let port = 17410;
    start_server(port);
    let mut conn = get_client(port);
    let none: Option<String> = redis::cmd("RANDOMKEY").query(&mut conn).unwrap();
    assert_eq!(none, None);
    let _: () = conn.set("only", "one").unwrap();
    let got: Option<String> = redis::cmd("RANDOMKEY").query(&mut conn).unwrap();
    assert_eq!(got, Some("only".to_string()));
    let n: i64 = redis::cmd("EXISTS").arg("only").arg("only").arg("nope").query(&mut conn).unwrap();
    assert_eq!(n, 2);
}

#[test]
fn test_setex_getset_setnx() {
    let port = 17411;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = redis::cmd("SETEX").arg("tmp").arg(100).arg("v").query(&mut conn).unwrap();
    let ttl: i64 = redis::cmd("TTL").arg("tmp").query(&mut conn).unwrap();
    assert!(ttl > 90);
    let old: Option<String> = redis::cmd("GETSET").arg("tmp").arg("v2").query(&mut conn).unwrap();
    assert_eq!(old, Some("v".to_string()));
    let set: i64 = redis::cmd("SETNX").arg("tmp").arg("v3").query(&mut conn).unwrap();
    assert_eq!(set, 0);
    let set: i64 = redis::cmd("SETNX").arg("fresh").arg("v").query(&mut conn).unwrap();
    assert_eq!(set, 1);
}

#[test]
fn test_set_with_options() {
    let port = 17412;
    start_server(port);
    let mut conn = get_client(port);
    // NX on a fresh key succeeds; again it is a null reply.
    let r: Option<String> = redis::cmd("SET").arg("opt").arg("1").arg("NX").query(&mut conn).unwrap();
    assert_eq!(r, Some("OK".to_string()));
    let r: Option<String> = redis::cmd("SET").arg("opt").arg("2").arg("NX").query(&mut conn).unwrap();
    assert_eq!(r, None);
    // XX on a missing key fails.
    let r: Option<String> = redis::cmd("SET").arg("ghost").arg("1").arg("XX").query(&mut conn).unwrap();
    assert_eq!(r, None);
    // PX attaches a TTL; KEEPTTL preserves it across a plain SET.
    let _: () = redis::cmd("SET").arg("opt").arg("3").arg("PX").arg(60_000).query(&mut conn).unwrap();
    let _: () = redis::cmd("SET").arg("opt").arg("4").arg("KEEPTTL").query(&mut conn).unwrap();
    let ttl: i64 = redis::cmd("PTTL").arg("opt").query(&mut conn).unwrap();
    assert!(ttl > 0, "KEEPTTL must preserve the deadline, got {ttl}");
}

#[test]
fn test_incrbyfloat() {
    let port = 17413;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = conn.set("f", "10.5").unwrap();
    let v: f64 = redis::cmd("INCRBYFLOAT").arg("f").arg("0.25").query(&mut conn).unwrap();
    assert!((v - 10.75).abs() < 1e-9);
    let v: f64 = redis::cmd("HINCRBYFLOAT").arg("h").arg("field").arg("2.5").query(&mut conn).unwrap();
    assert!((v - 2.5).abs() < 1e-9);
}

#[test]
fn test_object_refcount_shared_integer() {
    let port = 17414;
    start_server(port);
    let mut conn = get_client(port);
    // Small integers come from the shared pool, so their refcount is
    // well above one.
    let _: () = conn.set("shared", "42").unwrap();
    let refs: i64 = redis::cmd("OBJECT").arg("REFCOUNT").arg("shared").query(&mut conn).unwrap();
    assert!(refs >= 2, "shared integer should be multiply referenced, got {refs}");
    let _: () = conn.set("private", "a unique string value").unwrap();
    let refs: i64 = redis::cmd("OBJECT").arg("REFCOUNT").arg("private").query(&mut conn).unwrap();
    assert_eq!(refs, 1);
}

#[test]
fn test_shutdown_closes_server() {
    let port = 17415;
    start_server(port);
    let mut conn = get_client(port);
    let _: () = conn.set("k", "v").unwrap();
    // SHUTDOWN NOSAVE sends no reply; the socket just closes.
    let result = redis::cmd("SHUTDOWN").arg("NOSAVE").query::<()>(&mut conn);
    assert!(result.is_err());
    std::thread::sleep(Duration::from_millis(200));
    let client = redis::Client::open(format!("redis://127.0.0.1:{port}/")).unwrap();
    assert!(client.get_connection().is_err(), "server must be down");
}
