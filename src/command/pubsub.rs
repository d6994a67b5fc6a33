use bytes::Bytes;

use crate::connection::ClientState;
use crate::error::{OxidisError, OxidisResult};
use crate::resp::Reply;
use crate::server::ServerState;

use super::{arg_upper, Outcome};

pub fn cmd_subscribe(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let notices = argv[1..]
        .iter()
        .map(|channel| state.pubsub.subscribe(client, channel))
        .collect();
    Ok(Outcome::Reply(Reply::Multi(notices)))
}

pub fn cmd_unsubscribe(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    if argv.len() == 1 {
        return Ok(Outcome::Reply(state.pubsub.unsubscribe_all(client)));
    }
    let notices = argv[1..]
        .iter()
        .map(|channel| state.pubsub.unsubscribe(client, channel))
        .collect();
    Ok(Outcome::Reply(Reply::Multi(notices)))
}

pub fn cmd_psubscribe(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let notices = argv[1..]
        .iter()
        .map(|pattern| state.pubsub.psubscribe(client, pattern))
        .collect();
    Ok(Outcome::Reply(Reply::Multi(notices)))
}

pub fn cmd_punsubscribe(state: &mut ServerState, client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    if argv.len() == 1 {
        return Ok(Outcome::Reply(state.pubsub.punsubscribe_all(client)));
    }
    let notices = argv[1..]
        .iter()
        .map(|pattern| state.pubsub.punsubscribe(client, pattern))
        .collect();
    Ok(Outcome::Reply(Reply::Multi(notices)))
}

pub fn cmd_publish(state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    let deliveries = state.pubsub.publish(&argv[1], &argv[2]);
    let count = deliveries.len() as i64;
    for delivery in deliveries {
        state.outbox.push((delivery.client_id, delivery.reply));
    }
    Ok(Outcome::Reply(Reply::int(count)))
}

pub fn cmd_pubsub(state: &mut ServerState, _client: &mut ClientState, argv: &[Bytes]) -> OxidisResult<Outcome> {
    match arg_upper(&argv[1]).as_str() {
        "CHANNELS" => {
            let pattern = argv.get(2).map(|p| p.as_ref());
            let mut channels = state.pubsub.channels_matching(pattern);
            channels.sort();
            Ok(Outcome::Reply(Reply::array(
                channels.into_iter().map(Reply::bulk).collect(),
            )))
        }
        "NUMSUB" => {
            let mut out = Vec::with_capacity((argv.len() - 2) * 2);
            for channel in &argv[2..] {
                out.push(Reply::bulk(channel.as_ref()));
                out.push(Reply::int(state.pubsub.subscriber_count(channel) as i64));
            }
            Ok(Outcome::Reply(Reply::array(out)))
        }
        "NUMPAT" => Ok(Outcome::Reply(Reply::int(state.pubsub.pattern_count() as i64))),
        other => Err(OxidisError::Generic(format!(
            "Unknown PUBSUB subcommand or wrong number of arguments for '{other}'"
        ))),
    }
}
