//! Channel and pattern subscription registry with publish fanout.
//!
//! The server side keeps a channel → subscribers map and a flat, ordered
//! list of (subscriber, pattern) pairs; each client mirrors its own
//! subscriptions. Publish walks the exact-channel subscribers first, then
//! every pattern entry whose glob matches the channel name, and reports
//! the total number of deliveries.

use std::collections::HashMap;

use crate::connection::ClientState;
use crate::glob::glob_match;
use crate::resp::Reply;

/// A message to be written to some other client's connection.
#[derive(Debug)]
pub struct Delivery {
    pub client_id: u64,
    pub reply: Reply,
}

#[derive(Debug, Default)]
pub struct PubSub {
    /// Channel name → subscriber ids, in subscription order.
    channels: HashMap<Vec<u8>, Vec<u64>>,
    /// (subscriber id, pattern), in subscription order.
    patterns: Vec<(u64, Vec<u8>)>,
}

impl PubSub {
    pub fn new() -> Self {
        PubSub::default()
    }

    /// Subscribe a client to a channel; duplicate subscriptions no-op.
    /// Returns the confirmation to push to the subscriber.
    pub fn subscribe(&mut self, client: &mut ClientState, channel: &[u8]) -> Reply {
        if client.sub_channels.insert(channel.to_vec()) {
            let subs = self.channels.entry(channel.to_vec()).or_default();
            if !subs.contains(&client.id) {
                subs.push(client.id);
            }
        }
        subscribe_notice(b"subscribe", Some(channel), client.subscription_count())
    }

    /// Unsubscribe from one channel. A channel that was never subscribed
    /// still produces the notification.
    pub fn unsubscribe(&mut self, client: &mut ClientState, channel: &[u8]) -> Reply {
        if client.sub_channels.remove(channel) {
            self.drop_channel_subscriber(channel, client.id);
        }
        subscribe_notice(b"unsubscribe", Some(channel), client.subscription_count())
    }

    /// Unsubscribe from every channel. With nothing subscribed, a single
    /// "nothing to unsubscribe" notification is produced.
    pub fn unsubscribe_all(&mut self, client: &mut ClientState) -> Reply {
        let mut notices = Vec::new();
        let channels: Vec<Vec<u8>> = client.sub_channels.drain().collect();
        for channel in &channels {
            self.drop_channel_subscriber(channel, client.id);
        }
        let mut remaining = client.subscription_count() + channels.len();
        for channel in &channels {
            remaining -= 1;
            notices.push(subscribe_notice(b"unsubscribe", Some(channel), remaining));
        }
        if notices.is_empty() {
            return subscribe_notice(b"unsubscribe", None, client.subscription_count());
        }
        Reply::Multi(notices)
    }

    /// Subscribe to a pattern; duplicates detected by equality and no-oped.
    pub fn psubscribe(&mut self, client: &mut ClientState, pattern: &[u8]) -> Reply {
        if !client.sub_patterns.iter().any(|p| p == pattern) {
            client.sub_patterns.push(pattern.to_vec());
            self.patterns.push((client.id, pattern.to_vec()));
        }
        subscribe_notice(b"psubscribe", Some(pattern), client.subscription_count())
    }

    /// Unsubscribe from one pattern. A never-subscribed pattern silently
    /// no-ops but still sends the notification.
    pub fn punsubscribe(&mut self, client: &mut ClientState, pattern: &[u8]) -> Reply {
        if let Some(pos) = client.sub_patterns.iter().position(|p| p == pattern) {
            client.sub_patterns.remove(pos);
            self.drop_pattern_subscriber(pattern, client.id);
        }
        subscribe_notice(b"punsubscribe", Some(pattern), client.subscription_count())
    }

    pub fn punsubscribe_all(&mut self, client: &mut ClientState) -> Reply {
        let patterns: Vec<Vec<u8>> = std::mem::take(&mut client.sub_patterns);
        for pattern in &patterns {
            self.drop_pattern_subscriber(pattern, client.id);
        }
        let mut notices = Vec::new();
        let mut remaining = client.subscription_count() + patterns.len();
        for pattern in &patterns {
            remaining -= 1;
            notices.push(subscribe_notice(b"punsubscribe", Some(pattern), remaining));
        }
        if notices.is_empty() {
            return subscribe_notice(b"punsubscribe", None, client.subscription_count());
        }
        Reply::Multi(notices)
    }

    /// Fan a message out to channel and pattern subscribers. Returns the
    /// deliveries for the server to write, and their count.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> Vec<Delivery> {
        let mut out = Vec::new();
        if let Some(subs) = self.channels.get(channel) {
            for &client_id in subs {
                out.push(Delivery {
                    client_id,
                    reply: Reply::Push(vec![
                        Reply::bulk(&b"message"[..]),
                        Reply::bulk(channel),
                        Reply::bulk(payload),
                    ]),
                });
            }
        }
        for (client_id, pattern) in &self.patterns {
            if glob_match(pattern, channel) {
                out.push(Delivery {
                    client_id: *client_id,
                    reply: Reply::Push(vec![
                        Reply::bulk(&b"pmessage"[..]),
                        Reply::bulk(pattern.as_slice()),
                        Reply::bulk(channel),
                        Reply::bulk(payload),
                    ]),
                });
            }
        }
        out
    }

    /// Remove every subscription a disconnecting client holds.
    pub fn drop_client(&mut self, client: &mut ClientState) {
        let channels: Vec<Vec<u8>> = client.sub_channels.drain().collect();
        for channel in channels {
            self.drop_channel_subscriber(&channel, client.id);
        }
        let patterns = std::mem::take(&mut client.sub_patterns);
        for pattern in patterns {
            self.drop_pattern_subscriber(&pattern, client.id);
        }
    }

    /// Active channels, optionally filtered by a glob pattern.
    pub fn channels_matching(&self, pattern: Option<&[u8]>) -> Vec<Vec<u8>> {
        self.channels
            .keys()
            .filter(|ch| pattern.is_none_or(|p| glob_match(p, ch)))
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.channels.get(channel).map_or(0, |s| s.len())
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    fn drop_channel_subscriber(&mut self, channel: &[u8], client_id: u64) {
        if let Some(subs) = self.channels.get_mut(channel) {
            subs.retain(|&id| id != client_id);
            if subs.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    fn drop_pattern_subscriber(&mut self, pattern: &[u8], client_id: u64) {
        self.patterns
            .retain(|(id, p)| *id != client_id || p != pattern);
    }
}

fn subscribe_notice(kind: &[u8], subject: Option<&[u8]>, count: usize) -> Reply {
    Reply::Push(vec![
        Reply::bulk(kind),
        match subject {
            Some(s) => Reply::bulk(s),
            None => Reply::Null,
        },
        Reply::int(count as i64),
    ])
}
