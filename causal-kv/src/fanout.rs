use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    link::{Delivery, Link, LinkId},
    message::ServerLine,
    version::Version,
};

/// Client links that receive `replicate` notifications.
#[derive(Debug, Default)]
pub struct ClientFanout {
    clients: HashMap<LinkId, Link>,
}

impl ClientFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, link: Link) {
        self.clients.insert(link.id(), link);
    }

    pub fn detach(&mut self, id: LinkId) -> bool {
        self.clients.remove(&id).is_some()
    }

    /// Sends `replicate key value version` to every attached client.
    /// Returns how many links accepted it.
    pub fn notify_all(&mut self, key: &str, value: &str, version: Version) -> usize {
        let line = ServerLine::Replicate {
            key: key.to_string(),
            value: value.to_string(),
            version,
        }
        .to_string();

        let mut sent = 0;
        self.clients.retain(|id, link| match link.send(line.as_str()) {
            Delivery::Sent => {
                sent += 1;
                true
            }
            Delivery::Dropped => {
                warn!(client = id, "dropped notification for slow client");
                true
            }
            Delivery::Closed => {
                debug!(client = id, "detaching closed client");
                false
            }
        });
        sent
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
