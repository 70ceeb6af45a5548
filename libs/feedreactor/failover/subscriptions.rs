//! Open item streams, replayed after failover

use crate::traits::codec::{Msg, MsgClass};
use std::collections::BTreeMap;

/// A request to re-issue, with the service name it was addressed by
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub msg: Msg,
    /// Resolved again against the directory of the new connection
    pub service_name: Option<String>,
}

/// Request messages the application has open on a channel
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBook {
    open: BTreeMap<i32, OpenRequest>,
}

impl SubscriptionBook {
    /// Track a message that was written: requests open a stream, closes end it
    ///
    /// Session domains are managed by the reactor itself and never recorded.
    pub fn record(&mut self, msg: &Msg, service_name: Option<&str>) {
        if msg.domain.is_session_domain() {
            return;
        }
        match msg.msg_class {
            MsgClass::Request => {
                self.open.insert(
                    msg.stream_id,
                    OpenRequest {
                        msg: msg.clone(),
                        service_name: service_name.map(str::to_string),
                    },
                );
            }
            MsgClass::Close => {
                self.open.remove(&msg.stream_id);
            }
            _ => {}
        }
    }

    /// Drop a stream the provider closed; returns whether it was open
    pub fn forget(&mut self, stream_id: i32) -> bool {
        self.open.remove(&stream_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Requests to re-issue, in stream id order
    pub fn replay(&self) -> Vec<OpenRequest> {
        self.open.values().cloned().collect()
    }
}
