//! Stream membership bookkeeping.
//!
//! The registry never touches sockets: every operation returns the
//! [`Delivery`] list the socket layer has to send.

use std::collections::{BTreeSet, HashMap};

use aga_common::{ConnectionId, SignalMessage, StreamRole};
use tracing::{debug, info};

/// Relay error code for joining a stream nobody hosts.
pub const STREAM_NOT_FOUND: u16 = 404;
/// Relay error code for requests the relay refuses.
pub const BAD_REQUEST: u16 = 400;

/// One message addressed to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub message: SignalMessage,
}

impl Delivery {
    pub fn new(to: impl Into<ConnectionId>, message: SignalMessage) -> Self {
        Self {
            to: to.into(),
            message,
        }
    }

    pub fn error(to: impl Into<ConnectionId>, code: u16, message: impl Into<String>) -> Self {
        Self::new(
            to,
            SignalMessage::Error {
                code: Some(code),
                message: message.into(),
            },
        )
    }
}

#[derive(Debug)]
struct StreamEntry {
    host: ConnectionId,
    host_id: String,
    viewers: BTreeSet<ConnectionId>,
}

#[derive(Debug, Clone)]
struct Membership {
    stream_id: String,
    role: StreamRole,
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<String, StreamEntry>,
    members: HashMap<ConnectionId, Membership>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn host_of(&self, stream_id: &str) -> Option<&str> {
        self.streams.get(stream_id).map(|s| s.host.as_str())
    }

    /// Viewer connection ids of a stream, sorted.
    pub fn viewers(&self, stream_id: &str) -> Vec<ConnectionId> {
        self.streams
            .get(stream_id)
            .map(|s| s.viewers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The stream and role a connection currently takes part in.
    pub fn membership(&self, conn: &str) -> Option<(&str, StreamRole)> {
        self.members
            .get(conn)
            .map(|m| (m.stream_id.as_str(), m.role))
    }

    /// Registers `conn` as host of `stream_id`.
    ///
    /// Re-announcing from the same connection keeps the viewers. A different
    /// connection takes the stream over and the previous viewers are told the
    /// stream ended.
    pub fn start_stream(&mut self, conn: &str, stream_id: &str, host_id: &str) -> Vec<Delivery> {
        if let Some(entry) = self.streams.get_mut(stream_id) {
            if entry.host == conn {
                entry.host_id = host_id.to_string();
                debug!("stream {} re-announced by its host {}", stream_id, conn);
                return Vec::new();
            }
        }

        let mut out = self.detach(conn);
        if let Some(previous) = self.streams.remove(stream_id) {
            info!(
                "stream {} taken over by {} (was {})",
                stream_id, conn, previous.host
            );
            self.members.remove(&previous.host);
            out.extend(self.end_for_viewers(stream_id, previous.viewers));
        }

        self.streams.insert(
            stream_id.to_string(),
            StreamEntry {
                host: conn.to_string(),
                host_id: host_id.to_string(),
                viewers: BTreeSet::new(),
            },
        );
        self.members.insert(
            conn.to_string(),
            Membership {
                stream_id: stream_id.to_string(),
                role: StreamRole::Host,
            },
        );
        info!("stream {} started by {} ({})", stream_id, host_id, conn);
        out
    }

    pub fn join_stream(&mut self, conn: &str, stream_id: &str, viewer_id: &str) -> Vec<Delivery> {
        if let Some((current, StreamRole::Viewer)) = self.membership(conn) {
            if current == stream_id {
                debug!("{} already watches {}", conn, stream_id);
                return Vec::new();
            }
        }

        let mut out = self.detach(conn);
        let Some(entry) = self.streams.get_mut(stream_id) else {
            debug!("{} asked for unknown stream {}", conn, stream_id);
            out.push(Delivery::error(conn, STREAM_NOT_FOUND, "Stream not found"));
            return out;
        };

        entry.viewers.insert(conn.to_string());
        out.push(Delivery::new(
            entry.host.clone(),
            SignalMessage::ViewerJoined {
                stream_id: stream_id.to_string(),
                viewer_id: viewer_id.to_string(),
                viewer_connection_id: conn.to_string(),
            },
        ));
        self.members.insert(
            conn.to_string(),
            Membership {
                stream_id: stream_id.to_string(),
                role: StreamRole::Viewer,
            },
        );
        info!("{} ({}) joined stream {}", viewer_id, conn, stream_id);
        out
    }

    pub fn leave_stream(&mut self, conn: &str, stream_id: &str) -> Vec<Delivery> {
        let watching = matches!(
            self.membership(conn),
            Some((current, StreamRole::Viewer)) if current == stream_id
        );
        if watching {
            self.detach(conn)
        } else {
            Vec::new()
        }
    }

    pub fn end_stream(&mut self, conn: &str, stream_id: &str) -> Vec<Delivery> {
        match self.host_of(stream_id).map(|host| host == conn) {
            Some(true) => self.detach(conn),
            Some(false) => vec![Delivery::error(
                conn,
                BAD_REQUEST,
                "Only the host can end a stream",
            )],
            None => Vec::new(),
        }
    }

    /// Socket closed: resolve whatever `conn` was part of.
    pub fn disconnect(&mut self, conn: &str) -> Vec<Delivery> {
        self.detach(conn)
    }

    fn detach(&mut self, conn: &str) -> Vec<Delivery> {
        let Some(membership) = self.members.remove(conn) else {
            return Vec::new();
        };
        let stream_id = membership.stream_id;

        match membership.role {
            StreamRole::Host => {
                let Some(entry) = self.streams.remove(&stream_id) else {
                    return Vec::new();
                };
                info!("stream {} ended by host {}", stream_id, entry.host_id);
                self.end_for_viewers(&stream_id, entry.viewers)
            }
            StreamRole::Viewer => {
                let Some(entry) = self.streams.get_mut(&stream_id) else {
                    return Vec::new();
                };
                if !entry.viewers.remove(conn) {
                    return Vec::new();
                }
                debug!("{} left stream {}", conn, stream_id);
                vec![Delivery::new(
                    entry.host.clone(),
                    SignalMessage::ViewerLeft {
                        stream_id,
                        viewer_connection_id: conn.to_string(),
                    },
                )]
            }
        }
    }

    fn end_for_viewers(&mut self, stream_id: &str, viewers: BTreeSet<ConnectionId>) -> Vec<Delivery> {
        viewers
            .into_iter()
            .map(|viewer| {
                self.members.remove(&viewer);
                Delivery::new(
                    viewer,
                    SignalMessage::StreamEnded {
                        stream_id: stream_id.to_string(),
                    },
                )
            })
            .collect()
    }
}
