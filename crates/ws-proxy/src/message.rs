use bytes::Bytes;
use traffic_log::Direction;

use crate::socket::SocketId;

/// What travels through a broadcast: real frame data, or the marker that the
/// link which produced the broadcast has gone away.
///
/// `Closed` is a distinct variant rather than an empty payload, so a
/// zero-length frame can never be mistaken for a disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Bytes),
    Closed,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Data(Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Payload::Data(data.into())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Payload::Closed)
    }
}

/// One broadcast message: the socket it arrived on (if any), the payload, and
/// whether the frame was binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub origin: Option<SocketId>,
    pub payload: Payload,
    pub is_binary: bool,
}

impl Envelope {
    pub fn new(origin: Option<SocketId>, payload: Payload, is_binary: bool) -> Self {
        Self {
            origin,
            payload,
            is_binary,
        }
    }

    /// A close-sentinel envelope.
    pub fn closed(origin: Option<SocketId>) -> Self {
        Self::new(origin, Payload::Closed, false)
    }

    /// Human-readable rendering used by the echo sink: text frames as text,
    /// binary frames by size.
    pub fn render(&self) -> String {
        match &self.payload {
            Payload::Closed => "<closed>".to_string(),
            Payload::Data(data) if self.is_binary => format!("<{} bytes binary>", data.len()),
            Payload::Data(data) => String::from_utf8_lossy(data).into_owned(),
        }
    }
}

/// The two broadcast directions of the fabric.
///
/// `Client` traffic originates from client-facing sockets (the port listener,
/// or a forward link arriving from another instance) and flows toward the
/// target. `Target` traffic flows the other way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Target,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Target,
            Side::Target => Side::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Target => "target",
        }
    }
}

impl From<Side> for Direction {
    fn from(side: Side) -> Self {
        match side {
            Side::Client => Direction::Client,
            Side::Target => Direction::Target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_not_the_close_sentinel() {
        let empty = Payload::text("");
        assert_ne!(empty, Payload::Closed);
        assert!(!empty.is_closed());
        assert!(Payload::Closed.is_closed());
    }

    #[test]
    fn render_text_binary_and_closed() {
        let text = Envelope::new(None, Payload::text("go fast"), false);
        assert_eq!(text.render(), "go fast");

        let binary = Envelope::new(None, Payload::binary(vec![1u8, 2, 3]), true);
        assert_eq!(binary.render(), "<3 bytes binary>");

        assert_eq!(Envelope::closed(None).render(), "<closed>");
    }

    #[test]
    fn sides_are_mirror_images() {
        assert_eq!(Side::Client.opposite(), Side::Target);
        assert_eq!(Side::Target.opposite(), Side::Client);
    }
}
