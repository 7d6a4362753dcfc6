//! `Connection`: the per-peer aggregate described in `spec.md` 3 — `peer_addr`, an
//! optional established `Session`, an optional ongoing `Handshaker`, an optional
//! pending `Flight`, and a "resumption required" flag.

use crate::fragment_buffer::FragmentBuffer;
use crate::handshake::handshake_cache::HandshakeCache;
use crate::handshaker::Handshaker;
use crate::session::Session;
use std::net::SocketAddr;

use crate::flight::Flight;

pub struct Connection {
    pub peer_addr: SocketAddr,
    pub established_session: Option<Session>,
    pub handshaker: Option<Handshaker>,
    pub pending_flight: Option<Flight>,
    pub resumption_required: bool,
    /// Scoped per-connection (see `fragment_buffer`'s module docs for why this is not
    /// process-wide).
    pub fragment_buffer: FragmentBuffer,
    pub handshake_cache: HandshakeCache,
    /// Set once a peer sends valid application data, confirming it received the last
    /// handshake flight (`spec.md` 9 "Handshake-completed heuristic").
    pub handshake_confirmed: bool,
    /// Bytes passed to `send()` before a connection existed, queued until the
    /// handshake this call kicked off establishes a session to carry them over.
    pub deferred_data: Option<Vec<u8>>,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Connection {
            peer_addr,
            established_session: None,
            handshaker: None,
            pending_flight: None,
            resumption_required: false,
            fragment_buffer: FragmentBuffer::new(),
            handshake_cache: HandshakeCache::new(),
            handshake_confirmed: false,
            deferred_data: None,
        }
    }

    /// Picks the session context whose read epoch matches `epoch`: the ongoing
    /// handshake's session first, then the established session, per `spec.md` 4.3
    /// "Handshake with an existing connection".
    pub fn session_for_read_epoch(&self, epoch: u16) -> Option<SessionRef<'_>> {
        if let Some(hs) = &self.handshaker {
            if hs.session().read_epoch() == epoch {
                return Some(SessionRef::Handshake(hs.session()));
            }
        }
        if let Some(session) = &self.established_session {
            if session.read_epoch() == epoch {
                return Some(SessionRef::Established(session));
            }
        }
        None
    }

    pub fn session_for_read_epoch_mut(&mut self, epoch: u16) -> Option<SessionRefMut<'_>> {
        let handshaker_matches = self
            .handshaker
            .as_ref()
            .map(|hs| hs.session().read_epoch() == epoch)
            .unwrap_or(false);
        if handshaker_matches {
            return Some(SessionRefMut::Handshake(
                self.handshaker.as_mut().unwrap().session_mut(),
            ));
        }
        let established_matches = self
            .established_session
            .as_ref()
            .map(|s| s.read_epoch() == epoch)
            .unwrap_or(false);
        if established_matches {
            return Some(SessionRefMut::Established(
                self.established_session.as_mut().unwrap(),
            ));
        }
        None
    }

    pub fn has_established_session(&self) -> bool {
        self.established_session.is_some()
    }
}

pub enum SessionRef<'a> {
    Established(&'a Session),
    Handshake(&'a Session),
}

impl<'a> SessionRef<'a> {
    pub fn get(&self) -> &Session {
        match self {
            SessionRef::Established(s) => s,
            SessionRef::Handshake(s) => s,
        }
    }
}

pub enum SessionRefMut<'a> {
    Established(&'a mut Session),
    Handshake(&'a mut Session),
}

impl<'a> SessionRefMut<'a> {
    pub fn get_mut(&mut self) -> &mut Session {
        match self {
            SessionRefMut::Established(s) => s,
            SessionRefMut::Handshake(s) => s,
        }
    }
}
