//! Two-endpoint simulation harness on a virtual microsecond clock.
//!
//! The harness owns a client and a server connection plus one impaired
//! link per direction. Time only advances to the next scheduled event
//! (datagram arrival or connection timer), so runs are fully
//! deterministic for a given seed.

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::{debug, trace};

use sliq_transport::connection::{ConnState, Connection, ConnectionConfig, Role};
use sliq_transport::seq::PktTimestamp;
use sliq_transport::wire::{CcAlgEntry, CcType};

use crate::netsim::{LinkConfig, SimLink};

/// Default CC proposal used by harness endpoints.
pub fn default_cc_algs() -> Vec<CcAlgEntry> {
    vec![CcAlgEntry {
        cc_type: CcType::CubicBytes,
        deterministic: false,
        pacing: false,
        params: 0,
    }]
}

pub struct SimPair {
    pub client: Connection,
    pub server: Connection,
    c2s: SimLink,
    s2c: SimLink,
    now_us: u64,
}

impl SimPair {
    /// Symmetric link impairment.
    pub fn new(link: LinkConfig) -> Self {
        Self::asymmetric(link, link)
    }

    /// Distinct forward (client→server) and reverse impairment.
    pub fn asymmetric(c2s: LinkConfig, s2c: LinkConfig) -> Self {
        Self::with_configs(
            ConnectionConfig::new(Role::Client, default_cc_algs()),
            ConnectionConfig::new(Role::Server, default_cc_algs()),
            c2s,
            s2c,
        )
    }

    pub fn with_configs(
        client: ConnectionConfig,
        server: ConnectionConfig,
        c2s: LinkConfig,
        s2c: LinkConfig,
    ) -> Self {
        SimPair {
            client: Connection::new(client),
            server: Connection::new(server),
            c2s: SimLink::new(c2s),
            s2c: SimLink::new(LinkConfig {
                seed: s2c.seed.wrapping_add(0x9E37),
                ..s2c
            }),
            now_us: 0,
        }
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Current virtual time as a connection-clock value.
    pub fn ts(&self) -> PktTimestamp {
        PktTimestamp((self.now_us & 0xFFFF_FFFF) as u32)
    }

    /// Exchange everything currently transmissible and deliverable without
    /// advancing the clock.
    pub fn pump(&mut self) {
        loop {
            let t = self.ts();
            let mut moved = false;
            while let Some(d) = self.client.poll_transmit(t) {
                self.c2s.send(self.now_us, d);
                moved = true;
            }
            while let Some(d) = self.server.poll_transmit(t) {
                self.s2c.send(self.now_us, d);
                moved = true;
            }
            while let Some(d) = self.c2s.pop_due(self.now_us) {
                self.server.on_datagram(&d, t);
                moved = true;
            }
            while let Some(d) = self.s2c.pop_due(self.now_us) {
                self.client.on_datagram(&d, t);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    /// Advance virtual time to the next scheduled event, capped at
    /// `limit_us`. Returns `false` when nothing is scheduled before the
    /// cap.
    pub fn advance(&mut self, limit_us: u64) -> bool {
        self.pump();
        let t = self.ts();
        let mut next: Option<u64> = None;
        for candidate in [
            self.c2s.next_arrival(),
            self.s2c.next_arrival(),
            self.client.poll_timeout(t).map(|d| self.to_virtual(d)),
            self.server.poll_timeout(t).map(|d| self.to_virtual(d)),
        ]
        .into_iter()
        .flatten()
        {
            next = Some(next.map_or(candidate, |n: u64| n.min(candidate)));
        }
        let Some(next) = next else {
            return false;
        };
        // Guarantee progress even when a deadline sits in the past.
        let next = next.max(self.now_us + 1);
        if next > limit_us {
            return false;
        }
        trace!(from_us = self.now_us, to_us = next, "advancing virtual clock");
        self.now_us = next;
        let t = self.ts();
        self.client.on_timeout(t);
        self.server.on_timeout(t);
        self.pump();
        true
    }

    /// Map a wrapped connection-clock deadline back onto virtual time.
    fn to_virtual(&self, deadline: PktTimestamp) -> u64 {
        let delta = deadline.0.wrapping_sub(self.ts().0) as i32;
        if delta <= 0 {
            self.now_us
        } else {
            self.now_us + delta as u64
        }
    }

    /// Run until the predicate holds or virtual time passes `limit_us`.
    pub fn run_until(&mut self, limit_us: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        loop {
            self.pump();
            if done(self) {
                return true;
            }
            if !self.advance(limit_us) {
                return done(self);
            }
        }
    }

    /// Drive the handshake to completion.
    pub fn establish(&mut self) -> Result<()> {
        self.client.connect(self.ts());
        let ok = self.run_until(5_000_000, |p| {
            p.client.state() == ConnState::Established
                && p.server.state() == ConnState::Established
        });
        if !ok {
            bail!(
                "handshake did not complete: client {:?}, server {:?}",
                self.client.state(),
                self.server.state()
            );
        }
        debug!(now_us = self.now_us, "simulated pair established");
        Ok(())
    }

    /// Feed payloads into a client stream as the window allows, pumping the
    /// simulation along the way.
    pub fn client_send_all(
        &mut self,
        stream_id: u8,
        payloads: &[Bytes],
        limit_us: u64,
    ) -> Result<usize> {
        use sliq_transport::stream::SendError;
        let mut sent = 0;
        while sent < payloads.len() {
            match self
                .client
                .send(stream_id, payloads[sent].clone(), self.ts())
            {
                Ok(()) => {
                    sent += 1;
                    if sent % 64 == 0 {
                        self.pump();
                    }
                }
                Err(SendError::FlowControlBlocked) => {
                    if !self.advance(limit_us) {
                        bail!("window never reopened after {sent} sends");
                    }
                }
                Err(err) => bail!("send failed after {sent}: {err}"),
            }
        }
        self.pump();
        Ok(sent)
    }

    /// Drain every payload currently deliverable on a server stream.
    pub fn server_recv_all(&mut self, stream_id: u8) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(p) = self.server.recv(stream_id) {
            out.push(p);
        }
        out
    }

    pub fn forward_dropped(&self) -> u64 {
        self.c2s.dropped()
    }
}
