//! # sliq-transport
//!
//! SLIQ (Scalable Lightweight IRON Quic-like) core: a connection-oriented,
//! multi-stream datagram transport over UDP with selectable reliability
//! (best-effort, semi-reliable, reliable), mixed ordered/unordered
//! delivery, adaptive-efficiency FEC with round-based retransmission, and
//! pluggable congestion control.
//!
//! The crate is sans-IO: sockets and timer wheels live outside. A driver
//! feeds datagrams and timer fires into a [`connection::Connection`] and
//! ships whatever `poll_transmit` hands back.
//!
//! ## Crate structure
//!
//! - [`seq`] — 32-bit serial-number spaces (sequences, timestamps)
//! - [`wire`] — header codec and datagram composition rules
//! - [`pool`] — slab-arena packet pool
//! - [`tables`] — adaptive-efficiency FEC degrees-of-freedom tables
//! - [`vdm`] — systematic Vandermonde coding over GF(2^8)
//! - [`fec`] — round-based FEC engine
//! - [`rtt`] — smoothed RTT estimation
//! - [`arq`] — sent-packet manager (ACK consumption, loss, abandonment)
//! - [`reassembly`] — receive-side ordering and ACK synthesis
//! - [`stream`] — per-stream composition and reliability modes
//! - [`connection`] — handshake, stream map, datagram assembly
//! - [`cc`] — congestion-control adapter and fixed-rate pacer
//! - [`stats`] — endpoint counters and loss estimation

pub mod arq;
pub mod cc;
pub mod connection;
pub mod fec;
pub mod pool;
pub mod reassembly;
pub mod rtt;
pub mod seq;
pub mod stats;
pub mod stream;
pub mod tables;
pub mod vdm;
pub mod wire;
