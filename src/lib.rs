//! `tacho`: a shared TCP message-passing substrate, plus three services
//! built on top of it — a chunked FTP-style file service, a pub/sub
//! multicast coordinator with durable replay, and the primitives a
//! consistent-hash name-server ring would need (the ring protocol itself is
//! out of scope; see `DESIGN.md`).
//!
//! Layering, leaves first: [`wire`] frames bytes, [`queue`] decouples
//! producers from [`pool`]'s worker threads, [`pool`] owns all threading,
//! [`communication`] exposes message-oriented `Client`/`Server` atop the
//! pool's sender/receiver tasks, and [`transfer`], [`commands`], [`fs`],
//! [`ftp`], and [`coordinator`] build the three services on top of that.

pub mod commands;
pub mod communication;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fs;
pub mod ftp;
pub mod pool;
pub mod queue;
pub mod transfer;
pub mod wire;
