// Copyright (C) 2025 jrpc-proxy contributors
// SPDX-License-Identifier: AGPL-3.0
//! jrpc-proxy library
//!
//! A caching reverse proxy for JSON-RPC 2.0 over HTTP. Single and batched
//! calls are served from a tiered in-memory TTL cache or forwarded to one of
//! several upstream servers picked by a least-loaded balancer, and the
//! outcome is cached for a method-specific duration.

pub mod cache;
pub mod config;
pub mod item;
pub mod jsonrpc;
pub mod metrics;
pub mod proxy;
pub mod upstream;

pub use config::{CacheConfig, Config};
pub use proxy::{ProxyServer, ProxyServerBuilder};
