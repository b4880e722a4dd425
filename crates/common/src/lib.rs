// Copyright (C) 2025 jrpc-proxy contributors
// SPDX-License-Identifier: AGPL-3.0
//! Shared utilities for jrpc-proxy components
//!
//! This crate provides the pieces used by both the proxy library and the
//! server binary, currently logging initialization for processes and tests.

pub mod logging;

pub use logging::*;
