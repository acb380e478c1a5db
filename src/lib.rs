// SPF Tool Gateway - Library Root
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// All modules exported here for use by the binary and tests.

pub mod paths;
pub mod config;
pub mod error;
pub mod session;
pub mod storage;

// ============================================================================
// GATEWAY CORE
// ============================================================================

/// Time-bounded, capacity-bounded seen-set for event ids
pub mod dedupe;

/// Path and shell-command access checks
pub mod policy;

/// Per-session policies, customized ones persisted for the retention window
pub mod policy_store;

/// Human approval for sensitive tools
pub mod approval;

/// Code-intelligence bridge HTTP client
pub mod bridge;

/// Tool specs and source precedence
pub mod registry;

/// In-process tools
pub mod native;

/// External agent backend contract
pub mod remote;

/// Dispatch pipeline: registry, policy, approval, backend, outcome event
pub mod router;

/// Upstream channels fanned out to local subscribers
pub mod events;

/// JSON-RPC stdio server
pub mod server;
