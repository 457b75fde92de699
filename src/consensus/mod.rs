//! DPoS consensus for Quotro.
//!
//! The engine extends a Clique-style signer rotation with stake-weighted
//! election:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DPoS epoch cycle                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  Blocks (k−1)·E+1 .. k·E−1: elected signers rotate           │
//! │  round-robin; each header may carry one proposal vote.       │
//! │                                                              │
//! │  Block k·E−1 (pre-epoch): election. Under-producing signers  │
//! │  are kicked, candidates are ranked by delegated stake, the   │
//! │  top maxSignerSize become the pre-elected signers with       │
//! │  balance-proportional delegator portions.                    │
//! │                                                              │
//! │  Block k·E (epoch): commits the election in its extra;       │
//! │  pre-elected sets activate, votes and tallies reset.         │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`config::DposConfig`]: engine parameters and reward schedule
//! - [`dpos::Dpos`]: the consensus engine
//! - [`dpos::Snapshot`]: rolling election and voting state
//! - [`dpos::DposApi`]: RPC surface for the `dpos` namespace
//! - [`traits`]: chain, state and storage collaborators

pub mod config;
pub mod dpos;
pub mod traits;
