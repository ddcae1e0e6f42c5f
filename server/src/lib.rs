//! # Autohost Controller
//!
//! This library implements the controller service that runs alongside a
//! fleet of dedicated engine processes and exposes them to a remote lobby
//! over a single authenticated duplex channel. For every battle it spawns a
//! dedicated engine, speaks the engine's binary autohost protocol over a
//! local UDP channel, and translates engine-flavoured events (player
//! numbers, packet types) into lobby-flavoured updates (stable user ids,
//! tagged variants).
//!
//! ## Architecture Overview
//!
//! ### Single Mutation Task
//! The adapter, the events buffer and every battle's identity index are
//! mutated from the supervisor's one `select!` loop; the pool and the
//! registry each run their own task and communicate over channels. This
//! keeps the ordering guarantees (start before packets before exit,
//! capacity after the transition it reports) without shared locks.
//!
//! ### Ownership of a Battle
//! Each engine process is owned by exactly one runner task. The pool never
//! reaches into a runner; it registers for its events and posts commands
//! through a handle, so a crashing battle can only ever take itself down.
//!
//! ### Reconnect Discipline
//! The lobby connection is re-established forever with exponential backoff.
//! Battle updates keep accumulating in the time-indexed buffer while the
//! lobby is away, so a reconnecting lobby can catch up from the timestamp
//! it last saw.
//!
//! ## Module Organization
//!
//! - [`config`] — the configuration surface, schema-checked at startup
//! - [`player_index`] — bijective user-id/name/player-number index
//! - [`events_buffer`] — time-keyed single-subscriber update log
//! - [`start_script`] — start-script and settings-file rendering
//! - [`runner`] — one-battle state machine around an engine process
//! - [`games`] — the pool: port allocation, capacity, match timeout
//! - [`engines`] — installed-versions inventory and on-demand install
//! - [`adapter`] — lobby request surface and event projection
//! - [`lobby_client`] — OAuth2 handshake and the duplex channel
//! - [`dispatch`] — request routing against the command registry
//! - [`supervisor`] — wiring, reconnect loop, graceful shutdown

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod engines;
pub mod events_buffer;
pub mod games;
pub mod lobby_client;
pub mod player_index;
pub mod runner;
pub mod start_script;
pub mod supervisor;
