//! # Autohost Wire Protocols
//!
//! Wire-level types shared across the controller: the binary codec for the
//! engine's local UDP autohost channel, and the JSON protocol spoken with
//! the remote lobby over the duplex channel.
//!
//! ## Module Organization
//!
//! ### Autohost Codec (`autohost`)
//! Strict decode of framed engine datagrams into [`autohost::EngineEvent`]
//! variants, plus the serializers for outbound chat lines and `/commands`.
//! Pure and synchronous; callers decide what a failed decode means.
//!
//! ### Lobby Protocol (`lobby`)
//! Envelope validation for the duplex channel, typed per-command request
//! payloads (serde deserialization is the command schema), pure
//! response/event builders, and the domain error carried by `failed`
//! responses.
//!
//! ### Updates (`updates`)
//! The lobby-facing projection types: [`updates::LobbyUpdate`] tagged
//! variants keyed by user id, and the timestamped [`updates::BufferedEvent`]
//! record delivered through `autohost/subscribeUpdates`.

pub mod autohost;
pub mod lobby;
pub mod updates;
