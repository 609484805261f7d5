//! Connectionless periodic broadcast of isochronous streams: a [broadcaster] that advertises a
//!  periodic announcement and pushes a counter over every stream of a broadcast group, and a
//!  [receiver] that discovers the announcement, synchronizes to it and consumes the streams.
//!
//! The radio itself is an external collaborator behind the traits in [transport].

pub mod broadcaster;
pub mod error;
pub mod receiver;
pub mod stream_channel;
pub mod transport;
