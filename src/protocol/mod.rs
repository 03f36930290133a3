//! Protocol Engines: SOCKS5 and HTTP state machines that exchange framed
//! bytes with the client up to the point where raw tunneling begins.

pub mod http;
pub mod socks5;
