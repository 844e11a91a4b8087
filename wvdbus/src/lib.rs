//!D-Bus protocol engine: the binary wire format, authenticated connections and a readiness
//!event loop to drive them.
//!
//!A [`Connection`] speaks the D-Bus wire protocol over a unix or TCP socket. It
//!authenticates with `SASL EXTERNAL`, numbers outgoing messages, correlates replies with
//!their calls and dispatches everything else to filters, signal handlers and registered
//![`Interface`]s.
//!
//!Calling a method on the session bus:
//!
//!```rust,no_run
//!# fn main() -> wvdbus::Result<()> {
//!let mut conn = wvdbus::Connection::session()?;
//!let reply = conn.call_method(
//!    Some("org.freedesktop.DBus"),
//!    "/org/freedesktop/DBus",
//!    Some("org.freedesktop.DBus"),
//!    "ListNames",
//!    vec![],
//!)?;
//!println!("{}", reply.body()?[0]);
//!# Ok(())
//!# }
//!```
//!
//!Serving an interface to a peer:
//!
//!```rust,no_run
//!use std::sync::Arc;
//!use wvdbus::{Call, CallTrait, ConnectionConfig, Interface, Listener, Result};
//!
//!struct Db;
//!
//!impl Interface for Db {
//!    fn get_name(&self) -> &str {
//!        "vx.db"
//!    }
//!
//!    fn call(&self, call: &mut Call) -> Result<()> {
//!        match call.request.member() {
//!            Some("ExecScalar") => call.reply(vec![1i32.into()]),
//!            _ => call.reply_unknown_method(),
//!        }
//!    }
//!}
//!
//!# fn main() -> Result<()> {
//!let listener = Listener::new("unix:path=/tmp/vx.db")?;
//!let guid = wvdbus::auth::generate_guid();
//!let mut conn = listener.accept_connection(&guid, None, ConnectionConfig::peer_to_peer())?;
//!conn.register_interface(Arc::new(Db));
//!while conn.handle_message(None).is_ok() {}
//!# Ok(())
//!# }
//!```
//!
//!To serve many connections from one thread, wrap each in an
//!`Arc<parking_lot::Mutex<Connection>>` and [`Connection::attach`] it to an [`EventLoop`].
//!
//!Supported addresses are `unix:path=...`, `unix:abstract=...` (Linux only) and
//!`tcp:host=...,port=...`, separated by `;`.

pub mod address;
pub mod auth;
mod bus;
pub mod codec;
mod connection;
mod error;
mod eventloop;
mod interface;
mod match_rule;
mod message;
pub mod protocol;
mod ringbuf;
mod server;
mod signature;
pub mod stream;
mod value;

#[cfg(test)]
mod test;

pub use crate::address::{Address, Transport};
pub use crate::bus::{bus_call, NameFlags, ReleaseNameReply, RequestNameReply, StartReply};
pub use crate::connection::{Connection, ConnectionConfig, HandlerId, ReplyCallback, State};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::eventloop::{
    Action, EventLoop, LoopConfig, LoopHandle, SocketCallback, SourceId, TimerCallback,
};
pub use crate::interface::{introspect_xml, machine_id, Call, CallTrait, Interface};
pub use crate::match_rule::MatchRule;
pub use crate::message::Message;
pub use crate::protocol::{Endian, Flags, MessageType};
pub use crate::ringbuf::RingBuffer;
pub use crate::server::Listener;
pub use crate::signature::Signature;
pub use crate::stream::Stream;
pub use crate::value::{Array, ObjectPath, Value};
