//! Serving method calls.
//!
//! An [`Interface`] is registered on a [`Connection`] under its name. Method
//! calls for that interface are handed to [`Interface::call`] together with
//! a [`Call`], through which the handler replies.
//!
//!# Examples
//!
//! ```rust
//! use wvdbus::{Call, CallTrait, Interface, Result, Value};
//!
//! struct Echo;
//!
//! impl Interface for Echo {
//!     fn get_name(&self) -> &str {
//!         "org.example.Echo"
//!     }
//!
//!     fn call(&self, call: &mut Call) -> Result<()> {
//!         match call.request.member() {
//!             Some("Echo") => {
//!                 let args = call.args()?;
//!                 call.reply(args)
//!             }
//!             _ => call.reply_unknown_method(),
//!         }
//!     }
//! }
//! # fn main() {}
//! ```

use std::fs;

use crate::connection::Connection;
use crate::error::Result;
use crate::message::Message;
use crate::protocol::{
    ERROR_INVALID_ARGS, ERROR_UNKNOWN_METHOD, INTROSPECTABLE_INTERFACE, PEER_INTERFACE,
};
use crate::value::Value;

/// Implemented by anything that answers method calls for one interface name.
pub trait Interface: Send + Sync {
    fn get_name(&self) -> &str;

    /// The `<interface>` element describing this interface for
    /// `org.freedesktop.DBus.Introspectable.Introspect`.
    fn get_description(&self) -> String {
        format!("  <interface name=\"{}\"/>\n", self.get_name())
    }

    /// Handle one method call.
    ///
    /// Returning `Err` sends an `org.freedesktop.DBus.Error.Failed` error
    /// carrying the error text. Returning `Ok` without replying sends an
    /// empty method return if the caller expects one.
    fn call(&self, call: &mut Call) -> Result<()>;
}

/// An inbound method call being handled.
pub struct Call<'a> {
    connection: &'a mut Connection,
    pub request: &'a Message,
    reply: Option<Message>,
}

impl<'a> Call<'a> {
    pub(crate) fn new(connection: &'a mut Connection, request: &'a Message) -> Self {
        Call {
            connection,
            request,
            reply: None,
        }
    }

    /// The connection the call came in on, e.g. for nested calls.
    pub fn connection(&mut self) -> &mut Connection {
        &mut *self.connection
    }

    /// The decoded arguments of the call.
    pub fn args(&self) -> Result<Vec<Value>> {
        self.request.body()
    }

    pub(crate) fn take_reply(&mut self) -> Option<Message> {
        self.reply.take()
    }
}

/// Convenience methods for replying to a [`Call`].
pub trait CallTrait {
    /// Don't use this directly. Rather use [`reply`](CallTrait::reply) or one
    /// of the error replies.
    fn reply_message(&mut self, reply: Message) -> Result<()>;

    fn get_request(&self) -> &Message;

    /// True, if the caller does not want a reply.
    fn is_oneway(&self) -> bool {
        !self.get_request().expects_reply()
    }

    /// Reply with `args` as the return values.
    fn reply(&mut self, args: Vec<Value>) -> Result<()> {
        let reply = self.get_request().reply(args)?;
        self.reply_message(reply)
    }

    fn reply_error(&mut self, name: &str, text: &str) -> Result<()> {
        let reply = self.get_request().error_reply(name, text);
        self.reply_message(reply)
    }

    /// Reply with the standard `org.freedesktop.DBus.Error.UnknownMethod` error.
    fn reply_unknown_method(&mut self) -> Result<()> {
        let text = unknown_method_text(self.get_request());
        self.reply_error(ERROR_UNKNOWN_METHOD, &text)
    }

    /// Reply with the standard `org.freedesktop.DBus.Error.InvalidArgs` error.
    fn reply_invalid_args(&mut self, text: &str) -> Result<()> {
        self.reply_error(ERROR_INVALID_ARGS, text)
    }
}

impl CallTrait for Call<'_> {
    fn reply_message(&mut self, reply: Message) -> Result<()> {
        if !self.is_oneway() {
            self.reply = Some(reply);
        }
        Ok(())
    }

    fn get_request(&self) -> &Message {
        self.request
    }
}

pub(crate) fn unknown_method_text(request: &Message) -> String {
    format!(
        "Method \"{}\" with signature \"{}\" on interface \"{}\" doesn't exist",
        request.member().unwrap_or_default(),
        request.signature(),
        request.interface().unwrap_or_default()
    )
}

const PEER_XML: &str = "  <interface name=\"org.freedesktop.DBus.Peer\">
    <method name=\"Ping\"/>
    <method name=\"GetMachineId\">
      <arg name=\"machine_uuid\" type=\"s\" direction=\"out\"/>
    </method>
  </interface>
";

const INTROSPECTABLE_XML: &str = "  <interface name=\"org.freedesktop.DBus.Introspectable\">
    <method name=\"Introspect\">
      <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>
    </method>
  </interface>
";

/// The introspection document for an object serving `interfaces`.
pub fn introspect_xml<'a, I>(interfaces: I) -> String
where
    I: IntoIterator<Item = &'a dyn Interface>,
{
    let mut xml = String::from(
        "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n<node>\n",
    );
    xml.push_str(PEER_XML);
    xml.push_str(INTROSPECTABLE_XML);
    for i in interfaces {
        if i.get_name() != PEER_INTERFACE && i.get_name() != INTROSPECTABLE_INTERFACE {
            xml.push_str(&i.get_description());
        }
    }
    xml.push_str("</node>\n");
    xml
}

/// This machine's D-Bus id, or a generated one if none is on disk.
pub fn machine_id() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = fs::read_to_string(path) {
            let id = id.trim();
            if id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return id.to_owned();
            }
        }
    }
    crate::auth::generate_guid()
}
