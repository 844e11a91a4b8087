//! Calls to the message bus daemon (`org.freedesktop.DBus`).

use crate::connection::Connection;
use crate::error::{ErrorKind, Result};
use crate::match_rule::MatchRule;
use crate::message::Message;
use crate::protocol::{BUS_INTERFACE, BUS_NAME, BUS_PATH};
use crate::value::Value;

bitflags::bitflags! {
    /// Flags for [`Connection::request_name`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Default)]
    pub struct NameFlags: u32 {
        const ALLOW_REPLACEMENT = 0x1;
        const REPLACE_EXISTING = 0x2;
        const DO_NOT_QUEUE = 0x4;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StartReply {
    Success,
    AlreadyRunning,
}

fn unexpected(member: &str, code: u32) -> crate::error::Error {
    ErrorKind::InvalidHeader(format!("{} returned unknown code {}", member, code)).into()
}

impl RequestNameReply {
    fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => RequestNameReply::PrimaryOwner,
            2 => RequestNameReply::InQueue,
            3 => RequestNameReply::Exists,
            4 => RequestNameReply::AlreadyOwner,
            _ => return Err(unexpected("RequestName", code)),
        })
    }
}

impl ReleaseNameReply {
    fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => ReleaseNameReply::Released,
            2 => ReleaseNameReply::NonExistent,
            3 => ReleaseNameReply::NotOwner,
            _ => return Err(unexpected("ReleaseName", code)),
        })
    }
}

impl StartReply {
    fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => StartReply::Success,
            2 => StartReply::AlreadyRunning,
            _ => return Err(unexpected("StartServiceByName", code)),
        })
    }
}

/// Build a call to the bus daemon.
pub fn bus_call(member: &str, args: Vec<Value>) -> Result<Message> {
    Message::method_call(Some(BUS_NAME), BUS_PATH, Some(BUS_INTERFACE), member)?.with_args(args)
}

impl Connection {
    /// Call `member` on the bus and return the reply body, which must have
    /// signature `sig`.
    fn bus_method(&mut self, member: &str, args: Vec<Value>, sig: &str) -> Result<Vec<Value>> {
        let mut msg = bus_call(member, args)?;
        let reply = self.send_and_wait(&mut msg)?;
        reply.check(sig)
    }

    fn bus_value<T>(&mut self, member: &str, args: Vec<Value>, sig: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = crate::error::Error>,
    {
        let value = self
            .bus_method(member, args, sig)?
            .into_iter()
            .next()
            .ok_or_else(|| ErrorKind::InvalidHeader(format!("{} returned no value", member)))?;
        T::try_from(value)
    }

    fn bus_u32(&mut self, member: &str, args: Vec<Value>) -> Result<u32> {
        self.bus_value(member, args, "u")
    }

    fn bus_string(&mut self, member: &str, args: Vec<Value>) -> Result<String> {
        self.bus_value(member, args, "s")
    }

    /// Register with the bus; stores and returns the assigned unique name.
    pub fn hello(&mut self) -> Result<String> {
        let name = self.bus_string("Hello", vec![])?;
        log::debug!("bus assigned unique name {}", name);
        self.unique_name = Some(name.clone());
        Ok(name)
    }

    pub fn request_name(&mut self, name: &str, flags: NameFlags) -> Result<RequestNameReply> {
        let code = self.bus_u32("RequestName", vec![name.into(), flags.bits().into()])?;
        RequestNameReply::from_code(code)
    }

    pub fn release_name(&mut self, name: &str) -> Result<ReleaseNameReply> {
        let code = self.bus_u32("ReleaseName", vec![name.into()])?;
        ReleaseNameReply::from_code(code)
    }

    pub fn name_has_owner(&mut self, name: &str) -> Result<bool> {
        self.bus_value("NameHasOwner", vec![name.into()], "b")
    }

    /// Ask the bus to activate `name`. No `flags` are defined yet; pass 0.
    pub fn start_service_by_name(&mut self, name: &str, flags: u32) -> Result<StartReply> {
        let code = self.bus_u32("StartServiceByName", vec![name.into(), flags.into()])?;
        StartReply::from_code(code)
    }

    /// Ask the bus to route messages matching `rule` to this connection.
    pub fn add_match(&mut self, rule: &MatchRule) -> Result<()> {
        self.add_match_str(&rule.to_string())
    }

    pub fn add_match_str(&mut self, rule: &str) -> Result<()> {
        self.bus_method("AddMatch", vec![rule.into()], "")?;
        Ok(())
    }

    pub fn remove_match(&mut self, rule: &MatchRule) -> Result<()> {
        self.remove_match_str(&rule.to_string())
    }

    pub fn remove_match_str(&mut self, rule: &str) -> Result<()> {
        self.bus_method("RemoveMatch", vec![rule.into()], "")?;
        Ok(())
    }

    pub fn get_name_owner(&mut self, name: &str) -> Result<String> {
        self.bus_string("GetNameOwner", vec![name.into()])
    }

    pub fn list_names(&mut self) -> Result<Vec<String>> {
        let names: crate::value::Array = self.bus_value("ListNames", vec![], "as")?;
        names.into_items().into_iter().map(String::try_from).collect()
    }

    pub fn get_connection_unix_user(&mut self, name: &str) -> Result<u32> {
        self.bus_u32("GetConnectionUnixUser", vec![name.into()])
    }

    pub fn get_connection_unix_process_id(&mut self, name: &str) -> Result<u32> {
        self.bus_u32("GetConnectionUnixProcessID", vec![name.into()])
    }

    /// The bus daemon's GUID.
    pub fn get_id(&mut self) -> Result<String> {
        self.bus_string("GetId", vec![])
    }
}
