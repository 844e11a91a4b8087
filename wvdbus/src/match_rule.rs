//! Match rules, both for local signal dispatch and for `AddMatch`.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ErrorKind, Result};
use crate::message::Message;
use crate::protocol::MessageType;
use crate::value::Value;

/// The highest `argN` index the bus accepts.
pub const MAX_ARG_INDEX: u8 = 63;

/// A set of conditions on a message; unset fields match anything.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct MatchRule {
    pub msg_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub destination: Option<String>,
    /// `argN` conditions on string arguments.
    pub args: BTreeMap<u8, String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match signals with the given interface and member.
    pub fn new_signal(interface: &str, member: &str) -> Self {
        MatchRule {
            msg_type: Some(MessageType::Signal),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Default::default()
        }
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_arg(mut self, index: u8, value: &str) -> Self {
        self.args.insert(index, value.into());
        self
    }

    pub fn matches(&self, msg: &Message) -> bool {
        fn field(want: &Option<String>, got: Option<&str>) -> bool {
            match want {
                None => true,
                Some(w) => got == Some(w.as_str()),
            }
        }

        if let Some(t) = self.msg_type {
            if t != msg.msg_type() {
                return false;
            }
        }
        if !(field(&self.sender, msg.sender())
            && field(&self.interface, msg.interface())
            && field(&self.member, msg.member())
            && field(&self.path, msg.path())
            && field(&self.destination, msg.destination()))
        {
            return false;
        }
        if self.args.is_empty() {
            return true;
        }

        let Ok(body) = msg.body() else {
            return false;
        };
        self.args.iter().all(|(&i, want)| {
            matches!(body.get(i as usize), Some(Value::String(s)) if s == want)
        })
    }

    /// Parse the `key='value',...` form.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || ErrorKind::InvalidHeader(format!("invalid match rule \"{}\"", s));
        let mut rule = MatchRule::new();

        for (key, value) in split_pairs(s).ok_or_else(invalid)? {
            match key.as_str() {
                "type" => {
                    rule.msg_type = Some(MessageType::from_str_name(&value).ok_or_else(invalid)?)
                }
                "sender" => rule.sender = Some(value),
                "interface" => rule.interface = Some(value),
                "member" => rule.member = Some(value),
                "path" => rule.path = Some(value),
                "destination" => rule.destination = Some(value),
                k => {
                    let index = k
                        .strip_prefix("arg")
                        .and_then(|n| n.parse::<u8>().ok())
                        .filter(|&n| n <= MAX_ARG_INDEX)
                        .ok_or_else(invalid)?;
                    rule.args.insert(index, value);
                }
            }
        }
        Ok(rule)
    }
}

/// Split into key/value pairs; values may be quoted with `'`, and `\'`
/// outside quotes is a literal quote.
fn split_pairs(s: &str) -> Option<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => key.push(c),
                None => return None,
            }
        }
        let key = key.trim().to_owned();
        if key.is_empty() {
            return None;
        }

        let mut value = String::new();
        let mut quoted = false;
        loop {
            match chars.next() {
                None => break,
                Some('\'') => quoted = !quoted,
                Some('\\') if !quoted && chars.peek() == Some(&'\'') => {
                    chars.next();
                    value.push('\'');
                }
                Some(',') if !quoted => break,
                Some(c) => value.push(c),
            }
        }
        if quoted {
            return None;
        }
        pairs.push((key, value));
    }
    Some(pairs)
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(t) = self.msg_type {
            parts.push(format!("type={}", quote(t.as_str())));
        }
        for (key, value) in [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("destination", &self.destination),
        ] {
            if let Some(v) = value {
                parts.push(format!("{}={}", key, quote(v)));
            }
        }
        for (i, v) in &self.args {
            parts.push(format!("arg{}={}", i, quote(v)));
        }
        f.write_str(&parts.join(","))
    }
}

impl std::str::FromStr for MatchRule {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        MatchRule::parse(s)
    }
}
