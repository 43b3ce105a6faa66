use ferry_types::ErrorKind;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

pub const PROTOCOL_NAME: &str = "ferry";
pub const PROTOCOL_SERVICE: &str = "storage";
pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Block length marking the end of a stream.
pub const BLOCK_END: u32 = 0;
/// Block length sent by a writer that abandons the stream.
pub const BLOCK_ABORT: u32 = u32::MAX;
/// Block length announcing that an error frame follows instead of data.
pub const BLOCK_ERROR: u32 = u32::MAX - 1;
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Command names understood by a ferry peer.
pub mod commands {
    pub const NOOP: &str = "noop";
    pub const EXIT: &str = "exit";
    pub const STORAGE_FEATURE: &str = "storage.feature";
    pub const STORAGE_INFO: &str = "storage.info";
    pub const STORAGE_LIST: &str = "storage.list";
    pub const STORAGE_OPEN_READ: &str = "storage.open-read";
    pub const STORAGE_OPEN_WRITE: &str = "storage.open-write";
    pub const STORAGE_REMOVE: &str = "storage.remove";
    pub const STORAGE_PATH_CREATE: &str = "storage.path-create";
    pub const STORAGE_PATH_REMOVE: &str = "storage.path-remove";
    pub const STORAGE_PATH_SYNC: &str = "storage.path-sync";
}

/// Identity a server announces as soon as a channel opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub name: String,
    pub service: String,
    pub version: u32,
}

impl Greeting {
    pub fn current() -> Self {
        Self {
            name: PROTOCOL_NAME.into(),
            service: PROTOCOL_SERVICE.into(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Check a received greeting against the expected one, field by field.
    pub fn check(&self, received: &Greeting) -> ProtocolResult<()> {
        let mismatch = |field, expected: String, found: String| ProtocolError::VersionMismatch {
            field,
            expected,
            found,
        };
        if received.name != self.name {
            return Err(mismatch("name", self.name.clone(), received.name.clone()));
        }
        if received.service != self.service {
            return Err(mismatch("service", self.service.clone(), received.service.clone()));
        }
        if received.version != self.version {
            return Err(mismatch("version", self.version.to_string(), received.version.to_string()));
        }
        Ok(())
    }
}

/// A typed command parameter or response value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
    Binary(Vec<u8>),
    List(Vec<Param>),
}

impl Param {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Str(_) => "str",
            Self::Binary(_) => "binary",
            Self::List(_) => "list",
        }
    }

    pub fn opt_str(value: Option<&str>) -> Self {
        value.map_or(Self::Null, |s| Self::Str(s.to_string()))
    }

    pub fn opt_u64(value: Option<u64>) -> Self {
        value.map_or(Self::Null, Self::UInt)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<u64> for Param {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<u32> for Param {
    fn from(value: u32) -> Self {
        Self::UInt(value.into())
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Positional reader over a parameter list.
pub struct Params<'a> {
    values: &'a [Param],
    index: usize,
}

impl<'a> Params<'a> {
    pub fn new(values: &'a [Param]) -> Self {
        Self { values, index: 0 }
    }

    fn next(&mut self, expected: &str) -> ProtocolResult<&'a Param> {
        let value = self.values.get(self.index).ok_or_else(|| {
            ProtocolError::Parameter(format!("missing parameter {} ({expected})", self.index))
        })?;
        self.index += 1;
        Ok(value)
    }

    fn wrong(&self, expected: &str, found: &Param) -> ProtocolError {
        ProtocolError::Parameter(format!(
            "parameter {} expected {expected}, found {}",
            self.index - 1,
            found.type_name()
        ))
    }

    pub fn str(&mut self) -> ProtocolResult<&'a str> {
        match self.next("str")? {
            Param::Str(s) => Ok(s),
            other => Err(self.wrong("str", other)),
        }
    }

    pub fn opt_str(&mut self) -> ProtocolResult<Option<&'a str>> {
        match self.next("str or null")? {
            Param::Null => Ok(None),
            Param::Str(s) => Ok(Some(s)),
            other => Err(self.wrong("str or null", other)),
        }
    }

    pub fn bool(&mut self) -> ProtocolResult<bool> {
        match self.next("bool")? {
            Param::Bool(b) => Ok(*b),
            other => Err(self.wrong("bool", other)),
        }
    }

    pub fn u64(&mut self) -> ProtocolResult<u64> {
        match self.next("uint")? {
            Param::UInt(n) => Ok(*n),
            Param::Int(n) if *n >= 0 => Ok(*n as u64),
            other => Err(self.wrong("uint", other)),
        }
    }

    pub fn opt_u64(&mut self) -> ProtocolResult<Option<u64>> {
        match self.next("uint or null")? {
            Param::Null => Ok(None),
            Param::UInt(n) => Ok(Some(*n)),
            other => Err(self.wrong("uint or null", other)),
        }
    }

    pub fn u32(&mut self) -> ProtocolResult<u32> {
        let n = self.u64()?;
        u32::try_from(n).map_err(|_| ProtocolError::Parameter(format!("{n} does not fit in u32")))
    }

    pub fn opt_u32(&mut self) -> ProtocolResult<Option<u32>> {
        self.opt_u64()?
            .map(|n| u32::try_from(n).map_err(|_| ProtocolError::Parameter(format!("{n} does not fit in u32"))))
            .transpose()
    }

    pub fn i64(&mut self) -> ProtocolResult<i64> {
        match self.next("int")? {
            Param::Int(n) => Ok(*n),
            Param::UInt(n) => i64::try_from(*n)
                .map_err(|_| ProtocolError::Parameter(format!("{n} does not fit in i64"))),
            other => Err(self.wrong("int", other)),
        }
    }

    pub fn opt_i64(&mut self) -> ProtocolResult<Option<i64>> {
        if matches!(self.values.get(self.index), Some(Param::Null)) {
            self.index += 1;
            return Ok(None);
        }
        self.i64().map(Some)
    }

    pub fn binary(&mut self) -> ProtocolResult<&'a [u8]> {
        match self.next("binary")? {
            Param::Binary(b) => Ok(b),
            other => Err(self.wrong("binary", other)),
        }
    }

    pub fn list(&mut self) -> ProtocolResult<&'a [Param]> {
        match self.next("list")? {
            Param::List(items) => Ok(items),
            other => Err(self.wrong("list", other)),
        }
    }

    pub fn remaining(&self) -> usize {
        self.values.len().saturating_sub(self.index)
    }
}

/// Unit of exchange on a protocol channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Greeting(Greeting),
    Command { command: String, params: Vec<Param> },
    Response { values: Vec<Param> },
    Error { kind: ErrorKind, message: String },
}

impl Frame {
    pub fn command(command: &str, params: Vec<Param>) -> Self {
        Self::Command {
            command: command.to_string(),
            params,
        }
    }

    pub fn response(values: Vec<Param>) -> Self {
        Self::Response { values }
    }

    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Greeting(_) => 1,
            Self::Command { .. } => 2,
            Self::Response { .. } => 3,
            Self::Error { .. } => 255,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Greeting(_) => "Greeting",
            Self::Command { .. } => "Command",
            Self::Response { .. } => "Response",
            Self::Error { .. } => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_matches_itself() {
        Greeting::current().check(&Greeting::current()).unwrap();
    }

    #[test]
    fn greeting_mismatch_names_field() {
        let mut other = Greeting::current();
        other.version = PROTOCOL_VERSION + 1;
        let err = Greeting::current().check(&other).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { field: "version", .. }));

        let mut other = Greeting::current();
        other.service = "archive".into();
        let err = Greeting::current().check(&other).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { field: "service", .. }));
    }

    #[test]
    fn params_read_in_order() {
        let values = vec![
            Param::from("/repo/file"),
            Param::Bool(true),
            Param::Null,
            Param::UInt(0o640),
            Param::Int(-5),
            Param::Null,
        ];
        let mut params = Params::new(&values);
        assert_eq!(params.str().unwrap(), "/repo/file");
        assert!(params.bool().unwrap());
        assert_eq!(params.opt_str().unwrap(), None);
        assert_eq!(params.u32().unwrap(), 0o640);
        assert_eq!(params.i64().unwrap(), -5);
        assert_eq!(params.opt_i64().unwrap(), None);
        assert_eq!(params.remaining(), 0);
        assert!(matches!(params.bool(), Err(ProtocolError::Parameter(_))));
    }

    #[test]
    fn params_type_mismatch() {
        let values = vec![Param::UInt(1)];
        let err = Params::new(&values).str().unwrap_err();
        assert!(err.to_string().contains("expected str, found uint"));
    }

    #[test]
    fn type_tags_unique() {
        let frames = [
            Frame::Greeting(Greeting::current()),
            Frame::command(commands::NOOP, vec![]),
            Frame::response(vec![]),
            Frame::Error { kind: ErrorKind::Io, message: String::new() },
        ];
        let mut tags: Vec<u8> = frames.iter().map(|f| f.type_tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), frames.len());
    }

    #[test]
    fn block_markers_do_not_collide() {
        assert!(MAX_BLOCK_SIZE < BLOCK_ERROR as usize);
        assert_ne!(BLOCK_ERROR, BLOCK_ABORT);
        assert_ne!(BLOCK_END, BLOCK_ABORT);
    }
}
