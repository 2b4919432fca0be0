use std::fmt;

use crate::WireError;

/// MySQL text-protocol command tags.
///
/// Byte values from mysql_com.h; the string names follow the server's
/// convention so they line up with what operators see in `SHOW PROCESSLIST`
/// and server metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Deprecated1 = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
}

impl CommandType {
    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        use CommandType::*;
        Ok(match b {
            0x00 => Sleep,
            0x01 => Quit,
            0x02 => InitDb,
            0x03 => Query,
            0x04 => FieldList,
            0x05 => CreateDb,
            0x06 => DropDb,
            0x07 => Refresh,
            0x08 => Deprecated1,
            0x09 => Statistics,
            0x0a => ProcessInfo,
            0x0b => Connect,
            0x0c => ProcessKill,
            0x0d => Debug,
            0x0e => Ping,
            0x0f => Time,
            0x10 => DelayedInsert,
            0x11 => ChangeUser,
            0x12 => BinlogDump,
            0x13 => TableDump,
            0x14 => ConnectOut,
            0x15 => RegisterSlave,
            0x16 => StmtPrepare,
            0x17 => StmtExecute,
            0x18 => StmtSendLongData,
            0x19 => StmtClose,
            0x1a => StmtReset,
            0x1b => SetOption,
            0x1c => StmtFetch,
            0x1d => Daemon,
            0x1e => BinlogDumpGtid,
            0x1f => ResetConnection,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        use CommandType::*;
        match self {
            Sleep => "Sleep",
            Quit => "Quit",
            InitDb => "InitDB",
            Query => "Query",
            FieldList => "FieldList",
            CreateDb => "CreateDB",
            DropDb => "DropDB",
            Refresh => "Refresh",
            Deprecated1 => "(DEPRECATED)Shutdown",
            Statistics => "Statistics",
            ProcessInfo => "ProcessInfo",
            Connect => "Connect",
            ProcessKill => "ProcessKill",
            Debug => "Debug",
            Ping => "Ping",
            Time => "Time",
            DelayedInsert => "DelayedInsert",
            ChangeUser => "ChangeUser",
            BinlogDump => "BinlogDump",
            TableDump => "TableDump",
            ConnectOut => "ConnectOut",
            RegisterSlave => "RegisterSlave",
            StmtPrepare => "StmtPrepare",
            StmtExecute => "StmtExecute",
            StmtSendLongData => "StmtSendLongData",
            StmtClose => "StmtClose",
            StmtReset => "StmtReset",
            SetOption => "SetOption",
            StmtFetch => "StmtFetch",
            Daemon => "Daemon",
            BinlogDumpGtid => "BinlogDumpGtid",
            ResetConnection => "ResetConnect",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        for b in 0x00..=0x1f {
            let cmd = CommandType::from_byte(b).unwrap();
            assert_eq!(cmd.as_byte(), b);
        }
        assert!(CommandType::from_byte(0x20).is_err());
        assert!(CommandType::from_byte(0xff).is_err());
    }

    #[test]
    fn names_match_server_convention() {
        assert_eq!(CommandType::Query.to_string(), "Query");
        assert_eq!(CommandType::ChangeUser.to_string(), "ChangeUser");
        assert_eq!(CommandType::StmtExecute.to_string(), "StmtExecute");
    }
}
