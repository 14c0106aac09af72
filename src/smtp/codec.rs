//! SMTP reply line parsing and command framing.

use crate::error::{MtaError, Result};

/// The first digit of a three-digit SMTP reply code, which is all the
/// state machine ever branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// 2xx
    Ok,
    /// 3xx
    IntermediateOk,
    /// 4xx
    TempFail,
    /// 5xx
    PermFail,
}

impl ReplyClass {
    fn from_digit(d: u8) -> Option<Self> {
        match d {
            b'2' => Some(ReplyClass::Ok),
            b'3' => Some(ReplyClass::IntermediateOk),
            b'4' => Some(ReplyClass::TempFail),
            b'5' => Some(ReplyClass::PermFail),
            _ => None,
        }
    }

    pub fn is_ok2(self) -> bool {
        matches!(self, ReplyClass::Ok)
    }

    /// 2xx or 3xx: good enough to continue the dialog.
    pub fn is_ok23(self) -> bool {
        matches!(self, ReplyClass::Ok | ReplyClass::IntermediateOk)
    }

    pub fn first_digit(self) -> u8 {
        match self {
            ReplyClass::Ok => b'2',
            ReplyClass::IntermediateOk => b'3',
            ReplyClass::TempFail => b'4',
            ReplyClass::PermFail => b'5',
        }
    }
}

/// One parsed SMTP reply line: `DDD<SP|-><text>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    pub class: ReplyLineClass,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyLineClass {
    /// More lines of this reply follow (`-` separator).
    Continuation,
    /// This is the last line of the reply (` ` separator).
    Terminal,
}

impl ReplyLine {
    pub fn is_continuation(&self) -> bool {
        matches!(self.class, ReplyLineClass::Continuation)
    }

    pub fn class(&self) -> ReplyClass {
        // The grammar guarantees `code` is three digits, so the first
        // digit always parses.
        ReplyClass::from_digit((self.code / 100) as u8 + b'0').expect("validated on parse")
    }
}

/// Parse one raw line (without the trailing CRLF) of an SMTP reply.
///
/// Returns a fatal protocol error if the line does not match
/// `DDD<SP|-><text>`. Line-length enforcement is the caller's (the byte
/// stream's) responsibility.
pub fn parse_reply_line(line: &str) -> Result<ReplyLine> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 {
        return Err(MtaError::Protocol(format!("reply line too short: {:?}", line)));
    }
    if !bytes[0..3].iter().all(u8::is_ascii_digit) {
        return Err(MtaError::Protocol(format!("malformed reply code: {:?}", line)));
    }
    let code: u16 = line[0..3]
        .parse()
        .map_err(|_| MtaError::Protocol(format!("malformed reply code: {:?}", line)))?;

    let class = match bytes[3] {
        b' ' => ReplyLineClass::Terminal,
        b'-' => ReplyLineClass::Continuation,
        _ => return Err(MtaError::Protocol(format!("bad reply separator: {:?}", line))),
    };

    if ReplyClass::from_digit(bytes[0]).is_none() {
        return Err(MtaError::Protocol(format!("unknown reply class: {:?}", line)));
    }

    Ok(ReplyLine {
        code,
        class,
        text: line[4..].to_string(),
    })
}

/// Build an outgoing command line, rejecting arguments that contain
/// control bytes (CR/LF injection) rather than formatting them straight
/// into the wire line.
pub struct CommandBuilder;

impl CommandBuilder {
    /// Serialize `verb` plus an optional argument string as
    /// `VERB[ args]\r\n`.
    pub fn build(verb: &str, args: Option<&str>) -> Result<Vec<u8>> {
        if let Some(a) = args {
            if a.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
                return Err(MtaError::Protocol(format!(
                    "refusing to send command argument containing control bytes: {:?}",
                    a
                )));
            }
        }
        let mut line = String::with_capacity(verb.len() + args.map_or(0, |a| a.len() + 1) + 2);
        line.push_str(verb);
        if let Some(a) = args {
            line.push(' ');
            line.push_str(a);
        }
        line.push_str("\r\n");
        Ok(line.into_bytes())
    }
}
