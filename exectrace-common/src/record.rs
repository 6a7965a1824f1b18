//! Trace log wire records
//!
//! One record per line, fields separated by single spaces. A record starts with
//! a three-letter subject and a three-letter action:
//!
//! ```text
//! thr crt 0x00007F3A5C000B70 0x00000003
//! fun nam 0x00000007 "System.Collections.Generic.List<T>::Add"
//! str sam 0x00000003 1520 2 2:3:00007F3A61234AB0 0x7 0x9:00007F3A61235000
//! ```
//!
//! Pointer-sized fields print as sixteen upper-case hex digits, internal ids
//! as eight lower-case hex digits (zero-padded in headers, bare in frames),
//! and instruction pointers after a `:` carry no `0x` prefix.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use crate::{CodeRange, Frame, IlToNativeMapping, InternalId, SampleInfo, StackTraceDiff};

/// A single trace log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    /// `apd crf`
    AppDomainCreated { app_domain_id: u64, process_id: u64, status: u32, name: String },
    /// `asm ldf`
    AssemblyLoaded { assembly_id: u64, app_domain_id: u64, module_id: u64, status: u32, name: String },
    /// `mod ldf`
    ModuleLoaded { module_id: u64, base_address: u64, assembly_id: u64, status: u32, name: String },
    /// `mod ata`
    ModuleAttached { module_id: u64, assembly_id: u64 },
    /// `cls ldf`
    ClassLoaded { class_id: u64, module_id: u64, type_def_token: u32, status: u32 },
    /// `fun cmf`
    JitCompilationFinished {
        function_id: u64,
        function: InternalId,
        class_id: u64,
        module_id: u64,
        token: u32,
        status: u32,
        code: Vec<CodeRange>,
        il_map: Vec<IlToNativeMapping>,
    },
    /// `fun csf`
    CachedFunctionFound {
        function_id: u64,
        function: InternalId,
        class_id: u64,
        module_id: u64,
        token: u32,
        code: Vec<CodeRange>,
        il_map: Vec<IlToNativeMapping>,
    },
    /// `fun nam`
    FunctionName { function: InternalId, class_name: String, name: String },
    /// `thr crt`
    ThreadCreated { thread_id: u64, thread: InternalId },
    /// `thr dst`
    ThreadDestroyed { thread: InternalId },
    /// `thr aos`
    ThreadAssignedToOsThread { thread: InternalId, os_thread_id: u32 },
    /// `str sam`
    StackSample { thread: InternalId, sample: SampleInfo, diff: StackTraceDiff },
}

/// Why a line could not be read back as a [`TraceRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    UnknownRecord,
    MissingField(&'static str),
    InvalidNumber(&'static str),
    InvalidName,
    InvalidFrame,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRecord => f.write_str("unknown record type"),
            Self::MissingField(field) => write!(f, "missing field `{field}`"),
            Self::InvalidNumber(field) => write!(f, "invalid number in field `{field}`"),
            Self::InvalidName => f.write_str("name is not enclosed in double quotes"),
            Self::InvalidFrame => f.write_str("malformed stack frame"),
        }
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Pointer-sized value.
struct Ptr(u64);

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

fn write_function_details(
    f: &mut fmt::Formatter<'_>,
    code: &[CodeRange],
    il_map: &[IlToNativeMapping],
) -> fmt::Result {
    for range in code {
        write!(f, " 0x{}:0x{:x}", Ptr(range.start), range.size)?;
    }
    for entry in il_map {
        write!(f, " 0x{:x}:0x{:x}:0x{:x}", entry.il_offset, entry.native_start, entry.native_end)?;
    }
    Ok(())
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppDomainCreated { app_domain_id, process_id, status, name } => write!(
                f,
                "apd crf 0x{} 0x{} 0x{status:08x} \"{name}\"",
                Ptr(*app_domain_id),
                Ptr(*process_id)
            ),
            Self::AssemblyLoaded { assembly_id, app_domain_id, module_id, status, name } => write!(
                f,
                "asm ldf 0x{} 0x{} 0x{} 0x{status:08x} \"{name}\"",
                Ptr(*assembly_id),
                Ptr(*app_domain_id),
                Ptr(*module_id)
            ),
            Self::ModuleLoaded { module_id, base_address, assembly_id, status, name } => write!(
                f,
                "mod ldf 0x{} 0x{} 0x{} 0x{status:08x} \"{name}\"",
                Ptr(*module_id),
                Ptr(*base_address),
                Ptr(*assembly_id)
            ),
            Self::ModuleAttached { module_id, assembly_id } => {
                write!(f, "mod ata 0x{} 0x{}", Ptr(*module_id), Ptr(*assembly_id))
            }
            Self::ClassLoaded { class_id, module_id, type_def_token, status } => write!(
                f,
                "cls ldf 0x{} 0x{} 0x{type_def_token:08x} 0x{status:08x}",
                Ptr(*class_id),
                Ptr(*module_id)
            ),
            Self::JitCompilationFinished {
                function_id,
                function,
                class_id,
                module_id,
                token,
                status,
                code,
                il_map,
            } => {
                write!(
                    f,
                    "fun cmf 0x{} {function} 0x{} 0x{} 0x{token:08x} 0x{status:08x}",
                    Ptr(*function_id),
                    Ptr(*class_id),
                    Ptr(*module_id)
                )?;
                write_function_details(f, code, il_map)
            }
            Self::CachedFunctionFound { function_id, function, class_id, module_id, token, code, il_map } => {
                write!(
                    f,
                    "fun csf 0x{} {function} 0x{} 0x{} 0x{token:08x}",
                    Ptr(*function_id),
                    Ptr(*class_id),
                    Ptr(*module_id)
                )?;
                write_function_details(f, code, il_map)
            }
            Self::FunctionName { function, class_name, name } => {
                write!(f, "fun nam {function} \"")?;
                if !class_name.is_empty() {
                    write!(f, "{class_name}::")?;
                }
                write!(f, "{name}\"")
            }
            Self::ThreadCreated { thread_id, thread } => {
                write!(f, "thr crt 0x{} {thread}", Ptr(*thread_id))
            }
            Self::ThreadDestroyed { thread } => write!(f, "thr dst {thread}"),
            Self::ThreadAssignedToOsThread { thread, os_thread_id } => {
                write!(f, "thr aos {thread} {os_thread_id}")
            }
            Self::StackSample { thread, sample, diff } => {
                write!(f, "str sam {thread} {}", sample.ticks)?;
                if sample.count > 0 {
                    write!(f, " {}", sample.count)?;
                } else {
                    f.write_str(" ?")?;
                }
                write!(f, " {}:{}", diff.match_prefix, diff.stack_size)?;
                if diff.ip != 0 {
                    write!(f, ":{}", Ptr(diff.ip))?;
                }
                for frame in &diff.frames {
                    write!(f, " 0x{:x}", frame.function.0)?;
                    if frame.ip != 0 {
                        write!(f, ":{}", Ptr(frame.ip))?;
                    }
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn hex_u64(token: Option<&str>, field: &'static str) -> Result<u64, ParseError> {
    let token = token.ok_or(ParseError::MissingField(field))?;
    let digits = token.strip_prefix("0x").unwrap_or(token);
    u64::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidNumber(field))
}

fn hex_u32(token: Option<&str>, field: &'static str) -> Result<u32, ParseError> {
    let value = hex_u64(token, field)?;
    u32::try_from(value).map_err(|_| ParseError::InvalidNumber(field))
}

fn internal_id(token: Option<&str>, field: &'static str) -> Result<InternalId, ParseError> {
    hex_u32(token, field).map(InternalId)
}

fn dec_u32(token: Option<&str>, field: &'static str) -> Result<u32, ParseError> {
    token
        .ok_or(ParseError::MissingField(field))?
        .parse()
        .map_err(|_| ParseError::InvalidNumber(field))
}

/// Splits off `count` space-separated fields and returns the remainder.
fn leading_fields(rest: &str, count: usize) -> Result<(Vec<&str>, &str), ParseError> {
    let mut parts = rest.splitn(count + 1, ' ');
    let fields: Vec<&str> = parts.by_ref().take(count).collect();
    if fields.len() < count {
        return Err(ParseError::MissingField("fields"));
    }
    Ok((fields, parts.next().unwrap_or("")))
}

fn quoted(text: &str) -> Result<String, ParseError> {
    text.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .map(ToString::to_string)
        .ok_or(ParseError::InvalidName)
}

fn function_details<'a>(
    tokens: impl Iterator<Item = &'a str>,
) -> Result<(Vec<CodeRange>, Vec<IlToNativeMapping>), ParseError> {
    let mut code = Vec::new();
    let mut il_map = Vec::new();
    for token in tokens {
        let mut parts = token.split(':');
        let first = parts.next();
        let second = parts.next();
        match parts.next() {
            None => code.push(CodeRange {
                start: hex_u64(first, "code start")?,
                size: hex_u32(second, "code size")?,
            }),
            Some(third) => il_map.push(IlToNativeMapping {
                il_offset: hex_u32(first, "il offset")?,
                native_start: hex_u32(second, "native start")?,
                native_end: hex_u32(Some(third), "native end")?,
            }),
        }
    }
    Ok((code, il_map))
}

fn stack_sample(rest: &str) -> Result<TraceRecord, ParseError> {
    let mut tokens = rest.split(' ');
    let thread = internal_id(tokens.next(), "thread")?;
    let ticks = dec_u32(tokens.next(), "ticks")?;
    let count = match tokens.next() {
        Some("?") => 0,
        token => dec_u32(token, "count")?,
    };

    let header = tokens.next().ok_or(ParseError::MissingField("diff"))?;
    let mut header_parts = header.split(':');
    let match_prefix = dec_u32(header_parts.next(), "prefix")?;
    let stack_size = dec_u32(header_parts.next(), "stack size")?;
    let ip = match header_parts.next() {
        Some(ip) => hex_u64(Some(ip), "diff ip")?,
        None => 0,
    };

    let mut frames = Vec::new();
    for token in tokens {
        let (function, ip) = match token.split_once(':') {
            Some((function, ip)) => (function, hex_u64(Some(ip), "frame ip")?),
            None => (token, 0),
        };
        if !function.starts_with("0x") {
            return Err(ParseError::InvalidFrame);
        }
        frames.push(Frame::new(internal_id(Some(function), "frame")?, ip));
    }

    Ok(TraceRecord::StackSample {
        thread,
        sample: SampleInfo { ticks, count },
        diff: StackTraceDiff { match_prefix, stack_size, ip, frames },
    })
}

impl FromStr for TraceRecord {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end();
        let mut head = line.splitn(3, ' ');
        let subject = head.next().unwrap_or("");
        let action = head.next().ok_or(ParseError::UnknownRecord)?;
        let rest = head.next().unwrap_or("");

        match (subject, action) {
            ("str", "sam") => stack_sample(rest),
            ("thr", "crt") => {
                let mut tokens = rest.split(' ');
                Ok(Self::ThreadCreated {
                    thread_id: hex_u64(tokens.next(), "thread id")?,
                    thread: internal_id(tokens.next(), "thread")?,
                })
            }
            ("thr", "dst") => Ok(Self::ThreadDestroyed { thread: internal_id(Some(rest), "thread")? }),
            ("thr", "aos") => {
                let mut tokens = rest.split(' ');
                Ok(Self::ThreadAssignedToOsThread {
                    thread: internal_id(tokens.next(), "thread")?,
                    os_thread_id: dec_u32(tokens.next(), "os thread id")?,
                })
            }
            ("fun", "nam") => {
                let (fields, remainder) = leading_fields(rest, 1)?;
                let full_name = quoted(remainder)?;
                let (class_name, name) = match full_name.rsplit_once("::") {
                    Some((class_name, name)) => (class_name.to_string(), name.to_string()),
                    None => (String::new(), full_name),
                };
                Ok(Self::FunctionName { function: internal_id(Some(fields[0]), "function")?, class_name, name })
            }
            ("fun", "cmf") => {
                let mut tokens = rest.split(' ');
                let function_id = hex_u64(tokens.next(), "function id")?;
                let function = internal_id(tokens.next(), "function")?;
                let class_id = hex_u64(tokens.next(), "class id")?;
                let module_id = hex_u64(tokens.next(), "module id")?;
                let token = hex_u32(tokens.next(), "token")?;
                let status = hex_u32(tokens.next(), "status")?;
                let (code, il_map) = function_details(tokens)?;
                Ok(Self::JitCompilationFinished {
                    function_id,
                    function,
                    class_id,
                    module_id,
                    token,
                    status,
                    code,
                    il_map,
                })
            }
            ("fun", "csf") => {
                let mut tokens = rest.split(' ');
                let function_id = hex_u64(tokens.next(), "function id")?;
                let function = internal_id(tokens.next(), "function")?;
                let class_id = hex_u64(tokens.next(), "class id")?;
                let module_id = hex_u64(tokens.next(), "module id")?;
                let token = hex_u32(tokens.next(), "token")?;
                let (code, il_map) = function_details(tokens)?;
                Ok(Self::CachedFunctionFound { function_id, function, class_id, module_id, token, code, il_map })
            }
            ("apd", "crf") => {
                let (fields, remainder) = leading_fields(rest, 3)?;
                Ok(Self::AppDomainCreated {
                    app_domain_id: hex_u64(Some(fields[0]), "app domain id")?,
                    process_id: hex_u64(Some(fields[1]), "process id")?,
                    status: hex_u32(Some(fields[2]), "status")?,
                    name: quoted(remainder)?,
                })
            }
            ("asm", "ldf") => {
                let (fields, remainder) = leading_fields(rest, 4)?;
                Ok(Self::AssemblyLoaded {
                    assembly_id: hex_u64(Some(fields[0]), "assembly id")?,
                    app_domain_id: hex_u64(Some(fields[1]), "app domain id")?,
                    module_id: hex_u64(Some(fields[2]), "module id")?,
                    status: hex_u32(Some(fields[3]), "status")?,
                    name: quoted(remainder)?,
                })
            }
            ("mod", "ldf") => {
                let (fields, remainder) = leading_fields(rest, 4)?;
                Ok(Self::ModuleLoaded {
                    module_id: hex_u64(Some(fields[0]), "module id")?,
                    base_address: hex_u64(Some(fields[1]), "base address")?,
                    assembly_id: hex_u64(Some(fields[2]), "assembly id")?,
                    status: hex_u32(Some(fields[3]), "status")?,
                    name: quoted(remainder)?,
                })
            }
            ("mod", "ata") => {
                let mut tokens = rest.split(' ');
                Ok(Self::ModuleAttached {
                    module_id: hex_u64(tokens.next(), "module id")?,
                    assembly_id: hex_u64(tokens.next(), "assembly id")?,
                })
            }
            ("cls", "ldf") => {
                let mut tokens = rest.split(' ');
                Ok(Self::ClassLoaded {
                    class_id: hex_u64(tokens.next(), "class id")?,
                    module_id: hex_u64(tokens.next(), "module id")?,
                    type_def_token: hex_u32(tokens.next(), "type def token")?,
                    status: hex_u32(tokens.next(), "status")?,
                })
            }
            _ => Err(ParseError::UnknownRecord),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample(count: u32, prefix: u32, size: u32, ip: u64, frames: Vec<Frame>) -> TraceRecord {
        TraceRecord::StackSample {
            thread: InternalId(3),
            sample: SampleInfo { ticks: 1520, count },
            diff: StackTraceDiff { match_prefix: prefix, stack_size: size, ip, frames },
        }
    }

    #[test]
    fn test_thread_records_format() {
        let created = TraceRecord::ThreadCreated { thread_id: 0x7f3a_5c00_0b70, thread: InternalId(3) };
        assert_eq!(created.to_string(), "thr crt 0x00007F3A5C000B70 0x00000003");
        assert_eq!(TraceRecord::ThreadDestroyed { thread: InternalId(3) }.to_string(), "thr dst 0x00000003");
        let aos = TraceRecord::ThreadAssignedToOsThread { thread: InternalId(3), os_thread_id: 4711 };
        assert_eq!(aos.to_string(), "thr aos 0x00000003 4711");
    }

    #[test]
    fn test_function_name_omits_empty_class() {
        let named = TraceRecord::FunctionName {
            function: InternalId(7),
            class_name: "App.Worker".to_string(),
            name: "Run".to_string(),
        };
        assert_eq!(named.to_string(), "fun nam 0x00000007 \"App.Worker::Run\"");

        let bare = TraceRecord::FunctionName {
            function: InternalId(0),
            class_name: String::new(),
            name: "UNMANAGED".to_string(),
        };
        assert_eq!(bare.to_string(), "fun nam 0x00000000 \"UNMANAGED\"");
    }

    #[test]
    fn test_stack_sample_format() {
        let record = sample(
            2,
            2,
            3,
            0x7f3a_6123_4ab0,
            vec![Frame::new(InternalId(7), 0), Frame::new(InternalId(9), 0x7f3a_6123_5000)],
        );
        assert_eq!(
            record.to_string(),
            "str sam 0x00000003 1520 2 2:3:00007F3A61234AB0 0x7 0x9:00007F3A61235000"
        );
    }

    #[test]
    fn test_stack_sample_unknown_count_prints_question_mark() {
        let record = sample(0, 0, 0, 0, Vec::new());
        assert_eq!(record.to_string(), "str sam 0x00000003 1520 ? 0:0");
    }

    #[test]
    fn test_jit_record_appends_code_and_il_map() {
        let record = TraceRecord::JitCompilationFinished {
            function_id: 0x10,
            function: InternalId(5),
            class_id: 0x20,
            module_id: 0x30,
            token: 0x0600_0001,
            status: 0,
            code: vec![CodeRange { start: 0x4000, size: 0x80 }],
            il_map: vec![IlToNativeMapping { il_offset: 0, native_start: 0, native_end: 0x10 }],
        };
        assert_eq!(
            record.to_string(),
            "fun cmf 0x0000000000000010 0x00000005 0x0000000000000020 0x0000000000000030 \
             0x06000001 0x00000000 0x0000000000004000:0x80 0x0:0x0:0x10"
        );
    }

    #[test]
    fn test_parse_reads_back_every_record_kind() {
        let lines = [
            "apd crf 0x0000000000000001 0x0000000000000BEE 0x00000000 \"DefaultDomain\"",
            "asm ldf 0x0000000000000002 0x0000000000000001 0x0000000000000003 0x00000000 \"App\"",
            "mod ldf 0x0000000000000003 0x00007F0000000000 0x0000000000000002 0x00000000 \"App.dll\"",
            "mod ata 0x0000000000000003 0x0000000000000002",
            "cls ldf 0x0000000000000004 0x0000000000000003 0x02000002 0x00000000",
            "fun csf 0x0000000000000010 0x00000005 0x0000000000000004 0x0000000000000003 0x06000001",
            "fun nam 0x00000005 \"App.Worker<T>::Run\"",
            "thr crt 0x0000000000001000 0x00000000",
            "thr aos 0x00000000 4711",
            "str sam 0x00000000 15 ? 0:1 0x5",
            "thr dst 0x00000000",
        ];
        for line in lines {
            let record: TraceRecord = line.parse().unwrap();
            assert_eq!(record.to_string(), line);
        }
    }

    #[test]
    fn test_parse_function_name_splits_on_last_separator() {
        let record: TraceRecord = "fun nam 0x00000001 \"Outer.Inner::Call\"".parse().unwrap();
        assert_eq!(
            record,
            TraceRecord::FunctionName {
                function: InternalId(1),
                class_name: "Outer.Inner".to_string(),
                name: "Call".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("foo bar".parse::<TraceRecord>(), Err(ParseError::UnknownRecord));
        assert_eq!("thr dst zz".parse::<TraceRecord>(), Err(ParseError::InvalidNumber("thread")));
        assert_eq!("fun nam 0x00000001 Run".parse::<TraceRecord>(), Err(ParseError::InvalidName));
        assert_eq!("str sam 0x1 10 1 0:1 7".parse::<TraceRecord>(), Err(ParseError::InvalidFrame));
    }
}
