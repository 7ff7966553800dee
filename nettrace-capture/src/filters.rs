//! Capture filter programs
//!
//! A filter is installed once when a capture starts. It is either a libpcap
//! expression (compiled against the capture's link type) or a classic BPF
//! instruction list attached to the capture socket as-is.

use nettrace_core::{Error, Result};
use std::fmt;

/// Maximum number of classic BPF instructions accepted by the kernel
pub const BPF_MAXINSNS: usize = 4096;

/// BPF instruction class of return instructions
const BPF_CLASS_RET: u16 = 0x06;

/// One classic BPF instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInstruction {
    /// Opcode
    pub code: u16,
    /// Jump offset if true
    pub jt: u8,
    /// Jump offset if false
    pub jf: u8,
    /// Immediate operand
    pub k: u32,
}

impl BpfInstruction {
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    fn is_return(&self) -> bool {
        self.code & 0x07 == BPF_CLASS_RET
    }
}

impl fmt::Display for BpfInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.code, self.jt, self.jf, self.k)
    }
}

/// Filter installed on a capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterProgram {
    /// Textual expression compiled by libpcap
    Expression(String),
    /// Pre-compiled instruction list
    Instructions(Vec<BpfInstruction>),
}

impl FilterProgram {
    /// Create an expression filter
    pub fn expression<S: Into<String>>(expr: S) -> Self {
        FilterProgram::Expression(expr.into())
    }

    /// Parse the decimal instruction listing printed by `tcpdump -ddd`
    ///
    /// The first entry is the instruction count, followed by one
    /// `code jt jf k` entry per instruction. Entries are separated by
    /// newlines or commas.
    pub fn parse_instructions(text: &str) -> Result<Self> {
        let mut entries = text
            .split(|c| c == '\n' || c == ',')
            .map(str::trim)
            .filter(|line| !line.is_empty());

        let count: usize = entries
            .next()
            .ok_or_else(|| Error::filter_compile(text, "empty instruction listing"))?
            .parse()
            .map_err(|_| Error::filter_compile(text, "missing instruction count"))?;

        let mut instructions = Vec::with_capacity(count);
        for entry in entries {
            let fields: Vec<&str> = entry.split_whitespace().collect();
            if fields.len() != 4 {
                return Err(Error::filter_compile(
                    text,
                    format!("expected 'code jt jf k', got '{}'", entry),
                ));
            }

            let bad = |_| Error::filter_compile(text, format!("invalid number in '{}'", entry));
            instructions.push(BpfInstruction {
                code: fields[0].parse().map_err(bad)?,
                jt: fields[1].parse().map_err(bad)?,
                jf: fields[2].parse().map_err(bad)?,
                k: fields[3].parse().map_err(bad)?,
            });
        }

        if instructions.len() != count {
            return Err(Error::filter_compile(
                text,
                format!("declared {} instructions, found {}", count, instructions.len()),
            ));
        }

        let program = FilterProgram::Instructions(instructions);
        program.validate()?;
        Ok(program)
    }

    /// Check the program for structural problems before installing it
    pub fn validate(&self) -> Result<()> {
        match self {
            FilterProgram::Expression(expr) => {
                if expr.trim().is_empty() {
                    return Err(Error::filter_compile(expr.as_str(), "empty expression"));
                }
            }
            FilterProgram::Instructions(instructions) => {
                let describe = || self.to_string();
                if instructions.is_empty() {
                    return Err(Error::filter_compile(describe(), "no instructions"));
                }
                if instructions.len() > BPF_MAXINSNS {
                    return Err(Error::filter_compile(
                        describe(),
                        format!("more than {} instructions", BPF_MAXINSNS),
                    ));
                }
                if let Some(last) = instructions.last() {
                    if !last.is_return() {
                        return Err(Error::filter_compile(
                            describe(),
                            "program does not end with a return instruction",
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for FilterProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterProgram::Expression(expr) => f.write_str(expr),
            FilterProgram::Instructions(instructions) => {
                write!(f, "{}", instructions.len())?;
                for insn in instructions {
                    write!(f, ",{}", insn)?;
                }
                Ok(())
            }
        }
    }
}

/// Attach a classic BPF program to a capture socket
#[cfg(target_os = "linux")]
pub(crate) fn attach_instructions(
    fd: std::os::fd::RawFd,
    instructions: &[BpfInstruction],
) -> std::io::Result<()> {
    let mut filters: Vec<libc::sock_filter> = instructions
        .iter()
        .map(|insn| libc::sock_filter {
            code: insn.code,
            jt: insn.jt,
            jf: insn.jf,
            k: insn.k,
        })
        .collect();

    let program = libc::sock_fprog {
        len: filters.len() as libc::c_ushort,
        filter: filters.as_mut_ptr(),
    };

    // SAFETY: `program` points into `filters`, which outlives the call, and
    // the option length matches the struct passed.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &program as *const libc::sock_fprog as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn attach_instructions(
    _fd: std::os::fd::RawFd,
    _instructions: &[BpfInstruction],
) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "raw BPF programs are only supported on Linux",
    ))
}

/// Filter for specific source or destination IP
pub fn host_filter(ip: &str) -> String {
    format!("host {}", ip)
}

/// Filter for a network in CIDR notation
pub fn net_filter(cidr: &str) -> String {
    format!("net {}", cidr)
}

/// Filter for specific TCP port (source or destination)
pub fn tcp_port_filter(port: u16) -> String {
    format!("tcp port {}", port)
}

/// Filter for specific UDP port (source or destination)
pub fn udp_port_filter(port: u16) -> String {
    format!("udp port {}", port)
}

/// Combine multiple filters with AND logic
pub fn combine_filters(filters: &[&str]) -> String {
    join_filters(filters, " and ")
}

/// Combine multiple filters with OR logic
pub fn combine_filters_or(filters: &[&str]) -> String {
    join_filters(filters, " or ")
}

/// Negate a filter
pub fn not_filter(filter: &str) -> String {
    format!("not ({})", filter)
}

fn join_filters(filters: &[&str], op: &str) -> String {
    filters
        .iter()
        .map(|f| format!("({})", f))
        .collect::<Vec<_>>()
        .join(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    // `tcpdump -ddd ip` on an Ethernet interface
    const IP_ONLY: &str = "4\n40 0 0 12\n21 0 1 2048\n6 0 0 262144\n6 0 0 0\n";

    #[test]
    fn test_parse_ddd_listing() {
        let program = FilterProgram::parse_instructions(IP_ONLY).unwrap();
        match program {
            FilterProgram::Instructions(insns) => {
                assert_eq!(insns.len(), 4);
                assert_eq!(insns[0], BpfInstruction::new(40, 0, 0, 12));
                assert_eq!(insns[1], BpfInstruction::new(21, 0, 1, 2048));
                assert_eq!(insns[3], BpfInstruction::new(6, 0, 0, 0));
            }
            other => panic!("unexpected program {:?}", other),
        }
    }

    #[test]
    fn test_parse_comma_listing() {
        let program = FilterProgram::parse_instructions("2,6 0 0 65535,6 0 0 0").unwrap();
        assert_eq!(program.to_string(), "2,6 0 0 65535,6 0 0 0");
    }

    #[test]
    fn test_parse_count_mismatch() {
        let err = FilterProgram::parse_instructions("3\n6 0 0 0\n").unwrap_err();
        assert!(matches!(err, Error::FilterCompileFailed { .. }));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(FilterProgram::parse_instructions("").is_err());
        assert!(FilterProgram::parse_instructions("1\n6 0 zero 0").is_err());
        assert!(FilterProgram::parse_instructions("1\n6 0 0").is_err());
    }

    #[test]
    fn test_validate_requires_return() {
        let program = FilterProgram::Instructions(vec![BpfInstruction::new(40, 0, 0, 12)]);
        assert!(program.validate().is_err());

        let program = FilterProgram::Instructions(vec![BpfInstruction::new(6, 0, 0, 0)]);
        assert!(program.validate().is_ok());

        assert!(FilterProgram::Instructions(vec![]).validate().is_err());
        assert!(FilterProgram::expression("  ").validate().is_err());
        assert!(FilterProgram::expression("arp").validate().is_ok());
    }

    #[test]
    fn test_expression_helpers() {
        assert_eq!(host_filter("10.0.0.1"), "host 10.0.0.1");
        assert_eq!(net_filter("10.0.0.0/24"), "net 10.0.0.0/24");
        assert_eq!(tcp_port_filter(80), "tcp port 80");
        assert_eq!(udp_port_filter(53), "udp port 53");
        assert_eq!(not_filter("port 22"), "not (port 22)");
    }

    #[test]
    fn test_combine_filters() {
        let web = combine_filters_or(&[&tcp_port_filter(80), &tcp_port_filter(443)]);
        assert_eq!(web, "(tcp port 80) or (tcp port 443)");

        let scoped = combine_filters(&[&web, &host_filter("10.0.0.2")]);
        assert_eq!(scoped, "((tcp port 80) or (tcp port 443)) and (host 10.0.0.2)");

        assert_eq!(combine_filters(&[]), "");
    }
}
